//! Pull-decoder for CRU page streams: per-link caching with RDH
//! resynchronisation, trigger assembly, GBT demultiplexing into cable
//! streams and ALPIDE decoding into per-chip pixel records.
#![allow(non_camel_case_types)]

use crate::alpide::{AlpideCoder, ChipDecode};
use crate::buffer::PayloadBuffer;
use crate::mapping::{ChipMapping, RuType};
use crate::pixel::{trigger, ChipPixelData, InteractionRecord};
use crate::ru::{RuDecodeData, RuLink, RuSlab};
use crate::stats::{RawDecodingStats, RuDecodingError, RuDecodingStats};
use crate::words::gbt::{self, GbtDataHeader, GbtDataTrailer, GBT_WORD_LEN};
use crate::words::rdh::{Rdh, RDH_SIZE_BYTES};
use crate::{CodecConfig, CRU_PAGES_PER_SUPERPAGE, MAX_CABLES_PER_RU, MAX_CHIPS_PER_RU,
    MAX_LINKS_PER_RU, MAX_PAGE_BYTES};
use byteorder::{ByteOrder, LittleEndian};
use sm::sm;
use std::io::Read;

/// Keep at least this many unconsumed bytes uploaded.
const RAW_BUFFER_MARGIN: usize = 5_000_000;
/// Allocation of the raw-stream buffer.
const RAW_BUFFER_SIZE: usize = 10_000_000 + 2 * RAW_BUFFER_MARGIN;
const _: () = assert!(RAW_BUFFER_MARGIN > MAX_PAGE_BYTES * 100);
const _: () = assert!(RAW_BUFFER_SIZE > 3 * RAW_BUFFER_MARGIN);

sm! {
    // States have a '_' suffix and events a '_' prefix so they show up as
    // `STATE_BY_EVENT` in the generated code
    Readout_Phases {
        InitialStates { Fetch_ }

        _TriggerDecoded {
            Fetch_ => Serve_
        }

        _Drained {
            Serve_ => Fetch_
        }
    }
}

/// Pull-decoder over a byte stream of CRU pages.
///
/// [`next_chip_data`](Self::next_chip_data) alternates between two phases:
/// a cache phase routing pages from the raw stream into per-link buffers
/// until every active link holds enough triggers, and a serve phase handing
/// out the chips of the decoded trigger one by one.
pub struct RawPixelDecoder<M: ChipMapping, R: Read> {
    map: M,
    source: Option<R>,
    raw_buffer: PayloadBuffer,
    rus: RuSlab,
    coder: AlpideCoder,
    stats: RawDecodingStats,
    interaction: InteractionRecord,
    interaction_hb: InteractionRecord,
    trigger_type: u32,
    cur_slot: usize,
    n_links: usize,
    min_triggers_to_cache: usize,
    min_triggers_cached: usize,
    gbt_word_size: usize,
    verbose: u8,
    phase: Readout_Phases::Variant,
}

impl<M: ChipMapping, R: Read> RawPixelDecoder<M, R> {
    /// Creates a decoder over the given mapping; the word size and cache
    /// depth are frozen from `config`.
    pub fn new(map: M, config: &CodecConfig) -> Self {
        let n_rus = map.n_rus();
        Self {
            rus: RuSlab::new(n_rus),
            map,
            source: None,
            raw_buffer: PayloadBuffer::new(),
            coder: AlpideCoder::new(),
            stats: RawDecodingStats::default(),
            interaction: InteractionRecord::default(),
            interaction_hb: InteractionRecord::default(),
            trigger_type: 0,
            cur_slot: 0,
            n_links: 0,
            min_triggers_to_cache: config
                .min_triggers_to_cache
                .max(CRU_PAGES_PER_SUPERPAGE + 1),
            min_triggers_cached: 0,
            gbt_word_size: gbt::gbt_word_size(config.padding_128),
            verbose: config.verbose,
            phase: Readout_Phases::Machine::new(Readout_Phases::Fetch_).as_enum(),
        }
    }

    /// Attaches a byte source and resets all decoding state.
    pub fn open(&mut self, source: R) {
        self.clear();
        self.raw_buffer.expand(RAW_BUFFER_SIZE);
        self.source = Some(source);
    }

    /// Drops the source and every per-RU buffer and counter.
    pub fn clear(&mut self) {
        self.source = None;
        self.raw_buffer.clear();
        self.rus = RuSlab::new(self.map.n_rus());
        self.stats.clear();
        self.cur_slot = 0;
        self.n_links = 0;
        self.min_triggers_cached = 0;
        self.trigger_type = 0;
        self.interaction = InteractionRecord::default();
        self.interaction_hb = InteractionRecord::default();
        self.phase = Readout_Phases::Machine::new(Readout_Phases::Fetch_).as_enum();
    }

    /// The mapping in use.
    pub fn mapping(&self) -> &M {
        &self.map
    }

    /// Global decoding statistics.
    pub fn decoding_stats(&self) -> &RawDecodingStats {
        &self.stats
    }

    /// Decoding statistics of the RU with the given software ID, if it was
    /// sighted in the stream.
    pub fn ru_decoding_stats_sw(&self, ru_sw: u16) -> Option<&RuDecodingStats> {
        self.rus.slot(ru_sw).map(|slot| &self.rus.rus[slot].stats)
    }

    /// Decoding statistics of the RU carrying the given FEE ID.
    pub fn ru_decoding_stats_hw(&self, fee_id: u16) -> Option<&RuDecodingStats> {
        self.ru_decoding_stats_sw(self.map.fee_id_to_ru_sw(fee_id)?)
    }

    /// Decode state of the RU with the given software ID.
    pub fn ru_decode(&self, ru_sw: u16) -> Option<&RuDecodeData> {
        self.rus.slot(ru_sw).map(|slot| &self.rus.rus[slot])
    }

    /// Number of RUs sighted in the stream.
    pub fn n_rus(&self) -> usize {
        self.rus.len()
    }

    /// Number of links sighted in the stream.
    pub fn n_links(&self) -> usize {
        self.n_links
    }

    /// The GBT word size in bytes, 10 or 16 depending on the padding mode.
    pub fn gbt_word_size(&self) -> usize {
        self.gbt_word_size
    }

    /// Whether GBT words are interpreted as padded to 128 bits.
    pub fn is_padding_128(&self) -> bool {
        self.gbt_word_size == gbt::GBT_PADDED_WORD_LEN
    }

    /// Interaction record of the trigger currently being decoded.
    pub fn interaction_record(&self) -> InteractionRecord {
        self.interaction
    }

    /// Heartbeat interaction record of the trigger currently being decoded.
    pub fn interaction_record_hb(&self) -> InteractionRecord {
        self.interaction_hb
    }

    /// Trigger-type bits of the trigger currently being decoded.
    pub fn trigger(&self) -> u32 {
        self.trigger_type
    }

    /// Cache target, in triggers per link.
    pub fn min_triggers_to_cache(&self) -> usize {
        self.min_triggers_to_cache
    }

    /// Sets the cache target, clamped to one more than
    /// [`CRU_PAGES_PER_SUPERPAGE`].
    pub fn set_min_triggers_to_cache(&mut self, n: usize) {
        self.min_triggers_to_cache = n.max(CRU_PAGES_PER_SUPERPAGE + 1);
    }

    /// Pulls the next decoded chip, or `None` when the stream is exhausted.
    ///
    /// Chips are produced in stream-trigger order, and within a trigger in
    /// the RU's cable-then-chip order.
    pub fn next_chip_data(&mut self) -> Option<ChipPixelData> {
        use Readout_Phases as event;
        use Readout_Phases::Variant as state;

        loop {
            let current_phase = self.phase.clone();
            match current_phase {
                state::InitialFetch_(stm) => {
                    if !self.fetch_trigger() {
                        return None;
                    }
                    self.phase = stm.transition(event::_TriggerDecoded).as_enum();
                }
                state::Fetch_By_Drained(stm) => {
                    if !self.fetch_trigger() {
                        return None;
                    }
                    self.phase = stm.transition(event::_TriggerDecoded).as_enum();
                }
                state::Serve_By_TriggerDecoded(stm) => match self.take_buffered_chip() {
                    Some(chip) => return Some(chip),
                    None => self.phase = stm.transition(event::_Drained).as_enum(),
                },
            }
        }
    }

    /// Serves the next buffered chip of the current trigger, scanning RU
    /// slots in sighting order.
    fn take_buffered_chip(&mut self) -> Option<ChipPixelData> {
        while self.cur_slot < self.rus.rus.len() {
            let ru = &mut self.rus.rus[self.cur_slot];
            if ru.last_chip_checked < ru.n_chips_fired {
                let chip = std::mem::take(&mut ru.chips_data[ru.last_chip_checked]);
                ru.last_chip_checked += 1;
                return Some(chip);
            }
            self.cur_slot += 1;
        }
        None
    }

    /// Tops up the cache if needed and decodes one more trigger. False when
    /// the stream is exhausted.
    fn fetch_trigger(&mut self) -> bool {
        if self.min_triggers_cached < 2 {
            // the last cached trigger might be incomplete
            self.cache_links_data();
        }
        self.min_triggers_cached >= 1 && self.decode_next_trigger() > 0
    }

    /// Pulls from the source when the unconsumed bytes drop below the raw
    /// buffer margin, compacting the consumed head first. Returns the number
    /// of bytes read.
    fn load_input(&mut self) -> usize {
        let Some(source) = self.source.as_mut() else {
            return 0;
        };
        if self.raw_buffer.unused_size() > RAW_BUFFER_MARGIN {
            return 0;
        }
        self.raw_buffer.move_unused_to_head();
        match self.raw_buffer.append(source) {
            Ok(n) => n,
            Err(e) => {
                log::error!("raw input read failed: {e}");
                self.source = None;
                0
            }
        }
    }

    /// Cache phase: distributes pages from the raw stream among the link
    /// buffers until every known link holds the cache target of triggers or
    /// the input dries up.
    fn cache_links_data(&mut self) {
        log::debug!(
            "caching links data, currently cached: {n} triggers",
            n = self.min_triggers_cached
        );
        let _ = self.load_input();
        if self.raw_buffer.is_empty() {
            return;
        }

        // per-(RU, link) flag that the cache target was reached
        let mut enough = vec![[false; MAX_LINKS_PER_RU]; self.map.n_rus()];
        let mut n_links_enough = 0usize;

        loop {
            if self.raw_buffer.unused_size() < RDH_SIZE_BYTES {
                if self.load_input() == 0 && self.raw_buffer.unused_size() < RDH_SIZE_BYTES {
                    break;
                }
                continue;
            }
            if !Rdh::peek_heuristic(self.raw_buffer.unused()) {
                if self.find_next_rdh() {
                    continue;
                }
                break;
            }
            let rdh = Rdh::from_buf(self.raw_buffer.unused()).expect("length checked above");
            if self.verbose > 1 {
                log::debug!("caching page: {rdh}");
            }

            let routed = self.route_page(&rdh, &mut enough, &mut n_links_enough);
            match routed {
                PageRouting::Routed => (),
                PageRouting::Resync => {
                    if self.find_next_rdh() {
                        continue;
                    }
                    break;
                }
                PageRouting::Starved => break,
            }

            // advance by the original offset; a zero offset means the page
            // is the last one in memory and spans its memory size
            let advance = if rdh.offset_to_next == 0 {
                rdh.memory_size as usize
            } else {
                rdh.offset_to_next as usize
            };
            self.raw_buffer
                .advance(advance.min(self.raw_buffer.unused_size()));
            if self.raw_buffer.unused_size() < MAX_PAGE_BYTES {
                let _ = self.load_input();
            }
            if self.n_links > 0 && self.n_links == n_links_enough {
                break;
            }
            if self.raw_buffer.is_empty() && self.source.is_none() {
                break;
            }
            if self.raw_buffer.is_empty() {
                if self.load_input() == 0 {
                    break;
                }
            }
        }

        if self.n_links > 0 && self.n_links == n_links_enough {
            self.min_triggers_cached = self.min_triggers_to_cache;
        } else {
            self.min_triggers_cached = self
                .rus
                .rus
                .iter()
                .flat_map(|ru| ru.links.iter().flatten())
                .map(|link| link.n_triggers.max(0) as usize)
                .min()
                .unwrap_or(0);
        }
        log::debug!(
            "cached at least {n} triggers on {links} links of {rus} RUs",
            n = self.min_triggers_cached,
            links = self.n_links,
            rus = self.rus.len()
        );
    }

    /// Routes the page under the cursor to its (RU, link) buffer, rewriting
    /// the stored offset so cached pages are contiguous.
    fn route_page(
        &mut self,
        rdh: &Rdh,
        enough: &mut [[bool; MAX_LINKS_PER_RU]],
        n_links_enough: &mut usize,
    ) -> PageRouting {
        let fee_id = rdh.fee_id;
        let offset = rdh.offset_to_next;
        let Some(ru_sw) = self.map.fee_id_to_ru_sw(fee_id) else {
            log::error!("RDH FEE ID {fee_id:#06X} unknown to the mapping, scanning for next RDH");
            return PageRouting::Resync;
        };
        let Some(slot) = self.rus.get_or_create(ru_sw, &self.map) else {
            log::error!("RU {ru_sw} unknown to the mapping, scanning for next RDH");
            return PageRouting::Resync;
        };
        let mem_size = rdh.memory_size as usize;
        if !(RDH_SIZE_BYTES..=MAX_PAGE_BYTES).contains(&mem_size)
            || (offset != 0 && (offset as usize) < mem_size)
        {
            log::error!(
                "RDH of FEE#{fee_id:#06X} has implausible sizes (memory {mem_size}, offset {offset}), scanning for next RDH"
            );
            return PageRouting::Resync;
        }
        if rdh.link_id as usize >= MAX_LINKS_PER_RU {
            log::error!(
                "RDH of FEE#{fee_id:#06X} addresses link {link}, scanning for next RDH",
                link = rdh.link_id
            );
            return PageRouting::Resync;
        }
        if self.raw_buffer.unused_size() < mem_size {
            // truncated page: try once to pull the missing tail
            if self.load_input() == 0 && self.raw_buffer.unused_size() < mem_size {
                log::warn!("truncated page at the end of the stream dropped");
                return PageRouting::Starved;
            }
        }

        let ru = &mut self.rus.rus[slot];
        let link_id = rdh.link_id as usize;
        let mut new_trigger = true;
        if let Some(link) = ru.links[link_id].as_ref() {
            if link.last_page_size > 0 {
                let prev_start = link.data.size() - link.last_page_size;
                let prev = Rdh::from_buf(&link.data.as_slice()[prev_start..])
                    .expect("stored pages hold a full RDH");
                if prev.is_same_ru_and_trigger(rdh) {
                    new_trigger = false;
                }
            }
        } else {
            ru.links[link_id] = Some(RuLink::default());
            self.n_links += 1;
        }
        let link = ru.links[link_id].as_mut().expect("slot filled above");
        link.data.add_bytes(&self.raw_buffer.unused()[..mem_size]);
        link.last_page_size = mem_size;
        // cached pages are stored back to back, so the stored offset must
        // equal the page's memory size
        let stored = link.data.size() - mem_size;
        LittleEndian::write_u16(
            &mut link.data.as_mut_slice()[stored + 8..stored + 10],
            rdh.memory_size,
        );

        if new_trigger {
            link.n_triggers += 1;
            if link.n_triggers as usize >= self.min_triggers_to_cache
                && !enough[ru_sw as usize][link_id]
            {
                enough[ru_sw as usize][link_id] = true;
                *n_links_enough += 1;
            }
        }
        self.stats.n_pages_processed += 1;
        self.stats.n_bytes_processed += mem_size as u64;
        PageRouting::Routed
    }

    /// Resync scan: advances one GBT word at a time until a plausible RDH
    /// appears. Reports the size of the skip.
    fn find_next_rdh(&mut self) -> bool {
        let mut scanned = 0usize;
        let good = loop {
            if self.raw_buffer.unused_size() < self.gbt_word_size
                && self.load_input() == 0
                && self.raw_buffer.unused_size() < self.gbt_word_size
            {
                self.raw_buffer.advance(self.raw_buffer.unused_size());
                break false;
            }
            self.raw_buffer
                .advance(self.gbt_word_size.min(self.raw_buffer.unused_size()));
            scanned += 1;
            if self.raw_buffer.unused_size() < RDH_SIZE_BYTES {
                let _ = self.load_input();
            }
            if Rdh::peek_heuristic(self.raw_buffer.unused()) {
                break true;
            }
        };
        log::info!(
            "resync scan skipped {scanned} GBT words, RDH is{found} found",
            found = if good { "" } else { " not" }
        );
        good
    }

    /// Decodes one trigger from the cached link data of every RU and
    /// decrements the cached-trigger floor. Returns the number of links
    /// decoded.
    fn decode_next_trigger(&mut self) -> usize {
        if self.min_triggers_cached < 1 {
            return 0;
        }
        let mut n_links_decoded = 0;
        for slot in 0..self.rus.rus.len() {
            n_links_decoded += self.decode_next_ru_data(slot);
            self.stats.n_rus_processed += 1;
        }
        self.cur_slot = 0;
        self.min_triggers_cached -= 1;
        n_links_decoded
    }

    /// Processes the current trigger of a single RU: walks the pages of
    /// every link, reassembles the cable streams and decodes them.
    fn decode_next_ru_data(&mut self, slot: usize) -> usize {
        // the trigger identity comes from the first link with data
        let mut found = false;
        for link in self.rus.rus[slot].links.iter().flatten() {
            if !link.data.is_empty() {
                let rdh = Rdh::from_buf(link.data.unused())
                    .expect("cached link data starts with a full page");
                self.interaction = InteractionRecord {
                    orbit: rdh.trigger_orbit,
                    bc: rdh.trigger_bc & 0xFFF,
                };
                self.interaction_hb = InteractionRecord {
                    orbit: rdh.heartbeat_orbit,
                    bc: rdh.heartbeat_bc & 0xFFF,
                };
                self.trigger_type = rdh.trigger_type;
                found = true;
                break;
            }
        }
        if !found {
            return 0;
        }

        self.rus.rus[slot].clear_trigger();
        let mut n_links_decoded = 0;
        for il in 0..MAX_LINKS_PER_RU {
            let has_data = self.rus.rus[slot].links[il]
                .as_ref()
                .is_some_and(|link| !link.data.is_empty());
            if !has_data {
                continue;
            }
            self.decode_ru_data(slot, il);
            let link = self.rus.rus[slot].links[il]
                .as_mut()
                .expect("present per has_data");
            link.n_triggers -= 1;
            n_links_decoded += 1;
            if link.data.is_empty() {
                link.data.clear();
            }
        }
        if self.rus.rus[slot].n_cables > 0 {
            self.decode_alpide_data(slot);
        }
        n_links_decoded
    }

    /// Walks the pages of one link belonging to the current trigger,
    /// splitting GBT payload words into the per-cable buffers and enforcing
    /// the page-level protocol.
    fn decode_ru_data(&mut self, slot: usize, il: usize) {
        let word_size = self.gbt_word_size;
        let mut link = self.rus.rus[slot].links[il].take().expect("checked by caller");
        {
            let ru = &mut self.rus.rus[slot];
            ru.n_cables = ru.ru_info.n_cables as usize;
            ru.stats.n_packets += 1;
        }

        let mut prev: Option<Rdh> = None;
        let mut last_trailer: Option<GbtDataTrailer> = None;
        loop {
            if link.data.unused_size() < RDH_SIZE_BYTES {
                if let Some(p) = &prev {
                    self.end_of_trigger_checks(slot, p, last_trailer.as_ref());
                }
                break;
            }
            if !Rdh::peek_heuristic(link.data.unused()) {
                log::error!("cached page does not start with a plausible RDH");
                link.data
                    .advance(word_size.min(link.data.unused_size()));
                break;
            }
            let rdh = Rdh::from_buf(link.data.unused()).expect("length checked above");
            if self.verbose > 0 {
                log::debug!("decoding page: {rdh}");
            }
            let fee_id = rdh.fee_id;
            let page_cnt = rdh.page_cnt;
            match &prev {
                Some(p) => {
                    let prev_cnt = p.page_cnt;
                    if page_cnt != prev_cnt.wrapping_add(1) {
                        log::error!(
                            "FEE#{fee_id:#06X} discontinuity in the RDH page counter of the same RU trigger: old {prev_cnt} new {page_cnt}"
                        );
                        self.rus.rus[slot]
                            .stats
                            .count(RuDecodingError::PageCounterDiscontinuity);
                    }
                }
                None => {
                    let expected = self.rus.rus[slot].ru_info.id_sw;
                    if self.map.fee_id_to_ru_sw(fee_id) != Some(expected) {
                        log::error!(
                            "page of FEE#{fee_id:#06X} differs from the expected RU {expected}"
                        );
                    }
                }
            }

            let page_start = link.data.cursor();
            let mem_size = (rdh.memory_size as usize).min(link.data.unused_size());
            let page_end = page_start + mem_size;
            self.walk_page_body(slot, &link, &rdh, page_start, page_end, &mut last_trailer);
            link.data.set_cursor(page_end);

            // does the next cached page continue this trigger?
            let next_same = rdh.offset_to_next != 0
                && link.data.unused_size() >= RDH_SIZE_BYTES
                && rdh.is_same_ru_and_trigger(
                    &Rdh::from_buf(link.data.unused()).expect("length checked"),
                );
            if !next_same {
                self.end_of_trigger_checks(slot, &rdh, last_trailer.as_ref());
                break;
            }
            prev = Some(rdh);
        }

        self.rus.rus[slot].links[il] = Some(link);
    }

    /// Parses the payload of one page (GBT header, payload words, trailer)
    /// between `page_start` and `page_end` of the link buffer, feeding the
    /// cable buffers of the RU. Structural violations abort the page only.
    fn walk_page_body(
        &mut self,
        slot: usize,
        link: &RuLink,
        rdh: &Rdh,
        page_start: usize,
        page_end: usize,
        last_trailer: &mut Option<GbtDataTrailer>,
    ) {
        let word_size = self.gbt_word_size;
        let fee_id = rdh.fee_id;
        let page_cnt = rdh.page_cnt;
        let ru = &mut self.rus.rus[slot];
        let data = link.data.as_slice();
        let mut pos = page_start + RDH_SIZE_BYTES;

        if page_end.saturating_sub(pos) < word_size || !gbt::is_data_header(&data[pos..]) {
            log::error!("FEE#{fee_id:#06X} GBT payload header was expected, abort page decoding");
            ru.stats.count(RuDecodingError::MissingGbtHeader);
            return;
        }
        let gbt_header = GbtDataHeader::from_buf(&data[pos..]);
        if gbt_header.packet_id != page_cnt {
            log::error!(
                "FEE#{fee_id:#06X} GBT header packet ID {packet} and RDH page counter {page_cnt} differ",
                packet = gbt_header.packet_id
            );
            ru.stats.count(RuDecodingError::RdhVsGbtPageCnt);
        }
        if ru.stats.lanes_active == ru.stats.lanes_stop && page_cnt != 0 {
            // all lanes received their stop, a new page 0 was expected
            log::error!(
                "FEE#{fee_id:#06X} non-zero page counter ({page_cnt}) while all lanes were stopped"
            );
            ru.stats.count(RuDecodingError::NonZeroPageAfterStop);
        }
        ru.stats.lanes_active = gbt_header.lanes;
        if page_cnt == 0 {
            ru.stats.lanes_stop = 0;
            ru.stats.lanes_with_data = 0;
        }
        pos += word_size;

        // the word count from the memory size is advisory; a trailer showing
        // up early terminates the body
        let n_words_estimate = ((page_end - page_start).saturating_sub(RDH_SIZE_BYTES)
            / word_size)
            .saturating_sub(2);
        let mut trailer_pos = None;
        for _ in 0..n_words_estimate {
            if page_end.saturating_sub(pos) < word_size {
                break;
            }
            let word = &data[pos..pos + word_size];
            if gbt::is_data_trailer(word) {
                trailer_pos = Some(pos);
                break;
            }
            let cable_hw = gbt::cable_id(word);
            let cable_sw = self.map.cable_hw_to_sw(ru.ru_info.ru_type, cable_hw) as usize;
            if cable_sw >= MAX_CABLES_PER_RU {
                log::error!(
                    "FEE#{fee_id:#06X} payload word addresses cable {cable_sw}, word dropped"
                );
                pos += word_size;
                continue;
            }
            ru.cable_data[cable_sw].add_bytes(gbt::payload(word));
            ru.cable_hw_id[cable_sw] = cable_hw;
            ru.stats.lanes_with_data |= 1 << cable_sw;
            if ru.stats.lanes_stop & (1 << cable_sw) != 0 {
                log::error!(
                    "FEE#{fee_id:#06X} data received for stopped lane {cable_hw} (sw: {cable_sw})"
                );
                ru.stats.count(RuDecodingError::DataForStoppedLane);
            }
            pos += word_size;
        }

        let trailer_at = trailer_pos.unwrap_or(pos);
        if page_end.saturating_sub(trailer_at) < word_size
            || !gbt::is_data_trailer(&data[trailer_at..])
        {
            log::error!("FEE#{fee_id:#06X} GBT payload trailer was expected, abort page decoding");
            ru.stats.count(RuDecodingError::MissingGbtTrailer);
            return;
        }
        let gbt_trailer = GbtDataTrailer::from_buf(&data[trailer_at..]);
        ru.stats.lanes_timeout |= gbt_trailer.lanes_timeout;
        ru.stats.lanes_stop |= gbt_trailer.lanes_stop;
        *last_trailer = Some(gbt_trailer);
    }

    /// Validates the lane bookkeeping once the last page of an RU's trigger
    /// was walked, and accounts the packet state of its closing trailer.
    fn end_of_trigger_checks(
        &mut self,
        slot: usize,
        rdh: &Rdh,
        last_trailer: Option<&GbtDataTrailer>,
    ) {
        let fee_id = rdh.fee_id;
        let ru = &mut self.rus.rus[slot];
        if ru.stats.lanes_active != ru.stats.lanes_stop && rdh.trigger_type != trigger::SOT {
            // only a start-of-timeframe trigger permits unstopped lanes
            log::error!("FEE#{fee_id:#06X} end of FEE data but not all lanes received stop");
            ru.stats.count(RuDecodingError::UnstoppedLanes);
        }
        if (!ru.stats.lanes_with_data & ru.stats.lanes_active) != ru.stats.lanes_timeout {
            log::error!("FEE#{fee_id:#06X} lanes not in time-out but without data");
            ru.stats.count(RuDecodingError::NoDataForActiveLane);
        }
        if let Some(trailer) = last_trailer {
            ru.stats.packet_states[trailer.state_index()] += 1;
        }
    }

    /// Runs the ALPIDE decoder over every populated cable of the RU and
    /// fills its chip buffer for the serve phase.
    fn decode_alpide_data(&mut self, slot: usize) {
        let ru = &mut self.rus.rus[slot];
        ru.chips_data.clear();
        ru.n_chips_fired = 0;
        ru.last_chip_checked = 0;
        for icab in 0..ru.n_cables {
            if let Some(head) = ru.cable_data[icab].current() {
                if !AlpideCoder::is_chip_header_or_empty(head) {
                    log::error!(
                        "FEE#{hw:#06X} cable {icab} data does not start with ChipHeader or ChipEmpty",
                        hw = ru.ru_info.id_hw
                    );
                    ru.stats.count(RuDecodingError::CableDataHeadWrong);
                }
            }
            'cable: loop {
                let mut chip = ChipPixelData::default();
                match self.coder.decode_chip(&mut chip, &mut ru.cable_data[icab]) {
                    ChipDecode::EndOfStream => break 'cable,
                    ChipDecode::Empty => {
                        // empty chips are not registered
                    }
                    ChipDecode::Chip(n_pixels) => {
                        if ru.ru_info.ru_type == RuType::Ib && chip.chip_id() as usize != icab {
                            // on IB staves the cable index is the on-module chip ID
                            log::error!(
                                "FEE#{hw:#06X} IB cable {icab} shipped chip ID {id}",
                                hw = ru.ru_info.id_hw,
                                id = chip.chip_id()
                            );
                            ru.stats.count(RuDecodingError::IbChipLaneMismatch);
                        }
                        self.stats.n_non_empty_chips += 1;
                        self.stats.n_hits_decoded += n_pixels as u64;
                        Self::register_chip(
                            &self.map,
                            ru,
                            icab,
                            chip,
                            self.interaction,
                            self.trigger_type,
                        );
                        if ru.n_chips_fired >= MAX_CHIPS_PER_RU {
                            log::warn!(
                                "FEE#{hw:#06X} chip capacity reached, rest of cable {icab} dropped",
                                hw = ru.ru_info.id_hw
                            );
                            break 'cable;
                        }
                    }
                    ChipDecode::Error => {
                        // register the hole so downstream observes it
                        Self::register_chip(
                            &self.map,
                            ru,
                            icab,
                            chip,
                            self.interaction,
                            self.trigger_type,
                        );
                        if ru.n_chips_fired >= MAX_CHIPS_PER_RU {
                            break 'cable;
                        }
                    }
                }
            }
        }
    }

    /// Remaps a decoded chip to its global ID, stamps the trigger identity
    /// and stores it for serving.
    fn register_chip(
        map: &M,
        ru: &mut RuDecodeData,
        icab: usize,
        mut chip: ChipPixelData,
        interaction: InteractionRecord,
        trigger_type: u32,
    ) {
        let global = map.global_chip_id(chip.chip_id() as u8, ru.cable_hw_id[icab], &ru.ru_info);
        chip.set_chip_id(global);
        chip.set_interaction(interaction);
        chip.set_trigger(trigger_type);
        ru.chips_data.push(chip);
        ru.n_chips_fired += 1;
    }

    /// Skims one RU-trigger's pages from the raw stream into `out`,
    /// rewriting 128-bit-padded GBT words to bare 80-bit words and adjusting
    /// the page sizes accordingly. On an abortive error the output is
    /// truncated to its size at entry and the cursor is recovered at the
    /// next plausible RDH. Returns whether progress was made.
    pub fn skim_next_ru_data(&mut self, out: &mut PayloadBuffer) -> bool {
        let _ = self.load_input();
        if self.raw_buffer.is_empty() {
            return false;
        }
        if self.skim_ru_data(out) {
            // aborted; recover at the next plausible RDH
            if !self.find_next_rdh() {
                self.raw_buffer.clear();
                return false;
            }
        } else if self.raw_buffer.is_empty() {
            self.raw_buffer.clear();
        }
        true
    }

    /// Page walk of the skim variant: same protocol checks as
    /// [`decode_ru_data`](Self::decode_ru_data), but pages are rewritten to
    /// the output instead of being demultiplexed. Returns true when aborted.
    fn skim_ru_data(&mut self, out: &mut PayloadBuffer) -> bool {
        let in_ws = self.gbt_word_size;
        if self.raw_buffer.unused_size() < RDH_SIZE_BYTES
            || !Rdh::peek_heuristic(self.raw_buffer.unused())
        {
            log::error!("page does not start with a plausible RDH");
            return true;
        }
        let first_rdh = Rdh::from_buf(self.raw_buffer.unused()).expect("length checked above");
        let first_fee = first_rdh.fee_id;
        let Some(ru_sw) = self.map.fee_id_to_ru_sw(first_fee) else {
            log::error!("RDH FEE ID {first_fee:#06X} unknown to the mapping");
            return true;
        };
        let Some(slot) = self.rus.get_or_create(ru_sw, &self.map) else {
            log::error!("RU {ru_sw} unknown to the mapping");
            return true;
        };
        self.interaction = InteractionRecord {
            orbit: first_rdh.trigger_orbit,
            bc: first_rdh.trigger_bc & 0xFFF,
        };
        self.interaction_hb = InteractionRecord {
            orbit: first_rdh.heartbeat_orbit,
            bc: first_rdh.heartbeat_bc & 0xFFF,
        };
        self.trigger_type = first_rdh.trigger_type;
        self.rus.rus[slot].stats.n_packets += 1;
        self.stats.n_rus_processed += 1;

        let size_at_entry = out.size();
        let mut prev: Option<Rdh> = None;
        let mut last_trailer: Option<GbtDataTrailer> = None;
        loop {
            if self.raw_buffer.unused_size() < RDH_SIZE_BYTES {
                if let Some(p) = &prev {
                    self.end_of_trigger_checks(slot, p, last_trailer.as_ref());
                }
                break;
            }
            let rdh = Rdh::from_buf(self.raw_buffer.unused()).expect("length checked above");
            let fee_id = rdh.fee_id;
            let page_cnt = rdh.page_cnt;
            if let Some(p) = &prev {
                let prev_cnt = p.page_cnt;
                if page_cnt != prev_cnt.wrapping_add(1) {
                    log::error!(
                        "FEE#{fee_id:#06X} discontinuity in the RDH page counter of the same RU trigger: old {prev_cnt} new {page_cnt}"
                    );
                    self.rus.rus[slot]
                        .stats
                        .count(RuDecodingError::PageCounterDiscontinuity);
                }
            }
            self.stats.n_pages_processed += 1;
            self.stats.n_bytes_processed += u64::from(rdh.memory_size);

            let page_start = self.raw_buffer.cursor();
            let mem_size = (rdh.memory_size as usize).min(self.raw_buffer.unused_size());
            let page_end = page_start + mem_size;
            let mut pos = page_start + RDH_SIZE_BYTES.min(mem_size);
            let ru_type = self.rus.rus[slot].ru_info.ru_type;

            let data = self.raw_buffer.as_slice();
            if page_end.saturating_sub(pos) < in_ws || !gbt::is_data_header(&data[pos..]) {
                log::error!("FEE#{fee_id:#06X} GBT payload header was expected, abort page skimming");
                self.rus.rus[slot]
                    .stats
                    .count(RuDecodingError::MissingGbtHeader);
                out.shrink_to(size_at_entry);
                return true;
            }
            let gbt_header = GbtDataHeader::from_buf(&data[pos..]);
            {
                let stats = &mut self.rus.rus[slot].stats;
                if gbt_header.packet_id != page_cnt {
                    log::error!(
                        "FEE#{fee_id:#06X} GBT header packet ID {packet} and RDH page counter {page_cnt} differ",
                        packet = gbt_header.packet_id
                    );
                    stats.count(RuDecodingError::RdhVsGbtPageCnt);
                }
                if stats.lanes_active == stats.lanes_stop && page_cnt != 0 {
                    log::error!(
                        "FEE#{fee_id:#06X} non-zero page counter ({page_cnt}) while all lanes were stopped"
                    );
                    stats.count(RuDecodingError::NonZeroPageAfterStop);
                }
                stats.lanes_active = gbt_header.lanes;
                if page_cnt == 0 {
                    stats.lanes_stop = 0;
                    stats.lanes_with_data = 0;
                }
            }

            // skimmed copy of this page: RDH + 80-bit words
            out.ensure_free_capacity(MAX_PAGE_BYTES);
            let out_rdh_at = out.size();
            let data = self.raw_buffer.as_slice();
            out.add_bytes(&data[page_start..page_start + RDH_SIZE_BYTES]);
            out.add_bytes(&data[pos..pos + GBT_WORD_LEN]);
            pos += in_ws;

            let n_words_estimate =
                (mem_size.saturating_sub(RDH_SIZE_BYTES) / in_ws).saturating_sub(2);
            let mut n_words = 0usize;
            let mut trailer_pos = None;
            for _ in 0..n_words_estimate {
                if page_end.saturating_sub(pos) < in_ws {
                    break;
                }
                let word = &data[pos..pos + in_ws];
                if gbt::is_data_trailer(word) {
                    trailer_pos = Some(pos);
                    break;
                }
                let cable_hw = gbt::cable_id(word);
                let cable_sw = self.map.cable_hw_to_sw(ru_type, cable_hw) as usize;
                out.add_bytes(&word[..GBT_WORD_LEN]);
                n_words += 1;
                if cable_sw < MAX_CABLES_PER_RU {
                    let stats = &mut self.rus.rus[slot].stats;
                    stats.lanes_with_data |= 1 << cable_sw;
                    if stats.lanes_stop & (1 << cable_sw) != 0 {
                        log::error!(
                            "FEE#{fee_id:#06X} data received for stopped lane {cable_hw} (sw: {cable_sw})"
                        );
                        stats.count(RuDecodingError::DataForStoppedLane);
                    }
                }
                pos += in_ws;
            }

            let trailer_at = trailer_pos.unwrap_or(pos);
            if page_end.saturating_sub(trailer_at) < in_ws
                || !gbt::is_data_trailer(&data[trailer_at..])
            {
                log::error!("FEE#{fee_id:#06X} GBT payload trailer was expected, abort page skimming");
                self.rus.rus[slot]
                    .stats
                    .count(RuDecodingError::MissingGbtTrailer);
                out.shrink_to(size_at_entry);
                return true;
            }
            let gbt_trailer = GbtDataTrailer::from_buf(&data[trailer_at..]);
            out.add_bytes(&data[trailer_at..trailer_at + GBT_WORD_LEN]);
            {
                let stats = &mut self.rus.rus[slot].stats;
                stats.lanes_timeout |= gbt_trailer.lanes_timeout;
                stats.lanes_stop |= gbt_trailer.lanes_stop;
            }
            last_trailer = Some(gbt_trailer);

            // the skimmed page is dense: both sizes shrink to the real payload
            let new_size = (RDH_SIZE_BYTES + (2 + n_words) * GBT_WORD_LEN) as u16;
            let out_bytes = out.as_mut_slice();
            LittleEndian::write_u16(&mut out_bytes[out_rdh_at + 8..out_rdh_at + 10], new_size);
            LittleEndian::write_u16(&mut out_bytes[out_rdh_at + 10..out_rdh_at + 12], new_size);

            // move to the next input page and check for a continuation
            if rdh.offset_to_next == 0 {
                self.raw_buffer.set_cursor(page_end);
                self.end_of_trigger_checks(slot, &rdh, last_trailer.as_ref());
                break;
            }
            let next_start = page_start + rdh.offset_to_next as usize;
            if next_start > self.raw_buffer.size() {
                self.raw_buffer.advance(self.raw_buffer.unused_size());
                self.end_of_trigger_checks(slot, &rdh, last_trailer.as_ref());
                break;
            }
            self.raw_buffer.set_cursor(next_start);
            if self.raw_buffer.unused_size() < RDH_SIZE_BYTES
                || !Rdh::peek_heuristic(self.raw_buffer.unused())
                || !rdh.is_same_ru_and_trigger(
                    &Rdh::from_buf(self.raw_buffer.unused()).expect("length checked"),
                )
            {
                self.end_of_trigger_checks(slot, &rdh, last_trailer.as_ref());
                break;
            }
            prev = Some(rdh);
        }
        false
    }
}

enum PageRouting {
    Routed,
    Resync,
    Starved,
}
