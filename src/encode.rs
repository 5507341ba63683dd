//! Encoding of per-chip pixel records into page-framed GBT link buffers
//! (`digits_to_raw`) and flushing of accumulated pages to a sink.

use crate::alpide::AlpideCoder;
use crate::buffer::PayloadBuffer;
use crate::mapping::ChipMapping;
use crate::pixel::{trigger, ChipPixelData, Digit, InteractionRecord, PixelData};
use crate::ru::{RuLink, RuSlab};
use crate::words::alpide::{N_COLS, N_ROWS};
use crate::words::gbt::{
    gbt_word_size, GbtDataHeader, GbtDataTrailer, PacketState, GBT_PADDED_WORD_LEN,
};
use crate::words::rdh::{Rdh, RDH_SIZE_BYTES};
use crate::words::ByteSlice;
use crate::{CodecConfig, MAX_LINKS_PER_RU, MAX_PAGE_BYTES};
use byteorder::{ByteOrder, LittleEndian};
use std::io;

/// Encoder façade: converts the digits of one trigger at a time into CRU
/// pages accumulated per (RU, link), to be drained with
/// [`flush_superpages`](Self::flush_superpages).
pub struct RawPixelEncoder<M: ChipMapping> {
    map: M,
    rus: RuSlab,
    coder: AlpideCoder,
    interaction: InteractionRecord,
    gbt_word_size: usize,
    impose_max_page: bool,
    n_links: usize,
}

fn invalid_input(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

impl<M: ChipMapping> RawPixelEncoder<M> {
    /// Creates an encoder over the given mapping; the word size and page
    /// policy are frozen from `config`.
    pub fn new(map: M, config: &CodecConfig) -> Self {
        let n_rus = map.n_rus();
        Self {
            rus: RuSlab::new(n_rus),
            map,
            coder: AlpideCoder::new(),
            interaction: InteractionRecord::default(),
            gbt_word_size: gbt_word_size(config.padding_128),
            impose_max_page: config.impose_max_page,
            n_links: 0,
        }
    }

    /// The mapping in use.
    pub fn mapping(&self) -> &M {
        &self.map
    }

    /// Number of links the encoder writes to.
    pub fn n_links(&self) -> usize {
        self.n_links
    }

    /// The GBT word size in bytes, 10 or 16 depending on the padding mode.
    pub fn gbt_word_size(&self) -> usize {
        self.gbt_word_size
    }

    /// Whether GBT words are emitted padded to 128 bits.
    pub fn is_padding_128(&self) -> bool {
        self.gbt_word_size == GBT_PADDED_WORD_LEN
    }

    /// Whether written pages are padded to [`MAX_PAGE_BYTES`].
    pub fn is_max_page_imposed(&self) -> bool {
        self.impose_max_page
    }

    /// Drops all accumulated pages and sighted RUs.
    pub fn clear(&mut self) {
        self.rus = RuSlab::new(self.map.n_rus());
        self.n_links = 0;
    }

    /// Converts the digits of a single trigger into pages on the link
    /// buffers of the RUs in `[ru_sw_min, ru_sw_max]`.
    ///
    /// The digits must be in non-decreasing chip-index order; chips read out
    /// by RUs outside the range are ignored. Cable streams are made dense in
    /// chip IDs by injecting empty-chip records for every gap. Returns the
    /// number of pages accumulated by the link that has the fewest, a
    /// backpressure signal for the flushing cadence.
    pub fn digits_to_raw(
        &mut self,
        digits: &[Digit],
        bc: InteractionRecord,
        ru_sw_min: u16,
        ru_sw_max: u16,
    ) -> io::Result<usize> {
        self.interaction = bc;
        let ru_sw_max = ru_sw_max.min(self.map.n_rus().saturating_sub(1) as u16);

        // book containers, imposing single-link readout where no link exists
        for ru_sw in ru_sw_min..=ru_sw_max {
            let slot = self
                .rus
                .get_or_create(ru_sw, &self.map)
                .ok_or_else(|| invalid_input(format!("RU {ru_sw} unknown to the mapping")))?;
            let ru = &mut self.rus.rus[slot];
            ru.chips_data.clear();
            if ru.links.iter().all(|link| link.is_none()) {
                log::info!("imposing single link readout for RU {ru_sw}");
                ru.links[0] = Some(RuLink {
                    lanes: self.map.cables_on_ru_type(ru.ru_info.ru_type),
                    ..Default::default()
                });
                self.n_links += 1;
            }
        }

        // place digits into the chip scratch of their RU
        let mut cur_chip: Option<u16> = None;
        let mut cur_slot = usize::MAX;
        let mut skip_chip = false;
        for dig in digits {
            if cur_chip != Some(dig.chip) {
                if let Some(prev) = cur_chip {
                    if dig.chip < prev {
                        return Err(invalid_input(format!(
                            "digits must be in non-decreasing chip order, got {} after {prev}",
                            dig.chip
                        )));
                    }
                }
                let info = self
                    .map
                    .chip_info_sw(dig.chip)
                    .ok_or_else(|| invalid_input(format!("chip {} unknown to the mapping", dig.chip)))?;
                cur_chip = Some(dig.chip);
                skip_chip = !(ru_sw_min..=ru_sw_max).contains(&info.ru_sw);
                if !skip_chip {
                    cur_slot = self.rus.slot(info.ru_sw).expect("booked above");
                    let mut chip = ChipPixelData::default();
                    chip.set_chip_id(info.chip_on_ru);
                    self.rus.rus[cur_slot].chips_data.push(chip);
                }
            }
            if skip_chip {
                continue;
            }
            if dig.row >= N_ROWS || dig.col >= N_COLS {
                return Err(invalid_input(format!(
                    "pixel ({row}, {col}) outside the {N_ROWS}x{N_COLS} chip matrix",
                    row = dig.row,
                    col = dig.col
                )));
            }
            self.rus.rus[cur_slot]
                .chips_data
                .last_mut()
                .expect("chip pushed above")
                .push_pixel(PixelData::new(dig.row, dig.col));
        }

        // convert chips (and the empty-chip gaps) to per-cable ALPIDE data,
        // then flush the cables into link pages
        let mut min_pages = usize::MAX;
        for ru_sw in ru_sw_min..=ru_sw_max {
            let slot = self.rus.slot(ru_sw).expect("booked above");
            let n_chips_tot = self.map.n_chips_on_ru_type(self.rus.rus[slot].ru_info.ru_type);
            let fired = std::mem::take(&mut self.rus.rus[slot].chips_data);
            let mut next_to_convert = 0u16;
            for chip in &fired {
                self.convert_empty_chips(slot, next_to_convert, chip.chip_id())?;
                next_to_convert = chip.chip_id() + 1;
                self.convert_chip(slot, chip)?;
            }
            self.convert_empty_chips(slot, next_to_convert, n_chips_tot)?;
            min_pages = min_pages.min(self.fill_ru_links(slot));
        }
        Ok(if min_pages == usize::MAX { 0 } else { min_pages })
    }

    /// Converts the pixels of a single chip to ALPIDE format in its cable
    /// buffer.
    fn convert_chip(&mut self, slot: usize, chip: &ChipPixelData) -> io::Result<()> {
        let ru_type = self.rus.rus[slot].ru_info.ru_type;
        let wiring = self
            .map
            .chip_on_ru_info(ru_type, chip.chip_id())
            .ok_or_else(|| {
                invalid_input(format!("chip {} has no wiring on this RU type", chip.chip_id()))
            })?;
        let ru = &mut self.rus.rus[slot];
        let cable = wiring.cable_sw as usize;
        ru.cable_hw_id[cable] = wiring.cable_hw;
        ru.cable_data[cable].ensure_free_capacity(40 * (2 + chip.pixels().len()));
        let _ = self.coder.encode_chip(
            &mut ru.cable_data[cable],
            chip,
            wiring.chip_on_module_hw,
            self.interaction.bc,
        );
        Ok(())
    }

    /// Flags the chips in `[from_chip, upto_chip)` as empty on their cables.
    fn convert_empty_chips(&mut self, slot: usize, from_chip: u16, upto_chip: u16) -> io::Result<()> {
        let ru_type = self.rus.rus[slot].ru_info.ru_type;
        for chip_on_ru in from_chip..upto_chip {
            let wiring = self
                .map
                .chip_on_ru_info(ru_type, chip_on_ru)
                .ok_or_else(|| {
                    invalid_input(format!("chip {chip_on_ru} has no wiring on this RU type"))
                })?;
            let ru = &mut self.rus.rus[slot];
            let cable = wiring.cable_sw as usize;
            ru.cable_hw_id[cable] = wiring.cable_hw;
            ru.cable_data[cable].ensure_free_capacity(100);
            self.coder.add_empty_chip(
                &mut ru.cable_data[cable],
                wiring.chip_on_module_hw,
                self.interaction.bc,
            );
        }
        Ok(())
    }

    /// Moves the cable data of one RU into its link buffers as a sequence of
    /// pages, returning the page count of the link with the fewest pages.
    fn fill_ru_links(&mut self, slot: usize) -> usize {
        let ws = self.gbt_word_size;
        let max_words_per_page = (MAX_PAGE_BYTES - RDH_SIZE_BYTES) / ws - 2;
        let mut min_pages = usize::MAX;

        self.rus.rus[slot].n_cables = self.rus.rus[slot].ru_info.n_cables as usize;
        let mut rdh = Rdh {
            fee_id: 0,
            trigger_orbit: self.interaction.orbit,
            heartbeat_orbit: self.interaction.orbit,
            trigger_bc: self.interaction.bc,
            heartbeat_bc: self.interaction.bc,
            trigger_type: trigger::PHYSICS,
            detector_field: self.map.ru_detector_field(),
            block_length: 0xFFFF, // kept at the dummy sentinel
            ..Default::default()
        };

        for il in 0..MAX_LINKS_PER_RU {
            if self.rus.rus[slot].links[il].is_none() {
                continue;
            }
            let mut link = self.rus.rus[slot].links[il].take().expect("checked above");
            let ru = &mut self.rus.rus[slot];

            let mut remaining = 0usize;
            for icab in 0..ru.n_cables {
                if link.lanes & (1 << icab) != 0 {
                    let nb = ru.cable_data[icab].unused_size();
                    remaining += if nb > 0 { 1 + (nb - 1) / 9 } else { 0 };
                }
            }

            rdh.fee_id = self.map.ru_sw_to_fee_id(ru.ru_info.id_sw, il as u8);
            rdh.link_id = il as u8;
            rdh.page_cnt = 0;
            loop {
                let words_this_page = remaining.min(max_words_per_page);
                let page_cnt = rdh.page_cnt;
                rdh.stop = u8::from(remaining <= max_words_per_page);
                rdh.memory_size =
                    (RDH_SIZE_BYTES + (words_this_page + 2) * ws).min(MAX_PAGE_BYTES) as u16;
                rdh.offset_to_next = if self.impose_max_page {
                    MAX_PAGE_BYTES as u16
                } else {
                    rdh.memory_size
                };
                link.data.ensure_free_capacity(MAX_PAGE_BYTES);
                link.data.add_bytes(rdh.to_byte_slice());
                link.n_triggers += 1; // pages, not triggers
                log::debug!(
                    "filling RU {ru_sw} link {il} page {page_cnt}: {words_this_page} words",
                    ru_sw = ru.ru_info.id_sw
                );

                let mut word = [0u8; GBT_PADDED_WORD_LEN];
                GbtDataHeader::new(page_cnt, link.lanes).write(&mut word);
                link.data.add_bytes(&word[..ws]);

                // one GBT word per cable with pending bytes, ascending cable
                // index, until the page is full
                let mut words_in_page = 0usize;
                'body: while words_in_page < words_this_page {
                    for icab in 0..ru.n_cables {
                        if link.lanes & (1 << icab) == 0 {
                            continue;
                        }
                        let nb = ru.cable_data[icab].unused_size().min(9);
                        if nb == 0 {
                            continue;
                        }
                        let mut word = [0u8; GBT_PADDED_WORD_LEN];
                        word[..nb].copy_from_slice(&ru.cable_data[icab].unused()[..nb]);
                        word[9] =
                            self.map.gbt_cable_flag(ru.ru_info.ru_type, ru.cable_hw_id[icab]);
                        ru.cable_data[icab].advance(nb);
                        link.data.add_bytes(&word[..ws]);
                        remaining -= 1;
                        words_in_page += 1;
                        if words_in_page == words_this_page {
                            break 'body;
                        }
                    }
                }

                let mut trailer = GbtDataTrailer::default();
                if remaining == 0 {
                    // last page of this link's trigger
                    trailer.lanes_stop = link.lanes;
                    trailer.packet_state = 1 << PacketState::Done as u8;
                }
                let mut word = [0u8; GBT_PADDED_WORD_LEN];
                trailer.write(&mut word);
                link.data.add_bytes(&word[..ws]);

                if remaining == 0 {
                    break;
                }
                rdh.page_cnt += 1;
            }
            // pages are padded to 8 KB when flushed to the sink, not here

            min_pages = min_pages.min(link.n_triggers.max(0) as usize);
            self.rus.rus[slot].links[il] = Some(link);
        }
        let ru = &mut self.rus.rus[slot];
        ru.clear_trigger();
        ru.chips_data.clear();
        ru.n_chips_fired = 0;
        if min_pages == usize::MAX {
            0
        } else {
            min_pages
        }
    }

    /// Flushes at most `max_pages` accumulated pages of every link to the
    /// sink, zero-padding each page to [`MAX_PAGE_BYTES`] when max-page is
    /// imposed. Returns the total number of pages flushed.
    pub fn flush_superpages(&mut self, max_pages: usize, sink: &mut PayloadBuffer) -> usize {
        let mut tot_pages = 0;
        for ru in self.rus.rus.iter_mut() {
            for link in ru.links.iter_mut().flatten() {
                if link.data.is_empty() {
                    continue;
                }
                let mut n_pages = 0;
                while n_pages < max_pages && !link.data.is_empty() {
                    let page = link.data.unused();
                    let mem_size = LittleEndian::read_u16(&page[10..12]) as usize;
                    sink.add_bytes(&page[..mem_size]);
                    if self.impose_max_page {
                        sink.fill_zero(MAX_PAGE_BYTES - mem_size);
                    }
                    link.data.advance(mem_size);
                    link.n_triggers -= 1; // pages, not triggers
                    n_pages += 1;
                }
                tot_pages += n_pages;
                link.data.move_unused_to_head();
            }
        }
        tot_pages
    }
}
