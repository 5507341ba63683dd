//! End-to-end scenarios over the encode → page stream → decode chain,
//! including protocol-violation recovery and the skim variant.

use alpide_raw::prelude::*;
use alpide_raw::words::gbt::{
    GbtDataHeader, GbtDataTrailer, GBT_PADDED_WORD_LEN, GBT_WORD_LEN,
};
use alpide_raw::words::rdh::RDH_SIZE_BYTES;
use alpide_raw::words::ByteSlice;
use byteorder::{ByteOrder, LittleEndian};
use pretty_assertions::assert_eq;
use std::io::Cursor;

fn interaction(orbit: u32, bc: u16) -> InteractionRecord {
    InteractionRecord { orbit, bc }
}

/// Encodes each digit set as one trigger and flushes everything to a single
/// byte stream.
fn encode_stream(
    map: &LinearMapping,
    cfg: &CodecConfig,
    triggers: &[(InteractionRecord, Vec<Digit>)],
) -> Vec<u8> {
    let mut enc = RawPixelEncoder::new(map.clone(), cfg);
    let last_ru = (map.n_rus() - 1) as u16;
    for (ir, digits) in triggers {
        enc.digits_to_raw(digits, *ir, 0, last_ru).unwrap();
    }
    let mut sink = PayloadBuffer::new();
    enc.flush_superpages(usize::MAX, &mut sink);
    sink.as_slice().to_vec()
}

fn decode_all(map: &LinearMapping, cfg: &CodecConfig, stream: Vec<u8>) -> Vec<ChipPixelData> {
    let mut dec = RawPixelDecoder::new(map.clone(), cfg);
    dec.open(Cursor::new(stream));
    let mut chips = Vec::new();
    while let Some(chip) = dec.next_chip_data() {
        chips.push(chip);
    }
    chips
}

#[test]
fn empty_input_is_a_clean_noop() {
    let map = LinearMapping::new(2, 3);
    let cfg = CodecConfig::default();
    let mut dec = RawPixelDecoder::new(map, &cfg);
    dec.open(Cursor::new(Vec::new()));
    assert_eq!(dec.next_chip_data(), None);
    assert_eq!(dec.next_chip_data(), None);
    assert_eq!(dec.decoding_stats(), &RawDecodingStats::default());
}

#[test]
fn empty_trigger_roundtrips_to_zero_chips() {
    let map = LinearMapping::new(1, 3);
    let cfg = CodecConfig::default();
    let stream = encode_stream(&map, &cfg, &[(interaction(7, 42), Vec::new())]);
    assert_eq!(stream.len(), MAX_PAGE_BYTES);

    let mut dec = RawPixelDecoder::new(map, &cfg);
    dec.open(Cursor::new(stream));
    assert_eq!(dec.next_chip_data(), None);
    let stats = dec.decoding_stats();
    assert_eq!(stats.n_pages_processed, 1);
    assert_eq!(stats.n_non_empty_chips, 0);
    assert_eq!(dec.ru_decoding_stats_sw(0).unwrap().n_errors(), 0);
}

#[test]
fn single_pixel_roundtrip_through_a_file() {
    let map = LinearMapping::new(1, 9);
    let cfg = CodecConfig::default();
    let stream = encode_stream(
        &map,
        &cfg,
        &[(interaction(0, 0), vec![Digit::new(0, 5, 9)])],
    );

    let tmp_d = temp_dir::TempDir::new().unwrap();
    let path = tmp_d.child("single_pixel.raw");
    std::fs::write(&path, &stream).unwrap();
    let reader = std::io::BufReader::new(std::fs::File::open(&path).unwrap());

    let mut dec = RawPixelDecoder::new(map, &cfg);
    dec.open(reader);
    let chip = dec.next_chip_data().unwrap();
    assert_eq!(chip.chip_id(), 0);
    assert_eq!(chip.pixels(), &[PixelData::new(5, 9)]);
    assert_eq!(dec.next_chip_data(), None);
}

#[test]
fn multi_ru_digits_roundtrip_exactly() {
    let map = LinearMapping::new(3, 3);
    let cfg = CodecConfig::default();
    // sorted by chip, within a chip by (row, col); chip 4 left empty
    let digits = vec![
        Digit::new(0, 0, 0),
        Digit::new(0, 0, 1),
        Digit::new(0, 511, 1023),
        Digit::new(1, 100, 200),
        Digit::new(3, 1, 1),
        Digit::new(5, 2, 900),
        Digit::new(6, 17, 33),
        Digit::new(8, 400, 64),
    ];
    let stream = encode_stream(&map, &cfg, &[(interaction(3, 1000), digits.clone())]);
    let chips = decode_all(&map, &cfg, stream);

    let mut decoded_digits = Vec::new();
    for chip in &chips {
        assert!(!chip.has_errors());
        assert_eq!(chip.interaction(), interaction(3, 1000));
        for px in chip.pixels() {
            decoded_digits.push(Digit::new(chip.chip_id(), px.row(), px.col()));
        }
    }
    assert_eq!(decoded_digits, digits);
}

#[test]
fn cross_page_trigger_reassembles() {
    let map = LinearMapping::new(1, 1);
    let cfg = CodecConfig::default();
    let mut digits = Vec::new();
    for row in 0..512 {
        for col in 0..6u16 {
            digits.push(Digit::new(0, row, col * 16));
        }
    }
    let stream = encode_stream(&map, &cfg, &[(interaction(1, 1), digits.clone())]);
    let n_pages = stream.len() / MAX_PAGE_BYTES;
    assert!(n_pages > 1, "expected a multi-page trigger");

    let mut dec = RawPixelDecoder::new(map, &cfg);
    dec.open(Cursor::new(stream));
    let chip = dec.next_chip_data().unwrap();
    assert_eq!(chip.pixels().len(), digits.len());
    assert_eq!(dec.next_chip_data(), None);
    let stats = dec.decoding_stats();
    assert_eq!(stats.n_pages_processed as usize, n_pages);
    assert_eq!(stats.n_hits_decoded as usize, digits.len());
    assert_eq!(dec.ru_decoding_stats_sw(0).unwrap().n_errors(), 0);
}

#[test]
fn corrupt_bytes_between_pages_trigger_a_resync() {
    let map = LinearMapping::new(1, 1);
    let cfg = CodecConfig::default();
    let stream = encode_stream(
        &map,
        &cfg,
        &[
            (interaction(1, 1), vec![Digit::new(0, 1, 1)]),
            (interaction(1, 2), vec![Digit::new(0, 2, 2)]),
        ],
    );
    assert_eq!(stream.len(), 2 * MAX_PAGE_BYTES);

    // splice two padded words of garbage between the two pages
    let mut corrupt = Vec::new();
    corrupt.extend_from_slice(&stream[..MAX_PAGE_BYTES]);
    for _ in 0..8 {
        corrupt.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    }
    corrupt.extend_from_slice(&stream[MAX_PAGE_BYTES..]);

    let chips = decode_all(&map, &cfg, corrupt);
    assert_eq!(chips.len(), 2);
    assert_eq!(chips[0].pixels(), &[PixelData::new(1, 1)]);
    assert_eq!(chips[1].pixels(), &[PixelData::new(2, 2)]);
}

#[test]
fn missing_trailer_aborts_one_page_only() {
    let map = LinearMapping::new(1, 1);
    let cfg = CodecConfig::default();
    let mut stream = encode_stream(
        &map,
        &cfg,
        &[
            (interaction(1, 1), vec![Digit::new(0, 1, 1)]),
            (interaction(1, 2), vec![Digit::new(0, 2, 2)]),
        ],
    );

    // overwrite the first page's trailer flag with a payload-word flag
    let mem_size = LittleEndian::read_u16(&stream[10..12]) as usize;
    let trailer_flag_at = mem_size - GBT_PADDED_WORD_LEN + 9;
    assert_eq!(stream[trailer_flag_at], 0xF0);
    stream[trailer_flag_at] = 0x20;

    let map2 = map.clone();
    let mut dec = RawPixelDecoder::new(map2, &cfg);
    dec.open(Cursor::new(stream));
    let mut chips = Vec::new();
    while let Some(chip) = dec.next_chip_data() {
        chips.push(chip);
    }
    // both triggers still produce their chip
    assert_eq!(chips.len(), 2);
    assert_eq!(chips[1].pixels(), &[PixelData::new(2, 2)]);
    let ru_stats = dec.ru_decoding_stats_sw(0).unwrap();
    assert_eq!(ru_stats.errors(RuDecodingError::MissingGbtTrailer), 1);
    assert_eq!(ru_stats.errors(RuDecodingError::UnstoppedLanes), 1);
}

/// Handcrafts one page: RDH, GBT header, payload words for cable 0, trailer.
fn craft_page(
    fee_id: u16,
    page_cnt: u16,
    lanes: u32,
    n_words: usize,
    trailer: GbtDataTrailer,
) -> Vec<u8> {
    let word_size = GBT_PADDED_WORD_LEN;
    let mut rdh = Rdh {
        fee_id,
        trigger_orbit: 5,
        heartbeat_orbit: 5,
        trigger_bc: 1,
        heartbeat_bc: 1,
        trigger_type: trigger::PHYSICS,
        page_cnt,
        ..Default::default()
    };
    rdh.memory_size = (RDH_SIZE_BYTES + (n_words + 2) * word_size) as u16;
    rdh.offset_to_next = rdh.memory_size;
    let mut page = rdh.to_byte_slice().to_vec();
    let mut word = [0u8; GBT_PADDED_WORD_LEN];
    GbtDataHeader::new(page_cnt, lanes).write(&mut word);
    page.extend_from_slice(&word);
    for _ in 0..n_words {
        let mut word = [0u8; GBT_PADDED_WORD_LEN];
        word[0] = 0xE0; // one empty-chip record, rest padding
        word[9] = 0x20; // cable 0, inner barrel
        page.extend_from_slice(&word);
    }
    let mut word = [0u8; GBT_PADDED_WORD_LEN];
    trailer.write(&mut word);
    page.extend_from_slice(&word);
    page
}

#[test]
fn data_for_stopped_lane_counts_once_per_word() {
    let map = LinearMapping::new(1, 2);
    let cfg = CodecConfig::default();
    let fee_id = map.ru_sw_to_fee_id(0, 0);

    // page 0 stops both lanes, page 1 of the same trigger still ships two
    // words for cable 0; lane 1 never transmits and is flagged timed out
    let stopping_trailer = GbtDataTrailer {
        lanes_stop: 0b11,
        lanes_timeout: 0b10,
        packet_state: 0,
    };
    let done_trailer = GbtDataTrailer {
        lanes_stop: 0b11,
        lanes_timeout: 0b10,
        packet_state: 0x1,
    };
    let mut stream = craft_page(fee_id, 0, 0b11, 1, stopping_trailer);
    stream.extend_from_slice(&craft_page(fee_id, 1, 0b11, 2, done_trailer));

    let mut dec = RawPixelDecoder::new(map, &cfg);
    dec.open(Cursor::new(stream));
    assert_eq!(dec.next_chip_data(), None); // empty chips only
    let ru_stats = dec.ru_decoding_stats_sw(0).unwrap();
    assert_eq!(ru_stats.errors(RuDecodingError::DataForStoppedLane), 2);
    assert_eq!(ru_stats.errors(RuDecodingError::NonZeroPageAfterStop), 1);
    assert_eq!(ru_stats.errors(RuDecodingError::UnstoppedLanes), 0);
    assert_eq!(ru_stats.errors(RuDecodingError::NoDataForActiveLane), 0);
    // the closing trailer carried the packet-done state
    assert_eq!(ru_stats.packet_states[0x1], 1);
}

#[test]
fn zero_offset_terminates_a_trigger_cleanly() {
    let map = LinearMapping::new(1, 1);
    let cfg = CodecConfig {
        impose_max_page: false,
        ..Default::default()
    };
    let mut stream = encode_stream(&map, &cfg, &[(interaction(9, 9), vec![Digit::new(0, 3, 4)])]);
    // the final in-memory page may carry 0 instead of its memory size
    LittleEndian::write_u16(&mut stream[8..10], 0);

    let chips = decode_all(&map, &cfg, stream);
    assert_eq!(chips.len(), 1);
    assert_eq!(chips[0].pixels(), &[PixelData::new(3, 4)]);
}

#[test]
fn statistics_grow_monotonically() {
    let map = LinearMapping::new(2, 3);
    let cfg = CodecConfig::default();
    let triggers: Vec<(InteractionRecord, Vec<Digit>)> = (0..4)
        .map(|t| {
            (
                interaction(t, t as u16),
                vec![Digit::new(0, t as u16, 1), Digit::new(4, 2, t as u16)],
            )
        })
        .collect();
    let stream = encode_stream(&map, &cfg, &triggers);

    let mut dec = RawPixelDecoder::new(map, &cfg);
    dec.open(Cursor::new(stream));
    let mut previous = *dec.decoding_stats();
    while let Some(_chip) = dec.next_chip_data() {
        let current = *dec.decoding_stats();
        assert!(current.n_pages_processed >= previous.n_pages_processed);
        assert!(current.n_rus_processed >= previous.n_rus_processed);
        assert!(current.n_bytes_processed >= previous.n_bytes_processed);
        assert!(current.n_non_empty_chips >= previous.n_non_empty_chips);
        assert!(current.n_hits_decoded >= previous.n_hits_decoded);
        previous = current;
    }
    assert_eq!(previous.n_non_empty_chips, 8);
}

#[test]
fn skim_shrinks_padded_streams_without_changing_the_decode() {
    let map = LinearMapping::new(2, 3);
    let cfg = CodecConfig::default();
    let triggers = vec![
        (
            interaction(1, 1),
            vec![Digit::new(0, 1, 2), Digit::new(4, 7, 8)],
        ),
        (interaction(1, 2), vec![Digit::new(2, 30, 31)]),
    ];
    let stream = encode_stream(&map, &cfg, &triggers);

    let mut skimmer = RawPixelDecoder::new(map.clone(), &cfg);
    skimmer.open(Cursor::new(stream.clone()));
    let mut skimmed = PayloadBuffer::new();
    while skimmer.skim_next_ru_data(&mut skimmed) {}
    assert!(skimmed.size() <= stream.len());

    // skimmed pages are dense: every RDH must describe 80-bit words
    let first = Rdh::from_buf(skimmed.as_slice()).unwrap();
    let (offset_to_next, memory_size) = (first.offset_to_next, first.memory_size);
    assert_eq!(offset_to_next, memory_size);
    assert_eq!((memory_size as usize - RDH_SIZE_BYTES) % GBT_WORD_LEN, 0);

    let unpadded_cfg = CodecConfig {
        padding_128: false,
        ..Default::default()
    };
    let from_padded = decode_all(&map, &cfg, stream);
    let from_skimmed = decode_all(&map, &unpadded_cfg, skimmed.as_slice().to_vec());
    assert_eq!(from_padded, from_skimmed);
    assert_eq!(from_padded.len(), 3);
}

#[test]
fn chip_count_matches_non_empty_chip_headers() {
    let map = LinearMapping::new(2, 3);
    let cfg = CodecConfig::default();
    let digits = vec![Digit::new(1, 1, 1), Digit::new(1, 1, 5), Digit::new(4, 0, 0)];
    let stream = encode_stream(&map, &cfg, &[(interaction(2, 2), digits)]);

    let map2 = map.clone();
    let mut dec = RawPixelDecoder::new(map2, &cfg);
    dec.open(Cursor::new(stream));
    let mut n_chips = 0;
    while dec.next_chip_data().is_some() {
        n_chips += 1;
    }
    assert_eq!(n_chips, 2);
    assert_eq!(dec.decoding_stats().n_non_empty_chips, 2);
    assert_eq!(dec.decoding_stats().n_hits_decoded, 3);
}
