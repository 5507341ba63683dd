//! Stateless per-cable codec for ALPIDE chip frames.
//!
//! Operates on the byte stream of a single cable, independent of the GBT
//! framing: `chip_header (region_header? data_short | data_long)* chip_trailer`
//! for chips with hits, a single `chip_empty` record otherwise. Zero bytes
//! between frames are transport padding and are skipped.

use crate::buffer::PayloadBuffer;
use crate::pixel::{chip_error, ChipPixelData, PixelData};
use crate::words::alpide::{
    AlpideWord, CHIP_EMPTY, CHIP_HEADER, CHIP_TRAILER, COLS_PER_REGION, DATA_LONG, DATA_SHORT,
    ENCODER_SHIFT, MASK_CHIP_ID, MASK_HIT_MAP, MASK_PIX_ID, MASK_REGION, MASK_ROFLAGS, N_COLS,
    N_ROWS, REGION_HEADER,
};
use itertools::Itertools;

/// Outcome of decoding one chip frame from a cable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipDecode {
    /// A chip frame with this many pixels was decoded.
    Chip(usize),
    /// A chip-empty record was consumed; the chip data carries the chip ID
    /// and no pixels.
    Empty,
    /// No more data on the cable.
    EndOfStream,
    /// The stream violated the chip framing; the offending byte and flags
    /// are recorded in the chip data, which may hold partial pixels.
    Error,
}

/// Stateless encoder/decoder for single-chip ALPIDE frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlpideCoder;

/// Bits 10:3 of the bunch crossing, as carried in chip header/empty records.
#[inline]
fn alpide_bc(bc: u16) -> u8 {
    (bc >> 3) as u8
}

impl AlpideCoder {
    /// Creates a coder.
    pub fn new() -> Self {
        Self
    }

    /// Takes the first byte of a record and returns whether it opens a chip
    /// frame (chip header or chip empty).
    #[inline]
    pub fn is_chip_header_or_empty(byte: u8) -> bool {
        let flag = byte & 0xF0;
        flag == CHIP_HEADER || flag == CHIP_EMPTY
    }

    /// Appends an empty-chip record to the cable buffer.
    pub fn add_empty_chip(&self, buf: &mut PayloadBuffer, chip_on_module: u8, bc: u16) {
        buf.add_bytes(&[CHIP_EMPTY | (chip_on_module & MASK_CHIP_ID), alpide_bc(bc)]);
    }

    /// Appends the chip's pixels as one ALPIDE frame, sorted by (row, col)
    /// ascending with duplicates removed. Consecutive pixels of the same row
    /// within a column distance of 7 coalesce into a single data-long word.
    /// Returns the number of pixels written.
    pub fn encode_chip(
        &self,
        buf: &mut PayloadBuffer,
        chip: &ChipPixelData,
        chip_on_module: u8,
        bc: u16,
    ) -> usize {
        let pixels = chip
            .pixels()
            .iter()
            .copied()
            .sorted_unstable()
            .dedup()
            .collect_vec();
        if pixels.is_empty() {
            self.add_empty_chip(buf, chip_on_module, bc);
            return 0;
        }
        buf.add_bytes(&[CHIP_HEADER | (chip_on_module & MASK_CHIP_ID), alpide_bc(bc)]);
        let mut last_region = None;
        let mut i = 0;
        while i < pixels.len() {
            let base = pixels[i];
            debug_assert!(base.row() < N_ROWS && base.col() < N_COLS);
            let region = (base.col() / COLS_PER_REGION) as u8;
            if last_region != Some(region) {
                buf.add_bytes(&[REGION_HEADER | (region & MASK_REGION)]);
                last_region = Some(region);
            }
            let mut hit_map = 0u8;
            let mut j = i + 1;
            while j < pixels.len()
                && pixels[j].row() == base.row()
                && pixels[j].col() - base.col() <= 7
            {
                hit_map |= 1 << (pixels[j].col() - base.col() - 1);
                j += 1;
            }
            let addr = encoder_addr(base);
            if hit_map == 0 {
                let word = DATA_SHORT | addr;
                buf.add_bytes(&[(word >> 8) as u8, word as u8]);
            } else {
                let word = DATA_LONG | addr;
                buf.add_bytes(&[(word >> 8) as u8, word as u8, hit_map & MASK_HIT_MAP]);
            }
            i = j;
        }
        buf.add_bytes(&[CHIP_TRAILER]); // readout flags all clear
        pixels.len()
    }

    /// Decodes one chip frame from the cable stream into `chip`.
    ///
    /// When a chip header is missing, the offending byte is recorded in the
    /// chip's error field and the cable is skipped forward to the next
    /// chip-header/empty candidate so decoding can continue.
    pub fn decode_chip(&self, chip: &mut ChipPixelData, cable: &mut PayloadBuffer) -> ChipDecode {
        // inter-frame transport padding
        while cable.current() == Some(0) {
            cable.advance(1);
        }
        let Some(first) = cable.current() else {
            return ChipDecode::EndOfStream;
        };
        chip.clear();
        match first & 0xF0 {
            CHIP_EMPTY => {
                cable.advance(1);
                chip.set_chip_id(u16::from(first & MASK_CHIP_ID));
                if cable.current().is_none() {
                    chip.add_error(chip_error::TRUNCATED_FRAME, first);
                    return ChipDecode::Error;
                }
                cable.advance(1); // bunch-counter byte
                ChipDecode::Empty
            }
            CHIP_HEADER => self.decode_frame(chip, cable, first),
            _ => {
                chip.add_error(chip_error::UNKNOWN_WORD, first);
                log::warn!(
                    "unexpected ALPIDE byte {first:#04X} where a chip header was expected"
                );
                Self::seek_chip_boundary(cable);
                ChipDecode::Error
            }
        }
    }

    /// Decodes the body of a chip frame whose header byte was already seen.
    fn decode_frame(
        &self,
        chip: &mut ChipPixelData,
        cable: &mut PayloadBuffer,
        header: u8,
    ) -> ChipDecode {
        chip.set_chip_id(u16::from(header & MASK_CHIP_ID));
        cable.advance(1);
        if cable.current().is_none() {
            chip.add_error(chip_error::TRUNCATED_FRAME, header);
            return ChipDecode::Error;
        }
        cable.advance(1); // bunch-counter byte
        let mut region: Option<u16> = None;
        loop {
            let Some(byte) = cable.current() else {
                chip.add_error(chip_error::TRUNCATED_FRAME, header);
                return ChipDecode::Error;
            };
            match AlpideWord::from_byte(byte) {
                Ok(AlpideWord::ChipTrailer) => {
                    if byte & MASK_ROFLAGS != 0 {
                        log::debug!(
                            "chip {id} trailer carries readout flags {flags:#03X}",
                            id = chip.chip_id(),
                            flags = byte & MASK_ROFLAGS
                        );
                    }
                    cable.advance(1);
                    return ChipDecode::Chip(chip.pixels().len());
                }
                Ok(AlpideWord::RegionHeader) => {
                    region = Some(u16::from(byte & MASK_REGION));
                    cable.advance(1);
                }
                Ok(AlpideWord::DataShort) => {
                    let Some(region) = region else {
                        chip.add_error(chip_error::UNKNOWN_WORD, byte);
                        Self::seek_chip_boundary(cable);
                        return ChipDecode::Error;
                    };
                    if cable.unused_size() < 2 {
                        chip.add_error(chip_error::TRUNCATED_FRAME, byte);
                        cable.advance(cable.unused_size());
                        return ChipDecode::Error;
                    }
                    let word = u16::from_be_bytes([cable.unused()[0], cable.unused()[1]]);
                    chip.push_pixel(pixel_from_word(region, word));
                    cable.advance(2);
                }
                Ok(AlpideWord::DataLong) => {
                    let Some(region) = region else {
                        chip.add_error(chip_error::UNKNOWN_WORD, byte);
                        Self::seek_chip_boundary(cable);
                        return ChipDecode::Error;
                    };
                    if cable.unused_size() < 3 {
                        chip.add_error(chip_error::TRUNCATED_FRAME, byte);
                        cable.advance(cable.unused_size());
                        return ChipDecode::Error;
                    }
                    let word = u16::from_be_bytes([cable.unused()[0], cable.unused()[1]]);
                    let hit_map = cable.unused()[2] & MASK_HIT_MAP;
                    let base = pixel_from_word(region, word);
                    chip.push_pixel(base);
                    for ip in 0u16..7 {
                        if hit_map & (1 << ip) != 0 {
                            chip.push_pixel(PixelData::new(base.row(), base.col() + ip + 1));
                        }
                    }
                    cable.advance(3);
                }
                Ok(AlpideWord::BusyOn) | Ok(AlpideWord::BusyOff) => {
                    log::trace!("{byte:#04X}: busy word within chip frame");
                    cable.advance(1);
                }
                Ok(AlpideWord::ChipHeader) | Ok(AlpideWord::ChipEmpty) => {
                    // unterminated frame; leave the cursor on the new header
                    chip.add_error(chip_error::UNKNOWN_WORD, byte);
                    log::warn!(
                        "chip {id} frame interrupted by {byte:#04X}",
                        id = chip.chip_id()
                    );
                    return ChipDecode::Error;
                }
                Err(()) => {
                    chip.add_error(chip_error::UNKNOWN_WORD, byte);
                    log::warn!("unknown ALPIDE word {byte:#04X}");
                    cable.advance(1);
                    Self::seek_chip_boundary(cable);
                    return ChipDecode::Error;
                }
            }
        }
    }

    /// Skips forward to the next chip-header/empty candidate or the end of
    /// the cable.
    fn seek_chip_boundary(cable: &mut PayloadBuffer) {
        while let Some(byte) = cable.current() {
            if Self::is_chip_header_or_empty(byte) {
                break;
            }
            cable.advance(1);
        }
    }
}

/// Region/encoder/address mapping of a pixel: region = col / 32, encoder =
/// (col % 32) / 2, addr = row << 1 | (col & 1).
#[inline]
fn encoder_addr(pixel: PixelData) -> u16 {
    let in_region = pixel.col() % COLS_PER_REGION;
    let encoder = in_region >> 1;
    let addr = (pixel.row() << 1) | (pixel.col() & 1);
    (encoder << ENCODER_SHIFT) | (addr & MASK_PIX_ID)
}

/// Inverse of [`encoder_addr`] given the active region.
#[inline]
fn pixel_from_word(region: u16, word: u16) -> PixelData {
    let encoder = (word >> ENCODER_SHIFT) & 0xF;
    let addr = word & MASK_PIX_ID;
    let row = addr >> 1;
    let col = region * COLS_PER_REGION + encoder * 2 + (addr & 1);
    PixelData::new(row, col)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::chip_error;
    use pretty_assertions::assert_eq;

    fn chip_with(pixels: &[(u16, u16)]) -> ChipPixelData {
        let mut chip = ChipPixelData::default();
        for (row, col) in pixels {
            chip.push_pixel(PixelData::new(*row, *col));
        }
        chip
    }

    fn roundtrip(pixels: &[(u16, u16)]) -> ChipPixelData {
        let coder = AlpideCoder::new();
        let mut cable = PayloadBuffer::new();
        let written = coder.encode_chip(&mut cable, &chip_with(pixels), 3, 0x2A);
        assert_eq!(written, pixels.len());
        let mut decoded = ChipPixelData::default();
        assert_eq!(
            coder.decode_chip(&mut decoded, &mut cable),
            ChipDecode::Chip(pixels.len())
        );
        assert!(cable.is_empty());
        decoded
    }

    #[test]
    fn single_pixel_roundtrip() {
        let decoded = roundtrip(&[(5, 9)]);
        assert_eq!(decoded.chip_id(), 3);
        assert_eq!(decoded.pixels(), &[PixelData::new(5, 9)]);
        assert!(!decoded.has_errors());
    }

    #[test]
    fn long_word_coalesces_same_row_neighbours() {
        // cols 4..=9 in one row fit one hit map
        let pixels = [(7, 4), (7, 5), (7, 7), (7, 11), (8, 4)];
        let coder = AlpideCoder::new();
        let mut cable = PayloadBuffer::new();
        coder.encode_chip(&mut cable, &chip_with(&pixels), 0, 0);
        // header+bc, region, long(3), trailer -- (7,11) is within 7 of (7,4)
        assert_eq!(cable.size(), 2 + 1 + 3 + 2 + 1);
        let mut decoded = ChipPixelData::default();
        assert_eq!(
            coder.decode_chip(&mut decoded, &mut cable),
            ChipDecode::Chip(5)
        );
        let expect: Vec<PixelData> = pixels
            .iter()
            .map(|(r, c)| PixelData::new(*r, *c))
            .collect();
        assert_eq!(decoded.pixels(), expect.as_slice());
    }

    #[test]
    fn coalescing_crosses_region_boundary_cleanly() {
        // base in region 0, hit-map neighbour lands in region 1
        let decoded = roundtrip(&[(1, 30), (1, 33)]);
        assert_eq!(
            decoded.pixels(),
            &[PixelData::new(1, 30), PixelData::new(1, 33)]
        );
    }

    #[test]
    fn region_changes_are_encoded_once_per_region() {
        let decoded = roundtrip(&[(0, 0), (0, 40), (3, 41), (500, 1023)]);
        assert_eq!(decoded.pixels().len(), 4);
    }

    #[test]
    fn duplicate_pixels_are_dropped() {
        let coder = AlpideCoder::new();
        let mut cable = PayloadBuffer::new();
        let chip = chip_with(&[(2, 2), (2, 2)]);
        assert_eq!(coder.encode_chip(&mut cable, &chip, 0, 0), 1);
    }

    #[test]
    fn empty_chip_roundtrip() {
        let coder = AlpideCoder::new();
        let mut cable = PayloadBuffer::new();
        coder.add_empty_chip(&mut cable, 5, 0x7FF);
        let mut decoded = ChipPixelData::default();
        assert_eq!(coder.decode_chip(&mut decoded, &mut cable), ChipDecode::Empty);
        assert_eq!(decoded.chip_id(), 5);
        assert!(decoded.pixels().is_empty());
        assert!(!decoded.has_errors());
        assert_eq!(coder.decode_chip(&mut decoded, &mut cable), ChipDecode::EndOfStream);
    }

    #[test]
    fn zero_padding_between_frames_is_skipped() {
        let coder = AlpideCoder::new();
        let mut cable = PayloadBuffer::new();
        coder.add_empty_chip(&mut cable, 1, 0);
        cable.add_bytes(&[0, 0, 0, 0]);
        coder.add_empty_chip(&mut cable, 2, 0);
        let mut decoded = ChipPixelData::default();
        assert_eq!(coder.decode_chip(&mut decoded, &mut cable), ChipDecode::Empty);
        assert_eq!(coder.decode_chip(&mut decoded, &mut cable), ChipDecode::Empty);
        assert_eq!(decoded.chip_id(), 2);
        assert_eq!(coder.decode_chip(&mut decoded, &mut cable), ChipDecode::EndOfStream);
    }

    #[test]
    fn garbage_head_is_reported_and_skipped() {
        let coder = AlpideCoder::new();
        let mut cable = PayloadBuffer::new();
        cable.add_bytes(&[0x55]); // not a chip header
        coder.add_empty_chip(&mut cable, 4, 0);
        let mut decoded = ChipPixelData::default();
        assert_eq!(coder.decode_chip(&mut decoded, &mut cable), ChipDecode::Error);
        assert_eq!(decoded.error_byte(), 0x55);
        assert_eq!(decoded.error_flags(), chip_error::UNKNOWN_WORD);
        // the cable keeps decoding from the next frame
        assert_eq!(coder.decode_chip(&mut decoded, &mut cable), ChipDecode::Empty);
        assert_eq!(decoded.chip_id(), 4);
    }

    #[test]
    fn truncated_frame_is_reported() {
        let coder = AlpideCoder::new();
        let mut full = PayloadBuffer::new();
        coder.encode_chip(&mut full, &chip_with(&[(1, 1)]), 0, 0);
        let mut cable = PayloadBuffer::new();
        cable.add_bytes(&full.as_slice()[..full.size() - 2]); // cut inside the data word
        let mut decoded = ChipPixelData::default();
        assert_eq!(coder.decode_chip(&mut decoded, &mut cable), ChipDecode::Error);
        assert_eq!(decoded.error_flags(), chip_error::TRUNCATED_FRAME);
    }

    #[test]
    fn busy_words_inside_frame_are_transparent() {
        let coder = AlpideCoder::new();
        let mut reference = PayloadBuffer::new();
        coder.encode_chip(&mut reference, &chip_with(&[(9, 64)]), 2, 0);
        // splice a busy-on right after the bunch counter byte
        let bytes = reference.as_slice();
        let mut cable = PayloadBuffer::new();
        cable.add_bytes(&bytes[..2]);
        cable.add_bytes(&[crate::words::alpide::BUSY_ON]);
        cable.add_bytes(&bytes[2..]);
        let mut decoded = ChipPixelData::default();
        assert_eq!(coder.decode_chip(&mut decoded, &mut cable), ChipDecode::Chip(1));
        assert_eq!(decoded.pixels(), &[PixelData::new(9, 64)]);
    }
}
