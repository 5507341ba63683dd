//! GBT word flavours: data header, payload word and data trailer.
//!
//! A GBT word carries 80 data bits (10 bytes). When the transport pads words
//! to 128 bits, each word occupies 16 bytes with the upper 6 bytes zero.
//! Byte 9 identifies the flavour: [`GBT_FLAG_DATA_HEADER`],
//! [`GBT_FLAG_DATA_TRAILER`], or the cable flag of a payload word.

use byteorder::{ByteOrder, LittleEndian};

/// Length of a bare 80-bit GBT word in bytes.
pub const GBT_WORD_LEN: usize = 10;
/// Length of a GBT word padded to 128 bits.
pub const GBT_PADDED_WORD_LEN: usize = 16;

/// Flag byte of a GBT data header.
pub const GBT_FLAG_DATA_HEADER: u8 = 0xE0;
/// Flag byte of a GBT data trailer.
pub const GBT_FLAG_DATA_TRAILER: u8 = 0xF0;
/// Flag base of payload words from inner-barrel RUs: `0x20 | cable_hw`.
pub const GBT_FLAG_DATA_IB: u8 = 0x20;
/// Flag base of payload words from outer-barrel RUs: `0x40 | cable_hw`.
pub const GBT_FLAG_DATA_OB: u8 = 0x40;

/// Lane masks carry 28 bits, one per cable of an RU.
const LANES_MASK: u32 = 0x0FFF_FFFF;
/// Cable hardware ID bits within a payload word's flag byte.
const CABLE_ID_MASK: u8 = 0x1F;

/// Number of defined packet states reported by the data trailer.
pub const N_PACKET_STATES: usize = 5;
/// Size of the packet-state histogram, one slot per state combination.
pub const MAX_STATE_COMBINATIONS: usize = 1 << N_PACKET_STATES;

/// Packet-state bit positions within the trailer's state field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    /// The trigger's data is completely transferred.
    Done = 0,
    /// Transmission ended by timeout.
    TransmissionTimeout = 1,
    /// Transmission ended by packet-size overflow.
    PacketOverflow = 2,
    /// A lane started violating the protocol.
    LaneStartsViolation = 3,
    /// Lanes timed out.
    LaneTimeouts = 4,
}

/// GBT word size in bytes for the given padding mode.
#[inline]
pub const fn gbt_word_size(padding_128: bool) -> usize {
    if padding_128 {
        GBT_PADDED_WORD_LEN
    } else {
        GBT_WORD_LEN
    }
}

/// Takes a GBT word slice and returns whether it is a data header.
#[inline]
pub fn is_data_header(word: &[u8]) -> bool {
    debug_assert!(word.len() >= GBT_WORD_LEN);
    word[9] == GBT_FLAG_DATA_HEADER
}

/// Takes a GBT word slice and returns whether it is a data trailer.
#[inline]
pub fn is_data_trailer(word: &[u8]) -> bool {
    debug_assert!(word.len() >= GBT_WORD_LEN);
    word[9] == GBT_FLAG_DATA_TRAILER
}

/// Takes a payload word slice and returns the cable hardware ID from the
/// flag byte.
#[inline]
pub fn cable_id(word: &[u8]) -> u8 {
    debug_assert!(word.len() >= GBT_WORD_LEN);
    word[9] & CABLE_ID_MASK
}

/// Takes a payload word slice and returns its 9 payload bytes.
#[inline]
pub fn payload(word: &[u8]) -> &[u8] {
    debug_assert!(word.len() >= GBT_WORD_LEN);
    &word[..9]
}

/// The GBT data header opening the payload of every page.
///
/// Bytes 0–3 carry the 28-bit lane mask, bytes 4–5 the packet ID that must
/// mirror the RDH page counter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GbtDataHeader {
    /// Lanes active on this link.
    pub lanes: u32,
    /// Packet ID, equals the RDH page counter of the same page.
    pub packet_id: u16,
}

impl GbtDataHeader {
    /// Creates a header for the given packet ID and lane mask.
    pub fn new(packet_id: u16, lanes: u32) -> Self {
        Self {
            lanes: lanes & LANES_MASK,
            packet_id,
        }
    }

    /// Deserializes from a word slice.
    #[inline]
    pub fn from_buf(word: &[u8]) -> Self {
        Self {
            lanes: LittleEndian::read_u32(&word[0..4]) & LANES_MASK,
            packet_id: LittleEndian::read_u16(&word[4..6]),
        }
    }

    /// Serializes into `word`, which must already be zeroed and span one
    /// GBT word in the stream's padding mode.
    pub fn write(&self, word: &mut [u8]) {
        debug_assert!(word.len() >= GBT_WORD_LEN);
        LittleEndian::write_u32(&mut word[0..4], self.lanes & LANES_MASK);
        LittleEndian::write_u16(&mut word[4..6], self.packet_id);
        word[9] = GBT_FLAG_DATA_HEADER;
    }
}

/// The GBT data trailer closing the payload of every page.
///
/// Bytes 0–3 carry the 28-bit timeout mask, bytes 4–7 the 28-bit stop mask,
/// byte 8 the packet-state bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GbtDataTrailer {
    /// Lanes that timed out.
    pub lanes_timeout: u32,
    /// Lanes that received their stop.
    pub lanes_stop: u32,
    /// Packet-state bitfield, see [`PacketState`].
    pub packet_state: u8,
}

impl GbtDataTrailer {
    /// Deserializes from a word slice.
    #[inline]
    pub fn from_buf(word: &[u8]) -> Self {
        Self {
            lanes_timeout: LittleEndian::read_u32(&word[0..4]) & LANES_MASK,
            lanes_stop: LittleEndian::read_u32(&word[4..8]) & LANES_MASK,
            packet_state: word[8],
        }
    }

    /// Serializes into `word`, which must already be zeroed and span one
    /// GBT word in the stream's padding mode.
    pub fn write(&self, word: &mut [u8]) {
        debug_assert!(word.len() >= GBT_WORD_LEN);
        LittleEndian::write_u32(&mut word[0..4], self.lanes_timeout & LANES_MASK);
        LittleEndian::write_u32(&mut word[4..8], self.lanes_stop & LANES_MASK);
        word[8] = self.packet_state & (MAX_STATE_COMBINATIONS - 1) as u8;
        word[9] = GBT_FLAG_DATA_TRAILER;
    }

    /// Histogram slot for this trailer's state combination. Undefined state
    /// bits are masked off so corrupt trailers cannot index out of range.
    #[inline]
    pub fn state_index(&self) -> usize {
        self.packet_state as usize & (MAX_STATE_COMBINATIONS - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_roundtrip() {
        let header = GbtDataHeader::new(0x1234, 0b101);
        let mut word = [0u8; GBT_PADDED_WORD_LEN];
        header.write(&mut word[..GBT_WORD_LEN]);
        assert!(is_data_header(&word));
        assert!(!is_data_trailer(&word));
        assert_eq!(GbtDataHeader::from_buf(&word), header);
        // padding bytes stay zero
        assert_eq!(&word[GBT_WORD_LEN..], &[0; 6]);
    }

    #[test]
    fn trailer_roundtrip_masks_undefined_state_bits() {
        let trailer = GbtDataTrailer {
            lanes_timeout: 0b10,
            lanes_stop: 0b111,
            packet_state: 0xFF,
        };
        let mut word = [0u8; GBT_WORD_LEN];
        trailer.write(&mut word);
        assert!(is_data_trailer(&word));
        let back = GbtDataTrailer::from_buf(&word);
        assert_eq!(back.lanes_stop, 0b111);
        assert_eq!(back.lanes_timeout, 0b10);
        assert_eq!(back.packet_state, 0x1F);
        assert_eq!(back.state_index(), 0x1F);
    }

    #[test]
    fn lane_masks_are_28_bits() {
        let header = GbtDataHeader::new(0, 0xFFFF_FFFF);
        assert_eq!(header.lanes, 0x0FFF_FFFF);
    }

    #[test]
    fn payload_word_accessors() {
        let mut word = [0u8; GBT_WORD_LEN];
        word[..9].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        word[9] = GBT_FLAG_DATA_IB | 7;
        assert!(!is_data_header(&word));
        assert!(!is_data_trailer(&word));
        assert_eq!(cable_id(&word), 7);
        assert_eq!(payload(&word), &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn packet_done_is_bit_zero() {
        assert_eq!(1u8 << PacketState::Done as u8, 0x1);
        assert_eq!(MAX_STATE_COMBINATIONS, 32);
    }
}
