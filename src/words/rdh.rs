//! Struct definition and heuristic validation of the Raw Data Header (RDH)
//! prefixing every CRU page.

use super::ByteSlice;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt::{self, Display};
use std::io;

/// The size of an RDH in bytes.
pub const RDH_SIZE_BYTES: usize = 64;
/// RDH version stamped by the encoder.
pub const RDH_VERSION: u8 = 4;

/// The Raw Data Header.
///
/// 64 bytes, little-endian, fixed field offsets. The six `reserved*` fields
/// are zero in every valid header and back the resynchronisation heuristic.
#[repr(packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rdh {
    /// Header version.
    pub version: u8,
    /// Header size in bytes, always [`RDH_SIZE_BYTES`].
    pub header_size: u8,
    /// Block length, kept at the 0xFFFF sentinel.
    pub block_length: u16,
    /// Front-end electronics ID, maps to (RU, link).
    pub fee_id: u16,
    /// Priority bit.
    pub priority: u8,
    /// Reserved, zero.
    pub reserved0: u8,
    /// Offset to the next RDH in bytes.
    pub offset_to_next: u16,
    /// Bytes of this page actually in use, RDH included.
    pub memory_size: u16,
    /// GBT link within the CRU.
    pub link_id: u8,
    /// CRU packet counter.
    pub packet_counter: u8,
    /// CRU ID, 12 bits used.
    pub cru_id: u16,
    /// Orbit of the trigger.
    pub trigger_orbit: u32,
    /// Orbit of the heartbeat frame.
    pub heartbeat_orbit: u32,
    /// Reserved, zero.
    pub reserved1: u64,
    /// Bunch crossing of the trigger, 12 bits used.
    pub trigger_bc: u16,
    /// Bunch crossing of the heartbeat frame, 12 bits used.
    pub heartbeat_bc: u16,
    /// Trigger type bitfield, see [`crate::pixel::trigger`].
    pub trigger_type: u32,
    /// Reserved, zero.
    pub reserved2: u64,
    /// Detector-specific field.
    pub detector_field: u32,
    /// Pause-and-reset field.
    pub par: u16,
    /// Stop bit, set on the last page of a trigger.
    pub stop: u8,
    /// Reserved, zero.
    pub reserved3: u8,
    /// Page counter within a trigger, 0-based.
    pub page_cnt: u16,
    /// Reserved, zero.
    pub reserved4: u16,
    /// Reserved, zero.
    pub reserved5: u32,
}

impl Default for Rdh {
    fn default() -> Self {
        Self {
            version: RDH_VERSION,
            header_size: RDH_SIZE_BYTES as u8,
            block_length: 0xFFFF,
            fee_id: 0,
            priority: 0,
            reserved0: 0,
            offset_to_next: 0,
            memory_size: RDH_SIZE_BYTES as u16,
            link_id: 0,
            packet_counter: 0,
            cru_id: 0,
            trigger_orbit: 0,
            heartbeat_orbit: 0,
            reserved1: 0,
            trigger_bc: 0,
            heartbeat_bc: 0,
            trigger_type: 0,
            reserved2: 0,
            detector_field: 0,
            par: 0,
            stop: 0,
            reserved3: 0,
            page_cnt: 0,
            reserved4: 0,
            reserved5: 0,
        }
    }
}

impl ByteSlice for Rdh {}

impl Rdh {
    /// Deserializes an RDH from a byte slice of at least [`RDH_SIZE_BYTES`].
    #[inline]
    pub fn from_buf(buf: &[u8]) -> Result<Self, io::Error> {
        if buf.len() < RDH_SIZE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("RDH needs {RDH_SIZE_BYTES} bytes, got {}", buf.len()),
            ));
        }
        Ok(Rdh {
            version: buf[0],
            header_size: buf[1],
            block_length: LittleEndian::read_u16(&buf[2..=3]),
            fee_id: LittleEndian::read_u16(&buf[4..=5]),
            priority: buf[6],
            reserved0: buf[7],
            offset_to_next: LittleEndian::read_u16(&buf[8..=9]),
            memory_size: LittleEndian::read_u16(&buf[10..=11]),
            link_id: buf[12],
            packet_counter: buf[13],
            cru_id: LittleEndian::read_u16(&buf[14..=15]),
            trigger_orbit: LittleEndian::read_u32(&buf[16..=19]),
            heartbeat_orbit: LittleEndian::read_u32(&buf[20..=23]),
            reserved1: LittleEndian::read_u64(&buf[24..=31]),
            trigger_bc: LittleEndian::read_u16(&buf[32..=33]),
            heartbeat_bc: LittleEndian::read_u16(&buf[34..=35]),
            trigger_type: LittleEndian::read_u32(&buf[36..=39]),
            reserved2: LittleEndian::read_u64(&buf[40..=47]),
            detector_field: LittleEndian::read_u32(&buf[48..=51]),
            par: LittleEndian::read_u16(&buf[52..=53]),
            stop: buf[54],
            reserved3: buf[55],
            page_cnt: LittleEndian::read_u16(&buf[56..=57]),
            reserved4: LittleEndian::read_u16(&buf[58..=59]),
            reserved5: LittleEndian::read_u32(&buf[60..=63]),
        })
    }

    /// Deserializes an RDH from a reader.
    #[inline]
    pub fn load<T: io::Read>(reader: &mut T) -> Result<Self, io::Error> {
        let buf = super::macros::load_bytes!(64, reader);
        Self::from_buf(&buf)
    }

    /// Heuristic check whether `buf` plausibly starts with an RDH, without
    /// deserializing: the header size must match and the six reserved words
    /// must all be zero. Advisory, drives the resync scan.
    #[inline]
    pub fn peek_heuristic(buf: &[u8]) -> bool {
        if buf.len() < RDH_SIZE_BYTES {
            return false;
        }
        buf[1] == RDH_SIZE_BYTES as u8
            && buf[7] == 0
            && buf[24..32].iter().all(|b| *b == 0)
            && buf[40..48].iter().all(|b| *b == 0)
            && buf[55] == 0
            && buf[58..64].iter().all(|b| *b == 0)
    }

    /// Heuristic check of a deserialized header, see
    /// [`peek_heuristic`](Self::peek_heuristic).
    #[inline]
    pub fn sanity_check(&self) -> bool {
        self.header_size == RDH_SIZE_BYTES as u8
            && self.reserved0 == 0
            && self.reserved1 == 0
            && self.reserved2 == 0
            && self.reserved3 == 0
            && self.reserved4 == 0
            && self.reserved5 == 0
    }

    /// True when `newer` continues the same RU/trigger described by `self`:
    /// a page with counter 0, a different FEE or a different trigger
    /// identity starts a new trigger.
    #[inline]
    pub fn is_same_ru_and_trigger(&self, newer: &Rdh) -> bool {
        let (tt_old, tt_new) = (self.trigger_type, newer.trigger_type);
        !(newer.page_cnt == 0
            || newer.fee_id != self.fee_id
            || newer.trigger_orbit != self.trigger_orbit
            || newer.trigger_bc != self.trigger_bc
            || newer.heartbeat_orbit != self.heartbeat_orbit
            || newer.heartbeat_bc != self.heartbeat_bc
            || tt_new & tt_old == 0)
    }

    /// Payload size in bytes, the memory size minus the RDH itself.
    #[inline]
    pub fn payload_size(&self) -> u16 {
        self.memory_size - RDH_SIZE_BYTES as u16
    }
}

impl Display for Rdh {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let tmp_fee = self.fee_id;
        let tmp_offset = self.offset_to_next;
        let tmp_mem = self.memory_size;
        let tmp_orbit = self.trigger_orbit;
        let tmp_bc = self.trigger_bc;
        let tmp_trig = self.trigger_type;
        let tmp_pages = self.page_cnt;
        write!(
            f,
            "{version:<6}{size:<7}{tmp_fee:<7}{tmp_offset:<8}{tmp_mem:<7}{link:<6}{tmp_orbit}_{tmp_bc:<6}{trig:<10}{tmp_pages:<9}{stop:<5}",
            version = self.version,
            size = self.header_size,
            link = self.link_id,
            trig = format!("{tmp_trig:#x}"),
            stop = self.stop,
        )
    }
}

/// Formats a two-line column header matching the [`Display`] row layout.
pub fn rdh_header_text_with_indent_to_string(indent: usize) -> String {
    let header_text_top = "RDH   Header FEE    Offset  Mem    Link  Orbit_BC    Trigger   Pages    Stop";
    let header_text_bot = "ver   size   ID     next    size   ID                type      counter  bit";
    format!("{:indent$}{header_text_top}\n{:indent$}{header_text_bot}\n", "", "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn example_rdh() -> Rdh {
        Rdh {
            fee_id: 0x0102,
            offset_to_next: 8192,
            memory_size: 0x13E0,
            link_id: 2,
            trigger_orbit: 0xB7DD575,
            heartbeat_orbit: 0xB7DD575,
            trigger_bc: 0x2A,
            heartbeat_bc: 0x2A,
            trigger_type: 0x10,
            page_cnt: 3,
            ..Default::default()
        }
    }

    #[test]
    fn rdh_layout_is_64_bytes() {
        assert_eq!(std::mem::size_of::<Rdh>(), RDH_SIZE_BYTES);
    }

    #[test]
    fn rdh_serde_roundtrip() {
        let rdh = example_rdh();
        let bytes = rdh.to_byte_slice().to_vec();
        assert_eq!(bytes.len(), RDH_SIZE_BYTES);
        let back = Rdh::from_buf(&bytes).unwrap();
        assert_eq!(rdh, back);
        let loaded = Rdh::load(&mut &bytes[..]).unwrap();
        assert_eq!(rdh, loaded);
    }

    #[test]
    fn field_offsets_match_the_wire_contract() {
        let rdh = example_rdh();
        let bytes = rdh.to_byte_slice();
        assert_eq!(bytes[1], 64);
        assert_eq!(LittleEndian::read_u16(&bytes[4..6]), 0x0102);
        assert_eq!(LittleEndian::read_u16(&bytes[8..10]), 8192);
        assert_eq!(LittleEndian::read_u16(&bytes[10..12]), 0x13E0);
        assert_eq!(bytes[12], 2);
        assert_eq!(LittleEndian::read_u32(&bytes[16..20]), 0xB7DD575);
        assert_eq!(LittleEndian::read_u16(&bytes[32..34]), 0x2A);
        assert_eq!(LittleEndian::read_u32(&bytes[36..40]), 0x10);
        assert_eq!(LittleEndian::read_u16(&bytes[56..58]), 3);
    }

    #[test]
    fn heuristic_accepts_valid_and_rejects_garbage() {
        let rdh = example_rdh();
        assert!(rdh.sanity_check());
        assert!(Rdh::peek_heuristic(rdh.to_byte_slice()));

        let mut corrupt = rdh.to_byte_slice().to_vec();
        corrupt[25] = 0xDE; // inside reserved1
        assert!(!Rdh::peek_heuristic(&corrupt));
        let mut wrong_size = rdh.to_byte_slice().to_vec();
        wrong_size[1] = 0x20;
        assert!(!Rdh::peek_heuristic(&wrong_size));
        assert!(!Rdh::peek_heuristic(&[0u8; 32]));
    }

    #[test]
    fn same_trigger_continuation() {
        let first = example_rdh();
        let mut cont = first;
        cont.page_cnt = 4;
        assert!(first.is_same_ru_and_trigger(&cont));

        // counter wrap to 0 means a new trigger
        let mut fresh = first;
        fresh.page_cnt = 0;
        assert!(!first.is_same_ru_and_trigger(&fresh));

        let mut other_fee = cont;
        other_fee.fee_id = 0x0103;
        assert!(!first.is_same_ru_and_trigger(&other_fee));

        let mut other_orbit = cont;
        other_orbit.trigger_orbit = 1;
        assert!(!first.is_same_ru_and_trigger(&other_orbit));

        let mut no_common_trigger_bits = cont;
        no_common_trigger_bits.trigger_type = 0x800;
        assert!(!first.is_same_ru_and_trigger(&no_common_trigger_bits));
    }
}
