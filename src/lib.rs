#![warn(missing_docs)]
#![warn(unused_extern_crates)]
// Readability lints
#![warn(
    clippy::option_filter_map,
    clippy::manual_filter_map,
    clippy::if_not_else,
    clippy::nonminimal_bool,
    clippy::range_plus_one,
    clippy::int_plus_one,
    clippy::needless_continue
)]
// Safety lints
#![warn(unused_import_braces)]
#![warn(trivial_casts, trivial_numeric_casts)]

//! Bidirectional codec for the ALPIDE pixel-detector raw data format, as
//! transported over GBT links and encapsulated in CRU pages.
//!
//! Two inverse operations are provided over the same wire format:
//!
//! * **Encoding** ([`RawPixelEncoder`]): per-chip pixel records of a single
//!   trigger become a sequence of CRU pages, each carrying a Raw Data Header
//!   ([`words::rdh::Rdh`]), a GBT payload header, 80-bit GBT data words
//!   multiplexing the cables of a readout unit, and a GBT payload trailer.
//! * **Decoding** ([`RawPixelDecoder`]): an arbitrary byte stream of CRU
//!   pages is reassembled into per-link multi-page trigger payloads,
//!   demultiplexed back into per-cable byte streams and decoded into
//!   per-chip pixel records, while a family of structural invariants is
//!   validated and violations are counted per readout unit.
//!
//! The detector-specific wiring (chip IDs vs. cables vs. FEE IDs) is
//! consumed through the [`mapping::ChipMapping`] trait; a dense reference
//! mapping ([`mapping::LinearMapping`]) is provided for tests and examples.
//!
//! # Example
//!
//! ```
//! use alpide_raw::prelude::*;
//!
//! let map = LinearMapping::new(1, 9);
//! let cfg = CodecConfig::default();
//!
//! // one pixel on chip 0
//! let digits = vec![Digit::new(0, 5, 9)];
//! let mut encoder = RawPixelEncoder::new(map.clone(), &cfg);
//! encoder
//!     .digits_to_raw(&digits, InteractionRecord { orbit: 7, bc: 42 }, 0, 0)
//!     .unwrap();
//! let mut sink = PayloadBuffer::new();
//! encoder.flush_superpages(usize::MAX, &mut sink);
//!
//! let mut decoder = RawPixelDecoder::new(map, &cfg);
//! decoder.open(sink.as_slice());
//! let chip = decoder.next_chip_data().unwrap();
//! assert_eq!(chip.chip_id(), 0);
//! assert_eq!(chip.pixels()[0].row(), 5);
//! ```

use serde::{Deserialize, Serialize};

pub mod alpide;
pub mod buffer;
pub mod decode;
pub mod encode;
pub mod mapping;
pub mod pixel;
pub mod ru;
pub mod stats;
pub mod words;

pub use alpide::{AlpideCoder, ChipDecode};
pub use buffer::PayloadBuffer;
pub use decode::RawPixelDecoder;
pub use encode::RawPixelEncoder;
pub use pixel::{ChipPixelData, Digit, InteractionRecord, PixelData};

/// Max number of GBT links per readout unit.
pub const MAX_LINKS_PER_RU: usize = 3;
/// Max number of cables a readout unit can read out.
pub const MAX_CABLES_PER_RU: usize = 28;
/// Max number of chips a readout unit can read out.
pub const MAX_CHIPS_PER_RU: usize = 196;
/// Max size of a CRU page in bytes (8 KB).
pub const MAX_PAGE_BYTES: usize = 8 * 1024;
/// Number of CRU pages per superpage.
pub const CRU_PAGES_PER_SUPERPAGE: usize = 256;

/// Stream-level options, frozen when a codec instance is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Interpret/emit GBT words as padded to 128 bits (16 bytes) instead of
    /// the bare 80 bits (10 bytes).
    pub padding_128: bool,
    /// Pad every written page to [`MAX_PAGE_BYTES`].
    pub impose_max_page: bool,
    /// Number of triggers to buffer per link before decoding starts.
    /// Clamped to at least one more than [`CRU_PAGES_PER_SUPERPAGE`].
    pub min_triggers_to_cache: usize,
    /// Debug-print level, 0 is silent.
    pub verbose: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            padding_128: true,
            impose_max_page: true,
            min_triggers_to_cache: CRU_PAGES_PER_SUPERPAGE + 10,
            verbose: 0,
        }
    }
}

/// Re-exports of the types needed by most users of the crate.
pub mod prelude {
    pub use crate::alpide::{AlpideCoder, ChipDecode};
    pub use crate::buffer::PayloadBuffer;
    pub use crate::decode::RawPixelDecoder;
    pub use crate::encode::RawPixelEncoder;
    pub use crate::mapping::{ChipMapping, LinearMapping, RuInfo, RuType};
    pub use crate::pixel::{trigger, ChipPixelData, Digit, InteractionRecord, PixelData};
    pub use crate::stats::{RawDecodingStats, RuDecodingError, RuDecodingStats};
    pub use crate::words::rdh::Rdh;
    pub use crate::CodecConfig;
    pub use crate::{
        CRU_PAGES_PER_SUPERPAGE, MAX_CABLES_PER_RU, MAX_CHIPS_PER_RU, MAX_LINKS_PER_RU,
        MAX_PAGE_BYTES,
    };
}
