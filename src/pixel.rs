//! Pixel-level data model shared by the encode and decode paths.

use serde::{Deserialize, Serialize};

/// Trigger-type bit assignments carried in the RDH trigger field.
pub mod trigger {
    /// Orbit marker.
    pub const ORBIT: u32 = 0x1;
    /// Heartbeat.
    pub const HB: u32 = 0x2;
    /// Heartbeat reject.
    pub const HBR: u32 = 0x4;
    /// Health check.
    pub const HC: u32 = 0x8;
    /// Physics trigger.
    pub const PHYSICS: u32 = 0x10;
    /// Pre-pulse.
    pub const PP: u32 = 0x20;
    /// Calibration trigger.
    pub const CAL: u32 = 0x40;
    /// Start of triggered data.
    pub const SOT: u32 = 0x80;
    /// End of triggered data.
    pub const EOT: u32 = 0x100;
    /// Start of continuous data.
    pub const SOC: u32 = 0x200;
    /// End of continuous data.
    pub const EOC: u32 = 0x400;
    /// Time frame delimiter.
    pub const TF: u32 = 0x800;
}

/// Error flags recorded in [`ChipPixelData`] when the cable stream violates
/// the chip framing.
pub mod chip_error {
    /// An unknown or out-of-place byte was found in the cable stream.
    pub const UNKNOWN_WORD: u8 = 0x1;
    /// The cable stream ended inside a chip frame.
    pub const TRUNCATED_FRAME: u8 = 0x2;
}

/// (orbit, bunch crossing) pair identifying one LHC interaction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRecord {
    /// 32-bit LHC orbit counter.
    pub orbit: u32,
    /// Bunch crossing within the orbit, 12 bits.
    pub bc: u16,
}

/// A single fired pixel within a chip.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PixelData {
    row: u16,
    col: u16,
}

impl PixelData {
    /// Creates a pixel at (row, col) in chip-local coordinates.
    pub fn new(row: u16, col: u16) -> Self {
        Self { row, col }
    }

    /// Row within the chip.
    #[inline]
    pub fn row(&self) -> u16 {
        self.row
    }

    /// Column within the chip.
    #[inline]
    pub fn col(&self) -> u16 {
        self.col
    }
}

/// A pixel hit tagged with its chip index, the encoder's input granule.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digit {
    /// Software (global) chip index.
    pub chip: u16,
    /// Row within the chip.
    pub row: u16,
    /// Column within the chip.
    pub col: u16,
}

impl Digit {
    /// Creates a digit for pixel (row, col) of the given chip.
    pub fn new(chip: u16, row: u16, col: u16) -> Self {
        Self { chip, row, col }
    }
}

/// Pixel data of a single chip for a single trigger.
///
/// On the decode path the chip ID is first the ID local to the cable and is
/// remapped to the global software ID before the data reaches the caller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChipPixelData {
    chip_id: u16,
    trigger: u32,
    interaction: InteractionRecord,
    pixels: Vec<PixelData>,
    error_flags: u8,
    error_byte: u8,
}

impl ChipPixelData {
    /// Chip ID (cable-local during decoding, global after remapping).
    #[inline]
    pub fn chip_id(&self) -> u16 {
        self.chip_id
    }

    /// Sets the chip ID.
    pub fn set_chip_id(&mut self, id: u16) {
        self.chip_id = id;
    }

    /// Trigger-type bits of the trigger this chip was read out for.
    #[inline]
    pub fn trigger(&self) -> u32 {
        self.trigger
    }

    /// Stamps the trigger-type bits.
    pub fn set_trigger(&mut self, trigger: u32) {
        self.trigger = trigger;
    }

    /// Interaction record of the trigger this chip was read out for.
    #[inline]
    pub fn interaction(&self) -> InteractionRecord {
        self.interaction
    }

    /// Stamps the interaction record.
    pub fn set_interaction(&mut self, ir: InteractionRecord) {
        self.interaction = ir;
    }

    /// The decoded (or to-be-encoded) pixels, ordered by (row, col).
    #[inline]
    pub fn pixels(&self) -> &[PixelData] {
        &self.pixels
    }

    /// Appends a pixel.
    pub fn push_pixel(&mut self, pixel: PixelData) {
        self.pixels.push(pixel);
    }

    /// Error flag bits, see [`chip_error`]. Zero for a clean chip.
    #[inline]
    pub fn error_flags(&self) -> u8 {
        self.error_flags
    }

    /// The stream byte that caused the first recorded error.
    #[inline]
    pub fn error_byte(&self) -> u8 {
        self.error_byte
    }

    /// Records an error, keeping the byte of the first one.
    pub fn add_error(&mut self, flags: u8, byte: u8) {
        if self.error_flags == 0 {
            self.error_byte = byte;
        }
        self.error_flags |= flags;
    }

    /// True if any error was recorded while decoding this chip.
    #[inline]
    pub fn has_errors(&self) -> bool {
        self.error_flags != 0
    }

    /// Resets the container for reuse.
    pub fn clear(&mut self) {
        self.chip_id = 0;
        self.trigger = 0;
        self.interaction = InteractionRecord::default();
        self.pixels.clear();
        self.error_flags = 0;
        self.error_byte = 0;
    }
}
