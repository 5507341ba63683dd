//! Word definitions for the ALPIDE chip data stream carried on the cables.

/// Chip header flag: `1010<chip id[3:0]>`, followed by the bunch-counter byte.
pub const CHIP_HEADER: u8 = 0xA0;
/// Empty-chip flag: `1110<chip id[3:0]>`, followed by the bunch-counter byte.
pub const CHIP_EMPTY: u8 = 0xE0;
/// Chip trailer flag: `1011<readout flags[3:0]>`.
pub const CHIP_TRAILER: u8 = 0xB0;
/// Region header flag: `110<region id[4:0]>`.
pub const REGION_HEADER: u8 = 0xC0;
/// 16-bit data-short flag: `01<encoder id[3:0]><addr[9:0]>`.
pub const DATA_SHORT: u16 = 0x4000;
/// 16-bit data-long flag: `00<encoder id[3:0]><addr[9:0]>`, followed by
/// `0<hit map[6:0]>`.
pub const DATA_LONG: u16 = 0x0000;
/// Busy-on word.
pub const BUSY_ON: u8 = 0xF0;
/// Busy-off word.
pub const BUSY_OFF: u8 = 0xF1;

/// Chip ID bits in chip header/empty words.
pub const MASK_CHIP_ID: u8 = 0x0F;
/// Readout-flag bits in the chip trailer.
pub const MASK_ROFLAGS: u8 = 0x0F;
/// Region ID bits in the region header.
pub const MASK_REGION: u8 = 0x1F;
/// Encoder (double column) ID bits within 16-bit data words.
pub const MASK_ENCODER: u16 = 0x3C00;
/// Pixel address bits within 16-bit data words.
pub const MASK_PIX_ID: u16 = 0x03FF;
/// Hit-map bits in the third byte of a data-long word.
pub const MASK_HIT_MAP: u8 = 0x7F;
/// Bit position of the encoder ID within 16-bit data words.
pub const ENCODER_SHIFT: u16 = 10;

/// Number of pixel columns covered by one region.
pub const COLS_PER_REGION: u16 = 32;
/// Number of regions per chip.
pub const N_REGIONS: u16 = 32;
/// Number of addressable pixel rows per chip.
pub const N_ROWS: u16 = 512;
/// Number of pixel columns per chip.
pub const N_COLS: u16 = N_REGIONS * COLS_PER_REGION;

/// All the possible words that can be found in the ALPIDE data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpideWord {
    /// Opens the frame of a chip with hits.
    ChipHeader,
    /// Entire frame of a chip without hits.
    ChipEmpty,
    /// Closes the frame of a chip with hits.
    ChipTrailer,
    /// Selects the region for the following data words.
    RegionHeader,
    /// A single pixel.
    DataShort,
    /// A pixel plus a hit map of up to 7 neighbours.
    DataLong,
    /// Chip entered busy state.
    BusyOn,
    /// Chip left busy state.
    BusyOff,
}

impl AlpideWord {
    /// Classifies a word from its first byte.
    pub fn from_byte(b: u8) -> Result<AlpideWord, ()> {
        match b {
            // Exact matches
            BUSY_ON => Ok(AlpideWord::BusyOn),
            BUSY_OFF => Ok(AlpideWord::BusyOff),
            four_msb => match four_msb & 0xF0 {
                // Match on the 4 MSB
                CHIP_HEADER => Ok(AlpideWord::ChipHeader),
                CHIP_EMPTY => Ok(AlpideWord::ChipEmpty),
                CHIP_TRAILER => Ok(AlpideWord::ChipTrailer),
                three_msb => match three_msb & 0xE0 {
                    // Match on the 3 MSB
                    REGION_HEADER => Ok(AlpideWord::RegionHeader),
                    two_msb => match two_msb & 0xC0 {
                        // Match on the 2 MSB
                        0x40 => Ok(AlpideWord::DataShort),
                        0x00 => Ok(AlpideWord::DataLong),
                        _ => Err(()),
                    },
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_every_flavour() {
        assert_eq!(AlpideWord::from_byte(0xA3), Ok(AlpideWord::ChipHeader));
        assert_eq!(AlpideWord::from_byte(0xE5), Ok(AlpideWord::ChipEmpty));
        assert_eq!(AlpideWord::from_byte(0xB0), Ok(AlpideWord::ChipTrailer));
        assert_eq!(AlpideWord::from_byte(0xC7), Ok(AlpideWord::RegionHeader));
        assert_eq!(AlpideWord::from_byte(0x41), Ok(AlpideWord::DataShort));
        assert_eq!(AlpideWord::from_byte(0x00), Ok(AlpideWord::DataLong));
        assert_eq!(AlpideWord::from_byte(0x3F), Ok(AlpideWord::DataLong));
        assert_eq!(AlpideWord::from_byte(0xF0), Ok(AlpideWord::BusyOn));
        assert_eq!(AlpideWord::from_byte(0xF1), Ok(AlpideWord::BusyOff));
        // reserved range
        assert_eq!(AlpideWord::from_byte(0xF7), Err(()));
    }
}
