//! Interface to the detector-specific chip mapping, translating between
//! software chip IDs, readout units, cables and FEE IDs.
//!
//! The mapping tables themselves live outside this crate; the codec only
//! consumes the [`ChipMapping`] trait. [`LinearMapping`] is a dense
//! reference implementation used by the tests and examples.

use crate::words::gbt::GBT_FLAG_DATA_IB;
use serde::{Deserialize, Serialize};

/// Readout-unit flavour, deciding the cable-to-chip topology and the GBT
/// payload-word flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuType {
    /// Inner barrel: one chip per cable, cable index equals the chip's
    /// on-module ID.
    Ib,
    /// Middle barrel.
    Mb,
    /// Outer barrel.
    Ob,
}

/// Static description of one readout unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuInfo {
    /// Sequential software ID.
    pub id_sw: u16,
    /// Hardware ID (the FEE ID of link 0).
    pub id_hw: u16,
    /// Flavour of this RU.
    pub ru_type: RuType,
    /// Number of cables this RU reads out.
    pub n_cables: u8,
    /// Number of chips this RU reads out.
    pub n_chips: u16,
    /// Global software ID of the RU's first chip.
    pub first_chip_sw: u16,
}

/// Location of a chip within the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    /// Software ID of the RU reading the chip out.
    pub ru_sw: u16,
    /// Index of the chip on that RU.
    pub chip_on_ru: u16,
}

/// Cable wiring of one chip within its RU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipOnRuInfo {
    /// Index of the chip on the RU.
    pub id: u16,
    /// Software cable index.
    pub cable_sw: u8,
    /// Hardware cable ID, as tagged in GBT payload words.
    pub cable_hw: u8,
    /// Hardware ID of the chip within its module, as written in ALPIDE
    /// chip headers.
    pub chip_on_module_hw: u8,
}

/// Read-only mapping between software chip IDs, RU IDs, cable IDs and FEE
/// IDs. Implementations may be shared across codec instances.
pub trait ChipMapping {
    /// RU software ID for a FEE ID, if the FEE ID is known.
    fn fee_id_to_ru_sw(&self, fee_id: u16) -> Option<u16>;
    /// FEE ID of the given link of an RU.
    fn ru_sw_to_fee_id(&self, ru_sw: u16, link: u8) -> u16;
    /// Detector location of a global software chip ID.
    fn chip_info_sw(&self, chip_sw: u16) -> Option<ChipInfo>;
    /// Cable wiring of the chip with index `chip_on_ru` on an RU of the
    /// given flavour.
    fn chip_on_ru_info(&self, ru_type: RuType, chip_on_ru: u16) -> Option<ChipOnRuInfo>;
    /// Software cable index for a hardware cable ID.
    fn cable_hw_to_sw(&self, ru_type: RuType, cable_hw: u8) -> u8;
    /// Global software chip ID for a chip-local ID decoded from the given
    /// cable of the given RU.
    fn global_chip_id(&self, local_chip_id: u8, cable_hw: u8, ru_info: &RuInfo) -> u16;
    /// Number of readout units in the detector.
    fn n_rus(&self) -> usize;
    /// Number of chips served by an RU of the given flavour.
    fn n_chips_on_ru_type(&self, ru_type: RuType) -> u16;
    /// Lane mask of the cables present on an RU of the given flavour.
    fn cables_on_ru_type(&self, ru_type: RuType) -> u32;
    /// Static description of an RU, if the software ID is known.
    fn ru_info_sw(&self, ru_sw: u16) -> Option<RuInfo>;
    /// Content of the RDH detector field written by the encoder.
    fn ru_detector_field(&self) -> u32;
    /// Flag byte tagging payload words of the given cable in GBT frames.
    fn gbt_cable_flag(&self, ru_type: RuType, cable_hw: u8) -> u8;
}

impl<T: ChipMapping> ChipMapping for &T {
    fn fee_id_to_ru_sw(&self, fee_id: u16) -> Option<u16> {
        (*self).fee_id_to_ru_sw(fee_id)
    }
    fn ru_sw_to_fee_id(&self, ru_sw: u16, link: u8) -> u16 {
        (*self).ru_sw_to_fee_id(ru_sw, link)
    }
    fn chip_info_sw(&self, chip_sw: u16) -> Option<ChipInfo> {
        (*self).chip_info_sw(chip_sw)
    }
    fn chip_on_ru_info(&self, ru_type: RuType, chip_on_ru: u16) -> Option<ChipOnRuInfo> {
        (*self).chip_on_ru_info(ru_type, chip_on_ru)
    }
    fn cable_hw_to_sw(&self, ru_type: RuType, cable_hw: u8) -> u8 {
        (*self).cable_hw_to_sw(ru_type, cable_hw)
    }
    fn global_chip_id(&self, local_chip_id: u8, cable_hw: u8, ru_info: &RuInfo) -> u16 {
        (*self).global_chip_id(local_chip_id, cable_hw, ru_info)
    }
    fn n_rus(&self) -> usize {
        (*self).n_rus()
    }
    fn n_chips_on_ru_type(&self, ru_type: RuType) -> u16 {
        (*self).n_chips_on_ru_type(ru_type)
    }
    fn cables_on_ru_type(&self, ru_type: RuType) -> u32 {
        (*self).cables_on_ru_type(ru_type)
    }
    fn ru_info_sw(&self, ru_sw: u16) -> Option<RuInfo> {
        (*self).ru_info_sw(ru_sw)
    }
    fn ru_detector_field(&self) -> u32 {
        (*self).ru_detector_field()
    }
    fn gbt_cable_flag(&self, ru_type: RuType, cable_hw: u8) -> u8 {
        (*self).gbt_cable_flag(ru_type, cable_hw)
    }
}

/// Dense inner-barrel-style reference mapping: `n_rus` readout units, each
/// reading `chips_per_ru` chips over one cable per chip, with the cable
/// index equal to the chip's index on the RU. FEE IDs encode the link in
/// bits 8..10 and the RU in bits 0..8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearMapping {
    n_rus: usize,
    chips_per_ru: u16,
}

impl LinearMapping {
    /// Creates a mapping with `n_rus` RUs of `chips_per_ru` chips each.
    ///
    /// # Panics
    /// Panics if `chips_per_ru` exceeds the 9 lanes of an inner-barrel RU
    /// or `n_rus` exceeds the 8-bit RU field of the FEE ID.
    pub fn new(n_rus: usize, chips_per_ru: u16) -> Self {
        assert!(chips_per_ru >= 1 && chips_per_ru <= 9);
        assert!(n_rus >= 1 && n_rus <= 256);
        Self { n_rus, chips_per_ru }
    }
}

impl ChipMapping for LinearMapping {
    fn fee_id_to_ru_sw(&self, fee_id: u16) -> Option<u16> {
        let ru = fee_id & 0xFF;
        ((ru as usize) < self.n_rus).then_some(ru)
    }

    fn ru_sw_to_fee_id(&self, ru_sw: u16, link: u8) -> u16 {
        (ru_sw & 0xFF) | (u16::from(link) << 8)
    }

    fn chip_info_sw(&self, chip_sw: u16) -> Option<ChipInfo> {
        let ru_sw = chip_sw / self.chips_per_ru;
        ((ru_sw as usize) < self.n_rus).then_some(ChipInfo {
            ru_sw,
            chip_on_ru: chip_sw % self.chips_per_ru,
        })
    }

    fn chip_on_ru_info(&self, _ru_type: RuType, chip_on_ru: u16) -> Option<ChipOnRuInfo> {
        (chip_on_ru < self.chips_per_ru).then_some(ChipOnRuInfo {
            id: chip_on_ru,
            cable_sw: chip_on_ru as u8,
            cable_hw: chip_on_ru as u8,
            chip_on_module_hw: chip_on_ru as u8,
        })
    }

    fn cable_hw_to_sw(&self, _ru_type: RuType, cable_hw: u8) -> u8 {
        cable_hw
    }

    fn global_chip_id(&self, local_chip_id: u8, _cable_hw: u8, ru_info: &RuInfo) -> u16 {
        ru_info.first_chip_sw + u16::from(local_chip_id)
    }

    fn n_rus(&self) -> usize {
        self.n_rus
    }

    fn n_chips_on_ru_type(&self, _ru_type: RuType) -> u16 {
        self.chips_per_ru
    }

    fn cables_on_ru_type(&self, _ru_type: RuType) -> u32 {
        (1 << self.chips_per_ru) - 1
    }

    fn ru_info_sw(&self, ru_sw: u16) -> Option<RuInfo> {
        ((ru_sw as usize) < self.n_rus).then_some(RuInfo {
            id_sw: ru_sw,
            id_hw: self.ru_sw_to_fee_id(ru_sw, 0),
            ru_type: RuType::Ib,
            n_cables: self.chips_per_ru as u8,
            n_chips: self.chips_per_ru,
            first_chip_sw: ru_sw * self.chips_per_ru,
        })
    }

    fn ru_detector_field(&self) -> u32 {
        0
    }

    fn gbt_cable_flag(&self, _ru_type: RuType, cable_hw: u8) -> u8 {
        GBT_FLAG_DATA_IB | (cable_hw & 0x1F)
    }
}
