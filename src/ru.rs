//! Per-readout-unit state shared by the encode and decode paths: link page
//! buffers, cable streams, chip scratch and statistics, held in a densely
//! packed slab indexed by a sparse `ru_sw -> slot` table.

use crate::buffer::PayloadBuffer;
use crate::mapping::{ChipMapping, RuInfo};
use crate::pixel::ChipPixelData;
use crate::stats::RuDecodingStats;
use crate::{MAX_CABLES_PER_RU, MAX_LINKS_PER_RU};

/// Page buffer and counters of one GBT link.
#[derive(Debug, Default)]
pub struct RuLink {
    /// Page-framed data of this link.
    pub data: PayloadBuffer,
    /// Size of the last added page, the offset from the buffer end back to
    /// its RDH.
    pub last_page_size: usize,
    /// Decode side: number of cached triggers (the last one may be
    /// incomplete). Encode side: number of accumulated pages.
    pub n_triggers: i32,
    /// Lanes served by this link.
    pub lanes: u32,
}

/// Decode/encode state of one readout unit.
#[derive(Debug)]
pub struct RuDecodeData {
    /// Per-cable streams in ALPIDE format, one slot per software cable.
    pub cable_data: Vec<PayloadBuffer>,
    /// Hardware ID of the cable whose data sits in the corresponding slot.
    pub cable_hw_id: [u8; MAX_CABLES_PER_RU],
    /// Chips of the current trigger: decoded output, or encoder scratch.
    pub chips_data: Vec<ChipPixelData>,
    /// Link slots, populated on first sighting of a link.
    pub links: [Option<RuLink>; MAX_LINKS_PER_RU],
    /// Decoding statistics of this RU.
    pub stats: RuDecodingStats,
    /// Number of cables participating in the current trigger.
    pub n_cables: usize,
    /// Number of chips with data or errors in the current trigger.
    pub n_chips_fired: usize,
    /// Serving cursor into `chips_data`.
    pub last_chip_checked: usize,
    /// Static description of this RU.
    pub ru_info: RuInfo,
}

impl RuDecodeData {
    /// Creates the state for the described RU.
    pub fn new(ru_info: RuInfo) -> Self {
        Self {
            cable_data: (0..MAX_CABLES_PER_RU).map(|_| PayloadBuffer::new()).collect(),
            cable_hw_id: [0; MAX_CABLES_PER_RU],
            chips_data: Vec::new(),
            links: Default::default(),
            stats: RuDecodingStats::default(),
            n_cables: 0,
            n_chips_fired: 0,
            last_chip_checked: 0,
            ru_info,
        }
    }

    /// Clears the per-trigger cable scratch.
    pub fn clear_trigger(&mut self) {
        for cable in self.cable_data[..self.n_cables].iter_mut() {
            cable.clear();
        }
        self.n_cables = 0;
    }

    /// Clears trigger scratch and statistics; link buffers are kept.
    pub fn clear(&mut self) {
        self.clear_trigger();
        self.stats.clear();
        self.chips_data.clear();
        self.n_chips_fired = 0;
        self.last_chip_checked = 0;
    }
}

/// Densely packed slab of RU states with a sparse `ru_sw -> slot` index,
/// -1 meaning the RU has not been sighted yet.
#[derive(Debug, Default)]
pub struct RuSlab {
    /// The RU states, in first-sighted order.
    pub rus: Vec<RuDecodeData>,
    /// `ru_sw -> slot` index.
    pub entry: Vec<i32>,
}

impl RuSlab {
    /// Creates an empty slab for a detector of `n_rus` readout units.
    pub fn new(n_rus: usize) -> Self {
        Self {
            rus: Vec::new(),
            entry: vec![-1; n_rus],
        }
    }

    /// Number of RUs sighted so far.
    pub fn len(&self) -> usize {
        self.rus.len()
    }

    /// True when no RU has been sighted.
    pub fn is_empty(&self) -> bool {
        self.rus.is_empty()
    }

    /// Slot of the RU with the given software ID, if sighted.
    pub fn slot(&self, ru_sw: u16) -> Option<usize> {
        self.entry
            .get(ru_sw as usize)
            .and_then(|e| (*e >= 0).then_some(*e as usize))
    }

    /// Slot of the RU with the given software ID, creating its state on
    /// first sighting. `None` if the mapping does not know the RU.
    pub fn get_or_create<M: ChipMapping>(&mut self, ru_sw: u16, map: &M) -> Option<usize> {
        if let Some(slot) = self.slot(ru_sw) {
            return Some(slot);
        }
        if ru_sw as usize >= self.entry.len() {
            return None;
        }
        let info = map.ru_info_sw(ru_sw)?;
        let slot = self.rus.len();
        self.rus.push(RuDecodeData::new(info));
        self.entry[ru_sw as usize] = slot as i32;
        log::debug!("defining container for RU {ru_sw} at slot {slot}");
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::LinearMapping;
    use pretty_assertions::assert_eq;

    #[test]
    fn slab_creates_slots_in_sighting_order() {
        let map = LinearMapping::new(8, 4);
        let mut slab = RuSlab::new(8);
        assert_eq!(slab.slot(5), None);
        assert_eq!(slab.get_or_create(5, &map), Some(0));
        assert_eq!(slab.get_or_create(2, &map), Some(1));
        assert_eq!(slab.get_or_create(5, &map), Some(0));
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.rus[0].ru_info.id_sw, 5);
    }

    #[test]
    fn slab_rejects_unknown_rus() {
        let map = LinearMapping::new(2, 4);
        let mut slab = RuSlab::new(2);
        assert_eq!(slab.get_or_create(7, &map), None);
        assert!(slab.is_empty());
    }

    #[test]
    fn clear_trigger_resets_only_active_cables() {
        let map = LinearMapping::new(1, 4);
        let mut slab = RuSlab::new(1);
        let slot = slab.get_or_create(0, &map).unwrap();
        let ru = &mut slab.rus[slot];
        ru.n_cables = 2;
        ru.cable_data[0].add_bytes(&[1, 2]);
        ru.cable_data[1].add_bytes(&[3]);
        ru.clear_trigger();
        assert_eq!(ru.n_cables, 0);
        assert_eq!(ru.cable_data[0].size(), 0);
        assert_eq!(ru.cable_data[1].size(), 0);
    }
}
