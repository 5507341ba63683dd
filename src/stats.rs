//! Decoding statistics: per-RU protocol-violation counters and global
//! throughput counters. Plain records; printing is a caller responsibility,
//! the [`Display`](std::fmt::Display) impls only format.

use crate::words::gbt::{MAX_STATE_COMBINATIONS, N_PACKET_STATES};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The protocol violations counted per readout unit during decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuDecodingError {
    /// RDH page counters of the same RU/trigger are not continuous.
    PageCounterDiscontinuity,
    /// RDH and GBT header page counters are not consistent.
    RdhVsGbtPageCnt,
    /// GBT payload header was expected but not found.
    MissingGbtHeader,
    /// GBT payload trailer was expected but not found.
    MissingGbtTrailer,
    /// All lanes were stopped but the page counter is not 0.
    NonZeroPageAfterStop,
    /// End of FEE data reached while not all lanes received stop.
    UnstoppedLanes,
    /// Data was received for a stopped lane.
    DataForStoppedLane,
    /// No data was seen for a lane which was not in timeout.
    NoDataForActiveLane,
    /// Chip ID on the module differs from the lane ID on the IB stave.
    IbChipLaneMismatch,
    /// Cable data does not start with a chip header or empty chip.
    CableDataHeadWrong,
}

impl RuDecodingError {
    /// Number of defined error kinds.
    pub const COUNT: usize = 10;

    /// Every kind, in counter order.
    pub const ALL: [RuDecodingError; Self::COUNT] = [
        RuDecodingError::PageCounterDiscontinuity,
        RuDecodingError::RdhVsGbtPageCnt,
        RuDecodingError::MissingGbtHeader,
        RuDecodingError::MissingGbtTrailer,
        RuDecodingError::NonZeroPageAfterStop,
        RuDecodingError::UnstoppedLanes,
        RuDecodingError::DataForStoppedLane,
        RuDecodingError::NoDataForActiveLane,
        RuDecodingError::IbChipLaneMismatch,
        RuDecodingError::CableDataHeadWrong,
    ];

    /// Human readable description of the violation.
    pub fn description(self) -> &'static str {
        match self {
            RuDecodingError::PageCounterDiscontinuity => {
                "RDH page counters for the same RU/trigger are not continuous"
            }
            RuDecodingError::RdhVsGbtPageCnt => {
                "RDH and GBT header page counters are not consistent"
            }
            RuDecodingError::MissingGbtHeader => {
                "GBT payload header was expected but not found"
            }
            RuDecodingError::MissingGbtTrailer => {
                "GBT payload trailer was expected but not found"
            }
            RuDecodingError::NonZeroPageAfterStop => {
                "All lanes were stopped but the page counter is not 0"
            }
            RuDecodingError::UnstoppedLanes => {
                "End of FEE data reached while not all lanes received stop"
            }
            RuDecodingError::DataForStoppedLane => "Data was received for stopped lane",
            RuDecodingError::NoDataForActiveLane => {
                "No data was seen for lane (which was not in timeout)"
            }
            RuDecodingError::IbChipLaneMismatch => {
                "Chip ID (on module) was different from the lane ID on the IB stave"
            }
            RuDecodingError::CableDataHeadWrong => {
                "Cable data does not start with ChipHeader or ChipEmpty"
            }
        }
    }
}

impl fmt::Display for RuDecodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Per-RU decoding statistics: lane bookkeeping, error counters and the
/// packet-state histogram.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuDecodingStats {
    /// Lanes declared by the payload header.
    pub lanes_active: u32,
    /// Lanes that received stop in the payload trailer.
    pub lanes_stop: u32,
    /// Lanes that received timeout.
    pub lanes_timeout: u32,
    /// Lanes with data transmitted.
    pub lanes_with_data: u32,
    /// Total number of packets (multi-page trigger chunks) seen.
    pub n_packets: u32,
    /// Error counters, indexed in [`RuDecodingError::ALL`] order.
    pub error_counts: [u32; RuDecodingError::COUNT],
    /// Packet states from the trailers, one slot per state combination.
    pub packet_states: [u32; MAX_STATE_COMBINATIONS],
}

impl RuDecodingStats {
    /// Bumps the counter of the given violation.
    #[inline]
    pub fn count(&mut self, err: RuDecodingError) {
        self.error_counts[err as usize] += 1;
    }

    /// Counter value of the given violation.
    #[inline]
    pub fn errors(&self, err: RuDecodingError) -> u32 {
        self.error_counts[err as usize]
    }

    /// Sum of all error counters.
    pub fn n_errors(&self) -> u64 {
        self.error_counts.iter().map(|c| u64::from(*c)).sum()
    }

    /// Resets every counter and mask.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for RuDecodingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Decoding errors: {}", self.n_errors())?;
        for (kind, count) in RuDecodingError::ALL.iter().zip(self.error_counts.iter()) {
            if *count > 0 {
                writeln!(f, "{desc:<70}: {count}", desc = kind.description())?;
            }
        }
        writeln!(
            f,
            "Packet states statistics (total packets: {})",
            self.n_packets
        )?;
        for state in self
            .packet_states
            .iter()
            .positions(|count| *count > 0)
            .collect_vec()
        {
            writeln!(
                f,
                "counts for triggers B[{state:0width$b}] : {count}",
                width = N_PACKET_STATES,
                count = self.packet_states[state],
            )?;
        }
        Ok(())
    }
}

/// Global decoding statistics, monotonically updated while pulling chips.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDecodingStats {
    /// Total number of pages processed.
    pub n_pages_processed: u64,
    /// Total number of RUs processed (one RU may take several pages).
    pub n_rus_processed: u64,
    /// Total number of payload bytes (RDH memory size) processed.
    pub n_bytes_processed: u64,
    /// Number of non-empty chips found.
    pub n_non_empty_chips: u64,
    /// Number of pixel hits decoded.
    pub n_hits_decoded: u64,
}

impl RawDecodingStats {
    /// Resets every counter.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for RawDecodingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{bytes} bytes for {rus} RUs processed in {pages} pages",
            bytes = self.n_bytes_processed,
            rus = self.n_rus_processed,
            pages = self.n_pages_processed
        )?;
        write!(
            f,
            "{hits} hits found in {chips} non-empty chips",
            hits = self.n_hits_decoded,
            chips = self.n_non_empty_chips
        )
    }
}
