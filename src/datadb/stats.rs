//! Partition statistics
//!
//! Plain counters meant for metrics exporters. `Datadb::update_stats` adds
//! to them, so one `DatadbStats` can aggregate several partitions.

use serde::Serialize;

/// Counters of one part tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    /// Merges producing a part of this tier, counted when they start.
    /// Merges postponed for lack of disk space are not counted.
    pub merges_total: u64,
    pub active_merges: u64,
    /// Rows written by completed merges producing this tier
    pub rows_merged: u64,

    pub rows_count: u64,
    pub parts_count: u64,
    pub blocks_count: u64,
    pub compressed_size_bytes: u64,
    pub uncompressed_size_bytes: u64,
}

/// Counters of a partition, split by tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatadbStats {
    pub inmemory: TierStats,
    pub small: TierStats,
    pub big: TierStats,

    /// Rows sitting in the row buffer, not yet in any part
    pub pending_rows: u64,
}

impl DatadbStats {
    pub fn rows_count(&self) -> u64 {
        self.tiers().map(|t| t.rows_count).sum()
    }

    pub fn parts_count(&self) -> u64 {
        self.tiers().map(|t| t.parts_count).sum()
    }

    pub fn blocks_count(&self) -> u64 {
        self.tiers().map(|t| t.blocks_count).sum()
    }

    pub fn compressed_size_bytes(&self) -> u64 {
        self.tiers().map(|t| t.compressed_size_bytes).sum()
    }

    pub fn uncompressed_size_bytes(&self) -> u64 {
        self.tiers().map(|t| t.uncompressed_size_bytes).sum()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn tiers(&self) -> impl Iterator<Item = &TierStats> {
        [&self.inmemory, &self.small, &self.big].into_iter()
    }
}
