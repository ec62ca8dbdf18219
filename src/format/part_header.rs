//! Part header
//!
//! Part-level counters stored as JSON in `metadata.json`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LogDbError, Result};
use crate::fsutil;

use super::{BLOOM_VALUES_MAX_SHARDS_COUNT, METADATA_FILENAME, PART_FORMAT_LATEST_VERSION};

/// Part metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartHeader {
    pub format_version: u32,

    /// Bytes of all part files except the metadata itself
    pub compressed_size_bytes: u64,

    /// Estimated size of the rows as text
    pub uncompressed_size_bytes: u64,

    pub rows_count: u64,
    pub blocks_count: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub bloom_values_shards_count: u64,
}

impl PartHeader {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Internal consistency checks applied whenever a header is read
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.format_version != PART_FORMAT_LATEST_VERSION {
            return Err(format!(
                "unsupported part format version {}; only version {} is supported",
                self.format_version, PART_FORMAT_LATEST_VERSION
            ));
        }
        if self.min_timestamp > self.max_timestamp {
            return Err(format!(
                "MinTimestamp={} cannot exceed MaxTimestamp={}",
                self.min_timestamp, self.max_timestamp
            ));
        }
        if self.blocks_count > self.rows_count {
            return Err(format!(
                "BlocksCount={} cannot exceed RowsCount={}",
                self.blocks_count, self.rows_count
            ));
        }
        if self.bloom_values_shards_count > BLOOM_VALUES_MAX_SHARDS_COUNT {
            return Err(format!(
                "BloomValuesShardsCount={} cannot exceed {}",
                self.bloom_values_shards_count, BLOOM_VALUES_MAX_SHARDS_COUNT
            ));
        }
        Ok(())
    }

    /// Read and validate `metadata.json` of the part at `part_path`
    pub fn read_from_dir(part_path: &Path) -> Result<Self> {
        let path = part_path.join(METADATA_FILENAME);
        let data = fs::read(&path)?;
        let ph: PartHeader = serde_json::from_slice(&data).map_err(|e| {
            LogDbError::corruption(&path, format!("cannot parse part header: {}", e))
        })?;
        ph.validate()
            .map_err(|msg| LogDbError::corruption(&path, msg))?;
        Ok(ph)
    }

    /// Atomically write `metadata.json` into `part_path`
    pub fn write_to_dir(&self, part_path: &Path) -> Result<()> {
        let data = serde_json::to_vec(self)?;
        fsutil::write_file_atomic(&part_path.join(METADATA_FILENAME), &data)
    }
}
