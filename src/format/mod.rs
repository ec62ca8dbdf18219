//! Format Module
//!
//! The binary layout of a part.
//!
//! ## Responsibilities
//! - Size limits every writer and reader enforces
//! - File names inside a part directory
//! - Block construction and its serialized form (`Block`, `BlockData`)
//! - Headers: block, timestamps, column, index block and part headers
//! - Column-name dictionary and shard index table
//!
//! ## Part Directory
//!
//! ```text
//! {part}/
//!   ├── metadata.json             part header (JSON)
//!   ├── metaindex.bin             index block headers (zstd)
//!   ├── index.bin                 block headers grouped into index blocks (zstd)
//!   ├── columns_header_index.bin  column name ids and offsets per block
//!   ├── columns_header.bin        column headers per block
//!   ├── timestamps.bin            timestamps per block
//!   ├── column_names.bin          column name dictionary (zstd)
//!   ├── column_idxs.bin           column id -> shard table (zstd)
//!   ├── message_bloom.bin         bloom filters of the message column
//!   ├── message_values.bin        values of the message column
//!   ├── bloom.bin.N               bloom filters of shard N
//!   └── values.bin.N              values of shard N
//! ```

mod block;
mod block_data;
mod block_header;
mod column_header;
mod column_names;
mod index_block_header;
mod part_header;

pub use block::{uncompressed_row_size_bytes, Block, Column};
pub use block_data::{BlockData, ColumnData, TimestampsData};
pub use block_header::{unmarshal_block_headers, BlockHeader, TimestampsHeader};
pub use column_header::{ColumnHeader, ColumnHeaderRef, ColumnsHeader, ColumnsHeaderIndex};
pub use column_names::{
    marshal_column_idxs, marshal_column_names, unmarshal_column_idxs, unmarshal_column_names,
    ColumnNameIdGenerator,
};
pub use index_block_header::{unmarshal_index_block_headers, IndexBlockHeader};
pub use part_header::PartHeader;

use std::path::{Path, PathBuf};

// =============================================================================
// Limits
// =============================================================================

/// Most rows a single block may hold
pub const MAX_ROWS_PER_BLOCK: usize = 8 * 1024;

/// Target uncompressed size of a block
pub const MAX_UNCOMPRESSED_BLOCK_SIZE: u64 = 2 * 1024 * 1024;

/// Block headers are flushed as an index block once they exceed this size
pub const MAX_UNCOMPRESSED_INDEX_BLOCK_SIZE: usize = 128 * 1024;

/// Most distinct columns in a block, counting const columns
pub const MAX_COLUMNS_PER_BLOCK: usize = 2_000;

/// Longest field name accepted at ingestion
pub const MAX_FIELD_NAME_SIZE: usize = 128;

/// Longest value that may be stored as a const column
pub const MAX_CONST_COLUMN_VALUE_SIZE: usize = 256;

pub const MAX_INDEX_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
pub const MAX_TIMESTAMPS_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
pub const MAX_VALUES_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
pub const MAX_BLOOM_FILTER_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
pub const MAX_COLUMNS_HEADER_SIZE: u64 = 8 * 1024 * 1024;
pub const MAX_COLUMNS_HEADER_INDEX_SIZE: u64 = 8 * 1024 * 1024;

/// Bloom/values shard pairs a file part may spread its columns over
pub const BLOOM_VALUES_MAX_SHARDS_COUNT: u64 = 128;

/// Format version written by this crate; the only one it reads
pub const PART_FORMAT_LATEST_VERSION: u32 = 3;

// =============================================================================
// File Names
// =============================================================================

pub const METADATA_FILENAME: &str = "metadata.json";
pub const METAINDEX_FILENAME: &str = "metaindex.bin";
pub const INDEX_FILENAME: &str = "index.bin";
pub const COLUMNS_HEADER_INDEX_FILENAME: &str = "columns_header_index.bin";
pub const COLUMNS_HEADER_FILENAME: &str = "columns_header.bin";
pub const TIMESTAMPS_FILENAME: &str = "timestamps.bin";
pub const COLUMN_NAMES_FILENAME: &str = "column_names.bin";
pub const COLUMN_IDXS_FILENAME: &str = "column_idxs.bin";
pub const MESSAGE_BLOOM_FILENAME: &str = "message_bloom.bin";
pub const MESSAGE_VALUES_FILENAME: &str = "message_values.bin";
pub const BLOOM_FILENAME: &str = "bloom.bin";
pub const VALUES_FILENAME: &str = "values.bin";

/// Partition-level list of file parts
pub const PARTS_FILENAME: &str = "parts.json";

/// `bloom.bin.N` inside `part_path`
pub fn bloom_shard_path(part_path: &Path, shard: u64) -> PathBuf {
    part_path.join(format!("{}.{}", BLOOM_FILENAME, shard))
}

/// `values.bin.N` inside `part_path`
pub fn values_shard_path(part_path: &Path, shard: u64) -> PathBuf {
    part_path.join(format!("{}.{}", VALUES_FILENAME, shard))
}
