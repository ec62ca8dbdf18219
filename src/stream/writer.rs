//! Block stream writer
//!
//! Produces a part from blocks handed over in `(stream id, min timestamp)`
//! order.
//!
//! ## Responsibilities
//! - Write block sections through `StreamWriters`
//! - Group block headers into zstd index blocks and describe them in the metaindex
//! - Track part-wide totals and produce the final `PartHeader`

use std::path::{Path, PathBuf};

use crate::encoding::compress_zstd;
use crate::error::{LogDbError, Result};
use crate::format::{
    Block, BlockData, IndexBlockHeader, PartHeader, MAX_INDEX_BLOCK_SIZE, MAX_ROWS_PER_BLOCK,
    MAX_UNCOMPRESSED_INDEX_BLOCK_SIZE, PART_FORMAT_LATEST_VERSION,
};
use crate::fsutil;
use crate::part::InmemoryPart;
use crate::rows::{Field, StreamId};

use super::streams::StreamWriters;

/// Result of finalizing a `BlockStreamWriter`
#[derive(Debug)]
pub enum FinalizedPart {
    Inmemory(InmemoryPart),
    File { path: PathBuf, header: PartHeader },
}

impl FinalizedPart {
    pub fn header(&self) -> &PartHeader {
        match self {
            FinalizedPart::Inmemory(mp) => mp.header(),
            FinalizedPart::File { header, .. } => header,
        }
    }
}

/// Writes blocks into a new part
pub struct BlockStreamWriter {
    streams: StreamWriters,
    part_path: Option<PathBuf>,

    // Last written block, used to enforce ordering
    last: Option<(StreamId, i64)>,

    // Current index block
    index_block_data: Vec<u8>,
    index_block_first_sid: StreamId,
    index_block_min_timestamp: i64,
    index_block_max_timestamp: i64,

    metaindex_data: Vec<u8>,

    // Part-wide totals
    uncompressed_size_bytes: u64,
    rows_count: u64,
    blocks_count: u64,
    min_timestamp: i64,
    max_timestamp: i64,
}

impl BlockStreamWriter {
    /// Writer producing an in-memory part
    pub fn for_inmemory_part() -> Self {
        Self::new(StreamWriters::in_memory(), None)
    }

    /// Writer producing a file part in the existing empty directory `path`
    pub fn create_file_part(path: &Path) -> Result<Self> {
        let streams = StreamWriters::create_dir(path)?;
        Ok(Self::new(streams, Some(path.to_path_buf())))
    }

    fn new(streams: StreamWriters, part_path: Option<PathBuf>) -> Self {
        Self {
            streams,
            part_path,
            last: None,
            index_block_data: Vec::new(),
            index_block_first_sid: StreamId::default(),
            index_block_min_timestamp: 0,
            index_block_max_timestamp: 0,
            metaindex_data: Vec::new(),
            uncompressed_size_bytes: 0,
            rows_count: 0,
            blocks_count: 0,
            min_timestamp: 0,
            max_timestamp: 0,
        }
    }

    /// Write rows of `sid` sorted by timestamp, splitting them into full blocks
    pub fn write_rows(&mut self, sid: &StreamId, timestamps: &[i64], rows: &[Vec<Field>]) -> Result<()> {
        if timestamps.len() != rows.len() {
            return Err(LogDbError::InvariantViolation(format!(
                "timestamps count {} does not match rows count {}",
                timestamps.len(),
                rows.len()
            )));
        }
        for (ts, rows) in timestamps
            .chunks(MAX_ROWS_PER_BLOCK)
            .zip(rows.chunks(MAX_ROWS_PER_BLOCK))
        {
            let block = Block::from_rows(ts, rows)?;
            self.write_block(sid, &block)?;
        }
        Ok(())
    }

    pub fn write_block(&mut self, sid: &StreamId, block: &Block) -> Result<()> {
        if block.rows_count() == 0 {
            return Ok(());
        }
        let bd = block.encode(sid)?;
        self.write_block_data(&bd)
    }

    /// Write an already encoded block as-is
    pub fn write_block_data(&mut self, bd: &BlockData) -> Result<()> {
        if bd.rows_count == 0 || bd.rows_count > MAX_ROWS_PER_BLOCK as u64 {
            return Err(LogDbError::InvariantViolation(format!(
                "block rows count must be in 1..={}; got {}",
                MAX_ROWS_PER_BLOCK, bd.rows_count
            )));
        }
        let sid = bd.stream_id;
        let min_ts = bd.timestamps.min_timestamp;
        let max_ts = bd.timestamps.max_timestamp;
        if let Some((last_sid, last_min_ts)) = self.last {
            if sid < last_sid {
                return Err(LogDbError::InvariantViolation(format!(
                    "blocks must be sorted by stream id; got {} after {}",
                    sid, last_sid
                )));
            }
            if sid == last_sid && min_ts < last_min_ts {
                return Err(LogDbError::InvariantViolation(format!(
                    "blocks of stream {} must be sorted by min timestamp; got {} after {}",
                    sid, min_ts, last_min_ts
                )));
            }
        }

        let bh = bd.write_to(&mut self.streams)?;

        if self.index_block_data.is_empty() {
            self.index_block_first_sid = sid;
            self.index_block_min_timestamp = min_ts;
            self.index_block_max_timestamp = max_ts;
        } else {
            self.index_block_min_timestamp = self.index_block_min_timestamp.min(min_ts);
            self.index_block_max_timestamp = self.index_block_max_timestamp.max(max_ts);
        }
        if self.blocks_count == 0 {
            self.min_timestamp = min_ts;
            self.max_timestamp = max_ts;
        } else {
            self.min_timestamp = self.min_timestamp.min(min_ts);
            self.max_timestamp = self.max_timestamp.max(max_ts);
        }
        self.uncompressed_size_bytes += bd.uncompressed_size_bytes;
        self.rows_count += bd.rows_count;
        self.blocks_count += 1;
        self.last = Some((sid, min_ts));

        bh.marshal(&mut self.index_block_data);
        if self.index_block_data.len() > MAX_UNCOMPRESSED_INDEX_BLOCK_SIZE {
            self.flush_index_block()?;
        }
        Ok(())
    }

    pub fn rows_count(&self) -> u64 {
        self.rows_count
    }

    pub fn blocks_count(&self) -> u64 {
        self.blocks_count
    }

    /// Flush what is left, write the trailing files and close the part
    pub fn finalize(mut self) -> Result<FinalizedPart> {
        self.flush_index_block()?;
        self.streams.write_column_dictionaries()?;

        let metaindex = compress_zstd(&self.metaindex_data)?;
        self.streams.metaindex.write_all(&metaindex)?;

        let header = PartHeader {
            format_version: PART_FORMAT_LATEST_VERSION,
            compressed_size_bytes: self.streams.total_bytes_written(),
            uncompressed_size_bytes: self.uncompressed_size_bytes,
            rows_count: self.rows_count,
            blocks_count: self.blocks_count,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            bloom_values_shards_count: self.streams.shards_count(),
        };

        let files = self.streams.finish()?;
        match (self.part_path, files) {
            (Some(path), _) => {
                header.write_to_dir(&path)?;
                fsutil::sync_dir(&path)?;
                Ok(FinalizedPart::File { path, header })
            }
            (None, Some(files)) => Ok(FinalizedPart::Inmemory(InmemoryPart::new(header, files))),
            (None, None) => Err(LogDbError::InvariantViolation(
                "in-memory writer produced no buffers".to_string(),
            )),
        }
    }

    fn flush_index_block(&mut self) -> Result<()> {
        if self.index_block_data.is_empty() {
            return Ok(());
        }
        let data = compress_zstd(&self.index_block_data)?;
        if data.len() as u64 > MAX_INDEX_BLOCK_SIZE {
            return Err(LogDbError::InvariantViolation(format!(
                "too big index block: {} bytes; cannot exceed {} bytes",
                data.len(),
                MAX_INDEX_BLOCK_SIZE
            )));
        }
        let ih = IndexBlockHeader {
            stream_id: self.index_block_first_sid,
            min_timestamp: self.index_block_min_timestamp,
            max_timestamp: self.index_block_max_timestamp,
            index_block_offset: self.streams.index.bytes_written(),
            index_block_size: data.len() as u64,
        };
        self.streams.index.write_all(&data)?;
        ih.marshal(&mut self.metaindex_data);
        self.index_block_data.clear();
        Ok(())
    }
}
