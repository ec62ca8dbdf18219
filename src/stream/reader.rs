//! Block stream reader
//!
//! Scans a part block by block in storage order. Every structural claim made
//! by the headers is cross-checked while reading; any mismatch is reported as
//! corruption of the part.

use std::path::{Path, PathBuf};

use crate::encoding::decompress_zstd;
use crate::error::{LogDbError, Result};
use crate::format::{
    unmarshal_block_headers, unmarshal_index_block_headers, BlockData, BlockHeader,
    IndexBlockHeader, PartHeader,
};
use crate::part::InmemoryPart;

use super::streams::StreamReaders;

/// Sequential reader over all blocks of one part
pub struct BlockStreamReader {
    streams: StreamReaders,
    header: PartHeader,
    path: PathBuf,

    index_block_headers: Vec<IndexBlockHeader>,
    next_index_block: usize,

    block_headers: Vec<BlockHeader>,
    next_block: usize,
    current_index_block: Option<IndexBlockHeader>,

    block_data: Option<BlockData>,
    last: Option<BlockHeader>,

    rows_read: u64,
    blocks_read: u64,
    uncompressed_size_read: u64,
}

impl BlockStreamReader {
    pub fn from_inmemory_part(mp: &InmemoryPart) -> Result<Self> {
        let streams = StreamReaders::from_inmemory(mp.files(), mp.header())?;
        Self::new(streams, *mp.header(), PathBuf::from("inmemory"))
    }

    pub fn open_file_part(path: &Path) -> Result<Self> {
        let header = PartHeader::read_from_dir(path)?;
        let streams = StreamReaders::open_dir(path, &header)?;
        Self::new(streams, header, path.to_path_buf())
    }

    fn new(mut streams: StreamReaders, header: PartHeader, path: PathBuf) -> Result<Self> {
        let data = streams.metaindex.read_to_end()?;
        let data = decompress_zstd(&data).map_err(|e| e.with_path(streams.metaindex.path()))?;
        let index_block_headers = unmarshal_index_block_headers(&data)
            .map_err(|e| e.with_path(streams.metaindex.path()))?;
        Ok(Self {
            streams,
            header,
            path,
            index_block_headers,
            next_index_block: 0,
            block_headers: Vec::new(),
            next_block: 0,
            current_index_block: None,
            block_data: None,
            last: None,
            rows_read: 0,
            blocks_read: 0,
            uncompressed_size_read: 0,
        })
    }

    pub fn header(&self) -> &PartHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block loaded by the last successful `next_block`
    pub fn block_data(&self) -> Option<&BlockData> {
        self.block_data.as_ref()
    }

    /// Move the current block out of the reader
    pub fn take_block_data(&mut self) -> Option<BlockData> {
        self.block_data.take()
    }

    /// Advance to the next block; `Ok(false)` once the part is exhausted
    pub fn next_block(&mut self) -> Result<bool> {
        while self.next_block >= self.block_headers.len() {
            if !self.read_next_index_block()? {
                self.check_totals()?;
                self.block_data = None;
                return Ok(false);
            }
        }
        let bh = self.block_headers[self.next_block].clone();
        self.next_block += 1;

        if let Some(prev) = &self.last {
            if bh.stream_id < prev.stream_id {
                return Err(self.corruption(format!(
                    "blocks must be sorted by stream id; got {} after {}",
                    bh.stream_id, prev.stream_id
                )));
            }
            let min_ts = bh.timestamps_header.min_timestamp;
            let prev_min_ts = prev.timestamps_header.min_timestamp;
            if bh.stream_id == prev.stream_id && min_ts < prev_min_ts {
                return Err(self.corruption(format!(
                    "blocks of stream {} must be sorted by min timestamp; got {} after {}",
                    bh.stream_id, min_ts, prev_min_ts
                )));
            }
        }
        if let Some(ih) = &self.current_index_block {
            let th = &bh.timestamps_header;
            if th.min_timestamp < ih.min_timestamp || th.max_timestamp > ih.max_timestamp {
                return Err(self.corruption(format!(
                    "block time range [{}, {}] is outside its index block range [{}, {}]",
                    th.min_timestamp, th.max_timestamp, ih.min_timestamp, ih.max_timestamp
                )));
            }
        }

        let bd = BlockData::read_from(&bh, &mut self.streams)?;

        self.rows_read += bh.rows_count;
        self.blocks_read += 1;
        self.uncompressed_size_read += bh.uncompressed_size_bytes;
        if self.rows_read > self.header.rows_count {
            return Err(self.corruption(format!(
                "read {} rows; part header claims {}",
                self.rows_read, self.header.rows_count
            )));
        }
        if self.blocks_read > self.header.blocks_count {
            return Err(self.corruption(format!(
                "read {} blocks; part header claims {}",
                self.blocks_read, self.header.blocks_count
            )));
        }
        if self.uncompressed_size_read > self.header.uncompressed_size_bytes {
            return Err(self.corruption(format!(
                "read {} uncompressed bytes; part header claims {}",
                self.uncompressed_size_read, self.header.uncompressed_size_bytes
            )));
        }

        self.last = Some(bh);
        self.block_data = Some(bd);
        Ok(true)
    }

    fn read_next_index_block(&mut self) -> Result<bool> {
        let Some(ih) = self.index_block_headers.get(self.next_index_block).copied() else {
            return Ok(false);
        };
        self.next_index_block += 1;

        if ih.min_timestamp < self.header.min_timestamp || ih.max_timestamp > self.header.max_timestamp {
            return Err(self.corruption(format!(
                "index block time range [{}, {}] is outside the part range [{}, {}]",
                ih.min_timestamp, ih.max_timestamp, self.header.min_timestamp, self.header.max_timestamp
            )));
        }
        let index = &self.streams.index;
        if index.bytes_read() != ih.index_block_offset {
            return Err(LogDbError::corruption(
                index.path(),
                format!(
                    "unexpected index block offset; got {}; want {}",
                    ih.index_block_offset,
                    index.bytes_read()
                ),
            ));
        }
        let data = self.streams.index.read_exact(ih.index_block_size as usize)?;
        let index_path = self.streams.index.path().to_path_buf();
        let data = decompress_zstd(&data).map_err(|e| e.with_path(&index_path))?;
        let bhs = unmarshal_block_headers(&data).map_err(|e| e.with_path(&index_path))?;
        if bhs.is_empty() {
            return Err(LogDbError::corruption(&index_path, "empty index block"));
        }
        if bhs[0].stream_id != ih.stream_id {
            return Err(LogDbError::corruption(
                &index_path,
                format!(
                    "index block starts with stream {}; metaindex claims {}",
                    bhs[0].stream_id, ih.stream_id
                ),
            ));
        }
        self.block_headers = bhs;
        self.next_block = 0;
        self.current_index_block = Some(ih);
        Ok(true)
    }

    fn check_totals(&self) -> Result<()> {
        let ph = &self.header;
        if self.rows_read != ph.rows_count {
            return Err(self.corruption(format!(
                "read {} rows; part header claims {}",
                self.rows_read, ph.rows_count
            )));
        }
        if self.blocks_read != ph.blocks_count {
            return Err(self.corruption(format!(
                "read {} blocks; part header claims {}",
                self.blocks_read, ph.blocks_count
            )));
        }
        if self.uncompressed_size_read != ph.uncompressed_size_bytes {
            return Err(self.corruption(format!(
                "read {} uncompressed bytes; part header claims {}",
                self.uncompressed_size_read, ph.uncompressed_size_bytes
            )));
        }
        let bytes_read = self.streams.total_bytes_read();
        if bytes_read != ph.compressed_size_bytes {
            return Err(self.corruption(format!(
                "read {} compressed bytes; part header claims {}",
                bytes_read, ph.compressed_size_bytes
            )));
        }
        Ok(())
    }

    fn corruption(&self, message: String) -> LogDbError {
        LogDbError::corruption(&self.path, message)
    }
}
