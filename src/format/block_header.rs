//! Block headers
//!
//! Per-block metadata stored in index blocks. A header is enough to decide
//! whether a block is worth reading without touching its values.

use crate::encoding::{decode_err, put_u64, put_varint, ByteReader, TimestampsMarshalType};
use crate::error::Result;
use crate::rows::StreamId;

use super::{MAX_COLUMNS_HEADER_INDEX_SIZE, MAX_COLUMNS_HEADER_SIZE, MAX_ROWS_PER_BLOCK, MAX_TIMESTAMPS_BLOCK_SIZE};

/// Location and range of a block's timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampsHeader {
    pub block_offset: u64,
    pub block_size: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub marshal_type: TimestampsMarshalType,
}

impl TimestampsHeader {
    pub const MARSHALED_SIZE: usize = 8 + 8 + 8 + 8 + 1;

    pub fn marshal(&self, dst: &mut Vec<u8>) {
        put_u64(dst, self.block_offset);
        put_u64(dst, self.block_size);
        put_u64(dst, self.min_timestamp as u64);
        put_u64(dst, self.max_timestamp as u64);
        dst.push(self.marshal_type as u8);
    }

    pub fn unmarshal(r: &mut ByteReader<'_>) -> Result<Self> {
        let th = Self {
            block_offset: r.read_u64()?,
            block_size: r.read_u64()?,
            min_timestamp: r.read_u64()? as i64,
            max_timestamp: r.read_u64()? as i64,
            marshal_type: TimestampsMarshalType::from_u8(r.read_u8()?)?,
        };
        if th.min_timestamp > th.max_timestamp {
            return Err(decode_err(format!(
                "min timestamp {} cannot exceed max timestamp {}",
                th.min_timestamp, th.max_timestamp
            )));
        }
        if th.block_size > MAX_TIMESTAMPS_BLOCK_SIZE {
            return Err(decode_err(format!(
                "too big timestamps block: {} bytes; cannot exceed {} bytes",
                th.block_size, MAX_TIMESTAMPS_BLOCK_SIZE
            )));
        }
        Ok(th)
    }
}

/// Per-block metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub stream_id: StreamId,
    pub uncompressed_size_bytes: u64,
    pub rows_count: u64,
    pub timestamps_header: TimestampsHeader,
    pub columns_header_index_offset: u64,
    pub columns_header_index_size: u64,
    pub columns_header_offset: u64,
    pub columns_header_size: u64,
}

impl BlockHeader {
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        self.stream_id.marshal(dst);
        put_varint(dst, self.uncompressed_size_bytes);
        put_varint(dst, self.rows_count);
        self.timestamps_header.marshal(dst);
        put_varint(dst, self.columns_header_index_offset);
        put_varint(dst, self.columns_header_index_size);
        put_varint(dst, self.columns_header_offset);
        put_varint(dst, self.columns_header_size);
    }

    pub fn unmarshal(r: &mut ByteReader<'_>) -> Result<Self> {
        let stream_id = StreamId::unmarshal(r)?;
        let uncompressed_size_bytes = r.read_varint()?;
        let rows_count = r.read_varint()?;
        if rows_count == 0 || rows_count > MAX_ROWS_PER_BLOCK as u64 {
            return Err(decode_err(format!(
                "invalid rows count {} in block header; must be in range [1..{}]",
                rows_count, MAX_ROWS_PER_BLOCK
            )));
        }
        let timestamps_header = TimestampsHeader::unmarshal(r)?;
        let bh = Self {
            stream_id,
            uncompressed_size_bytes,
            rows_count,
            timestamps_header,
            columns_header_index_offset: r.read_varint()?,
            columns_header_index_size: r.read_varint()?,
            columns_header_offset: r.read_varint()?,
            columns_header_size: r.read_varint()?,
        };
        if bh.columns_header_size > MAX_COLUMNS_HEADER_SIZE {
            return Err(decode_err(format!(
                "too big columns header: {} bytes; cannot exceed {} bytes",
                bh.columns_header_size, MAX_COLUMNS_HEADER_SIZE
            )));
        }
        if bh.columns_header_index_size > MAX_COLUMNS_HEADER_INDEX_SIZE {
            return Err(decode_err(format!(
                "too big columns header index: {} bytes; cannot exceed {} bytes",
                bh.columns_header_index_size, MAX_COLUMNS_HEADER_INDEX_SIZE
            )));
        }
        Ok(bh)
    }
}

/// Decode an index block and verify its headers are ordered
///
/// Stream ids must not decrease, and blocks of the same stream must not go
/// back in time.
pub fn unmarshal_block_headers(src: &[u8]) -> Result<Vec<BlockHeader>> {
    let mut r = ByteReader::new(src);
    let mut bhs: Vec<BlockHeader> = Vec::new();
    while !r.is_empty() {
        let bh = BlockHeader::unmarshal(&mut r)?;
        if let Some(prev) = bhs.last() {
            if bh.stream_id < prev.stream_id {
                return Err(decode_err(format!(
                    "block headers must be sorted by stream id; got {} after {}",
                    bh.stream_id, prev.stream_id
                )));
            }
            if bh.stream_id == prev.stream_id
                && bh.timestamps_header.min_timestamp < prev.timestamps_header.min_timestamp
            {
                return Err(decode_err(format!(
                    "blocks of stream {} must be sorted by min timestamp; got {} after {}",
                    bh.stream_id,
                    bh.timestamps_header.min_timestamp,
                    prev.timestamps_header.min_timestamp
                )));
            }
        }
        bhs.push(bh);
    }
    Ok(bhs)
}
