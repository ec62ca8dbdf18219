//! Index block headers
//!
//! The metaindex is a list of these, one per index block.

use crate::encoding::{decode_err, put_u64, ByteReader};
use crate::error::Result;
use crate::rows::StreamId;

use super::MAX_INDEX_BLOCK_SIZE;

/// Summary of a run of block headers flushed together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBlockHeader {
    /// Stream of the first block in the run
    pub stream_id: StreamId,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub index_block_offset: u64,
    pub index_block_size: u64,
}

impl IndexBlockHeader {
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        self.stream_id.marshal(dst);
        put_u64(dst, self.min_timestamp as u64);
        put_u64(dst, self.max_timestamp as u64);
        put_u64(dst, self.index_block_offset);
        put_u64(dst, self.index_block_size);
    }

    pub fn unmarshal(r: &mut ByteReader<'_>) -> Result<Self> {
        let ih = Self {
            stream_id: StreamId::unmarshal(r)?,
            min_timestamp: r.read_u64()? as i64,
            max_timestamp: r.read_u64()? as i64,
            index_block_offset: r.read_u64()?,
            index_block_size: r.read_u64()?,
        };
        if ih.min_timestamp > ih.max_timestamp {
            return Err(decode_err(format!(
                "index block min timestamp {} cannot exceed max timestamp {}",
                ih.min_timestamp, ih.max_timestamp
            )));
        }
        if ih.index_block_size > MAX_INDEX_BLOCK_SIZE {
            return Err(decode_err(format!(
                "too big index block: {} bytes; cannot exceed {} bytes",
                ih.index_block_size, MAX_INDEX_BLOCK_SIZE
            )));
        }
        Ok(ih)
    }

    /// Whether the run may hold rows in `[min_ts, max_ts]`
    pub fn overlaps(&self, min_ts: i64, max_ts: i64) -> bool {
        self.min_timestamp <= max_ts && self.max_timestamp >= min_ts
    }
}

/// Decode a metaindex and verify index blocks are ordered by stream id
pub fn unmarshal_index_block_headers(src: &[u8]) -> Result<Vec<IndexBlockHeader>> {
    let mut r = ByteReader::new(src);
    let mut ihs: Vec<IndexBlockHeader> = Vec::new();
    while !r.is_empty() {
        let ih = IndexBlockHeader::unmarshal(&mut r)?;
        if let Some(prev) = ihs.last() {
            if ih.stream_id < prev.stream_id {
                return Err(decode_err(format!(
                    "index block headers must be sorted by stream id; got {} after {}",
                    ih.stream_id, prev.stream_id
                )));
            }
        }
        ihs.push(ih);
    }
    Ok(ihs)
}
