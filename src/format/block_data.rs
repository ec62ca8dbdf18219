//! Serialized block
//!
//! `BlockData` is a block in its encoded form. Merges copy it between parts
//! without decoding when no rows have to be interleaved.

use crate::error::{LogDbError, Result};
use crate::rows::{Field, StreamId};
use crate::stream::{StreamReader, StreamReaders, StreamWriters};
use crate::values::{ValueType, ValuesDict};
use crate::encoding::TimestampsMarshalType;

use super::block_header::{BlockHeader, TimestampsHeader};
use super::column_header::{ColumnHeader, ColumnsHeader, ColumnsHeaderIndex};
use super::{
    MAX_BLOOM_FILTER_BLOCK_SIZE, MAX_COLUMNS_HEADER_INDEX_SIZE, MAX_COLUMNS_HEADER_SIZE,
    MAX_TIMESTAMPS_BLOCK_SIZE, MAX_VALUES_BLOCK_SIZE,
};

/// Encoded timestamps of a block
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampsData {
    pub data: Vec<u8>,
    pub marshal_type: TimestampsMarshalType,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

/// Encoded values of one column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnData {
    pub name: String,
    pub value_type: ValueType,
    pub min_value: u64,
    pub max_value: u64,
    pub dict: ValuesDict,
    pub values_data: Vec<u8>,
    /// Empty for dict columns
    pub bloom_filter_data: Vec<u8>,
}

/// One block in its on-disk encoding
#[derive(Debug, Clone, PartialEq)]
pub struct BlockData {
    pub stream_id: StreamId,
    pub uncompressed_size_bytes: u64,
    pub rows_count: u64,
    pub timestamps: TimestampsData,
    pub columns: Vec<ColumnData>,
    pub const_columns: Vec<Field>,
}

impl BlockData {
    /// Write the block to `sw` and return the header describing where it went
    ///
    /// Sections exceeding their size ceiling are a caller bug and are
    /// reported as `InvariantViolation`.
    pub fn write_to(&self, sw: &mut StreamWriters) -> Result<BlockHeader> {
        let ts = &self.timestamps;
        check_size(ts.data.len(), MAX_TIMESTAMPS_BLOCK_SIZE, "timestamps block")?;
        let timestamps_header = TimestampsHeader {
            block_offset: sw.timestamps.bytes_written(),
            block_size: ts.data.len() as u64,
            min_timestamp: ts.min_timestamp,
            max_timestamp: ts.max_timestamp,
            marshal_type: ts.marshal_type,
        };
        sw.timestamps.write_all(&ts.data)?;

        let mut csh = ColumnsHeader {
            column_headers: Vec::with_capacity(self.columns.len()),
            const_columns: self.const_columns.clone(),
        };
        for cd in &self.columns {
            csh.column_headers.push(cd.write_to(sw)?);
        }

        let mut cshi = ColumnsHeaderIndex::default();
        let mut csh_data = Vec::new();
        csh.marshal(&mut csh_data, &mut cshi, &mut sw.column_name_ids)?;
        check_size(csh_data.len(), MAX_COLUMNS_HEADER_SIZE, "columns header")?;
        let mut cshi_data = Vec::new();
        cshi.marshal(&mut cshi_data);
        check_size(cshi_data.len(), MAX_COLUMNS_HEADER_INDEX_SIZE, "columns header index")?;

        let bh = BlockHeader {
            stream_id: self.stream_id,
            uncompressed_size_bytes: self.uncompressed_size_bytes,
            rows_count: self.rows_count,
            timestamps_header,
            columns_header_index_offset: sw.columns_header_index.bytes_written(),
            columns_header_index_size: cshi_data.len() as u64,
            columns_header_offset: sw.columns_header.bytes_written(),
            columns_header_size: csh_data.len() as u64,
        };
        sw.columns_header.write_all(&csh_data)?;
        sw.columns_header_index.write_all(&cshi_data)?;
        Ok(bh)
    }

    /// Read the block described by `bh` from `sr`
    ///
    /// Every section must start exactly where the previous read stopped.
    pub fn read_from(bh: &BlockHeader, sr: &mut StreamReaders) -> Result<Self> {
        let th = &bh.timestamps_header;
        check_offset(&sr.timestamps, th.block_offset, "timestamps")?;
        let ts_data = sr.timestamps.read_exact(th.block_size as usize)?;

        check_offset(&sr.columns_header_index, bh.columns_header_index_offset, "columns header index")?;
        let cshi_data = sr
            .columns_header_index
            .read_exact(bh.columns_header_index_size as usize)?;
        let cshi = ColumnsHeaderIndex::unmarshal(&cshi_data)
            .map_err(|e| e.with_path(sr.columns_header_index.path()))?;

        check_offset(&sr.columns_header, bh.columns_header_offset, "columns header")?;
        let csh_data = sr.columns_header.read_exact(bh.columns_header_size as usize)?;
        let csh = ColumnsHeader::unmarshal(&csh_data, &cshi, &sr.column_names)
            .map_err(|e| e.with_path(sr.columns_header.path()))?;

        let mut columns = Vec::with_capacity(csh.column_headers.len());
        for ch in csh.column_headers {
            let bvr = sr.bloom_values_reader(&ch.name)?;

            check_offset(&bvr.values, ch.values_offset, "values")?;
            let values_data = bvr.values.read_exact(ch.values_size as usize)?;

            let mut bloom_filter_data = Vec::new();
            if ch.value_type != ValueType::Dict {
                check_offset(&bvr.bloom, ch.bloom_filter_offset, "bloom filter")?;
                bloom_filter_data = bvr.bloom.read_exact(ch.bloom_filter_size as usize)?;
            }

            columns.push(ColumnData {
                name: ch.name,
                value_type: ch.value_type,
                min_value: ch.min_value,
                max_value: ch.max_value,
                dict: ch.dict,
                values_data,
                bloom_filter_data,
            });
        }

        Ok(Self {
            stream_id: bh.stream_id,
            uncompressed_size_bytes: bh.uncompressed_size_bytes,
            rows_count: bh.rows_count,
            timestamps: TimestampsData {
                data: ts_data,
                marshal_type: th.marshal_type,
                min_timestamp: th.min_timestamp,
                max_timestamp: th.max_timestamp,
            },
            columns,
            const_columns: csh.const_columns,
        })
    }
}

impl ColumnData {
    fn write_to(&self, sw: &mut StreamWriters) -> Result<ColumnHeader> {
        check_size(self.values_data.len(), MAX_VALUES_BLOCK_SIZE, "values block")?;
        check_size(self.bloom_filter_data.len(), MAX_BLOOM_FILTER_BLOCK_SIZE, "bloom filter block")?;

        let bvw = sw.bloom_values_writer(&self.name)?;
        let mut ch = ColumnHeader {
            name: self.name.clone(),
            value_type: self.value_type,
            min_value: self.min_value,
            max_value: self.max_value,
            dict: self.dict.clone(),
            values_offset: bvw.values.bytes_written(),
            values_size: self.values_data.len() as u64,
            bloom_filter_offset: 0,
            bloom_filter_size: 0,
        };
        bvw.values.write_all(&self.values_data)?;

        if self.value_type != ValueType::Dict {
            ch.bloom_filter_offset = bvw.bloom.bytes_written();
            ch.bloom_filter_size = self.bloom_filter_data.len() as u64;
            bvw.bloom.write_all(&self.bloom_filter_data)?;
        }
        Ok(ch)
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

fn check_size(size: usize, max: u64, what: &str) -> Result<()> {
    if size as u64 > max {
        return Err(LogDbError::InvariantViolation(format!(
            "too big {}: {} bytes; cannot exceed {} bytes",
            what, size, max
        )));
    }
    Ok(())
}

fn check_offset(r: &StreamReader, offset: u64, what: &str) -> Result<()> {
    if r.bytes_read() != offset {
        return Err(LogDbError::corruption(
            r.path(),
            format!(
                "unexpected {} offset; got {}; want {}",
                what,
                offset,
                r.bytes_read()
            ),
        ));
    }
    Ok(())
}
