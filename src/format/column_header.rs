//! Column headers
//!
//! A block's `ColumnsHeader` lists its columns without their names. Names are
//! kept once per part in the column-name dictionary, and each block carries a
//! `ColumnsHeaderIndex` mapping header positions to column name ids.

use crate::encoding::{decode_err, put_bytes, put_u16, put_u32, put_u64, put_varint, ByteReader};
use crate::error::{LogDbError, Result};
use crate::rows::Field;
use crate::values::{ValueType, ValuesDict};

use super::column_names::ColumnNameIdGenerator;
use super::MAX_COLUMNS_PER_BLOCK;

/// Sanity cap on the column header count read from disk
const MAX_COLUMN_HEADERS_COUNT: u64 = 1_000_000;

/// Header of one non-const column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnHeader {
    pub name: String,
    pub value_type: ValueType,
    pub min_value: u64,
    pub max_value: u64,
    pub dict: ValuesDict,
    pub values_offset: u64,
    pub values_size: u64,
    pub bloom_filter_offset: u64,
    pub bloom_filter_size: u64,
}

impl ColumnHeader {
    /// Marshal everything except the name
    pub fn marshal(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.push(self.value_type as u8);
        match self.value_type {
            ValueType::String => {}
            ValueType::Dict => {
                self.dict.marshal(dst);
                self.marshal_values(dst);
                return Ok(());
            }
            ValueType::Uint8 => {
                dst.push(self.min_value as u8);
                dst.push(self.max_value as u8);
            }
            ValueType::Uint16 => {
                put_u16(dst, self.min_value as u16);
                put_u16(dst, self.max_value as u16);
            }
            ValueType::Uint32 | ValueType::IPv4 => {
                put_u32(dst, self.min_value as u32);
                put_u32(dst, self.max_value as u32);
            }
            ValueType::Uint64
            | ValueType::Int64
            | ValueType::Float64
            | ValueType::TimestampIso8601 => {
                put_u64(dst, self.min_value);
                put_u64(dst, self.max_value);
            }
            ValueType::Unknown => {
                return Err(LogDbError::InvariantViolation(format!(
                    "cannot marshal column {:?} of unknown value type",
                    self.name
                )));
            }
        }
        self.marshal_values(dst);
        self.marshal_bloom_filter(dst);
        Ok(())
    }

    /// Inverse of `marshal`; `name` is filled in by the caller
    pub fn unmarshal(r: &mut ByteReader<'_>) -> Result<Self> {
        let value_type = ValueType::from_u8(r.read_u8()?)?;
        let mut ch = Self {
            name: String::new(),
            value_type,
            min_value: 0,
            max_value: 0,
            dict: ValuesDict::default(),
            values_offset: 0,
            values_size: 0,
            bloom_filter_offset: 0,
            bloom_filter_size: 0,
        };
        match value_type {
            ValueType::String => {}
            ValueType::Dict => {
                ch.dict = ValuesDict::unmarshal(r)?;
                ch.unmarshal_values(r)?;
                return Ok(ch);
            }
            ValueType::Uint8 => {
                ch.min_value = u64::from(r.read_u8()?);
                ch.max_value = u64::from(r.read_u8()?);
            }
            ValueType::Uint16 => {
                ch.min_value = u64::from(r.read_u16()?);
                ch.max_value = u64::from(r.read_u16()?);
            }
            ValueType::Uint32 | ValueType::IPv4 => {
                ch.min_value = u64::from(r.read_u32()?);
                ch.max_value = u64::from(r.read_u32()?);
            }
            ValueType::Uint64
            | ValueType::Int64
            | ValueType::Float64
            | ValueType::TimestampIso8601 => {
                ch.min_value = r.read_u64()?;
                ch.max_value = r.read_u64()?;
            }
            ValueType::Unknown => return Err(decode_err("unexpected unknown value type")),
        }
        ch.validate_min_max()?;
        ch.unmarshal_values(r)?;
        ch.unmarshal_bloom_filter(r)?;
        Ok(ch)
    }

    fn validate_min_max(&self) -> Result<()> {
        let ok = match self.value_type {
            ValueType::Float64 => {
                f64::from_bits(self.min_value) <= f64::from_bits(self.max_value)
            }
            ValueType::Int64 | ValueType::TimestampIso8601 => {
                (self.min_value as i64) <= (self.max_value as i64)
            }
            _ => self.min_value <= self.max_value,
        };
        if !ok {
            return Err(decode_err(format!(
                "min value cannot exceed max value for {:?} column; min={}, max={}",
                self.value_type, self.min_value, self.max_value
            )));
        }
        Ok(())
    }

    fn marshal_values(&self, dst: &mut Vec<u8>) {
        put_varint(dst, self.values_offset);
        put_varint(dst, self.values_size);
    }

    fn marshal_bloom_filter(&self, dst: &mut Vec<u8>) {
        put_varint(dst, self.bloom_filter_offset);
        put_varint(dst, self.bloom_filter_size);
    }

    fn unmarshal_values(&mut self, r: &mut ByteReader<'_>) -> Result<()> {
        self.values_offset = r.read_varint()?;
        self.values_size = r.read_varint()?;
        if self.values_size > super::MAX_VALUES_BLOCK_SIZE {
            return Err(decode_err(format!(
                "too big values block: {} bytes; cannot exceed {} bytes",
                self.values_size,
                super::MAX_VALUES_BLOCK_SIZE
            )));
        }
        Ok(())
    }

    fn unmarshal_bloom_filter(&mut self, r: &mut ByteReader<'_>) -> Result<()> {
        self.bloom_filter_offset = r.read_varint()?;
        self.bloom_filter_size = r.read_varint()?;
        if self.bloom_filter_size > super::MAX_BLOOM_FILTER_BLOCK_SIZE {
            return Err(decode_err(format!(
                "too big bloom filter block: {} bytes; cannot exceed {} bytes",
                self.bloom_filter_size,
                super::MAX_BLOOM_FILTER_BLOCK_SIZE
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Columns Header
// =============================================================================

/// Column headers and const columns of one block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnsHeader {
    pub column_headers: Vec<ColumnHeader>,
    pub const_columns: Vec<Field>,
}

impl ColumnsHeader {
    /// Marshal to `dst` while recording name ids and offsets into `cshi`
    pub fn marshal(
        &self,
        dst: &mut Vec<u8>,
        cshi: &mut ColumnsHeaderIndex,
        g: &mut ColumnNameIdGenerator,
    ) -> Result<()> {
        let start = dst.len();

        put_varint(dst, self.column_headers.len() as u64);
        for ch in &self.column_headers {
            cshi.column_headers_refs.push(ColumnHeaderRef {
                column_name_id: g.get_or_assign(&ch.name),
                offset: (dst.len() - start) as u64,
            });
            ch.marshal(dst)?;
        }

        put_varint(dst, self.const_columns.len() as u64);
        for f in &self.const_columns {
            cshi.const_columns_refs.push(ColumnHeaderRef {
                column_name_id: g.get_or_assign(&f.name),
                offset: (dst.len() - start) as u64,
            });
            put_bytes(dst, f.value.as_bytes());
        }
        Ok(())
    }

    /// Decode `src`, resolving names through `cshi` and `column_names`
    pub fn unmarshal(src: &[u8], cshi: &ColumnsHeaderIndex, column_names: &[String]) -> Result<Self> {
        let mut r = ByteReader::new(src);

        let n = r.read_varint()?;
        if n > MAX_COLUMN_HEADERS_COUNT {
            return Err(decode_err(format!("too many column headers: {}", n)));
        }
        if n != cshi.column_headers_refs.len() as u64 {
            return Err(decode_err(format!(
                "column headers count {} does not match columns header index count {}",
                n,
                cshi.column_headers_refs.len()
            )));
        }
        let mut column_headers = Vec::with_capacity(n as usize);
        for cref in &cshi.column_headers_refs {
            check_ref_offset(cref, src.len() - r.remaining().len())?;
            let mut ch = ColumnHeader::unmarshal(&mut r)?;
            ch.name = resolve_name(cref, column_names)?;
            column_headers.push(ch);
        }

        let m = r.read_varint()?;
        if m != cshi.const_columns_refs.len() as u64 {
            return Err(decode_err(format!(
                "const columns count {} does not match columns header index count {}",
                m,
                cshi.const_columns_refs.len()
            )));
        }
        if n + m > MAX_COLUMNS_PER_BLOCK as u64 {
            return Err(decode_err(format!(
                "too many columns in a block: {}; cannot exceed {}",
                n + m,
                MAX_COLUMNS_PER_BLOCK
            )));
        }
        let mut const_columns = Vec::with_capacity(m as usize);
        for cref in &cshi.const_columns_refs {
            check_ref_offset(cref, src.len() - r.remaining().len())?;
            let value = r.read_str()?.to_string();
            const_columns.push(Field::new(resolve_name(cref, column_names)?, value));
        }
        r.expect_end("columns header")?;

        Ok(Self {
            column_headers,
            const_columns,
        })
    }
}

// =============================================================================
// Columns Header Index
// =============================================================================

/// Column name id and offset of a header inside its `ColumnsHeader`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnHeaderRef {
    pub column_name_id: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnsHeaderIndex {
    pub column_headers_refs: Vec<ColumnHeaderRef>,
    pub const_columns_refs: Vec<ColumnHeaderRef>,
}

impl ColumnsHeaderIndex {
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        for refs in [&self.column_headers_refs, &self.const_columns_refs] {
            put_varint(dst, refs.len() as u64);
            for cref in refs {
                put_varint(dst, cref.column_name_id);
                put_varint(dst, cref.offset);
            }
        }
    }

    pub fn unmarshal(src: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(src);
        let column_headers_refs = read_refs(&mut r)?;
        let const_columns_refs = read_refs(&mut r)?;
        r.expect_end("columns header index")?;
        Ok(Self {
            column_headers_refs,
            const_columns_refs,
        })
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

fn read_refs(r: &mut ByteReader<'_>) -> Result<Vec<ColumnHeaderRef>> {
    let n = r.read_varint()?;
    if n > MAX_COLUMNS_PER_BLOCK as u64 {
        return Err(decode_err(format!(
            "too many columns in columns header index: {}; cannot exceed {}",
            n, MAX_COLUMNS_PER_BLOCK
        )));
    }
    let mut refs = Vec::with_capacity(n as usize);
    for _ in 0..n {
        refs.push(ColumnHeaderRef {
            column_name_id: r.read_varint()?,
            offset: r.read_varint()?,
        });
    }
    Ok(refs)
}

fn resolve_name(cref: &ColumnHeaderRef, column_names: &[String]) -> Result<String> {
    column_names
        .get(cref.column_name_id as usize)
        .cloned()
        .ok_or_else(|| {
            decode_err(format!(
                "column name id {} is out of range; part has {} column names",
                cref.column_name_id,
                column_names.len()
            ))
        })
}

fn check_ref_offset(cref: &ColumnHeaderRef, offset: usize) -> Result<()> {
    if cref.offset != offset as u64 {
        return Err(decode_err(format!(
            "columns header index points to offset {}; header starts at offset {}",
            cref.offset, offset
        )));
    }
    Ok(())
}
