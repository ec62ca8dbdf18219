//! Block
//!
//! Rows of a single stream in columnar form.

use std::collections::HashMap;

use crate::bloom::BloomFilter;
use crate::encoding::{marshal_strings_block, marshal_timestamps, unmarshal_timestamps, ByteReader};
use crate::error::{LogDbError, Result};
use crate::rows::{Field, StreamId};
use crate::values::{decode_values, encode_values, ValueType};

use super::block_data::{BlockData, ColumnData, TimestampsData};
use super::{MAX_COLUMNS_PER_BLOCK, MAX_CONST_COLUMN_VALUE_SIZE};

/// Bytes counted for every row timestamp: the length of an RFC3339 timestamp
/// with nanoseconds and zone offset
const TIMESTAMP_SIZE_ESTIMATE: u64 = "2006-01-02T15:04:05.999999999Z07:00".len() as u64;

/// Estimated size of a row as text
pub fn uncompressed_row_size_bytes(fields: &[Field]) -> u64 {
    let mut n = TIMESTAMP_SIZE_ESTIMATE;
    for f in fields {
        n += (2 + f.name_len_for_size() + f.value.len()) as u64;
    }
    n
}

/// Values of one column; rows without the column hold an empty string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub values: Vec<String>,
}

/// Decoded rows of one stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    timestamps: Vec<i64>,
    columns: Vec<Column>,
    const_columns: Vec<Field>,
}

impl Block {
    /// Build a block from rows sorted by timestamp
    ///
    /// Every row must have its fields sorted by name.
    pub fn from_rows(timestamps: &[i64], rows: &[Vec<Field>]) -> Result<Self> {
        if timestamps.len() != rows.len() {
            return Err(LogDbError::InvariantViolation(format!(
                "timestamps count {} does not match rows count {}",
                timestamps.len(),
                rows.len()
            )));
        }
        if timestamps.windows(2).any(|w| w[1] < w[0]) {
            return Err(LogDbError::InvariantViolation(
                "timestamps must be sorted inside a block".to_string(),
            ));
        }

        let columns = if are_same_fields_in_rows(rows) {
            columns_from_uniform_rows(rows)
        } else {
            columns_from_rows(rows)?
        };

        let mut block = Self {
            timestamps: timestamps.to_vec(),
            columns: Vec::with_capacity(columns.len()),
            const_columns: Vec::new(),
        };
        for c in columns {
            if is_const_column(&c.values) {
                let value = c.values.into_iter().next().unwrap_or_default();
                block.const_columns.push(Field::new(c.name, value));
            } else {
                block.columns.push(c);
            }
        }
        block.columns.sort_by(|a, b| a.name.cmp(&b.name));
        block.const_columns.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(block)
    }

    /// Decode the serialized form back to columns
    pub fn from_block_data(bd: &BlockData) -> Result<Self> {
        let rows = bd.rows_count as usize;
        let timestamps = unmarshal_timestamps(bd.timestamps.marshal_type, &bd.timestamps.data, rows)?;

        let mut columns = Vec::with_capacity(bd.columns.len());
        for cd in &bd.columns {
            let mut r = ByteReader::new(&cd.values_data);
            let encoded = r.read_strings_block(rows)?;
            r.expect_end("column values")?;
            let values = decode_values(cd.value_type, &encoded, &cd.dict)?;
            columns.push(Column {
                name: cd.name.clone(),
                values,
            });
        }
        Ok(Self {
            timestamps,
            columns,
            const_columns: bd.const_columns.clone(),
        })
    }

    /// Encode into the serialized form for `sid`
    pub fn encode(&self, sid: &StreamId) -> Result<BlockData> {
        let mut ts_data = Vec::new();
        let marshal_type = marshal_timestamps(&mut ts_data, &self.timestamps)?;

        let mut columns = Vec::with_capacity(self.columns.len());
        for c in &self.columns {
            let ev = encode_values(&c.values);
            let mut values_data = Vec::new();
            marshal_strings_block(&mut values_data, &ev.values)?;
            let mut bloom_filter_data = Vec::new();
            if ev.value_type != ValueType::Dict {
                BloomFilter::from_values(&c.values).marshal(&mut bloom_filter_data);
            }
            columns.push(ColumnData {
                name: c.name.clone(),
                value_type: ev.value_type,
                min_value: ev.min_value,
                max_value: ev.max_value,
                dict: ev.dict,
                values_data,
                bloom_filter_data,
            });
        }

        Ok(BlockData {
            stream_id: *sid,
            uncompressed_size_bytes: self.uncompressed_size_bytes(),
            rows_count: self.timestamps.len() as u64,
            timestamps: TimestampsData {
                data: ts_data,
                marshal_type,
                min_timestamp: self.timestamps.first().copied().unwrap_or(0),
                max_timestamp: self.timestamps.last().copied().unwrap_or(0),
            },
            columns,
            const_columns: self.const_columns.clone(),
        })
    }

    /// Rows with fields sorted by name; empty values are omitted
    pub fn to_rows(&self) -> Vec<Vec<Field>> {
        let mut rows = Vec::with_capacity(self.timestamps.len());
        for i in 0..self.timestamps.len() {
            let mut row: Vec<Field> = self.const_columns.clone();
            for c in &self.columns {
                let v = &c.values[i];
                if !v.is_empty() {
                    row.push(Field::new(c.name.clone(), v.clone()));
                }
            }
            row.sort_by(|a, b| a.name.cmp(&b.name));
            rows.push(row);
        }
        rows
    }

    /// Estimated size of the block as text
    pub fn uncompressed_size_bytes(&self) -> u64 {
        let rows = self.timestamps.len() as u64;
        let mut n = rows * TIMESTAMP_SIZE_ESTIMATE;
        for c in &self.columns {
            let name_len = name_len_for_size(&c.name);
            for v in c.values.iter().filter(|v| !v.is_empty()) {
                n += (2 + name_len + v.len()) as u64;
            }
        }
        for f in &self.const_columns {
            n += rows * (2 + f.name_len_for_size() + f.value.len()) as u64;
        }
        n
    }

    pub fn rows_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn const_columns(&self) -> &[Field] {
        &self.const_columns
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

fn name_len_for_size(name: &str) -> usize {
    if name.is_empty() {
        crate::rows::MESSAGE_FIELD_NAME.len()
    } else {
        name.len()
    }
}

fn are_same_fields_in_rows(rows: &[Vec<Field>]) -> bool {
    let Some(first) = rows.first() else {
        return true;
    };
    rows[1..].iter().all(|row| {
        row.len() == first.len() && row.iter().zip(first).all(|(a, b)| a.name == b.name)
    })
}

fn columns_from_uniform_rows(rows: &[Vec<Field>]) -> Vec<Column> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    first
        .iter()
        .enumerate()
        .map(|(i, f)| Column {
            name: f.name.clone(),
            values: rows.iter().map(|row| row[i].value.clone()).collect(),
        })
        .collect()
}

fn columns_from_rows(rows: &[Vec<Field>]) -> Result<Vec<Column>> {
    let mut idxs: HashMap<&str, usize> = HashMap::new();
    let mut columns: Vec<Column> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        for f in row {
            let idx = match idxs.get(f.name.as_str()) {
                Some(&idx) => idx,
                None => {
                    if columns.len() >= MAX_COLUMNS_PER_BLOCK {
                        return Err(LogDbError::InvariantViolation(format!(
                            "too many columns in a block; cannot exceed {}",
                            MAX_COLUMNS_PER_BLOCK
                        )));
                    }
                    idxs.insert(f.name.as_str(), columns.len());
                    columns.push(Column {
                        name: f.name.clone(),
                        values: vec![String::new(); rows.len()],
                    });
                    columns.len() - 1
                }
            };
            columns[idx].values[i] = f.value.clone();
        }
    }
    Ok(columns)
}

fn is_const_column(values: &[String]) -> bool {
    let Some(first) = values.first() else {
        return false;
    };
    !first.is_empty()
        && first.len() <= MAX_CONST_COLUMN_VALUE_SIZE
        && values.iter().all(|v| v == first)
}
