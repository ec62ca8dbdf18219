//! Ingestion batch
//!
//! `LogRows` collects validated rows before they are packed into a part.

use std::collections::HashSet;

use tracing::warn;

use crate::format::{
    uncompressed_row_size_bytes, MAX_COLUMNS_PER_BLOCK, MAX_FIELD_NAME_SIZE,
    MAX_UNCOMPRESSED_BLOCK_SIZE,
};

use super::{Field, StreamId, TenantId, MESSAGE_FIELD_NAME};

/// A batch of `(StreamId, timestamp, fields)` rows
#[derive(Debug, Clone, Default)]
pub struct LogRows {
    stream_ids: Vec<StreamId>,
    timestamps: Vec<i64>,
    rows: Vec<Vec<Field>>,

    /// Field names forming the stream identity in `must_add`
    stream_fields: HashSet<String>,

    /// Estimated uncompressed size of all rows
    uncompressed_size_bytes: u64,
}

impl LogRows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch whose `must_add` derives stream ids from the given field names
    pub fn with_stream_fields<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            stream_fields: names.iter().map(|n| n.as_ref().to_string()).collect(),
            ..Self::default()
        }
    }

    /// Add a row; the stream id is hashed from the configured stream fields
    pub fn must_add(&mut self, tenant: TenantId, timestamp: i64, fields: Vec<Field>) {
        let tags: Vec<(&str, &str)> = fields
            .iter()
            .filter(|f| self.stream_fields.contains(&f.name))
            .map(|f| (f.name.as_str(), f.value.as_str()))
            .collect();
        let sid = StreamId::from_tags(tenant, &tags);
        self.must_add_with_stream_id(sid, timestamp, fields);
    }

    /// Add a row for an already computed stream id
    ///
    /// Rows exceeding the field count, field name or row size limits are
    /// dropped with a warning. Fields with empty values are skipped.
    pub fn must_add_with_stream_id(&mut self, sid: StreamId, timestamp: i64, fields: Vec<Field>) {
        if fields.len() > MAX_COLUMNS_PER_BLOCK {
            warn!(
                fields = fields.len(),
                limit = MAX_COLUMNS_PER_BLOCK,
                "ignoring log entry with too many fields"
            );
            return;
        }
        if let Some(f) = fields.iter().find(|f| f.name.len() > MAX_FIELD_NAME_SIZE) {
            warn!(
                name = %f.name,
                limit = MAX_FIELD_NAME_SIZE,
                "ignoring log entry with too long field name"
            );
            return;
        }

        let mut row: Vec<Field> = fields
            .into_iter()
            .filter(|f| !f.value.is_empty())
            .map(|mut f| {
                if f.name == MESSAGE_FIELD_NAME {
                    f.name.clear();
                }
                f
            })
            .collect();
        row.sort_by(|a, b| a.name.cmp(&b.name));

        let row_size = uncompressed_row_size_bytes(&row);
        if row_size > MAX_UNCOMPRESSED_BLOCK_SIZE {
            warn!(
                size = row_size,
                limit = MAX_UNCOMPRESSED_BLOCK_SIZE,
                "ignoring too long log entry"
            );
            return;
        }

        self.stream_ids.push(sid);
        self.timestamps.push(timestamp);
        self.rows.push(row);
        self.uncompressed_size_bytes += row_size;
    }

    /// Move all rows of `other` into `self`, leaving `other` empty
    pub fn append(&mut self, other: &mut LogRows) {
        self.stream_ids.append(&mut other.stream_ids);
        self.timestamps.append(&mut other.timestamps);
        self.rows.append(&mut other.rows);
        self.uncompressed_size_bytes += other.uncompressed_size_bytes;
        other.uncompressed_size_bytes = 0;
    }

    /// True once the batch holds roughly a block worth of data
    pub fn need_flush(&self) -> bool {
        self.uncompressed_size_bytes > (MAX_UNCOMPRESSED_BLOCK_SIZE / 8) * 7
    }

    /// Sort rows by `(StreamId, timestamp)`, keeping insertion order on ties
    pub fn sort(&mut self) {
        let mut idx: Vec<usize> = (0..self.timestamps.len()).collect();
        idx.sort_by(|&a, &b| {
            (self.stream_ids[a], self.timestamps[a]).cmp(&(self.stream_ids[b], self.timestamps[b]))
        });
        if idx.iter().enumerate().all(|(i, &j)| i == j) {
            return;
        }
        self.stream_ids = idx.iter().map(|&i| self.stream_ids[i]).collect();
        self.timestamps = idx.iter().map(|&i| self.timestamps[i]).collect();
        let mut rows: Vec<Option<Vec<Field>>> = self.rows.drain(..).map(Some).collect();
        self.rows = idx.iter().filter_map(|&i| rows[i].take()).collect();
    }

    pub fn reset(&mut self) {
        self.stream_ids.clear();
        self.timestamps.clear();
        self.rows.clear();
        self.uncompressed_size_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn uncompressed_size_bytes(&self) -> u64 {
        self.uncompressed_size_bytes
    }

    pub fn stream_ids(&self) -> &[StreamId] {
        &self.stream_ids
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn rows(&self) -> &[Vec<Field>] {
        &self.rows
    }
}
