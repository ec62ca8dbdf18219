//! Rows Module
//!
//! Log rows as they arrive from ingestion.
//!
//! ## Responsibilities
//! - Stream identity (`StreamId`, `TenantId`)
//! - Fields and the message field convention
//! - `LogRows`, the batch handed to the storage engine

mod log_rows;
mod stream_id;

pub use log_rows::LogRows;
pub use stream_id::{canonical_stream_tags, StreamId, TenantId, STREAM_ID_SIZE};

/// Name under which the message field is exposed to users
pub const MESSAGE_FIELD_NAME: &str = "_msg";

/// One `name=value` pair of a log row
///
/// The message field is stored with an empty name.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Field {
    pub name: String,
    pub value: String,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Name length as counted in uncompressed size estimates
    pub fn name_len_for_size(&self) -> usize {
        if self.name.is_empty() {
            MESSAGE_FIELD_NAME.len()
        } else {
            self.name.len()
        }
    }
}

/// Merge two row sets of one stream by timestamp, keeping `a` first on ties
pub fn merge_rows_by_timestamp(
    a_ts: &[i64],
    a_rows: &[Vec<Field>],
    b_ts: &[i64],
    b_rows: &[Vec<Field>],
) -> (Vec<i64>, Vec<Vec<Field>>) {
    let mut ts = Vec::with_capacity(a_ts.len() + b_ts.len());
    let mut rows = Vec::with_capacity(a_ts.len() + b_ts.len());
    let (mut i, mut j) = (0, 0);
    while i < a_ts.len() && j < b_ts.len() {
        if b_ts[j] < a_ts[i] {
            ts.push(b_ts[j]);
            rows.push(b_rows[j].clone());
            j += 1;
        } else {
            ts.push(a_ts[i]);
            rows.push(a_rows[i].clone());
            i += 1;
        }
    }
    ts.extend_from_slice(&a_ts[i..]);
    rows.extend_from_slice(&a_rows[i..]);
    ts.extend_from_slice(&b_ts[j..]);
    rows.extend_from_slice(&b_rows[j..]);
    (ts, rows)
}
