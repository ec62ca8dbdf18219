//! Tests for the part format
//!
//! These tests verify:
//! - Blocks keep rows intact through encoding and decoding
//! - Columns pick typed encodings and carry bloom filters
//! - Part headers are validated when read from disk
//! - Column-name and shard tables reject inconsistent input

use std::collections::BTreeMap;
use std::fs;

use logdb::format::{
    marshal_column_idxs, marshal_column_names, unmarshal_column_idxs, unmarshal_column_names,
    Block, PartHeader, METADATA_FILENAME, PART_FORMAT_LATEST_VERSION,
};
use logdb::values::ValueType;
use logdb::{Field, LogDbError, StreamId, TenantId};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn row(fields: &[(&str, String)]) -> Vec<Field> {
    let mut r: Vec<Field> = fields.iter().map(|(n, v)| Field::new(*n, v.clone())).collect();
    r.sort_by(|a, b| a.name.cmp(&b.name));
    r
}

fn sample_rows(n: usize) -> (Vec<i64>, Vec<Vec<Field>>) {
    let timestamps = (0..n as i64).map(|i| 1_000 + i * 10).collect();
    let rows = (0..n)
        .map(|i| {
            row(&[
                ("", format!("request {} finished", i)),
                ("app", "api".to_string()),
                ("latency", (i * 7).to_string()),
                ("level", ["info", "warn"][i % 2].to_string()),
            ])
        })
        .collect();
    (timestamps, rows)
}

fn sid() -> StreamId {
    StreamId::new(TenantId::new(1, 2), 42)
}

fn valid_header() -> PartHeader {
    PartHeader {
        format_version: PART_FORMAT_LATEST_VERSION,
        compressed_size_bytes: 100,
        uncompressed_size_bytes: 400,
        rows_count: 10,
        blocks_count: 2,
        min_timestamp: 1,
        max_timestamp: 5,
        bloom_values_shards_count: 1,
    }
}

// =============================================================================
// Block Tests
// =============================================================================

#[test]
fn test_block_encode_decode_preserves_rows() {
    let (timestamps, rows) = sample_rows(100);
    let block = Block::from_rows(&timestamps, &rows).unwrap();

    let bd = block.encode(&sid()).unwrap();
    assert_eq!(bd.rows_count, 100);
    assert_eq!(bd.stream_id, sid());
    assert_eq!(bd.timestamps.min_timestamp, 1_000);
    assert_eq!(bd.timestamps.max_timestamp, 1_000 + 99 * 10);

    let decoded = Block::from_block_data(&bd).unwrap();
    assert_eq!(decoded.timestamps(), timestamps.as_slice());
    assert_eq!(decoded.to_rows(), rows);
}

#[test]
fn test_block_column_encodings() {
    let (timestamps, rows) = sample_rows(50);
    let bd = Block::from_rows(&timestamps, &rows)
        .unwrap()
        .encode(&sid())
        .unwrap();

    // "app" is the same in every row
    assert_eq!(bd.const_columns, vec![Field::new("app", "api")]);

    let types: Vec<(&str, ValueType)> = bd
        .columns
        .iter()
        .map(|c| (c.name.as_str(), c.value_type))
        .collect();
    assert_eq!(
        types,
        vec![
            ("", ValueType::String),
            ("latency", ValueType::Uint16),
            ("level", ValueType::Dict),
        ]
    );

    for c in &bd.columns {
        if c.value_type == ValueType::Dict {
            assert!(c.bloom_filter_data.is_empty());
        } else {
            assert!(!c.bloom_filter_data.is_empty());
        }
    }
    let latency = &bd.columns[1];
    assert_eq!(latency.min_value, 0);
    assert_eq!(latency.max_value, 49 * 7);
}

#[test]
fn test_block_rejects_unsorted_timestamps() {
    let (_, rows) = sample_rows(3);
    let err = Block::from_rows(&[3, 1, 2], &rows).unwrap_err();
    assert!(matches!(err, LogDbError::InvariantViolation(_)));
}

#[test]
fn test_block_rejects_mismatched_lengths() {
    let (_, rows) = sample_rows(3);
    assert!(Block::from_rows(&[1, 2], &rows).is_err());
}

#[test]
fn test_block_size_matches_row_estimates() {
    let (timestamps, rows) = sample_rows(20);
    let block = Block::from_rows(&timestamps, &rows).unwrap();
    let expected: u64 = rows
        .iter()
        .map(|r| logdb::format::uncompressed_row_size_bytes(r))
        .sum();
    assert_eq!(block.uncompressed_size_bytes(), expected);
}

// =============================================================================
// Part Header Tests
// =============================================================================

#[test]
fn test_part_header_roundtrip_through_dir() {
    let dir = TempDir::new().unwrap();
    let ph = valid_header();
    ph.write_to_dir(dir.path()).unwrap();
    assert_eq!(PartHeader::read_from_dir(dir.path()).unwrap(), ph);
}

#[test]
fn test_part_header_rejects_unknown_version() {
    let dir = TempDir::new().unwrap();
    let mut ph = valid_header();
    ph.format_version = 1;
    ph.write_to_dir(dir.path()).unwrap();
    assert!(matches!(
        PartHeader::read_from_dir(dir.path()),
        Err(LogDbError::Corruption { .. })
    ));
}

#[test]
fn test_part_header_rejects_inverted_time_range() {
    let mut ph = valid_header();
    ph.min_timestamp = 10;
    ph.max_timestamp = 5;
    assert!(ph.validate().is_err());
}

#[test]
fn test_part_header_rejects_malformed_json() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(METADATA_FILENAME), b"{not json").unwrap();
    assert!(matches!(
        PartHeader::read_from_dir(dir.path()),
        Err(LogDbError::Corruption { .. })
    ));
}

// =============================================================================
// Column Table Tests
// =============================================================================

#[test]
fn test_column_names_and_idxs() {
    let names = vec!["".to_string(), "host".to_string(), "level".to_string()];
    let data = marshal_column_names(&names).unwrap();
    assert_eq!(unmarshal_column_names(&data).unwrap(), names);

    let mut idxs = BTreeMap::new();
    idxs.insert(1u64, 0u64);
    idxs.insert(2u64, 1u64);
    let data = marshal_column_idxs(&idxs).unwrap();
    let shards = unmarshal_column_idxs(&data, &names, 2).unwrap();
    assert_eq!(shards.get("host"), Some(&0));
    assert_eq!(shards.get("level"), Some(&1));
}

#[test]
fn test_column_idxs_reject_out_of_range_shard() {
    let names = vec!["host".to_string()];
    let mut idxs = BTreeMap::new();
    idxs.insert(0u64, 3u64);
    let data = marshal_column_idxs(&idxs).unwrap();
    assert!(unmarshal_column_idxs(&data, &names, 2).is_err());
}

#[test]
fn test_column_names_reject_duplicates() {
    let names = vec!["host".to_string(), "host".to_string()];
    let data = marshal_column_names(&names).unwrap();
    assert!(unmarshal_column_names(&data).is_err());
}
