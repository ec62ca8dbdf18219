//! Tests for column values encoding
//!
//! These tests verify:
//! - Representation choice order (dict, uint, int64, float64, ipv4, timestamp, string)
//! - Lossless decoding of every representation
//! - Min/max tracking of numeric representations
//! - Bloom filter token matching

use logdb::bloom::{tokenize, BloomFilter};
use logdb::values::{decode_values, encode_values, ValueType, MAX_DICT_LEN};

// =============================================================================
// Helper Functions
// =============================================================================

fn distinct<F: Fn(usize) -> String>(n: usize, f: F) -> Vec<String> {
    (0..n).map(f).collect()
}

fn assert_roundtrip(values: &[String]) -> ValueType {
    let ev = encode_values(values);
    let decoded = decode_values(ev.value_type, &ev.values, &ev.dict).unwrap();
    assert_eq!(decoded, values);
    ev.value_type
}

// =============================================================================
// Representation Choice Tests
// =============================================================================

#[test]
fn test_low_cardinality_uses_dict() {
    let values: Vec<String> = (0..100).map(|i| ["info", "warn", "error"][i % 3].to_string()).collect();
    assert_eq!(assert_roundtrip(&values), ValueType::Dict);
}

#[test]
fn test_dict_overflow_falls_through() {
    let values = distinct(MAX_DICT_LEN + 1, |i| format!("value-{}", i));
    assert_eq!(assert_roundtrip(&values), ValueType::String);
}

#[test]
fn test_uint_widths() {
    assert_eq!(assert_roundtrip(&distinct(20, |i| (i * 10).to_string())), ValueType::Uint8);
    assert_eq!(assert_roundtrip(&distinct(20, |i| (i * 1000).to_string())), ValueType::Uint16);
    assert_eq!(assert_roundtrip(&distinct(20, |i| (i * 100_000).to_string())), ValueType::Uint32);
    assert_eq!(
        assert_roundtrip(&distinct(20, |i| (i as u64 * 10_000_000_000).to_string())),
        ValueType::Uint64
    );
}

#[test]
fn test_uint_min_max() {
    let values = distinct(20, |i| (i * 3 + 7).to_string());
    let ev = encode_values(&values);
    assert_eq!(ev.min_value, 7);
    assert_eq!(ev.max_value, 19 * 3 + 7);
}

#[test]
fn test_negative_numbers_use_int64() {
    let values = distinct(20, |i| (i as i64 - 10).to_string());
    let ev = encode_values(&values);
    assert_eq!(ev.value_type, ValueType::Int64);
    assert_eq!(ev.min_value as i64, -10);
    assert_eq!(ev.max_value as i64, 9);
    assert_roundtrip(&values);
}

#[test]
fn test_leading_zeros_stay_strings() {
    let values = distinct(20, |i| format!("0{}", i + 1));
    assert_eq!(assert_roundtrip(&values), ValueType::String);
}

#[test]
fn test_float64() {
    let values = distinct(20, |i| format!("{}.5", i));
    assert_eq!(assert_roundtrip(&values), ValueType::Float64);
}

#[test]
fn test_ipv4() {
    let values = distinct(20, |i| format!("10.0.{}.{}", i / 4, i * 3));
    assert_eq!(assert_roundtrip(&values), ValueType::IPv4);
}

#[test]
fn test_iso8601_timestamps() {
    let values = distinct(20, |i| format!("2024-01-15T10:20:{:02}.123Z", i));
    assert_eq!(assert_roundtrip(&values), ValueType::TimestampIso8601);
}

#[test]
fn test_mixed_values_fall_back_to_string() {
    let mut values = distinct(20, |i| i.to_string());
    values.push("not a number".to_string());
    assert_eq!(assert_roundtrip(&values), ValueType::String);
}

#[test]
fn test_empty_values_in_numeric_column() {
    let mut values = distinct(20, |i| (i * 100).to_string());
    values[3].clear();
    // An empty value is not a number, and 20 distinct values overflow the dict
    assert_eq!(assert_roundtrip(&values), ValueType::String);
}

// =============================================================================
// Bloom Filter Tests
// =============================================================================

#[test]
fn test_tokenize_splits_on_non_word_chars() {
    let tokens: Vec<&str> = tokenize("GET /api/v1/users?id=42 took 15ms").collect();
    assert_eq!(tokens, vec!["GET", "api", "v1", "users", "id", "42", "took", "15ms"]);
}

#[test]
fn test_bloom_contains_all_tokens() {
    let values = vec!["connection refused by upstream", "request served"];
    let bf = BloomFilter::from_values(&values);
    assert!(bf.contains_all(&["connection", "upstream"]));
    assert!(bf.contains_all(&["served"]));
}

#[test]
fn test_bloom_rejects_missing_token() {
    let values: Vec<String> = (0..100).map(|i| format!("event number {}", i)).collect();
    let bf = BloomFilter::from_values(&values);
    assert!(!bf.contains_all(&["definitely_not_present_token_xyz"]));
}

#[test]
fn test_bloom_marshal_roundtrip() {
    let values = vec!["alpha beta", "gamma"];
    let bf = BloomFilter::from_values(&values);
    let mut buf = Vec::new();
    bf.marshal(&mut buf);
    let restored = BloomFilter::unmarshal(&buf).unwrap();
    assert!(restored.contains_all(&["alpha", "beta", "gamma"]));
}
