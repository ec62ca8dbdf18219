//! Tests for InmemoryPart and Part
//!
//! These tests verify:
//! - Packing row batches into blocks (per-stream, row limit)
//! - Storing in-memory parts to disk and reopening them
//! - Random access reads: index blocks, block headers, columns, bloom filters
//! - Reads after close fail

use logdb::format::{MAX_ROWS_PER_BLOCK, METADATA_FILENAME};
use logdb::stream::BlockStreamReader;
use logdb::values::ValueType;
use logdb::{Field, InmemoryPart, LogDbError, LogRows, Part, StreamId, TenantId};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

/// Rows for streams `host-0..`, `counts[i]` rows each, added in shuffled order
fn build_rows(counts: &[usize]) -> LogRows {
    let mut lr = LogRows::with_stream_fields(&["host"]);
    let total: usize = counts.iter().sum();
    let mut added = vec![0usize; counts.len()];
    let mut i = 0usize;
    while added.iter().sum::<usize>() < total {
        let s = i % counts.len();
        i += 1;
        if added[s] == counts[s] {
            continue;
        }
        // Newest rows first so that sorting has work to do
        let ts = (counts[s] - added[s]) as i64 * 1_000_000;
        lr.must_add(
            TenantId::new(7, 0),
            ts,
            vec![
                Field::new("host", format!("host-{}", s)),
                Field::new("status", ["200", "404", "500"][added[s] % 3]),
                Field::new("_msg", format!("handled request {} on host {}", added[s], s)),
            ],
        );
        added[s] += 1;
    }
    lr
}

fn host_sid(s: usize) -> StreamId {
    StreamId::from_tags(TenantId::new(7, 0), &[("host", format!("host-{}", s))])
}

// =============================================================================
// Block Packing Tests
// =============================================================================

#[test]
fn test_blocks_per_stream_and_row_limit() {
    let counts = [20_000usize, 20_000, 10_000];
    let mut lr = build_rows(&counts);
    let mp = InmemoryPart::from_log_rows(&mut lr).unwrap();

    let expected_blocks: u64 = counts
        .iter()
        .map(|&n| n.div_ceil(MAX_ROWS_PER_BLOCK) as u64)
        .sum();
    assert_eq!(mp.header().rows_count, 50_000);
    assert_eq!(mp.header().blocks_count, expected_blocks);

    let mut bsr = BlockStreamReader::from_inmemory_part(&mp).unwrap();
    let mut per_stream = std::collections::HashMap::new();
    let mut last: Option<(StreamId, i64)> = None;
    while bsr.next_block().unwrap() {
        let bd = bsr.block_data().unwrap();
        assert!(bd.rows_count as usize <= MAX_ROWS_PER_BLOCK);
        *per_stream.entry(bd.stream_id).or_insert(0u64) += bd.rows_count;
        let key = (bd.stream_id, bd.timestamps.min_timestamp);
        if let Some(prev) = last {
            assert!(prev <= key);
        }
        last = Some(key);
    }
    for (s, &n) in counts.iter().enumerate() {
        assert_eq!(per_stream[&host_sid(s)], n as u64);
    }
}

#[test]
fn test_part_creation_is_deterministic() {
    let mut a = build_rows(&[300, 200]);
    let mut b = build_rows(&[300, 200]);
    let pa = InmemoryPart::from_log_rows(&mut a).unwrap();
    let pb = InmemoryPart::from_log_rows(&mut b).unwrap();
    assert_eq!(pa.header(), pb.header());
    assert_eq!(pa.files().columns_header, pb.files().columns_header);
    assert_eq!(pa.files().message_values, pb.files().message_values);
}

#[test]
fn test_empty_batch() {
    let mut lr = LogRows::new();
    let mp = InmemoryPart::from_log_rows(&mut lr).unwrap();
    assert_eq!(mp.header().rows_count, 0);
    assert_eq!(mp.header().blocks_count, 0);
}

// =============================================================================
// Store/Open Tests
// =============================================================================

#[test]
fn test_store_to_disk_and_open() {
    let dir = setup_temp_dir();
    let path = dir.path().join("part");
    let mut lr = build_rows(&[1_000, 500]);
    let mp = InmemoryPart::from_log_rows(&mut lr).unwrap();
    mp.store_to_disk(&path).unwrap();

    assert!(path.join(METADATA_FILENAME).exists());
    let part = Part::open(&path).unwrap();
    assert_eq!(part.header(), mp.header());
    assert_eq!(part.path(), path.as_path());

    // The stored part passes a full consistency scan
    let mut bsr = BlockStreamReader::open_file_part(&path).unwrap();
    let mut rows = 0;
    while bsr.next_block().unwrap() {
        rows += bsr.block_data().unwrap().rows_count;
    }
    assert_eq!(rows, 1_500);
}

#[test]
fn test_store_to_existing_dir_fails() {
    let dir = setup_temp_dir();
    let path = dir.path().join("part");
    std::fs::create_dir(&path).unwrap();
    let mut lr = build_rows(&[10]);
    let mp = InmemoryPart::from_log_rows(&mut lr).unwrap();
    assert!(mp.store_to_disk(&path).is_err());
}

// =============================================================================
// Random Access Tests
// =============================================================================

fn check_random_access(part: &Part) {
    let ihs = part.index_block_headers();
    assert!(!ihs.is_empty());

    let mut rows = 0u64;
    for ih in ihs {
        for bh in part.read_block_headers(ih).unwrap() {
            assert!(bh.timestamps_header.min_timestamp >= ih.min_timestamp);
            assert!(bh.timestamps_header.max_timestamp <= ih.max_timestamp);

            let timestamps = part.read_timestamps(&bh).unwrap();
            assert_eq!(timestamps.len() as u64, bh.rows_count);
            assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));

            let csh = part.read_columns_header(&bh).unwrap();
            let msg = csh.column_headers.iter().find(|c| c.name.is_empty()).unwrap();
            let bf = part.read_bloom_filter(msg).unwrap().unwrap();
            assert!(bf.contains_all(&["handled", "request"]));
            let values = part.read_values(msg, bh.rows_count as usize).unwrap();
            assert!(values.iter().all(|v| v.starts_with("handled request")));

            let status = csh.column_headers.iter().find(|c| c.name == "status").unwrap();
            assert_eq!(status.value_type, ValueType::Dict);
            assert!(part.read_bloom_filter(status).unwrap().is_none());

            let block = part.read_block(&bh).unwrap();
            assert_eq!(block.timestamps(), timestamps.as_slice());
            assert!(block.const_columns().iter().any(|f| f.name == "host"));
            rows += bh.rows_count;
        }
    }
    assert_eq!(rows, part.header().rows_count);
}

#[test]
fn test_random_access_inmemory_part() {
    let mut lr = build_rows(&[3_000, 100]);
    let mp = InmemoryPart::from_log_rows(&mut lr).unwrap();
    let part = Part::from_inmemory_part(&mp).unwrap();
    assert!(part.path().as_os_str().is_empty());
    check_random_access(&part);
}

#[test]
fn test_random_access_file_part() {
    let dir = setup_temp_dir();
    let path = dir.path().join("part");
    let mut lr = build_rows(&[3_000, 100]);
    InmemoryPart::from_log_rows(&mut lr)
        .unwrap()
        .store_to_disk(&path)
        .unwrap();
    check_random_access(&Part::open(&path).unwrap());
}

#[test]
fn test_reads_after_close_fail() {
    let mut lr = build_rows(&[10]);
    let mp = InmemoryPart::from_log_rows(&mut lr).unwrap();
    let part = Part::from_inmemory_part(&mp).unwrap();
    let ih = part.index_block_headers()[0];
    part.close();
    assert!(part.is_closed());
    assert!(matches!(part.read_block_headers(&ih), Err(LogDbError::Closed)));
}
