//! Tests for merging block streams
//!
//! These tests verify:
//! - Merged output keeps every row, ordered by stream then timestamp
//! - Rows of one stream from several parts interleave by timestamp
//! - Merging is deterministic
//! - Pending rows past the block size limit are flushed without breaking
//!   block order when inputs of one stream overlap
//! - Full blocks and blocks over the column limit are written on their own
//! - A closed stop channel abandons the merge

use std::fs;

use crossbeam::channel;
use logdb::format::{Block, BlockData, MAX_COLUMNS_PER_BLOCK, MAX_ROWS_PER_BLOCK, MAX_UNCOMPRESSED_BLOCK_SIZE};
use logdb::stream::{merge_block_streams, BlockStreamReader, BlockStreamWriter, FinalizedPart, MergeOutcome};
use logdb::{Field, InmemoryPart, LogRows, StreamId, TenantId};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn sid(id: u128) -> StreamId {
    StreamId::new(TenantId::default(), id)
}

/// Part with `n` rows of stream `id` at timestamps `start, start + step, ...`
fn make_part(id: u128, start: i64, step: i64, n: usize) -> InmemoryPart {
    let mut lr = LogRows::new();
    for i in 0..n {
        let ts = start + i as i64 * step;
        lr.must_add_with_stream_id(
            sid(id),
            ts,
            vec![
                Field::new("seq", ts.to_string()),
                Field::new("source", format!("part-{}-{}", id, start)),
            ],
        );
    }
    InmemoryPart::from_log_rows(&mut lr).unwrap()
}

/// Like `make_part`, but every row carries a message of `msg_len` bytes
fn make_wide_part(id: u128, start: i64, step: i64, n: usize, msg_len: usize) -> InmemoryPart {
    let mut lr = LogRows::new();
    for i in 0..n {
        let ts = start + i as i64 * step;
        let mut msg = format!("{} ", ts);
        msg.extend(std::iter::repeat('x').take(msg_len.saturating_sub(msg.len())));
        lr.must_add_with_stream_id(
            sid(id),
            ts,
            vec![Field::new("seq", ts.to_string()), Field::new("_msg", msg)],
        );
    }
    InmemoryPart::from_log_rows(&mut lr).unwrap()
}

/// Part whose rows all carry the same `width` columns `{prefix}_0, {prefix}_1, ...`
fn make_columns_part(id: u128, prefix: &str, start: i64, step: i64, n: usize, width: usize) -> InmemoryPart {
    let mut lr = LogRows::new();
    for i in 0..n {
        let ts = start + i as i64 * step;
        let fields = (0..width)
            .map(|c| Field::new(format!("{}_{}", prefix, c), format!("{}-{}", ts, c)))
            .collect();
        lr.must_add_with_stream_id(sid(id), ts, fields);
    }
    InmemoryPart::from_log_rows(&mut lr).unwrap()
}

fn read_blocks(mut bsr: BlockStreamReader) -> Vec<BlockData> {
    let mut out = Vec::new();
    while bsr.next_block().unwrap() {
        out.push(bsr.take_block_data().unwrap());
    }
    out
}

/// Timestamps of every row, sorted
fn sorted_timestamps(blocks: &[BlockData]) -> Vec<i64> {
    let mut ts: Vec<i64> = blocks
        .iter()
        .flat_map(|bd| Block::from_block_data(bd).unwrap().timestamps().to_vec())
        .collect();
    ts.sort_unstable();
    ts
}

fn expected_timestamps(ranges: &[(i64, i64, usize)]) -> Vec<i64> {
    let mut ts: Vec<i64> = ranges
        .iter()
        .flat_map(|&(start, step, n)| (0..n).map(move |i| start + i as i64 * step))
        .collect();
    ts.sort_unstable();
    ts
}

fn assert_block_order(blocks: &[BlockData]) {
    for w in blocks.windows(2) {
        assert!(w[0].stream_id <= w[1].stream_id);
        if w[0].stream_id == w[1].stream_id {
            assert!(w[0].timestamps.min_timestamp <= w[1].timestamps.min_timestamp);
        }
    }
    assert!(blocks.iter().all(|bd| bd.rows_count as usize <= MAX_ROWS_PER_BLOCK));
}

fn readers(parts: &[&InmemoryPart]) -> Vec<BlockStreamReader> {
    parts
        .iter()
        .map(|mp| BlockStreamReader::from_inmemory_part(mp).unwrap())
        .collect()
}

fn merge_inmemory(parts: &[&InmemoryPart]) -> InmemoryPart {
    let outcome = merge_block_streams(BlockStreamWriter::for_inmemory_part(), readers(parts), None).unwrap();
    match outcome {
        MergeOutcome::Completed(FinalizedPart::Inmemory(mp)) => mp,
        other => panic!("unexpected merge outcome: {:?}", other),
    }
}

fn read_all(mut bsr: BlockStreamReader) -> Vec<(StreamId, i64)> {
    let mut out = Vec::new();
    while bsr.next_block().unwrap() {
        let bd = bsr.block_data().unwrap();
        let block = Block::from_block_data(bd).unwrap();
        out.extend(block.timestamps().iter().map(|&ts| (bd.stream_id, ts)));
    }
    out
}

// =============================================================================
// Merge Tests
// =============================================================================

#[test]
fn test_merge_interleaves_same_stream() {
    let a = make_part(1, 0, 2, 100);
    let b = make_part(1, 1, 2, 100);
    let merged = merge_inmemory(&[&a, &b]);

    assert_eq!(merged.header().rows_count, 200);
    assert_eq!(merged.header().min_timestamp, 0);
    assert_eq!(merged.header().max_timestamp, 199);

    let rows = read_all(BlockStreamReader::from_inmemory_part(&merged).unwrap());
    let expected: Vec<(StreamId, i64)> = (0..200).map(|ts| (sid(1), ts)).collect();
    assert_eq!(rows, expected);
}

#[test]
fn test_merge_orders_streams() {
    let a = make_part(3, 0, 1, 10);
    let b = make_part(1, 100, 1, 10);
    let c = make_part(2, 50, 1, 10);
    let merged = merge_inmemory(&[&a, &b, &c]);

    let rows = read_all(BlockStreamReader::from_inmemory_part(&merged).unwrap());
    assert_eq!(rows.len(), 30);
    assert!(rows.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(rows[0].0, sid(1));
    assert_eq!(rows[29].0, sid(3));
}

#[test]
fn test_merge_preserves_totals() {
    let parts: Vec<InmemoryPart> = (0..5).map(|i| make_part(i % 2, i as i64 * 1_000, 3, 500)).collect();
    let refs: Vec<&InmemoryPart> = parts.iter().collect();
    let merged = merge_inmemory(&refs);

    let rows: u64 = parts.iter().map(|p| p.header().rows_count).sum();
    let size: u64 = parts.iter().map(|p| p.header().uncompressed_size_bytes).sum();
    assert_eq!(merged.header().rows_count, rows);
    assert_eq!(merged.header().uncompressed_size_bytes, size);
}

#[test]
fn test_merge_is_deterministic() {
    let a = make_part(1, 0, 5, 300);
    let b = make_part(1, 2, 5, 300);
    let c = make_part(2, 0, 1, 300);

    let first = merge_inmemory(&[&a, &b, &c]);
    let second = merge_inmemory(&[&a, &b, &c]);
    assert_eq!(first.header(), second.header());
    assert_eq!(first.files().timestamps, second.files().timestamps);
    assert_eq!(first.files().index, second.files().index);
}

#[test]
fn test_merge_into_file_part() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("merged");
    fs::create_dir(&path).unwrap();

    let a = make_part(1, 0, 1, 1_000);
    let b = make_part(2, 0, 1, 1_000);
    let writer = BlockStreamWriter::create_file_part(&path).unwrap();
    let outcome = merge_block_streams(writer, readers(&[&a, &b]), None).unwrap();
    let header = match outcome {
        MergeOutcome::Completed(FinalizedPart::File { header, .. }) => header,
        other => panic!("unexpected merge outcome: {:?}", other),
    };
    assert_eq!(header.rows_count, 2_000);

    let rows = read_all(BlockStreamReader::open_file_part(&path).unwrap());
    assert_eq!(rows.len(), 2_000);
}

#[test]
fn test_merge_stops_when_channel_closed() {
    let a = make_part(1, 0, 1, 10);
    let b = make_part(2, 0, 1, 10);
    let (tx, rx) = channel::bounded::<()>(0);
    drop(tx);

    let outcome = merge_block_streams(BlockStreamWriter::for_inmemory_part(), readers(&[&a, &b]), Some(&rx)).unwrap();
    assert!(matches!(outcome, MergeOutcome::Stopped));
}

#[test]
fn test_merge_runs_while_channel_open() {
    let a = make_part(1, 0, 1, 10);
    let (_tx, rx) = channel::bounded::<()>(0);
    let outcome = merge_block_streams(BlockStreamWriter::for_inmemory_part(), readers(&[&a]), Some(&rx)).unwrap();
    assert!(matches!(outcome, MergeOutcome::Completed(_)));
}

// =============================================================================
// Large Block Tests
// =============================================================================

#[test]
fn test_merge_overlapping_large_rows_of_one_stream() {
    let a = make_wide_part(1, 0, 3, 8_000, 210);
    let b = make_wide_part(1, 1, 3, 8_000, 210);
    let c = make_wide_part(1, 2, 3, 100, 210);
    assert!(a.header().uncompressed_size_bytes + b.header().uncompressed_size_bytes > MAX_UNCOMPRESSED_BLOCK_SIZE);

    let merged = merge_inmemory(&[&a, &b, &c]);
    assert_eq!(merged.header().rows_count, 16_100);
    assert_eq!(
        merged.header().uncompressed_size_bytes,
        a.header().uncompressed_size_bytes + b.header().uncompressed_size_bytes + c.header().uncompressed_size_bytes
    );

    let blocks = read_blocks(BlockStreamReader::from_inmemory_part(&merged).unwrap());
    assert!(blocks.len() > 1);
    assert_block_order(&blocks);
    assert_eq!(
        sorted_timestamps(&blocks),
        expected_timestamps(&[(0, 3, 8_000), (1, 3, 8_000), (2, 3, 100)])
    );
}

#[test]
fn test_merge_full_block_after_pending_rows() {
    let p = make_part(1, 0, 2, 100);
    let s = make_part(1, 1, 2, 100);
    let f = make_wide_part(1, 5, 2, 3_000, 1_000);
    let f_blocks = read_blocks(BlockStreamReader::from_inmemory_part(&f).unwrap());
    assert!(f_blocks[0].uncompressed_size_bytes >= MAX_UNCOMPRESSED_BLOCK_SIZE);

    let merged = merge_inmemory(&[&p, &s, &f]);
    assert_eq!(merged.header().rows_count, 3_200);

    let blocks = read_blocks(BlockStreamReader::from_inmemory_part(&merged).unwrap());
    assert_block_order(&blocks);
    // The full block is copied unchanged
    assert!(blocks.iter().any(|bd| bd.rows_count == f_blocks[0].rows_count
        && bd.timestamps.min_timestamp == f_blocks[0].timestamps.min_timestamp
        && bd.uncompressed_size_bytes == f_blocks[0].uncompressed_size_bytes));
    assert_eq!(
        sorted_timestamps(&blocks),
        expected_timestamps(&[(0, 2, 100), (1, 2, 100), (5, 2, 3_000)])
    );
}

#[test]
fn test_merge_splits_blocks_over_column_limit() {
    let width = MAX_COLUMNS_PER_BLOCK * 3 / 5;
    let a = make_columns_part(1, "a", 0, 2, 10, width);
    let b = make_columns_part(1, "b", 1, 2, 10, width);
    let c = make_part(1, 100, 1, 10);

    let merged = merge_inmemory(&[&a, &b, &c]);
    assert_eq!(merged.header().rows_count, 30);

    let blocks = read_blocks(BlockStreamReader::from_inmemory_part(&merged).unwrap());
    assert!(blocks.len() >= 2);
    assert_block_order(&blocks);
    for bd in &blocks {
        assert!(bd.columns.len() + bd.const_columns.len() <= MAX_COLUMNS_PER_BLOCK);
    }
    assert_eq!(
        sorted_timestamps(&blocks),
        expected_timestamps(&[(0, 2, 10), (1, 2, 10), (100, 1, 10)])
    );
}
