//! Tests for block stream writing and reading
//!
//! These tests verify:
//! - In-memory and file parts read back the rows written into them
//! - Writers reject out-of-order blocks
//! - Columns are spread over bloom/values shards in file parts
//! - Readers report truncated files and header mismatches

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use logdb::format::{
    bloom_shard_path, values_shard_path, Block, PartHeader, INDEX_FILENAME, METADATA_FILENAME,
    METAINDEX_FILENAME, MAX_ROWS_PER_BLOCK, TIMESTAMPS_FILENAME,
};
use logdb::stream::{BlockStreamReader, BlockStreamWriter, FinalizedPart};
use logdb::{Field, InmemoryPart, LogDbError, StreamId, TenantId};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_part() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("part");
    fs::create_dir(&path).unwrap();
    (temp_dir, path)
}

fn sid(id: u128) -> StreamId {
    StreamId::new(TenantId::new(0, 0), id)
}

fn rows_for(n: usize, tag: &str) -> (Vec<i64>, Vec<Vec<Field>>) {
    let timestamps = (0..n as i64).map(|i| i * 1_000).collect();
    let rows = (0..n)
        .map(|i| {
            vec![
                Field::new("level", ["debug", "info", "warn"][i % 3]),
                Field::new("msg", format!("{} event {}", tag, i)),
            ]
        })
        .collect();
    (timestamps, rows)
}

/// Every row of the part as (stream, timestamp, fields), in storage order
fn read_all(bsr: &mut BlockStreamReader) -> Vec<(StreamId, i64, Vec<Field>)> {
    let mut out = Vec::new();
    while bsr.next_block().unwrap() {
        let bd = bsr.block_data().unwrap();
        let block = Block::from_block_data(bd).unwrap();
        for (ts, row) in block.timestamps().iter().zip(block.to_rows()) {
            out.push((bd.stream_id, *ts, row));
        }
    }
    out
}

fn into_inmemory(fp: FinalizedPart) -> InmemoryPart {
    match fp {
        FinalizedPart::Inmemory(mp) => mp,
        FinalizedPart::File { path, .. } => panic!("expected in-memory part, got {}", path.display()),
    }
}

fn write_file_part(path: &Path, streams: &[(u128, usize)]) -> PartHeader {
    let mut bsw = BlockStreamWriter::create_file_part(path).unwrap();
    for &(id, n) in streams {
        let (ts, rows) = rows_for(n, &format!("s{}", id));
        bsw.write_rows(&sid(id), &ts, &rows).unwrap();
    }
    *bsw.finalize().unwrap().header()
}

// =============================================================================
// Write/Read Tests
// =============================================================================

#[test]
fn test_inmemory_part_roundtrip() {
    let mut bsw = BlockStreamWriter::for_inmemory_part();
    let (ts1, rows1) = rows_for(10, "a");
    let (ts2, rows2) = rows_for(5, "b");
    bsw.write_rows(&sid(1), &ts1, &rows1).unwrap();
    bsw.write_rows(&sid(2), &ts2, &rows2).unwrap();
    assert_eq!(bsw.rows_count(), 15);
    assert_eq!(bsw.blocks_count(), 2);

    let mp = into_inmemory(bsw.finalize().unwrap());
    let ph = mp.header();
    assert_eq!(ph.rows_count, 15);
    assert_eq!(ph.blocks_count, 2);
    assert_eq!(ph.min_timestamp, 0);
    assert_eq!(ph.max_timestamp, 9_000);
    assert_eq!(ph.compressed_size_bytes, mp.files().size_bytes());

    let mut bsr = BlockStreamReader::from_inmemory_part(&mp).unwrap();
    let got = read_all(&mut bsr);
    assert_eq!(got.len(), 15);
    assert_eq!(got[0], (sid(1), 0, rows1[0].clone()));
    assert_eq!(got[14], (sid(2), 4_000, rows2[4].clone()));
}

#[test]
fn test_file_part_roundtrip() {
    let (_temp, path) = setup_temp_part();
    let ph = write_file_part(&path, &[(1, 100), (2, MAX_ROWS_PER_BLOCK + 1)]);

    assert_eq!(ph.rows_count, 100 + MAX_ROWS_PER_BLOCK as u64 + 1);
    assert_eq!(ph.blocks_count, 3);
    for name in [METADATA_FILENAME, METAINDEX_FILENAME, INDEX_FILENAME, TIMESTAMPS_FILENAME] {
        assert!(path.join(name).exists(), "missing {}", name);
    }
    assert_eq!(PartHeader::read_from_dir(&path).unwrap(), ph);

    let mut bsr = BlockStreamReader::open_file_part(&path).unwrap();
    let got = read_all(&mut bsr);
    assert_eq!(got.len() as u64, ph.rows_count);
    assert!(got.windows(2).all(|w| (w[0].0, w[0].1) <= (w[1].0, w[1].1)));
}

#[test]
fn test_empty_part() {
    let mp = into_inmemory(BlockStreamWriter::for_inmemory_part().finalize().unwrap());
    assert_eq!(mp.header().rows_count, 0);
    assert_eq!(mp.header().blocks_count, 0);
    let mut bsr = BlockStreamReader::from_inmemory_part(&mp).unwrap();
    assert!(!bsr.next_block().unwrap());
}

#[test]
fn test_writer_rejects_decreasing_stream_ids() {
    let mut bsw = BlockStreamWriter::for_inmemory_part();
    let (ts, rows) = rows_for(3, "x");
    bsw.write_rows(&sid(5), &ts, &rows).unwrap();
    let err = bsw.write_rows(&sid(4), &ts, &rows).unwrap_err();
    assert!(matches!(err, LogDbError::InvariantViolation(_)));
}

#[test]
fn test_writer_rejects_decreasing_min_timestamp() {
    let mut bsw = BlockStreamWriter::for_inmemory_part();
    let (ts, rows) = rows_for(3, "x");
    let later: Vec<i64> = ts.iter().map(|t| t + 10_000).collect();
    bsw.write_rows(&sid(1), &later, &rows).unwrap();
    let err = bsw.write_rows(&sid(1), &ts, &rows).unwrap_err();
    assert!(matches!(err, LogDbError::InvariantViolation(_)));
}

#[test]
fn test_columns_spread_over_shards() {
    let (_temp, path) = setup_temp_part();
    let mut bsw = BlockStreamWriter::create_file_part(&path).unwrap();
    let timestamps: Vec<i64> = (0..20).collect();
    let rows: Vec<Vec<Field>> = (0..20)
        .map(|i| {
            let mut row: Vec<Field> = (0..300)
                .map(|c| Field::new(format!("col{:03}", c), format!("v{}-{}", c, i)))
                .collect();
            row.sort_by(|a, b| a.name.cmp(&b.name));
            row
        })
        .collect();
    bsw.write_rows(&sid(1), &timestamps, &rows).unwrap();
    let ph = *bsw.finalize().unwrap().header();

    assert!(ph.bloom_values_shards_count > 1);
    assert!(ph.bloom_values_shards_count <= 128);
    for shard in 0..ph.bloom_values_shards_count {
        assert!(bloom_shard_path(&path, shard).exists());
        assert!(values_shard_path(&path, shard).exists());
    }

    let mut bsr = BlockStreamReader::open_file_part(&path).unwrap();
    let got = read_all(&mut bsr);
    assert_eq!(got.len(), 20);
    assert_eq!(got[7].2, rows[7]);
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_truncated_timestamps_file() {
    let (_temp, path) = setup_temp_part();
    write_file_part(&path, &[(1, 100)]);
    OpenOptions::new()
        .write(true)
        .open(path.join(TIMESTAMPS_FILENAME))
        .unwrap()
        .set_len(0)
        .unwrap();

    let mut bsr = BlockStreamReader::open_file_part(&path).unwrap();
    assert!(bsr.next_block().is_err());
}

#[test]
fn test_header_rows_mismatch() {
    let (_temp, path) = setup_temp_part();
    let mut ph = write_file_part(&path, &[(1, 100), (2, 50)]);
    ph.rows_count += 1;
    ph.write_to_dir(&path).unwrap();

    let mut bsr = BlockStreamReader::open_file_part(&path).unwrap();
    let err = loop {
        match bsr.next_block() {
            Ok(true) => continue,
            Ok(false) => panic!("reader accepted a part with a wrong row count"),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, LogDbError::Corruption { .. }));
}

#[test]
fn test_missing_metadata() {
    let (_temp, path) = setup_temp_part();
    write_file_part(&path, &[(1, 10)]);
    fs::remove_file(path.join(METADATA_FILENAME)).unwrap();
    assert!(BlockStreamReader::open_file_part(&path).is_err());
}
