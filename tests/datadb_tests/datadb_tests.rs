//! Tests for Datadb
//!
//! These tests verify:
//! - Opening/creating partition directories
//! - Ingestion through the row buffer and flushing to file parts
//! - Persistence across close/reopen
//! - Background and forced merges conserve rows
//! - Recovery: orphan directories and a missing parts list
//! - Disk space accounting for merges
//! - Merge counters, including the flush of a lone in-memory part

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use logdb::datadb::part_dir_name;
use logdb::format::PARTS_FILENAME;
use logdb::{Datadb, DatadbConfig, DatadbStats, DiskBudget, Field, LogDbError, LogRows, TenantId};
use parking_lot::Mutex;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_partition() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("partition");
    (temp_dir, path)
}

fn budget_with_free_space(bytes: u64) -> Arc<DiskBudget> {
    Arc::new(DiskBudget::with_free_space_fn(move |_: &Path| Ok(bytes)))
}

/// Config with long timers so that tests decide when data moves
fn test_config(path: &Path, errors: &Arc<Mutex<Vec<String>>>) -> DatadbConfig {
    let sink = Arc::clone(errors);
    DatadbConfig::builder()
        .path(path)
        .flush_interval(Duration::from_secs(3600))
        .rows_buffer_flush_interval(Duration::from_secs(3600))
        .rows_buffer_shards(2)
        .merge_workers(2)
        .memory_allowed_bytes(64 * 1024 * 1024)
        .disk_budget(budget_with_free_space(1 << 40))
        .fatal_handler(move |e: &LogDbError| sink.lock().push(e.to_string()))
        .build()
}

fn open(path: &Path) -> (Datadb, Arc<Mutex<Vec<String>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let db = Datadb::open(test_config(path, &errors)).unwrap();
    (db, errors)
}

fn batch(start: usize, n: usize) -> LogRows {
    let mut lr = LogRows::with_stream_fields(&["app"]);
    for i in start..start + n {
        lr.must_add(
            TenantId::new(1, 1),
            i as i64 * 1_000,
            vec![
                Field::new("app", ["web", "worker", "cron"][i % 3]),
                Field::new("level", ["info", "warn"][i % 2]),
                Field::new("_msg", format!("processed job {}", i)),
            ],
        );
    }
    lr
}

fn stats(db: &Datadb) -> DatadbStats {
    let mut s = DatadbStats::default();
    db.update_stats(&mut s);
    s
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

fn listed_parts(path: &Path) -> Vec<String> {
    let data = fs::read(path.join(PARTS_FILENAME)).unwrap();
    serde_json::from_slice(&data).unwrap()
}

// =============================================================================
// Open/Create Tests
// =============================================================================

#[test]
fn test_open_creates_partition() {
    let (_temp, path) = setup_temp_partition();
    assert!(!path.exists());

    let (db, errors) = open(&path);
    assert!(path.is_dir());
    assert!(path.join(PARTS_FILENAME).exists());
    assert!(listed_parts(&path).is_empty());
    assert_eq!(stats(&db), DatadbStats::default());

    db.close().unwrap();
    assert!(errors.lock().is_empty());
}

#[test]
fn test_open_rejects_invalid_config() {
    let (_temp, path) = setup_temp_partition();
    let config = DatadbConfig::builder().path(&path).merge_workers(0).build();
    assert!(matches!(Datadb::open(config), Err(LogDbError::Config(_))));
}

// =============================================================================
// Ingestion Tests
// =============================================================================

#[test]
fn test_rows_stay_pending_until_flush() {
    let (_temp, path) = setup_temp_partition();
    let (db, _errors) = open(&path);

    db.must_add_rows(&batch(0, 100)).unwrap();
    let s = stats(&db);
    assert_eq!(s.pending_rows, 100);
    assert_eq!(s.rows_count(), 0);

    db.debug_flush().unwrap();
    let s = stats(&db);
    assert_eq!(s.pending_rows, 0);
    assert_eq!(s.rows_count(), 100);
    assert_eq!(s.inmemory.parts_count, 0);
    assert!(s.small.parts_count >= 1);
    assert_eq!(listed_parts(&path).len() as u64, s.small.parts_count + s.big.parts_count);

    db.close().unwrap();
}

#[test]
fn test_timer_moves_rows_into_parts() {
    let (_temp, path) = setup_temp_partition();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let mut config = test_config(&path, &errors);
    config.rows_buffer_flush_interval = Duration::from_millis(20);
    config.flush_interval = Duration::from_millis(50);
    let db = Datadb::open(config).unwrap();

    db.must_add_rows(&batch(0, 50)).unwrap();
    assert!(wait_for(Duration::from_secs(10), || {
        let s = stats(&db);
        s.small.rows_count == 50
    }));
    assert!(!listed_parts(&path).is_empty());

    db.close().unwrap();
    assert!(errors.lock().is_empty());
}

#[test]
fn test_add_after_close_fails() {
    let (_temp, path) = setup_temp_partition();
    let (db, _errors) = open(&path);
    db.close().unwrap();
    assert!(matches!(db.must_add_rows(&batch(0, 1)), Err(LogDbError::Closed)));
    assert!(matches!(db.debug_flush(), Err(LogDbError::Closed)));
    // Closing twice is a no-op
    db.close().unwrap();
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_reopen_keeps_rows() {
    let (_temp, path) = setup_temp_partition();
    {
        let (db, errors) = open(&path);
        db.must_add_rows(&batch(0, 1_000)).unwrap();
        db.debug_flush().unwrap();
        db.must_add_rows(&batch(1_000, 500)).unwrap();
        db.debug_flush().unwrap();
        db.close().unwrap();
        assert!(errors.lock().is_empty());
    }

    let (db, _errors) = open(&path);
    let s = stats(&db);
    assert_eq!(s.rows_count(), 1_500);
    assert_eq!(s.inmemory.parts_count, 0);
    db.close().unwrap();
}

#[test]
fn test_close_flushes_buffered_rows() {
    let (_temp, path) = setup_temp_partition();
    {
        let (db, _errors) = open(&path);
        db.must_add_rows(&batch(0, 321)).unwrap();
        db.close().unwrap();
    }
    let (db, _errors) = open(&path);
    assert_eq!(stats(&db).rows_count(), 321);
    db.close().unwrap();
}

#[test]
fn test_drop_closes() {
    let (_temp, path) = setup_temp_partition();
    {
        let (db, _errors) = open(&path);
        db.must_add_rows(&batch(0, 10)).unwrap();
    }
    let (db, _errors) = open(&path);
    assert_eq!(stats(&db).rows_count(), 10);
    db.close().unwrap();
}

// =============================================================================
// Merge Tests
// =============================================================================

#[test]
fn test_background_merge_of_equal_parts() {
    let (_temp, path) = setup_temp_partition();
    let (db, errors) = open(&path);

    for i in 0..20 {
        db.must_add_rows(&batch(i * 200, 200)).unwrap();
        db.debug_flush().unwrap();
    }

    assert!(wait_for(Duration::from_secs(30), || {
        let s = stats(&db);
        s.small.active_merges == 0 && s.parts_count() <= 14
    }));
    let s = stats(&db);
    assert_eq!(s.rows_count(), 4_000);
    assert!(s.small.merges_total >= 1);
    assert_eq!(listed_parts(&path).len() as u64, s.parts_count());

    db.close().unwrap();
    assert!(errors.lock().is_empty());
}

#[test]
fn test_flush_of_single_inmemory_part_counts_as_merge() {
    let (_temp, path) = setup_temp_partition();
    let (db, errors) = open(&path);

    db.must_add_rows(&batch(0, 50)).unwrap();
    db.debug_flush().unwrap();

    let s = stats(&db);
    assert_eq!(s.small.merges_total, 1);
    assert_eq!(s.small.active_merges, 0);
    assert_eq!(s.small.rows_merged, 50);
    assert_eq!(s.small.parts_count, 1);
    assert_eq!(s.inmemory.merges_total, 0);

    db.close().unwrap();
    assert!(errors.lock().is_empty());
}

#[test]
fn test_debug_flush_waits_for_inmemory_merges() {
    let (_temp, path) = setup_temp_partition();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let mut config = test_config(&path, &errors);
    config.rows_buffer_flush_interval = Duration::from_millis(5);
    let db = Datadb::open(config).unwrap();

    // Timer flushes turn each batch into its own in-memory part
    for i in 0..30 {
        db.must_add_rows(&batch(i * 20, 20)).unwrap();
        thread::sleep(Duration::from_millis(15));
    }
    db.debug_flush().unwrap();

    let s = stats(&db);
    assert_eq!(s.inmemory.parts_count, 0);
    assert_eq!(s.inmemory.active_merges, 0);
    assert_eq!(s.pending_rows, 0);
    assert_eq!(s.rows_count(), 600);

    db.close().unwrap();
    assert!(errors.lock().is_empty());
}

#[test]
fn test_force_merge_into_single_part() {
    let (_temp, path) = setup_temp_partition();
    let (db, errors) = open(&path);

    for i in 0..5 {
        db.must_add_rows(&batch(i * 100, 100)).unwrap();
        db.debug_flush().unwrap();
    }
    assert_eq!(stats(&db).parts_count(), 5);

    db.force_merge().unwrap();
    let s = stats(&db);
    assert_eq!(s.parts_count(), 1);
    assert_eq!(s.rows_count(), 500);

    // Only the merged part's directory is left
    let listed = listed_parts(&path);
    assert_eq!(listed.len(), 1);
    let dirs: Vec<String> = fs::read_dir(&path)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(dirs, listed);

    db.close().unwrap();
    assert!(errors.lock().is_empty());
}

#[test]
fn test_acquired_parts_outlive_merge() {
    let (_temp, path) = setup_temp_partition();
    let (db, _errors) = open(&path);

    for i in 0..3 {
        db.must_add_rows(&batch(i * 100, 100)).unwrap();
        db.debug_flush().unwrap();
    }
    let refs = db.acquire_parts();
    assert_eq!(refs.len(), 3);
    assert!(refs.iter().all(|p| p.ref_count() >= 2));
    let old_paths: Vec<PathBuf> = refs.iter().map(|p| p.path().to_path_buf()).collect();

    db.force_merge().unwrap();
    assert_eq!(stats(&db).parts_count(), 1);

    // Replaced parts stay readable while referenced
    for p in &refs {
        assert!(p.path().is_dir());
        let ih = p.index_block_headers()[0];
        assert!(!p.read_block_headers(&ih).unwrap().is_empty());
    }

    drop(refs);
    for p in &old_paths {
        assert!(!p.exists(), "{} was not removed", p.display());
    }
    db.close().unwrap();
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_orphan_directory_removed_on_open() {
    let (_temp, path) = setup_temp_partition();
    {
        let (db, _errors) = open(&path);
        db.must_add_rows(&batch(0, 100)).unwrap();
        db.close().unwrap();
    }
    let orphan = path.join(part_dir_name(0xDEAD));
    fs::create_dir(&orphan).unwrap();
    fs::write(orphan.join("timestamps.bin"), b"partial").unwrap();
    fs::write(path.join("parts.json.tmp"), b"[").unwrap();

    let (db, _errors) = open(&path);
    assert!(!orphan.exists());
    assert!(!path.join("parts.json.tmp").exists());
    assert_eq!(stats(&db).rows_count(), 100);
    db.close().unwrap();
}

#[test]
fn test_missing_parts_list_with_parts_is_corruption() {
    let (_temp, path) = setup_temp_partition();
    {
        let (db, _errors) = open(&path);
        db.must_add_rows(&batch(0, 100)).unwrap();
        db.close().unwrap();
    }
    fs::remove_file(path.join(PARTS_FILENAME)).unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let result = Datadb::open(test_config(&path, &errors));
    assert!(matches!(result, Err(LogDbError::Corruption { .. })));
}

// =============================================================================
// Disk Budget Tests
// =============================================================================

#[test]
fn test_final_flush_ignores_missing_disk_space() {
    let (_temp, path) = setup_temp_partition();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let budget = budget_with_free_space(0);
    let mut config = test_config(&path, &errors);
    config.disk_budget = Arc::clone(&budget);
    let db = Datadb::open(config).unwrap();

    for i in 0..3 {
        db.must_add_rows(&batch(i * 50, 50)).unwrap();
        db.debug_flush().unwrap();
    }
    assert_eq!(stats(&db).rows_count(), 150);
    assert_eq!(budget.reserved(), 0);

    db.close().unwrap();
    assert!(errors.lock().is_empty());
}

#[test]
fn test_reservations_released_after_merges() {
    let (_temp, path) = setup_temp_partition();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let budget = budget_with_free_space(1 << 40);
    let mut config = test_config(&path, &errors);
    config.disk_budget = Arc::clone(&budget);
    let db = Datadb::open(config).unwrap();

    for i in 0..4 {
        db.must_add_rows(&batch(i * 50, 50)).unwrap();
        db.debug_flush().unwrap();
    }
    db.force_merge().unwrap();
    assert_eq!(budget.reserved(), 0);
    db.close().unwrap();
}

#[test]
fn test_open_rejects_file_path() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("not_a_dir");
    fs::write(&path, b"x").unwrap();
    let errors = Arc::new(Mutex::new(Vec::new()));
    assert!(matches!(
        Datadb::open(test_config(&path, &errors)),
        Err(LogDbError::InvalidInput(_))
    ));
}
