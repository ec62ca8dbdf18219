//! Datadb Module
//!
//! One partition of stored rows.
//!
//! ## Responsibilities
//! - Buffer incoming rows and pack them into in-memory parts
//! - Keep three tiers of parts: in-memory, small on-disk and big on-disk
//! - Run background merges per tier and flush in-memory parts to disk
//! - Swap merged parts atomically and persist the list of file parts
//! - Defer closing and deleting parts until no reader references them
//!
//! ## Partition Directory
//!
//! ```text
//! {path}/
//!   ├── parts.json            names of the small and big file parts
//!   └── {016X merge idx}/     one directory per file part
//! ```
//!
//! ## Concurrency:
//! - `state`: one mutex guards tier membership and merge claims; never held during I/O
//! - Reference counts of parts are lock-free atomics
//! - Per-tier semaphores bound concurrent merges
//! - Closing the stop channel tells background workers to finish

mod disk_budget;
mod merge_select;
mod part_wrapper;
mod parts_list;
mod rows_buffer;
mod stats;

pub use disk_budget::{DiskBudget, DiskReservation, FreeSpaceFn};
pub use merge_select::{
    append_parts_to_merge, get_parts_for_optimal_merge, PartCandidate, DEFAULT_PARTS_TO_MERGE,
    MIN_MERGE_MULTIPLIER,
};
pub use part_wrapper::{PartRef, PartType};
pub use parts_list::part_dir_name;
pub use stats::{DatadbStats, TierStats};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use crossbeam::sync::WaitGroup;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{DatadbConfig, MAX_BIG_PART_SIZE};
use crate::error::{LogDbError, Result};
use crate::fsutil;
use crate::part::{InmemoryPart, Part};
use crate::rows::LogRows;
use crate::stream::{
    merge_block_streams, need_stop, BlockStreamReader, BlockStreamWriter, FinalizedPart,
    MergeOutcome,
};

use part_wrapper::PartWrapper;
use rows_buffer::RowsBuffer;

/// In-memory parts above this count make ingestion help with merging
const MAX_INMEMORY_PARTS: usize = 20;

/// Merges running longer than this are logged
const SLOW_MERGE_THRESHOLD: Duration = Duration::from_secs(60);

// =============================================================================
// Shared State
// =============================================================================

#[derive(Default)]
struct PartsState {
    parts: HashMap<u64, Arc<PartWrapper>>,
    tiers: [BTreeSet<u64>; 3],
    in_merge: HashSet<u64>,
    active_mergers: [usize; 3],
    stopped: bool,
}

impl PartsState {
    fn insert(&mut self, pw: Arc<PartWrapper>, tier: PartType) {
        self.tiers[tier.index()].insert(pw.id);
        self.parts.insert(pw.id, pw);
    }

    fn remove(&mut self, id: u64) -> bool {
        for tier in &mut self.tiers {
            tier.remove(&id);
        }
        self.in_merge.remove(&id);
        self.parts.remove(&id).is_some()
    }

    fn tier_parts(&self, tier: PartType) -> impl Iterator<Item = &Arc<PartWrapper>> {
        self.tiers[tier.index()]
            .iter()
            .filter_map(move |id| self.parts.get(id))
    }

    /// Claim every part of `tier` matching `pred` for a merge
    fn claim(&mut self, tier: PartType, pred: impl Fn(&PartWrapper) -> bool) -> Vec<Arc<PartWrapper>> {
        let pws: Vec<Arc<PartWrapper>> = self
            .tier_parts(tier)
            .filter(|pw| !self.in_merge.contains(&pw.id) && pred(pw))
            .cloned()
            .collect();
        for pw in &pws {
            self.in_merge.insert(pw.id);
        }
        pws
    }

    /// Claim the best merge window of `tier`
    fn claim_parts_to_merge(&mut self, tier: PartType, max_out_bytes: u64) -> Vec<Arc<PartWrapper>> {
        let candidates: Vec<PartCandidate> = self
            .tier_parts(tier)
            .filter(|pw| !self.in_merge.contains(&pw.id))
            .map(|pw| candidate(pw))
            .collect();
        let mut ids = Vec::new();
        append_parts_to_merge(&mut ids, &candidates, max_out_bytes);
        let pws: Vec<Arc<PartWrapper>> = ids
            .iter()
            .filter_map(|id| self.parts.get(id).cloned())
            .collect();
        for pw in &pws {
            self.in_merge.insert(pw.id);
        }
        pws
    }

    fn file_part_names(&self) -> Vec<String> {
        self.tier_parts(PartType::Small)
            .chain(self.tier_parts(PartType::Big))
            .filter_map(|pw| pw.dir_name())
            .collect()
    }
}

fn candidate(pw: &PartWrapper) -> PartCandidate {
    let ph = pw.part.header();
    PartCandidate {
        id: pw.id,
        compressed_size_bytes: ph.compressed_size_bytes,
        min_timestamp: ph.min_timestamp,
    }
}

/// Counting semaphore over a bounded channel
struct Semaphore {
    tx: Sender<()>,
    rx: Receiver<()>,
}

struct SemaphoreGuard<'a>(&'a Semaphore);

impl Semaphore {
    fn new(n: usize) -> Self {
        let (tx, rx) = channel::bounded(n.max(1));
        Self { tx, rx }
    }

    fn acquire(&self) -> SemaphoreGuard<'_> {
        // Never fails: `self` keeps the receiver alive
        let _ = self.tx.send(());
        SemaphoreGuard(self)
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.rx.try_recv();
    }
}

#[derive(Default)]
struct TierCounters {
    merges_total: AtomicU64,
    active_merges: AtomicU64,
    rows_merged: AtomicU64,
}

impl TierCounters {
    /// Count a merge as started; it stays active until the guard drops
    fn start_merge(&self) -> ActiveMerge<'_> {
        self.merges_total.fetch_add(1, Ordering::Relaxed);
        self.active_merges.fetch_add(1, Ordering::Relaxed);
        ActiveMerge(&self.active_merges)
    }
}

struct ActiveMerge<'a>(&'a AtomicU64);

impl Drop for ActiveMerge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Inner {
    config: DatadbConfig,
    path: PathBuf,
    state: Mutex<PartsState>,
    /// Signaled whenever merged parts leave `in_merge`
    merge_done: Condvar,
    next_merge_idx: AtomicU64,

    /// Dropped to close the stop channel
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,

    merge_slots: [Semaphore; 3],
    counters: [TierCounters; 3],

    /// Tracks the flusher and merger threads
    workers_wg: Mutex<Option<WaitGroup>>,
}

// =============================================================================
// Datadb
// =============================================================================

/// A partition: row buffer, part tiers and their background workers
pub struct Datadb {
    inner: Arc<Inner>,
    rows_buffer: RowsBuffer,
    closed: AtomicBool,
}

impl Datadb {
    /// Open or create the partition at `config.path`
    ///
    /// On startup:
    /// 1. Read `parts.json`, creating it for a fresh partition
    /// 2. Remove part directories missing from the list and leftover temp files
    /// 3. Open every listed part and sort it into the small or big tier
    /// 4. Start the flusher and the mergers
    pub fn open(config: DatadbConfig) -> Result<Self> {
        config.validate()?;
        let path = config.path.clone();
        if path.exists() && !path.is_dir() {
            return Err(LogDbError::InvalidInput(format!(
                "partition path {} is not a directory",
                path.display()
            )));
        }
        fs::create_dir_all(&path)?;

        let names = parts_list::read_part_names(&path)?;
        parts_list::remove_unused_dirs(&path, &names)?;

        // Continue after the newest existing part so directory names never collide
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let newest = names
            .iter()
            .filter_map(|n| u64::from_str_radix(n, 16).ok())
            .max()
            .map_or(0, |n| n + 1);
        let next_merge_idx = seed.max(newest);

        let max_out_bytes = config.disk_budget.available(&path).min(MAX_BIG_PART_SIZE);
        let max_small_part_size = config.max_small_part_size(max_out_bytes);
        let mut state = PartsState::default();
        let mut next_id = next_merge_idx;
        for name in &names {
            let part = Part::open(&path.join(name))?;
            let tier = if part.header().compressed_size_bytes > max_small_part_size {
                PartType::Big
            } else {
                PartType::Small
            };
            state.insert(Arc::new(PartWrapper::new(next_id, part, None, None)), tier);
            next_id += 1;
        }
        let parts_count = state.parts.len();

        let (stop_tx, stop_rx) = channel::bounded(0);
        let workers = config.merge_workers;
        let inner = Arc::new(Inner {
            path: path.clone(),
            state: Mutex::new(state),
            merge_done: Condvar::new(),
            next_merge_idx: AtomicU64::new(next_id),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            merge_slots: [
                Semaphore::new(workers),
                Semaphore::new(workers),
                Semaphore::new(workers),
            ],
            counters: Default::default(),
            workers_wg: Mutex::new(Some(WaitGroup::new())),
            config,
        });

        let flush_target = Arc::clone(&inner);
        let rows_buffer = RowsBuffer::new(
            inner.config.rows_buffer_shards,
            inner.config.rows_buffer_flush_interval,
            Arc::new(move |lr: LogRows| flush_target.add_log_rows(lr)),
        );

        inner.start_flusher()?;
        {
            let mut st = inner.state.lock();
            for tier in PartType::ALL {
                inner.start_merger_locked(&mut st, tier);
            }
        }

        info!(path = %path.display(), parts = parts_count, "opened datadb");
        Ok(Self {
            inner,
            rows_buffer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Buffer rows for packing into parts
    pub fn must_add_rows(&self, lr: &LogRows) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LogDbError::Closed);
        }
        self.rows_buffer.must_add_rows(lr);
        Ok(())
    }

    /// Pack all buffered rows and write every in-memory part to disk
    ///
    /// Background in-memory merges hold their parts, so it waits for them
    /// and flushes their output too. No in-memory parts remain when it
    /// returns, unless rows keep arriving concurrently.
    pub fn debug_flush(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LogDbError::Closed);
        }
        self.rows_buffer.flush();
        loop {
            self.inner.flush_inmemory_parts_to_files(true)?;
            let mut st = self.inner.state.lock();
            while st
                .tier_parts(PartType::Inmemory)
                .any(|pw| st.in_merge.contains(&pw.id))
            {
                self.inner.merge_done.wait(&mut st);
            }
            if st.tiers[PartType::Inmemory.index()].is_empty() {
                return Ok(());
            }
        }
    }

    /// Flush in-memory parts, then merge all file parts into as few as possible
    pub fn force_merge(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LogDbError::Closed);
        }
        let start = Instant::now();
        self.inner.flush_inmemory_parts_to_files(true)?;

        let pws = {
            let mut st = self.inner.state.lock();
            let mut pws = st.claim(PartType::Small, |_| true);
            pws.extend(st.claim(PartType::Big, |_| true));
            pws
        };
        let parts = pws.len();
        self.inner.merge_in_groups(pws, PartType::Big, false)?;
        info!(
            path = %self.inner.path.display(),
            parts,
            duration_ms = start.elapsed().as_millis() as u64,
            "force merge finished"
        );
        Ok(())
    }

    /// Add this partition's counters to `s`
    pub fn update_stats(&self, s: &mut DatadbStats) {
        {
            let st = self.inner.state.lock();
            for tier in PartType::ALL {
                let ts = tier_stats(s, tier);
                for pw in st.tier_parts(tier) {
                    let ph = pw.part.header();
                    ts.rows_count += ph.rows_count;
                    ts.blocks_count += ph.blocks_count;
                    ts.compressed_size_bytes += ph.compressed_size_bytes;
                    ts.uncompressed_size_bytes += ph.uncompressed_size_bytes;
                    ts.parts_count += 1;
                }
            }
        }
        for tier in PartType::ALL {
            let c = &self.inner.counters[tier.index()];
            let ts = tier_stats(s, tier);
            ts.merges_total += c.merges_total.load(Ordering::Relaxed);
            ts.active_merges += c.active_merges.load(Ordering::Relaxed);
            ts.rows_merged += c.rows_merged.load(Ordering::Relaxed);
        }
        s.pending_rows += self.rows_buffer.pending_rows();
    }

    /// Reference-holding snapshot of all parts for readers
    pub fn acquire_parts(&self) -> Vec<PartRef> {
        let guard = self.inner.state.lock();
        let st: &PartsState = &guard;
        PartType::ALL
            .iter()
            .flat_map(|&tier| st.tier_parts(tier))
            .map(|pw| PartRef::new(Arc::clone(pw)))
            .collect()
    }

    /// Stop background work, write buffered data to disk and release all parts
    ///
    /// Parts still referenced through `PartRef` stay open until released.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let start = Instant::now();
        self.rows_buffer.close();

        {
            let mut st = self.inner.state.lock();
            st.stopped = true;
            self.inner.stop_tx.lock().take();
        }
        if let Some(wg) = self.inner.workers_wg.lock().take() {
            wg.wait();
        }

        self.inner.flush_inmemory_parts_to_files(true)?;

        let pws: Vec<Arc<PartWrapper>> = {
            let mut st = self.inner.state.lock();
            if !st.tiers[PartType::Inmemory.index()].is_empty() {
                return Err(LogDbError::InvariantViolation(format!(
                    "{} in-memory parts left after the final flush",
                    st.tiers[PartType::Inmemory.index()].len()
                )));
            }
            for tier in &mut st.tiers {
                tier.clear();
            }
            st.in_merge.clear();
            st.parts.drain().map(|(_, pw)| pw).collect()
        };
        for pw in pws {
            pw.dec_ref();
        }

        info!(
            path = %self.inner.path.display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "closed datadb"
        );
        Ok(())
    }
}

impl Drop for Datadb {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(path = %self.inner.path.display(), error = %e, "cannot close datadb");
        }
    }
}

fn tier_stats(s: &mut DatadbStats, tier: PartType) -> &mut TierStats {
    match tier {
        PartType::Inmemory => &mut s.inmemory,
        PartType::Small => &mut s.small,
        PartType::Big => &mut s.big,
    }
}

// =============================================================================
// Background Work
// =============================================================================

impl Inner {
    fn max_out_bytes(&self) -> u64 {
        self.config.disk_budget.available(&self.path).min(MAX_BIG_PART_SIZE)
    }

    fn handle_fatal(&self, err: LogDbError) {
        if !err.is_fatal() {
            warn!(path = %self.path.display(), error = %err, "background task stopped");
            return;
        }
        (self.config.fatal_handler)(&err);
    }

    /// Row buffer callback: pack a batch into a new in-memory part
    fn add_log_rows(self: &Arc<Self>, mut lr: LogRows) {
        let mp = match InmemoryPart::from_log_rows(&mut lr) {
            Ok(mp) => mp,
            Err(e) => return self.handle_fatal(e),
        };
        let part = match Part::from_inmemory_part(&mp) {
            Ok(part) => part,
            Err(e) => return self.handle_fatal(e),
        };
        let id = self.next_merge_idx.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + self.config.flush_interval;
        let pw = Arc::new(PartWrapper::new(id, part, Some(mp), Some(deadline)));

        let need_assist = {
            let mut st = self.state.lock();
            st.insert(pw, PartType::Inmemory);
            self.start_merger_locked(&mut st, PartType::Inmemory);
            st.tiers[PartType::Inmemory.index()].len() > MAX_INMEMORY_PARTS
        };
        if need_assist {
            self.assisted_merge_for_inmemory_parts();
        }
    }

    /// Merge in-memory parts on the ingesting thread when mergers fall behind
    fn assisted_merge_for_inmemory_parts(self: &Arc<Self>) {
        let pws = {
            let mut st = self.state.lock();
            if st.stopped {
                return;
            }
            st.claim_parts_to_merge(PartType::Inmemory, self.max_out_bytes())
        };
        if pws.is_empty() {
            return;
        }
        let _slot = self.merge_slots[PartType::Inmemory.index()].acquire();
        if let Err(e) = self.merge_parts(pws, false) {
            self.handle_fatal(e);
        }
    }

    fn start_flusher(self: &Arc<Self>) -> Result<()> {
        let wg = match self.workers_wg.lock().as_ref() {
            Some(wg) => wg.clone(),
            None => return Err(LogDbError::Closed),
        };
        let inner = Arc::clone(self);
        thread::Builder::new()
            .name("logdb-flusher".to_string())
            .spawn(move || {
                let ticker = channel::tick(inner.config.flush_interval);
                loop {
                    select! {
                        recv(inner.stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if let Err(e) = inner.flush_inmemory_parts_to_files(false) {
                                inner.handle_fatal(e);
                                break;
                            }
                        }
                    }
                }
                drop(wg);
            })?;
        Ok(())
    }

    /// Start another merger for `tier` unless the tier is at its worker limit
    fn start_merger_locked(self: &Arc<Self>, st: &mut PartsState, tier: PartType) {
        if st.stopped || st.active_mergers[tier.index()] >= self.config.merge_workers {
            return;
        }
        let wg = match self.workers_wg.lock().as_ref() {
            Some(wg) => wg.clone(),
            None => return,
        };
        st.active_mergers[tier.index()] += 1;
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("logdb-merger-{}", tier))
            .spawn(move || {
                inner.run_merger(tier);
                drop(wg);
            });
        if let Err(e) = spawned {
            st.active_mergers[tier.index()] -= 1;
            error!(tier = %tier, error = %e, "cannot start merger");
        }
    }

    /// Merge parts of `tier` until nothing qualifies or the stop channel closes
    fn run_merger(self: &Arc<Self>, tier: PartType) {
        loop {
            let pws = {
                let mut st = self.state.lock();
                let pws = if need_stop(Some(&self.stop_rx)) {
                    Vec::new()
                } else {
                    st.claim_parts_to_merge(tier, self.max_out_bytes())
                };
                if pws.is_empty() {
                    // Exit under the lock so a part added right now starts a new merger
                    st.active_mergers[tier.index()] -= 1;
                    return;
                }
                pws
            };
            let _slot = self.merge_slots[tier.index()].acquire();
            if let Err(e) = self.merge_parts(pws, false) {
                self.handle_fatal(e);
                self.state.lock().active_mergers[tier.index()] -= 1;
                return;
            }
        }
    }

    /// Write in-memory parts to disk; without `is_final` only overdue ones
    fn flush_inmemory_parts_to_files(self: &Arc<Self>, is_final: bool) -> Result<()> {
        let now = Instant::now();
        let pws = self.state.lock().claim(PartType::Inmemory, |pw| {
            is_final || pw.flush_deadline.map_or(true, |d| d <= now)
        });
        self.merge_in_groups(pws, PartType::Inmemory, true)
    }

    /// Merge `pws` in the best groups, one thread per group
    fn merge_in_groups(self: &Arc<Self>, pws: Vec<Arc<PartWrapper>>, slot: PartType, is_final: bool) -> Result<()> {
        if pws.is_empty() {
            return Ok(());
        }
        let by_id: HashMap<u64, Arc<PartWrapper>> = pws.iter().map(|pw| (pw.id, Arc::clone(pw))).collect();
        let mut candidates: Vec<PartCandidate> = pws.iter().map(|pw| candidate(pw)).collect();
        let mut groups = Vec::new();
        while !candidates.is_empty() {
            let (ids, rest) = get_parts_for_optimal_merge(&candidates);
            groups.push(
                ids.iter()
                    .filter_map(|id| by_id.get(id).cloned())
                    .collect::<Vec<_>>(),
            );
            candidates = rest;
        }

        let results = crossbeam::thread::scope(|s| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    s.spawn(move |_| {
                        let _slot = self.merge_slots[slot.index()].acquire();
                        self.merge_parts(group, is_final)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(LogDbError::InvariantViolation("merge thread panicked".to_string()))
                    })
                })
                .collect::<Vec<Result<()>>>()
        })
        .map_err(|_| LogDbError::InvariantViolation("merge thread panicked".to_string()))?;
        results.into_iter().collect()
    }

    fn get_dst_part_type(&self, pws: &[Arc<PartWrapper>], is_final: bool, max_out_bytes: u64) -> PartType {
        let size: u64 = pws.iter().map(|pw| pw.part.header().compressed_size_bytes).sum();
        if size > self.config.max_small_part_size(max_out_bytes) {
            return PartType::Big;
        }
        if is_final
            || size > self.config.max_inmemory_part_size()
            || !pws.iter().all(|pw| pw.is_inmemory())
        {
            return PartType::Small;
        }
        PartType::Inmemory
    }

    /// Merge the claimed parts `pws` into one part and swap it in
    ///
    /// Every merge writing to disk holds a disk reservation for its sources'
    /// size, the lone in-memory part of a final flush included. Non-final
    /// merges are skipped when the disk cannot take the output and abandoned
    /// when the stop channel closes; their sources go back to the pool.
    fn merge_parts(self: &Arc<Self>, pws: Vec<Arc<PartWrapper>>, is_final: bool) -> Result<()> {
        let claimed = pws.clone();
        let res = self.try_merge_parts(pws, is_final);
        if res.is_err() {
            self.release_from_merge(&claimed);
        }
        res
    }

    fn try_merge_parts(self: &Arc<Self>, pws: Vec<Arc<PartWrapper>>, is_final: bool) -> Result<()> {
        if pws.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let max_out_bytes = self.max_out_bytes();
        let dst_type = self.get_dst_part_type(&pws, is_final, max_out_bytes);
        let dst_size: u64 = pws.iter().map(|pw| pw.part.header().compressed_size_bytes).sum();

        let _reservation = if dst_type == PartType::Inmemory {
            None
        } else {
            match self.config.disk_budget.try_reserve(&self.path, dst_size) {
                Some(r) => Some(r),
                None if is_final => {
                    warn!(
                        path = %self.path.display(),
                        bytes = dst_size,
                        "not enough free disk space for a final merge; proceeding anyway"
                    );
                    None
                }
                None => {
                    warn!(
                        path = %self.path.display(),
                        bytes = dst_size,
                        parts = pws.len(),
                        "not enough free disk space; postponing merge"
                    );
                    self.release_from_merge(&pws);
                    return Ok(());
                }
            }
        };

        let counters = &self.counters[dst_type.index()];
        let _active = counters.start_merge();

        // A lone in-memory part only needs its buffers written out
        if is_final && pws.len() == 1 {
            if let Some(mp) = &pws[0].mp {
                let idx = self.next_merge_idx.fetch_add(1, Ordering::SeqCst);
                let dst_path = self.path.join(part_dir_name(idx));
                mp.store_to_disk(&dst_path)?;
                let pw_new = Arc::new(PartWrapper::new(idx, Part::open(&dst_path)?, None, None));
                let rows = mp.header().rows_count;
                counters.rows_merged.fetch_add(rows, Ordering::Relaxed);
                debug!(path = %dst_path.display(), rows, "stored in-memory part");
                return self.swap_src_with_dst_parts(&pws, Some(pw_new), dst_type);
            }
        }

        let mut readers = Vec::with_capacity(pws.len());
        for pw in &pws {
            let r = match &pw.mp {
                Some(mp) => BlockStreamReader::from_inmemory_part(mp)?,
                None => BlockStreamReader::open_file_part(pw.part.path())?,
            };
            readers.push(r);
        }

        let idx = self.next_merge_idx.fetch_add(1, Ordering::SeqCst);
        let dst_path = self.path.join(part_dir_name(idx));
        let writer = if dst_type == PartType::Inmemory {
            BlockStreamWriter::for_inmemory_part()
        } else {
            fsutil::create_dir_new(&dst_path)?;
            BlockStreamWriter::create_file_part(&dst_path)?
        };

        debug!(tier = %dst_type, parts = pws.len(), bytes = dst_size, "merge started");
        let stop = if is_final { None } else { Some(&self.stop_rx) };
        let outcome = merge_block_streams(writer, readers, stop);

        let finalized = match outcome? {
            MergeOutcome::Completed(fp) => fp,
            MergeOutcome::Stopped => {
                if dst_type != PartType::Inmemory {
                    fsutil::remove_dir_all_logged(&dst_path)?;
                }
                self.release_from_merge(&pws);
                debug!(tier = %dst_type, "merge interrupted by shutdown");
                return Ok(());
            }
        };

        let rows = finalized.header().rows_count;
        let pw_new = if rows == 0 {
            if let FinalizedPart::File { path, .. } = &finalized {
                fsutil::remove_dir_all_logged(path)?;
            }
            None
        } else {
            let pw = match finalized {
                FinalizedPart::Inmemory(mp) => {
                    let deadline = pws.iter().filter_map(|pw| pw.flush_deadline).min();
                    let part = Part::from_inmemory_part(&mp)?;
                    PartWrapper::new(idx, part, Some(mp), deadline)
                }
                FinalizedPart::File { path, .. } => PartWrapper::new(idx, Part::open(&path)?, None, None),
            };
            Some(Arc::new(pw))
        };

        counters.rows_merged.fetch_add(rows, Ordering::Relaxed);
        self.swap_src_with_dst_parts(&pws, pw_new, dst_type)?;

        let elapsed = start.elapsed();
        if elapsed > SLOW_MERGE_THRESHOLD {
            warn!(
                tier = %dst_type,
                parts = pws.len(),
                rows,
                duration_secs = elapsed.as_secs(),
                "merge took too long"
            );
        } else {
            debug!(tier = %dst_type, parts = pws.len(), rows, duration_ms = elapsed.as_millis() as u64, "merge finished");
        }
        Ok(())
    }

    /// Replace `pws` with `pw_new` in the tiers and drop the sources
    fn swap_src_with_dst_parts(
        self: &Arc<Self>,
        pws: &[Arc<PartWrapper>],
        pw_new: Option<Arc<PartWrapper>>,
        dst_type: PartType,
    ) -> Result<()> {
        {
            let mut st = self.state.lock();
            let mut files_changed = false;
            for pw in pws {
                if st.remove(pw.id) && !pw.is_inmemory() {
                    files_changed = true;
                }
            }
            if let Some(pw) = pw_new {
                files_changed |= !pw.is_inmemory();
                st.insert(pw, dst_type);
                self.start_merger_locked(&mut st, dst_type);
            }
            if files_changed {
                parts_list::write_part_names(&self.path, &st.file_part_names())?;
            }
        }
        self.merge_done.notify_all();
        for pw in pws {
            pw.mark_must_drop();
            pw.dec_ref();
        }
        Ok(())
    }

    fn release_from_merge(&self, pws: &[Arc<PartWrapper>]) {
        let mut st = self.state.lock();
        for pw in pws {
            st.in_merge.remove(&pw.id);
        }
        drop(st);
        self.merge_done.notify_all();
    }
}
