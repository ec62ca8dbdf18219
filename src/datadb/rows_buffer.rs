//! Sharded row buffer
//!
//! Batches incoming rows before they are packed into in-memory parts. Each
//! shard flushes when it holds roughly a block worth of data, when its timer
//! fires, or on an explicit `flush`.
//!
//! ## Concurrency:
//! - One mutex per shard guards its batch and timer
//! - A second per-shard mutex is held while a batch is handed over, so a
//!   returning `flush` implies every earlier batch reached the callback
//! - Callers are spread over shards round-robin
//! - Timer threads are tracked by a `WaitGroup` so `close` can wait for them

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use crossbeam::sync::WaitGroup;
use parking_lot::Mutex;
use tracing::error;

use crate::rows::LogRows;

/// Receives every batch a shard flushes
pub(crate) type FlushFn = Arc<dyn Fn(LogRows) + Send + Sync>;

#[derive(Default)]
struct ShardState {
    lr: LogRows,
    /// Dropping the sender cancels the running timer
    timer_cancel: Option<Sender<()>>,
}

struct Shard {
    state: Mutex<ShardState>,
    /// Held from taking a batch until the callback returns
    flushing: Mutex<()>,
}

pub(crate) struct RowsBuffer {
    shards: Vec<Arc<Shard>>,
    next_shard: AtomicUsize,
    flush_interval: Duration,
    flush_fn: FlushFn,
    timers_wg: Mutex<Option<WaitGroup>>,
    closed: AtomicBool,
}

impl RowsBuffer {
    pub(crate) fn new(shards: usize, flush_interval: Duration, flush_fn: FlushFn) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| {
                    Arc::new(Shard {
                        state: Mutex::new(ShardState::default()),
                        flushing: Mutex::new(()),
                    })
                })
                .collect(),
            next_shard: AtomicUsize::new(0),
            flush_interval,
            flush_fn,
            timers_wg: Mutex::new(Some(WaitGroup::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// Copy the rows of `lr` into the next shard, flushing it whenever it fills up
    pub(crate) fn must_add_rows(&self, lr: &LogRows) {
        let idx = self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        let shard = &self.shards[idx];

        let rows = lr.stream_ids().iter().zip(lr.timestamps()).zip(lr.rows());
        for ((sid, &ts), fields) in rows {
            let full = {
                let mut st = shard.state.lock();
                let was_empty = st.lr.is_empty();
                st.lr.must_add_with_stream_id(*sid, ts, fields.clone());
                let full = st.lr.need_flush();
                if !full && was_empty && !st.lr.is_empty() {
                    self.start_timer(shard, &mut st);
                }
                full
            };
            if full {
                flush_shard(shard, &self.flush_fn);
            }
        }
    }

    /// Flush every shard now
    pub(crate) fn flush(&self) {
        for shard in &self.shards {
            flush_shard(shard, &self.flush_fn);
        }
    }

    /// Rows not yet handed to the flush callback
    pub(crate) fn pending_rows(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.state.lock().lr.len() as u64)
            .sum()
    }

    /// Flush everything and wait for timer threads to exit
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.flush();
        if let Some(wg) = self.timers_wg.lock().take() {
            wg.wait();
        }
    }

    fn start_timer(&self, shard: &Arc<Shard>, st: &mut ShardState) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let wg = match self.timers_wg.lock().as_ref() {
            Some(wg) => wg.clone(),
            None => return,
        };
        let (tx, rx) = channel::bounded::<()>(0);
        st.timer_cancel = Some(tx);

        let shard = Arc::clone(shard);
        let flush_fn = Arc::clone(&self.flush_fn);
        let interval = self.flush_interval;
        let spawned = thread::Builder::new()
            .name("logdb-rows-timer".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(interval) {
                    flush_shard(&shard, &flush_fn);
                }
                drop(wg);
            });
        if let Err(e) = spawned {
            // Rows still get flushed by size or by an explicit flush
            error!(error = %e, "cannot start row buffer timer");
            st.timer_cancel = None;
        }
    }
}

fn flush_shard(shard: &Shard, flush_fn: &FlushFn) {
    let _flushing = shard.flushing.lock();
    let batch = {
        let mut st = shard.state.lock();
        st.timer_cancel = None;
        std::mem::take(&mut st.lr)
    };
    if !batch.is_empty() {
        flush_fn(batch);
    }
}
