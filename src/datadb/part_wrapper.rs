//! Reference-counted parts
//!
//! A part's files are removed only after the last reference is released and
//! the part has been marked for removal by the merge that replaced it.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use crate::fsutil;
use crate::part::{InmemoryPart, Part};

/// Tier a part lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartType {
    Inmemory,
    Small,
    Big,
}

impl PartType {
    pub const ALL: [PartType; 3] = [PartType::Inmemory, PartType::Small, PartType::Big];

    pub(crate) fn index(self) -> usize {
        match self {
            PartType::Inmemory => 0,
            PartType::Small => 1,
            PartType::Big => 2,
        }
    }
}

impl fmt::Display for PartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartType::Inmemory => "inmemory",
            PartType::Small => "small",
            PartType::Big => "big",
        };
        f.write_str(s)
    }
}

/// A part plus the bookkeeping deciding when it may be closed and deleted
///
/// ## Concurrency:
/// - `ref_count`, `must_drop`: lock-free atomics
/// - membership in tiers and merges is tracked by the owning datadb under its lock
pub(crate) struct PartWrapper {
    pub(crate) id: u64,
    pub(crate) part: Part,
    /// Source buffers of an in-memory part
    pub(crate) mp: Option<InmemoryPart>,
    /// When an in-memory part must be written to disk
    pub(crate) flush_deadline: Option<Instant>,
    ref_count: AtomicU64,
    must_drop: AtomicBool,
}

impl PartWrapper {
    /// Wrapper holding the datadb's own reference
    pub(crate) fn new(id: u64, part: Part, mp: Option<InmemoryPart>, flush_deadline: Option<Instant>) -> Self {
        Self {
            id,
            part,
            mp,
            flush_deadline,
            ref_count: AtomicU64::new(1),
            must_drop: AtomicBool::new(false),
        }
    }

    pub(crate) fn inc_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a reference; the last one closes the part and removes its files
    /// if it was replaced by a merge
    pub(crate) fn dec_ref(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        if prev > 1 {
            return;
        }
        if prev == 0 {
            error!(part = self.id, "reference count underflow");
            return;
        }
        self.part.close();
        if !self.must_drop.load(Ordering::SeqCst) || self.mp.is_some() {
            return;
        }
        let path = self.part.path();
        debug!(path = %path.display(), "removing merged part");
        if let Err(e) = fsutil::remove_dir_all_logged(path) {
            error!(path = %path.display(), error = %e, "cannot remove part directory");
        }
    }

    pub(crate) fn mark_must_drop(&self) {
        self.must_drop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub(crate) fn is_inmemory(&self) -> bool {
        self.mp.is_some()
    }

    /// Directory name of a file part
    pub(crate) fn dir_name(&self) -> Option<String> {
        if self.mp.is_some() {
            return None;
        }
        self.part
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// A held reference to a part; the part stays open until it is dropped
pub struct PartRef {
    pw: Arc<PartWrapper>,
}

impl PartRef {
    pub(crate) fn new(pw: Arc<PartWrapper>) -> Self {
        pw.inc_ref();
        Self { pw }
    }

    pub fn is_inmemory(&self) -> bool {
        self.pw.is_inmemory()
    }

    /// References currently held, including the owning datadb's own
    pub fn ref_count(&self) -> u64 {
        self.pw.ref_count()
    }
}

impl Deref for PartRef {
    type Target = Part;

    fn deref(&self) -> &Part {
        &self.pw.part
    }
}

impl Drop for PartRef {
    fn drop(&mut self) {
        self.pw.dec_ref();
    }
}

impl fmt::Debug for PartRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartRef")
            .field("id", &self.pw.id)
            .field("part", &self.pw.part)
            .finish()
    }
}
