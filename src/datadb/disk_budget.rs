//! Disk space accounting
//!
//! Merges reserve their estimated output size before they start so that
//! concurrent merges across every partition in the process never promise
//! more space than the disk has.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::warn;

/// Returns free bytes on the filesystem holding the given path
pub type FreeSpaceFn = Arc<dyn Fn(&Path) -> io::Result<u64> + Send + Sync>;

/// Process-wide reserved-bytes counter
///
/// ## Concurrency:
/// - `reserved`: atomic counter shared by every partition (lock-free)
pub struct DiskBudget {
    reserved: AtomicU64,
    free_space: FreeSpaceFn,
}

impl fmt::Debug for DiskBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskBudget")
            .field("reserved", &self.reserved())
            .finish()
    }
}

impl Default for DiskBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskBudget {
    /// Budget backed by the filesystem's real free space
    pub fn new() -> Self {
        Self::with_free_space_fn(|path: &Path| fs2::available_space(path))
    }

    /// Budget with a custom free-space source
    pub fn with_free_space_fn(f: impl Fn(&Path) -> io::Result<u64> + Send + Sync + 'static) -> Self {
        Self {
            reserved: AtomicU64::new(0),
            free_space: Arc::new(f),
        }
    }

    /// The budget shared by all partitions of the process
    pub fn global() -> Arc<DiskBudget> {
        static GLOBAL: OnceLock<Arc<DiskBudget>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(DiskBudget::new())).clone()
    }

    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Free bytes at `path` not yet promised to a running merge
    pub fn available(&self, path: &Path) -> u64 {
        self.free_space(path).saturating_sub(self.reserved())
    }

    /// Reserve `n` bytes for a merge writing below `path`
    ///
    /// Returns `None` and keeps nothing reserved when the disk cannot take it.
    pub fn try_reserve(self: &Arc<Self>, path: &Path, n: u64) -> Option<DiskReservation> {
        let free = self.free_space(path);
        let reserved = self.reserved.fetch_add(n, Ordering::SeqCst) + n;
        let reservation = DiskReservation {
            budget: Arc::clone(self),
            bytes: n,
        };
        if free >= reserved {
            Some(reservation)
        } else {
            None
        }
    }

    fn free_space(&self, path: &Path) -> u64 {
        match (self.free_space)(path) {
            Ok(n) => n,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot determine free disk space");
                0
            }
        }
    }
}

/// Reserved bytes, released on drop
#[derive(Debug)]
pub struct DiskReservation {
    budget: Arc<DiskBudget>,
    bytes: u64,
}

impl DiskReservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for DiskReservation {
    fn drop(&mut self) {
        self.budget.reserved.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}
