//! Synchronization for the threaded compile.
//!
//! Runtime metadata (globals, code objects) is normally only touched by the
//! thread that owns the runtime. A threaded compile deliberately relaxes that:
//! while workers run, they may read shared metadata without locking, and every
//! write goes through the single [`CompileLock`]. The relaxation is scoped by
//! a [`RelaxGuard`], so it is restored on every exit path, unwinding included.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use ember_rt::fatal;
use parking_lot::{Mutex, MutexGuard};

use crate::error::SchedulerViolation;
use crate::unit::UnitKey;

// ---------------------------------------------------------------------------
// CompileLock
// ---------------------------------------------------------------------------

/// State mutated by workers. Only reachable through [`CompileLock`].
#[derive(Debug, Default)]
pub struct SharedState {
    pub retry_list: Vec<UnitKey>,
    pub retries: u64,
    /// Compile time per fully-qualified name. Units sharing a name add up.
    pub compile_times: BTreeMap<String, Duration>,
    pub total_compile_time: Duration,
}

/// The one lock shared by the compile pipeline. It guards worker-pool
/// creation, the retry list and any write performed from a worker.
#[derive(Debug, Default)]
pub struct CompileLock {
    inner: Mutex<SharedState>,
}

impl CompileLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.inner.lock()
    }

    /// Remove and return everything on the retry list.
    pub fn take_retry_list(&self) -> Vec<UnitKey> {
        std::mem::take(&mut self.inner.lock().retry_list)
    }

    pub fn reset_counters(&self) {
        self.inner.lock().retries = 0;
    }
}

// ---------------------------------------------------------------------------
// MetadataAccess
// ---------------------------------------------------------------------------

/// The cross-thread read check for runtime metadata.
#[derive(Debug)]
pub struct MetadataAccess {
    owner: ThreadId,
    relaxed: AtomicBool,
}

impl MetadataAccess {
    /// Metadata owned by the calling thread.
    pub fn new() -> Self {
        Self {
            owner: thread::current().id(),
            relaxed: AtomicBool::new(false),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn is_relaxed(&self) -> bool {
        self.relaxed.load(Ordering::Acquire)
    }

    /// Check that the current thread may read `what` without a lock.
    pub fn check_read(&self, what: &str) {
        let current = thread::current();
        if current.id() == self.owner || self.is_relaxed() {
            return;
        }
        fatal(
            SchedulerViolation::UnsynchronizedRead {
                what: what.to_string(),
                thread: current.name().map_or_else(|| format!("{:?}", current.id()), str::to_string),
            },
            None,
        );
    }

    /// Relax the check until the returned guard is dropped.
    pub fn relax(&self) -> RelaxGuard<'_> {
        let previous = self.relaxed.swap(true, Ordering::AcqRel);
        tracing::debug!("relaxed cross-thread metadata check");
        RelaxGuard {
            access: self,
            previous,
        }
    }
}

impl Default for MetadataAccess {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the previous check state on drop.
#[must_use = "the check is restored as soon as the guard is dropped"]
pub struct RelaxGuard<'a> {
    access: &'a MetadataAccess,
    previous: bool,
}

impl Drop for RelaxGuard<'_> {
    fn drop(&mut self) {
        self.access.relaxed.store(self.previous, Ordering::Release);
        tracing::debug!(relaxed = self.previous, "restored cross-thread metadata check");
    }
}
