//! Batch compile scheduler.
//!
//! A batch runs in three phases over a fixed set of preloaded units:
//!
//! 1. **Preload** happens before the scheduler is built (see `preload`).
//! 2. **Compile**: `W` named worker threads pop units off a shared
//!    [`Injector`] until it reports empty. A unit whose attempt asks for a
//!    retry is pushed onto the shared retry list under the [`CompileLock`].
//! 3. **Drain**: after every worker has joined, the retry list is worked off
//!    on the calling thread, at most `drain_retry_limit` times per unit.
//!
//! Per-unit state lives in a [`UnitSlot`]. A unit is only ever compiled by
//! whoever wins the compare-and-swap into `Compiling`, so no two threads can
//! be inside the backend for the same unit.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal};
use ember_rt::{fatal, CodeId, CodeRuntime};
use serde::Serialize;
use serde_json::Value;

use crate::backend::{CompileBackend, CompileResult};
use crate::config::JitConfig;
use crate::error::SchedulerViolation;
use crate::preload::{PreloadMap, PreloadedUnit};
use crate::sync::{CompileLock, MetadataAccess};
use crate::unit::{Globals, UnitKey, UnitStatus};

// ---------------------------------------------------------------------------
// Settings and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// 0 runs the compile phase on the calling thread.
    pub workers: usize,
    pub drain_retry_limit: u32,
    pub record_compile_times: bool,
}

impl From<&JitConfig> for SchedulerSettings {
    fn from(config: &JitConfig) -> Self {
        Self {
            workers: config.batch_compile_workers,
            drain_retry_limit: config.drain_retry_limit.max(1),
            record_compile_times: config.record_compile_times,
        }
    }
}

/// Final state of one unit after a batch.
#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    pub key: UnitKey,
    pub status: UnitStatus,
    #[serde(skip)]
    pub code: Option<Arc<CodeRuntime>>,
    pub attempts: u32,
    /// Highest number of concurrent attempts observed for this unit.
    pub max_in_flight: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub done: usize,
    pub declined: usize,
    pub attempted: u64,
    pub retries: u64,
    pub max_in_flight: u32,
    pub workers: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub report: BatchReport,
    pub units: Vec<UnitOutcome>,
    pub compile_times: BTreeMap<String, Duration>,
    /// Sum over every successful compile of the batch.
    pub total_compile_time: Duration,
}

// ---------------------------------------------------------------------------
// UnitSlot
// ---------------------------------------------------------------------------

struct UnitSlot {
    unit: Arc<PreloadedUnit>,
    status: AtomicU8,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    attempts: AtomicU32,
    drain_attempts: AtomicU32,
    code: OnceLock<Arc<CodeRuntime>>,
}

impl UnitSlot {
    fn new(unit: Arc<PreloadedUnit>) -> Self {
        Self {
            unit,
            status: AtomicU8::new(UnitStatus::Preloading as u8),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            drain_attempts: AtomicU32::new(0),
            code: OnceLock::new(),
        }
    }

    fn status(&self) -> UnitStatus {
        UnitStatus::from_repr(self.status.load(Ordering::Acquire)).unwrap_or(UnitStatus::Pending)
    }

    fn set_status(&self, status: UnitStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn transition(&self, from: UnitStatus, to: UnitStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Take exclusive ownership of the unit for one compile attempt.
    fn claim(&self) -> bool {
        self.transition(UnitStatus::Preloading, UnitStatus::Compiling)
            || self.transition(UnitStatus::Retry, UnitStatus::Compiling)
    }
}

// ---------------------------------------------------------------------------
// CompileScheduler
// ---------------------------------------------------------------------------

pub struct CompileScheduler<'a> {
    slots: HashMap<UnitKey, UnitSlot>,
    by_code: HashMap<CodeId, UnitKey>,
    order: Vec<UnitKey>,
    queue: Injector<UnitKey>,
    backend: &'a dyn CompileBackend,
    lock: &'a CompileLock,
    access: &'a MetadataAccess,
    settings: SchedulerSettings,
    attempted: AtomicU64,
}

impl<'a> CompileScheduler<'a> {
    pub fn new(
        preloaded: &PreloadMap,
        backend: &'a dyn CompileBackend,
        lock: &'a CompileLock,
        access: &'a MetadataAccess,
        settings: SchedulerSettings,
    ) -> Self {
        let mut slots = HashMap::with_capacity(preloaded.len());
        let mut by_code = HashMap::with_capacity(preloaded.len());
        let mut order = Vec::with_capacity(preloaded.len());
        for unit in preloaded.iter() {
            order.push(unit.key);
            by_code.entry(unit.code.id).or_insert(unit.key);
            slots.insert(unit.key, UnitSlot::new(Arc::clone(unit)));
        }
        Self {
            slots,
            by_code,
            order,
            queue: Injector::new(),
            backend,
            lock,
            access,
            settings,
            attempted: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Run the compile and drain phases to completion.
    pub fn run(self) -> BatchOutcome {
        let started = Instant::now();
        for key in &self.order {
            self.queue.push(*key);
        }

        {
            // Workers read metadata without the owner's permission until the
            // drain is over.
            let _relaxed = (self.settings.workers > 0).then(|| self.access.relax());
            if self.settings.workers == 0 {
                self.work();
            } else {
                self.run_workers();
            }
            self.drain();
        }

        self.finish(started)
    }

    fn run_workers(&self) {
        let workers = self.settings.workers;
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            {
                let _pool = self.lock.lock();
                for n in 0..workers {
                    let builder = thread::Builder::new().name(format!("ember-compile-{n}"));
                    match builder.spawn_scoped(scope, || self.work()) {
                        Ok(handle) => handles.push(handle),
                        Err(err) => {
                            tracing::warn!(worker = n, error = %err, "failed to spawn compile worker")
                        }
                    }
                }
            }
            for handle in handles {
                if let Err(panic) = handle.join() {
                    std::panic::resume_unwind(panic);
                }
            }
        });
        // Anything a missing worker left behind.
        self.work();
    }

    fn work(&self) {
        let worker = thread::current().name().unwrap_or("main").to_string();
        tracing::debug!(%worker, "started compile worker");
        loop {
            match self.queue.steal() {
                Steal::Success(key) => {
                    let slot = self.slot(key);
                    if slot.claim() {
                        self.attempt(key, slot);
                    }
                }
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
        tracing::debug!(%worker, "finished compile worker");
    }

    fn drain(&self) {
        let limit = self.settings.drain_retry_limit;
        loop {
            let retry_list = self.lock.take_retry_list();
            if retry_list.is_empty() {
                break;
            }
            for key in retry_list {
                let slot = self.slot(key);
                if slot.status() != UnitStatus::Retry {
                    continue;
                }
                if slot.drain_attempts.load(Ordering::Acquire) >= limit {
                    if slot.transition(UnitStatus::Retry, UnitStatus::Declined) {
                        tracing::warn!(
                            unit = %key,
                            name = %slot.unit.metadata.fullname,
                            attempts = slot.attempts.load(Ordering::Acquire),
                            "unit kept asking for a retry; declining it"
                        );
                    }
                    continue;
                }
                if slot.claim() {
                    slot.drain_attempts.fetch_add(1, Ordering::AcqRel);
                    self.attempt(key, slot);
                }
            }
        }
    }

    fn slot(&self, key: UnitKey) -> &UnitSlot {
        match self.slots.get(&key) {
            Some(slot) => slot,
            None => fatal(SchedulerViolation::NotPreloaded(key), None),
        }
    }

    fn lookup(&self, key: UnitKey) -> Option<(UnitKey, &UnitSlot)> {
        if let Some(slot) = self.slots.get(&key) {
            return Some((key, slot));
        }
        let UnitKey::Code(code) = key else {
            return None;
        };
        let key = *self.by_code.get(&code)?;
        self.slots.get(&key).map(|slot| (key, slot))
    }

    /// One compile attempt. The caller must have claimed `slot`.
    fn attempt(&self, key: UnitKey, slot: &UnitSlot) -> CompileResult {
        let concurrent = slot.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        slot.max_in_flight.fetch_max(concurrent, Ordering::AcqRel);
        slot.attempts.fetch_add(1, Ordering::AcqRel);
        self.attempted.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let cx = CompileContext { scheduler: self };
        let result = self.backend.compile(&slot.unit, &cx);
        let elapsed = started.elapsed();
        slot.in_flight.fetch_sub(1, Ordering::AcqRel);

        match &result {
            CompileResult::Ok(code) => {
                if slot.code.set(Arc::clone(code)).is_err() {
                    fatal(SchedulerViolation::UnitCompiledTwice(key), None);
                }
                if self.settings.record_compile_times {
                    let mut shared = self.lock.lock();
                    shared.total_compile_time += elapsed;
                    *shared
                        .compile_times
                        .entry(slot.unit.metadata.fullname.clone())
                        .or_default() += elapsed;
                }
                slot.set_status(UnitStatus::Done);
            }
            CompileResult::Retry => {
                {
                    let mut shared = self.lock.lock();
                    shared.retries += 1;
                    shared.retry_list.push(key);
                }
                tracing::debug!(unit = %key, name = %slot.unit.metadata.fullname, "compile asked for retry");
                slot.set_status(UnitStatus::Retry);
            }
            CompileResult::CannotSpecialize => slot.set_status(UnitStatus::Declined),
        }
        result
    }

    fn finish(self, started: Instant) -> BatchOutcome {
        let total = self.order.len();
        let mut units = Vec::with_capacity(total);
        let (mut done, mut declined, mut max_in_flight) = (0, 0, 0);
        for key in &self.order {
            let slot = self.slot(*key);
            let status = slot.status();
            match status {
                UnitStatus::Done => done += 1,
                UnitStatus::Declined => declined += 1,
                _ => {}
            }
            let unit_max = slot.max_in_flight.load(Ordering::Acquire);
            max_in_flight = max_in_flight.max(unit_max);
            units.push(UnitOutcome {
                key: *key,
                status,
                code: slot.code.get().cloned(),
                attempts: slot.attempts.load(Ordering::Acquire),
                max_in_flight: unit_max,
            });
        }
        if done + declined != total {
            fatal(
                SchedulerViolation::BatchIncomplete {
                    done,
                    declined,
                    total,
                },
                None,
            );
        }

        let (retries, compile_times, total_compile_time) = {
            let mut shared = self.lock.lock();
            (
                std::mem::take(&mut shared.retries),
                std::mem::take(&mut shared.compile_times),
                std::mem::take(&mut shared.total_compile_time),
            )
        };
        let report = BatchReport {
            total,
            done,
            declined,
            attempted: self.attempted.load(Ordering::Acquire),
            retries,
            max_in_flight,
            workers: self.settings.workers,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            "took {} ms, compiles attempted: {}, compiles retried: {}",
            report.elapsed_ms,
            report.attempted,
            report.retries
        );
        BatchOutcome {
            report,
            units,
            compile_times,
            total_compile_time,
        }
    }
}

// ---------------------------------------------------------------------------
// CompileContext
// ---------------------------------------------------------------------------

/// What a backend may do while compiling one unit.
pub struct CompileContext<'a> {
    scheduler: &'a CompileScheduler<'a>,
}

impl CompileContext<'_> {
    /// Read a global of `unit`'s module. Outside a threaded compile this is
    /// only permitted on the thread that owns the runtime.
    pub fn global(&self, unit: &PreloadedUnit, name: &str) -> Option<Value> {
        self.scheduler.access.check_read("module globals");
        unit.globals.get(name)
    }

    /// Write a global, serialized against every other worker.
    pub fn set_global(&self, globals: &Globals, name: &str, value: Value) {
        let _shared = self.scheduler.lock.lock();
        globals.insert(name, value);
    }

    pub fn preloaded(&self, key: UnitKey) -> Option<&Arc<PreloadedUnit>> {
        self.scheduler.lookup(key).map(|(_, slot)| &slot.unit)
    }

    /// Compile another unit of the same batch from inside a compile.
    ///
    /// Finished units return their result; a unit that is being compiled
    /// right now (including the caller itself) returns `Retry`. A unit that
    /// is waiting is claimed and compiled on the spot. Units outside the
    /// batch are declined.
    pub fn compile_nested(&self, key: UnitKey) -> CompileResult {
        let Some((key, slot)) = self.scheduler.lookup(key) else {
            return CompileResult::CannotSpecialize;
        };
        loop {
            match slot.status() {
                UnitStatus::Done => {
                    return match slot.code.get() {
                        Some(code) => CompileResult::Ok(Arc::clone(code)),
                        None => CompileResult::CannotSpecialize,
                    }
                }
                UnitStatus::Declined | UnitStatus::Pending => {
                    return CompileResult::CannotSpecialize
                }
                UnitStatus::Compiling => return CompileResult::Retry,
                UnitStatus::Preloading | UnitStatus::Retry => {
                    if slot.claim() {
                        return self.scheduler.attempt(key, slot);
                    }
                }
            }
        }
    }
}
