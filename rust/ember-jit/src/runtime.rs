//! The JIT runtime lifecycle object.
//!
//! [`JitRuntime`] owns every piece of process-wide JIT state: the registry
//! of pending and compiled units, the compile lock, the cross-thread
//! metadata check and the statistics. It is created at startup and torn down
//! by [`JitRuntime::shutdown`] (or on drop).
//!
//! Registration takes `&mut self` while a batch compile borrows the runtime
//! for its whole duration, so nothing can be registered while workers run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_rt::CodeId;
use serde::Serialize;

use crate::backend::{AllowAll, CompileBackend, CompileResult, UnitFilter};
use crate::config::JitConfig;
use crate::error::JitError;
use crate::preload::{find_nested_codes, preload_pending, preload_unit, PreloadMap};
use crate::registry::CodeRegistry;
use crate::scheduler::{BatchOutcome, BatchReport, CompileScheduler, SchedulerSettings};
use crate::sync::{CompileLock, MetadataAccess};
use crate::unit::{CodeObject, FunctionId, FunctionObject, Globals, Unit, UnitKey, UnitStatus};

/// Compile statistics accumulated over the runtime's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompileStats {
    pub total_compile_time: Duration,
    /// Time spent compiling each unit, by fully-qualified name.
    pub compile_times: BTreeMap<String, Duration>,
    /// Wall time of the batch compile run by [`JitRuntime::disable`].
    pub batch_compilation_time_ms: u64,
    pub attempts: u64,
    pub retries: u64,
    pub last_batch: Option<BatchReport>,
}

impl CompileStats {
    fn absorb(&mut self, outcome: &BatchOutcome) {
        self.attempts += outcome.report.attempted;
        self.retries += outcome.report.retries;
        self.total_compile_time += outcome.total_compile_time;
        for (name, elapsed) in &outcome.compile_times {
            *self.compile_times.entry(name.clone()).or_default() += *elapsed;
        }
    }
}

fn eligible(config: &JitConfig, filter: &dyn UnitFilter, module: &str, code: &CodeObject) -> bool {
    if config.compile_all_static_functions && code.is_static {
        return true;
    }
    code.qualname
        .as_deref()
        .is_some_and(|qualname| filter.is_eligible(module, qualname))
}

pub struct JitRuntime {
    config: JitConfig,
    enabled: bool,
    registry: CodeRegistry,
    backend: Box<dyn CompileBackend>,
    filter: Box<dyn UnitFilter>,
    lock: CompileLock,
    access: MetadataAccess,
    stats: CompileStats,
}

impl JitRuntime {
    /// Create a runtime owned by the calling thread.
    pub fn new(config: JitConfig, backend: impl CompileBackend + 'static) -> Result<Self, JitError> {
        config.validate()?;
        tracing::info!(
            enabled = config.enabled,
            workers = config.batch_compile_workers,
            "initialized jit runtime"
        );
        Ok(Self {
            enabled: config.enabled,
            config,
            registry: CodeRegistry::new(),
            backend: Box::new(backend),
            filter: Box::new(AllowAll),
            lock: CompileLock::new(),
            access: MetadataAccess::new(),
            stats: CompileStats::default(),
        })
    }

    pub fn with_filter(mut self, filter: impl UnitFilter + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn registry(&self) -> &CodeRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    pub fn metadata_access(&self) -> &MetadataAccess {
        &self.access
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a newly created function.
    ///
    /// Code compiled earlier is attached even when the runtime is disabled.
    /// Otherwise an eligible function joins the pending set. With a
    /// restrictive filter in place, eligible code nested in the function is
    /// registered too, compiled later against the function's module.
    /// Returns whether the function was attached or registered.
    pub fn register_function(&mut self, func: &Arc<FunctionObject>) -> bool {
        if let Some(code) = self.registry.attach(func) {
            tracing::debug!(unit = %func.key(), code = %code.id(), "attached compiled code");
            return true;
        }
        if !self.enabled {
            return false;
        }

        let mut registered = false;
        if eligible(&self.config, self.filter.as_ref(), &func.module, &func.code) {
            self.registry.add_function(func);
            registered = true;
        }
        if self.filter.is_active() {
            let nested = find_nested_codes(&func.code, |code| {
                eligible(&self.config, self.filter.as_ref(), &func.module, code)
            });
            for code in nested {
                self.registry.add_code(code, &func.module, Arc::clone(&func.globals));
            }
        }
        registered
    }

    /// Register a bare code object compiled against `module`'s globals.
    pub fn register_code(&mut self, code: Arc<CodeObject>, module: &str, globals: Arc<Globals>) -> bool {
        if !self.enabled || !eligible(&self.config, self.filter.as_ref(), module, &code) {
            return false;
        }
        self.registry.add_code(code, module, globals);
        true
    }

    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }

    pub fn status(&self, key: UnitKey) -> Option<UnitStatus> {
        self.registry.status(key)
    }

    pub fn is_compiled(&self, key: UnitKey) -> bool {
        self.status(key) == Some(UnitStatus::Done)
    }

    pub fn function_destroyed(&mut self, id: FunctionId) {
        if self.enabled {
            self.registry.forget_function(id);
        }
    }

    pub fn code_destroyed(&mut self, id: CodeId) {
        if self.enabled {
            self.registry.forget_code(id);
        }
    }

    // -----------------------------------------------------------------------
    // Compilation
    // -----------------------------------------------------------------------

    /// Compile one function now, on the calling thread.
    pub fn compile_function(&mut self, func: &Arc<FunctionObject>) -> CompileResult {
        if !eligible(&self.config, self.filter.as_ref(), &func.module, &func.code) {
            return CompileResult::CannotSpecialize;
        }
        if let Some(code) = self.registry.attach(func) {
            return CompileResult::Ok(code);
        }
        self.registry.remove_pending(func.key());

        let unit = Unit::Function(Arc::clone(func));
        let mut map = PreloadMap::new();
        map.insert(preload_unit(&unit, &func.module, &func.globals, Vec::new()));
        let settings = SchedulerSettings {
            workers: 0,
            ..SchedulerSettings::from(&self.config)
        };
        let outcome = self.run_batch(&map, settings);
        match outcome.units.first() {
            Some(unit) => match (&unit.code, unit.status) {
                (Some(code), UnitStatus::Done) => CompileResult::Ok(Arc::clone(code)),
                _ => CompileResult::CannotSpecialize,
            },
            None => CompileResult::CannotSpecialize,
        }
    }

    /// Compile `func` now if it is still pending. Returns whether it was.
    pub fn force_compile(&mut self, func: &Arc<FunctionObject>) -> bool {
        if !self.registry.is_pending(func.key()) {
            return false;
        }
        self.compile_function(func);
        true
    }

    /// Preload and compile everything pending with `workers` threads
    /// (0 compiles on the calling thread).
    pub fn compile_all_pending(&mut self, workers: usize) -> BatchReport {
        let mut map = PreloadMap::new();
        {
            let config = &self.config;
            let filter = self.filter.as_ref();
            preload_pending(&mut self.registry, &mut map, |module, code| {
                eligible(config, filter, module, code)
            });
        }
        let settings = SchedulerSettings {
            workers,
            ..SchedulerSettings::from(&self.config)
        };
        let outcome = self.run_batch(&map, settings);
        self.stats.last_batch = Some(outcome.report.clone());
        outcome.report
    }

    fn run_batch(&mut self, map: &PreloadMap, settings: SchedulerSettings) -> BatchOutcome {
        let outcome =
            CompileScheduler::new(map, self.backend.as_ref(), &self.lock, &self.access, settings).run();
        for unit in &outcome.units {
            self.registry.record(unit.key, unit.status, unit.code.clone());
        }
        self.stats.absorb(&outcome);
        outcome
    }

    /// Recompile every pending unit with the configured worker pool. Only
    /// available when `multithreaded_compile_test` is set.
    pub fn multithreaded_compile_test(&mut self) -> Result<BatchReport, JitError> {
        if !self.config.multithreaded_compile_test {
            return Err(JitError::CompileTestDisabled);
        }
        self.stats.attempts = 0;
        self.stats.retries = 0;
        self.lock.reset_counters();
        tracing::info!("(re)compiling {} units", self.registry.pending_count());
        self.registry.clear_compiled();
        Ok(self.compile_all_pending(self.config.batch_compile_workers.max(1)))
    }

    /// Disable the runtime, optionally compiling everything pending first.
    pub fn disable(&mut self, compile_pending: bool) -> Option<BatchReport> {
        let report = if compile_pending {
            let started = Instant::now();
            let report = self.compile_all_pending(self.config.batch_compile_workers);
            self.stats.batch_compilation_time_ms = started.elapsed().as_millis() as u64;
            self.registry.clear_code_data();
            Some(report)
        } else {
            None
        };
        self.enabled = false;
        tracing::info!(compiled_pending = compile_pending, "disabled jit runtime");
        report
    }

    /// Drop all registry state. The runtime stays usable but disabled.
    pub fn shutdown(&mut self) {
        self.registry.clear();
        self.enabled = false;
    }
}

impl Drop for JitRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
