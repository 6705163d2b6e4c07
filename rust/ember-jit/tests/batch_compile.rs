//! Integration tests for preloading and the threaded batch compile.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ember_jit::*;
use ember_rt::CodeId;
use parking_lot::Mutex;
use serde_json::json;

fn func(name: &str) -> Arc<FunctionObject> {
    FunctionObject::new(Arc::new(CodeObject::new(name)), "batch", Globals::new())
}

fn runtime(backend: impl CompileBackend + 'static) -> JitRuntime {
    JitRuntime::new(JitConfig::default(), backend).unwrap()
}

/// Compiles everything, counting attempts per code object.
#[derive(Default)]
struct Counting {
    attempts: Mutex<HashMap<CodeId, u32>>,
}

impl Counting {
    fn attempts_for(&self, id: CodeId) -> u32 {
        self.attempts.lock().get(&id).copied().unwrap_or(0)
    }
}

impl CompileBackend for Counting {
    fn compile(&self, unit: &PreloadedUnit, _cx: &CompileContext<'_>) -> CompileResult {
        *self.attempts.lock().entry(unit.code.id).or_default() += 1;
        CompileResult::Ok(unit.code_runtime())
    }
}

/// Lets a test keep a handle on a backend the runtime owns.
struct Shared(Arc<Counting>);

impl CompileBackend for Shared {
    fn compile(&self, unit: &PreloadedUnit, cx: &CompileContext<'_>) -> CompileResult {
        self.0.compile(unit, cx)
    }
}

// ===========================================================================
// Worker pool
// ===========================================================================

/// Units whose name starts with `flaky` ask for one retry.
#[derive(Default)]
struct RetryOnce {
    retried: Mutex<HashSet<UnitKey>>,
}

impl CompileBackend for RetryOnce {
    fn compile(&self, unit: &PreloadedUnit, _cx: &CompileContext<'_>) -> CompileResult {
        if unit.metadata.qualname.starts_with("flaky") && self.retried.lock().insert(unit.key) {
            return CompileResult::Retry;
        }
        CompileResult::Ok(unit.code_runtime())
    }
}

#[test]
fn hundred_units_on_four_workers_all_finish() {
    let mut rt = runtime(RetryOnce::default());
    let mut funcs = Vec::new();
    for i in 0..100 {
        let name = if i % 10 == 0 {
            format!("flaky_{i}")
        } else {
            format!("steady_{i}")
        };
        let f = func(&name);
        assert!(rt.register_function(&f));
        funcs.push(f);
    }

    let report = rt.compile_all_pending(4);
    assert_eq!(report.total, 100);
    assert_eq!(report.done, 100);
    assert_eq!(report.declined, 0);
    assert_eq!(report.retries, 10);
    assert_eq!(report.attempted, 110);
    assert_eq!(report.workers, 4);
    assert!(report.max_in_flight <= 1);
    assert!(funcs.iter().all(|f| rt.is_compiled(f.key())));
    assert_eq!(rt.pending_count(), 0);
    assert!(!rt.metadata_access().is_relaxed());
}

#[test]
fn serial_and_threaded_batches_agree() {
    let names: Vec<String> = (0..12).map(|i| format!("f{i}")).collect();
    let mut reports = Vec::new();
    for workers in [0, 3] {
        let mut rt = runtime(Counting::default());
        for name in &names {
            rt.register_function(&func(name));
        }
        let mut report = rt.compile_all_pending(workers);
        report.elapsed_ms = 0;
        report.workers = 0;
        reports.push(report);
    }
    assert_eq!(reports[0], reports[1]);
}

#[test]
fn compile_times_are_recorded_by_full_name() {
    let mut rt = runtime(Counting::default());
    rt.register_function(&func("timed"));
    rt.compile_all_pending(2);
    assert!(rt.stats().compile_times.contains_key("batch:timed"));
    assert_eq!(rt.stats().attempts, 1);
    assert!(rt.stats().last_batch.is_some());
}

/// Compiles everything, taking a measurable while per unit.
struct Slow;

impl CompileBackend for Slow {
    fn compile(&self, unit: &PreloadedUnit, _cx: &CompileContext<'_>) -> CompileResult {
        thread::sleep(Duration::from_millis(2));
        CompileResult::Ok(unit.code_runtime())
    }
}

#[test]
fn same_named_units_all_count_toward_total_compile_time() {
    let mut rt = runtime(Slow);
    let first = func("dup");
    let second = func("dup");
    rt.register_function(&first);
    rt.register_function(&second);

    let report = rt.compile_all_pending(2);
    assert_eq!(report.done, 2);

    let stats = rt.stats();
    assert_eq!(stats.compile_times.len(), 1);
    let per_name = stats.compile_times["batch:dup"];
    assert_eq!(per_name, stats.total_compile_time);
    assert!(stats.total_compile_time >= Duration::from_millis(4));
}

// ===========================================================================
// Nested discovery
// ===========================================================================

#[test]
fn diamond_nested_code_is_preloaded_and_compiled_once() {
    let d = Arc::new(CodeObject::new("a.<locals>.d"));
    let b = Arc::new(CodeObject::new("a.<locals>.b").with_nested(&d));
    let c = Arc::new(CodeObject::new("a.<locals>.c").with_nested(&d));
    let a = Arc::new(CodeObject::new("a").with_nested(&b).with_nested(&c));
    let root = FunctionObject::new(Arc::clone(&a), "batch", Globals::new());

    let backend = Arc::new(Counting::default());
    let mut rt = runtime(Shared(Arc::clone(&backend)));
    rt.register_function(&root);
    assert_eq!(rt.pending_count(), 1);

    let report = rt.compile_all_pending(3);
    assert_eq!(report.total, 4);
    assert_eq!(report.done, 4);
    for code in [&a, &b, &c, &d] {
        assert_eq!(backend.attempts_for(code.id), 1);
    }
    assert!(rt.is_compiled(UnitKey::Code(d.id)));
}

#[test]
fn preload_inherits_module_and_globals() {
    let inner = Arc::new(CodeObject::new("outer.<locals>.inner").with_name("limit"));
    let globals = Globals::from_pairs([("limit", json!(3))]);
    let outer = FunctionObject::new(
        Arc::new(CodeObject::new("outer").with_nested(&inner)),
        "pkg.mod",
        Arc::clone(&globals),
    );

    let mut registry = CodeRegistry::new();
    registry.add_function(&outer);
    let mut map = PreloadMap::new();
    let keys = preload_pending(&mut registry, &mut map, |_, _| true);
    assert_eq!(keys.len(), 2);

    let nested = map.get_by_code(inner.id).unwrap();
    assert_eq!(nested.metadata.fullname, "pkg.mod:outer.<locals>.inner");
    assert_eq!(nested.metadata.globals, vec![("limit".to_string(), Some(json!(3)))]);
    assert!(Arc::ptr_eq(&nested.globals, &globals));
    assert_eq!(
        map.get(outer.key()).unwrap().metadata.nested,
        vec![UnitKey::Code(inner.id)]
    );
}

#[test]
fn code_without_module_data_is_declined() {
    let orphan = Arc::new(CodeObject::new("orphan"));
    let key = UnitKey::Code(orphan.id);
    let mut registry = CodeRegistry::new();
    registry.add_code(orphan, "batch", Globals::new());
    registry.clear_code_data();

    let mut map = PreloadMap::new();
    let keys = preload_pending(&mut registry, &mut map, |_, _| true);
    assert!(keys.is_empty());
    assert!(map.get(key).is_none());
    assert_eq!(registry.status(key), Some(UnitStatus::Declined));
    assert_eq!(registry.pending_count(), 0);
}

// ===========================================================================
// Compiling from inside a compile
// ===========================================================================

struct CompilesInner {
    inner: UnitKey,
    nested_ok: AtomicBool,
    order: Mutex<Vec<String>>,
}

impl CompileBackend for CompilesInner {
    fn compile(&self, unit: &PreloadedUnit, cx: &CompileContext<'_>) -> CompileResult {
        if unit.key != self.inner {
            let nested = cx.compile_nested(self.inner);
            self.nested_ok.store(nested.is_ok(), Ordering::SeqCst);
        }
        self.order.lock().push(unit.metadata.qualname.clone());
        CompileResult::Ok(unit.code_runtime())
    }
}

#[test]
fn nested_compile_claims_a_waiting_unit() {
    let inner = Arc::new(CodeObject::new("outer.<locals>.inner"));
    let outer = FunctionObject::new(
        Arc::new(CodeObject::new("outer").with_nested(&inner)),
        "batch",
        Globals::new(),
    );

    let mut registry = CodeRegistry::new();
    registry.add_function(&outer);
    let mut map = PreloadMap::new();
    preload_pending(&mut registry, &mut map, |_, _| true);

    let backend = CompilesInner {
        inner: UnitKey::Code(inner.id),
        nested_ok: AtomicBool::new(false),
        order: Mutex::new(Vec::new()),
    };
    let (lock, access) = (CompileLock::new(), MetadataAccess::new());
    let settings = SchedulerSettings {
        workers: 0,
        drain_retry_limit: 2,
        record_compile_times: false,
    };
    let outcome = CompileScheduler::new(&map, &backend, &lock, &access, settings).run();

    assert_eq!(outcome.report.done, 2);
    assert_eq!(outcome.report.attempted, 2);
    assert!(backend.nested_ok.load(Ordering::SeqCst));
    assert_eq!(*backend.order.lock(), vec!["outer.<locals>.inner", "outer"]);
    assert!(outcome.compile_times.is_empty());
}

/// Only succeeds if compiling itself again reports a retry and an unknown
/// unit is declined.
struct CompilesItself;

impl CompileBackend for CompilesItself {
    fn compile(&self, unit: &PreloadedUnit, cx: &CompileContext<'_>) -> CompileResult {
        let again = cx.compile_nested(unit.key);
        let stranger = cx.compile_nested(UnitKey::Function(FunctionId::next()));
        match (again, stranger) {
            (CompileResult::Retry, CompileResult::CannotSpecialize) => {
                CompileResult::Ok(unit.code_runtime())
            }
            _ => CompileResult::CannotSpecialize,
        }
    }
}

#[test]
fn nested_compile_of_a_unit_in_progress_retries() {
    let mut rt = runtime(CompilesItself);
    let f = func("recursive");
    rt.register_function(&f);
    let report = rt.compile_all_pending(1);
    assert_eq!(report.done, 1);
    assert!(rt.is_compiled(f.key()));
}

// ===========================================================================
// Metadata access during a batch
// ===========================================================================

/// Reads a global and writes a marker back from whichever worker runs it.
struct ReadsGlobals;

impl CompileBackend for ReadsGlobals {
    fn compile(&self, unit: &PreloadedUnit, cx: &CompileContext<'_>) -> CompileResult {
        if cx.global(unit, "enabled") != Some(json!(true)) {
            return CompileResult::CannotSpecialize;
        }
        cx.set_global(
            &unit.globals,
            &format!("compiled_{}", unit.metadata.qualname),
            json!(true),
        );
        CompileResult::Ok(unit.code_runtime())
    }
}

#[test]
fn workers_read_and_write_metadata_during_a_batch() {
    let globals = Globals::from_pairs([("enabled", json!(true))]);
    let mut rt = runtime(ReadsGlobals);
    for i in 0..16 {
        let f = FunctionObject::new(
            Arc::new(CodeObject::new(format!("g{i}"))),
            "batch",
            Arc::clone(&globals),
        );
        rt.register_function(&f);
    }
    let report = rt.compile_all_pending(4);
    assert_eq!(report.done, 16);
    assert_eq!(globals.len(), 17);
    assert!(!rt.metadata_access().is_relaxed());
}

#[test]
fn unsynchronized_read_after_a_batch_is_fatal() {
    let mut rt = runtime(ReadsGlobals);
    rt.register_function(&func("once"));
    rt.compile_all_pending(2);

    let access = rt.metadata_access();
    let denied = thread::scope(|scope| {
        scope
            .spawn(|| access.check_read("module globals"))
            .join()
            .is_err()
    });
    assert!(denied);
}

struct Explodes;

impl CompileBackend for Explodes {
    fn compile(&self, unit: &PreloadedUnit, _cx: &CompileContext<'_>) -> CompileResult {
        if unit.metadata.qualname == "boom" {
            panic!("backend crashed on {}", unit.metadata.fullname);
        }
        CompileResult::Ok(unit.code_runtime())
    }
}

#[test]
fn relaxed_check_is_restored_when_a_worker_panics() {
    let mut rt = runtime(Explodes);
    rt.register_function(&func("fine"));
    rt.register_function(&func("boom"));

    let result = catch_unwind(AssertUnwindSafe(|| rt.compile_all_pending(2)));
    assert!(result.is_err());
    assert!(!rt.metadata_access().is_relaxed());
}
