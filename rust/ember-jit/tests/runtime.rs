//! Integration tests for the JIT runtime lifecycle: configuration,
//! registration, single-unit compiles, disabling and teardown.

use std::sync::Arc;

use ember_jit::*;
use serde_json::json;

struct Compiles;

impl CompileBackend for Compiles {
    fn compile(&self, unit: &PreloadedUnit, _cx: &CompileContext<'_>) -> CompileResult {
        CompileResult::Ok(unit.code_runtime())
    }
}

struct Declines;

impl CompileBackend for Declines {
    fn compile(&self, _unit: &PreloadedUnit, _cx: &CompileContext<'_>) -> CompileResult {
        CompileResult::CannotSpecialize
    }
}

struct AlwaysRetry;

impl CompileBackend for AlwaysRetry {
    fn compile(&self, _unit: &PreloadedUnit, _cx: &CompileContext<'_>) -> CompileResult {
        CompileResult::Retry
    }
}

fn func(name: &str) -> Arc<FunctionObject> {
    FunctionObject::new(Arc::new(CodeObject::new(name)), "app", Globals::new())
}

// ===========================================================================
// Configuration
// ===========================================================================

#[test]
fn config_loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jit.toml");
    std::fs::write(
        &path,
        "batch_compile_workers = 3\nmultithreaded_compile_test = true\n",
    )
    .unwrap();

    let config = JitConfig::load_from(&path).unwrap();
    assert_eq!(config.batch_compile_workers, 3);
    assert!(config.multithreaded_compile_test);
    assert!(config.enabled);

    let rt = JitRuntime::new(config, Compiles).unwrap();
    assert_eq!(rt.config().batch_compile_workers, 3);
}

#[test]
fn missing_config_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = JitConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn runtime_rejects_invalid_config() {
    let config = JitConfig {
        drain_retry_limit: 0,
        ..JitConfig::default()
    };
    let err = JitRuntime::new(config, Compiles).err().unwrap();
    assert!(matches!(err, JitError::Config(ConfigError::Invalid(_))));
}

#[test]
fn disabled_by_config_registers_nothing() {
    let config = JitConfig::from_toml_str("enabled = false").unwrap();
    let mut rt = JitRuntime::new(config, Compiles).unwrap();
    assert!(!rt.is_enabled());
    assert!(!rt.register_function(&func("f")));
    assert_eq!(rt.pending_count(), 0);
}

// ===========================================================================
// Single-unit compiles
// ===========================================================================

#[test]
fn force_compile_only_compiles_pending_functions() {
    let mut rt = JitRuntime::new(JitConfig::default(), Compiles).unwrap();
    let f = func("hot");
    rt.register_function(&f);
    assert_eq!(rt.status(f.key()), Some(UnitStatus::Pending));

    assert!(rt.force_compile(&f));
    assert!(rt.is_compiled(f.key()));
    assert_eq!(rt.pending_count(), 0);
    assert!(!rt.force_compile(&f));
}

#[test]
fn compile_function_reuses_code_compiled_for_the_same_code_object() {
    let mut rt = JitRuntime::new(JitConfig::default(), Compiles).unwrap();
    let code = Arc::new(CodeObject::new("shared"));
    let first = FunctionObject::new(Arc::clone(&code), "app", Globals::new());
    let second = FunctionObject::new(Arc::clone(&code), "app", Globals::new());

    let a = rt.compile_function(&first);
    let b = rt.compile_function(&second);
    assert!(Arc::ptr_eq(a.code().unwrap(), b.code().unwrap()));
    assert_eq!(rt.stats().attempts, 1);
}

#[test]
fn declined_compile_is_not_an_error() {
    let mut rt = JitRuntime::new(JitConfig::default(), Declines).unwrap();
    let f = func("cold");
    assert!(matches!(rt.compile_function(&f), CompileResult::CannotSpecialize));
    assert_eq!(rt.status(f.key()), Some(UnitStatus::Declined));
    assert!(!rt.is_compiled(f.key()));
}

#[test]
fn endless_retries_are_declined_after_the_drain_limit() {
    let config = JitConfig {
        drain_retry_limit: 3,
        ..JitConfig::default()
    };
    let mut rt = JitRuntime::new(config, AlwaysRetry).unwrap();
    let f = func("contended");
    assert!(matches!(rt.compile_function(&f), CompileResult::CannotSpecialize));
    assert_eq!(rt.stats().attempts, 4);
    assert_eq!(rt.stats().retries, 4);
    assert_eq!(rt.status(f.key()), Some(UnitStatus::Declined));
}

// ===========================================================================
// Disable, compile test and teardown
// ===========================================================================

#[test]
fn disable_compiles_everything_pending() {
    let config = JitConfig {
        batch_compile_workers: 2,
        ..JitConfig::default()
    };
    let mut rt = JitRuntime::new(config, Compiles).unwrap();
    let funcs: Vec<_> = (0..5).map(|i| func(&format!("late{i}"))).collect();
    for f in &funcs {
        rt.register_function(f);
    }

    let report = rt.disable(true).unwrap();
    assert_eq!(report.done, 5);
    assert!(!rt.is_enabled());
    assert!(funcs.iter().all(|f| rt.is_compiled(f.key())));

    // A sibling created after disabling still gets the compiled code.
    let sibling = FunctionObject::new(Arc::clone(&funcs[0].code), "app", Globals::new());
    assert!(rt.register_function(&sibling));
    assert_eq!(rt.pending_count(), 0);
}

#[test]
fn disable_without_compiling_drops_nothing_compiled() {
    let mut rt = JitRuntime::new(JitConfig::default(), Compiles).unwrap();
    rt.register_function(&func("waiting"));
    assert!(rt.disable(false).is_none());
    assert_eq!(rt.pending_count(), 1);
    assert_eq!(rt.stats().attempts, 0);
}

#[test]
fn compile_test_recompiles_with_fresh_counters() {
    let config = JitConfig {
        multithreaded_compile_test: true,
        batch_compile_workers: 4,
        ..JitConfig::default()
    };
    let mut rt = JitRuntime::new(config, Compiles).unwrap();
    for i in 0..20 {
        rt.register_function(&func(&format!("t{i}")));
    }

    let report = rt.multithreaded_compile_test().unwrap();
    assert_eq!(report.total, 20);
    assert_eq!(report.done, 20);
    assert_eq!(report.workers, 4);
    assert_eq!(rt.stats().attempts, 20);

    let again = rt.multithreaded_compile_test().unwrap();
    assert_eq!(again.total, 0);
    assert_eq!(rt.stats().attempts, 0);
}

#[test]
fn compile_test_stops_reporting_dropped_code_as_compiled() {
    let config = JitConfig {
        multithreaded_compile_test: true,
        ..JitConfig::default()
    };
    let mut rt = JitRuntime::new(config, Compiles).unwrap();
    let f = func("stale");
    rt.register_function(&f);
    rt.compile_all_pending(1);
    assert!(rt.is_compiled(f.key()));

    rt.multithreaded_compile_test().unwrap();
    assert!(!rt.is_compiled(f.key()));
    assert_eq!(rt.status(f.key()), None);
    assert!(rt.registry().attach(&f).is_none());
}

#[test]
fn destroyed_units_leave_the_registry() {
    let mut rt = JitRuntime::new(JitConfig::default(), Compiles).unwrap();
    let f = func("short_lived");
    rt.register_function(&f);
    rt.function_destroyed(f.id);
    assert_eq!(rt.status(f.key()), None);

    let code = Arc::new(CodeObject::new("lambda_site"));
    let id = code.id;
    assert!(rt.register_code(code, "app", Globals::from_pairs([("x", json!(1))])));
    assert!(rt.registry().code_data(id).is_some());
    rt.code_destroyed(id);
    assert!(rt.registry().code_data(id).is_none());
    assert_eq!(rt.pending_count(), 0);
}

#[test]
fn shutdown_clears_all_state() {
    let mut rt = JitRuntime::new(JitConfig::default(), Compiles).unwrap();
    let f = func("done");
    rt.compile_function(&f);
    rt.register_function(&func("pending"));
    rt.shutdown();
    assert_eq!(rt.pending_count(), 0);
    assert!(!rt.is_compiled(f.key()));
    assert!(!rt.is_enabled());
}
