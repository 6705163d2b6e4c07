use thiserror::Error;

use crate::config::ConfigError;
use crate::unit::UnitKey;

/// Recoverable errors surfaced by [`JitRuntime`](crate::JitRuntime).
#[derive(Debug, Error)]
pub enum JitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("multithreaded_compile_test not enabled")]
    CompileTestDisabled,
}

/// Invariant violations in the compile pipeline. These are reported through
/// [`ember_rt::fatal`] and never returned.
#[derive(Debug, Clone, Error)]
pub enum SchedulerViolation {
    #[error("unit {0} reported compiled twice")]
    UnitCompiledTwice(UnitKey),
    #[error("batch accounting mismatch: {done} done + {declined} declined != {total} units")]
    BatchIncomplete {
        done: usize,
        declined: usize,
        total: usize,
    },
    #[error("unsynchronized read of {what} from thread {thread} outside threaded compile")]
    UnsynchronizedRead { what: String, thread: String },
    #[error("unit {0} has no preloaded metadata")]
    NotPreloaded(UnitKey),
}
