//! Ember JIT front door.
//!
//! Units (functions and bare code objects) are registered as they are
//! created, preloaded on the owning thread, and then compiled in batches by a
//! pool of workers. See [`JitRuntime`] for the lifecycle and
//! [`CompileScheduler`] for the batch protocol.

pub mod backend;
pub mod config;
pub mod error;
pub mod preload;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod sync;
pub mod unit;

pub use backend::{AllowAll, CompileBackend, CompileResult, UnitFilter};
pub use config::{ConfigError, JitConfig};
pub use error::{JitError, SchedulerViolation};
pub use preload::{find_nested_codes, preload_pending, preload_unit, PreloadMap, PreloadedMetadata, PreloadedUnit};
pub use registry::{CodeData, CodeRegistry};
pub use runtime::{CompileStats, JitRuntime};
pub use scheduler::{
    BatchOutcome, BatchReport, CompileContext, CompileScheduler, SchedulerSettings, UnitOutcome,
};
pub use sync::{CompileLock, MetadataAccess, RelaxGuard, SharedState};
pub use unit::{
    CodeObject, Constant, FunctionId, FunctionObject, Globals, Unit, UnitKey, UnitStatus,
};
