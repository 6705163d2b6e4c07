//! Seams to the parts of the JIT that live elsewhere: the compiler itself and
//! the policy deciding which units are worth compiling.

use std::sync::Arc;

use ember_rt::CodeRuntime;

use crate::preload::PreloadedUnit;
use crate::scheduler::CompileContext;

/// Outcome of one compile attempt.
#[derive(Debug, Clone)]
pub enum CompileResult {
    Ok(Arc<CodeRuntime>),
    /// Transient contention; the attempt must be repeated later.
    Retry,
    /// The unit is intentionally not compiled. Not an error.
    CannotSpecialize,
}

impl CompileResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, CompileResult::Ok(_))
    }

    pub fn code(&self) -> Option<&Arc<CodeRuntime>> {
        match self {
            CompileResult::Ok(code) => Some(code),
            _ => None,
        }
    }
}

/// The bytecode-to-machine-code compiler.
///
/// Called concurrently from every compile worker. Implementations may only
/// read shared metadata through `unit` and `cx`, and must route writes
/// through [`CompileContext::set_global`].
pub trait CompileBackend: Send + Sync {
    fn compile(&self, unit: &PreloadedUnit, cx: &CompileContext<'_>) -> CompileResult;
}

/// Eligibility policy (allow/deny lists and the like).
pub trait UnitFilter: Send + Sync {
    /// Whether a restrictive list is in effect. Nested code is only scanned
    /// for at registration time when it is.
    fn is_active(&self) -> bool;

    fn is_eligible(&self, module: &str, qualname: &str) -> bool;
}

/// Every unit is eligible.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl UnitFilter for AllowAll {
    fn is_active(&self) -> bool {
        false
    }

    fn is_eligible(&self, _module: &str, _qualname: &str) -> bool {
        true
    }
}
