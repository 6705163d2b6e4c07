//! Code runtime handles.
//!
//! A [`CodeRuntime`] is the per-unit record that compiled code hands to the
//! call stack: every shadow frame and every materialized frame points at one.
//! It carries just enough identity to build a heavyweight frame and to name an
//! activation in a diagnostic dump.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// CodeId
// ---------------------------------------------------------------------------

/// Monotonically increasing counter used to mint unique [`CodeId`]s.
static NEXT_CODE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a piece of code known to the runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(u64);

impl CodeId {
    /// Allocate the next unique code ID.
    pub fn next() -> Self {
        Self(NEXT_CODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeId({})", self.0)
    }
}

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// CodeRuntime
// ---------------------------------------------------------------------------

/// Runtime metadata for one unit of code, shared by every activation of it.
#[derive(Debug)]
pub struct CodeRuntime {
    id: CodeId,
    module: String,
    qualname: String,
}

impl CodeRuntime {
    /// Create a code runtime for `module:qualname` with a fresh [`CodeId`].
    pub fn new(module: impl Into<String>, qualname: impl Into<String>) -> Arc<Self> {
        Self::with_id(CodeId::next(), module, qualname)
    }

    /// Create a code runtime that reuses an identity minted elsewhere.
    pub fn with_id(id: CodeId, module: impl Into<String>, qualname: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            module: module.into(),
            qualname: qualname.into(),
        })
    }

    pub fn id(&self) -> CodeId {
        self.id
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    /// The fully-qualified `module:qualname` form used in logs and dumps.
    pub fn fullname(&self) -> String {
        format!("{}:{}", self.module, self.qualname)
    }
}
