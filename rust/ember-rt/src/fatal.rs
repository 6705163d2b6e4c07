//! Fatal invariant reporting.
//!
//! A divergence between the shadow stack and the heavyweight frame chain, a
//! frame unlinked twice, or a generator whose frame cannot be found are bugs
//! in the runtime. They are never repaired. The runtime assembles a
//! [`StackDump`] for post-mortem logging, emits it through `tracing`, and then
//! panics with the violation message.
//!
//! Panics are reserved for violated invariants; expected operational
//! outcomes are returned as values.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::frame::{FrameId, UnlinkPath};
use crate::generator::GeneratorId;
use crate::stack::{ActivationId, PayloadKind};

// ---------------------------------------------------------------------------
// StackDump
// ---------------------------------------------------------------------------

/// Identity of one activation (or one heavyweight frame) in a dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationIdentity {
    /// Heavyweight frame id, when the entry refers to a materialized frame.
    pub frame: Option<u64>,
    /// Fully-qualified name of the code being executed.
    pub code: String,
}

/// Ordered list of activation identities handed to the diagnostics sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackDump {
    pub entries: Vec<ActivationIdentity>,
}

impl StackDump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Option<FrameId>, code: impl Into<String>) {
        self.entries.push(ActivationIdentity {
            frame: frame.map(FrameId::as_u64),
            code: code.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the dumped activations, in dump order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.code.as_str()).collect()
    }

    /// Render the dump as a single JSON line.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self.entries))
    }
}

impl fmt::Display for StackDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, " <- ")?;
            }
            match entry.frame {
                Some(id) => write!(f, "{}#{}", entry.code, id)?,
                None => write!(f, "{}", entry.code)?,
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StackViolation
// ---------------------------------------------------------------------------

/// Invariant violations detected by the call-stack machinery.
#[derive(Debug, Clone, Error)]
pub enum StackViolation {
    #[error("stack walk didn't consume entire heavyweight frame chain; left: {dangling}")]
    DanglingFrames { dangling: StackDump },

    #[error("heavyweight frame chain diverges from shadow stack at depth {depth}")]
    ChainMismatch { depth: usize },

    #[error("generator {0} must be running to materialize its frame")]
    GeneratorNotRunning(GeneratorId),

    #[error("failed to find frame for generator {0}")]
    GeneratorFrameMissing(GeneratorId),

    #[error("generator {0} was dropped while its activation is live")]
    GeneratorGone(GeneratorId),

    #[error("frame {frame} unlinked twice (first by {first}, then by {second})")]
    DoubleUnlink {
        frame: FrameId,
        first: UnlinkPath,
        second: UnlinkPath,
    },

    #[error("frame {0} is not the thread's current frame")]
    UnlinkNotTop(FrameId),

    #[error("unlink trampoline fired without a stashed return address in frame {0}")]
    MissingReturnAddress(FrameId),

    #[error("unlink trampoline already installed for frame {0}")]
    TrampolineAlreadyInstalled(FrameId),

    #[error("unlink trampoline needs a compiled activation, but frame {frame} belongs to a {kind:?} activation")]
    TrampolineOnUncompiled { frame: FrameId, kind: PayloadKind },

    #[error("{0} returned through the unlink trampoline but has no heavyweight frame")]
    TrampolineWithoutFrame(ActivationId),

    #[error("frame {0} left the stack without being unlinked")]
    MissingUnlink(FrameId),

    #[error("{0} is not on the shadow stack")]
    ActivationNotFound(ActivationId),

    #[error("heavyweight frame without corresponding shadow frame")]
    OrphanFrame,

    #[error("unbalanced shadow stack: expected {expected}, found {found}")]
    UnbalancedStack { expected: String, found: String },
}

// ---------------------------------------------------------------------------
// fatal
// ---------------------------------------------------------------------------

/// Report a fatal invariant violation and abort the current thread of control.
///
/// The dump, when present, is logged as structured JSON before the panic so a
/// host-installed subscriber sees it even if the panic is caught higher up.
#[track_caller]
pub fn fatal<E: std::error::Error>(violation: E, dump: Option<&StackDump>) -> ! {
    match dump {
        Some(dump) => tracing::error!(dump = %dump.to_json(), "{violation}"),
        None => tracing::error!("{violation}"),
    }
    panic!("fatal invariant violation: {violation}");
}
