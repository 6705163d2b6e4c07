//! The unlink trampoline.
//!
//! When a compiled activation gets a heavyweight frame, something has to
//! unlink that frame when the activation returns. Compiled code knows nothing
//! about heavyweight frames, so instead of teaching it we redirect its return:
//! the original return address is stashed inside the frame itself and the
//! activation's return slot is overwritten with [`ReturnAddress::TRAMPOLINE`].
//! When the activation returns, control lands in [`fire`], which unlinks the
//! frame and continues at the stashed address as if nothing happened.
//!
//! Deoptimization hands the frame over to the interpreter before the
//! trampoline fires, so it has to undo the redirect first
//! ([`remove_unlink_trampoline`]).

use std::fmt;

use crate::fatal::{fatal, StackViolation};
use crate::frame::{MaterializedFrame, UnlinkPath};
use crate::stack::{Activation, PayloadKind, ThreadState};

/// A code address held in an activation's return slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReturnAddress(u64);

impl ReturnAddress {
    /// Entry point of the shared unlink trampoline.
    pub const TRAMPOLINE: ReturnAddress = ReturnAddress(u64::MAX);

    /// Placeholder slot value for activations that never return through a
    /// patched slot (generator activations are popped by their controller).
    pub(crate) const NONE: ReturnAddress = ReturnAddress(0);

    /// Wrap a caller-supplied return address.
    ///
    /// # Panics
    ///
    /// If `raw` collides with the trampoline entry point.
    pub fn new(raw: u64) -> Self {
        assert!(
            raw != Self::TRAMPOLINE.0,
            "return address collides with the unlink trampoline"
        );
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_trampoline(self) -> bool {
        self == Self::TRAMPOLINE
    }
}

impl fmt::Debug for ReturnAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_trampoline() {
            write!(f, "ReturnAddress(<unlink trampoline>)")
        } else {
            write!(f, "ReturnAddress({:#x})", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Installation
// ---------------------------------------------------------------------------

/// Only compiled activations return through a patchable slot. Interpreted
/// frames are unlinked by the interpreter and generator frames by their
/// controller.
pub(crate) fn install(activation: &mut Activation, frame: &MaterializedFrame) {
    let kind = activation.shadow().kind();
    if kind != PayloadKind::CompiledUnit {
        fatal(
            StackViolation::TrampolineOnUncompiled {
                frame: frame.id(),
                kind,
            },
            None,
        );
    }
    let original = activation.return_slot();
    if original.is_trampoline() || frame.stashed_return().is_some() {
        fatal(StackViolation::TrampolineAlreadyInstalled(frame.id()), None);
    }
    frame.stash_return(original);
    activation.set_return_slot(ReturnAddress::TRAMPOLINE);
    frame.set_owner(UnlinkPath::Trampoline);
}

pub(crate) fn uninstall(activation: &mut Activation, frame: &MaterializedFrame) -> bool {
    if !activation.return_slot().is_trampoline() {
        return false;
    }
    match frame.take_stashed_return() {
        Some(original) => {
            activation.set_return_slot(original);
            true
        }
        None => fatal(StackViolation::MissingReturnAddress(frame.id()), None),
    }
}

/// Redirect the return of `frame`'s activation through the unlink trampoline.
///
/// The frame becomes owned by the trampoline: it is unlinked exactly when the
/// activation returns.
pub fn insert_unlink_trampoline(thread: &mut ThreadState, frame: &MaterializedFrame) {
    let id = frame.activation();
    let Some(activation) = thread.stack_mut().find_mut(id) else {
        fatal(StackViolation::ActivationNotFound(id), None);
    };
    install(activation, frame);
}

/// Undo [`insert_unlink_trampoline`], restoring the original return address.
///
/// Returns `false` if the slot was not redirected.
pub fn remove_unlink_trampoline(thread: &mut ThreadState, frame: &MaterializedFrame) -> bool {
    let id = frame.activation();
    let Some(activation) = thread.stack_mut().find_mut(id) else {
        fatal(StackViolation::ActivationNotFound(id), None);
    };
    uninstall(activation, frame)
}

// ---------------------------------------------------------------------------
// The trampoline routine
// ---------------------------------------------------------------------------

/// Runs when an instrumented activation returns. `returning` has already been
/// popped off the shadow stack.
pub(crate) fn fire(thread: &mut ThreadState, returning: &Activation) -> ReturnAddress {
    let Some(frame) = returning.materialized() else {
        fatal(StackViolation::TrampolineWithoutFrame(returning.id()), None);
    };
    let Some(original) = frame.take_stashed_return() else {
        fatal(StackViolation::MissingReturnAddress(frame.id()), None);
    };
    thread.unlink_top(&frame, UnlinkPath::Trampoline);
    original
}
