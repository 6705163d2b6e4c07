//! Heavyweight, introspectable frames.
//!
//! A [`MaterializedFrame`] is built lazily from a shadow frame when something
//! (a debugger, a traceback, the exception machinery) needs to look at the
//! stack. Frames form a singly-linked chain through their `back` pointer,
//! innermost first, with the thread's "current frame" slot at the head.
//!
//! # Ownership
//!
//! Each `back` link owns its target. Exactly one party is responsible for
//! unlinking a frame from the chain and releasing it, recorded as the frame's
//! [`UnlinkPath`]:
//!
//! | Owner | When it unlinks |
//! |---|---|
//! | unlink trampoline | the compiled activation returns |
//! | generator controller | the generator completes or is torn down |
//! | deoptimization path | the deoptimized activation returns |
//! | interpreter | the interpreted activation returns |
//!
//! A second unlink of the same frame is a fatal invariant violation.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strum::{Display, EnumIter};

use crate::code::CodeRuntime;
use crate::fatal::{fatal, StackViolation};
use crate::generator::GeneratorId;
use crate::stack::ActivationId;
use crate::trampoline::ReturnAddress;

// ---------------------------------------------------------------------------
// FrameId
// ---------------------------------------------------------------------------

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a materialized frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u64);

impl FrameId {
    fn next() -> Self {
        Self(NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({})", self.0)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// UnlinkPath
// ---------------------------------------------------------------------------

/// The party that owns a frame's final unlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum UnlinkPath {
    /// The shared unlink trampoline, when the compiled activation returns.
    Trampoline,
    /// The generator controller, at completion or teardown.
    GeneratorCompletion,
    /// The deoptimization path, when the deoptimized activation returns.
    Deopt,
    /// The interpreter, for frames it created itself.
    Interpreter,
}

// ---------------------------------------------------------------------------
// MaterializedFrame
// ---------------------------------------------------------------------------

/// A heavyweight frame object.
pub struct MaterializedFrame {
    id: FrameId,
    code: Arc<CodeRuntime>,
    /// Owning link to the enclosing frame.
    back: RefCell<Option<Rc<MaterializedFrame>>>,
    executing: Cell<bool>,
    /// Borrowed back-reference to the generator that owns this frame.
    generator: Option<GeneratorId>,
    /// Activation currently backing this frame. Generator frames are rebound
    /// on every resume.
    activation: Cell<ActivationId>,
    owner: Cell<Option<UnlinkPath>>,
    /// Spare slot used by the unlink trampoline to stash the original return
    /// address of the instrumented activation.
    stashed_return: Cell<Option<ReturnAddress>>,
    unlinks: Cell<u32>,
    unlinked_by: Cell<Option<UnlinkPath>>,
}

impl MaterializedFrame {
    pub(crate) fn new(
        code: Arc<CodeRuntime>,
        activation: ActivationId,
        generator: Option<GeneratorId>,
    ) -> Rc<Self> {
        Rc::new(Self {
            id: FrameId::next(),
            code,
            back: RefCell::new(None),
            executing: Cell::new(true),
            generator,
            activation: Cell::new(activation),
            owner: Cell::new(None),
            stashed_return: Cell::new(None),
            unlinks: Cell::new(0),
            unlinked_by: Cell::new(None),
        })
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn code(&self) -> &Arc<CodeRuntime> {
        &self.code
    }

    /// The enclosing frame, if any.
    pub fn back(&self) -> Option<Rc<MaterializedFrame>> {
        self.back.borrow().clone()
    }

    pub fn is_executing(&self) -> bool {
        self.executing.get()
    }

    pub fn generator(&self) -> Option<GeneratorId> {
        self.generator
    }

    pub fn activation(&self) -> ActivationId {
        self.activation.get()
    }

    /// Who is responsible for unlinking this frame.
    pub fn owner(&self) -> Option<UnlinkPath> {
        self.owner.get()
    }

    /// Number of times the frame has been unlinked. Anything other than 0 or
    /// 1 is unreachable: a second unlink aborts.
    pub fn unlink_count(&self) -> u32 {
        self.unlinks.get()
    }

    pub fn unlinked_by(&self) -> Option<UnlinkPath> {
        self.unlinked_by.get()
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinks.get() > 0
    }

    // -- crate-internal mutation ------------------------------------------

    pub(crate) fn set_back(&self, back: Option<Rc<MaterializedFrame>>) {
        *self.back.borrow_mut() = back;
    }

    pub(crate) fn take_back(&self) -> Option<Rc<MaterializedFrame>> {
        self.back.borrow_mut().take()
    }

    pub(crate) fn set_executing(&self, executing: bool) {
        self.executing.set(executing);
    }

    pub(crate) fn set_activation(&self, activation: ActivationId) {
        self.activation.set(activation);
    }

    pub(crate) fn set_owner(&self, owner: UnlinkPath) {
        self.owner.set(Some(owner));
    }

    pub(crate) fn stash_return(&self, addr: ReturnAddress) {
        self.stashed_return.set(Some(addr));
    }

    pub(crate) fn stashed_return(&self) -> Option<ReturnAddress> {
        self.stashed_return.get()
    }

    pub(crate) fn take_stashed_return(&self) -> Option<ReturnAddress> {
        self.stashed_return.take()
    }

    /// Record the final unlink of this frame.
    pub(crate) fn record_unlink(&self, path: UnlinkPath) {
        if let Some(first) = self.unlinked_by.get() {
            fatal(
                StackViolation::DoubleUnlink {
                    frame: self.id,
                    first,
                    second: path,
                },
                None,
            );
        }
        self.unlinks.set(self.unlinks.get() + 1);
        self.unlinked_by.set(Some(path));
        self.executing.set(false);
        tracing::trace!(frame = %self.id, code = %self.code.fullname(), %path, "unlinked frame");
    }
}

impl Drop for MaterializedFrame {
    fn drop(&mut self) {
        // Unwind long chains iteratively.
        let mut next = self.back.get_mut().take();
        while let Some(frame) = next {
            match Rc::try_unwrap(frame) {
                Ok(mut frame) => next = frame.back.get_mut().take(),
                Err(_) => break,
            }
        }
    }
}

impl fmt::Debug for MaterializedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializedFrame")
            .field("id", &self.id)
            .field("code", &self.code.fullname())
            .field("back", &self.back.borrow().as_ref().map(|b| b.id))
            .field("executing", &self.executing.get())
            .field("owner", &self.owner.get())
            .field("unlinks", &self.unlinks.get())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FrameChain
// ---------------------------------------------------------------------------

/// Iterator over a heavyweight chain, following `back` links.
pub struct FrameChain {
    next: Option<Rc<MaterializedFrame>>,
}

impl FrameChain {
    pub fn new(head: Option<Rc<MaterializedFrame>>) -> Self {
        Self { next: head }
    }
}

impl Iterator for FrameChain {
    type Item = Rc<MaterializedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.back();
        Some(current)
    }
}
