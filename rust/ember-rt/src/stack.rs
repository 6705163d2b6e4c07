//! The per-thread shadow stack.
//!
//! Every call pushes an [`Activation`] carrying a lightweight [`ShadowFrame`];
//! every return pops it. Heavyweight frames are only built on demand (see
//! `materialize`), so the common path never allocates.
//!
//! The stack is a `Vec` indexed by depth: index 0 is the outermost
//! activation, and an activation's caller (its `prevRef`) is the entry just
//! below it. Each activation keeps a borrowed handle to its heavyweight frame
//! once one exists; ownership of that frame sits with the chain and with the
//! party named by [`MaterializedFrame::owner`].

use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::code::CodeRuntime;
use crate::fatal::{fatal, StackDump, StackViolation};
use crate::frame::{FrameChain, MaterializedFrame, UnlinkPath};
use crate::generator::{Generator, GeneratorId};
use crate::trampoline::{self, ReturnAddress};

// ---------------------------------------------------------------------------
// ActivationId
// ---------------------------------------------------------------------------

static NEXT_ACTIVATION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one call activation. Never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivationId(u64);

impl ActivationId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ACTIVATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActivationId({})", self.0)
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "activation:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ShadowFrame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    CompiledUnit,
    InterpretedUnit,
    Generator,
}

/// What a shadow frame is executing.
#[derive(Clone)]
pub enum ShadowPayload {
    Compiled(Arc<CodeRuntime>),
    Interpreted(Arc<CodeRuntime>),
    /// A running generator. The generator is referenced, not owned: it is
    /// kept alive by whoever is driving `resume`.
    Generator {
        generator: Weak<Generator>,
        id: GeneratorId,
        code: Arc<CodeRuntime>,
    },
}

impl ShadowPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            ShadowPayload::Compiled(_) => PayloadKind::CompiledUnit,
            ShadowPayload::Interpreted(_) => PayloadKind::InterpretedUnit,
            ShadowPayload::Generator { .. } => PayloadKind::Generator,
        }
    }

    pub fn code(&self) -> &Arc<CodeRuntime> {
        match self {
            ShadowPayload::Compiled(code) | ShadowPayload::Interpreted(code) => code,
            ShadowPayload::Generator { code, .. } => code,
        }
    }

    pub fn generator_id(&self) -> Option<GeneratorId> {
        match self {
            ShadowPayload::Generator { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Debug for ShadowPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShadowPayload::Compiled(code) => write!(f, "Compiled({})", code.fullname()),
            ShadowPayload::Interpreted(code) => write!(f, "Interpreted({})", code.fullname()),
            ShadowPayload::Generator { id, code, .. } => {
                write!(f, "Generator({id}, {})", code.fullname())
            }
        }
    }
}

/// Lightweight record of one active call.
#[derive(Debug, Clone)]
pub struct ShadowFrame {
    payload: ShadowPayload,
    has_materialized: bool,
}

impl ShadowFrame {
    pub fn new(payload: ShadowPayload) -> Self {
        Self {
            payload,
            has_materialized: false,
        }
    }

    pub fn payload(&self) -> &ShadowPayload {
        &self.payload
    }

    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    pub fn code(&self) -> &Arc<CodeRuntime> {
        self.payload.code()
    }

    pub fn has_materialized(&self) -> bool {
        self.has_materialized
    }

    pub(crate) fn set_materialized(&mut self, value: bool) {
        self.has_materialized = value;
    }

    pub(crate) fn set_payload(&mut self, payload: ShadowPayload) {
        self.payload = payload;
    }
}

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// One entry of the execution stack.
#[derive(Debug)]
pub struct Activation {
    id: ActivationId,
    shadow: ShadowFrame,
    return_slot: ReturnAddress,
    frame: Option<Weak<MaterializedFrame>>,
}

impl Activation {
    fn new(shadow: ShadowFrame, return_slot: ReturnAddress) -> Self {
        Self {
            id: ActivationId::next(),
            shadow,
            return_slot,
            frame: None,
        }
    }

    pub fn id(&self) -> ActivationId {
        self.id
    }

    pub fn shadow(&self) -> &ShadowFrame {
        &self.shadow
    }

    pub(crate) fn shadow_mut(&mut self) -> &mut ShadowFrame {
        &mut self.shadow
    }

    /// Current contents of the return-address slot.
    pub fn return_slot(&self) -> ReturnAddress {
        self.return_slot
    }

    pub(crate) fn set_return_slot(&mut self, addr: ReturnAddress) {
        self.return_slot = addr;
    }

    /// The heavyweight frame for this activation, if one has been built.
    pub fn materialized(&self) -> Option<Rc<MaterializedFrame>> {
        if !self.shadow.has_materialized {
            return None;
        }
        self.frame.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn bind_frame(&mut self, frame: &Rc<MaterializedFrame>) {
        self.frame = Some(Rc::downgrade(frame));
        self.shadow.set_materialized(true);
    }
}

// ---------------------------------------------------------------------------
// ExecutionStack
// ---------------------------------------------------------------------------

/// Append-only chain of activations for one thread.
#[derive(Debug, Default)]
pub struct ExecutionStack {
    activations: Vec<Activation>,
}

impl ExecutionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    pub fn top(&self) -> Option<&Activation> {
        self.activations.last()
    }

    /// Activation at `index`, counted from the outermost (index 0).
    pub fn get(&self, index: usize) -> Option<&Activation> {
        self.activations.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Activation> {
        self.activations.get_mut(index)
    }

    /// Iterate activations innermost-first.
    pub fn iter(&self) -> impl Iterator<Item = &Activation> + '_ {
        self.activations.iter().rev()
    }

    pub fn position(&self, id: ActivationId) -> Option<usize> {
        self.activations.iter().rposition(|a| a.id == id)
    }

    pub(crate) fn find_mut(&mut self, id: ActivationId) -> Option<&mut Activation> {
        self.activations.iter_mut().rev().find(|a| a.id == id)
    }

    fn push(&mut self, activation: Activation) -> ActivationId {
        let id = activation.id;
        self.activations.push(activation);
        id
    }

    fn pop(&mut self) -> Option<Activation> {
        self.activations.pop()
    }
}

// ---------------------------------------------------------------------------
// ThreadState
// ---------------------------------------------------------------------------

/// Per-thread call-stack state: the shadow stack plus the head of the
/// heavyweight frame chain ("current frame").
#[derive(Debug, Default)]
pub struct ThreadState {
    pub(crate) stack: ExecutionStack,
    pub(crate) current_frame: Option<Rc<MaterializedFrame>>,
}

impl ThreadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack(&self) -> &ExecutionStack {
        &self.stack
    }

    pub(crate) fn stack_mut(&mut self) -> &mut ExecutionStack {
        &mut self.stack
    }

    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    /// Shadow frames, innermost first.
    pub fn shadow_frames(&self) -> impl Iterator<Item = &ShadowFrame> + '_ {
        self.stack.iter().map(Activation::shadow)
    }

    /// Head of the heavyweight chain.
    pub fn current_frame(&self) -> Option<Rc<MaterializedFrame>> {
        self.current_frame.clone()
    }

    /// Walk the heavyweight chain from the current frame.
    pub fn frame_chain(&self) -> FrameChain {
        FrameChain::new(self.current_frame.clone())
    }

    /// Code of the innermost activation.
    pub fn current_code(&self) -> Option<Arc<CodeRuntime>> {
        match self.stack.top() {
            Some(top) => Some(Arc::clone(top.shadow.code())),
            None if self.current_frame.is_some() => {
                fatal(StackViolation::OrphanFrame, Some(&self.dump()))
            }
            None => None,
        }
    }

    // -- call entry / return ----------------------------------------------

    /// Push an activation of compiled code. No heavyweight frame is built.
    pub fn enter_compiled(&mut self, code: Arc<CodeRuntime>, ret: ReturnAddress) -> ActivationId {
        let shadow = ShadowFrame::new(ShadowPayload::Compiled(code));
        self.stack.push(Activation::new(shadow, ret))
    }

    /// Push an activation of interpreted code. The interpreter always works
    /// on a heavyweight frame, so one is built and linked eagerly.
    pub fn enter_interpreted(
        &mut self,
        code: Arc<CodeRuntime>,
        ret: ReturnAddress,
    ) -> ActivationId {
        let shadow = ShadowFrame::new(ShadowPayload::Interpreted(Arc::clone(&code)));
        let mut activation = Activation::new(shadow, ret);
        let frame = MaterializedFrame::new(code, activation.id, None);
        frame.set_owner(UnlinkPath::Interpreter);
        activation.bind_frame(&frame);
        self.link_frame(frame);
        self.stack.push(activation)
    }

    /// Pop the innermost activation and return where control continues.
    ///
    /// A compiled activation whose return slot was redirected returns through
    /// the unlink trampoline. Interpreted activations unlink their own frame.
    pub fn leave(&mut self) -> ReturnAddress {
        let Some(activation) = self.stack.pop() else {
            fatal(
                StackViolation::UnbalancedStack {
                    expected: "an activation".into(),
                    found: "an empty stack".into(),
                },
                None,
            );
        };
        match activation.shadow.kind() {
            PayloadKind::Generator => {
                let found = format!("{:?}", activation.shadow.payload());
                self.stack.push(activation);
                fatal(
                    StackViolation::UnbalancedStack {
                        expected: "a call activation".into(),
                        found,
                    },
                    Some(&self.dump()),
                );
            }
            PayloadKind::CompiledUnit if activation.return_slot.is_trampoline() => {
                trampoline::fire(self, &activation)
            }
            PayloadKind::CompiledUnit => {
                if let Some(frame) = activation.materialized() {
                    fatal(StackViolation::MissingUnlink(frame.id()), Some(&self.dump()));
                }
                activation.return_slot
            }
            PayloadKind::InterpretedUnit => {
                let Some(frame) = activation.materialized() else {
                    fatal(
                        StackViolation::UnbalancedStack {
                            expected: "an interpreted activation with a frame".into(),
                            found: format!("{:?}", activation.shadow.payload()),
                        },
                        Some(&self.dump()),
                    );
                };
                let path = frame.owner().unwrap_or(UnlinkPath::Interpreter);
                self.unlink_top(&frame, path);
                activation.return_slot
            }
        }
    }

    // -- generator activations --------------------------------------------

    pub(crate) fn push_generator(&mut self, shadow: ShadowFrame) -> ActivationId {
        self.stack.push(Activation::new(shadow, ReturnAddress::NONE))
    }

    /// Pop the generator activation `id`, which must be innermost.
    pub(crate) fn pop_generator(&mut self, id: ActivationId) -> ShadowFrame {
        match self.stack.top() {
            Some(top) if top.id == id => {}
            Some(top) => {
                let found = top.id.to_string();
                fatal(
                    StackViolation::UnbalancedStack {
                        expected: id.to_string(),
                        found,
                    },
                    Some(&self.dump()),
                );
            }
            None => fatal(StackViolation::ActivationNotFound(id), None),
        }
        match self.stack.pop() {
            Some(activation) => activation.shadow,
            None => fatal(StackViolation::ActivationNotFound(id), None),
        }
    }

    /// Bind an existing heavyweight frame to the innermost activation and
    /// link it at the head of the chain. Used when a generator that already
    /// owns a frame is resumed.
    pub(crate) fn attach_top(&mut self, frame: Rc<MaterializedFrame>) {
        let Some(top) = self.stack.activations.last_mut() else {
            fatal(StackViolation::OrphanFrame, None);
        };
        frame.set_activation(top.id);
        frame.set_executing(true);
        top.bind_frame(&frame);
        self.link_frame(frame);
    }

    // -- heavyweight chain --------------------------------------------------

    /// Push `frame` at the head of the chain.
    pub(crate) fn link_frame(&mut self, frame: Rc<MaterializedFrame>) {
        frame.set_back(self.current_frame.take());
        self.current_frame = Some(frame);
    }

    fn expect_top(&self, frame: &Rc<MaterializedFrame>) {
        let is_top = self
            .current_frame
            .as_ref()
            .is_some_and(|top| Rc::ptr_eq(top, frame));
        if !is_top {
            fatal(StackViolation::UnlinkNotTop(frame.id()), Some(&self.dump()));
        }
    }

    /// Remove `frame` from the head of the chain and record its final unlink.
    pub(crate) fn unlink_top(&mut self, frame: &Rc<MaterializedFrame>, path: UnlinkPath) {
        self.expect_top(frame);
        frame.record_unlink(path);
        self.current_frame = frame.take_back();
    }

    /// Remove `frame` from the head of the chain without releasing it. The
    /// frame stays alive in its generator until the generator resumes.
    pub(crate) fn detach_top(&mut self, frame: &Rc<MaterializedFrame>) {
        self.expect_top(frame);
        frame.set_executing(false);
        self.current_frame = frame.take_back();
    }

    /// Identities of the live activations, innermost first.
    pub fn dump(&self) -> StackDump {
        let mut dump = StackDump::new();
        for activation in self.stack.iter() {
            let frame = activation.materialized().map(|f| f.id());
            dump.push(frame, activation.shadow.code().fullname());
        }
        dump
    }
}
