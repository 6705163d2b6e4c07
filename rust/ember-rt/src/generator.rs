//! Generator controller.
//!
//! A generator runs in slices. Each [`Generator::resume`] pushes a generator
//! activation onto the thread's shadow stack, runs the body from its
//! continuation until it yields, returns or raises, and pops the activation
//! again. Between slices the generator owns its detached shadow frame, the
//! locals captured at the yield point and, if anyone ever looked at it, its
//! heavyweight frame.
//!
//! ```text
//! NotStarted ──resume──▶ Running ──yield──▶ Suspended
//!                           ▲                  │
//!                           └──────resume──────┘
//!                        Running ──return/raise──▶ Completed
//! ```
//!
//! Callers must serialize resumes of one generator; a re-entrant resume is
//! rejected, not queued.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::code::CodeRuntime;
use crate::frame::{MaterializedFrame, UnlinkPath};
use crate::stack::{ShadowFrame, ShadowPayload, ThreadState};

// ---------------------------------------------------------------------------
// Identity and errors
// ---------------------------------------------------------------------------

static NEXT_GENERATOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeneratorId(u64);

impl GeneratorId {
    fn next() -> Self {
        Self(NEXT_GENERATOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for GeneratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GeneratorId({})", self.0)
    }
}

impl fmt::Display for GeneratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen:{}", self.0)
    }
}

/// Caller errors when driving a generator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneratorError {
    #[error("cannot resume generator {0}: it has already completed")]
    AlreadyCompleted(GeneratorId),
    #[error("generator {0} is already executing")]
    AlreadyRunning(GeneratorId),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub type Locals = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorPhase {
    NotStarted,
    Running,
    Suspended,
    Completed,
}

/// Where a body picks up on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Start,
    YieldPoint(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResumeInput {
    Send(Value),
    /// An exception thrown into the generator at its suspension point.
    Throw(String),
}

/// What one slice of a generator body produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Yield {
        value: Value,
        /// Yield point to continue from on the next resume.
        next: u32,
        /// Delegate iterator when suspended inside a `yield from`.
        yield_from: Option<Value>,
    },
    Return(Value),
    Raise(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorOutcome {
    Yielded(Value),
    Returned(Value),
    Raised(String),
}

enum GeneratorState {
    NotStarted,
    Running,
    Suspended {
        shadow: ShadowFrame,
        locals: Locals,
        resume_at: u32,
        yield_from: Option<Value>,
    },
    Completed,
}

impl GeneratorState {
    fn phase(&self) -> GeneratorPhase {
        match self {
            GeneratorState::NotStarted => GeneratorPhase::NotStarted,
            GeneratorState::Running => GeneratorPhase::Running,
            GeneratorState::Suspended { .. } => GeneratorPhase::Suspended,
            GeneratorState::Completed => GeneratorPhase::Completed,
        }
    }
}

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

/// Everything a body can touch while it runs.
pub struct GeneratorContext<'a> {
    pub thread: &'a mut ThreadState,
    pub locals: &'a mut Locals,
    generator: &'a Rc<Generator>,
}

impl GeneratorContext<'_> {
    pub fn generator(&self) -> &Rc<Generator> {
        self.generator
    }

    /// Materialize the running generator's own frame.
    pub fn materialize_frame(&mut self) -> Rc<MaterializedFrame> {
        self.thread.materialize_for_generator(self.generator)
    }
}

/// The code of a generator, driven one slice at a time.
pub trait GeneratorBody {
    fn step(
        &self,
        cx: &mut GeneratorContext<'_>,
        at: Continuation,
        input: ResumeInput,
    ) -> StepResult;
}

impl<F> GeneratorBody for F
where
    F: Fn(&mut GeneratorContext<'_>, Continuation, ResumeInput) -> StepResult,
{
    fn step(
        &self,
        cx: &mut GeneratorContext<'_>,
        at: Continuation,
        input: ResumeInput,
    ) -> StepResult {
        self(cx, at, input)
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

pub struct Generator {
    id: GeneratorId,
    code: Arc<CodeRuntime>,
    body: Box<dyn GeneratorBody>,
    state: RefCell<GeneratorState>,
    /// Owning reference to the heavyweight frame, once one exists.
    frame: RefCell<Option<Rc<MaterializedFrame>>>,
}

impl Generator {
    pub fn new(code: Arc<CodeRuntime>, body: impl GeneratorBody + 'static) -> Rc<Self> {
        Rc::new(Self {
            id: GeneratorId::next(),
            code,
            body: Box::new(body),
            state: RefCell::new(GeneratorState::NotStarted),
            frame: RefCell::new(None),
        })
    }

    /// Build a generator from a closure body.
    pub fn from_fn<F>(code: Arc<CodeRuntime>, body: F) -> Rc<Self>
    where
        F: Fn(&mut GeneratorContext<'_>, Continuation, ResumeInput) -> StepResult + 'static,
    {
        Self::new(code, body)
    }

    pub fn id(&self) -> GeneratorId {
        self.id
    }

    pub fn code(&self) -> &Arc<CodeRuntime> {
        &self.code
    }

    pub fn phase(&self) -> GeneratorPhase {
        self.state.borrow().phase()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == GeneratorPhase::Running
    }

    /// The generator's heavyweight frame, if one has been materialized.
    pub fn frame(&self) -> Option<Rc<MaterializedFrame>> {
        self.frame.borrow().clone()
    }

    pub(crate) fn adopt_frame(&self, frame: Rc<MaterializedFrame>) {
        frame.set_owner(UnlinkPath::GeneratorCompletion);
        *self.frame.borrow_mut() = Some(frame);
    }

    pub fn materialize_frame(&self, thread: &mut ThreadState) -> Rc<MaterializedFrame> {
        thread.materialize_for_generator(self)
    }

    /// Locals captured at the current suspension point.
    pub fn captured_locals(&self) -> Option<Locals> {
        match &*self.state.borrow() {
            GeneratorState::Suspended { locals, .. } => Some(locals.clone()),
            _ => None,
        }
    }

    /// The delegate of a suspended `yield from`, if any.
    pub fn yield_from_value(&self) -> Option<Value> {
        match &*self.state.borrow() {
            GeneratorState::Suspended { yield_from, .. } => yield_from.clone(),
            _ => None,
        }
    }

    /// Visit the references held at the current suspension point.
    pub fn visit_refs(&self, mut visit: impl FnMut(&str, &Value)) {
        if let GeneratorState::Suspended {
            locals, yield_from, ..
        } = &*self.state.borrow()
        {
            for (name, value) in locals {
                visit(name, value);
            }
            if let Some(delegate) = yield_from {
                visit("<yield from>", delegate);
            }
        }
    }

    /// Run the next slice of the generator on `thread`.
    pub fn resume(
        self: &Rc<Self>,
        thread: &mut ThreadState,
        input: ResumeInput,
    ) -> Result<GeneratorOutcome, GeneratorError> {
        let (at, mut locals, shadow) = {
            let mut state = self.state.borrow_mut();
            match std::mem::replace(&mut *state, GeneratorState::Running) {
                GeneratorState::NotStarted => (
                    Continuation::Start,
                    Locals::new(),
                    ShadowFrame::new(ShadowPayload::Generator {
                        generator: Rc::downgrade(self),
                        id: self.id,
                        code: Arc::clone(&self.code),
                    }),
                ),
                GeneratorState::Suspended {
                    shadow,
                    locals,
                    resume_at,
                    ..
                } => (Continuation::YieldPoint(resume_at), locals, shadow),
                GeneratorState::Running => return Err(GeneratorError::AlreadyRunning(self.id)),
                GeneratorState::Completed => {
                    *state = GeneratorState::Completed;
                    return Err(GeneratorError::AlreadyCompleted(self.id));
                }
            }
        };

        let activation = thread.push_generator(shadow);
        if let Some(frame) = self.frame() {
            thread.attach_top(frame);
        }
        tracing::trace!(generator = %self.id, ?at, "resuming generator");

        let result = {
            let mut cx = GeneratorContext {
                thread: &mut *thread,
                locals: &mut locals,
                generator: self,
            };
            self.body.step(&mut cx, at, input)
        };

        let shadow = thread.pop_generator(activation);
        let frame = self.frame();
        match result {
            StepResult::Yield {
                value,
                next,
                yield_from,
            } => {
                if let Some(frame) = &frame {
                    thread.detach_top(frame);
                }
                *self.state.borrow_mut() = GeneratorState::Suspended {
                    shadow,
                    locals,
                    resume_at: next,
                    yield_from,
                };
                Ok(GeneratorOutcome::Yielded(value))
            }
            StepResult::Return(value) => {
                self.complete(thread, frame);
                Ok(GeneratorOutcome::Returned(value))
            }
            StepResult::Raise(error) => {
                self.complete(thread, frame);
                Ok(GeneratorOutcome::Raised(error))
            }
        }
    }

    fn complete(&self, thread: &mut ThreadState, frame: Option<Rc<MaterializedFrame>>) {
        if let Some(frame) = frame {
            thread.unlink_top(&frame, UnlinkPath::GeneratorCompletion);
        }
        self.frame.borrow_mut().take();
        *self.state.borrow_mut() = GeneratorState::Completed;
        tracing::trace!(generator = %self.id, "generator completed");
    }

    /// Tear down the generator, releasing whatever it captured.
    pub fn close(&self) -> Result<(), GeneratorError> {
        let previous = {
            let mut state = self.state.borrow_mut();
            if matches!(*state, GeneratorState::Running) {
                return Err(GeneratorError::AlreadyRunning(self.id));
            }
            std::mem::replace(&mut *state, GeneratorState::Completed)
        };
        if let GeneratorState::Suspended { .. } = previous {
            // A suspended frame is detached from every chain; releasing it
            // here is its unlink.
            if let Some(frame) = self.frame.borrow_mut().take() {
                frame.record_unlink(UnlinkPath::GeneratorCompletion);
            }
        }
        Ok(())
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        if matches!(self.state.get_mut(), GeneratorState::Suspended { .. }) {
            let _ = self.close();
        }
    }
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("id", &self.id)
            .field("code", &self.code.fullname())
            .field("phase", &self.phase())
            .finish()
    }
}
