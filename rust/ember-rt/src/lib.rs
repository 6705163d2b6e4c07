//! The call-stack half of the Ember JIT runtime.
//!
//! Compiled code runs on cheap shadow frames. Heavyweight, introspectable
//! frames are built from them only on demand, kept in the same order as the
//! shadow stack, and unlinked exactly once by whichever party owns them:
//! the unlink trampoline, the generator controller or the deoptimization
//! path.

pub mod code;
pub mod fatal;
pub mod frame;
pub mod generator;
pub mod materialize;
pub mod stack;
pub mod trampoline;

pub use code::{CodeId, CodeRuntime};
pub use fatal::{fatal, StackDump, StackViolation};
pub use frame::{FrameChain, FrameId, MaterializedFrame, UnlinkPath};
pub use generator::{
    Continuation, Generator, GeneratorBody, GeneratorContext, GeneratorError, GeneratorId,
    GeneratorOutcome, GeneratorPhase, Locals, ResumeInput, StepResult,
};
pub use stack::{
    Activation, ActivationId, ExecutionStack, PayloadKind, ShadowFrame, ShadowPayload, ThreadState,
};
pub use trampoline::{insert_unlink_trampoline, remove_unlink_trampoline, ReturnAddress};
