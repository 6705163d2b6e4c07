//! Lazy construction of heavyweight frames from shadow frames.
//!
//! The heavyweight chain only ever contains frames for a subset of the live
//! activations, but that subset always appears in shadow-stack order. Every
//! operation here preserves that: a new frame is spliced in directly behind
//! the nearest materialized frame on the inner side (or at the head of the
//! chain when there is none).
//!
//! Ownership of a freshly built frame goes to the generator controller for
//! generator activations and to the unlink trampoline for everything else.
//! The deoptimization path takes it over from the trampoline.

use std::rc::Rc;
use std::sync::Arc;

use crate::fatal::{fatal, StackDump, StackViolation};
use crate::frame::{FrameChain, MaterializedFrame, UnlinkPath};
use crate::generator::Generator;
use crate::stack::{Activation, ShadowPayload, ThreadState};
use crate::trampoline;

impl ThreadState {
    /// Materialize the activation at `index` (0 is outermost).
    ///
    /// Idempotent: an activation that already has a frame returns it. A new
    /// frame is spliced in directly behind the nearest materialized
    /// activation on the inner side, or at the head of the chain when there
    /// is none. The frames of the inner activations must form the head of
    /// the chain in shadow order, otherwise the stacks have diverged.
    pub fn materialize_frame(&mut self, index: usize) -> Rc<MaterializedFrame> {
        if let Some(frame) = self.stack.get(index).and_then(Activation::materialized) {
            return frame;
        }
        let prev = self.nearest_inner_frame(index);
        self.splice_frame(prev.as_ref(), index)
    }

    fn nearest_inner_frame(&self, index: usize) -> Option<Rc<MaterializedFrame>> {
        let depth = self.depth();
        let mut cursor = self.current_frame.clone();
        let mut prev = None;
        for inner in (index.saturating_add(1)..depth).rev() {
            let Some(frame) = self.stack.get(inner).and_then(Activation::materialized) else {
                continue;
            };
            if !cursor.as_ref().is_some_and(|c| Rc::ptr_eq(c, &frame)) {
                fatal(
                    StackViolation::ChainMismatch {
                        depth: depth - 1 - inner,
                    },
                    Some(&self.dump()),
                );
            }
            cursor = frame.back();
            prev = Some(frame);
        }
        prev
    }

    /// Build the frame of `index` and link it behind `prev`, which the caller
    /// has already verified to be the nearest inner frame.
    fn splice_frame(
        &mut self,
        prev: Option<&Rc<MaterializedFrame>>,
        index: usize,
    ) -> Rc<MaterializedFrame> {
        let Some(activation) = self.stack.get(index) else {
            fatal(
                StackViolation::UnbalancedStack {
                    expected: format!("an activation at index {index}"),
                    found: format!("a stack of depth {}", self.depth()),
                },
                Some(&self.dump()),
            );
        };
        if let Some(frame) = activation.materialized() {
            return frame;
        }
        if activation.shadow().has_materialized() {
            // Flagged, but the frame is gone.
            fatal(
                StackViolation::ChainMismatch {
                    depth: self.depth() - 1 - index,
                },
                Some(&self.dump()),
            );
        }

        let payload = activation.shadow().payload().clone();
        let frame = MaterializedFrame::new(
            Arc::clone(payload.code()),
            activation.id(),
            payload.generator_id(),
        );
        match prev {
            Some(prev) => {
                frame.set_back(prev.take_back());
                prev.set_back(Some(Rc::clone(&frame)));
            }
            None => self.link_frame(Rc::clone(&frame)),
        }

        let Some(activation) = self.stack.get_mut(index) else {
            fatal(StackViolation::OrphanFrame, None);
        };
        activation.bind_frame(&frame);
        match payload {
            ShadowPayload::Generator { generator, id, .. } => match generator.upgrade() {
                Some(generator) => generator.adopt_frame(Rc::clone(&frame)),
                None => fatal(StackViolation::GeneratorGone(id), None),
            },
            ShadowPayload::Compiled(_) => trampoline::install(activation, &frame),
            ShadowPayload::Interpreted(_) => frame.set_owner(UnlinkPath::Interpreter),
        }
        tracing::trace!(frame = %frame.id(), code = %frame.code().fullname(), "materialized frame");
        frame
    }

    /// Materialize every live activation and return the head of the chain.
    ///
    /// Walks innermost-first. Activations that already have a frame are
    /// matched against the existing chain instead of being rebuilt; the walk
    /// must consume that chain exactly, otherwise the stacks have diverged.
    pub fn materialize_full_stack(&mut self) -> Option<Rc<MaterializedFrame>> {
        let depth = self.depth();
        let mut prev: Option<Rc<MaterializedFrame>> = None;
        let mut cursor = self.current_frame.clone();

        for index in (0..depth).rev() {
            let existing = self.stack.get(index).and_then(|a| a.materialized());
            match existing {
                Some(frame) => {
                    let in_step = cursor.as_ref().is_some_and(|c| Rc::ptr_eq(c, &frame));
                    if !in_step {
                        fatal(
                            StackViolation::ChainMismatch {
                                depth: depth - 1 - index,
                            },
                            Some(&self.dump()),
                        );
                    }
                    cursor = frame.back();
                    prev = Some(frame);
                }
                None => {
                    prev = Some(self.splice_frame(prev.as_ref(), index));
                }
            }
        }

        if let Some(rest) = cursor {
            let mut dangling = StackDump::new();
            for frame in FrameChain::new(Some(rest)) {
                dangling.push(Some(frame.id()), frame.code().fullname());
            }
            fatal(
                StackViolation::DanglingFrames {
                    dangling: dangling.clone(),
                },
                Some(&dangling),
            );
        }
        self.current_frame.clone()
    }

    /// Materialize the frame of a running generator.
    ///
    /// The generator's activation is found by identity, wherever it sits on
    /// the stack.
    pub fn materialize_for_generator(&mut self, generator: &Generator) -> Rc<MaterializedFrame> {
        if !generator.is_running() {
            fatal(StackViolation::GeneratorNotRunning(generator.id()), None);
        }
        if let Some(frame) = generator.frame() {
            return frame;
        }

        let found = self
            .stack
            .iter()
            .find(|a| a.shadow().payload().generator_id() == Some(generator.id()))
            .map(Activation::id);
        if let Some(index) = found.and_then(|id| self.stack.position(id)) {
            return self.materialize_frame(index);
        }
        fatal(
            StackViolation::GeneratorFrameMissing(generator.id()),
            Some(&self.dump()),
        )
    }

    /// Prepare the innermost activation for deoptimization.
    ///
    /// Materializes it, takes its return slot back from the unlink trampoline
    /// and hands the frame to the deoptimization path. The activation carries
    /// on as interpreted code and its frame is unlinked when it returns.
    pub fn materialize_for_deopt(&mut self) -> Rc<MaterializedFrame> {
        let Some(index) = self.depth().checked_sub(1) else {
            fatal(
                StackViolation::UnbalancedStack {
                    expected: "an activation to deoptimize".into(),
                    found: "an empty stack".into(),
                },
                None,
            );
        };
        let frame = self.materialize_frame(index);

        let Some(activation) = self.stack.get_mut(index) else {
            fatal(StackViolation::OrphanFrame, None);
        };
        if let ShadowPayload::Compiled(code) = activation.shadow().payload().clone() {
            trampoline::uninstall(activation, &frame);
            frame.set_owner(UnlinkPath::Deopt);
            activation
                .shadow_mut()
                .set_payload(ShadowPayload::Interpreted(code));
            tracing::debug!(frame = %frame.id(), code = %frame.code().fullname(), "deoptimized activation");
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeRuntime;
    use crate::stack::ActivationId;
    use crate::trampoline::ReturnAddress;

    fn enter(thread: &mut ThreadState, name: &str, ret: u64) {
        thread.enter_compiled(CodeRuntime::new("t", name), ReturnAddress::new(ret));
    }

    #[test]
    fn materialize_frame_is_idempotent() {
        let mut thread = ThreadState::new();
        enter(&mut thread, "f", 1);
        let a = thread.materialize_frame(0);
        let b = thread.materialize_frame(0);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(thread.frame_chain().count(), 1);
    }

    #[test]
    fn new_frame_is_spliced_behind_nearest_inner_frame() {
        let mut thread = ThreadState::new();
        enter(&mut thread, "outer", 1);
        enter(&mut thread, "middle", 2);
        enter(&mut thread, "inner", 3);

        // Build the outermost and innermost frames first, leaving a gap.
        thread.materialize_frame(0);
        let inner = thread.materialize_frame(2);
        let middle = thread.materialize_frame(1);

        let names: Vec<String> = thread
            .frame_chain()
            .map(|f| f.code().qualname().to_string())
            .collect();
        assert_eq!(names, vec!["inner", "middle", "outer"]);
        assert!(Rc::ptr_eq(&inner.back().unwrap(), &middle));
    }

    #[test]
    fn outer_frame_built_after_inner_keeps_shadow_order() {
        let mut thread = ThreadState::new();
        enter(&mut thread, "outer", 1);
        enter(&mut thread, "inner", 2);
        let inner = thread.materialize_frame(1);
        let outer = thread.materialize_frame(0);

        let names: Vec<String> = thread
            .frame_chain()
            .map(|f| f.code().qualname().to_string())
            .collect();
        assert_eq!(names, vec!["inner", "outer"]);
        assert!(Rc::ptr_eq(&inner.back().unwrap(), &outer));
        assert!(Rc::ptr_eq(&thread.current_frame().unwrap(), &inner));
    }

    #[test]
    #[should_panic(expected = "diverges")]
    fn splicing_into_a_diverged_chain_is_fatal() {
        let mut thread = ThreadState::new();
        enter(&mut thread, "outer", 1);
        enter(&mut thread, "inner", 2);
        thread.materialize_frame(1);
        // A frame with no activation now sits in front of the inner frame.
        let stray = MaterializedFrame::new(CodeRuntime::new("t", "stray"), ActivationId::next(), None);
        thread.link_frame(stray);
        thread.materialize_frame(0);
    }

    #[test]
    fn installs_trampoline_on_compiled_activation() {
        let mut thread = ThreadState::new();
        enter(&mut thread, "f", 0x42);
        let frame = thread.materialize_frame(0);
        assert_eq!(frame.owner(), Some(UnlinkPath::Trampoline));
        assert!(thread.stack().top().unwrap().return_slot().is_trampoline());
        assert_eq!(thread.leave(), ReturnAddress::new(0x42));
        assert_eq!(frame.unlinked_by(), Some(UnlinkPath::Trampoline));
    }

    #[test]
    #[should_panic(expected = "didn't consume entire heavyweight frame chain")]
    fn dangling_frames_are_fatal() {
        let mut thread = ThreadState::new();
        let stray = MaterializedFrame::new(CodeRuntime::new("t", "stray"), ActivationId::next(), None);
        thread.link_frame(stray);
        enter(&mut thread, "f", 1);
        thread.materialize_full_stack();
    }

    #[test]
    fn deopt_restores_return_slot() {
        let mut thread = ThreadState::new();
        enter(&mut thread, "f", 0x99);
        thread.materialize_full_stack();
        let frame = thread.materialize_for_deopt();
        let top = thread.stack().top().unwrap();
        assert_eq!(top.return_slot(), ReturnAddress::new(0x99));
        assert_eq!(frame.owner(), Some(UnlinkPath::Deopt));
        assert_eq!(thread.leave(), ReturnAddress::new(0x99));
        assert_eq!(frame.unlinked_by(), Some(UnlinkPath::Deopt));
        assert_eq!(frame.unlink_count(), 1);
    }
}
