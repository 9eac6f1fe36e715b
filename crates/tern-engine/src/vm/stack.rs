//! Call stack and frame management
//!
//! Frames record the executing function and the code it entered with. The
//! reload engine walks frames to pin unoptimized code before a reload and to
//! schedule deoptimization of optimized activations afterwards.

use crate::vm::heap::{Heap, ObjRef};

/// One function activation
#[derive(Debug, Clone)]
pub struct Frame {
    /// The executing function
    pub function: ObjRef,
    /// The code this activation entered with; `None` when running the
    /// lazy-compile stub
    pub code: Option<ObjRef>,
    /// Deoptimization is scheduled: the activation finishes in the
    /// function's unoptimized code when it next resumes
    pub pending_deopt: bool,
}

impl Frame {
    /// Create a frame for `function` executing `code`
    pub fn new(function: ObjRef, code: Option<ObjRef>) -> Self {
        Self {
            function,
            code,
            pending_deopt: false,
        }
    }

    /// Whether this activation is running optimized code
    pub fn is_optimized(&self, heap: &Heap) -> bool {
        self.code.is_some_and(|code| heap.code(code).is_optimized)
    }

    /// The code this activation resumes in: the unoptimized code once
    /// deoptimization is pending, the entry code otherwise
    pub fn resume_code(&self, heap: &Heap) -> Option<ObjRef> {
        if self.pending_deopt {
            heap.function(self.function).unoptimized_code
        } else {
            self.code
        }
    }
}

/// The call stack
#[derive(Debug, Default)]
pub struct Stack {
    frames: Vec<Frame>,
}

impl Stack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Push a frame
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Pop the top frame
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Number of frames
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Iterate frames, innermost last
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    /// Mutably iterate frames
    pub fn frames_mut(&mut self) -> impl Iterator<Item = &mut Frame> {
        self.frames.iter_mut()
    }

    /// The innermost frame, if any
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Schedule deoptimization of every optimized activation. Deoptimization
    /// is lazy: the optimized code stays on the stack until the activation
    /// resumes, which is why its IC reset must go through the unoptimized
    /// code referenced from the optimized code's object pool.
    pub fn deoptimize_optimized_frames(&mut self, heap: &mut Heap) {
        for frame in &mut self.frames {
            let optimized = frame
                .code
                .is_some_and(|code| heap.code(code).is_optimized);
            if optimized && !frame.pending_deopt {
                frame.pending_deopt = true;
                heap.function_mut(frame.function).deoptimization_counter += 1;
            }
        }
    }

    /// Visit every frame's heap references
    pub fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut ObjRef)) {
        for frame in &mut self.frames {
            visitor(&mut frame.function);
            if let Some(code) = frame.code.as_mut() {
                visitor(code);
            }
        }
    }
}
