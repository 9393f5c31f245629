//! Call stacks driven by call/return notifications
//!
//! The session pops one frame per return event; the handler decides what
//! (if anything) a call pushes. [`CallStack`] is the stack the dependency
//! tracer uses: every call pushes, but only frames belonging to trace
//! targets carry a context, so the nearest traced caller is always the last
//! stored context.

use crate::error::UnbalancedStackError;
use std::collections::BTreeMap;

/// Stack the session can pop on call-returned events
pub trait FrameStack {
    fn depth(&self) -> usize;

    /// Remove the innermost frame
    fn pop_frame(&mut self) -> Result<(), UnbalancedStackError>;
}

impl<T> FrameStack for Vec<T> {
    fn depth(&self) -> usize {
        self.len()
    }

    fn pop_frame(&mut self) -> Result<(), UnbalancedStackError> {
        self.pop().map(|_| ()).ok_or(UnbalancedStackError)
    }
}

/// Stack size counter with sparse context frames and ignored subtrees
#[derive(Debug, Clone)]
pub struct CallStack<C> {
    stack_size: usize,
    /// Depth of the frame that started the current ignored subtree
    ignored_stack_size: Option<usize>,
    /// Context frames keyed by the depth they were pushed at
    context_stack: BTreeMap<usize, C>,
}

impl<C> Default for CallStack<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CallStack<C> {
    pub fn new() -> Self {
        Self {
            stack_size: 0,
            ignored_stack_size: None,
            context_stack: BTreeMap::new(),
        }
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn is_context_empty(&self) -> bool {
        self.context_stack.is_empty()
    }

    /// Stored contexts, outermost first
    pub fn context_stack(&self) -> impl Iterator<Item = &C> {
        self.context_stack.values()
    }

    /// Innermost stored context
    pub fn top_context(&self) -> Option<&C> {
        self.context_stack.values().next_back()
    }

    /// Push a frame, optionally carrying a context
    pub fn push(&mut self, context: Option<C>) {
        self.stack_size += 1;
        if let Some(context) = context {
            self.context_stack.insert(self.stack_size, context);
        }
    }

    /// Push a frame that starts an ignored subtree
    ///
    /// Nested ignored pushes keep the outermost marker.
    pub fn push_ignored(&mut self) {
        self.stack_size += 1;
        self.ignored_stack_size.get_or_insert(self.stack_size);
    }

    /// True while inside an ignored subtree
    pub fn is_ignored(&self) -> bool {
        self.ignored_stack_size.is_some()
    }

    pub fn pop(&mut self) -> Result<(), UnbalancedStackError> {
        if self.stack_size == 0 {
            return Err(UnbalancedStackError);
        }

        self.context_stack.remove(&self.stack_size);
        if self.ignored_stack_size == Some(self.stack_size) {
            self.ignored_stack_size = None;
        }
        self.stack_size -= 1;
        Ok(())
    }
}

impl<C> FrameStack for CallStack<C> {
    fn depth(&self) -> usize {
        self.stack_size
    }

    fn pop_frame(&mut self) -> Result<(), UnbalancedStackError> {
        self.pop()
    }
}
