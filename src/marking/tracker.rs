use std::sync::Arc;

use tracing::{debug, trace};

use super::MarkingEngine;
use crate::types::Mark;
use crate::wire::MethodId;

/// Mark stack of one tree traversal.
///
/// Every [`on_node`](Self::on_node) pushes exactly one entry and every
/// [`on_backout`](Self::on_backout) pops one. A method without a mark of its own
/// inherits the mark in effect around it.
///
/// Resets are deferred: [`on_reset`](Self::on_reset), or a generation change seen
/// while marking, only takes effect at the next transaction boundary.
#[derive(Debug)]
pub struct MarkTracker {
    engine: Arc<MarkingEngine>,
    stack: Vec<Mark>,
    generation: u64,
    reset_pending: bool,
}

impl MarkTracker {
    pub fn new(engine: Arc<MarkingEngine>) -> Self {
        let generation = engine.generation();
        Self { engine, stack: Vec::new(), generation, reset_pending: false }
    }

    pub fn on_start(&mut self) {
        self.stack.clear();
        self.generation = self.engine.generation();
        self.reset_pending = false;
    }

    /// Enters a node and returns the mark in effect inside it.
    pub fn on_node(&mut self, method_id: MethodId) -> Mark {
        let (own, generation) = self.engine.mark_method_tagged(method_id);
        if generation != self.generation {
            trace!("Mark generation moved from {} to {}", self.generation, generation);
            self.reset_pending = true;
        }
        let effective = if own.is_default() { self.current_mark() } else { own };
        self.stack.push(effective);
        effective
    }

    /// Leaves the current node. Popping an empty stack is ignored.
    pub fn on_backout(&mut self) -> Mark {
        match self.stack.pop() {
            Some(mark) => mark,
            None => {
                debug!("Unbalanced backout ignored");
                Mark::DEFAULT
            }
        }
    }

    pub fn on_stop(&mut self) {
        if !self.stack.is_empty() {
            debug!("Traversal stopped with {} open nodes", self.stack.len());
        }
        self.stack.clear();
    }

    /// Requests a reset at the next transaction boundary.
    pub fn on_reset(&mut self) {
        self.reset_pending = true;
    }

    pub fn begin_transaction(&mut self) {
        self.apply_pending_reset();
    }

    pub fn end_transaction(&mut self) {
        self.apply_pending_reset();
    }

    fn apply_pending_reset(&mut self) {
        let current = self.engine.generation();
        if self.reset_pending || current != self.generation {
            trace!("Resetting mark stack (generation {})", current);
            self.stack.clear();
            self.generation = current;
            self.reset_pending = false;
        }
    }

    /// Mark on top of the stack, [`Mark::DEFAULT`] when empty.
    pub fn current_mark(&self) -> Mark {
        self.stack.last().copied().unwrap_or(Mark::DEFAULT)
    }

    /// Mark just below the top, [`Mark::DEFAULT`] when there is none.
    pub fn parent_mark(&self) -> Mark {
        self.stack.len().checked_sub(2).map_or(Mark::DEFAULT, |i| self.stack[i])
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_reset_pending(&self) -> bool {
        self.reset_pending
    }
}
