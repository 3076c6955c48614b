//! Per-thread context (C4, §3, §9).
//!
//! §9's design notes replace the original arrangement (a reserved slot in host-controlled
//! thread-local storage) with an explicit "thread context" argument threaded through every entry
//! point. `ThreadContext` is that argument: it owns the freelists for handles (and, once an op
//! completes or is torn down, nothing else needs per-thread pooling — op records and algorithm
//! scratch data are owned by the engine's active list while linked, per the Design Notes' switch
//! away from intrusive per-thread freelists of those types).

use std::sync::Arc;

use crate::handle::{Handle, HandleCell};

/// Per-calling-thread state: today, just the handle freelist and the "current implicit op" slot
/// used by algorithms that themselves issue implicit-sync non-blocking transfers (an `nbi_*`
/// region bound to whichever op is driving it).
pub struct ThreadContext {
    handle_freelist: Vec<Arc<HandleCell>>,
    current_implicit_op: Option<u64>,
}

impl ThreadContext {
    pub fn new() -> ThreadContext {
        ThreadContext {
            handle_freelist: Vec::new(),
            current_implicit_op: None,
        }
    }

    /// Allocate a handle, reusing a freed cell if one is available (freelists grow on demand and
    /// are never returned to the OS before process teardown, §5).
    pub fn alloc_handle(&mut self) -> Handle {
        match self.handle_freelist.pop() {
            Some(cell) => Handle::from_cell(cell),
            None => Handle::new(),
        }
    }

    /// Return a handle's cell to the freelist once its completion has been observed.
    pub(crate) fn release_handle(&mut self, h: Handle) {
        self.handle_freelist.push(h.cell);
    }

    pub fn current_implicit_op(&self) -> Option<u64> {
        self.current_implicit_op
    }

    pub fn set_current_implicit_op(&mut self, id: Option<u64>) {
        self.current_implicit_op = id;
    }
}

impl Default for ThreadContext {
    fn default() -> Self {
        ThreadContext::new()
    }
}
