//! Aggregation queue (C6, §4.6).
//!
//! §9's design notes model this as an owning "aggregate" object holding a vector of member op ids
//! and a remaining-members counter, rather than the original doubly-linked ring with a head
//! pointer.

use crate::handle::Handle;

/// A container surfaced to the caller once the final (non-`AGGREGATE`) member of a batch is
/// submitted. Its handle completes only when every member has reported `COMPLETE` (§4.6).
pub struct Aggregate {
    pub members: Vec<u64>,
    pub remaining: usize,
    pub handle: Handle,
}

impl Aggregate {
    pub fn new(members: Vec<u64>, handle: Handle) -> Aggregate {
        let remaining = members.len();
        Aggregate { members, remaining, handle }
    }

    /// Record one member's completion. Returns `true` once every member has completed, at which
    /// point the container's own handle should be signaled.
    pub fn member_completed(&mut self) -> bool {
        debug_assert!(self.remaining > 0, "aggregate over-completed");
        self.remaining -= 1;
        self.remaining == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ThreadContext;

    #[test]
    fn completes_only_once_every_member_reports() {
        let mut ctx = ThreadContext::new();
        let h = ctx.alloc_handle();
        let mut agg = Aggregate::new(vec![1, 2, 3, 4], h);
        assert!(!agg.member_completed());
        assert!(!agg.member_completed());
        assert!(!agg.member_completed());
        assert!(agg.member_completed());
    }
}
