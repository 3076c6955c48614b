//! Algorithm library (C7, §4.7): one poll-function state machine per collective × strategy pair.
//!
//! Every state machine shares the canonical shape described in §4.7: an optional IN-barrier
//! guard, a transfer-issuing step, one or more await-completion steps, an optional OUT-barrier
//! guard, and a cleanup step that frees algorithm resources and reports `COMPLETE | INACTIVE`.
//! [`check_in_barrier`]/[`check_out_barrier`]/[`cleanup`] factor out the guard/cleanup steps so
//! each collective module only has to write its transfer logic.

pub mod broadcast;
pub mod gather;
pub mod scatter;

use bitflags::bitflags;

use crate::engine::Engine;
use crate::op::{Algorithm, OpRecord, State, Target};

bitflags! {
    /// What a poll function accomplished this tick (§4.5).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PollResult: u8 {
        /// The op's work is done; its handle (or aggregate membership) should be signaled.
        const COMPLETE = 1 << 0;
        /// The op should be unlinked from the active list.
        const INACTIVE = 1 << 1;
    }
}

/// Dispatch one poll tick to the algorithm family selected for `op` at submit time.
pub fn poll_op(op: &mut OpRecord, engine: &Engine) -> PollResult {
    match op.algorithm {
        Algorithm::BcastGet
        | Algorithm::BcastPut
        | Algorithm::BcastEager
        | Algorithm::BcastRvGet
        | Algorithm::BcastTreePut(_)
        | Algorithm::BcastTreeGet(_)
        | Algorithm::BcastTreeEager(_) => broadcast::poll(op, engine),
        Algorithm::ScatterGet | Algorithm::ScatterPut | Algorithm::ScatterEager | Algorithm::ScatterRvGet => {
            scatter::poll(op, engine)
        }
        Algorithm::GatherGet | Algorithm::GatherPut | Algorithm::GatherEager | Algorithm::GatherRvPut => {
            gather::poll(op, engine)
        }
    }
}

/// Guard state 0: try the IN consensus token if this op needs one. Advances to
/// `InitiateTransfer` and returns `true` once the guard passes (or didn't apply).
pub(crate) fn check_in_barrier(op: &mut OpRecord, engine: &Engine) -> bool {
    if op.generic.needs_in_barrier {
        let token = op.generic.in_token.expect("needs_in_barrier implies a token was allocated");
        if !engine.consensus().try_token(token) {
            return false;
        }
    }
    op.advance(State::InitiateTransfer);
    true
}

/// Guard state k+1: try the OUT consensus token if this op needs one. Advances to `Cleanup` and
/// returns `true` once the guard passes (or didn't apply).
pub(crate) fn check_out_barrier(op: &mut OpRecord, engine: &Engine) -> bool {
    if op.generic.needs_out_barrier {
        let token = op.generic.out_token.expect("needs_out_barrier implies a token was allocated");
        if !engine.consensus().try_token(token) {
            return false;
        }
    }
    op.advance(State::Cleanup);
    true
}

/// Final state: free the P2P record and tree-geometry reference (if any) this op was holding,
/// then report completion.
pub(crate) fn cleanup(op: &mut OpRecord, engine: &Engine) -> PollResult {
    if op.generic.p2p.take().is_some() {
        engine.p2p().free(op.team_id, op.sequence);
    }
    if let Some(tree) = op.generic.tree.take() {
        engine.tree_cache().tree_free(&tree.geometry);
    }
    op.generic.in_token = None;
    op.generic.out_token = None;
    op.advance(State::Done);
    PollResult::COMPLETE | PollResult::INACTIVE
}

/// Write `bytes` into every address named by `target` (the caller's buffer, or — for the "M"
/// per-image variants — every local image's buffer), via the transport's own-segment accessors.
pub(crate) fn write_target(engine: &Engine, target: &Target, bytes: &[u8]) {
    match target {
        Target::Single(addr) => engine.transport().local_write(addr.0, bytes),
        Target::PerImage(addrs) => {
            for addr in addrs {
                engine.transport().local_write(addr.0, bytes);
            }
        }
    }
}

/// Read `len` bytes out of the single address named by `target`. Only meaningful for
/// non-`PerImage` targets (a gather's root destination, a broadcast's single source).
pub(crate) fn read_single(engine: &Engine, target: &Target, len: usize) -> Vec<u8> {
    match target {
        Target::Single(addr) => engine.transport().local_read(addr.0, len),
        Target::PerImage(_) => unreachable!("read_single called on a per-image target"),
    }
}
