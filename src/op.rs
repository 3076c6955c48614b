//! The collective op record and its algorithm-specific payload (§3).

use std::sync::Arc;

use crate::consensus::ConsensusToken;
use crate::flags::CollFlags;
use crate::handle::Handle;
use crate::p2p::P2pRecord;
use crate::transport::CompletionToken;
use crate::tree::{TreeGeometry, TreeKind};

/// A one-sided address: an offset into a node's registered segment. For `SINGLE` collectives the
/// same numeric value is valid on every participant (§6); for `LOCAL` collectives it is only ever
/// meaningful on the process that owns it, and is exchanged through the P2P rendezvous table
/// before any remote algorithm step dereferences it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Addr(pub usize);

/// A destination (or, for gather, source) argument: either one buffer shared by every
/// participant, or one buffer per local image (the "M" entry-point variants, §4.7).
#[derive(Clone, Debug)]
pub enum Target {
    Single(Addr),
    PerImage(Vec<Addr>),
}

impl Target {
    pub fn is_multi(&self) -> bool {
        matches!(self, Target::PerImage(_))
    }
}

/// Algorithm-specific tagged argument union (§3, §9's "tagged union of algorithm arguments").
/// `GatherAll`/`Exchange` have no variant of their own: per §4.7 they are dispatched as N
/// concurrent [`CollArgs::Gather`] ops, one rooted at each rank, surfaced as a single aggregate
/// handle (see [`crate::dispatch::gather_all_nb`]/[`crate::dispatch::exchange_nb`]).
pub enum CollArgs {
    Broadcast {
        root: u32,
        dst: Target,
        src: Addr,
        nbytes: usize,
    },
    Scatter {
        root: u32,
        dst: Target,
        src: Addr,
        nbytes_per_image: usize,
    },
    Gather {
        root: u32,
        dst: Addr,
        src: Target,
        nbytes_per_image: usize,
    },
}

/// The selected algorithm family/strategy for an op, chosen once at dispatch time (§4.7's
/// selection rules) and never revisited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    BcastGet,
    BcastPut,
    BcastEager,
    BcastRvGet,
    BcastTreePut(TreeKind),
    BcastTreeGet(TreeKind),
    BcastTreeEager(TreeKind),
    ScatterGet,
    ScatterPut,
    ScatterEager,
    ScatterRvGet,
    GatherGet,
    GatherPut,
    GatherEager,
    GatherRvPut,
}

/// Named states, matching §9's design-notes guidance ("each state named … rather than a raw
/// integer"). I5 requires the integer (here, the derived `Ord`) to only ever advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    AwaitInBarrier,
    InitiateTransfer,
    AwaitTransfer,
    AwaitOutBarrier,
    Cleanup,
    Done,
}

/// Tree-specific scratch data attached to tree-based algorithm variants.
pub struct TreeData {
    pub geometry: Arc<TreeGeometry>,
    pub segment_size: usize,
    pub bytes_sent: usize,
}

/// Generic algorithm data shared by every state machine in [`crate::algo`] (§3).
pub struct GenericAlgoData {
    pub flags: CollFlags,
    pub needs_in_barrier: bool,
    pub needs_out_barrier: bool,
    pub needs_p2p: bool,
    pub in_token: Option<ConsensusToken>,
    pub out_token: Option<ConsensusToken>,
    pub p2p: Option<Arc<P2pRecord>>,
    pub pending_transfer: Option<CompletionToken>,
    /// Multiple outstanding transfers (a root fanning out to every other participant, or a tree
    /// node pushing to several children at once) land here instead of `pending_transfer`.
    pub pending_tokens: Vec<CompletionToken>,
    /// `(token, source_node, staging_buffer)` triples for GatherGet, which issues one `get` per
    /// remote node and needs to remember which buffer each token's payload lands in.
    pub pending_gathers: Vec<(CompletionToken, u32, Vec<u8>)>,
    pub tree: Option<TreeData>,
    pub args: CollArgs,
    /// Staging buffer for in-flight transfers (a remote `get` lands here before being copied into
    /// the caller's destination address; a tree hop's incoming payload lands here before being
    /// forwarded to children). `None` when the algorithm doesn't need staging this tick.
    pub scratch: Option<Vec<u8>>,
    /// Index of the next child to forward to, for tree algorithms that fan out one child at a
    /// time across polls rather than all at once.
    pub tree_child_cursor: usize,
}

impl GenericAlgoData {
    pub fn new(flags: CollFlags, args: CollArgs) -> GenericAlgoData {
        GenericAlgoData {
            needs_in_barrier: flags.needs_in_barrier(),
            needs_out_barrier: flags.needs_out_barrier(),
            needs_p2p: false,
            flags,
            in_token: None,
            out_token: None,
            p2p: None,
            pending_transfer: None,
            pending_tokens: Vec::new(),
            pending_gathers: Vec::new(),
            tree: None,
            args,
            scratch: None,
            tree_child_cursor: 0,
        }
    }
}

/// An in-flight (or about-to-be-linked) collective op.
pub struct OpRecord {
    /// Process-local identity, distinct from `(team_id, sequence)`; used to key the aggregation
    /// queue's membership and the active list's bookkeeping.
    pub id: u64,
    pub team_id: u32,
    pub sequence: u32,
    pub algorithm: Algorithm,
    pub state: State,
    /// `None` while the op is an aggregate member with no handle of its own (§4.6).
    pub handle: Option<Handle>,
    pub aggregate_id: Option<u64>,
    pub generic: GenericAlgoData,
}

impl OpRecord {
    /// Advance to `new_state`, enforcing I5 (state only ever moves forward).
    pub fn advance(&mut self, new_state: State) {
        debug_assert!(
            new_state >= self.state,
            "op state regressed from {:?} to {:?}",
            self.state,
            new_state
        );
        self.state = new_state;
    }
}
