//! Public entry points and the algorithm-selection/submission pipeline (C8, §4.7.4/§4.8).

use crate::aggregate::Aggregate;
use crate::consensus::ConsensusToken;
use crate::engine::Engine;
use crate::error::{fatal, FatalError};
use crate::flags::CollFlags;
use crate::handle::{wait_sync, Handle};
use crate::op::{Addr, Algorithm, CollArgs, GenericAlgoData, OpRecord, State, Target};
use crate::pool::ThreadContext;
use crate::tree::TreeKind;

/// Messages at or under this many bytes use the Eager strategy when the selection rules permit it
/// (§4.7.4 references `EAGER_MIN`; this is the same constant [`crate::p2p::EAGER_MIN`] names).
pub use crate::p2p::EAGER_MIN;

/// Node counts at or above this switch a `SINGLE` broadcast from the flat Put/Get strategies to a
/// binomial tree. Not part of §4.7.4's selection-rule table (which only distinguishes
/// Get/Put/Eager/RVGet); trees are an internal fan-out optimization the dispatcher applies for
/// large jobs rather than a caller-visible choice, since §6 exposes no algorithm-hint parameter.
const TREE_BROADCAST_THRESHOLD: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    Eager,
    Rendezvous,
    Put,
    Get,
}

/// §4.7.4's four selection rules, stripped of which collective they apply to (the caller maps the
/// resulting [`Strategy`] onto its own `Get`/`Put`/`RvGet`/`RvPut` variants).
fn choose_strategy(
    src_in_seg: bool,
    dst_in_seg: bool,
    my_sync_or_local: bool,
    out_mysync: bool,
    size: usize,
) -> Strategy {
    match (src_in_seg, dst_in_seg) {
        (true, true) => {
            if size <= EAGER_MIN && my_sync_or_local {
                Strategy::Eager
            } else if my_sync_or_local {
                Strategy::Rendezvous
            } else if out_mysync && size <= EAGER_MIN {
                Strategy::Eager
            } else {
                Strategy::Put
            }
        }
        (false, true) => Strategy::Put,
        (true, false) => Strategy::Get,
        (false, false) => {
            if size <= EAGER_MIN {
                Strategy::Eager
            } else {
                fatal(FatalError::NoApplicableAlgorithm)
            }
        }
    }
}

fn my_sync_or_local(flags: CollFlags) -> bool {
    flags.contains(CollFlags::IN_MYSYNC) || flags.contains(CollFlags::OUT_MYSYNC) || !flags.is_single()
}

/// §4.7.4's in-segment detection: a missing hint on a `SINGLE` buffer that actually falls within
/// the given node's registered segment is silently added.
fn detect_in_segment(engine: &Engine, already_hinted: bool, is_single: bool, addr: usize, len: usize, node: u32) -> bool {
    if already_hinted {
        return true;
    }
    if !is_single {
        return false;
    }
    let (base, seg_len) = engine.transport().segment_of(node);
    addr >= base && addr + len <= base + seg_len
}

fn bounds_check(engine: &Engine, in_segment: bool, addr: usize, len: usize, node: u32) {
    if !in_segment {
        return;
    }
    let (base, seg_len) = engine.transport().segment_of(node);
    if addr < base || addr + len > base + seg_len {
        fatal(FatalError::SegmentBounds(format!(
            "address {addr} len {len} outside node {node}'s segment [{base}, {})",
            base + seg_len
        )));
    }
}

fn alloc_tokens(engine: &Engine, flags: CollFlags) -> (Option<ConsensusToken>, Option<ConsensusToken>) {
    let in_tok = flags.needs_in_barrier().then(|| engine.consensus().create());
    let out_tok = flags.needs_out_barrier().then(|| engine.consensus().create());
    (in_tok, out_tok)
}

fn select_broadcast_algorithm(
    engine: &Engine,
    flags: CollFlags,
    src_in_seg: bool,
    dst_in_seg: bool,
    dst_is_single: bool,
    nbytes: usize,
) -> Algorithm {
    if flags.is_single() && dst_is_single && engine.transport().node_count() >= TREE_BROADCAST_THRESHOLD && src_in_seg && dst_in_seg {
        return Algorithm::BcastTreePut(TreeKind::Binomial);
    }
    match choose_strategy(src_in_seg, dst_in_seg, my_sync_or_local(flags), flags.contains(CollFlags::OUT_MYSYNC), nbytes) {
        Strategy::Eager => Algorithm::BcastEager,
        Strategy::Rendezvous => Algorithm::BcastRvGet,
        // BcastPut writes through a single shared address (§4.7); a `PerImage` destination has no
        // single address to put to, so fall back to the rendezvous variant, which always resolves
        // the actual destination list per image instead.
        Strategy::Put if dst_is_single => Algorithm::BcastPut,
        Strategy::Put => Algorithm::BcastRvGet,
        Strategy::Get => Algorithm::BcastGet,
    }
}

fn select_scatter_algorithm(src_in_seg: bool, dst_in_seg: bool, dst_is_single: bool, flags: CollFlags, nbytes: usize) -> Algorithm {
    match choose_strategy(src_in_seg, dst_in_seg, my_sync_or_local(flags), flags.contains(CollFlags::OUT_MYSYNC), nbytes) {
        Strategy::Eager => Algorithm::ScatterEager,
        Strategy::Rendezvous => Algorithm::ScatterRvGet,
        // Same reasoning as broadcast: ScatterPut needs one shared destination address per node.
        Strategy::Put if dst_is_single => Algorithm::ScatterPut,
        Strategy::Put => Algorithm::ScatterRvGet,
        Strategy::Get => Algorithm::ScatterGet,
    }
}

fn select_gather_algorithm(src_in_seg: bool, dst_in_seg: bool, src_is_single: bool, flags: CollFlags, nbytes: usize) -> Algorithm {
    // Gather inverts the Put/Get roles relative to broadcast/scatter: "only destination
    // in-segment" favors pulling (Get: root pulls slices), "only source in-segment" favors
    // pushing (Put: non-roots push slices) — the opposite of §4.7.4's bcast/scatter mapping.
    match choose_strategy(src_in_seg, dst_in_seg, my_sync_or_local(flags), flags.contains(CollFlags::OUT_MYSYNC), nbytes) {
        Strategy::Eager => Algorithm::GatherEager,
        Strategy::Rendezvous => Algorithm::GatherRvPut,
        // GatherGet pulls from one shared source address per node; a `PerImage` source has no
        // single address to pull, so fall back to the rendezvous variant instead.
        Strategy::Put if src_is_single => Algorithm::GatherGet,
        Strategy::Put => Algorithm::GatherRvPut,
        Strategy::Get => Algorithm::GatherPut,
    }
}

/// Step 6 of §4.8's pipeline: allocate generic data/tokens, create the op record with a fresh
/// sequence number, and submit through the aggregation queue (C6). Returns `None` when this
/// submission is an `AGGREGATE` member still awaiting its container; `Some` otherwise (a plain
/// op's own handle, or — when this call closes a pending batch — the container's handle).
fn submit(
    engine: &Engine,
    ctx: &mut ThreadContext,
    team_id: u32,
    algorithm: Algorithm,
    flags: CollFlags,
    args: CollArgs,
) -> Option<Handle> {
    flags.validate();
    if team_id != engine.team_all().id() {
        fatal(FatalError::UnknownTeam(team_id));
    }
    let sequence = engine.team_all().next_sequence();
    let (in_token, out_token) = alloc_tokens(engine, flags);
    let mut generic = GenericAlgoData::new(flags, args);
    generic.in_token = in_token;
    generic.out_token = out_token;
    let id = engine.next_op_id();

    if flags.is_aggregate() {
        let op = OpRecord {
            id,
            team_id,
            sequence,
            algorithm,
            state: State::AwaitInBarrier,
            handle: None,
            aggregate_id: None,
            generic,
        };
        engine.submit(op);
        engine.push_pending_aggregate_member(id);
        return None;
    }

    let mut pending = engine.take_pending_aggregate_members();
    if pending.is_empty() {
        let h = ctx.alloc_handle();
        let op = OpRecord {
            id,
            team_id,
            sequence,
            algorithm,
            state: State::AwaitInBarrier,
            handle: Some(h.share()),
            aggregate_id: None,
            generic,
        };
        engine.submit(op);
        Some(h)
    } else {
        pending.push(id);
        let container_id = engine.next_op_id();
        let container_handle = ctx.alloc_handle();
        let op = OpRecord {
            id,
            team_id,
            sequence,
            algorithm,
            state: State::AwaitInBarrier,
            handle: None,
            aggregate_id: Some(container_id),
            generic,
        };
        // Register the container, and only then link the final member and retarget the earlier
        // ones. A `poll()` racing this call can therefore never observe an `aggregate_id` that
        // points at a container not yet in `engine.aggregates` — and
        // `reconcile_precompleted_aggregate_members` below catches the one case this ordering
        // alone doesn't close: an earlier member completing (and being dropped from the active
        // list) in the gap between its own submission and this retarget.
        engine.submit_aggregate(container_id, Aggregate::new(pending.clone(), container_handle.share()));
        engine.submit(op);
        engine.retarget_aggregate_members(&pending, container_id);
        engine.reconcile_precompleted_aggregate_members(container_id, &pending);
        Some(container_handle)
    }
}

pub fn broadcast_nb(
    engine: &Engine,
    ctx: &mut ThreadContext,
    team_id: u32,
    dst: Target,
    src_image: u32,
    src: Addr,
    nbytes: usize,
    flags: CollFlags,
) -> Option<Handle> {
    flags.validate();
    let root_node = engine.topology().node_of_image(src_image);
    let src_in_seg = detect_in_segment(engine, flags.src_in_segment(), flags.is_single(), src.0, nbytes, root_node);
    bounds_check(engine, src_in_seg, src.0, nbytes, root_node);

    let my_node = engine.transport().my_node();
    let dst_in_seg = match &dst {
        Target::Single(a) => {
            let in_seg = detect_in_segment(engine, flags.dst_in_segment(), flags.is_single(), a.0, nbytes, my_node);
            bounds_check(engine, in_seg, a.0, nbytes, my_node);
            in_seg
        }
        Target::PerImage(addrs) => {
            for a in addrs {
                bounds_check(engine, flags.dst_in_segment(), a.0, nbytes, my_node);
            }
            flags.dst_in_segment()
        }
    };

    let dst_is_single = matches!(dst, Target::Single(_));
    let algorithm = select_broadcast_algorithm(engine, flags, src_in_seg, dst_in_seg, dst_is_single, nbytes);
    let args = CollArgs::Broadcast { root: src_image, dst, src, nbytes };
    submit(engine, ctx, team_id, algorithm, flags, args)
}

pub fn broadcast(
    engine: &Engine,
    ctx: &mut ThreadContext,
    team_id: u32,
    dst: Target,
    src_image: u32,
    src: Addr,
    nbytes: usize,
    flags: CollFlags,
) {
    let h = broadcast_nb(engine, ctx, team_id, dst, src_image, src, nbytes, flags)
        .expect("broadcast's blocking entry point requires a non-AGGREGATE flag word");
    wait_sync(ctx, engine, h);
}

pub fn scatter_nb(
    engine: &Engine,
    ctx: &mut ThreadContext,
    team_id: u32,
    dst: Target,
    root: u32,
    src: Addr,
    nbytes_per_image: usize,
    flags: CollFlags,
) -> Option<Handle> {
    flags.validate();
    let root_node = engine.topology().node_of_image(root);
    let total = nbytes_per_image * engine.team_all().nranks() as usize;
    let src_in_seg = detect_in_segment(engine, flags.src_in_segment(), flags.is_single(), src.0, total, root_node);
    bounds_check(engine, src_in_seg, src.0, total, root_node);

    let my_node = engine.transport().my_node();
    let dst_in_seg = match &dst {
        Target::Single(a) => {
            let in_seg = detect_in_segment(engine, flags.dst_in_segment(), flags.is_single(), a.0, nbytes_per_image, my_node);
            bounds_check(engine, in_seg, a.0, nbytes_per_image, my_node);
            in_seg
        }
        Target::PerImage(addrs) => {
            for a in addrs {
                bounds_check(engine, flags.dst_in_segment(), a.0, nbytes_per_image, my_node);
            }
            flags.dst_in_segment()
        }
    };

    let dst_is_single = matches!(dst, Target::Single(_));
    let algorithm = select_scatter_algorithm(src_in_seg, dst_in_seg, dst_is_single, flags, nbytes_per_image);
    let args = CollArgs::Scatter { root, dst, src, nbytes_per_image };
    submit(engine, ctx, team_id, algorithm, flags, args)
}

pub fn scatter(
    engine: &Engine,
    ctx: &mut ThreadContext,
    team_id: u32,
    dst: Target,
    root: u32,
    src: Addr,
    nbytes_per_image: usize,
    flags: CollFlags,
) {
    let h = scatter_nb(engine, ctx, team_id, dst, root, src, nbytes_per_image, flags)
        .expect("scatter's blocking entry point requires a non-AGGREGATE flag word");
    wait_sync(ctx, engine, h);
}

pub fn gather_nb(
    engine: &Engine,
    ctx: &mut ThreadContext,
    team_id: u32,
    dst: Addr,
    root: u32,
    src: Target,
    nbytes_per_image: usize,
    flags: CollFlags,
) -> Option<Handle> {
    flags.validate();
    let root_node = engine.topology().node_of_image(root);
    let total = nbytes_per_image * engine.team_all().nranks() as usize;
    let dst_in_seg = detect_in_segment(engine, flags.dst_in_segment(), flags.is_single(), dst.0, total, root_node);
    bounds_check(engine, dst_in_seg, dst.0, total, root_node);

    let my_node = engine.transport().my_node();
    let src_in_seg = match &src {
        Target::Single(a) => {
            let in_seg = detect_in_segment(engine, flags.src_in_segment(), flags.is_single(), a.0, nbytes_per_image, my_node);
            bounds_check(engine, in_seg, a.0, nbytes_per_image, my_node);
            in_seg
        }
        Target::PerImage(addrs) => {
            for a in addrs {
                bounds_check(engine, flags.src_in_segment(), a.0, nbytes_per_image, my_node);
            }
            flags.src_in_segment()
        }
    };

    let src_is_single = matches!(src, Target::Single(_));
    let algorithm = select_gather_algorithm(src_in_seg, dst_in_seg, src_is_single, flags, nbytes_per_image);
    let args = CollArgs::Gather { root, dst, src, nbytes_per_image };
    submit(engine, ctx, team_id, algorithm, flags, args)
}

pub fn gather(
    engine: &Engine,
    ctx: &mut ThreadContext,
    team_id: u32,
    dst: Addr,
    root: u32,
    src: Target,
    nbytes_per_image: usize,
    flags: CollFlags,
) {
    let h = gather_nb(engine, ctx, team_id, dst, root, src, nbytes_per_image, flags)
        .expect("gather's blocking entry point requires a non-AGGREGATE flag word");
    wait_sync(ctx, engine, h);
}

/// `gather_all`/`exchange` (§4.7): N concurrent gathers, one rooted at each rank, surfaced as a
/// single aggregate container handle. `exchange` differs only in that every rank's source is its
/// own distinct slice of `src` rather than one shared buffer; both share this implementation
/// since neither needs its own algorithm family. `src_of_root` yields this rank's full `Target`
/// (`Single` or `PerImage`) for the sub-gather rooted at `root`, so the "M" per-image-source
/// variants fold into the same loop as the plain ones instead of needing their own algorithm.
fn gather_all_like(
    engine: &Engine,
    ctx: &mut ThreadContext,
    team_id: u32,
    dst: Addr,
    src_of_root: impl Fn(u32) -> Target,
    nbytes_per_image: usize,
    flags: CollFlags,
) -> Handle {
    flags.validate();
    let nranks = engine.team_all().nranks();
    let member_flags = flags | CollFlags::AGGREGATE;
    let mut last = None;
    for root in 0..nranks {
        let this_flags = if root + 1 == nranks { flags } else { member_flags };
        last = gather_nb(engine, ctx, team_id, dst, root, src_of_root(root), nbytes_per_image, this_flags);
    }
    last.expect("the final (non-AGGREGATE) member always yields the container handle")
}

pub fn gather_all_nb(
    engine: &Engine,
    ctx: &mut ThreadContext,
    team_id: u32,
    dst: Addr,
    src: Addr,
    nbytes_per_image: usize,
    flags: CollFlags,
) -> Handle {
    gather_all_like(engine, ctx, team_id, dst, move |_root| Target::Single(src), nbytes_per_image, flags)
}

pub fn gather_all(engine: &Engine, ctx: &mut ThreadContext, team_id: u32, dst: Addr, src: Addr, nbytes_per_image: usize, flags: CollFlags) {
    let h = gather_all_nb(engine, ctx, team_id, dst, src, nbytes_per_image, flags);
    wait_sync(ctx, engine, h);
}

/// `gather_all`'s per-image-source ("M") variant: every rank contributes its own `src` (possibly
/// a `PerImage` list, one address per locally-hosted image) to every sub-gather rather than one
/// shared address.
pub fn gather_all_m_nb(
    engine: &Engine,
    ctx: &mut ThreadContext,
    team_id: u32,
    dst: Addr,
    src: Target,
    nbytes_per_image: usize,
    flags: CollFlags,
) -> Handle {
    gather_all_like(engine, ctx, team_id, dst, move |_root| src.clone(), nbytes_per_image, flags)
}

pub fn gather_all_m(engine: &Engine, ctx: &mut ThreadContext, team_id: u32, dst: Addr, src: Target, nbytes_per_image: usize, flags: CollFlags) {
    let h = gather_all_m_nb(engine, ctx, team_id, dst, src, nbytes_per_image, flags);
    wait_sync(ctx, engine, h);
}

/// Every rank contributes a distinct `nbytes_per_image`-byte slice of its own `src` buffer (one
/// slice per destination rank, laid out contiguously) rather than one shared source.
pub fn exchange_nb(
    engine: &Engine,
    ctx: &mut ThreadContext,
    team_id: u32,
    dst: Addr,
    src: Addr,
    nbytes_per_image: usize,
    flags: CollFlags,
) -> Handle {
    exchange_m_nb(engine, ctx, team_id, dst, Target::Single(src), nbytes_per_image, flags)
}

pub fn exchange(engine: &Engine, ctx: &mut ThreadContext, team_id: u32, dst: Addr, src: Addr, nbytes_per_image: usize, flags: CollFlags) {
    let h = exchange_nb(engine, ctx, team_id, dst, src, nbytes_per_image, flags);
    wait_sync(ctx, engine, h);
}

/// `exchange`'s per-image-source ("M") variant: `src` may be a `PerImage` list, one base address
/// per locally-hosted image, each holding `nranks` contiguous `nbytes_per_image`-byte slices (one
/// per destination rank) the same way the single-address form does.
pub fn exchange_m_nb(
    engine: &Engine,
    ctx: &mut ThreadContext,
    team_id: u32,
    dst: Addr,
    src: Target,
    nbytes_per_image: usize,
    flags: CollFlags,
) -> Handle {
    gather_all_like(
        engine,
        ctx,
        team_id,
        dst,
        move |root| match &src {
            Target::Single(a) => Target::Single(Addr(a.0 + root as usize * nbytes_per_image)),
            Target::PerImage(addrs) => {
                Target::PerImage(addrs.iter().map(|a| Addr(a.0 + root as usize * nbytes_per_image)).collect())
            }
        },
        nbytes_per_image,
        flags,
    )
}

pub fn exchange_m(engine: &Engine, ctx: &mut ThreadContext, team_id: u32, dst: Addr, src: Target, nbytes_per_image: usize, flags: CollFlags) {
    let h = exchange_m_nb(engine, ctx, team_id, dst, src, nbytes_per_image, flags);
    wait_sync(ctx, engine, h);
}
