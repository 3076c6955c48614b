//! The process-wide engine (C5's active list/progress engine, tying together C1-C4 and C6-C7).
//!
//! One `Engine` per process, created by [`crate::init`]. Every public entry point in
//! [`crate::dispatch`] submits an [`OpRecord`] here; [`Engine::poll`] is the progress sweep every
//! blocking entry point and [`crate::handle::wait_sync`] drive in a loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::aggregate::Aggregate;
use crate::algo::{self, PollResult};
use crate::consensus::ConsensusService;
use crate::op::OpRecord;
use crate::p2p::P2pTable;
use crate::team::{ImageTopology, Team};
use crate::transport::Transport;
use crate::tree::TreeCache;

/// The engine's active list plus every collaborator an algorithm poll function may need.
pub struct Engine {
    transport: Arc<dyn Transport>,
    tree_cache: TreeCache,
    consensus: ConsensusService,
    p2p: Arc<P2pTable>,
    topology: ImageTopology,
    team_all: Team,
    /// FIFO active list (I6), protected by its own mutex for link edits, per §5.
    active: Mutex<VecDeque<OpRecord>>,
    /// Held for the duration of one sweep so idle polling threads don't contend uselessly (§4.5).
    poll_mutex: Mutex<()>,
    aggregates: Mutex<HashMap<u64, Aggregate>>,
    next_op_id: AtomicU64,
    /// §4.6's "process-global circular list of pending aggregate members": op ids submitted with
    /// `AGGREGATE` that haven't yet been closed out by a non-`AGGREGATE` submission.
    pending_aggregate_members: Mutex<Vec<u64>>,
    /// Ids of `AGGREGATE` members that reached `COMPLETE`/`INACTIVE` before the batch's closing
    /// submission registered their container — the race window between a member's own submission
    /// and [`Engine::retarget_aggregate_members`]. Drained by
    /// [`Engine::reconcile_precompleted_aggregate_members`].
    precompleted_aggregate_members: Mutex<Vec<u64>>,
}

impl Engine {
    pub fn new(transport: Arc<dyn Transport>, image_counts: &[u32], my_image: u32) -> Engine {
        let nranks = image_counts.iter().sum();
        let topology = ImageTopology::new(image_counts, my_image);
        let tree_cache = TreeCache::new(my_image, nranks);
        let consensus = ConsensusService::new(transport.clone());
        let p2p = P2pTable::new(transport.clone(), transport.my_node(), topology.image_count());
        Engine {
            transport,
            tree_cache,
            consensus,
            p2p,
            topology,
            team_all: Team::team_all(nranks),
            active: Mutex::new(VecDeque::new()),
            poll_mutex: Mutex::new(()),
            aggregates: Mutex::new(HashMap::new()),
            next_op_id: AtomicU64::new(1),
            pending_aggregate_members: Mutex::new(Vec::new()),
            precompleted_aggregate_members: Mutex::new(Vec::new()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn tree_cache(&self) -> &TreeCache {
        &self.tree_cache
    }

    /// Exposed beyond the crate boundary so callers can directly exercise consensus monotonicity
    /// (§8's testable property 3) against their own transport, not just this crate's algorithms.
    pub fn consensus(&self) -> &ConsensusService {
        &self.consensus
    }

    pub(crate) fn p2p(&self) -> &Arc<P2pTable> {
        &self.p2p
    }

    pub fn topology(&self) -> &ImageTopology {
        &self.topology
    }

    pub fn team_all(&self) -> &Team {
        &self.team_all
    }

    pub fn next_op_id(&self) -> u64 {
        self.next_op_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Link a freshly-built op onto the tail of the active list (I6).
    pub(crate) fn submit(&self, op: OpRecord) {
        self.active.lock().push_back(op);
    }

    /// Register a fresh aggregate container, keyed by its own synthetic id.
    pub(crate) fn submit_aggregate(&self, id: u64, aggregate: Aggregate) {
        self.aggregates.lock().insert(id, aggregate);
    }

    /// Record `id` as a pending aggregate member awaiting a container (§4.6).
    pub fn push_pending_aggregate_member(&self, id: u64) {
        self.pending_aggregate_members.lock().push(id);
    }

    /// Drain and return every op id currently pending a container, in submission order.
    pub fn take_pending_aggregate_members(&self) -> Vec<u64> {
        std::mem::take(&mut *self.pending_aggregate_members.lock())
    }

    /// Back-patch already-linked members' `aggregate_id` once their container is known (the
    /// aggregation "head" link, per the data model, is assigned after the members themselves are
    /// already on the active list).
    pub fn retarget_aggregate_members(&self, member_ids: &[u64], container_id: u64) {
        let mut active = self.active.lock();
        for op in active.iter_mut() {
            if member_ids.contains(&op.id) {
                op.aggregate_id = Some(container_id);
            }
        }
    }

    /// Apply every already-stashed completion among `member_ids` to `container_id`'s aggregate.
    /// Called right after [`Engine::retarget_aggregate_members`] so a member that completed (and
    /// was dropped from the active list) before the container existed still counts towards it.
    pub fn reconcile_precompleted_aggregate_members(&self, container_id: u64, member_ids: &[u64]) {
        let hits = {
            let mut stash = self.precompleted_aggregate_members.lock();
            let before = stash.len();
            stash.retain(|id| !member_ids.contains(id));
            before - stash.len()
        };
        if hits == 0 {
            return;
        }
        let mut aggregates = self.aggregates.lock();
        if let Some(agg) = aggregates.get_mut(&container_id) {
            for _ in 0..hits {
                if agg.member_completed() {
                    agg.handle.signal();
                    aggregates.remove(&container_id);
                    break;
                }
            }
        }
    }

    /// One progress sweep (§4.5): walk the active list head-first, advance each op's state
    /// machine, signal handles/aggregate membership for `COMPLETE` ops, unlink `INACTIVE` ones.
    pub fn poll(&self) {
        let _serialize = self.poll_mutex.lock();
        let mut active = self.active.lock();
        let mut i = 0;
        while i < active.len() {
            let result = algo::poll_op(&mut active[i], self);
            if result.contains(PollResult::COMPLETE) {
                let op = &active[i];
                if let Some(agg_id) = op.aggregate_id {
                    let mut aggregates = self.aggregates.lock();
                    if let Some(agg) = aggregates.get_mut(&agg_id) {
                        if agg.member_completed() {
                            agg.handle.signal();
                            aggregates.remove(&agg_id);
                        }
                    }
                } else if let Some(h) = &op.handle {
                    h.signal();
                } else {
                    // An `AGGREGATE` member, submitted but not yet retargeted onto its container
                    // (the container doesn't exist yet). Stash it so the closing submission's
                    // reconciliation step can count it instead of silently dropping it.
                    self.precompleted_aggregate_members.lock().push(op.id);
                }
            }
            if result.contains(PollResult::INACTIVE) {
                active.remove(i);
            } else {
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::CollFlags;
    use crate::handle::{try_sync, wait_sync};
    use crate::op::{Addr, CollArgs, Target};
    use crate::pool::ThreadContext;
    use crate::testing::LoopbackTransport;

    #[test]
    fn single_node_broadcast_from_root_to_self_completes() {
        let net = LoopbackTransport::single_node();
        let engine = Engine::new(net, &[1], 0);
        let mut ctx = ThreadContext::new();

        let flags = CollFlags::IN_NOSYNC | CollFlags::OUT_NOSYNC | CollFlags::SINGLE;
        let data = b"hello".to_vec();
        engine.transport().local_write(0, &data);
        let h = crate::dispatch::broadcast_nb(
            &engine,
            &mut ctx,
            0,
            Target::Single(Addr(100)),
            0,
            Addr(0),
            data.len(),
            flags,
        )
        .expect("not an AGGREGATE submission");
        wait_sync(&mut ctx, &engine, h);
        let out = engine.transport().local_read(100, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn try_sync_on_not_yet_linked_handle_retries() {
        let net = LoopbackTransport::single_node();
        let engine = Engine::new(net, &[1], 0);
        let mut ctx = ThreadContext::new();
        let flags = CollFlags::IN_ALLSYNC | CollFlags::OUT_ALLSYNC | CollFlags::SINGLE;
        let data = vec![7u8; 16];
        engine.transport().local_write(0, &data);
        let h = crate::dispatch::broadcast_nb(
            &engine,
            &mut ctx,
            0,
            Target::Single(Addr(200)),
            0,
            Addr(0),
            data.len(),
            flags,
        )
        .expect("not an AGGREGATE submission");
        // IN_ALLSYNC/OUT_ALLSYNC need consensus; a single-node barrier always drains on the first
        // try, but the handle is only signaled after a poll sweep observes completion.
        let h = match try_sync(&mut ctx, h) {
            Ok(()) => return,
            Err(h) => h,
        };
        wait_sync(&mut ctx, &engine, h);
    }
}
