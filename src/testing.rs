//! An in-process transport implementing the §6 contract over simulated nodes.
//!
//! There is no production transport in this crate (wiring a real one-sided fabric is out of
//! scope, §1); `LoopbackTransport` exists purely so the engine can be exercised end-to-end
//! (§8's round-trip and concurrency properties) without a real RDMA substrate. Every node is
//! simulated by a fixed byte arena guarded by a lock; active messages execute synchronously in
//! the sender's calling thread, which is a valid (if conservative) implementation of the §6
//! contract's ordering guarantees.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::{AmHandler, CompletionToken, Transport};

const ARENA_BYTES: usize = 1 << 20;

struct BarrierEntry {
    arrived: u32,
}

struct ClusterInner {
    node_count: u32,
    arenas: Vec<Mutex<Vec<u8>>>,
    handlers: Vec<Mutex<HashMap<u32, AmHandler>>>,
    barriers: Mutex<HashMap<u32, BarrierEntry>>,
    next_token: AtomicU64,
}

/// A simulated cluster of `node_count` nodes sharing one process's memory.
///
/// Get a per-node [`Transport`] handle with [`LoopbackCluster::node`]; every handle shares the
/// same simulated fabric (arenas, AM handler tables, named barriers).
#[derive(Clone)]
pub struct LoopbackCluster {
    inner: Arc<ClusterInner>,
}

impl LoopbackCluster {
    pub fn new(node_count: u32) -> LoopbackCluster {
        LoopbackCluster {
            inner: Arc::new(ClusterInner {
                node_count,
                arenas: (0..node_count).map(|_| Mutex::new(vec![0u8; ARENA_BYTES])).collect(),
                handlers: (0..node_count).map(|_| Mutex::new(HashMap::new())).collect(),
                barriers: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// A transport handle for node `node` sharing this cluster's simulated fabric.
    pub fn node(&self, node: u32) -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport {
            cluster: self.inner.clone(),
            my_node: node,
        })
    }

    pub fn node_count(&self) -> u32 {
        self.inner.node_count
    }
}

/// A simulated transport handle for one node of a [`LoopbackCluster`].
pub struct LoopbackTransport {
    cluster: Arc<ClusterInner>,
    my_node: u32,
}

impl LoopbackTransport {
    /// A single-node (`node_count = 1`) cluster's transport handle — enough to exercise
    /// single-process consensus/P2P logic without spawning threads.
    pub fn single_node() -> Arc<dyn Transport> {
        LoopbackCluster::new(1).node(0)
    }

    /// A fresh `n`-node cluster; call [`LoopbackCluster::node`] to get each node's handle.
    pub fn cluster(n: u32) -> LoopbackCluster {
        LoopbackCluster::new(n)
    }
}

impl Transport for LoopbackTransport {
    fn blocking_get(&self, dst: &mut [u8], src_node: u32, src: usize) {
        let arena = self.cluster.arenas[src_node as usize].lock();
        dst.copy_from_slice(&arena[src..src + dst.len()]);
    }

    fn blocking_put(&self, dst_node: u32, dst: usize, src: &[u8]) {
        let mut arena = self.cluster.arenas[dst_node as usize].lock();
        arena[dst..dst + src.len()].copy_from_slice(src);
    }

    fn nb_put_bulk(&self, dst_node: u32, dst: usize, src: &[u8]) -> CompletionToken {
        self.blocking_put(dst_node, dst, src);
        self.cluster.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn nb_get_bulk(&self, dst: &mut [u8], src_node: u32, src: usize) -> CompletionToken {
        self.blocking_get(dst, src_node, src);
        self.cluster.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn nbi_put_bulk(&self, dst_node: u32, dst: usize, src: &[u8]) {
        self.blocking_put(dst_node, dst, src);
    }

    fn nbi_get_bulk(&self, dst: &mut [u8], src_node: u32, src: usize) {
        self.blocking_get(dst, src_node, src);
    }

    fn begin_nbi_region(&self) -> CompletionToken {
        self.cluster.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn end_nbi_region(&self) -> CompletionToken {
        self.cluster.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn try_sync_nb(&self, _token: CompletionToken) -> bool {
        // Every put/get above already ran to completion synchronously.
        true
    }

    fn wait_sync_nb(&self, _token: CompletionToken) {}

    fn max_long_request(&self) -> usize {
        1 << 18
    }

    fn max_medium(&self) -> usize {
        8192
    }

    fn register_handler(&self, handler_idx: u32, handler: AmHandler) {
        self.cluster.handlers[self.my_node as usize]
            .lock()
            .insert(handler_idx, handler);
    }

    fn short_request_reply(&self, dst_node: u32, handler_idx: u32, args: &[u64], payload: &[u8]) {
        let handler = self.cluster.handlers[dst_node as usize].lock().get(&handler_idx).cloned();
        if let Some(handler) = handler {
            handler(self.my_node, args, payload);
        }
    }

    fn barrier_notify(&self, name: u32, _flags: u32) {
        let mut barriers = self.cluster.barriers.lock();
        let entry = barriers.entry(name).or_insert(BarrierEntry { arrived: 0 });
        entry.arrived += 1;
    }

    fn barrier_wait(&self, name: u32) {
        loop {
            if self.barrier_try(name) {
                return;
            }
            std::thread::yield_now();
        }
    }

    fn barrier_try(&self, name: u32) -> bool {
        let barriers = self.cluster.barriers.lock();
        barriers
            .get(&name)
            .map(|e| e.arrived >= self.cluster.node_count)
            .unwrap_or(false)
    }

    fn poll(&self) {}

    fn node_count(&self) -> u32 {
        self.cluster.node_count
    }

    fn my_node(&self) -> u32 {
        self.my_node
    }

    fn segment_of(&self, node: u32) -> (usize, usize) {
        let _ = node;
        (0, ARENA_BYTES)
    }

    fn local_write(&self, addr: usize, src: &[u8]) {
        self.blocking_put(self.my_node, addr, src);
    }

    fn local_read(&self, addr: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.blocking_get(&mut buf, self.my_node, addr);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let net = LoopbackTransport::cluster(2);
        let a = net.node(0);
        let b = net.node(1);
        a.blocking_put(1, 100, &[1, 2, 3, 4]);
        let mut buf = [0u8; 4];
        b.blocking_get(&mut buf, 0, 0); // reading node 0's own (untouched) arena
        assert_eq!(buf, [0, 0, 0, 0]);
        let mut buf2 = [0u8; 4];
        a.blocking_get(&mut buf2, 1, 100);
        assert_eq!(buf2, [1, 2, 3, 4]);
    }

    #[test]
    fn barrier_requires_every_node() {
        let net = LoopbackTransport::cluster(3);
        let a = net.node(0);
        a.barrier_notify(1, 0);
        assert!(!a.barrier_try(1));
        net.node(1).barrier_notify(1, 0);
        net.node(2).barrier_notify(1, 0);
        assert!(a.barrier_try(1));
    }
}
