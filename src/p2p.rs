//! Point-to-point rendezvous table (C3, §4.3).
//!
//! Delivers small eager payloads, per-image rendezvous addresses, and step signals between op
//! instances identified only by `(team, sequence)`, with no prior table entry required at the
//! receiver (I2: a record exists iff some active op with that identity requested it).
//!
//! Ordering: the transport guarantees that the state-update action within one signalling call is
//! observed only after that call's payload (if any) is stored; there is no guarantee *between*
//! distinct signalling calls, so every primitive here relies on the per-slot state array, never on
//! message arrival order, to let a receiver detect completion (§4.3).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::{AmHandler, Transport, HANDLER_EAGER_LONG, HANDLER_EAGER_MED, HANDLER_EAGER_SHORT};

/// Minimum eager data-buffer size, regardless of image count.
pub const EAGER_MIN: usize = 4096;
/// Per-image scaling factor for the eager data buffer: the buffer is at least
/// `image_count * EAGER_SCALE` bytes.
pub const EAGER_SCALE: usize = 64;
/// Number of hash buckets in the P2P table; must be a power of two, at least 16 (§4.3).
pub const P2P_BUCKETS: usize = 32;

const KIND_SIGNAL: u64 = 0;
const KIND_EAGER_CHUNK: u64 = 1;
const KIND_CHANGE_STATES: u64 = 2;

/// A P2P record: per-(team, sequence) eager data buffer and per-image state array.
pub struct P2pRecord {
    pub team_id: u32,
    pub sequence: u32,
    data: Mutex<Vec<u8>>,
    state: Vec<AtomicU32>,
}

impl P2pRecord {
    fn new(team_id: u32, sequence: u32, image_count: u32) -> P2pRecord {
        let data_len = EAGER_MIN.max(image_count as usize * EAGER_SCALE);
        P2pRecord {
            team_id,
            sequence,
            data: Mutex::new(vec![0u8; data_len]),
            state: (0..image_count).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Read the state word for image `off`.
    pub fn state_at(&self, off: u32) -> u32 {
        self.state[off as usize].load(Ordering::Acquire)
    }

    /// Block-free check that every slot in `[off, off + count)` carries `expected`.
    pub fn states_ready(&self, off: u32, count: u32, expected: u32) -> bool {
        (off..off + count).all(|i| self.state[i as usize].load(Ordering::Acquire) == expected)
    }

    /// Copy `count * elem_size` bytes out of the data buffer starting at element `off`.
    pub fn copy_out(&self, off: usize, elem_size: usize, count: usize, dst: &mut [u8]) {
        let data = self.data.lock();
        let start = off * elem_size;
        let len = count * elem_size;
        dst[..len].copy_from_slice(&data[start..start + len]);
    }

    fn write_chunk(&self, off: usize, elem_size: usize, payload: &[u8]) {
        let mut data = self.data.lock();
        let start = off * elem_size;
        data[start..start + payload.len()].copy_from_slice(payload);
    }

    fn set_states(&self, off: u32, count: u32, value: u32) {
        for i in off..off + count {
            self.state[i as usize].store(value, Ordering::Release);
        }
    }
}

struct Bucket {
    records: VecDeque<Arc<P2pRecord>>,
}

/// The process-wide point-to-point rendezvous table.
pub struct P2pTable {
    my_node: u32,
    image_count: u32,
    transport: Arc<dyn Transport>,
    buckets: Vec<Mutex<Bucket>>,
}

impl P2pTable {
    pub fn new(transport: Arc<dyn Transport>, my_node: u32, image_count: u32) -> Arc<P2pTable> {
        let table = Arc::new(P2pTable {
            my_node,
            image_count,
            transport: transport.clone(),
            buckets: (0..P2P_BUCKETS)
                .map(|_| {
                    Mutex::new(Bucket {
                        records: VecDeque::new(),
                    })
                })
                .collect(),
        });

        let weak = Arc::downgrade(&table);
        let handler: AmHandler = Arc::new(move |src_node, args, payload| {
            if let Some(table) = weak.upgrade() {
                table.handle_am(src_node, args, payload);
            }
        });
        transport.register_handler(HANDLER_EAGER_SHORT, handler.clone());
        transport.register_handler(HANDLER_EAGER_MED, handler.clone());
        transport.register_handler(HANDLER_EAGER_LONG, handler);
        table
    }

    fn bucket_of(&self, sequence: u32) -> &Mutex<Bucket> {
        &self.buckets[(sequence as usize) & (P2P_BUCKETS - 1)]
    }

    /// Look up or create the record for `(team_id, sequence)` (I2).
    pub fn get(&self, team_id: u32, sequence: u32) -> Arc<P2pRecord> {
        let mut bucket = self.bucket_of(sequence).lock();
        if let Some(found) = bucket
            .records
            .iter()
            .find(|r| r.team_id == team_id && r.sequence == sequence)
        {
            return found.clone();
        }
        let record = Arc::new(P2pRecord::new(team_id, sequence, self.image_count));
        bucket.records.push_back(record.clone());
        record
    }

    /// Release the record for `(team_id, sequence)`; it is dropped once the op that requested it
    /// completes (I2).
    pub fn free(&self, team_id: u32, sequence: u32) {
        let mut bucket = self.bucket_of(sequence).lock();
        bucket
            .records
            .retain(|r| !(r.team_id == team_id && r.sequence == sequence));
    }

    fn handle_am(&self, _src_node: u32, args: &[u64], payload: &[u8]) {
        let kind = args[0];
        let team_id = args[1] as u32;
        let sequence = args[2] as u32;
        let off = args[3] as u32;
        let count = args[4] as u32;
        let elem_size = args[5] as usize;
        let state_val = args[6] as u32;
        let record = self.get(team_id, sequence);
        match kind {
            KIND_SIGNAL => {
                record.set_states(off, 1, state_val);
            }
            KIND_EAGER_CHUNK => {
                record.write_chunk(off as usize, elem_size, payload);
                // §3 supplement: set state on every chunk, not only the final one.
                record.set_states(off, count, state_val);
            }
            KIND_CHANGE_STATES => {
                record.set_states(off, count, state_val);
            }
            _ => unreachable!("unknown P2P AM kind"),
        }
    }

    fn handler_for(&self, payload_len: usize) -> u32 {
        if payload_len == 0 {
            HANDLER_EAGER_SHORT
        } else if payload_len <= self.transport.max_medium() {
            HANDLER_EAGER_MED
        } else {
            HANDLER_EAGER_LONG
        }
    }

    /// Long put of `src` to `(dst_node, dst_addr)`, signalling `state[off] := state` once the
    /// payload is stored at the destination.
    pub fn signalling_put(&self, dst_node: u32, dst_addr: usize, src: &[u8], off: u32, state: u32) {
        debug_assert!(src.len() <= self.transport.max_long_request());
        self.transport.blocking_put(dst_node, dst_addr, src);
        let handler = self.handler_for(0);
        self.transport.short_request_reply(
            dst_node,
            handler,
            &[KIND_SIGNAL, 0, 0, off as u64, 1, 0, state as u64],
            &[],
        );
    }

    /// Identical semantics to [`P2pTable::signalling_put`], but may return before the local
    /// buffer is reusable. In this in-process model the underlying put already completes
    /// synchronously, so the distinction is one of caller contract rather than implementation.
    pub fn signalling_put_async(&self, dst_node: u32, dst_addr: usize, src: &[u8], off: u32, state: u32) {
        self.signalling_put(dst_node, dst_addr, src, off, state);
    }

    /// Send `count` elements of `elem_size` bytes into `dst_node`'s P2P record `(team_id,
    /// sequence)`, starting at element `off`. Segmented into AMs of at most
    /// `max_medium / elem_size` elements; `state` is set on `state[off..off+count)` on *every*
    /// chunk's delivery (§3 supplement, resolving the §9 open question).
    pub fn eager_put_m(
        &self,
        dst_node: u32,
        team_id: u32,
        sequence: u32,
        src: &[u8],
        count: u32,
        elem_size: usize,
        off: u32,
        state: u32,
    ) {
        if dst_node == self.my_node {
            let record = self.get(team_id, sequence);
            record.write_chunk(off as usize, elem_size, src);
            record.set_states(off, count, state);
            return;
        }
        let max_elems = (self.transport.max_medium() / elem_size).max(1) as u32;
        let mut sent = 0u32;
        while sent < count {
            let chunk = max_elems.min(count - sent);
            let byte_start = sent as usize * elem_size;
            let byte_len = chunk as usize * elem_size;
            let payload = &src[byte_start..byte_start + byte_len];
            let handler = self.handler_for(payload.len());
            self.transport.short_request_reply(
                dst_node,
                handler,
                &[
                    KIND_EAGER_CHUNK,
                    team_id as u64,
                    sequence as u64,
                    (off + sent) as u64,
                    chunk as u64,
                    elem_size as u64,
                    state as u64,
                ],
                payload,
            );
            sent += chunk;
        }
    }

    /// `eager_put_m` with `count = 1`.
    pub fn eager_put(
        &self,
        dst_node: u32,
        team_id: u32,
        sequence: u32,
        src: &[u8],
        elem_size: usize,
        off: u32,
        state: u32,
    ) {
        self.eager_put_m(dst_node, team_id, sequence, src, 1, elem_size, off, state);
    }

    /// `eager_put_m` specialized to pointer-sized ("address") elements.
    pub fn eager_addr_m(
        &self,
        dst_node: u32,
        team_id: u32,
        sequence: u32,
        addrs: &[usize],
        off: u32,
        state: u32,
    ) {
        let bytes: Vec<u8> = addrs.iter().flat_map(|a| a.to_ne_bytes()).collect();
        self.eager_put_m(
            dst_node,
            team_id,
            sequence,
            &bytes,
            addrs.len() as u32,
            std::mem::size_of::<usize>(),
            off,
            state,
        );
    }

    /// `eager_addr_m` with a single address.
    pub fn eager_addr(&self, dst_node: u32, team_id: u32, sequence: u32, addr: usize, off: u32, state: u32) {
        self.eager_addr_m(dst_node, team_id, sequence, &[addr], off, state);
    }

    /// Broadcast (`scatter = false`) or scatter (`scatter = true`) `src` to every other node.
    /// Per the GASNet original (§3 supplement), the local node is never sent an AM: its share is
    /// applied directly.
    pub fn eager_put_all(
        &self,
        team_id: u32,
        sequence: u32,
        node_count: u32,
        src: &[u8],
        size: usize,
        scatter: bool,
        off: u32,
        state: u32,
    ) {
        for dst_node in 0..node_count {
            let slice = if scatter {
                &src[dst_node as usize * size..(dst_node as usize + 1) * size]
            } else {
                src
            };
            self.eager_put_m(dst_node, team_id, sequence, slice, size as u32, 1, off, state);
        }
    }

    /// Broadcast a single pointer value to every other node.
    pub fn eager_addr_all(&self, team_id: u32, sequence: u32, node_count: u32, addr: usize, off: u32, state: u32) {
        for dst_node in 0..node_count {
            self.eager_addr(dst_node, team_id, sequence, addr, off, state);
        }
    }

    /// No-payload AM: writes `state` into `count` consecutive state entries starting at `off` at
    /// `dst_node`'s record for `(team_id, sequence)`.
    pub fn change_states(&self, dst_node: u32, team_id: u32, sequence: u32, count: u32, off: u32, state: u32) {
        if dst_node == self.my_node {
            self.get(team_id, sequence).set_states(off, count, state);
            return;
        }
        self.transport.short_request_reply(
            dst_node,
            HANDLER_EAGER_SHORT,
            &[
                KIND_CHANGE_STATES,
                team_id as u64,
                sequence as u64,
                off as u64,
                count as u64,
                1,
                state as u64,
            ],
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackTransport;

    #[test]
    fn get_creates_then_reuses_record() {
        let net = LoopbackTransport::cluster(2);
        let table = P2pTable::new(net.node(0), 0, 2);
        let r1 = table.get(7, 42);
        let r2 = table.get(7, 42);
        assert!(Arc::ptr_eq(&r1, &r2));
    }

    #[test]
    fn free_removes_record_for_containment_invariant() {
        let net = LoopbackTransport::cluster(2);
        let table = P2pTable::new(net.node(0), 0, 2);
        let _ = table.get(1, 1);
        table.free(1, 1);
        let bucket = table.bucket_of(1).lock();
        assert!(bucket.records.is_empty());
    }

    #[test]
    fn eager_put_m_sets_state_on_every_chunk() {
        let net = LoopbackTransport::cluster(2);
        let recv_table = P2pTable::new(net.node(1), 1, 2);
        let send_table = P2pTable::new(net.node(0), 0, 2);

        let data = vec![0xABu8; 8];
        send_table.eager_put_m(1, 3, 9, &data, 8, 1, 0, 1);

        let record = recv_table.get(3, 9);
        assert!(record.states_ready(0, 8, 1));
        let mut out = vec![0u8; 8];
        record.copy_out(0, 1, 8, &mut out);
        assert_eq!(out, data);
    }
}
