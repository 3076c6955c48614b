//! Broadcast algorithm variants (§4.7): Get, Put, Eager, RvGet, and the three tree strategies.

use crate::engine::Engine;
use crate::op::{Algorithm, CollArgs, OpRecord, State, Target};

use super::{check_in_barrier, check_out_barrier, cleanup, write_target, PollResult};

fn unpack(op: &OpRecord) -> (u32, Target, usize, usize) {
    match &op.generic.args {
        CollArgs::Broadcast { root, dst, src, nbytes } => (*root, dst.clone(), src.0, *nbytes),
        _ => unreachable!("broadcast poll function given a non-broadcast op"),
    }
}

pub fn poll(op: &mut OpRecord, engine: &Engine) -> PollResult {
    if op.state == State::AwaitInBarrier {
        if !check_in_barrier(op, engine) {
            return PollResult::empty();
        }
    }
    if op.state == State::InitiateTransfer {
        initiate(op, engine);
        op.advance(State::AwaitTransfer);
    }
    if op.state == State::AwaitTransfer {
        if !transfer_ready(op, engine) {
            return PollResult::empty();
        }
        op.advance(State::AwaitOutBarrier);
    }
    if op.state == State::AwaitOutBarrier {
        if !check_out_barrier(op, engine) {
            return PollResult::empty();
        }
    }
    if op.state == State::Cleanup {
        return cleanup(op, engine);
    }
    PollResult::empty()
}

fn initiate(op: &mut OpRecord, engine: &Engine) {
    let (root, dst, src_addr, nbytes) = unpack(op);
    let my_image = engine.topology().my_image();
    let is_root = my_image == root;

    match op.algorithm {
        Algorithm::BcastGet => {
            if is_root {
                let bytes = engine.transport().local_read(src_addr, nbytes);
                write_target(engine, &dst, &bytes);
            } else {
                let mut buf = vec![0u8; nbytes];
                let root_node = engine.topology().node_of_image(root);
                let token = engine.transport().nb_get_bulk(&mut buf, root_node, src_addr);
                op.generic.scratch = Some(buf);
                op.generic.pending_transfer = Some(token);
            }
        }
        Algorithm::BcastPut => {
            if is_root {
                let bytes = engine.transport().local_read(src_addr, nbytes);
                write_target(engine, &dst, &bytes);
                let my_node = engine.transport().my_node();
                for node in 0..engine.transport().node_count() {
                    if node == my_node {
                        continue;
                    }
                    let dst_addr = match &dst {
                        Target::Single(a) => a.0,
                        Target::PerImage(_) => unreachable!("BcastPut only selected for SINGLE"),
                    };
                    let token = engine.transport().nb_put_bulk(node, dst_addr, &bytes);
                    op.generic.pending_tokens.push(token);
                }
            }
            // Non-roots have nothing to issue; the root's ordered puts land directly in their
            // registered destination, visible once the OUT barrier (required for this strategy)
            // drains.
        }
        Algorithm::BcastEager => {
            let record = engine.p2p().get(op.team_id, op.sequence);
            op.generic.p2p = Some(record);
            op.generic.needs_p2p = true;
            if is_root {
                let bytes = engine.transport().local_read(src_addr, nbytes);
                write_target(engine, &dst, &bytes);
                engine
                    .p2p()
                    .eager_put_all(op.team_id, op.sequence, engine.transport().node_count(), &bytes, nbytes, false, 0, 1);
            }
        }
        Algorithm::BcastRvGet => {
            let record = engine.p2p().get(op.team_id, op.sequence);
            op.generic.p2p = Some(record);
            op.generic.needs_p2p = true;
            if is_root {
                let root_node = engine.transport().my_node();
                engine.p2p().eager_addr_all(op.team_id, op.sequence, engine.transport().node_count(), src_addr, 0, 1);
                let _ = root_node;
                let bytes = engine.transport().local_read(src_addr, nbytes);
                write_target(engine, &dst, &bytes);
            }
        }
        Algorithm::BcastTreePut(kind) => {
            let geom = engine.tree_cache().tree_init(kind, root);
            if is_root {
                let bytes = engine.transport().local_read(src_addr, nbytes);
                write_target(engine, &dst, &bytes);
            }
            op.generic.tree = Some(crate::op::TreeData { geometry: geom, segment_size: nbytes, bytes_sent: 0 });
            let record = engine.p2p().get(op.team_id, op.sequence);
            op.generic.p2p = Some(record);
            op.generic.needs_p2p = true;
        }
        Algorithm::BcastTreeGet(kind) => {
            let geom = engine.tree_cache().tree_init(kind, root);
            if is_root {
                let bytes = engine.transport().local_read(src_addr, nbytes);
                write_target(engine, &dst, &bytes);
            }
            op.generic.tree = Some(crate::op::TreeData { geometry: geom, segment_size: nbytes, bytes_sent: 0 });
            let record = engine.p2p().get(op.team_id, op.sequence);
            op.generic.p2p = Some(record);
            op.generic.needs_p2p = true;
            if is_root {
                // Publish our own (now-filled) destination address to every child so it can pull.
                let dst_addr = match &dst {
                    Target::Single(a) => a.0,
                    Target::PerImage(_) => unreachable!("tree broadcast only supports SINGLE dst"),
                };
                for &child in &op.generic.tree.as_ref().unwrap().geometry.children {
                    let child_node = engine.topology().node_of_image(child);
                    engine.p2p().eager_addr(child_node, op.team_id, op.sequence, dst_addr, 0, 1);
                }
            }
        }
        Algorithm::BcastTreeEager(kind) => {
            let geom = engine.tree_cache().tree_init(kind, root);
            op.generic.tree = Some(crate::op::TreeData { geometry: geom, segment_size: nbytes, bytes_sent: 0 });
            let record = engine.p2p().get(op.team_id, op.sequence);
            op.generic.p2p = Some(record);
            op.generic.needs_p2p = true;
            if is_root {
                let bytes = engine.transport().local_read(src_addr, nbytes);
                write_target(engine, &dst, &bytes);
                for &child in &op.generic.tree.as_ref().unwrap().geometry.children {
                    let child_node = engine.topology().node_of_image(child);
                    engine.p2p().eager_put_m(child_node, op.team_id, op.sequence, &bytes, 1, nbytes, 0, 1);
                }
            }
        }
        _ => unreachable!("non-broadcast algorithm in broadcast::initiate"),
    }
}

fn transfer_ready(op: &mut OpRecord, engine: &Engine) -> bool {
    let (root, dst, _src_addr, nbytes) = unpack(op);
    let my_image = engine.topology().my_image();
    let is_root = my_image == root;

    match op.algorithm {
        Algorithm::BcastGet => {
            if is_root {
                return true;
            }
            let token = op.generic.pending_transfer.expect("BcastGet non-root always issues a get");
            if !engine.transport().try_sync_nb(token) {
                return false;
            }
            let bytes = op.generic.scratch.take().unwrap();
            write_target(engine, &dst, &bytes);
            true
        }
        Algorithm::BcastPut => {
            if !is_root {
                return true;
            }
            op.generic.pending_tokens.retain(|t| !engine.transport().try_sync_nb(*t));
            op.generic.pending_tokens.is_empty()
        }
        Algorithm::BcastEager => {
            if is_root {
                return true;
            }
            let record = op.generic.p2p.as_ref().unwrap();
            if !record.states_ready(0, 1, 1) {
                return false;
            }
            let mut bytes = vec![0u8; nbytes];
            record.copy_out(0, nbytes, 1, &mut bytes);
            write_target(engine, &dst, &bytes);
            true
        }
        Algorithm::BcastRvGet => {
            if is_root {
                return true;
            }
            let record = op.generic.p2p.as_ref().unwrap();
            if op.generic.scratch.is_none() {
                if !record.states_ready(0, 1, 1) {
                    return false;
                }
                let mut addr_bytes = vec![0u8; std::mem::size_of::<usize>()];
                record.copy_out(0, std::mem::size_of::<usize>(), 1, &mut addr_bytes);
                let src_addr = usize::from_ne_bytes(addr_bytes.try_into().unwrap());
                let root_node = engine.topology().node_of_image(root);
                let mut buf = vec![0u8; nbytes];
                let token = engine.transport().nb_get_bulk(&mut buf, root_node, src_addr);
                op.generic.scratch = Some(buf);
                op.generic.pending_transfer = Some(token);
                return false;
            }
            let token = op.generic.pending_transfer.expect("scratch set implies a get was issued");
            if !engine.transport().try_sync_nb(token) {
                return false;
            }
            let bytes = op.generic.scratch.take().unwrap();
            write_target(engine, &dst, &bytes);
            true
        }
        Algorithm::BcastTreePut(_) | Algorithm::BcastTreeEager(_) => {
            tree_push_forward(op, engine, nbytes, |op, engine, child_node, bytes| match op.algorithm {
                Algorithm::BcastTreePut(_) => {
                    let dst_addr = match &dst {
                        Target::Single(a) => a.0,
                        Target::PerImage(_) => unreachable!(),
                    };
                    engine.p2p().signalling_put(child_node, dst_addr, bytes, 0, 1);
                }
                Algorithm::BcastTreeEager(_) => {
                    engine.p2p().eager_put_m(child_node, op.team_id, op.sequence, bytes, 1, bytes.len(), 0, 1);
                }
                _ => unreachable!(),
            })
        }
        Algorithm::BcastTreeGet(_) => tree_get_forward(op, engine, &dst, nbytes),
        _ => unreachable!("non-broadcast algorithm in broadcast::transfer_ready"),
    }
}

/// Shared tail of TreePut/TreeEager: once the payload has arrived (root: immediately; everyone
/// else: once its own P2P record reports state-ready), push it on to every child exactly once.
fn tree_push_forward(
    op: &mut OpRecord,
    engine: &Engine,
    nbytes: usize,
    push: impl Fn(&OpRecord, &Engine, u32, &[u8]),
) -> bool {
    let root = match &op.generic.args {
        CollArgs::Broadcast { root, .. } => *root,
        _ => unreachable!(),
    };
    let my_image = engine.topology().my_image();
    if my_image != root {
        let record = op.generic.p2p.as_ref().unwrap();
        if !record.states_ready(0, 1, 1) {
            return false;
        }
    }
    if op.generic.tree_child_cursor == 0 {
        let bytes = match &op.generic.args {
            CollArgs::Broadcast { dst, .. } => match dst {
                Target::Single(a) => {
                    if my_image == root {
                        engine.transport().local_read(a.0, nbytes)
                    } else {
                        let record = op.generic.p2p.as_ref().unwrap();
                        let mut out = vec![0u8; nbytes];
                        record.copy_out(0, nbytes, 1, &mut out);
                        engine.transport().local_write(a.0, &out);
                        out
                    }
                }
                Target::PerImage(_) => unreachable!("tree broadcast only supports SINGLE dst"),
            },
            _ => unreachable!(),
        };
        let children = op.generic.tree.as_ref().unwrap().geometry.children.clone();
        for &child in &children {
            let child_node = engine.topology().node_of_image(child);
            push(op, engine, child_node, &bytes);
        }
        op.generic.tree_child_cursor = 1;
    }
    true
}

/// Tail of TreeGet: each non-leaf node, once it has pulled from its parent, republishes its own
/// destination address to its children and waits for nothing further (the ack in "rendezvous then
/// get with ack" is the child's own completion, observed by the parent only via the OUT barrier).
fn tree_get_forward(op: &mut OpRecord, engine: &Engine, dst: &Target, nbytes: usize) -> bool {
    let root = match &op.generic.args {
        CollArgs::Broadcast { root, .. } => *root,
        _ => unreachable!(),
    };
    let my_image = engine.topology().my_image();
    if my_image == root {
        return true;
    }
    if op.generic.scratch.is_none() && op.generic.pending_transfer.is_none() {
        let record = op.generic.p2p.as_ref().unwrap();
        if !record.states_ready(0, 1, 1) {
            return false;
        }
        let mut addr_bytes = vec![0u8; std::mem::size_of::<usize>()];
        record.copy_out(0, std::mem::size_of::<usize>(), 1, &mut addr_bytes);
        let parent_addr = usize::from_ne_bytes(addr_bytes.try_into().unwrap());
        let parent_node = engine.topology().node_of_image(
            op.generic.tree.as_ref().unwrap().geometry.parent.expect("non-root always has a parent"),
        );
        let mut buf = vec![0u8; nbytes];
        let token = engine.transport().nb_get_bulk(&mut buf, parent_node, parent_addr);
        op.generic.scratch = Some(buf);
        op.generic.pending_transfer = Some(token);
        return false;
    }
    if let Some(token) = op.generic.pending_transfer {
        if !engine.transport().try_sync_nb(token) {
            return false;
        }
        let bytes = op.generic.scratch.take().unwrap();
        write_target(engine, dst, &bytes);
        op.generic.pending_transfer = None;
        if op.generic.tree_child_cursor == 0 {
            let dst_addr = match dst {
                Target::Single(a) => a.0,
                Target::PerImage(_) => unreachable!("tree broadcast only supports SINGLE dst"),
            };
            for &child in &op.generic.tree.as_ref().unwrap().geometry.children {
                let child_node = engine.topology().node_of_image(child);
                engine.p2p().eager_addr(child_node, op.team_id, op.sequence, dst_addr, 0, 1);
            }
            op.generic.tree_child_cursor = 1;
        }
    }
    true
}
