//! Scatter algorithm variants (§4.7): Get, Put, Eager, RvGet.
//!
//! Put/Get/Eager assume a `SINGLE` destination (the same numeric address on every participant);
//! the per-image destination-list ("M") variants are `LOCAL`, so the address itself has to be
//! exchanged first — that's exactly what RvGet (root broadcasts its source address, everyone else
//! gets their slice) is for.

use crate::engine::Engine;
use crate::op::{Addr, Algorithm, CollArgs, OpRecord, State, Target};

use super::{check_in_barrier, check_out_barrier, cleanup, write_target, PollResult};

fn unpack(op: &OpRecord) -> (u32, Target, usize, usize) {
    match &op.generic.args {
        CollArgs::Scatter { root, dst, src, nbytes_per_image } => (*root, dst.clone(), src.0, *nbytes_per_image),
        _ => unreachable!("scatter poll function given a non-scatter op"),
    }
}

/// This node's local (image id, destination address) pairs, in image order.
fn my_local_targets(engine: &Engine, dst: &Target) -> Vec<(u32, Addr)> {
    match dst {
        Target::Single(a) => vec![(engine.topology().my_image(), *a)],
        Target::PerImage(addrs) => {
            let first = engine.topology().first_image_of(engine.transport().my_node());
            addrs.iter().enumerate().map(|(i, a)| (first + i as u32, *a)).collect()
        }
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
    let (root, dst, src_addr, nbpi) = unpack(op);
    let my_image = engine.topology().my_image();
    let is_root = my_image == root;

    match op.algorithm {
        Algorithm::ScatterGet => {
            if is_root {
                for (image, addr) in my_local_targets(engine, &dst) {
                    let bytes = engine.transport().local_read(src_addr + image as usize * nbpi, nbpi);
                    engine.transport().local_write(addr.0, &bytes);
                }
            } else {
                let root_node = engine.topology().node_of_image(root);
                let (image, _addr) = my_local_targets(engine, &dst)[0];
                let mut buf = vec![0u8; nbpi];
                let token = engine.transport().nb_get_bulk(&mut buf, root_node, src_addr + image as usize * nbpi);
                op.generic.scratch = Some(buf);
                op.generic.pending_transfer = Some(token);
            }
        }
        Algorithm::ScatterPut => {
            if is_root {
                let my_node = engine.transport().my_node();
                for node in 0..engine.transport().node_count() {
                    let slice = engine.transport().local_read(src_addr + node as usize * nbpi, nbpi);
                    if node == my_node {
                        write_target(engine, &dst, &slice);
                        continue;
                    }
                    let dst_addr = match &dst {
                        Target::Single(a) => a.0,
                        Target::PerImage(_) => unreachable!("ScatterPut only selected for SINGLE"),
                    };
                    let token = engine.transport().nb_put_bulk(node, dst_addr, &slice);
                    op.generic.pending_tokens.push(token);
                }
            }
        }
        Algorithm::ScatterEager => {
            let record = engine.p2p().get(op.team_id, op.sequence);
            op.generic.p2p = Some(record);
            op.generic.needs_p2p = true;
            if is_root {
                let my_node = engine.transport().my_node();
                for node in 0..engine.transport().node_count() {
                    let slice = engine.transport().local_read(src_addr + node as usize * nbpi, nbpi);
                    if node == my_node {
                        write_target(engine, &dst, &slice);
                        continue;
                    }
                    engine.p2p().eager_put_m(node, op.team_id, op.sequence, &slice, 1, nbpi, 0, 1);
                }
            }
        }
        Algorithm::ScatterRvGet => {
            let record = engine.p2p().get(op.team_id, op.sequence);
            op.generic.p2p = Some(record);
            op.generic.needs_p2p = true;
            if is_root {
                engine.p2p().eager_addr_all(op.team_id, op.sequence, engine.transport().node_count(), src_addr, 0, 1);
                for (image, addr) in my_local_targets(engine, &dst) {
                    let bytes = engine.transport().local_read(src_addr + image as usize * nbpi, nbpi);
                    engine.transport().local_write(addr.0, &bytes);
                }
            }
        }
        _ => unreachable!("non-scatter algorithm in scatter::initiate"),
    }
}

fn transfer_ready(op: &mut OpRecord, engine: &Engine) -> bool {
    let (root, dst, _src_addr, nbpi) = unpack(op);
    let my_image = engine.topology().my_image();
    let is_root = my_image == root;

    match op.algorithm {
        Algorithm::ScatterGet => {
            if is_root {
                return true;
            }
            let token = op.generic.pending_transfer.expect("non-root ScatterGet always issues a get");
            if !engine.transport().try_sync_nb(token) {
                return false;
            }
            let bytes = op.generic.scratch.take().unwrap();
            write_target(engine, &dst, &bytes);
            true
        }
        Algorithm::ScatterPut => {
            if !is_root {
                return true;
            }
            op.generic.pending_tokens.retain(|t| !engine.transport().try_sync_nb(*t));
            op.generic.pending_tokens.is_empty()
        }
        Algorithm::ScatterEager => {
            if is_root {
                return true;
            }
            let record = op.generic.p2p.as_ref().unwrap();
            if !record.states_ready(0, 1, 1) {
                return false;
            }
            let mut bytes = vec![0u8; nbpi];
            record.copy_out(0, nbpi, 1, &mut bytes);
            write_target(engine, &dst, &bytes);
            true
        }
        Algorithm::ScatterRvGet => {
            if is_root {
                return true;
            }
            let record = op.generic.p2p.as_ref().unwrap();
            if op.generic.scratch.is_none() && op.generic.pending_transfer.is_none() {
                if !record.states_ready(0, 1, 1) {
                    return false;
                }
                let mut addr_bytes = vec![0u8; std::mem::size_of::<usize>()];
                record.copy_out(0, std::mem::size_of::<usize>(), 1, &mut addr_bytes);
                let base_addr = usize::from_ne_bytes(addr_bytes.try_into().unwrap());
                let root_node = engine.topology().node_of_image(root);
                let (image, _) = my_local_targets(engine, &dst)[0];
                let mut buf = vec![0u8; nbpi];
                let token = engine.transport().nb_get_bulk(&mut buf, root_node, base_addr + image as usize * nbpi);
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
        _ => unreachable!("non-scatter algorithm in scatter::transfer_ready"),
    }
}
