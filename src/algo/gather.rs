//! Gather algorithm variants (§4.7): Get, Put, Eager, RvPut.
//!
//! Get/Put/Eager assume a `SINGLE` source (the same numeric address on every participant); the
//! per-image source-list ("M") variant is `LOCAL`, handled by RvPut: the root publishes its
//! destination address and every other image puts its slice directly.

use crate::engine::Engine;
use crate::op::{Addr, Algorithm, CollArgs, OpRecord, State, Target};

use super::{check_in_barrier, check_out_barrier, cleanup, PollResult};

fn unpack(op: &OpRecord) -> (u32, usize, Target, usize) {
    match &op.generic.args {
        CollArgs::Gather { root, dst, src, nbytes_per_image } => (*root, dst.0, src.clone(), *nbytes_per_image),
        _ => unreachable!("gather poll function given a non-gather op"),
    }
}

/// This node's local (image id, source address) pairs, in image order.
fn my_local_sources(engine: &Engine, src: &Target) -> Vec<(u32, Addr)> {
    match src {
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
    let (root, dst_addr, src, nbpi) = unpack(op);
    let my_image = engine.topology().my_image();
    let is_root = my_image == root;

    match op.algorithm {
        Algorithm::GatherGet => {
            if is_root {
                // Every non-root slot is pulled; the root's own slice is applied locally.
                for (image, addr) in my_local_sources(engine, &src) {
                    let bytes = engine.transport().local_read(addr.0, nbpi);
                    engine.transport().local_write(dst_addr + image as usize * nbpi, &bytes);
                }
                let my_node = engine.transport().my_node();
                for node in 0..engine.transport().node_count() {
                    if node == my_node {
                        continue;
                    }
                    let src_addr = match &src {
                        Target::Single(a) => a.0,
                        Target::PerImage(_) => unreachable!("GatherGet only selected for SINGLE"),
                    };
                    let mut buf = vec![0u8; nbpi];
                    let token = engine.transport().nb_get_bulk(&mut buf, node, src_addr);
                    op.generic.pending_gathers.push((token, node, buf));
                }
            }
        }
        Algorithm::GatherPut => {
            if !is_root {
                let root_node = engine.topology().node_of_image(root);
                for (image, addr) in my_local_sources(engine, &src) {
                    let bytes = engine.transport().local_read(addr.0, nbpi);
                    let token = engine.transport().nb_put_bulk(root_node, dst_addr + image as usize * nbpi, &bytes);
                    op.generic.pending_tokens.push(token);
                }
            } else {
                for (image, addr) in my_local_sources(engine, &src) {
                    let bytes = engine.transport().local_read(addr.0, nbpi);
                    engine.transport().local_write(dst_addr + image as usize * nbpi, &bytes);
                }
            }
        }
        Algorithm::GatherEager => {
            let record = engine.p2p().get(op.team_id, op.sequence);
            op.generic.p2p = Some(record);
            op.generic.needs_p2p = true;
            if !is_root {
                let root_node = engine.topology().node_of_image(root);
                for (image, addr) in my_local_sources(engine, &src) {
                    let bytes = engine.transport().local_read(addr.0, nbpi);
                    engine.p2p().eager_put_m(root_node, op.team_id, op.sequence, &bytes, 1, nbpi, image, 1);
                }
            } else {
                for (image, addr) in my_local_sources(engine, &src) {
                    let bytes = engine.transport().local_read(addr.0, nbpi);
                    engine.transport().local_write(dst_addr + image as usize * nbpi, &bytes);
                }
            }
        }
        Algorithm::GatherRvPut => {
            let record = engine.p2p().get(op.team_id, op.sequence);
            op.generic.p2p = Some(record);
            op.generic.needs_p2p = true;
            if is_root {
                engine
                    .p2p()
                    .eager_addr_all(op.team_id, op.sequence, engine.transport().node_count(), dst_addr, 0, 1);
                for (image, addr) in my_local_sources(engine, &src) {
                    let bytes = engine.transport().local_read(addr.0, nbpi);
                    engine.transport().local_write(dst_addr + image as usize * nbpi, &bytes);
                }
            }
        }
        _ => unreachable!("non-gather algorithm in gather::initiate"),
    }
}

fn transfer_ready(op: &mut OpRecord, engine: &Engine) -> bool {
    let (root, dst_addr, src, nbpi) = unpack(op);
    let my_image = engine.topology().my_image();
    let is_root = my_image == root;

    match op.algorithm {
        Algorithm::GatherGet => {
            if !is_root {
                return true;
            }
            let mut i = 0;
            while i < op.generic.pending_gathers.len() {
                let token = op.generic.pending_gathers[i].0;
                if engine.transport().try_sync_nb(token) {
                    let (_, node, buf) = op.generic.pending_gathers.remove(i);
                    let image = engine.topology().first_image_of(node);
                    engine.transport().local_write(dst_addr + image as usize * nbpi, &buf);
                } else {
                    i += 1;
                }
            }
            op.generic.pending_gathers.is_empty()
        }
        Algorithm::GatherPut => {
            if is_root {
                return true;
            }
            op.generic.pending_tokens.retain(|t| !engine.transport().try_sync_nb(*t));
            op.generic.pending_tokens.is_empty()
        }
        Algorithm::GatherEager => {
            if !is_root {
                return true;
            }
            let record = op.generic.p2p.as_ref().unwrap();
            let node_count = engine.transport().node_count();
            let my_node = engine.transport().my_node();
            for node in 0..node_count {
                if node == my_node {
                    continue;
                }
                let image = engine.topology().first_image_of(node);
                let count = engine.topology().image_count_of(node);
                if !record.states_ready(image, count, 1) {
                    return false;
                }
            }
            for node in 0..node_count {
                if node == my_node {
                    continue;
                }
                let image = engine.topology().first_image_of(node);
                let count = engine.topology().image_count_of(node);
                let mut bytes = vec![0u8; nbpi * count as usize];
                record.copy_out(image as usize, nbpi, count as usize, &mut bytes);
                engine.transport().local_write(dst_addr + image as usize * nbpi, &bytes);
            }
            true
        }
        Algorithm::GatherRvPut => {
            if is_root {
                return true;
            }
            if op.generic.scratch.is_none() {
                let record = op.generic.p2p.as_ref().unwrap();
                if !record.states_ready(0, 1, 1) {
                    return false;
                }
                let mut addr_bytes = vec![0u8; std::mem::size_of::<usize>()];
                record.copy_out(0, std::mem::size_of::<usize>(), 1, &mut addr_bytes);
                let root_dst_addr = usize::from_ne_bytes(addr_bytes.try_into().unwrap());
                let root_node = engine.topology().node_of_image(root);
                for (image, addr) in my_local_sources(engine, &src) {
                    let bytes = engine.transport().local_read(addr.0, nbpi);
                    let token =
                        engine.transport().nb_put_bulk(root_node, root_dst_addr + image as usize * nbpi, &bytes);
                    op.generic.pending_tokens.push(token);
                }
                op.generic.scratch = Some(Vec::new());
            }
            op.generic.pending_tokens.retain(|t| !engine.transport().try_sync_nb(*t));
            op.generic.pending_tokens.is_empty()
        }
        _ => unreachable!("non-gather algorithm in gather::transfer_ready"),
    }
}
