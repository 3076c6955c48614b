//! End-to-end scenarios against [`collio::testing::LoopbackCluster`].

use std::thread;

use collio::testing::LoopbackCluster;
use collio::{dispatch, Addr, CollFlags, Engine, Target, ThreadContext};

fn node_engine(cluster: &LoopbackCluster, node: u32, image_counts: &[u32]) -> Engine {
    Engine::new(cluster.node(node), image_counts, node)
}

/// S1: broadcast, 4 nodes, 1 image each, SINGLE/IN_NOSYNC/OUT_ALLSYNC, 8 bytes.
#[test]
fn s1_broadcast_four_nodes_out_allsync() {
    const PATTERN: [u8; 8] = [0xDE, 0xAD, 0xBE, 0xEF, 0x12, 0x34, 0x56, 0x78];
    let cluster = LoopbackCluster::new(4);
    let image_counts = [1u32; 4];
    let root: u32 = 2;

    let handles: Vec<_> = (0..4u32)
        .map(|node| {
            let cluster = cluster.clone();
            let image_counts = image_counts;
            thread::spawn(move || {
                let engine = node_engine(&cluster, node, &image_counts);
                let mut ctx = ThreadContext::new();
                let flags = CollFlags::SINGLE | CollFlags::IN_NOSYNC | CollFlags::OUT_ALLSYNC;
                if node == root {
                    engine.transport().local_write(1000, &PATTERN);
                }
                dispatch::broadcast(&engine, &mut ctx, 0, Target::Single(Addr(2000)), root, Addr(1000), 8, flags);
                let out = engine.transport().local_read(2000, 8);
                assert_eq!(out, PATTERN, "node {node} did not receive the broadcast pattern");
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// S2: scatter, 3 nodes, 1 image each, SINGLE/IN_ALLSYNC/OUT_MYSYNC, 4 bytes per image.
#[test]
fn s2_scatter_three_nodes() {
    const SOURCE: [u8; 12] = [0x00, 0x01, 0x02, 0x03, 0x10, 0x11, 0x12, 0x13, 0x20, 0x21, 0x22, 0x23];
    let cluster = LoopbackCluster::new(3);
    let image_counts = [1u32; 3];
    let root: u32 = 0;

    let handles: Vec<_> = (0..3u32)
        .map(|node| {
            let cluster = cluster.clone();
            let image_counts = image_counts;
            thread::spawn(move || {
                let engine = node_engine(&cluster, node, &image_counts);
                let mut ctx = ThreadContext::new();
                let flags = CollFlags::SINGLE | CollFlags::IN_ALLSYNC | CollFlags::OUT_MYSYNC;
                if node == root {
                    engine.transport().local_write(3000, &SOURCE);
                }
                dispatch::scatter(&engine, &mut ctx, 0, Target::Single(Addr(4000)), root, Addr(3000), 4, flags);
                let out = engine.transport().local_read(4000, 4);
                let expect = &SOURCE[4 * node as usize..4 * node as usize + 4];
                assert_eq!(out, expect, "node {node} got the wrong slice");
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// S3: gather, 4 nodes, Eager (2 bytes per image, well under `EAGER_MIN`).
#[test]
fn s3_gather_four_nodes_eager() {
    let cluster = LoopbackCluster::new(4);
    let image_counts = [1u32; 4];
    let root: u32 = 3;

    let handles: Vec<_> = (0..4u32)
        .map(|node| {
            let cluster = cluster.clone();
            let image_counts = image_counts;
            thread::spawn(move || {
                let engine = node_engine(&cluster, node, &image_counts);
                let mut ctx = ThreadContext::new();
                // MYSYNC (rather than ALLSYNC) keeps `my_sync_or_local` true so the dispatcher
                // picks Eager for this small a payload, per S3's explicit "Eager variant".
                let flags = CollFlags::SINGLE | CollFlags::IN_MYSYNC | CollFlags::OUT_MYSYNC;
                let contribution = [node as u8 * 0x10, node as u8 * 0x10 + 1];
                engine.transport().local_write(5000, &contribution);
                dispatch::gather(&engine, &mut ctx, 0, Addr(6000), root, Target::Single(Addr(5000)), 2, flags);
                if node == root {
                    let out = engine.transport().local_read(6000, 8);
                    let expect: Vec<u8> = (0..4u32).flat_map(|i| [i as u8 * 0x10, i as u8 * 0x10 + 1]).collect();
                    assert_eq!(out, expect);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// S4: three AGGREGATE-flagged broadcasts followed by a plain one; only the final submission
/// yields a handle, and that handle only completes once all four have.
#[test]
fn s4_aggregate_broadcast_batch() {
    let net = LoopbackCluster::new(1).node(0);
    let engine = Engine::new(net, &[1], 0);
    let mut ctx = ThreadContext::new();
    let flags = CollFlags::SINGLE | CollFlags::IN_NOSYNC | CollFlags::OUT_NOSYNC;
    let agg_flags = flags | CollFlags::AGGREGATE;

    engine.transport().local_write(10, b"AAAA");
    let h1 = dispatch::broadcast_nb(&engine, &mut ctx, 0, Target::Single(Addr(110)), 0, Addr(10), 4, agg_flags);
    assert!(h1.is_none(), "AGGREGATE member must not surface a handle");

    engine.transport().local_write(20, b"BBBB");
    let h2 = dispatch::broadcast_nb(&engine, &mut ctx, 0, Target::Single(Addr(120)), 0, Addr(20), 4, agg_flags);
    assert!(h2.is_none());

    engine.transport().local_write(30, b"CCCC");
    let h3 = dispatch::broadcast_nb(&engine, &mut ctx, 0, Target::Single(Addr(130)), 0, Addr(30), 4, agg_flags);
    assert!(h3.is_none());

    engine.transport().local_write(40, b"DDDD");
    let h4 = dispatch::broadcast_nb(&engine, &mut ctx, 0, Target::Single(Addr(140)), 0, Addr(40), 4, flags)
        .expect("the closing non-AGGREGATE submission always yields the container handle");

    collio::wait_sync(&mut ctx, &engine, h4);

    assert_eq!(engine.transport().local_read(110, 4), b"AAAA");
    assert_eq!(engine.transport().local_read(120, 4), b"BBBB");
    assert_eq!(engine.transport().local_read(130, 4), b"CCCC");
    assert_eq!(engine.transport().local_read(140, 4), b"DDDD");
}

/// Regression test: a racing `poll()` between two `AGGREGATE` submissions used to silently drop
/// the first member's completion (its `aggregate_id` was still `None` at that point, since the
/// container is only created by the closing, non-`AGGREGATE` submission), which left the
/// container's `remaining` count stuck above zero and hung `wait_sync` on its handle forever.
#[test]
fn aggregate_batch_survives_a_poll_between_submissions() {
    let net = LoopbackCluster::new(1).node(0);
    let engine = Engine::new(net, &[1], 0);
    let mut ctx = ThreadContext::new();
    let flags = CollFlags::SINGLE | CollFlags::IN_NOSYNC | CollFlags::OUT_NOSYNC;
    let agg_flags = flags | CollFlags::AGGREGATE;

    engine.transport().local_write(210, b"WWWW");
    let h1 = dispatch::broadcast_nb(&engine, &mut ctx, 0, Target::Single(Addr(310)), 0, Addr(210), 4, agg_flags);
    assert!(h1.is_none(), "AGGREGATE member must not surface a handle");

    // A thread racing this batch's construction polls here, before any container exists yet.
    engine.poll();

    engine.transport().local_write(220, b"XXXX");
    let h2 = dispatch::broadcast_nb(&engine, &mut ctx, 0, Target::Single(Addr(320)), 0, Addr(220), 4, agg_flags);
    assert!(h2.is_none());

    engine.transport().local_write(230, b"YYYY");
    let h3 = dispatch::broadcast_nb(&engine, &mut ctx, 0, Target::Single(Addr(330)), 0, Addr(230), 4, flags)
        .expect("the closing non-AGGREGATE submission always yields the container handle");

    collio::wait_sync(&mut ctx, &engine, h3);

    assert_eq!(engine.transport().local_read(310, 4), b"WWWW");
    assert_eq!(engine.transport().local_read(320, 4), b"XXXX");
    assert_eq!(engine.transport().local_read(330, 4), b"YYYY");
}

/// Regression test: a `LOCAL`/`PerImage` broadcast destination with `DST_IN_SEGMENT` hinted (but
/// not the source) used to select `BcastPut`, which assumed a single shared destination address
/// and panicked on a `PerImage` target instead of completing.
#[test]
fn broadcast_per_image_destination_does_not_panic() {
    let cluster = LoopbackCluster::new(2);
    let image_counts = [1u32; 2];
    let root: u32 = 0;

    let handles: Vec<_> = (0..2u32)
        .map(|node| {
            let cluster = cluster.clone();
            let image_counts = image_counts;
            thread::spawn(move || {
                let engine = node_engine(&cluster, node, &image_counts);
                let mut ctx = ThreadContext::new();
                let flags = CollFlags::LOCAL | CollFlags::IN_NOSYNC | CollFlags::OUT_NOSYNC | CollFlags::DST_IN_SEGMENT;
                if node == root {
                    engine.transport().local_write(9000, b"ZZZZ");
                }
                dispatch::broadcast(&engine, &mut ctx, 0, Target::PerImage(vec![Addr(9100)]), root, Addr(9000), 4, flags);
                let out = engine.transport().local_read(9100, 4);
                assert_eq!(out, b"ZZZZ", "node {node} did not receive the broadcast pattern");
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// `gather_all_m`/`exchange_m`: the per-image-source entry points, exercised with a `PerImage`
/// source list (one address per locally-hosted image, here one image per node).
#[test]
fn gather_all_m_four_nodes() {
    let cluster = LoopbackCluster::new(4);
    let image_counts = [1u32; 4];

    let handles: Vec<_> = (0..4u32)
        .map(|node| {
            let cluster = cluster.clone();
            let image_counts = image_counts;
            thread::spawn(move || {
                let engine = node_engine(&cluster, node, &image_counts);
                let mut ctx = ThreadContext::new();
                let flags = CollFlags::SINGLE | CollFlags::IN_ALLSYNC | CollFlags::OUT_ALLSYNC;
                let contribution = [node as u8, node as u8 + 1];
                engine.transport().local_write(11000, &contribution);
                dispatch::gather_all_m(&engine, &mut ctx, 0, Addr(12000), Target::Single(Addr(11000)), 2, flags);
                let out = engine.transport().local_read(12000, 8);
                let expect: Vec<u8> = (0..4u32).flat_map(|i| [i as u8, i as u8 + 1]).collect();
                assert_eq!(out, expect, "node {node} gather_all_m result mismatch");
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// S6: three processes each create three consensus tokens t0..t2 and drive them to completion;
/// on every process the OK-observations are ordered t0 < t1 < t2.
#[test]
fn s6_consensus_tokens_observed_in_creation_order() {
    let cluster = LoopbackCluster::new(3);
    let handles: Vec<_> = (0..3u32)
        .map(|node| {
            let cluster = cluster.clone();
            thread::spawn(move || {
                let engine = Engine::new(cluster.node(node), &[1, 1, 1], node);
                let t0 = engine.consensus().create();
                let t1 = engine.consensus().create();
                let t2 = engine.consensus().create();
                engine.consensus().wait_token(t0);
                engine.consensus().wait_token(t1);
                engine.consensus().wait_token(t2);
                assert!(engine.consensus().try_token(t0));
                assert!(engine.consensus().try_token(t1));
                assert!(engine.consensus().try_token(t2));
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// Exchange: every rank's distinct slice lands at every other rank's matching slot.
#[test]
fn exchange_all_to_all_four_nodes() {
    let cluster = LoopbackCluster::new(4);
    let image_counts = [1u32; 4];

    let handles: Vec<_> = (0..4u32)
        .map(|node| {
            let cluster = cluster.clone();
            let image_counts = image_counts;
            thread::spawn(move || {
                let engine = node_engine(&cluster, node, &image_counts);
                let mut ctx = ThreadContext::new();
                let flags = CollFlags::SINGLE | CollFlags::IN_ALLSYNC | CollFlags::OUT_ALLSYNC;
                // node's src buffer holds one 2-byte slice per destination rank: [node,dst].
                let src: Vec<u8> = (0..4u32).flat_map(|dst| [node as u8, dst as u8]).collect();
                engine.transport().local_write(7000, &src);
                dispatch::exchange(&engine, &mut ctx, 0, Addr(8000), Addr(7000), 2, flags);
                let got = engine.transport().local_read(8000, 8);
                let expect: Vec<u8> = (0..4u32).flat_map(|src_rank| [src_rank as u8, node as u8]).collect();
                assert_eq!(got, expect, "node {node} exchange result mismatch");
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// `exchange_m` with a `PerImage` source: same slice layout as [`exchange_all_to_all_four_nodes`]
/// but threaded through the per-image entry point instead of the single-address one.
#[test]
fn exchange_m_per_image_four_nodes() {
    let cluster = LoopbackCluster::new(4);
    let image_counts = [1u32; 4];

    let handles: Vec<_> = (0..4u32)
        .map(|node| {
            let cluster = cluster.clone();
            let image_counts = image_counts;
            thread::spawn(move || {
                let engine = node_engine(&cluster, node, &image_counts);
                let mut ctx = ThreadContext::new();
                let flags = CollFlags::SINGLE | CollFlags::IN_ALLSYNC | CollFlags::OUT_ALLSYNC;
                let src: Vec<u8> = (0..4u32).flat_map(|dst| [node as u8, dst as u8]).collect();
                engine.transport().local_write(7500, &src);
                dispatch::exchange_m(&engine, &mut ctx, 0, Addr(8500), Target::PerImage(vec![Addr(7500)]), 2, flags);
                let got = engine.transport().local_read(8500, 8);
                let expect: Vec<u8> = (0..4u32).flat_map(|src_rank| [src_rank as u8, node as u8]).collect();
                assert_eq!(got, expect, "node {node} exchange_m result mismatch");
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
