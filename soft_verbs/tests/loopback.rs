// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Two emulated devices in one process, wired back to back.

use std::time::{Duration, Instant};

use soft_verbs::*;

struct Side {
    ctx: Context,
    pd: ProtectionDomain,
    cq: CompletionQueue,
    buf: PinnedBuffer,
    mr: MemoryRegion,
    qp: QueuePair,
}

fn caps() -> QpCaps {
    QpCaps {
        max_send_wr: 8,
        max_recv_wr: 8,
        max_send_sge: 1,
        max_recv_sge: 1,
    }
}

fn side(buf_len: usize) -> Side {
    let ctx = Context::open().unwrap();
    let pd = ctx.alloc_pd();
    let cq = ctx.create_cq(8);
    let buf = PinnedBuffer::alloc(buf_len).unwrap();
    // SAFETY: `buf` lives in the same struct as the region and the queue
    // pair, and the struct is dropped as a whole after the test's traffic.
    let mr = unsafe { pd.register_region(&buf, Access::full()) }.unwrap();
    let qp = pd.create_qp(&cq, caps()).unwrap();
    qp.modify_to_init().unwrap();

    Side {
        ctx,
        pd,
        cq,
        buf,
        mr,
        qp,
    }
}

fn connect(a: &Side, b: &Side) {
    let loopback = "127.0.0.1".parse().unwrap();

    for (me, peer) in [(a, b), (b, a)] {
        me.qp
            .modify_to_rtr(RemoteEndpoint {
                qpn: peer.qp.qpn(),
                lid: peer.ctx.lid(),
                gid: Gid::from_ip(loopback),
                mtu: Mtu::Mtu1024,
                min_rnr_timer: 12,
            })
            .unwrap();
        me.qp
            .modify_to_rts(RtsParams {
                psn: 0,
                retry_count: 7,
                rnr_retry: 7,
            })
            .unwrap();
    }
}

fn poll_until(cq: &CompletionQueue, deadline: Duration) -> Completion {
    let start = Instant::now();
    loop {
        if let Some(c) = cq.poll() {
            return c;
        }
        assert!(start.elapsed() < deadline, "no completion before deadline");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn write_with_immediate_lands_in_registered_region() {
    let mut a = side(64);
    let b = side(64);
    connect(&a, &b);

    a.buf.as_mut_slice().copy_from_slice(&[0x5a; 64]);

    b.qp.post_receive_empty().unwrap();
    a.qp
        .post_write_with_imm(&a.mr, 0, 64, b.mr.base_addr(), b.mr.rkey(), u32::to_be(3))
        .unwrap();

    match poll_until(&a.cq, Duration::from_secs(5)).kind {
        CompletionKind::WriteCompleted => {}
        other => panic!("expected local write completion, got {other:?}"),
    }

    match poll_until(&b.cq, Duration::from_secs(5)).kind {
        CompletionKind::ReceiveWithImmediate { imm, len } => {
            assert_eq!(u32::from_be(imm), 3);
            assert_eq!(len, 64);
        }
        other => panic!("expected receive with immediate, got {other:?}"),
    }

    assert_eq!(b.buf.as_slice(), &[0x5a; 64]);
}

#[test]
fn write_is_deferred_until_a_receive_is_posted() {
    let mut a = side(32);
    let b = side(32);
    connect(&a, &b);

    a.buf.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
    a.qp
        .post_write_with_imm(&a.mr, 0, 4, b.mr.base_addr(), b.mr.rkey(), 0)
        .unwrap();

    // Receiver not ready: nothing may land while no receive is posted.
    for _ in 0..50 {
        assert!(b.cq.poll().is_none());
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(&b.buf.as_slice()[..4], &[0, 0, 0, 0]);

    b.qp.post_receive_empty().unwrap();
    match poll_until(&b.cq, Duration::from_secs(5)).kind {
        CompletionKind::ReceiveWithImmediate { len, .. } => assert_eq!(len, 4),
        other => panic!("expected receive with immediate, got {other:?}"),
    }
    assert_eq!(&b.buf.as_slice()[..4], &[1, 2, 3, 4]);
}

#[test]
fn write_with_wrong_key_kills_the_pair() {
    let a = side(32);
    let b = side(32);
    connect(&a, &b);

    b.qp.post_receive_empty().unwrap();
    a.qp
        .post_write_with_imm(&a.mr, 0, 4, b.mr.base_addr(), b.mr.rkey() + 1000, 0)
        .unwrap();

    match poll_until(&b.cq, Duration::from_secs(5)).kind {
        CompletionKind::Error(CompletionStatus::RemoteAccessError) => {}
        other => panic!("expected remote access error, got {other:?}"),
    }
    assert_eq!(b.qp.state(), QpState::Error);
}

#[test]
fn two_sided_send_lands_in_posted_receive() {
    let mut a = side(32);
    let b = side(32);
    connect(&a, &b);

    a.buf.as_mut_slice()[..8].copy_from_slice(b"pingpong");
    b.qp.post_receive(&b.mr, 0, 8).unwrap();
    a.qp.post_send(&a.mr, 0, 8).unwrap();

    match poll_until(&b.cq, Duration::from_secs(5)).kind {
        CompletionKind::Receive { len } => assert_eq!(len, 8),
        other => panic!("expected receive completion, got {other:?}"),
    }
    assert_eq!(&b.buf.as_slice()[..8], b"pingpong");
}

#[test]
fn every_resource_is_released_on_teardown() {
    let stats = {
        let a = side(32);
        let b = side(32);
        connect(&a, &b);

        let stats = a.ctx.stats();
        let snap = stats.snapshot();
        assert_eq!(snap.pds, 1);
        assert_eq!(snap.cqs, 1);
        assert_eq!(snap.qps, 1);
        assert_eq!(snap.regions, 1);

        // Teardown in reverse construction order.
        let Side {
            ctx,
            pd,
            cq,
            buf,
            mr,
            qp,
        } = a;
        qp.to_error();
        drop(qp);
        drop(mr);
        drop(buf);
        drop(cq);
        drop(pd);
        drop(ctx);
        drop(b);

        stats
    };

    assert!(stats.snapshot().all_released());
}
