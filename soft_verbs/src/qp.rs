// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Reliable-connected queue pairs and their state machine.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use log::{debug, trace};

use crate::device::{self, Dev, Gid, MemoryRegion, ProtectionDomain, QpEntry};
use crate::wire::{self, Hello};
use crate::{CompletionQueue, Result, VerbsError};

/// Queue sizing limits, fixed at creation time. Only single-element
/// scatter-gather lists are supported.
#[derive(Clone, Copy, Debug)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// Path MTU carried in the transition to ReadyToReceive. The emulated data
/// plane does not segment, so this is bookkeeping only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mtu {
    Mtu256,
    Mtu512,
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

/// Where a transition to ReadyToReceive points the pair: the remote queue
/// pair's number and its device's identifiers.
#[derive(Clone, Copy, Debug)]
pub struct RemoteEndpoint {
    pub qpn: u32,
    pub lid: u16,
    pub gid: Gid,
    pub mtu: Mtu,
    pub min_rnr_timer: u8,
}

/// Parameters of the transition to ReadyToSend.
#[derive(Clone, Copy, Debug)]
pub struct RtsParams {
    pub psn: u32,
    pub retry_count: u8,
    pub rnr_retry: u8,
}

/// States of a reliable-connected pair. Transitions only go forward, except
/// into `Error`, which is terminal and reachable from anywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

pub struct QueuePair {
    dev: Dev,
    qpn: u32,
}

pub(crate) fn create(
    pd: &ProtectionDomain,
    cq: &CompletionQueue,
    caps: QpCaps,
) -> Result<QueuePair> {
    if caps.max_send_sge > 1 || caps.max_recv_sge > 1 {
        return Err(VerbsError::InvalidRequest(
            "only single-entry scatter-gather lists",
        ));
    }
    if caps.max_send_wr == 0 || caps.max_recv_wr == 0 {
        return Err(VerbsError::InvalidRequest("zero-depth work queue"));
    }

    let mut dev = pd.dev.borrow_mut();
    let qpn = dev.alloc_id();
    dev.qps.insert(
        qpn,
        QpEntry {
            qpn,
            pd: pd.id,
            cq: cq.id,
            caps,
            state: QpState::Reset,
            psn: 0,
            out: None,
            inc: None,
            inbuf: Vec::new(),
            recv_queue: std::collections::VecDeque::new(),
        },
    );
    device::stats_inc_qp(&dev);
    debug!(
        "created queue pair {qpn} (send depth {}, recv depth {})",
        caps.max_send_wr, caps.max_recv_wr
    );

    Ok(QueuePair {
        dev: std::rc::Rc::clone(&pd.dev),
        qpn,
    })
}

impl QueuePair {
    pub fn qpn(&self) -> u32 {
        self.qpn
    }

    pub fn state(&self) -> QpState {
        self.dev
            .borrow()
            .qps
            .get(&self.qpn)
            .map_or(QpState::Error, |qp| qp.state)
    }

    /// The send sequence number set by the transition to ReadyToSend.
    pub fn psn(&self) -> u32 {
        self.dev
            .borrow()
            .qps
            .get(&self.qpn)
            .map_or(0, |qp| qp.psn)
    }

    fn check_transition(&self, expect: QpState, to: QpState) -> Result<()> {
        let from = self.state();
        if from != expect {
            return Err(VerbsError::BadTransition { from, to });
        }
        Ok(())
    }

    pub fn modify_to_init(&self) -> Result<()> {
        self.check_transition(QpState::Reset, QpState::Init)?;
        if let Some(qp) = self.dev.borrow_mut().qps.get_mut(&self.qpn) {
            qp.state = QpState::Init;
        }
        trace!("qp {}: -> Init", self.qpn);
        Ok(())
    }

    /// Connect to the remote pair and become ready to receive. The dial
    /// happens here; inbound traffic is claimed lazily during polling.
    pub fn modify_to_rtr(&self, remote: RemoteEndpoint) -> Result<()> {
        self.check_transition(QpState::Init, QpState::ReadyToReceive)?;

        let addr = SocketAddr::new(remote.gid.ip(), remote.lid);
        let hello = Hello {
            src_qpn: self.qpn,
            dst_qpn: remote.qpn,
        };
        let stream = dial_data_plane(addr, hello)?;

        if let Some(qp) = self.dev.borrow_mut().qps.get_mut(&self.qpn) {
            qp.state = QpState::ReadyToReceive;
            qp.out = Some(stream);
        }
        debug!(
            "qp {}: -> ReadyToReceive (remote qp {} at {addr}, {:?}, min_rnr_timer {})",
            self.qpn, remote.qpn, remote.mtu, remote.min_rnr_timer
        );
        Ok(())
    }

    pub fn modify_to_rts(&self, params: RtsParams) -> Result<()> {
        self.check_transition(QpState::ReadyToReceive, QpState::ReadyToSend)?;
        if let Some(qp) = self.dev.borrow_mut().qps.get_mut(&self.qpn) {
            qp.state = QpState::ReadyToSend;
            qp.psn = params.psn;
        }
        debug!(
            "qp {}: -> ReadyToSend (psn 0x{:x}, retry {}, rnr retry {})",
            self.qpn, params.psn, params.retry_count, params.rnr_retry
        );
        Ok(())
    }

    /// Drive the pair to the terminal error state, closing its connections
    /// and flushing queued work. Infallible by design: this is the teardown
    /// path.
    pub fn to_error(&self) {
        let mut dev = self.dev.borrow_mut();
        if let Some(qp) = dev.qps.get_mut(&self.qpn) {
            if qp.state != QpState::Error {
                debug!("qp {}: -> Error (flush)", self.qpn);
            }
            qp.state = QpState::Error;
            if let Some(s) = qp.out.take() {
                let _ = s.shutdown(Shutdown::Both);
            }
            if let Some(s) = qp.inc.take() {
                let _ = s.shutdown(Shutdown::Both);
            }
            qp.recv_queue.clear();
            qp.inbuf.clear();
        }
    }

    /// Post a receive that carries no scatter-gather entry. It can only be
    /// matched by a write-with-immediate, whose payload is placed by the
    /// sender; the receive consumes nothing but the immediate.
    pub fn post_receive_empty(&self) -> Result<()> {
        device::post_receive(&mut self.dev.borrow_mut(), self.qpn, None)
    }

    /// Post a receive backed by `len` bytes at `offset` into `mr`, for
    /// two-sided sends.
    pub fn post_receive(&self, mr: &MemoryRegion, offset: usize, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or(VerbsError::InvalidRequest("receive range overflows"))?;
        if end > mr.len() {
            return Err(VerbsError::InvalidRequest("receive outside its region"));
        }
        device::post_receive(
            &mut self.dev.borrow_mut(),
            self.qpn,
            Some((mr.base_addr() + offset as u64, len as u32)),
        )
    }

    /// Post a one-sided write of `len` bytes from `offset` into `mr`,
    /// landing at `remote_addr` under `remote_key` on the peer, and deliver
    /// `imm` to one of the peer's posted receives.
    pub fn post_write_with_imm(
        &self,
        mr: &MemoryRegion,
        offset: usize,
        len: usize,
        remote_addr: u64,
        remote_key: u32,
        imm: u32,
    ) -> Result<()> {
        device::post_outbound(
            &mut self.dev.borrow_mut(),
            self.qpn,
            wire::OP_WRITE_IMM,
            mr.lkey(),
            offset,
            len,
            remote_addr,
            remote_key,
            imm,
        )
    }

    /// Post a two-sided send of `len` bytes from `offset` into `mr`.
    pub fn post_send(&self, mr: &MemoryRegion, offset: usize, len: usize) -> Result<()> {
        device::post_outbound(
            &mut self.dev.borrow_mut(),
            self.qpn,
            wire::OP_SEND,
            mr.lkey(),
            offset,
            len,
            0,
            0,
            0,
        )
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        self.to_error();
        let mut dev = self.dev.borrow_mut();
        dev.qps.remove(&self.qpn);
        device::stats_dec_qp(&dev);
        trace!("destroyed queue pair {}", self.qpn);
    }
}

fn dial_data_plane(addr: SocketAddr, hello: Hello) -> Result<TcpStream> {
    const ATTEMPTS: u32 = 3;

    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                let _ = stream.set_nodelay(true);
                stream.write_all(&hello.encode())?;
                return Ok(stream);
            }
            Err(e) => {
                attempt += 1;
                if attempt == ATTEMPTS {
                    return Err(VerbsError::Io(e));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Access, Context, PinnedBuffer};

    fn caps() -> QpCaps {
        QpCaps {
            max_send_wr: 4,
            max_recv_wr: 4,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }

    #[test]
    fn transition_order_is_enforced() {
        let ctx = Context::open().unwrap();
        let pd = ctx.alloc_pd();
        let cq = ctx.create_cq(4);
        let qp = pd.create_qp(&cq, caps()).unwrap();

        // Cannot skip Init.
        let err = qp
            .modify_to_rts(RtsParams {
                psn: 0,
                retry_count: 7,
                rnr_retry: 7,
            })
            .unwrap_err();
        assert!(matches!(err, VerbsError::BadTransition { .. }));

        qp.modify_to_init().unwrap();
        assert_eq!(qp.state(), QpState::Init);

        // Init twice is also a bad transition.
        assert!(qp.modify_to_init().is_err());
    }

    #[test]
    fn receive_queue_cap_is_enforced() {
        let ctx = Context::open().unwrap();
        let pd = ctx.alloc_pd();
        let cq = ctx.create_cq(4);
        let qp = pd.create_qp(&cq, caps()).unwrap();
        qp.modify_to_init().unwrap();

        for _ in 0..4 {
            qp.post_receive_empty().unwrap();
        }
        assert!(matches!(
            qp.post_receive_empty().unwrap_err(),
            VerbsError::QueueFull
        ));
    }

    #[test]
    fn multi_sge_caps_rejected() {
        let ctx = Context::open().unwrap();
        let pd = ctx.alloc_pd();
        let cq = ctx.create_cq(4);
        let bad = QpCaps {
            max_send_sge: 2,
            ..caps()
        };
        assert!(pd.create_qp(&cq, bad).is_err());
    }

    #[test]
    fn posting_without_rts_fails() {
        let ctx = Context::open().unwrap();
        let pd = ctx.alloc_pd();
        let cq = ctx.create_cq(4);
        let buf = PinnedBuffer::alloc(64).unwrap();
        // SAFETY: buf outlives mr and the queue pair below.
        let mr = unsafe { pd.register_region(&buf, Access::full()) }.unwrap();
        let qp = pd.create_qp(&cq, caps()).unwrap();
        qp.modify_to_init().unwrap();

        assert!(matches!(
            qp.post_write_with_imm(&mr, 0, 64, 0x1000, 1, 0).unwrap_err(),
            VerbsError::BadState(QpState::Init)
        ));
    }
}
