// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The emulated device: context, protection domain, completion queue,
//! memory region, and the progress engine that moves inbound bytes into
//! registered memory and turns them into completions.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv6Addr, TcpListener, TcpStream};
use std::rc::Rc;

use log::{debug, trace, warn};

use crate::buffer::PinnedBuffer;
use crate::qp::{QpCaps, QpState, QueuePair};
use crate::wire::{self, FrameHeader, Hello};
use crate::{Access, Result, VerbsError};

pub(crate) type Dev = Rc<RefCell<DeviceState>>;

/// Global identifier. As on RoCE fabrics it carries the interface's IP
/// address, with IPv4 addresses in v4-mapped form.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    pub fn from_ip(ip: IpAddr) -> Gid {
        match ip {
            IpAddr::V4(a) => Gid(a.to_ipv6_mapped().octets()),
            IpAddr::V6(a) => Gid(a.octets()),
        }
    }

    pub fn ip(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.0);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }
}

impl std::fmt::Debug for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Gid({})", self.ip())
    }
}

/// Why a completion carries an error status. Any of these is fatal for the
/// queue pair that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The peer addressed memory it has no rights to.
    RemoteAccessError,

    /// An incoming message did not fit the posted receive.
    LocalLengthError,

    /// The connection died under an active queue pair.
    ConnectionLost,

    /// The peer sent a frame this device cannot parse.
    BadFrame,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CompletionKind {
    /// A posted one-sided write finished locally.
    WriteCompleted,

    /// A posted two-sided send finished locally.
    SendCompleted,

    /// A two-sided send landed in a posted receive.
    Receive { len: u32 },

    /// A write-with-immediate landed; the payload went straight to the
    /// region the sender addressed, the receive only consumed `imm`.
    ReceiveWithImmediate { imm: u32, len: u32 },

    Error(CompletionStatus),
}

#[derive(Clone, Copy, Debug)]
pub struct Completion {
    pub qpn: u32,
    pub kind: CompletionKind,
}

/// Live object counts for one device. Handed out as a shared reference so
/// teardown can be audited after the context itself is gone.
#[derive(Default)]
pub struct ResourceStats {
    pds: Cell<u32>,
    cqs: Cell<u32>,
    qps: Cell<u32>,
    regions: Cell<u32>,
}

impl ResourceStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pds: self.pds.get(),
            cqs: self.cqs.get(),
            qps: self.qps.get(),
            regions: self.regions.get(),
        }
    }

    fn inc(cell: &Cell<u32>) {
        cell.set(cell.get() + 1);
    }

    fn dec(cell: &Cell<u32>) {
        cell.set(cell.get().saturating_sub(1));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub pds: u32,
    pub cqs: u32,
    pub qps: u32,
    pub regions: u32,
}

impl StatsSnapshot {
    pub fn all_released(&self) -> bool {
        self.pds == 0 && self.cqs == 0 && self.qps == 0 && self.regions == 0
    }
}

pub(crate) struct RegionEntry {
    pub pd: u32,
    pub base: u64,
    pub len: usize,
    pub lkey: u32,
    pub rkey: u32,
    pub access: Access,
}

/// One posted receive. `sge` is the local placement for two-sided sends;
/// `None` for the zero-length receives that only consume an immediate.
#[derive(Clone, Copy)]
pub(crate) struct PostedReceive {
    pub sge: Option<(u64, u32)>,
}

pub(crate) struct QpEntry {
    pub qpn: u32,
    pub pd: u32,
    pub cq: u32,
    pub caps: QpCaps,
    pub state: QpState,
    pub psn: u32,
    /// Stream for outbound work requests, dialed during the transition to
    /// ReadyToReceive.
    pub out: Option<TcpStream>,
    /// Stream the peer dialed towards us, claimed from the parked list.
    pub inc: Option<TcpStream>,
    pub inbuf: Vec<u8>,
    pub recv_queue: VecDeque<PostedReceive>,
}

struct Parked {
    stream: TcpStream,
    hello: [u8; wire::HELLO_LEN],
    filled: usize,
}

pub(crate) struct CqState {
    depth: usize,
    queue: VecDeque<Completion>,
}

pub(crate) struct DeviceState {
    listener: TcpListener,
    port: u16,
    next_id: u32,
    pub(crate) cqs: HashMap<u32, CqState>,
    pub(crate) qps: HashMap<u32, QpEntry>,
    pub(crate) regions: Vec<RegionEntry>,
    parked: Vec<Parked>,
    pub(crate) stats: Rc<ResourceStats>,
}

impl DeviceState {
    pub(crate) fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// An open device. The port of the data-plane listener is the device's
/// local identifier.
pub struct Context {
    pub(crate) dev: Dev,
}

impl Context {
    /// Bring up the emulated device: one data-plane listener whose port
    /// doubles as the local identifier peers dial.
    pub fn open() -> Result<Context> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).map_err(VerbsError::NoDevice)?;
        listener.set_nonblocking(true).map_err(VerbsError::NoDevice)?;
        let port = listener.local_addr().map_err(VerbsError::NoDevice)?.port();

        debug!("device up, data plane on port {port}");

        Ok(Context {
            dev: Rc::new(RefCell::new(DeviceState {
                listener,
                port,
                next_id: 1,
                cqs: HashMap::new(),
                qps: HashMap::new(),
                regions: Vec::new(),
                parked: Vec::new(),
                stats: Rc::new(ResourceStats::default()),
            })),
        })
    }

    /// The local identifier peers use to reach this device.
    pub fn lid(&self) -> u16 {
        self.dev.borrow().port
    }

    /// Shared view of the device's live object counts.
    pub fn stats(&self) -> Rc<ResourceStats> {
        Rc::clone(&self.dev.borrow().stats)
    }

    pub fn alloc_pd(&self) -> ProtectionDomain {
        let mut dev = self.dev.borrow_mut();
        let id = dev.alloc_id();
        ResourceStats::inc(&dev.stats.pds);

        ProtectionDomain {
            dev: Rc::clone(&self.dev),
            id,
        }
    }

    pub fn create_cq(&self, depth: usize) -> CompletionQueue {
        let mut dev = self.dev.borrow_mut();
        let id = dev.alloc_id();
        dev.cqs.insert(
            id,
            CqState {
                depth: depth.max(1),
                queue: VecDeque::new(),
            },
        );
        ResourceStats::inc(&dev.stats.cqs);

        CompletionQueue {
            dev: Rc::clone(&self.dev),
            id,
        }
    }
}

pub struct ProtectionDomain {
    pub(crate) dev: Dev,
    pub(crate) id: u32,
}

impl ProtectionDomain {
    /// Register `buf` under this domain and hand out its keys.
    ///
    /// # Safety
    ///
    /// The caller must keep `buf` alive and un-moved until the returned
    /// region is dropped and every queue pair in this domain has stopped
    /// accepting inbound traffic: the device writes into the buffer through
    /// its raw base address.
    pub unsafe fn register_region(
        &self,
        buf: &PinnedBuffer,
        access: Access,
    ) -> Result<MemoryRegion> {
        let mut dev = self.dev.borrow_mut();
        let lkey = dev.alloc_id();
        let rkey = dev.alloc_id();

        dev.regions.push(RegionEntry {
            pd: self.id,
            base: buf.base_addr(),
            len: buf.len(),
            lkey,
            rkey,
            access,
        });
        ResourceStats::inc(&dev.stats.regions);

        trace!(
            "registered region base=0x{:x} len={} lkey={} rkey={}",
            buf.base_addr(),
            buf.len(),
            lkey,
            rkey
        );

        Ok(MemoryRegion {
            dev: Rc::clone(&self.dev),
            lkey,
            rkey,
            base: buf.base_addr(),
            len: buf.len(),
        })
    }

    pub fn create_qp(&self, cq: &CompletionQueue, caps: QpCaps) -> Result<QueuePair> {
        crate::qp::create(self, cq, caps)
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        let dev = self.dev.borrow();
        ResourceStats::dec(&dev.stats.pds);
    }
}

pub struct MemoryRegion {
    pub(crate) dev: Dev,
    lkey: u32,
    rkey: u32,
    base: u64,
    len: usize,
}

impl MemoryRegion {
    pub fn base_addr(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Key for local work requests.
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    /// Key a peer presents to address this region.
    pub fn rkey(&self) -> u32 {
        self.rkey
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        let mut dev = self.dev.borrow_mut();
        dev.regions.retain(|r| r.lkey != self.lkey);
        ResourceStats::dec(&dev.stats.regions);
        trace!("deregistered region lkey={}", self.lkey);
    }
}

pub struct CompletionQueue {
    pub(crate) dev: Dev,
    pub(crate) id: u32,
}

impl CompletionQueue {
    /// Drive the device forward and pop at most one completion.
    ///
    /// This is the single suspension point of the data plane: accepting
    /// connections, reading sockets, placing one-sided writes into
    /// registered memory, and generating completions all happen here.
    pub fn poll(&self) -> Option<Completion> {
        let mut dev = self.dev.borrow_mut();
        progress(&mut dev);
        dev.cqs.get_mut(&self.id).and_then(|cq| cq.queue.pop_front())
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        let mut dev = self.dev.borrow_mut();
        dev.cqs.remove(&self.id);
        ResourceStats::dec(&dev.stats.cqs);
    }
}

pub(crate) fn stats_inc_qp(dev: &DeviceState) {
    ResourceStats::inc(&dev.stats.qps);
}

pub(crate) fn stats_dec_qp(dev: &DeviceState) {
    ResourceStats::dec(&dev.stats.qps);
}

pub(crate) fn push_completion(dev: &mut DeviceState, cq: u32, completion: Completion) {
    let Some(cq) = dev.cqs.get_mut(&cq) else {
        warn!("dropping completion for destroyed queue: {completion:?}");
        return;
    };

    if cq.queue.len() >= cq.depth {
        warn!("completion queue overflow (depth {})", cq.depth);
    }

    cq.queue.push_back(completion);
}

/// One nonblocking sweep over the device: accept, route handshakes, pump
/// every connected queue pair.
pub(crate) fn progress(dev: &mut DeviceState) {
    accept_incoming(dev);
    route_parked(dev);

    let qpns: Vec<u32> = dev.qps.keys().copied().collect();
    for qpn in qpns {
        // Detach the entry so the region and completion tables stay
        // reachable while this pair's socket is pumped.
        let Some(mut entry) = dev.qps.remove(&qpn) else {
            continue;
        };
        pump_queue_pair(dev, &mut entry);
        dev.qps.insert(qpn, entry);
    }
}

fn accept_incoming(dev: &mut DeviceState) {
    loop {
        match dev.listener.accept() {
            Ok((stream, peer)) => {
                trace!("accepted data-plane connection from {peer}");
                if stream.set_nonblocking(true).is_err() {
                    continue;
                }
                let _ = stream.set_nodelay(true);
                dev.parked.push(Parked {
                    stream,
                    hello: [0; wire::HELLO_LEN],
                    filled: 0,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("accept failed on data plane: {e}");
                break;
            }
        }
    }
}

fn route_parked(dev: &mut DeviceState) {
    let mut i = 0;
    while i < dev.parked.len() {
        if dev.parked[i].filled < wire::HELLO_LEN {
            let parked = &mut dev.parked[i];
            match parked.stream.read(&mut parked.hello[parked.filled..]) {
                Ok(0) => {
                    dev.parked.remove(i);
                    continue;
                }
                Ok(n) => parked.filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    i += 1;
                    continue;
                }
                Err(e) => {
                    warn!("handshake read failed: {e}");
                    dev.parked.remove(i);
                    continue;
                }
            }
            if dev.parked[i].filled < wire::HELLO_LEN {
                i += 1;
                continue;
            }
        }

        let Some(hello) = Hello::decode(&dev.parked[i].hello) else {
            warn!("rejecting data-plane connection with bad handshake");
            dev.parked.remove(i);
            continue;
        };

        // Hand the stream over once the target pair is ready to receive.
        let claimable = dev.qps.get(&hello.dst_qpn).is_some_and(|qp| {
            qp.inc.is_none()
                && matches!(qp.state, QpState::ReadyToReceive | QpState::ReadyToSend)
        });

        if claimable {
            let parked = dev.parked.remove(i);
            if let Some(qp) = dev.qps.get_mut(&hello.dst_qpn) {
                debug!(
                    "qp {} bound inbound stream from remote qp {}",
                    hello.dst_qpn, hello.src_qpn
                );
                qp.inc = Some(parked.stream);
            }
        } else {
            i += 1;
        }
    }
}

enum FrameOutcome {
    Consumed,
    NeedData,
    /// Receiver not ready: a complete frame is waiting for a receive to be
    /// posted. Reading the socket stops too, so TCP backpressures the peer.
    Blocked,
    Dead,
}

fn pump_queue_pair(dev: &mut DeviceState, qp: &mut QpEntry) {
    if !matches!(qp.state, QpState::ReadyToReceive | QpState::ReadyToSend) {
        return;
    }
    if qp.inc.is_none() {
        return;
    }

    loop {
        // Consume whatever is already buffered first.
        loop {
            match consume_frame(dev, qp) {
                FrameOutcome::Consumed => continue,
                FrameOutcome::NeedData => break,
                FrameOutcome::Blocked | FrameOutcome::Dead => return,
            }
        }

        let mut scratch = [0u8; 16 * 1024];
        let Some(stream) = qp.inc.as_mut() else {
            return;
        };

        match stream.read(&mut scratch) {
            Ok(0) => {
                // Orderly close from the peer; an error only if this pair
                // still expects traffic.
                qp.inc = None;
                if !qp.recv_queue.is_empty() || !qp.inbuf.is_empty() {
                    fail_qp(dev, qp, CompletionStatus::ConnectionLost);
                }
                return;
            }
            Ok(n) => qp.inbuf.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("qp {}: data-plane read failed: {e}", qp.qpn);
                qp.inc = None;
                fail_qp(dev, qp, CompletionStatus::ConnectionLost);
                return;
            }
        }
    }
}

fn fail_qp(dev: &mut DeviceState, qp: &mut QpEntry, status: CompletionStatus) {
    qp.state = QpState::Error;
    qp.inbuf.clear();
    qp.recv_queue.clear();
    push_completion(
        dev,
        qp.cq,
        Completion {
            qpn: qp.qpn,
            kind: CompletionKind::Error(status),
        },
    );
}

fn consume_frame(dev: &mut DeviceState, qp: &mut QpEntry) -> FrameOutcome {
    if qp.inbuf.len() < wire::HEADER_LEN {
        return FrameOutcome::NeedData;
    }

    let header = FrameHeader::decode(&qp.inbuf[..wire::HEADER_LEN]);
    let total = wire::HEADER_LEN + header.len as usize;
    if qp.inbuf.len() < total {
        return FrameOutcome::NeedData;
    }

    // Every frame consumes a posted receive. With none posted the frame
    // stays queued: this is the RNR backpressure that keeps a fast
    // neighbor's next-phase writes out of memory the current phase still
    // reads.
    if qp.recv_queue.is_empty() {
        return FrameOutcome::Blocked;
    }

    match header.op {
        wire::OP_WRITE_IMM => {
            if !region_covers(&dev.regions, qp.pd, header.rkey, header.addr, header.len) {
                warn!(
                    "qp {}: inbound write rejected: addr=0x{:x} len={} rkey={}",
                    qp.qpn, header.addr, header.len, header.rkey
                );
                fail_qp(dev, qp, CompletionStatus::RemoteAccessError);
                return FrameOutcome::Dead;
            }

            let payload = &qp.inbuf[wire::HEADER_LEN..total];
            // SAFETY: the destination range was validated against a
            // registered region whose memory the registrant keeps alive.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    header.addr as *mut u8,
                    header.len as usize,
                );
            }

            qp.recv_queue.pop_front();
            push_completion(
                dev,
                qp.cq,
                Completion {
                    qpn: qp.qpn,
                    kind: CompletionKind::ReceiveWithImmediate {
                        imm: header.imm,
                        len: header.len,
                    },
                },
            );
            trace!(
                "qp {}: placed {} byte write, imm=0x{:x}",
                qp.qpn,
                header.len,
                header.imm
            );
        }
        wire::OP_SEND => {
            let recv = qp.recv_queue.pop_front().map(|r| r.sge);
            match recv {
                Some(Some((addr, cap))) if header.len <= cap => {
                    let payload = &qp.inbuf[wire::HEADER_LEN..total];
                    // SAFETY: the receive was posted over a registered
                    // region; capacity was just checked.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            payload.as_ptr(),
                            addr as *mut u8,
                            header.len as usize,
                        );
                    }
                    push_completion(
                        dev,
                        qp.cq,
                        Completion {
                            qpn: qp.qpn,
                            kind: CompletionKind::Receive { len: header.len },
                        },
                    );
                }
                _ => {
                    warn!(
                        "qp {}: send of {} bytes does not fit the posted receive",
                        qp.qpn, header.len
                    );
                    fail_qp(dev, qp, CompletionStatus::LocalLengthError);
                    return FrameOutcome::Dead;
                }
            }
        }
        other => {
            warn!("qp {}: unknown opcode {other}", qp.qpn);
            fail_qp(dev, qp, CompletionStatus::BadFrame);
            return FrameOutcome::Dead;
        }
    }

    qp.inbuf.drain(..total);
    FrameOutcome::Consumed
}

fn region_covers(regions: &[RegionEntry], pd: u32, rkey: u32, addr: u64, len: u32) -> bool {
    regions.iter().any(|r| {
        r.pd == pd
            && r.rkey == rkey
            && r.access.remote_write
            && addr >= r.base
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= r.base + r.len as u64)
    })
}

pub(crate) fn post_receive(dev: &mut DeviceState, qpn: u32, sge: Option<(u64, u32)>) -> Result<()> {
    let qp = dev
        .qps
        .get_mut(&qpn)
        .ok_or(VerbsError::InvalidRequest("unknown queue pair"))?;

    match qp.state {
        QpState::Init | QpState::ReadyToReceive | QpState::ReadyToSend => {}
        s => return Err(VerbsError::BadState(s)),
    }

    if qp.recv_queue.len() >= qp.caps.max_recv_wr as usize {
        return Err(VerbsError::QueueFull);
    }

    qp.recv_queue.push_back(PostedReceive { sge });
    Ok(())
}

pub(crate) fn post_outbound(
    dev: &mut DeviceState,
    qpn: u32,
    op: u8,
    lkey: u32,
    offset: usize,
    len: usize,
    remote_addr: u64,
    rkey: u32,
    imm: u32,
) -> Result<()> {
    let src = dev
        .regions
        .iter()
        .find(|r| r.lkey == lkey)
        .ok_or(VerbsError::InvalidRequest("unknown local key"))?;
    let end = offset
        .checked_add(len)
        .ok_or(VerbsError::InvalidRequest("source range overflows"))?;
    if end > src.len {
        return Err(VerbsError::InvalidRequest("source outside its region"));
    }
    let src_addr = src.base + offset as u64;

    let qp = dev
        .qps
        .get_mut(&qpn)
        .ok_or(VerbsError::InvalidRequest("unknown queue pair"))?;
    if qp.state != QpState::ReadyToSend {
        return Err(VerbsError::BadState(qp.state));
    }
    let Some(out) = qp.out.as_mut() else {
        return Err(VerbsError::NotConnected);
    };

    let header = FrameHeader {
        op,
        len: len as u32,
        addr: remote_addr,
        rkey,
        imm,
    };

    // SAFETY: src_addr..src_addr+len lies inside a registered region whose
    // memory the registrant keeps alive while the pair is active.
    let payload = unsafe { std::slice::from_raw_parts(src_addr as *const u8, len) };

    out.write_all(&header.encode())?;
    out.write_all(payload)?;

    let cq = qp.cq;
    let kind = if op == wire::OP_WRITE_IMM {
        CompletionKind::WriteCompleted
    } else {
        CompletionKind::SendCompleted
    };
    push_completion(dev, cq, Completion { qpn, kind });
    Ok(())
}
