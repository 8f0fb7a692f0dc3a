// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The process-group handle: one device context, two queue pairs (front and
//! back neighbor), the pinned data regions, and the side-channel sockets
//! kept open between `connect` and `register`.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use log::{debug, info};

use soft_verbs::{
    Access, CompletionQueue, Context, Gid, MemoryRegion, Mtu, PinnedBuffer, ProtectionDomain,
    QpCaps, QueuePair, RemoteEndpoint, RtsParams,
};

use crate::exchange::{self, EndpointRecord, MemoryRecord};
use crate::reduce::{Element, ElementType};
use crate::{PgError, Result};

const DEFAULT_BASE_PORT: u16 = 18515;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Queue-pair connection constants, the classic reliable-connection tuning.
const PATH_MTU: Mtu = Mtu::Mtu1024;
const MIN_RNR_TIMER: u8 = 12;
const RETRY_COUNT: u8 = 7;
const RNR_RETRY: u8 = 7;

/// How the bootstrap reaches the neighbors.
#[derive(Clone, Copy, Debug)]
pub struct ConnectConfig {
    /// Rank `r` listens on `base_port + r` for the side-channel exchange.
    pub base_port: u16,
    /// Absolute budget for riding out launch skew: connect retries and the
    /// accept loop both give up when it runs out.
    pub timeout: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        ConnectConfig {
            base_port: DEFAULT_BASE_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// The registered data regions. Dropped as a unit, regions before buffers.
pub(crate) struct RegionSet {
    pub(crate) recv_mr: MemoryRegion,
    pub(crate) send_mr: MemoryRegion,
    pub(crate) recv_buf: PinnedBuffer,
    pub(crate) send_buf: PinnedBuffer,
    pub(crate) elem: ElementType,
    pub(crate) count: usize,
}

/// One process's membership in the ring.
///
/// Field order is teardown order: queue pairs first, then regions, then the
/// completion queue, protection domain and context, then the side-channel
/// sockets. `close` walks the same order explicitly; `Drop` is the
/// best-effort fallback.
pub struct PgHandle {
    pub(crate) rank: usize,
    pub(crate) world_size: usize,
    pub(crate) front_rank: usize,
    pub(crate) back_rank: usize,
    page_size: usize,
    pub(crate) tainted: bool,
    closed: bool,

    pub(crate) back_qp: Option<QueuePair>,
    pub(crate) front_qp: Option<QueuePair>,
    pub(crate) regions: Option<RegionSet>,
    pub(crate) cq: Option<CompletionQueue>,
    pd: Option<ProtectionDomain>,
    ctx: Option<Context>,
    front_sock: Option<TcpStream>,
    back_sock: Option<TcpStream>,

    pub(crate) front_creds: Option<MemoryRecord>,
}

impl std::fmt::Debug for PgHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgHandle")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("front_rank", &self.front_rank)
            .field("back_rank", &self.back_rank)
            .field("tainted", &self.tainted)
            .field("closed", &self.closed)
            .finish()
    }
}

impl PgHandle {
    /// Join the ring described by `world`, an ordered host list in which
    /// this process is entry `rank`. Returns once both neighbor connections
    /// are ready to send.
    pub fn connect(world: &[String], rank: usize, config: ConnectConfig) -> Result<PgHandle> {
        if world.len() < 2 {
            return Err(PgError::BadWorld(format!(
                "need at least two hosts, got {}",
                world.len()
            )));
        }
        if let Some(empty) = world.iter().position(|h| h.is_empty()) {
            return Err(PgError::BadWorld(format!("host {empty} is empty")));
        }
        if rank >= world.len() {
            return Err(PgError::BadArg("rank is outside the host list"));
        }

        let world_size = world.len();
        let front_rank = (rank + 1) % world_size;
        let back_rank = (rank + world_size - 1) % world_size;
        let page_size = soft_verbs::page_size();

        info!("rank {rank}/{world_size}: front is rank {front_rank}, back is rank {back_rank}");

        let ctx = Context::open().map_err(PgError::TransportInitFailed)?;
        let pd = ctx.alloc_pd();
        // Both phases keep at most N-1 receives plus N-1 unpolled local
        // write completions in flight.
        let cq = ctx.create_cq(2 * (world_size - 1));

        let caps = QpCaps {
            max_send_wr: world_size as u32,
            max_recv_wr: world_size as u32,
            max_send_sge: 1,
            max_recv_sge: 1,
        };
        let front_qp = pd.create_qp(&cq, caps).map_err(PgError::TransportInitFailed)?;
        let back_qp = pd.create_qp(&cq, caps).map_err(PgError::TransportInitFailed)?;
        front_qp.modify_to_init().map_err(PgError::TransportInitFailed)?;
        back_qp.modify_to_init().map_err(PgError::TransportInitFailed)?;

        let my_port = port_for(config.base_port, rank)?;
        let listener = exchange::listen_with_reuse(my_port)?;
        let deadline = Instant::now() + config.timeout;

        // Rank 0 dials first to break the symmetric wait cycle; everyone
        // else serves their back neighbor before dialing forward.
        let dial_front = |deadline: Instant| -> Result<(TcpStream, EndpointRecord, EndpointRecord)> {
            let mut sock = exchange::dial(
                &world[front_rank],
                port_for(config.base_port, front_rank)?,
                deadline,
            )?;
            sock.set_read_timeout(Some(config.timeout))?;
            let mine = local_record(&ctx, &front_qp, &sock, rank)?;
            let peer = exchange::exchange_as_dialer(&mut sock, &mine)?;
            Ok((sock, mine, peer))
        };
        let serve_back = |deadline: Instant| -> Result<(TcpStream, EndpointRecord, EndpointRecord)> {
            let mut sock = exchange::accept_with_deadline(&listener, deadline)?;
            sock.set_read_timeout(Some(config.timeout))?;
            let mine = local_record(&ctx, &back_qp, &sock, rank)?;
            let peer = exchange::exchange_as_acceptor(&mut sock, &mine)?;
            Ok((sock, mine, peer))
        };

        let (front, back) = if rank == 0 {
            let front = dial_front(deadline)?;
            let back = serve_back(deadline)?;
            (front, back)
        } else {
            let back = serve_back(deadline)?;
            let front = dial_front(deadline)?;
            (front, back)
        };
        let (front_sock, my_front, front_peer) = front;
        let (back_sock, my_back, back_peer) = back;

        debug!(
            "rank {rank}: back peer qp {} at lid {}, front peer qp {} at lid {}",
            back_peer.qpn, back_peer.lid, front_peer.qpn, front_peer.lid
        );

        // The back pair connects to the back neighbor's front endpoint, and
        // the front pair to the front neighbor's back endpoint.
        connect_qp(&back_qp, &back_peer, my_back.psn)?;
        connect_qp(&front_qp, &front_peer, my_front.psn)?;

        info!("rank {rank}: both neighbor connections ready to send");

        Ok(PgHandle {
            rank,
            world_size,
            front_rank,
            back_rank,
            page_size,
            tainted: false,
            closed: false,
            back_qp: Some(back_qp),
            front_qp: Some(front_qp),
            regions: None,
            cq: Some(cq),
            pd: Some(pd),
            ctx: Some(ctx),
            front_sock: Some(front_sock),
            back_sock: Some(back_sock),
            front_creds: None,
        })
    }

    /// Allocate and register the pinned send and receive regions for
    /// `count` elements of `elem`, then swap region credentials with the
    /// neighbors. Must run on every rank before the first collective.
    pub fn register(&mut self, elem: ElementType, count: usize) -> Result<()> {
        if self.closed {
            return Err(PgError::BadArg("handle is closed"));
        }
        if self.tainted {
            return Err(PgError::HandleTainted);
        }
        if count == 0 {
            return Err(PgError::BadCount {
                count,
                world_size: self.world_size,
            });
        }

        let len = count
            .checked_mul(elem.width())
            .ok_or(PgError::BadArg("count overflows the region size"))?;

        let send_buf =
            PinnedBuffer::alloc(len).map_err(|e| PgError::RegisterFailed(e.to_string()))?;
        let recv_buf =
            PinnedBuffer::alloc(len).map_err(|e| PgError::RegisterFailed(e.to_string()))?;

        let pd = self
            .pd
            .as_ref()
            .ok_or(PgError::BadArg("handle is closed"))?;

        // SAFETY: the buffers live in this handle's RegionSet next to the
        // regions, are dropped after them, and close() quiesces both queue
        // pairs before any of this memory goes away.
        let send_mr = unsafe { pd.register_region(&send_buf, Access::full()) }
            .map_err(|e| PgError::RegisterFailed(e.to_string()))?;
        let recv_mr = unsafe { pd.register_region(&recv_buf, Access::full()) }
            .map_err(|e| PgError::RegisterFailed(e.to_string()))?;

        let mine = MemoryRecord {
            recv_base: recv_mr.base_addr(),
            recv_key: recv_mr.rkey(),
            send_base: send_mr.base_addr(),
            send_key: send_mr.rkey(),
        };

        // The back neighbor writes into our regions, so our credentials go
        // backwards; the front neighbor's come forwards. Writes first: 24
        // bytes always fit the socket buffer, so no ordering can deadlock.
        let back_sock = self
            .back_sock
            .as_mut()
            .ok_or(PgError::BadArg("handle is closed"))?;
        mine.write_to(back_sock)?;

        let front_sock = self
            .front_sock
            .as_mut()
            .ok_or(PgError::BadArg("handle is closed"))?;
        let front_creds = MemoryRecord::read_from(front_sock)?;

        debug!(
            "rank {}: registered {len} byte regions, front recv region at 0x{:x}",
            self.rank, front_creds.recv_base
        );

        self.regions = Some(RegionSet {
            recv_mr,
            send_mr,
            recv_buf,
            send_buf,
            elem,
            count,
        });
        self.front_creds = Some(front_creds);
        Ok(())
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Rank of the next process around the ring.
    pub fn front_rank(&self) -> usize {
        self.front_rank
    }

    /// Rank of the previous process around the ring.
    pub fn back_rank(&self) -> usize {
        self.back_rank
    }

    /// Page size computed once at connect time; region alignment math uses
    /// this instead of a process-wide static.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The registered element type and count, if `register` has run.
    pub fn registered(&self) -> Option<(ElementType, usize)> {
        self.regions.as_ref().map(|r| (r.elem, r.count))
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed
    }

    /// Live transport object counts, for teardown auditing.
    pub fn transport_stats(&self) -> Option<std::rc::Rc<soft_verbs::ResourceStats>> {
        self.ctx.as_ref().map(|c| c.stats())
    }

    /// View of the send region as elements. After a successful
    /// `all_reduce` this is the reduced vector.
    pub fn send_slice<T: Element>(&self) -> Result<&[T]> {
        let regions = self
            .regions
            .as_ref()
            .ok_or(PgError::BadArg("no regions registered"))?;
        if regions.elem != T::KIND {
            return Err(PgError::BadArg("element type differs from registration"));
        }

        // SAFETY: the buffer is page-aligned, sized count * width, and T
        // matches the registered element type.
        Ok(unsafe {
            std::slice::from_raw_parts(regions.send_buf.base_addr() as *const T, regions.count)
        })
    }

    /// Mutable view of the send region; load the input vector here.
    pub fn send_slice_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        let regions = self
            .regions
            .as_mut()
            .ok_or(PgError::BadArg("no regions registered"))?;
        if regions.elem != T::KIND {
            return Err(PgError::BadArg("element type differs from registration"));
        }

        // SAFETY: as in send_slice, plus &mut self keeps this view unique.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(regions.send_buf.base_addr() as *mut T, regions.count)
        })
    }

    /// The send-region chunk and receive-region chunk at `chunk_index`, as
    /// a (destination, source) pair for the combine step.
    pub(crate) fn chunk_pair(
        &mut self,
        chunk_index: usize,
        chunk_bytes: usize,
    ) -> Result<(&mut [u8], &[u8])> {
        let regions = self
            .regions
            .as_mut()
            .ok_or(PgError::BadArg("no regions registered"))?;
        let range = chunk_index * chunk_bytes..(chunk_index + 1) * chunk_bytes;
        Ok((
            &mut regions.send_buf.as_mut_slice()[range.clone()],
            &regions.recv_buf.as_slice()[range],
        ))
    }

    pub(crate) fn send_chunk_mut(
        &mut self,
        chunk_index: usize,
        chunk_bytes: usize,
    ) -> Result<&mut [u8]> {
        let regions = self
            .regions
            .as_mut()
            .ok_or(PgError::BadArg("no regions registered"))?;
        let range = chunk_index * chunk_bytes..(chunk_index + 1) * chunk_bytes;
        Ok(&mut regions.send_buf.as_mut_slice()[range])
    }

    /// Release everything: quiesce both queue pairs, drain stale
    /// completions, then drop every resource in reverse construction order.
    /// Calling it again on a closed handle is a no-op that succeeds.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Flush the work queues before any region memory can go away.
        if let Some(qp) = &self.back_qp {
            qp.to_error();
        }
        if let Some(qp) = &self.front_qp {
            qp.to_error();
        }

        if let Some(cq) = &self.cq {
            let mut drained = 0;
            while cq.poll().is_some() {
                drained += 1;
                if drained > 4 * self.world_size {
                    break;
                }
            }
            if drained > 0 {
                debug!("rank {}: drained {drained} stale completions", self.rank);
            }
        }

        self.back_qp.take();
        self.front_qp.take();
        self.regions.take();
        self.cq.take();
        self.pd.take();
        self.ctx.take();
        self.front_sock.take();
        self.back_sock.take();
        self.front_creds.take();

        info!("rank {}: process group closed", self.rank);
        Ok(())
    }
}

impl Drop for PgHandle {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

fn port_for(base_port: u16, rank: usize) -> Result<u16> {
    u16::try_from(rank)
        .ok()
        .and_then(|r| base_port.checked_add(r))
        .ok_or(PgError::BadArg("rank overflows the bootstrap port range"))
}

/// Build the endpoint record this process publishes for one of its queue
/// pairs. The global identifier carries the address the side-channel socket
/// is using, which is the interface the neighbor can actually reach.
fn local_record(
    ctx: &Context,
    qp: &QueuePair,
    sock: &TcpStream,
    rank: usize,
) -> Result<EndpointRecord> {
    let ip = sock.local_addr()?.ip();
    Ok(EndpointRecord {
        lid: ctx.lid(),
        qpn: qp.qpn(),
        psn: initial_psn(rank, qp.qpn()),
        gid: Gid::from_ip(ip).0,
    })
}

/// A 24-bit starting sequence number that differs between runs.
fn initial_psn(rank: usize, qpn: u32) -> u32 {
    let mut hasher = RandomState::new().build_hasher();
    (rank, qpn).hash(&mut hasher);
    (hasher.finish() & 0xff_ffff) as u32
}

fn connect_qp(qp: &QueuePair, peer: &EndpointRecord, my_psn: u32) -> Result<()> {
    qp.modify_to_rtr(RemoteEndpoint {
        qpn: peer.qpn,
        lid: peer.lid,
        gid: Gid(peer.gid),
        mtu: PATH_MTU,
        min_rnr_timer: MIN_RNR_TIMER,
    })
    .map_err(PgError::TransportInitFailed)?;

    qp.modify_to_rts(RtsParams {
        psn: my_psn,
        retry_count: RETRY_COUNT,
        rnr_retry: RNR_RETRY,
    })
    .map_err(PgError::TransportInitFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_of_one_is_rejected() {
        let world = vec!["localhost".to_string()];
        let err = PgHandle::connect(&world, 0, ConnectConfig::default()).unwrap_err();
        assert!(matches!(err, PgError::BadWorld(_)));
    }

    #[test]
    fn rank_outside_world_is_rejected() {
        let world = vec!["a".to_string(), "b".to_string()];
        let err = PgHandle::connect(&world, 2, ConnectConfig::default()).unwrap_err();
        assert!(matches!(err, PgError::BadArg(_)));
    }

    #[test]
    fn empty_host_is_rejected() {
        let world = vec!["a".to_string(), String::new()];
        let err = PgHandle::connect(&world, 0, ConnectConfig::default()).unwrap_err();
        assert!(matches!(err, PgError::BadWorld(_)));
    }

    #[test]
    fn bootstrap_port_overflow_is_rejected() {
        assert!(port_for(u16::MAX, 1).is_err());
        assert_eq!(port_for(18515, 3).unwrap(), 18518);
    }

    #[test]
    fn initial_psn_fits_24_bits() {
        for rank in 0..8 {
            assert!(initial_psn(rank, 17) <= 0xff_ffff);
        }
    }
}
