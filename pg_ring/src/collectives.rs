// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The two phases of the ring all-reduce and their composition.
//!
//! Both phases follow the same shape: pre-post `N-1` zero-length receives
//! on the back queue pair, then for each of `N-1` rounds post one
//! write-with-immediate to the front neighbor and wait for one receive from
//! the back neighbor. The immediate carries the incoming chunk's index in
//! network byte order; it is decoded before the receive region is touched,
//! because arrival order alone does not identify the chunk.
//!
//! No barrier runs between rounds: the pre-posted receives and the
//! write-with-immediate completions are the only synchronization the
//! schedule needs.

use log::{debug, trace};

use soft_verbs::CompletionKind;

use crate::handle::PgHandle;
use crate::reduce::{self, ElementType, ReduceOp};
use crate::{PgError, Result};

/// Busy-poll iterations before yielding the CPU.
const SPIN_BEFORE_YIELD: u32 = 1 << 14;

/// Per-collective geometry, validated up front.
#[derive(Clone, Copy)]
struct Plan {
    world_size: usize,
    rank: usize,
    chunk_bytes: usize,
}

impl PgHandle {
    /// Element-wise reduction of all ranks' send regions, delivered to
    /// every rank's send region: reduce-scatter followed by all-gather. If
    /// the first phase fails the second is not attempted.
    pub fn all_reduce(&mut self, elem: ElementType, op: ReduceOp, count: usize) -> Result<()> {
        self.reduce_scatter(elem, op, count)?;
        self.all_gather(elem, count)?;
        debug!("rank {}: all_reduce of {count} elements done", self.rank);
        Ok(())
    }

    /// Phase one. On return, chunk `(rank + 1) mod N` of the send region
    /// holds the fully reduced sub-vector; the other chunks hold
    /// intermediate values with no meaning.
    pub fn reduce_scatter(
        &mut self,
        elem: ElementType,
        op: ReduceOp,
        count: usize,
    ) -> Result<()> {
        let plan = self.plan(elem, count)?;
        let res = self.run_reduce_scatter(plan, elem, op);
        if res.is_err() {
            self.tainted = true;
        }
        res
    }

    /// Phase two. On entry every rank holds its final chunk in the correct
    /// slot of the send region; on return the whole send region is the
    /// reduced vector.
    pub fn all_gather(&mut self, elem: ElementType, count: usize) -> Result<()> {
        let plan = self.plan(elem, count)?;
        let res = self.run_all_gather(plan);
        if res.is_err() {
            self.tainted = true;
        }
        res
    }

    fn run_reduce_scatter(&mut self, plan: Plan, elem: ElementType, op: ReduceOp) -> Result<()> {
        let n = plan.world_size;

        self.prepost_receives(n - 1)?;

        let mut pending_writes = 0;
        for round in 0..n - 1 {
            let send_chunk = (plan.rank + n - round) % n;
            self.post_chunk_write(send_chunk, plan.chunk_bytes)?;
            pending_writes += 1;

            let imm = self.wait_receive(&mut pending_writes)?;
            let recv_chunk = self.decode_chunk_index(imm, n)?;
            trace!(
                "rank {}: round {round}: sent chunk {send_chunk}, received chunk {recv_chunk}",
                plan.rank
            );

            // Combine into the send region: the next round forwards this
            // partial sum onward.
            let (dst, src) = self.chunk_pair(recv_chunk, plan.chunk_bytes)?;
            reduce::combine_chunk(elem, op, dst, src);
        }

        if op == ReduceOp::Mean {
            let owned = (plan.rank + 1) % n;
            let dst = self.send_chunk_mut(owned, plan.chunk_bytes)?;
            reduce::scale_chunk(elem, dst, n);
        }

        self.drain_writes(pending_writes)
    }

    fn run_all_gather(&mut self, plan: Plan) -> Result<()> {
        let n = plan.world_size;

        self.prepost_receives(n - 1)?;

        let mut pending_writes = 0;
        for round in 0..n - 1 {
            let send_chunk = (plan.rank + 1 + n - round) % n;
            self.post_chunk_write(send_chunk, plan.chunk_bytes)?;
            pending_writes += 1;

            let imm = self.wait_receive(&mut pending_writes)?;
            let recv_chunk = self.decode_chunk_index(imm, n)?;
            trace!(
                "rank {}: gather round {round}: sent chunk {send_chunk}, received chunk {recv_chunk}",
                plan.rank
            );

            // No combine here: the incoming chunk is final, it only has to
            // reach its slot in the send region.
            let (dst, src) = self.chunk_pair(recv_chunk, plan.chunk_bytes)?;
            dst.copy_from_slice(src);
        }

        self.drain_writes(pending_writes)
    }

    fn plan(&self, elem: ElementType, count: usize) -> Result<Plan> {
        if self.closed() {
            return Err(PgError::BadArg("handle is closed"));
        }
        if self.tainted {
            return Err(PgError::HandleTainted);
        }

        let (registered_elem, registered_count) = self
            .registered()
            .ok_or(PgError::BadArg("no regions registered"))?;
        if registered_elem != elem {
            return Err(PgError::BadArg("element type differs from registration"));
        }

        let n = self.world_size;
        if count == 0 || count % n != 0 {
            return Err(PgError::BadCount {
                count,
                world_size: n,
            });
        }
        if count > registered_count {
            return Err(PgError::BadArg("count exceeds the registered capacity"));
        }

        Ok(Plan {
            world_size: n,
            rank: self.rank,
            chunk_bytes: (count / n) * elem.width(),
        })
    }

    /// One zero-length receive per expected write-with-immediate, posted
    /// before the first write of the phase so the back neighbor never finds
    /// the receive queue empty mid-phase.
    fn prepost_receives(&self, rounds: usize) -> Result<()> {
        let back = self
            .back_qp
            .as_ref()
            .ok_or(PgError::BadArg("handle is closed"))?;
        for _ in 0..rounds {
            back.post_receive_empty()
                .map_err(|e| PgError::TransportError(e.to_string()))?;
        }
        Ok(())
    }

    /// Write one chunk of the send region into the same chunk slot of the
    /// front neighbor's receive region, carrying the chunk index as the
    /// immediate in network byte order.
    fn post_chunk_write(&self, chunk_index: usize, chunk_bytes: usize) -> Result<()> {
        let front = self
            .front_qp
            .as_ref()
            .ok_or(PgError::BadArg("handle is closed"))?;
        let regions = self
            .regions
            .as_ref()
            .ok_or(PgError::BadArg("no regions registered"))?;
        let creds = self
            .front_creds
            .as_ref()
            .ok_or(PgError::BadArg("no remote credentials"))?;

        let offset = chunk_index * chunk_bytes;
        front
            .post_write_with_imm(
                &regions.send_mr,
                offset,
                chunk_bytes,
                creds.recv_base + offset as u64,
                creds.recv_key,
                u32::to_be(chunk_index as u32),
            )
            .map_err(|e| PgError::TransportError(e.to_string()))
    }

    /// Spin on the completion queue until the back neighbor's next
    /// write-with-immediate arrives; local write completions encountered on
    /// the way are counted off. Returns the raw immediate.
    fn wait_receive(&self, pending_writes: &mut usize) -> Result<u32> {
        let cq = self.cq.as_ref().ok_or(PgError::BadArg("handle is closed"))?;

        let mut spins = 0u32;
        loop {
            match cq.poll() {
                Some(completion) => match completion.kind {
                    CompletionKind::ReceiveWithImmediate { imm, .. } => return Ok(imm),
                    CompletionKind::WriteCompleted => {
                        *pending_writes = pending_writes.saturating_sub(1);
                    }
                    CompletionKind::Error(status) => {
                        return Err(PgError::TransportError(format!(
                            "completion error {status:?} on qp {}",
                            completion.qpn
                        )));
                    }
                    other => {
                        return Err(PgError::TransportError(format!(
                            "unexpected completion {other:?} during a collective"
                        )));
                    }
                },
                None => {
                    spins += 1;
                    if spins >= SPIN_BEFORE_YIELD {
                        spins = 0;
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    /// Consume the local completions of this phase's writes, leaving the
    /// queue empty for the next phase.
    fn drain_writes(&self, mut pending_writes: usize) -> Result<()> {
        let cq = self.cq.as_ref().ok_or(PgError::BadArg("handle is closed"))?;

        let mut spins = 0u32;
        while pending_writes > 0 {
            match cq.poll() {
                Some(completion) => match completion.kind {
                    CompletionKind::WriteCompleted => pending_writes -= 1,
                    CompletionKind::Error(status) => {
                        return Err(PgError::TransportError(format!(
                            "completion error {status:?} on qp {}",
                            completion.qpn
                        )));
                    }
                    other => {
                        return Err(PgError::TransportError(format!(
                            "unexpected completion {other:?} while draining writes"
                        )));
                    }
                },
                None => {
                    spins += 1;
                    if spins >= SPIN_BEFORE_YIELD {
                        spins = 0;
                        std::thread::yield_now();
                    }
                }
            }
        }
        Ok(())
    }

    /// The immediate identifies the chunk; trusting arrival order instead
    /// would break under reordering across connections.
    fn decode_chunk_index(&self, imm: u32, world_size: usize) -> Result<usize> {
        let chunk = u32::from_be(imm) as usize;
        if chunk >= world_size {
            return Err(PgError::TransportError(format!(
                "peer announced chunk {chunk}, but the ring only has {world_size} chunks"
            )));
        }
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    /// The chunk schedule, checked against the ring invariant: in round `r`
    /// rank `k` sends chunk `(k - r) mod N` and receives the chunk its back
    /// neighbor sent, `(k - 1 - r) mod N`.
    #[test]
    fn reduce_scatter_schedule() {
        let n = 4;
        for rank in 0..n {
            for round in 0..n - 1 {
                let send = (rank + n - round) % n;
                let back_sends = (rank + n - 1 + n - round) % n;
                assert_ne!(send, back_sends);
                // After combining, the received chunk is what this rank
                // sends next round.
                let next_send = (rank + n - (round + 1)) % n;
                assert_eq!(back_sends, next_send);
            }
        }
    }

    /// All-gather starts one chunk later: rank `k` first forwards the chunk
    /// it owns after reduce-scatter, `(k + 1) mod N`.
    #[test]
    fn all_gather_schedule() {
        let n = 4;
        for rank in 0..n {
            let mut held: Vec<usize> = vec![(rank + 1) % n];
            for round in 0..n - 1 {
                let send = (rank + 1 + n - round) % n;
                assert!(held.contains(&send), "rank {rank} does not hold {send}");
                let recv = (rank + n - round) % n;
                held.push(recv);
            }
            held.sort_unstable();
            held.dedup();
            assert_eq!(held.len(), n);
        }
    }
}
