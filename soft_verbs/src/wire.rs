// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Framing for the data plane.
//!
//! Every byte crossing a queue-pair stream is either the fixed handshake
//! that binds a fresh TCP connection to its destination queue pair, or a
//! frame: a fixed header followed by `len` payload bytes.

pub(crate) const HELLO_MAGIC: u32 = 0x5243_5150; // "RCQP"
pub(crate) const HELLO_LEN: usize = 12;

/// First bytes on a freshly dialed connection: which queue pair is calling,
/// and which local queue pair the stream is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Hello {
    pub src_qpn: u32,
    pub dst_qpn: u32,
}

impl Hello {
    pub fn encode(&self) -> [u8; HELLO_LEN] {
        let mut out = [0u8; HELLO_LEN];
        out[..4].copy_from_slice(&HELLO_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.src_qpn.to_le_bytes());
        out[8..].copy_from_slice(&self.dst_qpn.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; HELLO_LEN]) -> Option<Hello> {
        if u32::from_le_bytes(bytes[..4].try_into().unwrap()) != HELLO_MAGIC {
            return None;
        }

        Some(Hello {
            src_qpn: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            dst_qpn: u32::from_le_bytes(bytes[8..].try_into().unwrap()),
        })
    }
}

pub(crate) const OP_WRITE_IMM: u8 = 1;
pub(crate) const OP_SEND: u8 = 2;

pub(crate) const HEADER_LEN: usize = 24;

/// Per-message header. `addr` and `rkey` are meaningful for one-sided writes
/// only. The immediate is carried verbatim, in whatever byte order the
/// poster chose, exactly like the hardware's `imm_data` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub op: u8,
    pub len: u32,
    pub addr: u64,
    pub rkey: u32,
    pub imm: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.op;
        out[4..8].copy_from_slice(&self.len.to_le_bytes());
        out[8..16].copy_from_slice(&self.addr.to_le_bytes());
        out[16..20].copy_from_slice(&self.rkey.to_le_bytes());
        out[20..].copy_from_slice(&self.imm.to_le_bytes());
        out
    }

    /// `bytes` must hold at least [`HEADER_LEN`] bytes.
    pub fn decode(bytes: &[u8]) -> FrameHeader {
        FrameHeader {
            op: bytes[0],
            len: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            addr: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            rkey: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            imm: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
        }
    }
}
