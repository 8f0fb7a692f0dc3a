// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A software rendition of a reliable-connected RDMA verbs device.
//!
//! The surface mirrors the slice of the verbs API that ring collectives
//! need: open a device, allocate a protection domain, create a completion
//! queue, register pinned memory regions, create reliable-connected queue
//! pairs and walk them through `Init -> ReadyToReceive -> ReadyToSend`, post
//! zero-length receives and one-sided writes-with-immediate, and poll for
//! completions.
//!
//! Under the hood each device owns one data-plane `TcpListener`. The
//! listener's port is the device's local identifier, and the global
//! identifier carries the interface IP, so the same fixed-width fields real
//! fabrics exchange are enough to address an emulated peer. One TCP stream
//! carries each direction of a queue-pair connection; TCP's ordering is the
//! reliable-connection ordering guarantee.
//!
//! Everything is single-threaded: posting is blocking, and all inbound
//! progress (accepting connections, placing one-sided writes, generating
//! completions) happens inside [`CompletionQueue::poll`].

pub mod buffer;
mod device;
mod qp;
mod wire;

pub use buffer::{page_size, PinnedBuffer};
pub use device::{
    Completion, CompletionKind, CompletionQueue, CompletionStatus, Context, Gid, MemoryRegion,
    ProtectionDomain, ResourceStats, StatsSnapshot,
};
pub use qp::{Mtu, QpCaps, QpState, QueuePair, RemoteEndpoint, RtsParams};

use std::fmt;
use std::io;

/// Access rights requested when registering a memory region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Access {
    pub local_write: bool,
    pub remote_write: bool,
    pub remote_read: bool,
}

impl Access {
    /// Local write plus both remote rights: what a collective's data regions
    /// are registered with.
    pub fn full() -> Access {
        Access {
            local_write: true,
            remote_write: true,
            remote_read: true,
        }
    }
}

/// The possible failures of the verbs surface. Completion-time failures are
/// not here: those are reported in-band as [`CompletionKind::Error`].
#[derive(Debug)]
pub enum VerbsError {
    /// No device could be brought up.
    NoDevice(io::Error),

    /// Region registration was rejected.
    RegisterFailed(&'static str),

    /// A state change the queue-pair state machine does not allow.
    BadTransition { from: QpState, to: QpState },

    /// The operation requires a state the queue pair is not in.
    BadState(QpState),

    /// The queue pair has no live connection to its peer.
    NotConnected,

    /// Posting past the queue caps given at creation time.
    QueueFull,

    /// A malformed work request (unknown key, out-of-bounds range, ...).
    InvalidRequest(&'static str),

    /// The socket plumbing underneath failed.
    Io(io::Error),
}

impl std::error::Error for VerbsError {}

impl fmt::Display for VerbsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoDevice(e) => write!(f, "no device available: {e}"),
            Self::RegisterFailed(why) => write!(f, "region registration failed: {why}"),
            Self::BadTransition { from, to } => {
                write!(f, "illegal queue pair transition {from:?} -> {to:?}")
            }
            Self::BadState(s) => write!(f, "queue pair in state {s:?} cannot do that"),
            Self::NotConnected => write!(f, "queue pair has no connection to its peer"),
            Self::QueueFull => write!(f, "work queue is full"),
            Self::InvalidRequest(why) => write!(f, "invalid work request: {why}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<io::Error> for VerbsError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, VerbsError>;
