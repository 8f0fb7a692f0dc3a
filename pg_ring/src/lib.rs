// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Ring all-reduce over the emulated verbs fabric.
//!
//! N cooperating processes form a logical ring; each holds a vector of
//! `count` elements. [`PgHandle::all_reduce`] leaves the element-wise
//! reduction of all N input vectors in every process's send region, using
//! the classic two-phase ring schedule: a reduce-scatter that leaves each
//! process with one fully reduced chunk, followed by an all-gather that
//! circulates the reduced chunks until everyone holds the whole vector.
//!
//! The typical call sequence is `connect` -> `register` -> load the input
//! through [`PgHandle::send_slice_mut`] -> `all_reduce` -> read the result
//! through [`PgHandle::send_slice`] -> `close`.

pub mod collectives;
pub mod exchange;
pub mod handle;
pub mod pattern;
pub mod reduce;

pub use handle::{ConnectConfig, PgHandle};
pub use reduce::{Element, ElementType, ReduceOp};

use std::fmt;
use std::io;

/// Everything that can go wrong in the process-group layer.
#[derive(Debug)]
pub enum PgError {
    /// Invalid rank, element type, operation, or handle usage.
    BadArg(&'static str),

    /// The host list itself is unusable.
    BadWorld(String),

    /// The element count is not a positive multiple of the world size.
    BadCount { count: usize, world_size: usize },

    /// Allocating or registering the data regions failed.
    RegisterFailed(String),

    /// Host resolution, side-channel connection, or record exchange failed.
    BootstrapFailed(String),

    /// Device, domain, queue, region, or state-transition setup failed.
    TransportInitFailed(soft_verbs::VerbsError),

    /// A completion with non-success status, or a failed post, aborted a
    /// collective. The handle is tainted afterwards.
    TransportError(String),

    /// Operation attempted on a handle whose previous collective failed.
    HandleTainted,
}

impl std::error::Error for PgError {}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadArg(why) => write!(f, "invalid argument: {why}"),
            Self::BadWorld(why) => write!(f, "invalid world: {why}"),
            Self::BadCount { count, world_size } => write!(
                f,
                "count {count} is not a positive multiple of the world size {world_size}"
            ),
            Self::RegisterFailed(why) => write!(f, "region registration failed: {why}"),
            Self::BootstrapFailed(why) => write!(f, "bootstrap failed: {why}"),
            Self::TransportInitFailed(e) => write!(f, "transport setup failed: {e}"),
            Self::TransportError(why) => write!(f, "transport error: {why}"),
            Self::HandleTainted => {
                write!(f, "handle tainted by an earlier transport error")
            }
        }
    }
}

/// IO errors in this crate only arise on the side channel.
impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        Self::BootstrapFailed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PgError>;
