// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The TCP side channel: fixed-width records that publish endpoint
//! identifiers and region credentials between ring neighbors, and the
//! listen/dial/accept plumbing with bounded retry.
//!
//! Choreography: rank 0 dials its front neighbor first and then accepts
//! from its back neighbor; every other rank accepts from the back first and
//! then dials the front. One of the two symmetric wait cycles is broken at
//! rank 0, so no launch order can deadlock. On a dialed socket we speak
//! first; on an accepted socket the peer speaks first.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use log::{debug, trace};
use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn};

use crate::{PgError, Result};

/// Size in bytes of an encoded [`EndpointRecord`].
pub const ENDPOINT_RECORD_LEN: usize = 26;

/// Identifies one endpoint to the neighbor it will be wired to. All fields
/// little-endian on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointRecord {
    /// Local identifier of the device (the data-plane port).
    pub lid: u16,
    /// Queue pair number within the device.
    pub qpn: u32,
    /// Initial packet sequence number for the send queue.
    pub psn: u32,
    /// Global identifier (carries the interface IP).
    pub gid: [u8; 16],
}

impl EndpointRecord {
    pub fn encode(&self) -> [u8; ENDPOINT_RECORD_LEN] {
        let mut out = [0u8; ENDPOINT_RECORD_LEN];
        out[..2].copy_from_slice(&self.lid.to_le_bytes());
        out[2..6].copy_from_slice(&self.qpn.to_le_bytes());
        out[6..10].copy_from_slice(&self.psn.to_le_bytes());
        out[10..].copy_from_slice(&self.gid);
        out
    }

    pub fn decode(bytes: &[u8; ENDPOINT_RECORD_LEN]) -> EndpointRecord {
        EndpointRecord {
            lid: u16::from_le_bytes(bytes[..2].try_into().unwrap()),
            qpn: u32::from_le_bytes(bytes[2..6].try_into().unwrap()),
            psn: u32::from_le_bytes(bytes[6..10].try_into().unwrap()),
            gid: bytes[10..].try_into().unwrap(),
        }
    }

    pub fn write_to<S: Write>(&self, stream: &mut S) -> io::Result<()> {
        stream.write_all(&self.encode())
    }

    pub fn read_from<S: Read>(stream: &mut S) -> io::Result<EndpointRecord> {
        let mut bytes = [0u8; ENDPOINT_RECORD_LEN];
        stream.read_exact(&mut bytes)?;
        Ok(Self::decode(&bytes))
    }
}

/// Size in bytes of an encoded [`MemoryRecord`].
pub const MEMORY_RECORD_LEN: usize = 24;

/// Publishes the bases and remote keys of a process's registered regions,
/// so the back neighbor can address them with one-sided writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRecord {
    pub recv_base: u64,
    pub recv_key: u32,
    pub send_base: u64,
    pub send_key: u32,
}

impl MemoryRecord {
    pub fn encode(&self) -> [u8; MEMORY_RECORD_LEN] {
        let mut out = [0u8; MEMORY_RECORD_LEN];
        out[..8].copy_from_slice(&self.recv_base.to_le_bytes());
        out[8..12].copy_from_slice(&self.recv_key.to_le_bytes());
        out[12..20].copy_from_slice(&self.send_base.to_le_bytes());
        out[20..].copy_from_slice(&self.send_key.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; MEMORY_RECORD_LEN]) -> MemoryRecord {
        MemoryRecord {
            recv_base: u64::from_le_bytes(bytes[..8].try_into().unwrap()),
            recv_key: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            send_base: u64::from_le_bytes(bytes[12..20].try_into().unwrap()),
            send_key: u32::from_le_bytes(bytes[20..].try_into().unwrap()),
        }
    }

    pub fn write_to<S: Write>(&self, stream: &mut S) -> io::Result<()> {
        stream.write_all(&self.encode())
    }

    pub fn read_from<S: Read>(stream: &mut S) -> io::Result<MemoryRecord> {
        let mut bytes = [0u8; MEMORY_RECORD_LEN];
        stream.read_exact(&mut bytes)?;
        Ok(Self::decode(&bytes))
    }
}

/// Bind the bootstrap listener with `SO_REUSEADDR`, so a quick relaunch is
/// not blocked by sockets lingering in TIME_WAIT on the rank's port.
pub fn listen_with_reuse(port: u16) -> Result<TcpListener> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(|e| PgError::BootstrapFailed(format!("bootstrap socket: {e}")))?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)
        .map_err(|e| PgError::BootstrapFailed(format!("SO_REUSEADDR: {e}")))?;

    let addr = SockaddrIn::new(0, 0, 0, 0, port);
    socket::bind(fd.as_raw_fd(), &addr)
        .map_err(|e| PgError::BootstrapFailed(format!("bind port {port}: {e}")))?;

    let backlog = Backlog::new(8)
        .map_err(|e| PgError::BootstrapFailed(format!("listen backlog: {e}")))?;
    socket::listen(&fd, backlog)
        .map_err(|e| PgError::BootstrapFailed(format!("listen on port {port}: {e}")))?;

    debug!("bootstrap listener on port {port}");
    Ok(TcpListener::from(fd))
}

/// Dial a neighbor's bootstrap listener, retrying with exponential backoff
/// until `deadline` to ride out launch skew.
pub fn dial(host: &str, port: u16, deadline: Instant) -> Result<TcpStream> {
    const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
    const MAX_BACKOFF: Duration = Duration::from_secs(2);

    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0u32;
    loop {
        match TcpStream::connect((host, port)) {
            Ok(stream) => {
                debug!("connected to {host}:{port} after {attempt} retries");
                return Ok(stream);
            }
            Err(e) => {
                if Instant::now() + backoff >= deadline {
                    return Err(PgError::BootstrapFailed(format!(
                        "could not reach {host}:{port} after {attempt} retries: {e}"
                    )));
                }
                attempt += 1;
                trace!("retrying {host}:{port} (attempt {attempt}): {e}");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Accept one connection, polling until `deadline`.
pub fn accept_with_deadline(listener: &TcpListener, deadline: Instant) -> Result<TcpStream> {
    listener.set_nonblocking(true)?;

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted bootstrap connection from {peer}");
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(PgError::BootstrapFailed(
                        "timed out waiting for the back neighbor".to_string(),
                    ));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                return Err(PgError::BootstrapFailed(format!("accept: {e}")));
            }
        }
    }
}

/// Record exchange on a socket this side dialed: we speak first.
pub fn exchange_as_dialer(
    stream: &mut TcpStream,
    mine: &EndpointRecord,
) -> Result<EndpointRecord> {
    mine.write_to(stream)?;
    Ok(EndpointRecord::read_from(stream)?)
}

/// Record exchange on a socket this side accepted: the peer speaks first.
pub fn exchange_as_acceptor(
    stream: &mut TcpStream,
    mine: &EndpointRecord,
) -> Result<EndpointRecord> {
    let theirs = EndpointRecord::read_from(stream)?;
    mine.write_to(stream)?;
    Ok(theirs)
}
