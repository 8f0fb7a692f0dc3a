// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Pinned, page-aligned buffers that back memory regions.

use std::io;

use crate::{Result, VerbsError};

/// The system page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 {
        4096
    } else {
        n as usize
    }
}

/// A contiguous anonymous mapping that stays at a fixed address for its
/// whole lifetime, which is what lets a remote peer address it as
/// `base + offset`.
pub struct PinnedBuffer {
    base: *mut u8,
    len: usize,
    map_len: usize,
}

impl PinnedBuffer {
    /// Map `len` bytes, rounded up to whole pages. The memory starts zeroed.
    pub fn alloc(len: usize) -> Result<PinnedBuffer> {
        if len == 0 {
            return Err(VerbsError::RegisterFailed("zero-length buffer"));
        }

        let page = page_size();
        let map_len = len.div_ceil(page) * page;

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if base == libc::MAP_FAILED {
            return Err(VerbsError::Io(io::Error::last_os_error()));
        }

        Ok(PinnedBuffer {
            base: base as *mut u8,
            len,
            map_len,
        })
    }

    pub fn base_addr(&self) -> u64 {
        self.base as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is live and at least `len` bytes long.
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` rules out aliasing safe references.
        unsafe { std::slice::from_raw_parts_mut(self.base, self.len) }
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        // SAFETY: base and map_len describe the mapping created in alloc().
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_page_aligned_and_zeroed() {
        let buf = PinnedBuffer::alloc(100).unwrap();
        assert_eq!(buf.base_addr() as usize % page_size(), 0);
        assert_eq!(buf.len(), 100);
        assert!(buf.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn zero_length_rejected() {
        assert!(matches!(
            PinnedBuffer::alloc(0),
            Err(VerbsError::RegisterFailed(_))
        ));
    }

    #[test]
    fn writes_visible_through_slice() {
        let mut buf = PinnedBuffer::alloc(16).unwrap();
        buf.as_mut_slice().copy_from_slice(&[7u8; 16]);
        assert_eq!(buf.as_slice(), &[7u8; 16]);
    }
}
