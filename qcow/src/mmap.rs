// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Read-only memory mapped view of an image file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::slice;

use log::debug;

use crate::{Error, Result};

/// Immutable, bounds-checked byte window.
pub trait ByteSource {
    /// Size of the window, fixed for the lifetime of the source.
    fn size(&self) -> u64;

    /// Returns exactly `length` bytes starting at `offset`.
    fn read(&self, offset: u64, length: usize) -> Result<&[u8]>;
}

// Returns the in-bounds range for a read, or `OutOfBounds` if any byte of it
// lies past `size`.
fn checked_range(offset: u64, length: usize, size: u64) -> Result<(usize, usize)> {
    let out_of_bounds = Error::OutOfBounds {
        offset,
        length,
        size,
    };
    let end = offset
        .checked_add(length as u64)
        .filter(|&end| end <= size)
        .ok_or(out_of_bounds)?;
    // `end <= size` and `size` is the length of a slice in memory.
    Ok((offset as usize, end as usize))
}

impl ByteSource for [u8] {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read(&self, offset: u64, length: usize) -> Result<&[u8]> {
        let (start, end) = checked_range(offset, length, self.size())?;
        Ok(&self[start..end])
    }
}

/// An open image file and a shared read-only mapping of its full length.
///
/// The size is sampled once when the mapping is created. Dropping the value
/// unmaps the region and closes the file.
#[derive(Debug)]
pub struct MappedFile {
    // Held open for as long as the mapping is live.
    _file: File,
    // None for an empty file, which cannot be mapped.
    addr: Option<NonNull<u8>>,
    size: u64,
}

impl MappedFile {
    /// Opens `path` read-write and maps it. Nothing is ever written.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<MappedFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::OpeningFile)?;
        MappedFile::from_file(file)
    }

    /// Maps an already open file. Only read access is required.
    pub fn from_file(file: File) -> Result<MappedFile> {
        let size = file.metadata().map_err(Error::GettingFileSize)?.len();
        if size == 0 {
            return Ok(MappedFile {
                _file: file,
                addr: None,
                size,
            });
        }

        let len = usize::try_from(size)
            .map_err(|_| Error::MappingFile(io::Error::from_raw_os_error(libc::EFBIG)))?;
        // SAFETY: a fresh mapping of a valid descriptor; the kernel picks the
        // address and the result is checked against MAP_FAILED.
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(Error::MappingFile(io::Error::last_os_error()));
        }
        debug!("Mapped {size} bytes at {ret:p}");

        Ok(MappedFile {
            _file: file,
            addr: NonNull::new(ret as *mut u8),
            size,
        })
    }

    fn as_slice(&self) -> &[u8] {
        match self.addr {
            // SAFETY: the region is `size` bytes long, mapped readable and stays
            // mapped until `self` is dropped.
            Some(addr) => unsafe { slice::from_raw_parts(addr.as_ptr(), self.size as usize) },
            None => &[],
        }
    }
}

impl ByteSource for MappedFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, offset: u64, length: usize) -> Result<&[u8]> {
        self.as_slice().read(offset, length)
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Some(addr) = self.addr.take() {
            // SAFETY: `addr` and `size` describe the mapping created in
            // `from_file`, and no borrow of it can outlive `self`.
            let ret = unsafe { libc::munmap(addr.as_ptr() as *mut libc::c_void, self.size as usize) };
            if ret == -1 {
                debug!("munmap failed: {}", io::Error::last_os_error());
            }
        }
    }
}
