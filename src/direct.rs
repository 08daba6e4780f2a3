// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Unbuffered block I/O.
//!
//! Index updates must be observable by other hosts as soon as they
//! reach storage, and reads must see what other hosts wrote, so the
//! page cache cannot sit between us and the device.  All index I/O
//! therefore goes through a file opened with `O_DIRECT`.  The kernel
//! transfers directly between our buffers and the device, which is
//! why every buffer must be aligned to the storage sector size, in
//! both base address and length.
//!
//! [`AlignedBuf`] is the only buffer type the index layer uses; it is
//! allocated at sector alignment so the contract holds by
//! construction.  [`DirectFile`] still validates every buffer it is
//! handed and fails with `InvalidParameter` rather than fixing up
//! alignment with a copy.

use std::alloc::{self, Layout};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::slice;

use crate::result::{Error, Result};

/// The size of a storage sector, in bytes.
///
/// TODO: support 4K-native storage by taking the sector size from the
/// lock manager alignment instead of hardcoding the legacy value.
pub const BLOCK_SIZE: usize = 512;

/// A heap buffer aligned to [`BLOCK_SIZE`], suitable for direct I/O.
///
/// The length is always a multiple of the block size.  The buffer is
/// zero-filled on allocation and freed when dropped.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedBuf {
    /// Returns a new zero-filled buffer of `len` bytes.  `len` must be
    /// a non-zero multiple of the block size.
    pub fn zeroed(len: usize) -> AlignedBuf {
        assert!(len > 0 && len % BLOCK_SIZE == 0);
        let layout = buf_layout(len);
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };
        AlignedBuf { ptr, len }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), buf_layout(self.len)) }
    }
}

// The buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

fn buf_layout(len: usize) -> Layout {
    Layout::from_size_align(len, BLOCK_SIZE).expect("valid buffer layout")
}

/// A file opened for direct I/O.
///
/// All reads and writes bypass the page cache; buffers must satisfy
/// the alignment contract above.  The file is closed when the value
/// is dropped.
pub struct DirectFile {
    file: File,
    path: PathBuf,
}

impl DirectFile {
    /// Opens `path` for reading and writing with direct I/O.  The
    /// file must exist.
    pub fn open(path: &Path) -> Result<DirectFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)?;
        Ok(DirectFile { file, path: path.to_owned() })
    }

    /// Returns the path this file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seeks to the given position, returning the new offset from the
    /// start of the file.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file.seek(pos)?)
    }

    /// Fills `buf` from the current position, retrying interrupted
    /// reads.  Returns the number of bytes read, which is smaller
    /// than the buffer only at end of file.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        check_aligned(buf.as_ptr(), buf.len())?;
        let mut pos = 0;
        while pos < buf.len() {
            match self.file.read(&mut buf[pos..]) {
                Ok(0) => break,
                Ok(n) => pos += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(pos)
    }

    /// Writes all of `buf` at the current position, retrying
    /// interrupted writes.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        check_aligned(buf.as_ptr(), buf.len())?;
        let mut pos = 0;
        while pos < buf.len() {
            match self.file.write(&buf[pos..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    )
                    .into());
                }
                Ok(n) => pos += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Blocks until all written data reached storage.
    pub fn sync(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }
}

impl AsRawFd for DirectFile {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Validates the direct I/O buffer contract.
fn check_aligned(ptr: *const u8, len: usize) -> Result<()> {
    if (ptr as usize) % BLOCK_SIZE != 0 {
        return Err(Error::invalid_parameter(
            "buf",
            format!("address {ptr:p} is not aligned to {BLOCK_SIZE}"),
        ));
    }
    if len == 0 || len % BLOCK_SIZE != 0 {
        return Err(Error::invalid_parameter(
            "buf",
            format!("length {len} is not a multiple of {BLOCK_SIZE}"),
        ));
    }
    Ok(())
}
