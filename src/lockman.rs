// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The external cluster lock manager.
//!
//! The actual mutual exclusion for leases is owned by an external
//! lock manager daemon; this module defines the narrow capability the
//! index code consumes from it.  A resource is written at a `(path,
//! offset)` location during lease creation and cleared during
//! removal, and the names stored in a slot can be read back, which is
//! how [`rebuild_index`](crate::volume::rebuild_index) regenerates an
//! index from storage.
//!
//! Implementations must not be assumed idempotent: a caller retrying
//! after a partial failure has to check the record's updating flag
//! first.
//!
//! [`DirectLockManager`] is the built-in implementation backing the
//! administration tool and the tests.  It keeps the resource names in
//! the first block of the lease slot using the same single-block
//! O_DIRECT discipline as the index.  A clustered deployment
//! substitutes the daemon-backed implementation through the trait;
//! the header format here is private to this implementation.

use std::io::SeekFrom;
use std::path::Path;

use log::debug;

use crate::direct::{AlignedBuf, BLOCK_SIZE, DirectFile};
use crate::record::{RESOURCE_SIZE, get_field, put_field};
use crate::result::{Error, Result};

/// The names stored in a lease slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceInfo {
    pub lockspace: String,
    pub resource: String,
}

/// The capability the index code consumes from the lock manager.
pub trait LockManager: Send + Sync {
    /// Writes a resource header for `(lockspace, resource)` at every
    /// `(path, offset)` given.  When both names are empty the slot is
    /// cleared.
    fn write_resource(
        &self,
        lockspace: &str,
        resource: &str,
        disks: &[(&Path, u64)],
    ) -> Result<()>;

    /// Reads the resource header at `(path, offset)`.  Returns `None`
    /// when the slot holds no resource.
    fn read_resource(&self, path: &Path, offset: u64) -> Result<Option<ResourceInfo>>;
}

/// Magic number identifying a resource header block.
const RESOURCE_MAGIC: u32 = 0x06152010;

// Offsets of the resource header fields.
const RES_LOCKSPACE: usize = 4 + 1;
const RES_RESOURCE: usize = RES_LOCKSPACE + RESOURCE_SIZE + 1;

/// Lock manager implementation working directly on the volume.
pub struct DirectLockManager;

impl LockManager for DirectLockManager {
    fn write_resource(
        &self,
        lockspace: &str,
        resource: &str,
        disks: &[(&Path, u64)],
    ) -> Result<()> {
        let mut buf = AlignedBuf::zeroed(BLOCK_SIZE);
        if !(lockspace.is_empty() && resource.is_empty()) {
            encode_header(&mut buf, lockspace, resource)?;
        }
        for &(path, offset) in disks {
            debug!("writing resource {resource:?} at {path:?}:{offset}");
            let mut file = DirectFile::open(path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write(&buf)?;
            file.sync()?;
        }
        Ok(())
    }

    fn read_resource(&self, path: &Path, offset: u64) -> Result<Option<ResourceInfo>> {
        let mut file = DirectFile::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = AlignedBuf::zeroed(BLOCK_SIZE);
        if file.read_into(&mut buf)? < BLOCK_SIZE {
            return Ok(None);
        }
        parse_header(&buf)
    }
}

fn encode_header(buf: &mut [u8], lockspace: &str, resource: &str) -> Result<()> {
    buf[..4].copy_from_slice(&RESOURCE_MAGIC.to_be_bytes());
    put_field(
        &mut buf[RES_LOCKSPACE..RES_LOCKSPACE + RESOURCE_SIZE],
        "lockspace",
        lockspace,
    )?;
    put_field(
        &mut buf[RES_RESOURCE..RES_RESOURCE + RESOURCE_SIZE],
        "resource",
        resource,
    )?;
    Ok(())
}

fn parse_header(buf: &[u8]) -> Result<Option<ResourceInfo>> {
    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != RESOURCE_MAGIC {
        return Ok(None);
    }
    let lockspace = get_field(&buf[RES_LOCKSPACE..RES_LOCKSPACE + RESOURCE_SIZE])
        .ok_or_else(|| Error::LockManager("cannot decode resource lockspace".to_string()))?;
    let resource = get_field(&buf[RES_RESOURCE..RES_RESOURCE + RESOURCE_SIZE])
        .ok_or_else(|| Error::LockManager("cannot decode resource name".to_string()))?;
    Ok(Some(ResourceInfo { lockspace, resource }))
}
