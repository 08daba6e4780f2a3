// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! External leases volume.
//!
//! External leases are stored in a dedicated volume, a file or block
//! device partitioned into equal slots of [`SLOT_SIZE`] bytes.  Each
//! user slot holds one cluster-wide lease, acquired and released by
//! the external lock manager.  The lock manager does not keep the
//! mapping between a lease name and its slot; that gap is what this
//! module fills.
//!
//! The volume layout is fixed:
//!
//! 1. Lockspace slot, reserved for the lock manager and unused here.
//! 2. Index slot, owned by this module.
//! 3. Private resource slot, reserved for the lock manager.
//! 4. User lease slots.
//!
//! The index maps lease ids to record numbers; the offset of a lease
//! is computed from its record number, never stored authoritatively,
//! so two records can not point to the same slot.  The lock manager
//! itself keeps the lockspace and resource names in the lease slot,
//! which is why the index is only a cache: [`rebuild_index`] can
//! regenerate it by scanning the slots.
//!
//! Creating and removing a lease are two-phase mutations.  The record
//! is first flushed with the updating flag set, then the lock manager
//! writes or clears the resource at the lease offset, and only then
//! is the record flushed in its final state.  A crash between the
//! phases leaves the updating flag on storage, and readers treat such
//! a record as not yet committed.
//!
//! Mutating the index must be serialized across hosts by the caller;
//! the per-lease resources the lock manager hands out are orthogonal
//! to that.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use static_assertions::const_assert;

use crate::direct::{BLOCK_SIZE, DirectFile};
use crate::index::{INDEX_SIZE, MAX_RECORDS, VolumeIndex};
use crate::lockman::LockManager;
use crate::record::{IndexMetadata, RESOURCE_SIZE, Record};
use crate::result::{Error, Result};

/// Size of a single lease slot.  This is the area the lock manager
/// requires for one lease: 1MiB for 512 byte sectors.
pub const SLOT_SIZE: u64 = 2048 * BLOCK_SIZE as u64;

// Volume layout - offsets from the start of the volume.
pub const LOCKSPACE_BASE: u64 = 0;
pub const INDEX_BASE: u64 = SLOT_SIZE;
pub const PRIVATE_RESOURCE_BASE: u64 = 2 * SLOT_SIZE;
pub const USER_RESOURCE_BASE: u64 = 3 * SLOT_SIZE;

const_assert!(INDEX_SIZE as u64 <= SLOT_SIZE);

/// Returns the offset of the user lease slot for record `recnum`.
pub fn lease_offset(recnum: usize) -> u64 {
    USER_RESOURCE_BASE + recnum as u64 * SLOT_SIZE
}

/// The location of a lease, everything a caller needs to hand the
/// lock manager when acquiring or releasing it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaseInfo {
    /// Lock manager lockspace name.
    pub lockspace: String,
    /// Lock manager resource name.
    pub resource: String,
    /// Path to the lease file or block device.
    pub path: PathBuf,
    /// Offset of the lease in path.
    pub offset: u64,
}

/// The state of one allocated lease, as reported by
/// [`LeasesVolume::leases`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeaseState {
    pub offset: u64,
    pub updating: bool,
}

/// Volume holding external leases.
///
/// The index is read when the volume is created and never read again;
/// to see changes made by another host, create a new instance.
/// Changes made through this instance are flushed to storage before
/// the in-memory index is updated.
pub struct LeasesVolume {
    lockman: Arc<dyn LockManager>,
    lockspace: String,
    file: DirectFile,
    index: VolumeIndex,
}

impl LeasesVolume {
    /// Loads the index from `file`, which must stay open for the
    /// lifetime of the volume.
    pub fn new(
        lockman: Arc<dyn LockManager>,
        lockspace: &str,
        mut file: DirectFile,
    ) -> Result<LeasesVolume> {
        check_name("lockspace", lockspace)?;
        debug!("loading index for lockspace {lockspace:?} from {:?}", file.path());
        let index = VolumeIndex::new(&mut file)?;
        Ok(LeasesVolume { lockman, lockspace: lockspace.to_string(), file, index })
    }

    pub fn lockspace(&self) -> &str {
        &self.lockspace
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Looks up a lease by id.
    ///
    /// Fails with `NoSuchLease` if the lease is not in the index,
    /// `LeaseUpdating` if an earlier mutation did not commit, and
    /// `InvalidRecord` if the record is corrupted.
    pub fn lookup(&self, lease_id: &str) -> Result<LeaseInfo> {
        check_name("lease_id", lease_id)?;
        debug!("looking up lease {lease_id:?} in lockspace {:?}", self.lockspace);
        let recnum = self
            .index
            .find_record(lease_id)
            .ok_or_else(|| Error::NoSuchLease(lease_id.to_string()))?;
        let record = self.index.read_record(recnum)?;
        if record.is_updating() {
            return Err(Error::LeaseUpdating(lease_id.to_string()));
        }
        Ok(self.lease_info(lease_id, recnum))
    }

    /// Adds a lease to the index and materializes its resource via
    /// the lock manager.
    ///
    /// Fails with `LeaseExists` if the lease is already allocated,
    /// `LeaseUpdating` if an earlier mutation of the same id did not
    /// commit, and `NoSpace` if all records are in use.  If the lock
    /// manager fails, the record is left marked updating; the caller
    /// may retry or rebuild the index.
    pub fn add(&mut self, lease_id: &str) -> Result<LeaseInfo> {
        check_name("lease_id", lease_id)?;
        info!("adding lease {lease_id:?} in lockspace {:?}", self.lockspace);
        if let Some(recnum) = self.index.find_record(lease_id) {
            let record = self.index.read_record(recnum)?;
            return Err(if record.is_updating() {
                Error::LeaseUpdating(lease_id.to_string())
            } else {
                Error::LeaseExists(lease_id.to_string())
            });
        }
        let recnum = self
            .index
            .find_free_record()
            .ok_or_else(|| Error::NoSpace(lease_id.to_string()))?;
        let offset = lease_offset(recnum);

        self.write_record(recnum, &Record::new(lease_id, offset, true))?;
        self.lockman.write_resource(
            &self.lockspace,
            lease_id,
            &[(self.file.path(), offset)],
        )?;
        self.write_record(recnum, &Record::new(lease_id, offset, false))?;

        Ok(self.lease_info(lease_id, recnum))
    }

    /// Removes a lease from the index, clearing its resource via the
    /// lock manager.
    ///
    /// Fails with `NoSuchLease` if the lease is not in the index.  If
    /// the lock manager fails, the record is left marked updating.
    pub fn remove(&mut self, lease_id: &str) -> Result<()> {
        check_name("lease_id", lease_id)?;
        info!("removing lease {lease_id:?} in lockspace {:?}", self.lockspace);
        let recnum = self
            .index
            .find_record(lease_id)
            .ok_or_else(|| Error::NoSuchLease(lease_id.to_string()))?;
        let offset = lease_offset(recnum);

        self.write_record(recnum, &Record::new(lease_id, offset, true))?;
        // The lock manager has no way to remove a resource; writing a
        // header with empty lockspace and resource names clears the
        // slot.
        self.lockman.write_resource("", "", &[(self.file.path(), offset)])?;
        self.write_record(recnum, &Record::free(offset))?;

        Ok(())
    }

    /// Returns the state of every allocated lease in the index.
    pub fn leases(&self) -> Result<BTreeMap<String, LeaseState>> {
        debug!("getting all leases for lockspace {:?}", self.lockspace);
        let mut leases = BTreeMap::new();
        for recnum in 0..MAX_RECORDS {
            let record = self.index.read_record(recnum)?;
            if !record.is_free() {
                leases.insert(
                    record.resource().to_string(),
                    LeaseState {
                        offset: lease_offset(recnum),
                        updating: record.is_updating(),
                    },
                );
            }
        }
        Ok(leases)
    }

    fn lease_info(&self, lease_id: &str, recnum: usize) -> LeaseInfo {
        LeaseInfo {
            lockspace: self.lockspace.clone(),
            resource: lease_id.to_string(),
            path: self.file.path().to_owned(),
            offset: lease_offset(recnum),
        }
    }

    /// Writes record `recnum` to storage atomically: copy the block
    /// holding the record, modify the copy, flush the single block.
    /// The in-memory index is updated only after the flush succeeds.
    fn write_record(&mut self, recnum: usize, record: &Record) -> Result<()> {
        let mut block = self.index.copy_block(recnum)?;
        block.write_record(recnum, record)?;
        block.dump(&mut self.file)?;
        self.index.write_record(recnum, record)
    }
}

/// Formats the volume index, deleting all existing records.
///
/// Should be used only when creating a new leases volume, or when the
/// volume is being repaired.  Not atomic: the volume is flagged
/// updating on storage before the records are rewritten and the flag
/// is cleared only after the rewrite completed, so an interrupted
/// format leaves the volume detectably unusable and the operation can
/// be tried again.
pub fn format_index(lockspace: &str, file: &mut DirectFile) -> Result<()> {
    check_name("lockspace", lockspace)?;
    info!("formatting index for lockspace {lockspace:?} on {:?}", file.path());
    let mut index = VolumeIndex::new(file)?;

    index.set_metadata(&IndexMetadata::new(lockspace, true))?;
    index.copy_metadata_block().dump(file)?;

    for recnum in 0..MAX_RECORDS {
        index.write_record(recnum, &Record::free(lease_offset(recnum)))?;
    }
    index.dump(file)?;

    index.set_metadata(&IndexMetadata::new(lockspace, false))?;
    index.copy_metadata_block().dump(file)
}

/// Rebuilds the volume index from the resources actually present on
/// storage.
///
/// Every user lease slot is read through the lock manager; a resource
/// registered under `lockspace` becomes a committed record and
/// anything else becomes a free record.  Must be invoked only when no
/// host is actively using the volume.  Uses the same updating flag
/// discipline as [`format_index`].
pub fn rebuild_index(
    lockspace: &str,
    file: &mut DirectFile,
    lockman: &dyn LockManager,
) -> Result<()> {
    check_name("lockspace", lockspace)?;
    info!("rebuilding index for lockspace {lockspace:?} on {:?}", file.path());
    let path = file.path().to_owned();
    let mut index = VolumeIndex::new(file)?;

    index.set_metadata(&IndexMetadata::new(lockspace, true))?;
    index.copy_metadata_block().dump(file)?;

    for recnum in 0..MAX_RECORDS {
        let offset = lease_offset(recnum);
        let record = match lockman.read_resource(&path, offset)? {
            Some(res) if res.lockspace == lockspace && !res.resource.is_empty() => {
                Record::new(&res.resource, offset, false)
            }
            _ => Record::free(offset),
        };
        index.write_record(recnum, &record)?;
    }
    index.dump(file)?;

    index.set_metadata(&IndexMetadata::new(lockspace, false))?;
    index.copy_metadata_block().dump(file)
}

/// Validates a lockspace or lease id: non-empty printable ASCII, at
/// most one resource field wide.
fn check_name(name: &'static str, value: &str) -> Result<()> {
    if value.is_empty()
        || value.len() > RESOURCE_SIZE
        || !value.is_ascii()
        || value.bytes().any(|b| b == 0 || b == b'\n')
    {
        return Err(Error::invalid_parameter(name, format!("{value:?}")));
    }
    Ok(())
}
