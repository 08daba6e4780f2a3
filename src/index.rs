// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory image of the index slot.
//!
//! The index is read from storage once, when the [`VolumeIndex`] is
//! created, and never read again; callers who need fresh state create
//! a new index.  Mutations work on the in-memory image and reach
//! storage through one of two paths: a whole-image [`VolumeIndex::dump`],
//! which is not atomic, or a [`RecordBlock`] flush, which writes a
//! single block and is the only atomic primitive cross-host readers
//! can rely on.
//!
//! Each record is fully contained in a single block, so a block flush
//! updates at most one record observably while leaving its neighbors
//! exactly as the image holds them.

use std::io::{self, SeekFrom};

use log::debug;
use static_assertions::const_assert;

use crate::direct::{AlignedBuf, BLOCK_SIZE, DirectFile};
use crate::record::{IndexMetadata, RECORD_SIZE, RESOURCE_SIZE, Record};
use crate::result::{Error, Result};
use crate::volume::INDEX_BASE;

/// The first block of the index holds the metadata block.
pub const METADATA_SIZE: usize = BLOCK_SIZE;

/// Offset of the first record from the start of the index.
pub const RECORD_BASE: usize = METADATA_SIZE;

/// The number of lease records supported.  The index slot could hold
/// about 16000 records, but a data center is unlikely to need more
/// than 2000 leases; double that to be on the safe side.  Note that
/// 1024 leases already need 1GiB of lease space.
pub const MAX_RECORDS: usize = 4000;

/// Size of the index image read from and written to storage.
pub const INDEX_SIZE: usize = METADATA_SIZE + MAX_RECORDS * RECORD_SIZE;

// Records never straddle a block boundary, and the image is directly
// transferable with block granularity.
const_assert!(BLOCK_SIZE % RECORD_SIZE == 0);
const_assert!(INDEX_SIZE % BLOCK_SIZE == 0);

/// The index, maintaining volume metadata and the mapping from lease
/// id to lease offset.
pub struct VolumeIndex {
    buf: AlignedBuf,
}

impl VolumeIndex {
    /// Reads the index image from the volume.
    pub fn new(file: &mut DirectFile) -> Result<VolumeIndex> {
        debug!("reading index from {:?}", file.path());
        let mut buf = AlignedBuf::zeroed(INDEX_SIZE);
        file.seek(SeekFrom::Start(INDEX_BASE))?;
        let nread = file.read_into(&mut buf)?;
        if nread < INDEX_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read loading index from {:?}", file.path()),
            )
            .into());
        }
        Ok(VolumeIndex { buf })
    }

    /// Searches for the record holding `resource`, returning its
    /// record number.  The scan advances in whole records, so a lease
    /// id showing up inside another record's field can never produce
    /// a mis-aligned match.  Searching for the empty resource finds
    /// the first free record.
    pub fn find_record(&self, resource: &str) -> Option<usize> {
        if resource.len() > RESOURCE_SIZE || !resource.is_ascii() {
            return None;
        }
        let mut prefix = [0u8; RESOURCE_SIZE + 1];
        prefix[..resource.len()].copy_from_slice(resource.as_bytes());
        self.records()
            .chunks_exact(RECORD_SIZE)
            .position(|rec| rec[..RESOURCE_SIZE + 1] == prefix)
    }

    /// Returns the number of the first free record.
    pub fn find_free_record(&self) -> Option<usize> {
        self.find_record("")
    }

    /// Decodes record `recnum` from the image.
    pub fn read_record(&self, recnum: usize) -> Result<Record> {
        let off = record_offset(recnum)?;
        Record::from_bytes(&self.buf[off..off + RECORD_SIZE])
    }

    /// Writes `record` at `recnum`, in the image only.  The caller is
    /// responsible for flushing the record to storage first, so the
    /// image never claims state storage does not have.
    pub fn write_record(&mut self, recnum: usize, record: &Record) -> Result<()> {
        let off = record_offset(recnum)?;
        let bytes = record.to_bytes()?;
        self.buf[off..off + RECORD_SIZE].copy_from_slice(&bytes);
        Ok(())
    }

    /// Decodes the metadata block from the image.
    pub fn metadata(&self) -> Result<IndexMetadata> {
        IndexMetadata::from_bytes(&self.buf[..METADATA_SIZE])
    }

    /// Writes the metadata block, in the image only.
    pub fn set_metadata(&mut self, md: &IndexMetadata) -> Result<()> {
        let bytes = md.to_bytes()?;
        self.buf[..METADATA_SIZE].copy_from_slice(&bytes);
        Ok(())
    }

    /// Returns a copy of the block containing record `recnum`,
    /// suitable for an atomic single-block flush.
    pub fn copy_block(&self, recnum: usize) -> Result<RecordBlock> {
        let off = record_offset(recnum)?;
        Ok(RecordBlock::copy_from(&self.buf, off - off % BLOCK_SIZE))
    }

    /// Returns a copy of the metadata block.
    pub fn copy_metadata_block(&self) -> RecordBlock {
        RecordBlock::copy_from(&self.buf, 0)
    }

    /// Writes the entire image to the volume and waits until the data
    /// reaches storage.  This is not atomic; if the operation fails,
    /// some blocks may not be written.
    pub fn dump(&self, file: &mut DirectFile) -> Result<()> {
        file.seek(SeekFrom::Start(INDEX_BASE))?;
        file.write(&self.buf)?;
        file.sync()
    }

    fn records(&self) -> &[u8] {
        &self.buf[RECORD_BASE..]
    }
}

/// A block sized copy of part of the index image.
///
/// Mutations are local to the copy; [`RecordBlock::dump`] writes the
/// block back to the volume in a single device write, so the block is
/// either fully written to storage or not at all.
pub struct RecordBlock {
    buf: AlignedBuf,
    offset: usize,
}

impl RecordBlock {
    fn copy_from(index_buf: &[u8], offset: usize) -> RecordBlock {
        let mut buf = AlignedBuf::zeroed(BLOCK_SIZE);
        buf.copy_from_slice(&index_buf[offset..offset + BLOCK_SIZE]);
        RecordBlock { buf, offset }
    }

    /// Writes `record` at `recnum`, which must lie inside this block.
    pub fn write_record(&mut self, recnum: usize, record: &Record) -> Result<()> {
        let off = self.block_offset(recnum)?;
        let bytes = record.to_bytes()?;
        self.buf[off..off + RECORD_SIZE].copy_from_slice(&bytes);
        Ok(())
    }

    /// Writes the block to the volume and waits until the data
    /// reaches storage.
    pub fn dump(&self, file: &mut DirectFile) -> Result<()> {
        file.seek(SeekFrom::Start(INDEX_BASE + self.offset as u64))?;
        file.write(&self.buf)?;
        file.sync()
    }

    fn block_offset(&self, recnum: usize) -> Result<usize> {
        let off = record_offset(recnum)?;
        if off < self.offset || off + RECORD_SIZE > self.offset + BLOCK_SIZE {
            return Err(Error::invalid_parameter(
                "recnum",
                format!("record {recnum} is out of range for block at {}", self.offset),
            ));
        }
        Ok(off - self.offset)
    }
}

fn record_offset(recnum: usize) -> Result<usize> {
    if recnum >= MAX_RECORDS {
        return Err(Error::invalid_parameter("recnum", recnum));
    }
    Ok(RECORD_BASE + recnum * RECORD_SIZE)
}
