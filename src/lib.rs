// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared storage external lease index.
//!
//! A lease is a cluster-wide mutual exclusion token living at a fixed
//! offset on shared storage, acquired and released by an external
//! lock manager.  This crate manages the index mapping lease ids to
//! their offsets on a dedicated leases volume: any cooperating host
//! can locate the slot for a lease id, allocate new slots, release
//! them, and rebuild the mapping by scanning the slot area.  See the
//! [`volume`] module for the on-disk format.
//!
//! The crate also carries the [`mvdb`] managed volume database, a
//! small embedded store persisting connection details for volumes
//! attached through external storage providers.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod direct;
pub mod index;
pub mod lockman;
pub mod mvdb;
pub mod record;
pub mod result;
pub mod volume;

pub use result::{Error, Result};
