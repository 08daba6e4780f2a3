// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::Display;
use std::io;

use thiserror::Error;

/// Various errors.
///
/// Lease errors carry the lease id they refer to; record errors carry
/// the raw bytes that failed to parse, so corruption can be diagnosed
/// from the error alone.
#[derive(Debug, Error)]
pub enum Error {
    #[error("No such lease {0}")]
    NoSuchLease(String),

    #[error("Lease {0} exists")]
    LeaseExists(String),

    #[error("Lease {0} is updating")]
    LeaseUpdating(String),

    #[error("No space to add lease {0}")]
    NoSpace(String),

    #[error("Invalid record ({reason}): {:?}", String::from_utf8_lossy(.record))]
    InvalidRecord { reason: String, record: Vec<u8> },

    #[error("Invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: String },

    #[error("Lock manager error: {0}")]
    LockManager(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Managed volume with vol_id {0} not found")]
    NotFound(String),

    #[error("Volume with id {vol_id} already exists in the DB: {vol_info}")]
    VolumeAlreadyExists {
        vol_id: String,
        vol_info: serde_json::Value,
    },

    #[error("Operation on closed database connection")]
    Closed,

    #[error("Invalid database: {0}")]
    InvalidDatabase(String),

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Database transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Database table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Database storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Database commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Invalid volume data: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid_record(reason: impl Into<String>, record: &[u8]) -> Error {
        Error::InvalidRecord { reason: reason.into(), record: record.to_vec() }
    }

    pub(crate) fn invalid_parameter(name: &'static str, value: impl Display) -> Error {
        Error::InvalidParameter { name, value: value.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
