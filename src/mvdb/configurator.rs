// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Managed volume database configuration.
//!
//! Idempotent checks and repairs for the database file: does it
//! exist, is it owned by the service account, does it carry the
//! expected schema version.  The answers are deliberately tri-valued;
//! an unreadable or mismatching database answers [`Answer::Maybe`]
//! rather than an error, so service start-up never crashes on a
//! database that needs manual attention.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::{debug, info, warn};

use crate::mvdb;
use crate::result::{Error, Result};

/// Configuration state of the managed volume database.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Answer {
    /// The database is ready for use.
    Yes,
    /// The database does not exist and needs to be created.
    No,
    /// The database exists but its state could not be verified.
    Maybe,
}

/// The service account that must own the database file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Reports whether the managed volume database is ready for use.
pub fn isconfigured(path: &Path, owner: Owner) -> Answer {
    check_db(path, owner)
}

/// Creates the managed volume database if it is missing.
///
/// A database that exists but could not be verified is not touched;
/// repairing it is a manual operation.
pub fn configure(path: &Path, owner: Owner) -> Result<()> {
    match check_db(path, owner) {
        Answer::Yes => Ok(()),
        Answer::No => {
            mvdb::create(path)?;
            std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))?;
            Ok(())
        }
        Answer::Maybe => Err(Error::InvalidDatabase(
            "managed volume database needs manual repair".to_string(),
        )),
    }
}

fn check_db(path: &Path, owner: Owner) -> Answer {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("database file {path:?} does not exist");
            return Answer::No;
        }
        Err(e) => {
            warn!("cannot stat database file {path:?}: {e}");
            return Answer::Maybe;
        }
    };

    if meta.uid() != owner.uid || meta.gid() != owner.gid {
        warn!(
            "database file {path:?} has ownership {}:{}, expected {}:{}",
            meta.uid(),
            meta.gid(),
            owner.uid,
            owner.gid
        );
        return Answer::Maybe;
    }

    match check_version(path) {
        Ok(true) => Answer::Yes,
        Ok(false) => Answer::Maybe,
        Err(e) => {
            warn!("failed to query database version: {e}");
            Answer::Maybe
        }
    }
}

fn check_version(path: &Path) -> Result<bool> {
    let db = mvdb::open(path)?;
    let info = db.version_info()?;
    debug!("database version={}", info.version);
    if info.version != mvdb::VERSION {
        warn!(
            "database version ({}) is not the expected one ({})",
            info.version,
            mvdb::VERSION
        );
    }
    Ok(info.version == mvdb::VERSION)
}
