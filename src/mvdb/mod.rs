// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Managed volume database.
//!
//! Stores connection details about managed volumes in an embedded
//! key/value store: one database file holding three named tables.
//! `volumes` maps a volume id to its JSON info, `multipaths` is the
//! reverse index from a multipath device id to the volume owning it,
//! and `versions` records the schema history under zero padded
//! decimal keys so the newest version is always the last key.
//!
//! The store must be opened exactly once per process; reopening it
//! would break the file locks when one of the instances closes.  The
//! environment is therefore a process-wide, reference counted
//! singleton: the first [`open`] creates it, later opens share it,
//! and the last handle dropped tears it down.  While [`create`] is
//! writing the database the singleton holds a creating marker, and
//! opens racing it fail instead of observing a half created store.
//! A handle that was explicitly closed answers every operation with
//! `Closed`.
//!
//! All mutations run inside a single write transaction; readers use
//! read transactions.  Nothing here coordinates across processes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{debug, info};
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::{Error, Result};

pub mod configurator;

/// Database schema version.
pub const VERSION: u64 = 1;

// Table names in the environment.
const VOLUMES: TableDefinition<&str, &[u8]> = TableDefinition::new("volumes");
const MULTIPATHS: TableDefinition<&str, &str> = TableDefinition::new("multipaths");
const VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("versions");

/// Info stored for one managed volume.  A volume starts out with only
/// its connection info; the path, attachment and multipath id are
/// merged in once the volume is attached.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VolumeInfo {
    pub connection_info: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipath_id: Option<String>,
}

/// One schema version record.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VersionInfo {
    pub version: u64,
    pub description: String,
    pub updated: String,
}

struct Env {
    db: Arc<Database>,
    path: PathBuf,
    users: usize,
}

enum EnvState {
    Closed,
    Creating,
    Open(Env),
}

// The one environment of this process.
static ENV: Mutex<EnvState> = Mutex::new(EnvState::Closed);

/// Creates the database file, its tables, and the initial version
/// record, all inside one write transaction.  The creating marker is
/// published before the file is touched and removed when the create
/// finished, so an open racing the create fails instead of observing
/// a half created database.
pub fn create(path: &Path) -> Result<()> {
    create_with(path, || ())
}

/// Exposed for tests: runs `pause` after the creating marker is
/// published and before the database is written.
#[doc(hidden)]
pub fn create_with(path: &Path, pause: impl FnOnce()) -> Result<()> {
    info!("creating managed volume database at {path:?}");
    {
        let mut guard = lock_env();
        match &*guard {
            EnvState::Closed => {}
            EnvState::Creating => {
                return Err(Error::InvalidDatabase(
                    "database create in progress".to_string(),
                ));
            }
            EnvState::Open(_) => {
                return Err(Error::InvalidDatabase(
                    "database is in use, cannot create".to_string(),
                ));
            }
        }
        *guard = EnvState::Creating;
    }
    pause();
    let res = create_db(path);
    *lock_env() = EnvState::Closed;
    res
}

fn create_db(path: &Path) -> Result<()> {
    let db = Database::create(path)?;
    let txn = db.begin_write()?;
    {
        let _volumes = txn.open_table(VOLUMES)?;
        let _multipaths = txn.open_table(MULTIPATHS)?;
        let mut versions = txn.open_table(VERSIONS)?;
        let updated = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let info = VersionInfo {
            version: VERSION,
            description: "Initial version".to_string(),
            updated,
        };
        // Zero padded so versions sort correctly up to 32 bit values.
        let key = format!("{VERSION:010}");
        versions.insert(key.as_str(), serde_json::to_vec(&info)?.as_slice())?;
    }
    txn.commit()?;
    Ok(())
}

/// Opens the database, which must exist, returning a handle sharing
/// the process-wide environment.  Fails while a create is in
/// progress.
pub fn open(path: &Path) -> Result<Db> {
    debug!("opening managed volume database at {path:?}");
    let mut guard = lock_env();
    match &mut *guard {
        EnvState::Creating => Err(Error::InvalidDatabase(
            "database create in progress".to_string(),
        )),
        EnvState::Open(env) => {
            if env.path != path {
                return Err(Error::invalid_parameter(
                    "path",
                    format!("database is already open at {:?}", env.path),
                ));
            }
            env.users += 1;
            Ok(Db { env: Some(env.db.clone()) })
        }
        EnvState::Closed => {
            let db = Arc::new(Database::open(path)?);
            *guard = EnvState::Open(Env {
                db: db.clone(),
                path: path.to_owned(),
                users: 1,
            });
            Ok(Db { env: Some(db) })
        }
    }
}

fn lock_env() -> std::sync::MutexGuard<'static, EnvState> {
    ENV.lock().unwrap_or_else(|e| e.into_inner())
}

fn release_env() {
    let mut guard = lock_env();
    if let EnvState::Open(env) = &mut *guard {
        env.users -= 1;
        if env.users == 0 {
            *guard = EnvState::Closed;
        }
    }
}

/// A handle on the managed volume database.
///
/// Dropping the handle releases its reference on the environment; the
/// last reference released closes the environment.
pub struct Db {
    env: Option<Arc<Database>>,
}

impl Db {
    /// Closes this handle.  Every operation afterwards fails with
    /// `Closed`.  Closing twice is harmless.
    pub fn close(&mut self) {
        if self.env.take().is_some() {
            release_env();
        }
    }

    fn env(&self) -> Result<&Database> {
        self.env.as_deref().ok_or(Error::Closed)
    }

    /// Returns the info stored for volume `vol_id`.
    pub fn get_volume(&self, vol_id: &str) -> Result<VolumeInfo> {
        let txn = self.env()?.begin_read()?;
        let volumes = txn.open_table(VOLUMES)?;
        let data = volumes
            .get(vol_id)?
            .ok_or_else(|| Error::NotFound(vol_id.to_string()))?;
        Ok(serde_json::from_slice(data.value())?)
    }

    /// Adds volume `vol_id` to the database.
    pub fn add_volume(&self, vol_id: &str, connection_info: Value) -> Result<()> {
        info!("adding volume {vol_id} connection_info={connection_info}");
        let txn = self.env()?.begin_write()?;
        {
            let mut volumes = txn.open_table(VOLUMES)?;
            let existing = volumes.get(vol_id)?.map(|data| data.value().to_vec());
            if let Some(data) = existing {
                let vol_info = serde_json::from_slice(&data)?;
                return Err(Error::VolumeAlreadyExists {
                    vol_id: vol_id.to_string(),
                    vol_info,
                });
            }
            let info = VolumeInfo {
                connection_info,
                path: None,
                attachment: None,
                multipath_id: None,
            };
            volumes.insert(vol_id, serde_json::to_vec(&info)?.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Merges attachment details into volume `vol_id`.  When a
    /// multipath id is given the reverse index is updated as well.
    pub fn update_volume(
        &self,
        vol_id: &str,
        path: &str,
        attachment: Value,
        multipath_id: Option<&str>,
    ) -> Result<()> {
        info!(
            "updating volume {vol_id} path={path}, attachment={attachment}, \
             multipath_id={multipath_id:?}"
        );
        let txn = self.env()?.begin_write()?;
        {
            let mut volumes = txn.open_table(VOLUMES)?;
            let data = volumes
                .get(vol_id)?
                .map(|data| data.value().to_vec())
                .ok_or_else(|| Error::NotFound(vol_id.to_string()))?;
            let mut info: VolumeInfo = serde_json::from_slice(&data)?;

            info.path = Some(path.to_string());
            info.attachment = Some(attachment);
            if let Some(multipath_id) = multipath_id {
                info.multipath_id = Some(multipath_id.to_string());
            }
            volumes.insert(vol_id, serde_json::to_vec(&info)?.as_slice())?;

            if let Some(multipath_id) = multipath_id {
                let mut multipaths = txn.open_table(MULTIPATHS)?;
                multipaths.insert(multipath_id, vol_id)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Removes volume `vol_id` from the database, together with its
    /// multipath reverse index if it has one.
    pub fn remove_volume(&self, vol_id: &str) -> Result<()> {
        info!("removing volume {vol_id}");
        let txn = self.env()?.begin_write()?;
        {
            let mut volumes = txn.open_table(VOLUMES)?;
            let data = volumes
                .get(vol_id)?
                .map(|data| data.value().to_vec())
                .ok_or_else(|| Error::NotFound(vol_id.to_string()))?;
            let info: VolumeInfo = serde_json::from_slice(&data)?;

            if let Some(multipath_id) = &info.multipath_id {
                let mut multipaths = txn.open_table(MULTIPATHS)?;
                multipaths.remove(multipath_id.as_str())?;
            }
            volumes.remove(vol_id)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Returns the newest database version record.
    pub fn version_info(&self) -> Result<VersionInfo> {
        let txn = self.env()?.begin_read()?;
        let versions = match txn.open_table(VERSIONS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => {
                return Err(Error::InvalidDatabase(
                    "Database version not found".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        let (_key, data) = versions.last()?.ok_or_else(|| {
            Error::InvalidDatabase("Database version not found".to_string())
        })?;
        Ok(serde_json::from_slice(data.value())?)
    }

    /// Returns true if the multipath device is owned by a managed
    /// volume.
    pub fn owns_multipath(&self, multipath_id: &str) -> Result<bool> {
        let txn = self.env()?.begin_read()?;
        let multipaths = txn.open_table(MULTIPATHS)?;
        Ok(multipaths.get(multipath_id)?.is_some())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.close();
    }
}
