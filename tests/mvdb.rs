// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Managed volume database tests.
//!
//! The database environment is a process-wide singleton keyed to one
//! path, and the test harness runs tests concurrently in one process,
//! so every test takes `LOCK` and fully closes its handles before
//! returning.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde_json::json;
use tempfile::TempDir;

use xleases::mvdb::{self, VolumeInfo, configurator};
use xleases::result::Error;

static LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn make_db() -> (TempDir, PathBuf) {
    let tmp = tempfile::Builder::new().prefix("mvdb-").tempdir().unwrap();
    let path = tmp.path().join("managedvolume.db");
    (tmp, path)
}

fn self_owner() -> configurator::Owner {
    let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
    configurator::Owner { uid, gid }
}

#[test]
fn create_and_version() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    mvdb::create(&path).unwrap();

    let db = mvdb::open(&path).unwrap();
    let info = db.version_info().unwrap();
    assert_eq!(info.version, 1);
    assert_eq!(info.description, "Initial version");
    assert!(!info.updated.is_empty());
}

#[test]
fn add_get_roundtrip() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    mvdb::create(&path).unwrap();

    let connection_info = json!({"host": "3260:iqn.2016-01.com.example"});
    {
        let db = mvdb::open(&path).unwrap();
        db.add_volume("vol-1", connection_info.clone()).unwrap();
    }

    // Survives close and reopen.
    let db = mvdb::open(&path).unwrap();
    let info = db.get_volume("vol-1").unwrap();
    assert_eq!(
        info,
        VolumeInfo {
            connection_info,
            path: None,
            attachment: None,
            multipath_id: None,
        }
    );
}

#[test]
fn get_missing() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    mvdb::create(&path).unwrap();

    let db = mvdb::open(&path).unwrap();
    match db.get_volume("no-such-vol") {
        Err(Error::NotFound(id)) => assert_eq!(id, "no-such-vol"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn add_existing_volume() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    mvdb::create(&path).unwrap();

    let db = mvdb::open(&path).unwrap();
    db.add_volume("vol-1", json!({"host": "h"})).unwrap();
    match db.add_volume("vol-1", json!({"host": "other"})) {
        Err(Error::VolumeAlreadyExists { vol_id, vol_info }) => {
            assert_eq!(vol_id, "vol-1");
            assert_eq!(vol_info["connection_info"]["host"], "h");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn update_volume() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    mvdb::create(&path).unwrap();

    let db = mvdb::open(&path).unwrap();
    db.add_volume("vol-1", json!({"host": "h"})).unwrap();
    db.update_volume(
        "vol-1",
        "/dev/mapper/36001",
        json!({"lun": 1}),
        Some("36001"),
    )
    .unwrap();

    let info = db.get_volume("vol-1").unwrap();
    assert_eq!(info.path.as_deref(), Some("/dev/mapper/36001"));
    assert_eq!(info.attachment, Some(json!({"lun": 1})));
    assert_eq!(info.multipath_id.as_deref(), Some("36001"));

    assert!(db.owns_multipath("36001").unwrap());
    assert!(!db.owns_multipath("other").unwrap());
}

#[test]
fn update_without_multipath() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    mvdb::create(&path).unwrap();

    let db = mvdb::open(&path).unwrap();
    db.add_volume("vol-1", json!({"host": "h"})).unwrap();
    db.update_volume("vol-1", "/dev/sdb", json!({"lun": 1}), None).unwrap();

    let info = db.get_volume("vol-1").unwrap();
    assert_eq!(info.path.as_deref(), Some("/dev/sdb"));
    assert_eq!(info.multipath_id, None);
}

#[test]
fn update_missing() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    mvdb::create(&path).unwrap();

    let db = mvdb::open(&path).unwrap();
    assert!(matches!(
        db.update_volume("no-such-vol", "/dev/sdb", json!({}), None),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn remove_volume() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    mvdb::create(&path).unwrap();

    let db = mvdb::open(&path).unwrap();
    db.add_volume("vol-1", json!({"host": "h"})).unwrap();
    db.update_volume("vol-1", "/dev/mapper/36001", json!({"lun": 1}), Some("36001"))
        .unwrap();

    db.remove_volume("vol-1").unwrap();
    assert!(matches!(db.get_volume("vol-1"), Err(Error::NotFound(_))));
    // The reverse index is gone too.
    assert!(!db.owns_multipath("36001").unwrap());

    assert!(matches!(db.remove_volume("vol-1"), Err(Error::NotFound(_))));
}

#[test]
fn closed_handle() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    mvdb::create(&path).unwrap();

    let mut db = mvdb::open(&path).unwrap();
    db.close();
    assert!(matches!(db.get_volume("vol-1"), Err(Error::Closed)));
    assert!(matches!(db.version_info(), Err(Error::Closed)));
    assert!(matches!(
        db.add_volume("vol-1", json!({})),
        Err(Error::Closed)
    ));
    // Closing again is harmless.
    db.close();
}

#[test]
fn shared_environment() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    mvdb::create(&path).unwrap();

    let db1 = mvdb::open(&path).unwrap();
    let db2 = mvdb::open(&path).unwrap();
    db1.add_volume("vol-1", json!({"host": "h"})).unwrap();
    db2.get_volume("vol-1").unwrap();

    // The environment stays usable until the last handle goes away.
    drop(db1);
    db2.get_volume("vol-1").unwrap();
    drop(db2);

    // Torn down: a different path can be opened now.
    let (_tmp2, path2) = make_db();
    mvdb::create(&path2).unwrap();
    let db = mvdb::open(&path2).unwrap();
    db.version_info().unwrap();
}

#[test]
fn open_different_path_while_open() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    mvdb::create(&path).unwrap();
    let (_tmp2, path2) = make_db();
    mvdb::create(&path2).unwrap();

    let _db = mvdb::open(&path).unwrap();
    assert!(matches!(
        mvdb::open(&path2),
        Err(Error::InvalidParameter { name: "path", .. })
    ));
}

#[test]
fn open_during_create() {
    let _lock = lock();
    let (_tmp, path) = make_db();

    // Pause the create after it published the creating marker and
    // assert an open racing it fails instead of blocking until the
    // create finished.
    let racing = path.clone();
    mvdb::create_with(&path, move || {
        let res = std::thread::spawn(move || mvdb::open(&racing).map(drop))
            .join()
            .unwrap();
        match res {
            Err(Error::InvalidDatabase(reason)) => {
                assert_eq!(reason, "database create in progress");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    })
    .unwrap();

    // The marker is gone once the create returned.
    let db = mvdb::open(&path).unwrap();
    db.version_info().unwrap();
}

#[test]
fn open_missing_database() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    assert!(mvdb::open(&path).is_err());
}

#[test]
fn version_record_missing() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    // A valid store that was never initialized by create().
    drop(redb::Database::create(&path).unwrap());

    let db = mvdb::open(&path).unwrap();
    match db.version_info() {
        Err(Error::InvalidDatabase(reason)) => {
            assert_eq!(reason, "Database version not found");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn configurator_flow() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    let owner = self_owner();

    assert_eq!(configurator::isconfigured(&path, owner), configurator::Answer::No);
    configurator::configure(&path, owner).unwrap();
    assert_eq!(configurator::isconfigured(&path, owner), configurator::Answer::Yes);
    // Configuring a ready database is a no-op.
    configurator::configure(&path, owner).unwrap();
}

#[test]
fn configurator_wrong_owner() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    let owner = self_owner();
    configurator::configure(&path, owner).unwrap();

    let other = configurator::Owner { uid: owner.uid + 1, gid: owner.gid };
    assert_eq!(
        configurator::isconfigured(&path, other),
        configurator::Answer::Maybe
    );
    assert!(matches!(
        configurator::configure(&path, other),
        Err(Error::InvalidDatabase(_))
    ));
}

#[test]
fn configurator_broken_database() {
    let _lock = lock();
    let (_tmp, path) = make_db();
    // A store without a version record is not ready and not
    // repairable automatically.
    drop(redb::Database::create(&path).unwrap());
    assert_eq!(
        configurator::isconfigured(&path, self_owner()),
        configurator::Answer::Maybe
    );
}
