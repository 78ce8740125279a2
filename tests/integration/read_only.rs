#![allow(missing_docs)]

use std::fs;

use tempfile::tempdir;
use umbra::{Database, Error, Options, Result, WriteFlags};

fn read_only() -> Options {
    Options {
        read_only: true,
        ..Options::default()
    }
}

#[test]
fn read_only_handle_serves_reads() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ro.db");
    {
        let mut db = Database::open(&path, Options::default())?;
        db.put(b"k1", b"v1", WriteFlags::default())?;
        db.put(b"k2", b"v2", WriteFlags::default())?;
        db.close()?;
    }

    let db = Database::open(&path, read_only())?;
    assert_eq!(db.get(b"k1")?, b"v1");
    assert_eq!(db.get(b"k2")?, b"v2");
    assert_eq!(db.iter().count(), 2);
    Ok(())
}

#[test]
fn mutations_fail_and_leave_file_unchanged() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ro.db");
    {
        let mut db = Database::open(&path, Options::default())?;
        db.put(b"k1", b"v1", WriteFlags::default())?;
        db.close()?;
    }
    let before = fs::read(&path)?;

    {
        let mut db = Database::open(&path, read_only())?;
        assert!(matches!(
            db.put(b"k2", b"v2", WriteFlags::default()),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(db.delete(b"k1"), Err(Error::ReadOnly)));
        assert!(matches!(db.compact(), Err(Error::ReadOnly)));
        db.close()?;
    }

    let after = fs::read(&path)?;
    assert_eq!(before, after, "read-only handle must not write");
    Ok(())
}

#[test]
fn read_only_cannot_create() -> Result<()> {
    let dir = tempdir()?;
    let missing = dir.path().join("missing.db");
    assert!(Database::open(&missing, read_only()).is_err());
    assert!(!missing.exists());
    Ok(())
}

#[test]
fn two_readers_may_share_a_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("shared.db");
    {
        let mut db = Database::open(&path, Options::default())?;
        db.put(b"k", b"v", WriteFlags::default())?;
        db.close()?;
    }
    let first = Database::open(&path, read_only())?;
    let second = Database::open(&path, read_only())?;
    assert_eq!(first.get(b"k")?, b"v");
    assert_eq!(second.get(b"k")?, b"v");
    Ok(())
}

#[test]
fn writer_excludes_other_handles() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("locked.db");
    let writer = Database::open(&path, Options::default())?;
    assert!(matches!(
        Database::open(&path, Options::default()),
        Err(Error::Busy(_))
    ));
    assert!(matches!(
        Database::open(&path, read_only()),
        Err(Error::Busy(_))
    ));
    drop(writer);
    let _reader = Database::open(&path, read_only())?;
    Ok(())
}
