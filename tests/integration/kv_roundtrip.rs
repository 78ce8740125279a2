#![allow(missing_docs)]

use tempfile::tempdir;
use umbra::{Database, Error, Options, Result, Synchronous, WriteFlags};

#[test]
fn put_get_delete_roundtrip() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("kv.db"), Options::default())?;

    db.put(b"alpha", b"one", WriteFlags::default())?;
    db.put(b"beta", b"two", WriteFlags::default())?;
    assert_eq!(db.get(b"alpha")?, b"one");
    assert_eq!(db.get(b"beta")?, b"two");

    let old = db.delete(b"alpha")?;
    assert_eq!(old, b"one");
    assert!(matches!(db.get(b"alpha"), Err(Error::NotFound)));
    assert_eq!(db.get(b"beta")?, b"two");
    Ok(())
}

#[test]
fn overwrite_returns_latest_value_only() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("kv.db"), Options::default())?;

    db.put(b"A", b"1", WriteFlags::default())?;
    db.put(b"A", b"2", WriteFlags::default())?;
    assert_eq!(db.get(b"A")?, b"2");

    let entries: Vec<_> = db.iter().collect::<Result<Vec<_>>>()?;
    assert_eq!(entries, vec![(b"A".to_vec(), b"2".to_vec())]);
    Ok(())
}

#[test]
fn no_overwrite_flag_reports_key_exists() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("kv.db"), Options::default())?;

    db.put(b"k", b"v1", WriteFlags::NO_OVERWRITE)?;
    assert!(matches!(
        db.put(b"k", b"v2", WriteFlags::NO_OVERWRITE),
        Err(Error::KeyExists)
    ));
    // The failed insert must not have touched the stored value.
    assert_eq!(db.get(b"k")?, b"v1");
    Ok(())
}

#[test]
fn invalid_arguments_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("kv.db"), Options::default())?;

    assert!(matches!(
        db.put(b"", b"v", WriteFlags::default()),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(db.get(b""), Err(Error::Invalid(_))));
    let long_key = vec![b'k'; 4096];
    assert!(matches!(
        db.put(&long_key, b"v", WriteFlags::default()),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(db.delete(b"missing"), Err(Error::NotFound)));
    Ok(())
}

#[test]
fn fifty_keys_nosync_then_reopen_synced() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("fifty.db");
    let nosync = Options {
        synchronous: Synchronous::Off,
        ..Options::default()
    };

    {
        let mut db = Database::open(&path, nosync)?;
        for i in 0..50u32 {
            let key = format!("key-{i:02}");
            let value = format!("value-{i:02}");
            db.put(key.as_bytes(), value.as_bytes(), WriteFlags::default())?;
        }
        for i in 0..50u32 {
            let key = format!("key-{i:02}");
            assert_eq!(db.get(key.as_bytes())?, format!("value-{i:02}").into_bytes());
        }
        for i in 0..50u32 {
            let key = format!("key-{i:02}");
            db.delete(key.as_bytes())?;
        }
        for i in 0..50u32 {
            let key = format!("key-{i:02}");
            assert!(matches!(db.get(key.as_bytes()), Err(Error::NotFound)));
        }
        db.close()?;
    }

    let db = Database::open(&path, Options::default())?;
    for i in 0..50u32 {
        let key = format!("key-{i:02}");
        assert!(matches!(db.get(key.as_bytes()), Err(Error::NotFound)));
    }
    assert_eq!(db.iter().count(), 0);
    Ok(())
}

#[test]
fn data_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("persist.db");
    {
        let nosync = Options {
            synchronous: Synchronous::Off,
            ..Options::default()
        };
        let mut db = Database::open(&path, nosync)?;
        for i in 0..300u32 {
            let key = format!("key-{i:04}");
            let value = format!("value-{i:04}");
            db.put(key.as_bytes(), value.as_bytes(), WriteFlags::default())?;
        }
        db.close()?;
    }
    let db = Database::open(&path, Options::default())?;
    for i in 0..300u32 {
        let key = format!("key-{i:04}");
        assert_eq!(db.get(key.as_bytes())?, format!("value-{i:04}").into_bytes());
    }
    let stats = db.stats()?;
    assert!(stats.height >= 2, "300 keys should not fit in one page");
    Ok(())
}
