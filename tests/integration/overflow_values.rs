#![allow(missing_docs)]

use tempfile::tempdir;
use umbra::{Database, Error, Options, Result, Synchronous, WriteFlags};

#[test]
fn large_values_roundtrip() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("overflow.db");
    let mut db = Database::open(&path, Options::default())?;

    let sizes = [1_500usize, 4_096, 13_000, 100_000];
    for (i, size) in sizes.iter().enumerate() {
        let key = format!("blob-{i}");
        let value: Vec<u8> = (0..*size).map(|j| (j % 251) as u8).collect();
        db.put(key.as_bytes(), &value, WriteFlags::default())?;
    }
    for (i, size) in sizes.iter().enumerate() {
        let key = format!("blob-{i}");
        let expected: Vec<u8> = (0..*size).map(|j| (j % 251) as u8).collect();
        assert_eq!(db.get(key.as_bytes())?, expected);
    }

    // Spilled values survive a reopen as well.
    db.close()?;
    let db = Database::open(&path, Options::default())?;
    let expected: Vec<u8> = (0..100_000usize).map(|j| (j % 251) as u8).collect();
    assert_eq!(db.get(b"blob-3")?, expected);
    Ok(())
}

#[test]
fn overwriting_spilled_value_reclaims_its_chain() -> Result<()> {
    let dir = tempdir()?;
    let options = Options {
        synchronous: Synchronous::Off,
        ..Options::default()
    };
    let mut db = Database::open(dir.path().join("churn.db"), options)?;

    let value = vec![0xABu8; 20_000];
    db.put(b"blob", &value, WriteFlags::default())?;
    let baseline = db.stats()?.page_count;

    // Repeated overwrites must cycle through the free list instead of
    // growing the file without bound.
    for round in 0..25u8 {
        let value = vec![round; 20_000];
        db.put(b"blob", &value, WriteFlags::default())?;
    }
    let grown = db.stats()?.page_count;
    assert!(
        grown <= baseline * 3,
        "file grew from {baseline} to {grown} pages under overwrite churn"
    );
    assert_eq!(db.get(b"blob")?, vec![24u8; 20_000]);
    Ok(())
}

#[test]
fn deleting_spilled_value_returns_and_frees_it() -> Result<()> {
    let dir = tempdir()?;
    let mut db = Database::open(dir.path().join("del.db"), Options::default())?;

    let value: Vec<u8> = (0..30_000usize).map(|j| (j % 253) as u8).collect();
    db.put(b"blob", &value, WriteFlags::default())?;
    db.put(b"small", b"v", WriteFlags::default())?;

    let old = db.delete(b"blob")?;
    assert_eq!(old, value);
    assert!(matches!(db.get(b"blob"), Err(Error::NotFound)));
    assert!(db.stats()?.free_pages > 5, "overflow chain should be freed");
    assert_eq!(db.get(b"small")?, b"v");
    Ok(())
}

#[test]
fn value_length_limit_enforced() -> Result<()> {
    let dir = tempdir()?;
    let options = Options {
        max_value_len: 1_000,
        ..Options::default()
    };
    let mut db = Database::open(dir.path().join("limit.db"), options)?;
    assert!(matches!(
        db.put(b"big", &vec![0u8; 2_000], WriteFlags::default()),
        Err(Error::Invalid(_))
    ));
    assert!(matches!(db.get(b"big"), Err(Error::NotFound)));
    Ok(())
}
