#![allow(missing_docs)]

use std::fs;

use tempfile::tempdir;
use umbra::{Database, KeyOrder, Options, Result, Synchronous, WriteFlags};

#[test]
fn compaction_preserves_content_and_shrinks_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("compact.db");
    let options = Options {
        synchronous: Synchronous::Off,
        ..Options::default()
    };
    let mut db = Database::open(&path, options)?;

    for i in 0..400u32 {
        let key = format!("key-{i:04}");
        db.put(key.as_bytes(), &[b'a'; 900], WriteFlags::default())?;
    }
    // Heavy churn: the file's high-water mark stays at the fat working set
    // even after the live set shrinks to a few tiny entries.
    for i in (0..400u32).step_by(2) {
        let key = format!("key-{i:04}");
        db.delete(key.as_bytes())?;
    }
    for i in (1..400u32).step_by(2) {
        let key = format!("key-{i:04}");
        db.put(key.as_bytes(), b"tiny", WriteFlags::default())?;
    }
    let before = fs::metadata(&path)?.len();

    db.compact()?;

    let after = fs::metadata(&path)?.len();
    assert!(
        after < before / 2,
        "compaction should shrink the file ({before} -> {after} bytes)"
    );

    // The handle stays usable and every entry survived.
    for i in (1..400u32).step_by(2) {
        let key = format!("key-{i:04}");
        assert_eq!(db.get(key.as_bytes())?, b"tiny");
    }
    for i in (0..400u32).step_by(2) {
        let key = format!("key-{i:04}");
        assert!(db.get(key.as_bytes()).is_err());
    }
    db.put(b"post-compact", b"ok", WriteFlags::default())?;
    assert_eq!(db.get(b"post-compact")?, b"ok");

    // No scratch files were left behind.
    let leftovers: Vec<_> = fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".compact-"))
        .collect();
    assert!(leftovers.is_empty(), "scratch file leaked: {leftovers:?}");
    Ok(())
}

#[test]
fn compaction_keeps_reverse_key_order() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("rev.db");
    let options = Options {
        key_order: Some(KeyOrder::Reverse),
        ..Options::default()
    };
    let mut db = Database::open(&path, options)?;
    for key in [b"ba".as_slice(), b"ab", b"ca", b"ac"] {
        db.put(key, b"v", WriteFlags::default())?;
    }
    let before: Vec<Vec<u8>> = db
        .iter()
        .map(|item| item.map(|(k, _)| k))
        .collect::<Result<_>>()?;

    db.compact()?;

    let after: Vec<Vec<u8>> = db
        .iter()
        .map(|item| item.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    assert_eq!(before, after);
    db.close()?;

    // The rewritten file still carries the reverse-key flag.
    let reopened = Database::open(&path, Options::default())?;
    let seen: Vec<Vec<u8>> = reopened
        .iter()
        .map(|item| item.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    assert_eq!(seen, before);
    Ok(())
}

#[test]
fn compacting_spilled_values_keeps_them_intact() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("blobs.db");
    let options = Options {
        synchronous: Synchronous::Off,
        ..Options::default()
    };
    let mut db = Database::open(&path, options)?;

    let blob: Vec<u8> = (0..50_000usize).map(|i| (i % 241) as u8).collect();
    db.put(b"blob", &blob, WriteFlags::default())?;
    for round in 0..10u8 {
        db.put(b"churn", &vec![round; 30_000], WriteFlags::default())?;
    }

    db.compact()?;

    assert_eq!(db.get(b"blob")?, blob);
    assert_eq!(db.get(b"churn")?, vec![9u8; 30_000]);
    Ok(())
}
