#![allow(missing_docs)]

use tempfile::tempdir;
use umbra::{Database, Error, KeyOrder, Options, Result, Synchronous, WriteFlags};

fn reverse_cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    let ra: Vec<u8> = a.iter().rev().copied().collect();
    let rb: Vec<u8> = b.iter().rev().copied().collect();
    ra.cmp(&rb)
}

const KEYS: &[&[u8]] = &[
    b"apple", b"grape", b"melon", b"plum", b"az", b"za", b"aaa", b"zzz", b"mango",
];

#[test]
fn forward_traversal_is_lexicographic() -> Result<()> {
    let dir = tempdir()?;
    let options = Options {
        synchronous: Synchronous::Off,
        ..Options::default()
    };
    let mut db = Database::open(dir.path().join("fwd.db"), options)?;
    for key in KEYS {
        db.put(key, b"v", WriteFlags::default())?;
    }
    let seen: Vec<Vec<u8>> = db
        .iter()
        .map(|item| item.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    let mut expected: Vec<Vec<u8>> = KEYS.iter().map(|k| k.to_vec()).collect();
    expected.sort();
    assert_eq!(seen, expected);
    Ok(())
}

#[test]
fn reverse_traversal_orders_by_trailing_bytes() -> Result<()> {
    let dir = tempdir()?;
    let options = Options {
        key_order: Some(KeyOrder::Reverse),
        synchronous: Synchronous::Off,
        ..Options::default()
    };
    let mut db = Database::open(dir.path().join("rev.db"), options)?;
    for key in KEYS {
        db.put(key, b"v", WriteFlags::default())?;
    }
    let seen: Vec<Vec<u8>> = db
        .iter()
        .map(|item| item.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    let mut expected: Vec<Vec<u8>> = KEYS.iter().map(|k| k.to_vec()).collect();
    expected.sort_by(|a, b| reverse_cmp(a, b));
    assert_eq!(seen, expected);

    // Point lookups still hit under the reverse comparator.
    for key in KEYS {
        assert_eq!(db.get(key)?, b"v");
    }
    Ok(())
}

#[test]
fn reverse_order_survives_many_entries() -> Result<()> {
    let dir = tempdir()?;
    let options = Options {
        key_order: Some(KeyOrder::Reverse),
        synchronous: Synchronous::Off,
        ..Options::default()
    };
    let mut db = Database::open(dir.path().join("rev-many.db"), options)?;
    let keys: Vec<String> = (0..400u32).map(|i| format!("{:04}-suffix-{}", i, i % 7)).collect();
    for key in &keys {
        db.put(key.as_bytes(), key.as_bytes(), WriteFlags::default())?;
    }
    let seen: Vec<Vec<u8>> = db
        .iter()
        .map(|item| item.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    let mut expected: Vec<Vec<u8>> = keys.iter().map(|k| k.clone().into_bytes()).collect();
    expected.sort_by(|a, b| reverse_cmp(a, b));
    assert_eq!(seen, expected);
    Ok(())
}

#[test]
fn stored_order_is_inherited_on_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("inherit.db");
    {
        let options = Options {
            key_order: Some(KeyOrder::Reverse),
            ..Options::default()
        };
        let mut db = Database::open(&path, options)?;
        db.put(b"ba", b"1", WriteFlags::default())?;
        db.put(b"ab", b"2", WriteFlags::default())?;
        db.close()?;
    }

    // Default options inherit the reverse comparator from the meta flags.
    let db = Database::open(&path, Options::default())?;
    let seen: Vec<Vec<u8>> = db
        .iter()
        .map(|item| item.map(|(k, _)| k))
        .collect::<Result<_>>()?;
    assert_eq!(seen, vec![b"ba".to_vec(), b"ab".to_vec()]);
    drop(db);

    // An explicit conflicting request is refused rather than reordering.
    let conflicting = Options {
        key_order: Some(KeyOrder::Forward),
        ..Options::default()
    };
    assert!(matches!(
        Database::open(&path, conflicting),
        Err(Error::Invalid(_))
    ));
    Ok(())
}
