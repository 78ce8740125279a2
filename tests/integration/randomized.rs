#![allow(missing_docs)]

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;
use umbra::{Database, Error, Options, Result, Synchronous, WriteFlags};

const PRINTABLE: &[u8] =
    b" !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";

fn random_key(rng: &mut ChaCha8Rng) -> Vec<u8> {
    let len = rng.gen_range(1..=60);
    (0..len)
        .map(|_| PRINTABLE[rng.gen_range(0..PRINTABLE.len())])
        .collect()
}

fn random_value(rng: &mut ChaCha8Rng) -> Vec<u8> {
    let len = rng.gen_range(0..=2_000);
    (0..len).map(|_| rng.gen()).collect()
}

#[test]
fn seeded_workload_matches_model() -> Result<()> {
    let dir = tempdir()?;
    let options = Options {
        synchronous: Synchronous::Off,
        ..Options::default()
    };
    let mut db = Database::open(dir.path().join("random.db"), options)?;
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xBEE5);

    for _ in 0..2_000 {
        match rng.gen_range(0..10) {
            // Mostly writes, a mix of fresh keys and overwrites.
            0..=5 => {
                let key = if model.is_empty() || rng.gen_bool(0.7) {
                    random_key(&mut rng)
                } else {
                    pick_existing(&model, &mut rng)
                };
                let value = random_value(&mut rng);
                db.put(&key, &value, WriteFlags::default())?;
                model.insert(key, value);
            }
            6..=7 => {
                if model.is_empty() {
                    continue;
                }
                let key = pick_existing(&model, &mut rng);
                let expected = model.remove(&key).expect("model has key");
                let removed = db.delete(&key)?;
                assert_eq!(removed, expected);
            }
            _ => {
                let key = if model.is_empty() || rng.gen_bool(0.5) {
                    random_key(&mut rng)
                } else {
                    pick_existing(&model, &mut rng)
                };
                match (db.get(&key), model.get(&key)) {
                    (Ok(value), Some(expected)) => assert_eq!(&value, expected),
                    (Err(Error::NotFound), None) => {}
                    (got, want) => panic!("model mismatch: got {got:?}, want {want:?}"),
                }
            }
        }
    }

    // Final sweep: the store and the model agree entry for entry.
    let entries: Vec<(Vec<u8>, Vec<u8>)> = db.iter().collect::<Result<_>>()?;
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(entries.len(), expected.len());
    assert_eq!(entries, expected);
    Ok(())
}

#[test]
fn workload_survives_reopen_at_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("checkpoints.db");
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    let options = Options {
        synchronous: Synchronous::Off,
        ..Options::default()
    };
    for epoch in 0..4 {
        let mut db = Database::open(&path, options.clone())?;
        for _ in 0..250 {
            if !model.is_empty() && rng.gen_bool(0.3) {
                let key = pick_existing(&model, &mut rng);
                model.remove(&key);
                db.delete(&key)?;
            } else {
                let key = random_key(&mut rng);
                let value = random_value(&mut rng);
                db.put(&key, &value, WriteFlags::default())?;
                model.insert(key, value);
            }
        }
        db.close()?;

        let db = Database::open(&path, options.clone())?;
        for (key, value) in &model {
            assert_eq!(&db.get(key)?, value, "epoch {epoch}");
        }
        assert_eq!(db.iter().count(), model.len());
    }
    Ok(())
}

fn pick_existing(model: &BTreeMap<Vec<u8>, Vec<u8>>, rng: &mut ChaCha8Rng) -> Vec<u8> {
    let idx = rng.gen_range(0..model.len());
    model.keys().nth(idx).expect("index in range").clone()
}
