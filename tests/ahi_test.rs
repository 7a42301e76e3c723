use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vibetree::access::value::decode_u64;
use vibetree::access::{encode_u64, BTree, Tuple};
use vibetree::config::EngineConfig;
use vibetree::engine::Engine;

fn row(k: u64, tag: u8) -> Tuple {
    Tuple::from_slices(&[&encode_u64(k), &[tag; 24]])
}

fn key(k: u64) -> Tuple {
    Tuple::from_slices(&[&encode_u64(k)])
}

fn lookups(tree: &BTree, keys: impl Iterator<Item = u64>) -> Result<Vec<Option<Tuple>>> {
    let mut found = Vec::new();
    for k in keys {
        found.push(tree.get(&key(k))?);
    }
    Ok(found)
}

fn warm_up(tree: &BTree, n_keys: u64, rounds: usize) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..rounds {
        let k = rng.gen_range(0..n_keys);
        assert!(tree.get(&key(k))?.is_some());
    }
    Ok(())
}

#[test]
fn test_repeated_lookups_are_served_by_hash() -> Result<()> {
    let engine = Engine::in_memory(EngineConfig::default())?;
    let tree = engine.create_clustered_index("hot", 1, 2)?;
    for k in 0..200 {
        tree.insert(&row(k, 1))?;
    }
    warm_up(&tree, 200, 2000)?;

    let snap = engine.ahi().snapshot();
    assert!(snap.enabled);
    assert!(snap.pages_built > 0, "{:?}", snap);
    assert!(snap.hits > 0, "{:?}", snap);
    assert!(engine.ahi().validate(engine.pool())? > 0);
    Ok(())
}

#[test]
fn test_reinserted_key_never_reads_stale() -> Result<()> {
    let engine = Engine::in_memory(EngineConfig::default())?;
    let tree = engine.create_clustered_index("churn", 1, 2)?;
    for k in 0..150 {
        tree.insert(&row(k, 1))?;
    }
    warm_up(&tree, 150, 1000)?;

    let hot = 77;
    for round in 0..1000u32 {
        assert!(tree.delete(&key(hot))?);
        assert_eq!(tree.get(&key(hot))?, None, "round {}", round);
        let tag = (round % 200) as u8 + 2;
        tree.insert(&row(hot, tag))?;
        let found = tree.get(&key(hot))?;
        assert_eq!(found, Some(row(hot, tag)), "round {}", round);
        // neighbours keep being found through the hash
        let other = u64::from(round % 150);
        if other != hot {
            let t = tree.get(&key(other))?;
            assert_eq!(t.and_then(|t| t.field(0).map(decode_u64)), Some(other));
        }
    }
    engine.ahi().validate(engine.pool())?;
    assert_eq!(tree.validate()?.n_records, 150);
    Ok(())
}

#[test]
fn test_results_do_not_depend_on_hash_state() -> Result<()> {
    let engine = Engine::in_memory(EngineConfig::default())?;
    let tree = engine.create_clustered_index("toggle", 1, 2)?;
    for k in (0..3000).step_by(2) {
        tree.insert(&row(k, 5))?;
    }
    let lookup_all = || lookups(&tree, 0..3000);
    lookup_all()?;

    let enabled = lookup_all()?;
    assert_eq!(enabled.iter().filter(|t| t.is_some()).count(), 1500);

    engine.ahi().disable();
    let snap = engine.ahi().snapshot();
    assert!(!snap.enabled);
    assert_eq!((snap.entries, snap.pages_indexed), (0, 0));
    let disabled = lookup_all()?;
    assert_eq!(engine.ahi().snapshot().entries, 0);

    // writes while disabled must not leave stale entries behind
    for k in (0..3000).step_by(10) {
        assert!(tree.delete(&key(k))?);
    }
    engine.ahi().enable();
    lookup_all()?;
    let reenabled = lookup_all()?;

    assert_eq!(enabled, disabled);
    for (k, (before, after)) in enabled.iter().zip(&reenabled).enumerate() {
        if k % 10 == 0 {
            assert_eq!(after, &None);
        } else {
            assert_eq!(before, after, "key {}", k);
        }
    }
    engine.ahi().validate(engine.pool())?;
    Ok(())
}

#[test]
fn test_reenabled_hash_warms_up_again() -> Result<()> {
    let engine = Engine::in_memory(EngineConfig::default())?;
    let tree = engine.create_clustered_index("rewarm", 1, 2)?;
    for k in 0..200 {
        tree.insert(&row(k, 4))?;
    }
    warm_up(&tree, 200, 2000)?;
    assert!(tree.search_info().guess_params().is_some());

    engine.ahi().disable();
    engine.ahi().enable();
    let before = engine.ahi().snapshot();
    assert!(tree.get(&key(7))?.is_some());
    let after = engine.ahi().snapshot();
    assert_eq!(after.hits, before.hits);
    assert_eq!(after.searches, before.searches);
    assert_eq!(after.pages_built, before.pages_built);
    assert_eq!(after.entries, 0);
    assert_eq!(tree.search_info().n_hash_potential(), 0);
    assert_eq!(tree.search_info().guess_params(), None);

    // and the hash is rebuilt by a fresh warm-up
    warm_up(&tree, 200, 2000)?;
    let rebuilt = engine.ahi().snapshot();
    assert!(rebuilt.pages_built > after.pages_built, "{:?}", rebuilt);
    assert!(rebuilt.hits > after.hits, "{:?}", rebuilt);
    Ok(())
}

#[test]
fn test_disabled_at_start() -> Result<()> {
    let mut config = EngineConfig::default();
    config.ahi.enabled = false;
    let engine = Engine::in_memory(config)?;
    let tree = engine.create_clustered_index("cold", 1, 2)?;
    for k in 0..100 {
        tree.insert(&row(k, 9))?;
    }
    warm_up(&tree, 100, 1000)?;
    let snap = engine.ahi().snapshot();
    assert_eq!((snap.searches, snap.entries), (0, 0));
    Ok(())
}
