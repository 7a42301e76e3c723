use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;
use std::thread;
use vibetree::access::btree::key::IndexDef;
use vibetree::access::btree::TreeCounters;
use vibetree::access::value::decode_u64;
use vibetree::access::{encode_u64, BTree, Tuple};
use vibetree::config::EngineConfig;
use vibetree::engine::Engine;
use vibetree::storage::{LatchKind, PageBuf, PageId, StorageError};

fn engine() -> Result<Engine> {
    Ok(Engine::in_memory(EngineConfig::default())?)
}

fn row(k: u64, payload: usize) -> Tuple {
    Tuple::from_slices(&[&encode_u64(k), &vec![(k % 251) as u8; payload]])
}

fn key(k: u64) -> Tuple {
    Tuple::from_slices(&[&encode_u64(k)])
}

/// Copy of a page, taken under a short S latch.
fn read_page(tree: &BTree, page_id: PageId) -> Result<PageBuf> {
    let guard = tree.context().pool.get_page(page_id, LatchKind::S)?;
    Ok(guard.page().snapshot())
}

fn children(page: &PageBuf) -> Vec<PageId> {
    page.user_recs()
        .into_iter()
        .filter_map(|rec| page.rec_child(rec))
        .collect()
}

fn page_keys(page: &PageBuf) -> Vec<u64> {
    page.user_recs()
        .into_iter()
        .filter_map(|rec| page.rec_field(rec, 0).map(decode_u64))
        .collect()
}

fn max_recs_on_level(tree: &BTree, leftmost: PageId) -> Result<usize> {
    let mut max = 0;
    let mut next = Some(leftmost);
    while let Some(id) = next {
        let page = read_page(tree, id)?;
        max = max.max(page.n_recs());
        next = page.next();
    }
    Ok(max)
}

fn scan_keys(tree: &BTree) -> Result<Vec<u64>> {
    let mut keys = Vec::new();
    for t in tree.scan() {
        let t = t?;
        keys.push(decode_u64(t.field(0).unwrap_or(&[])));
    }
    Ok(keys)
}

#[test]
fn test_sequential_inserts_build_minimal_height() -> Result<()> {
    let engine = engine()?;
    // wide keys keep the fan-out small enough for a three level tree
    let tree = engine.create_clustered_index("wide", 2, 2)?;
    let pad = vec![b'x'; 1000];
    let n = 3000u64;
    for k in 0..n {
        tree.insert(&Tuple::from_slices(&[&encode_u64(k), &pad]))?;
    }
    let stats = tree.validate()?;
    assert_eq!(stats.n_records, n as usize);

    // largest page of the leaf level and of the level above it
    let mut page = read_page(&tree, tree.root_page_id())?;
    let mut fan_out = 0;
    while !page.is_leaf() {
        let first_child = children(&page)[0];
        page = read_page(&tree, first_child)?;
        if page.level() == 1 {
            fan_out = max_recs_on_level(&tree, page.page_id())?;
        }
    }
    let per_leaf = max_recs_on_level(&tree, page.page_id())? as u64;
    assert!(per_leaf > 1 && fan_out > 1);

    let mut pages = n.div_ceil(per_leaf);
    let mut height = 1;
    while pages > 1 {
        pages = pages.div_ceil(fan_out as u64);
        height += 1;
    }
    assert_eq!(stats.height, height);
    assert!(stats.height >= 3);

    // every leaf's right sibling holds strictly greater keys
    let mut last: Option<u64> = None;
    let mut next = Some(page.page_id());
    let mut seen = 0;
    while let Some(id) = next {
        let leaf = read_page(&tree, id)?;
        let keys = page_keys(&leaf);
        if let (Some(l), Some(&first)) = (last, keys.first()) {
            assert!(first > l, "page {} starts at {} after {}", id, first, l);
        }
        last = keys.last().copied().or(last);
        seen += keys.len();
        next = leaf.next();
    }
    assert_eq!(seen, n as usize);
    Ok(())
}

#[test]
fn test_emptied_middle_leaf_leaves_the_tree() -> Result<()> {
    let engine = engine()?;
    let tree = engine.create_clustered_index("three", 1, 2)?;
    let mut k = 0;
    loop {
        tree.insert(&row(k, 5000))?;
        k += 1;
        if tree.validate()?.pages_per_level == vec![3, 1] {
            break;
        }
        assert!(k < 100, "no three leaf tree after {} inserts", k);
    }

    let root = read_page(&tree, tree.root_page_id())?;
    let leaves = children(&root);
    assert_eq!(leaves.len(), 3);
    let middle = read_page(&tree, leaves[1])?;
    let doomed = page_keys(&middle);
    assert!(!doomed.is_empty());
    for &d in &doomed {
        assert!(tree.delete(&key(d))?);
    }

    let root = read_page(&tree, tree.root_page_id())?;
    let survivors = children(&root);
    assert_eq!(survivors, vec![leaves[0], leaves[2]]);
    let left = read_page(&tree, leaves[0])?;
    let right = read_page(&tree, leaves[2])?;
    assert_eq!(left.next(), Some(leaves[2]));
    assert_eq!(right.prev(), Some(leaves[0]));
    assert!(page_keys(&left).last() < page_keys(&right).first());

    tree.validate()?;
    let expected: Vec<u64> = (0..k).filter(|x| !doomed.contains(x)).collect();
    assert_eq!(scan_keys(&tree)?, expected);
    let counters = tree.counters();
    assert!(
        TreeCounters::get(&counters.discards) + TreeCounters::get(&counters.merges) >= 1
    );
    Ok(())
}

#[test]
fn test_random_workload_matches_model() -> Result<()> {
    let engine = engine()?;
    let tree = engine.create_clustered_index("model", 1, 2)?;
    let mut rng = StdRng::seed_from_u64(11);
    let mut model = BTreeSet::new();
    for round in 0..20_000 {
        let k = rng.gen_range(0..4000u64);
        if rng.gen_bool(0.6) {
            match tree.insert(&row(k, rng.gen_range(10..300))) {
                Ok(()) => assert!(model.insert(k)),
                Err(StorageError::DuplicateKey) => assert!(model.contains(&k)),
                Err(e) => return Err(e.into()),
            }
        } else {
            assert_eq!(tree.delete(&key(k))?, model.remove(&k));
        }
        if round % 5000 == 0 {
            tree.validate()?;
        }
    }
    tree.validate()?;
    assert_eq!(scan_keys(&tree)?, model.iter().copied().collect::<Vec<_>>());

    let low = 1000;
    let high = 2000;
    let mut ranged = Vec::new();
    for t in tree.range(Bound::Included(key(low)), Bound::Excluded(key(high))) {
        ranged.push(decode_u64(t?.field(0).unwrap_or(&[])));
    }
    let expected: Vec<u64> = model.range(low..high).copied().collect();
    assert_eq!(ranged, expected);
    Ok(())
}

#[test]
fn test_compressed_index_survives_churn() -> Result<()> {
    let engine = engine()?;
    let index = IndexDef::clustered(engine.allocate_index_id(), "zipped", 1, 2).with_zip(8192);
    let tree = engine.create_index(index)?;
    let mut keys: Vec<u64> = (0..3000).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(5));
    for &k in &keys {
        tree.insert(&row(k, 120))?;
    }
    for &k in keys.iter().step_by(2) {
        assert!(tree.delete(&key(k))?);
    }
    let stats = tree.validate()?;
    assert_eq!(stats.n_records, 1500);
    for &k in keys.iter().skip(1).step_by(2).take(200) {
        assert!(tree.get(&key(k))?.is_some());
    }
    Ok(())
}

#[test]
fn test_tablespace_limit_is_reported() -> Result<()> {
    let config = EngineConfig {
        tablespace_max_pages: Some(12),
        ..Default::default()
    };
    let engine = Engine::in_memory(config)?;
    let tree = engine.create_clustered_index("small", 1, 2)?;
    let mut inserted = 0;
    let err = loop {
        match tree.insert(&row(inserted, 2000)) {
            Ok(()) => inserted += 1,
            Err(e) => break e,
        }
        assert!(inserted < 10_000);
    };
    assert!(matches!(err, StorageError::OutOfSpace { .. }), "{}", err);
    // nothing half done: the tree is intact and still usable for reads
    let stats = tree.validate()?;
    assert_eq!(stats.n_records, inserted as usize);
    assert!(tree.delete(&key(0))?);
    Ok(())
}

#[test]
fn test_concurrent_writers_and_readers() -> Result<()> {
    let engine = engine()?;
    let tree = Arc::new(engine.create_clustered_index("shared", 1, 2)?);
    for k in 0..2000 {
        tree.insert(&row(k * 10, 50))?;
    }

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || -> Result<()> {
            for i in 0..1500 {
                // keys 10 * j + 1 + t never collide between writers
                let k = (i * 10) + 1 + t;
                tree.insert(&row(k, 80))?;
                if i % 3 == 0 {
                    assert!(tree.delete(&key(k))?);
                }
            }
            Ok(())
        }));
    }
    for r in 0..2u64 {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || -> Result<()> {
            let mut rng = StdRng::seed_from_u64(r);
            for _ in 0..5000 {
                let k = rng.gen_range(0..2000) * 10;
                let found = tree.get(&key(k))?;
                assert!(found.is_some(), "key {} vanished", k);
            }
            Ok(())
        }));
    }
    for h in handles {
        h.join().expect("worker panicked")?;
    }

    let stats = tree.validate()?;
    assert_eq!(stats.n_records, 2000 + 4 * 1000);
    Ok(())
}
