use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use vibetree::access::rtree::mbr::{union_all, Mbr, SearchMode};
use vibetree::access::value::decode_u64;
use vibetree::access::{encode_u64, RTree};
use vibetree::config::EngineConfig;
use vibetree::engine::Engine;
use vibetree::storage::{LatchKind, PageBuf, PageId};

fn engine() -> Result<Engine> {
    Ok(Engine::in_memory(EngineConfig::default())?)
}

fn read_page(engine: &Engine, page_id: PageId) -> Result<PageBuf> {
    let guard = engine.pool().get_page(page_id, LatchKind::S)?;
    Ok(guard.page().snapshot())
}

fn page_mbrs(page: &PageBuf) -> Result<Vec<Mbr>> {
    let mut mbrs = Vec::new();
    for rec in page.user_recs() {
        mbrs.push(Mbr::from_bytes(page.rec_field(rec, 0).unwrap_or(&[]))?);
    }
    Ok(mbrs)
}

fn search_keys(tree: &RTree, mode: SearchMode, query: &Mbr) -> Result<Vec<u64>> {
    let mut keys = Vec::new();
    for entry in tree.search(mode, query) {
        keys.push(decode_u64(&entry?.payload));
    }
    keys.sort_unstable();
    Ok(keys)
}

/// Unit square `i` of a cluster anchored at `origin`.
fn square(origin: f64, i: u64) -> Mbr {
    let x = origin + (i % 10) as f64 * 9.0;
    let y = origin + (i / 10 % 10) as f64 * 9.0;
    Mbr::new(x, y, x + 1.0, y + 1.0)
}

#[test]
fn test_first_split_separates_clusters() -> Result<()> {
    let engine = engine()?;
    let tree = engine.create_spatial_index("clusters")?;
    let anchor = Mbr::new(0.0, 0.0, 10.0, 10.0);
    tree.insert(&anchor, &encode_u64(0))?;

    let near = 0.0;
    let far = 100_000.0;
    let mut k = 1;
    while tree.height()? < 2 {
        let origin = if k % 2 == 0 { near } else { far };
        tree.insert(&square(origin, k / 2), &encode_u64(k))?;
        k += 1;
        assert!(k < 10_000, "no split after {} inserts", k);
    }

    let root = read_page(&engine, tree.root_page_id())?;
    assert_eq!(root.level(), 1);
    let ptr_mbrs = page_mbrs(&root)?;
    assert_eq!(ptr_mbrs.len(), 2);

    let mut all_children = Vec::new();
    for (rec, ptr_mbr) in root.user_recs().into_iter().zip(&ptr_mbrs) {
        let child_id = root.rec_child(rec).expect("node pointer without child");
        let child = read_page(&engine, child_id)?;
        let mbrs = page_mbrs(&child)?;
        // the pointer is the exact union of the child's entries
        assert_eq!(union_all(mbrs.iter()), Some(*ptr_mbr));
        let near_side = mbrs.iter().filter(|m| m.xmax < far).count();
        assert!(near_side == 0 || near_side == mbrs.len(), "child {} mixes clusters", child_id);
        all_children.extend(mbrs);
    }
    assert!(!ptr_mbrs[0].intersects(&ptr_mbrs[1]));
    let cover = union_all(ptr_mbrs.iter()).expect("two pointers");
    assert!(all_children.iter().all(|m| cover.contains(m)));
    assert!(all_children.contains(&anchor));
    assert_eq!(all_children.len() as u64, k);

    tree.validate()?;
    assert_eq!(
        search_keys(&tree, SearchMode::MbrEqual, &anchor)?,
        vec![0]
    );
    Ok(())
}

#[test]
fn test_delete_keeps_tree_valid() -> Result<()> {
    let engine = engine()?;
    let tree = engine.create_spatial_index("churn")?;
    let mut rng = StdRng::seed_from_u64(21);
    let entries: Vec<(u64, Mbr)> = (0..4000)
        .map(|k| {
            let x = rng.gen_range(0.0..1000.0);
            let y = rng.gen_range(0.0..1000.0);
            (k, Mbr::new(x, y, x + rng.gen_range(0.0..20.0), y + rng.gen_range(0.0..20.0)))
        })
        .collect();
    for (k, mbr) in &entries {
        tree.insert(mbr, &encode_u64(*k))?;
    }
    let height = tree.validate()?.height;

    let mut order = entries.clone();
    order.shuffle(&mut rng);
    let (gone, kept) = order.split_at(3000);
    for (k, mbr) in gone {
        assert!(tree.delete(mbr, &encode_u64(*k))?);
        assert!(!tree.delete(mbr, &encode_u64(*k))?);
    }
    let stats = tree.validate()?;
    assert_eq!(stats.n_records, 1000);
    assert!(stats.height <= height);
    assert_eq!(tree.n_rows(), 1000);

    let window = Mbr::new(250.0, 250.0, 750.0, 750.0);
    let mut expected: Vec<u64> = kept
        .iter()
        .filter(|(_, m)| m.intersects(&window))
        .map(|(k, _)| *k)
        .collect();
    expected.sort_unstable();
    assert_eq!(search_keys(&tree, SearchMode::Intersect, &window)?, expected);
    Ok(())
}

#[test]
fn test_searches_run_alongside_inserts() -> Result<()> {
    let engine = engine()?;
    let tree = Arc::new(engine.create_spatial_index("shared")?);
    let n_base = 2000u64;
    for k in 0..n_base {
        tree.insert(&square(0.0, k), &encode_u64(k))?;
    }
    // the base squares repeat every 100 keys; all of them fall in here
    let window = Mbr::new(0.0, 0.0, 100.0, 100.0);
    let expected: Vec<u64> = (0..n_base).collect();

    let mut handles = Vec::new();
    for w in 0..3u64 {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || -> Result<()> {
            let mut rng = StdRng::seed_from_u64(w);
            for i in 0..1500 {
                let k = 1_000_000 * (w + 1) + i;
                let x = rng.gen_range(0.0..100.0);
                let y = rng.gen_range(200.0..1000.0);
                tree.insert(&Mbr::new(x, y, x + 2.0, y + 2.0), &encode_u64(k))?;
            }
            Ok(())
        }));
    }
    for _ in 0..2 {
        let tree = Arc::clone(&tree);
        let expected = expected.clone();
        handles.push(thread::spawn(move || -> Result<()> {
            for _ in 0..20 {
                let found = search_keys(&tree, SearchMode::Within, &window)?;
                let distinct: HashSet<u64> = found.iter().copied().collect();
                assert_eq!(distinct.len(), found.len(), "an entry was returned twice");
                assert_eq!(found, expected);
            }
            Ok(())
        }));
    }
    for h in handles {
        h.join().expect("worker panicked")?;
    }

    let stats = tree.validate()?;
    assert_eq!(stats.n_records as u64, n_base + 3 * 1500);
    Ok(())
}
