//! vibetree - exercises the B-tree and R-tree engines from the command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use vibetree::access::btree::validate::BTreeStatistics;
use vibetree::access::btree::TreeCounters;
use vibetree::access::rtree::mbr::{Mbr, SearchMode};
use vibetree::access::{encode_u64, Tuple};
use vibetree::config::EngineConfig;
use vibetree::engine::Engine;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Engine configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Page file; pages stay in memory when omitted
    #[arg(short = 'f', long, global = true)]
    file: Option<PathBuf>,

    /// Seed for generated workloads
    #[arg(long, global = true, default_value = "42")]
    seed: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a tree of N keys and print its shape
    Demo {
        #[arg(short, long, default_value = "10000")]
        keys: u64,
        /// Payload bytes per record
        #[arg(short, long, default_value = "100")]
        payload: usize,
    },
    /// Build a tree, delete a share of it and validate the result
    Validate {
        #[arg(short, long, default_value = "10000")]
        keys: u64,
        /// Percentage of keys to delete
        #[arg(short = 'p', long, default_value = "50")]
        delete_pct: u64,
    },
    /// Insert random rectangles and run a window query
    Rtree {
        #[arg(short, long, default_value = "10000")]
        rects: u64,
        /// Window as xmin,ymin,xmax,ymax
        #[arg(short, long, default_value = "100,100,200,200", value_delimiter = ',')]
        window: Vec<f64>,
    },
}

fn open_engine(args: &Args) -> Result<Engine> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => EngineConfig::default(),
    };
    let engine = match &args.file {
        Some(path) => Engine::create(path, config)
            .with_context(|| format!("Failed to create page file {:?}", path))?,
        None => Engine::in_memory(config)?,
    };
    Ok(engine)
}

fn row(k: u64, payload: usize) -> Tuple {
    Tuple::from_slices(&[&encode_u64(k), &vec![(k % 251) as u8; payload]])
}

fn print_stats(stats: &BTreeStatistics) {
    println!("height:          {}", stats.height);
    println!("pages:           {}", stats.n_pages);
    println!("pages per level: {:?} (leaf first)", stats.pages_per_level);
    println!("records:         {}", stats.n_records);
    println!("leaf fill:       {}%", stats.leaf_fill_pct());
}

fn print_counters(counters: &TreeCounters) {
    let get = |c: &AtomicU64| TreeCounters::get(c);
    println!(
        "splits: {}, root raises: {}, merges: {}, discards: {}, lifts: {}",
        get(&counters.splits),
        get(&counters.root_raises),
        get(&counters.merges),
        get(&counters.discards),
        get(&counters.lifts)
    );
}

fn demo(engine: &Engine, rng: &mut StdRng, keys: u64, payload: usize) -> Result<()> {
    let tree = engine.create_clustered_index("demo", 1, 2)?;
    let mut order: Vec<u64> = (0..keys).collect();
    order.shuffle(rng);
    for &k in &order {
        tree.insert(&row(k, payload))?;
    }
    // repeated point lookups let the hash index kick in
    for _ in 0..keys {
        let k = rng.gen_range(0..keys);
        tree.get(&Tuple::from_slices(&[&encode_u64(k)]))?
            .with_context(|| format!("key {} went missing", k))?;
    }
    print_stats(&tree.validate()?);
    print_counters(tree.counters());
    let ahi = engine.ahi().snapshot();
    println!("adaptive hash:   {:?}", ahi);
    Ok(())
}

fn validate(engine: &Engine, rng: &mut StdRng, keys: u64, delete_pct: u64) -> Result<()> {
    let tree = engine.create_clustered_index("validate", 1, 2)?;
    for k in 0..keys {
        tree.insert(&row(k, 100))?;
    }
    let mut order: Vec<u64> = (0..keys).collect();
    order.shuffle(rng);
    let n_delete = (keys * delete_pct.min(100) / 100) as usize;
    for &k in &order[..n_delete] {
        tree.delete(&Tuple::from_slices(&[&encode_u64(k)]))?;
    }
    let stats = tree.validate()?;
    println!("tree is consistent after {} deletes", n_delete);
    print_stats(&stats);
    print_counters(tree.counters());
    let entries = engine.ahi().validate(engine.pool())?;
    println!("adaptive hash is consistent: {} entries", entries);
    Ok(())
}

fn rtree(engine: &Engine, rng: &mut StdRng, rects: u64, window: &[f64]) -> Result<()> {
    anyhow::ensure!(window.len() == 4, "window needs four coordinates");
    let tree = engine.create_spatial_index("rtree")?;
    for k in 0..rects {
        let x = rng.gen_range(0.0..1000.0);
        let y = rng.gen_range(0.0..1000.0);
        let w = rng.gen_range(0.0..10.0);
        let h = rng.gen_range(0.0..10.0);
        tree.insert(&Mbr::new(x, y, x + w, y + h), &encode_u64(k))?;
    }
    let query = Mbr::new(window[0], window[1], window[2], window[3]);
    let estimate = tree.estimate_n_rows_in_range(SearchMode::Intersect, &query)?;
    let mut search = tree.search(SearchMode::Intersect, &query);
    let mut hits = 0;
    for entry in search.by_ref() {
        entry?;
        hits += 1;
    }
    let (pages, _) = search.statistics();
    println!("window {:?}: {} entries, {} pages read, estimate {:?}", query, hits, pages, estimate);
    print_stats(&tree.validate()?);
    print_counters(tree.counters());
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let engine = open_engine(&args)?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    match &args.command {
        Command::Demo { keys, payload } => demo(&engine, &mut rng, *keys, *payload),
        Command::Validate { keys, delete_pct } => validate(&engine, &mut rng, *keys, *delete_pct),
        Command::Rtree { rects, window } => rtree(&engine, &mut rng, *rects, window),
    }
}
