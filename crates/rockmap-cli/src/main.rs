//! # rockmap CLI
//!
//! Inspect and edit the shared slot map of a cache directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rockmap::{region_name, CacheKey, DirMap, SlotId, SlotState};
use rockmap_config::logging::init_logging;
use tracing::debug;

/// rockmap - shared-memory slot index for disk caches
#[derive(Parser, Debug)]
#[command(name = "rockmap")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory holding shared segments (defaults to the configured one)
    #[arg(long, global = true, env = "ROCKMAP_SHM_DIR")]
    shm_dir: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the shared segment name derived from a cache directory
    Name {
        #[arg(value_name = "CACHE_DIR")]
        cache_dir: PathBuf,
    },

    /// Create (or recreate) the map for a cache directory
    Create {
        #[arg(value_name = "CACHE_DIR")]
        cache_dir: PathBuf,

        /// Slot capacity (defaults to the configured limit)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show header counters and per-state slot counts
    Stats {
        #[arg(value_name = "CACHE_DIR")]
        cache_dir: PathBuf,

        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// List every slot that is not empty
    Dump {
        #[arg(value_name = "CACHE_DIR")]
        cache_dir: PathBuf,
    },

    /// Look up a key (32 hex digits) and print its metadata
    Get {
        #[arg(value_name = "CACHE_DIR")]
        cache_dir: PathBuf,

        #[arg(value_name = "KEY")]
        key: CacheKey,
    },

    /// Mark a slot for removal
    Free {
        #[arg(value_name = "CACHE_DIR")]
        cache_dir: PathBuf,

        #[arg(value_name = "SLOT")]
        slot: SlotId,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = rockmap_config::config().clone();
    init_logging(config.log.level.raised(cli.verbose));

    let shm_dir = cli.shm_dir.clone().unwrap_or(config.region.shm_dir);
    debug!(shm_dir = %shm_dir.display(), "Using segment directory");

    match cli.command {
        Commands::Name { cache_dir } => {
            println!("{}", region_name(&cache_dir.to_string_lossy()));
        }
        Commands::Create { cache_dir, limit } => {
            let limit = limit.unwrap_or(config.map.default_limit);
            let map = DirMap::create_in(&shm_dir, &cache_dir, limit)
                .with_context(|| format!("Failed to create map for {}", cache_dir.display()))?;
            println!(
                "Created map {} ({} slots, {} bytes) in {}",
                map.region_name(),
                map.entry_limit(),
                DirMap::shared_size(map.entry_limit()),
                shm_dir.display()
            );
        }
        Commands::Stats { cache_dir, json } => {
            let map = open(&shm_dir, &cache_dir)?;
            let stats = map.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Map:        {}", map.region_name());
                println!("Limit:      {}", stats.limit);
                println!("Count:      {}", stats.count);
                println!("Full:       {}", map.full());
                println!("Empty:      {}", stats.empty);
                println!("Writing:    {}", stats.writing);
                println!("Usable:     {}", stats.usable);
                println!("Waiting:    {}", stats.waiting_to_be_freed);
                println!("Freeing:    {}", stats.freeing);
                if stats.corrupt > 0 {
                    println!("Corrupt:    {}", stats.corrupt);
                }
            }
        }
        Commands::Dump { cache_dir } => {
            let map = open(&shm_dir, &cache_dir)?;
            println!("{:>8}  {:<20}  {:>7}  KEY", "SLOT", "STATE", "READERS");
            for id in 0..map.entry_limit() as SlotId {
                let snap = map.snapshot(id);
                if snap.state == Some(SlotState::Empty) {
                    continue;
                }
                let state = snap
                    .state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "{:>8}  {:<20}  {:>7}  {}",
                    snap.id, state, snap.read_level, snap.key
                );
            }
        }
        Commands::Get { cache_dir, key } => {
            let map = open(&shm_dir, &cache_dir)?;
            let Some(entry) = map.open_for_reading(&key) else {
                bail!("Key {} not found in {}", key, map.region_name());
            };
            let metadata = *entry.metadata();
            let slot = entry.slot_id();
            map.close_for_reading(entry);

            println!("Slot:       {}", slot);
            println!("Timestamp:  {}", metadata.timestamp);
            println!("Last ref:   {}", metadata.lastref);
            println!("Expires:    {}", metadata.expires);
            println!("Last mod:   {}", metadata.lastmod);
            println!("Size:       {}", metadata.swap_file_sz);
            println!("Refcount:   {}", metadata.refcount);
            println!("Flags:      {:#06x}", metadata.flags);
        }
        Commands::Free { cache_dir, slot } => {
            let map = open(&shm_dir, &cache_dir)?;
            if !map.valid(slot) {
                bail!(
                    "Slot {} out of range (map has {} slots)",
                    slot,
                    map.entry_limit()
                );
            }
            if map.free(slot) {
                println!("Marked slot {} to be freed", slot);
            } else {
                println!("Slot {} was not usable; nothing to free", slot);
            }
        }
    }

    Ok(())
}

fn open(shm_dir: &Path, cache_dir: &Path) -> Result<DirMap> {
    DirMap::open_in(shm_dir, cache_dir)
        .with_context(|| format!("Failed to open map for {}", cache_dir.display()))
}
