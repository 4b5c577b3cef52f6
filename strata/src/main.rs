use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use fastnbt::Value;
use strata_anvil::{ChunkPos, RegionFileStorage, RegionFileVersion, RegionPos};
use strata_metrics::StorageMetrics;
use strata_storage::StorageConfig;

#[derive(Parser, Debug)]
#[command(name = "strata", about = "Inspect and repair Anvil region folders")]
pub struct Args {
    #[arg(short, long, env = "STRATA_REGION_DIR", default_value = "region")]
    pub region_dir: PathBuf,

    /// Log at debug level and print a storage report on exit
    #[arg(short, long)]
    pub verbose: bool,

    /// fsync region files after every header update
    #[arg(long, env = "STRATA_SYNC")]
    pub sync: bool,

    /// Codec for new records: "gzip", "deflate", "none" or "lz4"
    #[arg(long, default_value = "deflate", value_parser = parse_compression)]
    pub compression: RegionFileVersion,

    #[arg(long, default_value_t = 256)]
    pub max_open_regions: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// List the occupied slots of region r.X.Z.mca
    #[command(allow_negative_numbers = true)]
    Info { x: i32, z: i32 },
    /// Print a chunk's tag tree as JSON
    #[command(allow_negative_numbers = true)]
    Get { chunk_x: i32, chunk_z: i32 },
    /// Read every chunk of every region file
    Check,
    /// Delete a chunk
    #[command(allow_negative_numbers = true)]
    Clear { chunk_x: i32, chunk_z: i32 },
}

fn parse_compression(name: &str) -> Result<RegionFileVersion, String> {
    RegionFileVersion::from_name(name).ok_or_else(|| format!("unknown compression \"{name}\""))
}

impl Args {
    fn storage_config(&self) -> StorageConfig {
        let mut config = StorageConfig::new(&self.region_dir);
        config.sync_writes = self.sync;
        config.compression = self.compression;
        config.max_open_regions =
            NonZeroUsize::new(self.max_open_regions).unwrap_or(NonZeroUsize::MIN);
        config
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = args.storage_config();
    log::debug!("Opening {}", config.summary());
    let metrics = Arc::new(StorageMetrics::new(config.summary()));
    let mut storage = config.open_region_storage(Arc::clone(&metrics));

    let result = run(&args.command, &mut storage);
    let closed = storage.close();
    if args.verbose {
        eprintln!("{}", metrics.generate_report());
    }
    result.and(closed)
}

fn run(command: &Command, storage: &mut RegionFileStorage) -> Result<()> {
    match *command {
        Command::Info { x, z } => info(storage, RegionPos::new(x, z)),
        Command::Get { chunk_x, chunk_z } => {
            let pos = ChunkPos::new(chunk_x, chunk_z);
            match storage.read(pos)? {
                Some(tag) => println!("{}", serde_json::to_string_pretty(&to_json(&tag))?),
                None => bail!("Chunk {pos} not found"),
            }
            Ok(())
        }
        Command::Check => check(storage),
        Command::Clear { chunk_x, chunk_z } => {
            let pos = ChunkPos::new(chunk_x, chunk_z);
            if !region_exists(storage, pos.region()) || !storage.does_chunk_exist(pos)? {
                println!("Chunk {pos} is already absent");
                return Ok(());
            }
            storage.write(pos, None)?;
            println!("Cleared chunk {pos}");
            Ok(())
        }
    }
}

fn region_exists(storage: &RegionFileStorage, region: RegionPos) -> bool {
    storage.folder().join(region.file_name()).is_file()
}

fn info(storage: &mut RegionFileStorage, region_pos: RegionPos) -> Result<()> {
    if !region_exists(storage, region_pos) {
        bail!("Region file {} does not exist", region_pos.file_name());
    }
    let region = storage.region(region_pos)?;
    let entries = region.entries();
    println!(
        "{}: {} chunks, {} sectors used",
        region_pos.file_name(),
        entries.len(),
        region.used_sectors().used().count()
    );
    for entry in entries {
        let pos = region_pos.chunk_at(entry.index);
        println!(
            "  {pos} slot={} sector={} count={} timestamp={}",
            entry.index,
            entry.offset.sector(),
            entry.offset.count(),
            entry.timestamp
        );
    }
    Ok(())
}

fn check(storage: &mut RegionFileStorage) -> Result<()> {
    let mut total = 0;
    let mut broken = 0;
    for region_pos in storage.list_regions()? {
        let entries = storage.region(region_pos)?.entries();
        let mut region_broken = 0;
        for entry in &entries {
            let pos = region_pos.chunk_at(entry.index);
            match storage.read(pos) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    println!("  {pos}: unreadable record");
                    region_broken += 1;
                }
                Err(e) => {
                    println!("  {pos}: {e:#}");
                    region_broken += 1;
                }
            }
        }
        println!("{}: {} chunks, {} broken", region_pos.file_name(), entries.len(), region_broken);
        total += entries.len();
        broken += region_broken;
    }
    println!("Checked {total} chunks, {broken} broken");
    Ok(())
}

/// Tag tree as JSON; typed arrays become plain number arrays.
fn to_json(tag: &Value) -> serde_json::Value {
    use serde_json::json;
    match tag {
        Value::Byte(v) => json!(v),
        Value::Short(v) => json!(v),
        Value::Int(v) => json!(v),
        Value::Long(v) => json!(v),
        Value::Float(v) => json!(v),
        Value::Double(v) => json!(v),
        Value::String(v) => json!(v),
        Value::ByteArray(v) => json!(v.iter().collect::<Vec<_>>()),
        Value::IntArray(v) => json!(v.iter().collect::<Vec<_>>()),
        Value::LongArray(v) => json!(v.iter().collect::<Vec<_>>()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Compound(map) => serde_json::Value::Object(
            map.iter().map(|(key, value)| (key.clone(), to_json(value))).collect(),
        ),
    }
}
