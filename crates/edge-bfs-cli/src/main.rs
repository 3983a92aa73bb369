//! # bfsctl
//!
//! Inspection and maintenance tool for edge block-file caches.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use edge_bfs::{check_hash, hash_of, Fs, FsOptions};
use edge_config::logging::{init_logging, LogLevel};
use edge_config::{log_cli_debug, log_cli_info, log_cli_warn, Config};

mod maint;

/// Inspect and maintain an edge block-file cache directory
#[derive(Parser)]
#[command(name = "bfsctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Cache directory (default: storage.dir from config)
    #[arg(long, global = true, env = "EDGE_BFS_DIR")]
    dir: Option<PathBuf>,

    /// Log level (overrides config; EDGE_LOG/RUST_LOG win over both)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Shard count, objects and bytes
    Stat {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Store a file as a cached object
    Put {
        #[command(flatten)]
        object: ObjectArgs,

        /// Body source
        #[arg(short, long, value_name = "FILE")]
        file: PathBuf,

        /// Response status recorded with the object
        #[arg(long, default_value_t = 200)]
        status: i32,

        /// Seconds until the object expires
        #[arg(long, default_value_t = 3600)]
        ttl: i64,

        /// Raw response header bytes to store alongside the body
        #[arg(long)]
        header: Option<String>,
    },

    /// Write an object's body to stdout
    Get {
        #[command(flatten)]
        object: ObjectArgs,

        /// Write the stored header before the body
        #[arg(long)]
        include_header: bool,
    },

    /// Remove an object
    Rm {
        #[command(flatten)]
        object: ObjectArgs,
    },

    /// Rewrite Meta Files without stale records
    Compact,

    /// Replay every Meta File and report corrupt shards
    Verify,

    /// Truncate corrupt Meta Files at their last good record
    Repair,

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
struct ObjectArgs {
    /// 32-char lowercase hex object hash
    #[arg(value_name = "HASH", required_unless_present = "key")]
    hash: Option<String>,

    /// Derive the hash from a cache key instead
    #[arg(long, conflicts_with = "hash")]
    key: Option<String>,
}

impl ObjectArgs {
    fn resolve(&self) -> Result<String> {
        match (&self.hash, &self.key) {
            (_, Some(key)) => Ok(hash_of(key)),
            (Some(hash), None) if check_hash(hash) => Ok(hash.clone()),
            (Some(hash), None) => bail!("invalid hash {hash:?}: want 32 lowercase hex chars"),
            (None, None) => bail!("either HASH or --key is required"),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = edge_config::config();
    init_logging(cli.log_level.unwrap_or(config.log.level));

    let dir = cli
        .dir
        .clone()
        .unwrap_or_else(|| config.storage.resolved_dir());
    log_cli_debug!("Using cache directory", dir = dir.display().to_string());

    match cli.command {
        Commands::Stat { json } => cmd_stat(&dir, json),
        Commands::Put {
            object,
            file,
            status,
            ttl,
            header,
        } => cmd_put(&dir, &config, &object.resolve()?, &file, status, ttl, header),
        Commands::Get {
            object,
            include_header,
        } => cmd_get(&dir, &config, &object.resolve()?, include_header),
        Commands::Rm { object } => cmd_rm(&dir, &config, &object.resolve()?),
        Commands::Compact => cmd_compact(&dir, &config),
        Commands::Verify => cmd_verify(&dir),
        Commands::Repair => cmd_repair(&dir),
        Commands::Config => cmd_config(&config),
    }
}

fn open_fs(dir: &Path, config: &Config) -> Result<Fs> {
    let opts: FsOptions = config.storage.fs.clone();
    Fs::open(dir, opts).with_context(|| format!("Failed to open cache at {}", dir.display()))
}

fn cmd_stat(dir: &Path, json: bool) -> Result<()> {
    if !dir.exists() {
        bail!("cache directory {} does not exist", dir.display());
    }
    let stats = maint::stat(dir)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("Cache:          {}", dir.display());
    println!("Shards:         {}", stats.shards);
    println!("Objects:        {}", stats.objects);
    println!("Meta records:   {} ({} stale)", stats.records, stats.stale_records);
    println!("Data bytes:     {}", stats.data_bytes);
    println!("Meta bytes:     {}", stats.meta_bytes);
    if stats.corrupt_shards > 0 {
        println!("Corrupt shards: {} (run `bfsctl repair`)", stats.corrupt_shards);
    }
    Ok(())
}

fn cmd_put(
    dir: &Path,
    config: &Config,
    hash: &str,
    file: &Path,
    status: i32,
    ttl: i64,
    header: Option<String>,
) -> Result<()> {
    let mut source = File::open(file).with_context(|| format!("Failed to open {}", file.display()))?;
    let size = source.metadata()?.len() as i64;

    let fs = open_fs(dir, config)?;
    let mut writer = fs.open_file_writer(hash, size, false)?;
    writer.write_meta(status, unix_now() + ttl, size)?;
    if let Some(header) = header {
        writer.write_header(header.as_bytes())?;
    }
    io::copy(&mut source, &mut writer).context("Failed to copy body")?;
    writer.close()?;
    fs.close()?;

    log_cli_info!("Stored object", hash = hash, bytes = size);
    println!("{hash}");
    Ok(())
}

fn cmd_get(dir: &Path, config: &Config, hash: &str, include_header: bool) -> Result<()> {
    let fs = open_fs(dir, config)?;
    let mut reader = match fs.open_file_reader(hash, false) {
        Ok(reader) => reader,
        Err(e) if e.is_not_found() => bail!("object {hash} not found"),
        Err(e) => return Err(e.into()),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if include_header {
        out.write_all(&reader.read_header()?)?;
    }
    io::copy(&mut reader, &mut out)?;
    out.flush()?;
    drop(reader);
    fs.close()?;
    Ok(())
}

fn cmd_rm(dir: &Path, config: &Config, hash: &str) -> Result<()> {
    let fs = open_fs(dir, config)?;
    if !fs.exist_file(hash)? {
        log_cli_warn!("Object not present", hash = hash);
    }
    fs.remove_file(hash)?;
    fs.close()?;
    Ok(())
}

fn cmd_compact(dir: &Path, config: &Config) -> Result<()> {
    let fs = open_fs(dir, config)?;
    let compacted = fs.compact(true)?;
    fs.close()?;
    println!("Compacted {compacted} shard(s)");
    Ok(())
}

fn cmd_verify(dir: &Path) -> Result<()> {
    let checks = maint::verify(dir)?;
    let corrupt: Vec<_> = checks.iter().filter(|c| !c.report.is_ok()).collect();
    for check in &corrupt {
        println!(
            "CORRUPT {} at offset {}: {}",
            check.path.display(),
            check.report.good_len,
            check.report.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!("Verified {} shard(s), {} corrupt", checks.len(), corrupt.len());
    if !corrupt.is_empty() {
        bail!("{} corrupt shard(s)", corrupt.len());
    }
    Ok(())
}

fn cmd_repair(dir: &Path) -> Result<()> {
    let repaired = maint::repair(dir)?;
    for check in &repaired {
        println!(
            "Repaired {}: kept {} record(s), dropped {} byte(s)",
            check.path.display(),
            check.report.records,
            check.report.file_len - check.report.good_len
        );
    }
    println!("Repaired {} shard(s)", repaired.len());
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
