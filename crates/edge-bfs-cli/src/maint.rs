//! Offline maintenance over a cache directory: stat, verify, repair.
//!
//! These walk the `hh/pp.m` files directly instead of going through
//! [`edge_bfs::Fs`], so `stat` and `verify` also work while a server holds
//! the directory lock.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use edge_bfs::{BfsError, DirLock, MetaFile, ScanReport};
use edge_config::{log_bfs_debug, log_bfs_warn};
use rayon::prelude::*;
use serde::Serialize;
use walkdir::WalkDir;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DirStats {
    pub shards: usize,
    pub objects: usize,
    pub records: u64,
    pub stale_records: u64,
    pub data_bytes: u64,
    pub meta_bytes: u64,
    pub corrupt_shards: usize,
}

impl DirStats {
    fn add(mut self, other: DirStats) -> DirStats {
        self.shards += other.shards;
        self.objects += other.objects;
        self.records += other.records;
        self.stale_records += other.stale_records;
        self.data_bytes += other.data_bytes;
        self.meta_bytes += other.meta_bytes;
        self.corrupt_shards += other.corrupt_shards;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ShardCheck {
    pub path: PathBuf,
    pub report: ScanReport,
}

/// Every `<dir>/hh/pp.m`, sorted.
pub fn meta_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_shard_file(p, "m"))
        .collect();
    files.sort();
    files
}

fn is_shard_file(path: &Path, ext: &str) -> bool {
    let hex_pair = |s: Option<&str>| {
        s.is_some_and(|s| s.len() == 2 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')))
    };
    path.extension().and_then(|e| e.to_str()) == Some(ext)
        && hex_pair(path.file_stem().and_then(|s| s.to_str()))
        && hex_pair(
            path.parent()
                .and_then(|p| p.file_name())
                .and_then(|s| s.to_str()),
        )
}

pub fn stat(dir: &Path) -> Result<DirStats> {
    let shards: Vec<DirStats> = meta_files(dir)
        .par_iter()
        .map(|path| shard_stats(path))
        .collect::<Result<_>>()?;
    Ok(shards.into_iter().fold(DirStats::default(), DirStats::add))
}

fn shard_stats(meta_path: &Path) -> Result<DirStats> {
    let data_path = meta_path.with_extension("b");
    let mut stats = DirStats {
        shards: 1,
        meta_bytes: std::fs::metadata(meta_path)?.len(),
        data_bytes: std::fs::metadata(&data_path).map(|m| m.len()).unwrap_or(0),
        ..Default::default()
    };
    match MetaFile::open(meta_path) {
        Ok(meta) => {
            stats.objects = meta.len();
            stats.records = meta.records();
            stats.stale_records = meta.stale_records();
        }
        Err(BfsError::Corrupted { .. }) => stats.corrupt_shards = 1,
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", meta_path.display()))
        }
    }
    Ok(stats)
}

/// Replay every Meta File in parallel.
pub fn verify(dir: &Path) -> Result<Vec<ShardCheck>> {
    meta_files(dir)
        .into_par_iter()
        .map(|path| {
            let report = MetaFile::verify(&path)
                .with_context(|| format!("Failed to scan {}", path.display()))?;
            log_bfs_debug!(
                "Meta file scanned",
                path = path.display().to_string(),
                records = report.records,
                ok = report.is_ok()
            );
            Ok(ShardCheck { path, report })
        })
        .collect()
}

/// Truncate corrupt Meta Files at their last good record.
///
/// Takes the directory lock, so it fails while the cache is in use.
pub fn repair(dir: &Path) -> Result<Vec<ShardCheck>> {
    let _lock = DirLock::acquire(dir).context("Failed to acquire cache directory lock")?;
    let mut repaired = Vec::new();
    for check in verify(dir)? {
        if check.report.is_ok() {
            continue;
        }
        let report = MetaFile::repair(&check.path)
            .with_context(|| format!("Failed to repair {}", check.path.display()))?;
        log_bfs_warn!(
            "Meta file truncated",
            path = check.path.display().to_string(),
            kept_records = report.records,
            dropped_bytes = report.file_len - report.good_len
        );
        repaired.push(ShardCheck {
            path: check.path,
            report,
        });
    }
    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_bfs::{hash_of, shard_name, Fs, FsOptions};
    use std::io::Write;
    use tempfile::TempDir;

    fn populate(dir: &Path, keys: &[&str]) -> Vec<String> {
        let fs = Fs::open(
            dir,
            FsOptions {
                bytes_per_sync: 1 << 20,
                ..Default::default()
            },
        )
        .unwrap();
        let hashes = keys
            .iter()
            .map(|key| {
                let hash = hash_of(key);
                let mut writer = fs.open_file_writer(&hash, -1, false).unwrap();
                writer.write_meta(200, 0, -1).unwrap();
                writer.write_body(key.as_bytes()).unwrap();
                writer.close().unwrap();
                hash
            })
            .collect();
        fs.close().unwrap();
        hashes
    }

    #[test]
    fn test_meta_files_ignores_strays() {
        let temp = TempDir::new().unwrap();
        populate(temp.path(), &["a", "b"]);
        std::fs::create_dir_all(temp.path().join("zz")).unwrap();
        std::fs::write(temp.path().join("zz/yy.m"), b"").unwrap();
        std::fs::write(temp.path().join("notes.m"), b"").unwrap();

        let files = meta_files(temp.path());
        assert!(!files.is_empty());
        assert!(files.iter().all(|p| is_shard_file(p, "m")));
    }

    #[test]
    fn test_stat_counts_objects() {
        let temp = TempDir::new().unwrap();
        populate(temp.path(), &["one", "two", "three"]);

        let stats = stat(temp.path()).unwrap();
        assert_eq!(stats.objects, 3);
        assert_eq!(stats.records, 3);
        assert_eq!(stats.stale_records, 0);
        assert_eq!(stats.data_bytes, 11);
        assert_eq!(stats.corrupt_shards, 0);
    }

    #[test]
    fn test_verify_and_repair() {
        let temp = TempDir::new().unwrap();
        let hashes = populate(temp.path(), &["victim"]);
        let path = temp.path().join(format!("{}.m", shard_name(&hashes[0])));
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"\x00\x00")
            .unwrap();

        let checks = verify(temp.path()).unwrap();
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].report.is_ok());
        assert_eq!(stat(temp.path()).unwrap().corrupt_shards, 1);

        let repaired = repair(temp.path()).unwrap();
        assert_eq!(repaired.len(), 1);
        assert!(verify(temp.path()).unwrap().iter().all(|c| c.report.is_ok()));
        assert_eq!(stat(temp.path()).unwrap().objects, 1);
    }

    #[test]
    fn test_repair_needs_lock() {
        let temp = TempDir::new().unwrap();
        let _fs = Fs::open(temp.path(), FsOptions::default()).unwrap();
        assert!(repair(temp.path()).is_err());
    }
}
