//! Tuning knobs for [`Fs`](crate::Fs).
//!
//! Every field left at zero is "unset" and gets a default computed from total
//! memory and a quick measurement of the cache disk's write speed.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::limiter;

/// Coarse write-speed class of the cache disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskSpeed {
    Low,
    Middle,
    High,
    ExtremelyHigh,
}

impl DiskSpeed {
    /// Classify a measured throughput in MB/s.
    pub fn from_mb_per_sec(mbps: f64) -> Self {
        if mbps >= 1000.0 {
            DiskSpeed::ExtremelyHigh
        } else if mbps >= 300.0 {
            DiskSpeed::High
        } else if mbps >= 100.0 {
            DiskSpeed::Middle
        } else {
            DiskSpeed::Low
        }
    }
}

/// Probe size for [`measure_disk_speed`]
const PROBE_BYTES: usize = 4 << 20;

static DISK_SPEED: OnceCell<DiskSpeed> = OnceCell::new();

/// Time one buffered write + fsync in `dir`. Measured once per process.
pub fn measure_disk_speed(dir: &Path) -> DiskSpeed {
    *DISK_SPEED.get_or_init(|| match probe(dir) {
        Ok(speed) => speed,
        Err(e) => {
            debug!(error = %e, "disk speed probe failed, assuming low");
            DiskSpeed::Low
        }
    })
}

fn probe(dir: &Path) -> std::io::Result<DiskSpeed> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!(".speed.{}.tmp", std::process::id()));
    let buf = vec![0x5au8; PROBE_BYTES];

    let start = Instant::now();
    let result = (|| {
        let mut file = File::create(&path)?;
        file.write_all(&buf)?;
        file.sync_all()
    })();
    let elapsed = start.elapsed();
    let _ = fs::remove_file(&path);
    result?;

    let mbps = (PROBE_BYTES as f64 / (1 << 20) as f64) / elapsed.as_secs_f64().max(1e-6);
    let speed = DiskSpeed::from_mb_per_sec(mbps);
    debug!(mbps = mbps as u64, ?speed, "disk speed measured");
    Ok(speed)
}

/// Total system memory in GiB (at least 1).
pub fn system_memory_gb() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    (sys.total_memory() >> 30).max(1)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsOptions {
    /// Open Blocks Files kept before idle ones are evicted
    pub max_open_files: usize,
    /// Unsynced data bytes that trigger an fsync on writer close
    pub bytes_per_sync: u64,
    /// Seconds a shard may stay unsynced before the background loop syncs it
    pub sync_timeout_secs: u64,
    /// Forced syncs (and compactions) per background tick
    pub max_sync_files: usize,
    /// Global concurrent physical reads
    pub read_threads: usize,
    /// Global concurrent physical writes/fsyncs
    pub write_threads: usize,
    /// Minimum stale Meta File records before compaction
    pub compact_min_stale: u64,
    /// Minimum stale/total record ratio before compaction
    pub compact_stale_ratio: f64,
}

impl FsOptions {
    /// Fill unset fields. `dir` is probed for disk speed only when needed.
    pub fn ensure_defaults(&mut self, dir: &Path) {
        if self.max_open_files == 0 {
            self.max_open_files = (system_memory_gb() as usize * 128).clamp(256, 8 << 10);
        }
        if self.bytes_per_sync == 0 {
            self.bytes_per_sync = match measure_disk_speed(dir) {
                DiskSpeed::ExtremelyHigh => 32 << 20,
                DiskSpeed::High => 16 << 20,
                DiskSpeed::Middle => 4 << 20,
                DiskSpeed::Low => 1 << 20,
            };
        }
        if self.sync_timeout_secs == 0 {
            self.sync_timeout_secs = 1;
        }
        if self.max_sync_files == 0 {
            self.max_sync_files = 32;
        }
        let (reads, writes) = limiter::default_io_threads();
        if self.read_threads == 0 {
            self.read_threads = reads;
        }
        if self.write_threads == 0 {
            self.write_threads = writes;
        }
        if self.compact_min_stale == 0 {
            self.compact_min_stale = 1024;
        }
        if self.compact_stale_ratio <= 0.0 {
            self.compact_stale_ratio = 0.5;
        }
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}
