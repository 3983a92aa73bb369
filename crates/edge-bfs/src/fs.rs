//! Shard manager for one cache directory.
//!
//! Routes each hash to its shard (`<dir>/hh/pp.b` + `.m`), opens shards on
//! demand, evicts idle ones past `max_open_files`, and runs the background
//! loop that syncs and compacts dirty shards.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::blocks_file::BlocksFile;
use crate::file_reader::FileReader;
use crate::file_writer::FileWriter;
use crate::hash::{check_hash_err, shard_name};
use crate::limiter;
use crate::lock::DirLock;
use crate::options::FsOptions;
use crate::{BfsError, Result};

const TICK: Duration = Duration::from_secs(1);

/// Attempts for an operation racing a shard eviction
const MAX_SHARD_RETRIES: usize = 3;

/// Aggregate over the currently open shards
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsStats {
    pub open_shards: usize,
    pub objects: usize,
    pub data_bytes: u64,
    pub meta_bytes: u64,
    pub stale_records: u64,
    pub unsynced_bytes: u64,
    pub writers: usize,
    pub readers: usize,
}

struct FsInner {
    dir: PathBuf,
    opts: FsOptions,
    shards: RwLock<HashMap<String, Arc<BlocksFile>>>,
    closed: AtomicBool,
    /// Logical clock for LRU stamps
    clock: AtomicU64,
}

pub struct Fs {
    inner: Arc<FsInner>,
    stop_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    lock: Mutex<Option<DirLock>>,
}

impl Fs {
    /// Open (or create) a cache directory and start the sync loop.
    ///
    /// Fails with [`BfsError::Locked`] when another process holds the
    /// directory.
    pub fn open<P: AsRef<Path>>(dir: P, mut opts: FsOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let lock = DirLock::acquire(&dir)?;

        opts.ensure_defaults(&dir);
        if !limiter::set_io_threads(opts.read_threads, opts.write_threads) {
            debug!("I/O limits already set for this process");
        }

        let inner = Arc::new(FsInner {
            dir,
            opts,
            shards: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            clock: AtomicU64::new(0),
        });

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let worker = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("bfs-sync".into())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(TICK) {
                        Err(RecvTimeoutError::Timeout) => inner.tick(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                })?
        };

        info!(
            dir = %inner.dir.display(),
            max_open_files = inner.opts.max_open_files,
            bytes_per_sync = inner.opts.bytes_per_sync,
            "bfs opened"
        );

        Ok(Self {
            inner,
            stop_tx: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
            lock: Mutex::new(Some(lock)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn options(&self) -> &FsOptions {
        &self.inner.opts
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    #[instrument(skip(self), level = "debug")]
    pub fn open_file_writer(&self, hash: &str, body_size: i64, is_partial: bool) -> Result<FileWriter> {
        check_hash_err(hash)?;
        self.inner
            .with_shard(&shard_name(hash), true, |bfile| {
                bfile.open_file_writer(hash, body_size, is_partial)
            })?
            .ok_or(BfsError::Closed)
    }

    #[instrument(skip(self), level = "debug")]
    pub fn open_file_reader(&self, hash: &str, is_partial: bool) -> Result<FileReader> {
        check_hash_err(hash)?;
        self.inner
            .with_shard(&shard_name(hash), false, |bfile| {
                bfile.open_file_reader(hash, is_partial)
            })?
            .ok_or_else(|| BfsError::NotFound {
                hash: hash.to_string(),
            })
    }

    pub fn exist_file(&self, hash: &str) -> Result<bool> {
        check_hash_err(hash)?;
        Ok(self
            .inner
            .with_shard(&shard_name(hash), false, |bfile| bfile.exist_file(hash))?
            .unwrap_or(false))
    }

    /// Remove an object. Absent objects are fine.
    pub fn remove_file(&self, hash: &str) -> Result<()> {
        check_hash_err(hash)?;
        self.inner
            .with_shard(&shard_name(hash), false, |bfile| bfile.remove_file(hash))?;
        Ok(())
    }

    /// Shard names (`hh/pp`) present on disk.
    pub fn shard_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for outer in fs::read_dir(&self.inner.dir)? {
            let outer = outer?;
            let prefix = outer.file_name().to_string_lossy().into_owned();
            if !outer.file_type()?.is_dir() || !is_hex_pair(&prefix) {
                continue;
            }
            for entry in fs::read_dir(outer.path())? {
                let path = entry?.path();
                let is_shard_file = matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("b") | Some("m")
                );
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if is_shard_file && is_hex_pair(stem) {
                    names.push(format!("{prefix}/{stem}"));
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Compact every shard on disk whose Meta File has stale records.
    ///
    /// With `force`, any stale record qualifies; otherwise the configured
    /// thresholds apply. Returns the number of shards compacted.
    pub fn compact(&self, force: bool) -> Result<usize> {
        let (min_stale, ratio) = if force {
            (1, 0.0)
        } else {
            (self.inner.opts.compact_min_stale, self.inner.opts.compact_stale_ratio)
        };
        let mut compacted = 0;
        for name in self.shard_names()? {
            let done = self.inner.with_shard(&name, false, |bfile| {
                if bfile.needs_compact(min_stale, ratio) {
                    bfile.compact()?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })?;
            if done == Some(true) {
                compacted += 1;
            }
        }
        Ok(compacted)
    }

    /// fsync every open shard now.
    pub fn sync_all(&self) -> Result<()> {
        self.check_open()?;
        for bfile in self.inner.open_shards() {
            match bfile.force_sync() {
                Err(BfsError::Closed) => {}
                r => r?,
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> FsStats {
        let shards = self.inner.open_shards();
        let mut stats = FsStats {
            open_shards: shards.len(),
            ..Default::default()
        };
        for bfile in shards {
            let s = bfile.stats();
            stats.objects += s.objects;
            stats.data_bytes += s.data_bytes;
            stats.meta_bytes += s.meta_bytes;
            stats.stale_records += s.stale_records;
            stats.unsynced_bytes += s.unsynced_bytes;
            stats.writers += s.writers;
            stats.readers += s.readers;
        }
        stats
    }

    /// Delete every shard in the directory. The Fs stays usable.
    pub fn remove_all(&self) -> Result<()> {
        self.check_open()?;
        let mut shards = self.inner.shards.write();
        for (_, bfile) in shards.drain() {
            bfile.remove_all()?;
        }
        for entry in fs::read_dir(&self.inner.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && is_hex_pair(&name) {
                fs::remove_dir_all(entry.path())?;
            }
        }
        info!(dir = %self.inner.dir.display(), "bfs cleared");
        Ok(())
    }

    /// Stop the sync loop, force-sync and close every shard, release the
    /// directory lock. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // dropping the sender wakes the loop
        self.stop_tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("bfs sync thread panicked");
            }
        }

        let mut result = Ok(());
        for (name, bfile) in self.inner.shards.write().drain() {
            if let Err(e) = bfile.close() {
                warn!(shard = %name, error = %e, "failed to close shard");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        if let Some(lock) = self.lock.lock().take() {
            lock.release()?;
        }
        info!(dir = %self.inner.dir.display(), "bfs closed");
        result
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BfsError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Fs {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "bfs close on drop failed");
        }
    }
}

impl std::fmt::Debug for Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fs")
            .field("dir", &self.inner.dir)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl FsInner {
    /// Run `f` against shard `name`, reopening it if it was evicted
    /// mid-operation. `None` means the shard does not exist and `create`
    /// was false.
    fn with_shard<R>(
        &self,
        name: &str,
        create: bool,
        f: impl Fn(&Arc<BlocksFile>) -> Result<R>,
    ) -> Result<Option<R>> {
        let mut attempt = 0;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(BfsError::Closed);
            }
            let Some(bfile) = self.shard(name, create)? else {
                return Ok(None);
            };
            match f(&bfile) {
                Err(BfsError::Closed)
                    if attempt + 1 < MAX_SHARD_RETRIES && !self.closed.load(Ordering::Acquire) =>
                {
                    attempt += 1;
                    self.forget(name, &bfile);
                }
                r => return r.map(Some),
            }
        }
    }

    fn shard(&self, name: &str, create: bool) -> Result<Option<Arc<BlocksFile>>> {
        if let Some(bfile) = self.shards.read().get(name) {
            bfile.touch(self.stamp());
            return Ok(Some(bfile.clone()));
        }

        let path = self.dir.join(format!("{name}.b"));
        if !create && !path.exists() && !path.with_extension("m").exists() {
            return Ok(None);
        }

        let mut shards = self.shards.write();
        if let Some(bfile) = shards.get(name) {
            bfile.touch(self.stamp());
            return Ok(Some(bfile.clone()));
        }

        let bfile = Arc::new(BlocksFile::open(&path, self.opts.bytes_per_sync)?);
        bfile.touch(self.stamp());
        shards.insert(name.to_string(), bfile.clone());
        if shards.len() > self.opts.max_open_files {
            evict_idle(&mut shards, self.opts.max_open_files, name);
        }
        Ok(Some(bfile))
    }

    /// Drop a closed instance from the map unless it was already replaced.
    fn forget(&self, name: &str, stale: &Arc<BlocksFile>) {
        let mut shards = self.shards.write();
        if shards.get(name).is_some_and(|b| Arc::ptr_eq(b, stale)) {
            shards.remove(name);
        }
    }

    fn stamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn open_shards(&self) -> Vec<Arc<BlocksFile>> {
        self.shards.read().values().cloned().collect()
    }

    /// One pass of the background loop.
    fn tick(&self) {
        let timeout = self.opts.sync_timeout();
        let mut due: Vec<_> = self
            .open_shards()
            .into_iter()
            .filter(|b| !b.is_closed() && b.needs_sync() && b.sync_at().elapsed() >= timeout)
            .collect();
        due.sort_by_key(|b| b.sync_at());

        for bfile in due.iter().take(self.opts.max_sync_files) {
            match bfile.force_sync() {
                Ok(()) | Err(BfsError::Closed) => {}
                Err(e) => warn!(path = %bfile.path().display(), error = %e, "background sync failed"),
            }
        }

        let compactable = self
            .open_shards()
            .into_iter()
            .filter(|b| b.needs_compact(self.opts.compact_min_stale, self.opts.compact_stale_ratio))
            .take(self.opts.max_sync_files);
        for bfile in compactable {
            match bfile.compact() {
                Ok(()) | Err(BfsError::Closed) => {}
                Err(e) => warn!(path = %bfile.path().display(), error = %e, "background compaction failed"),
            }
        }
    }
}

/// Close least recently used idle shards until at most `max` remain.
fn evict_idle(shards: &mut HashMap<String, Arc<BlocksFile>>, max: usize, keep: &str) {
    let mut idle: Vec<(u64, String)> = shards
        .iter()
        .filter(|(name, bfile)| name.as_str() != keep && bfile.can_close())
        .map(|(name, bfile)| (bfile.last_access(), name.clone()))
        .collect();
    idle.sort_unstable();

    let excess = shards.len().saturating_sub(max);
    let mut evicted = 0;
    for (_, name) in idle {
        if evicted == excess {
            break;
        }
        let Some(bfile) = shards.get(&name) else {
            continue;
        };
        match bfile.close_if_idle() {
            Ok(true) => {}
            // became busy since the scan
            Ok(false) => continue,
            Err(e) => warn!(shard = %name, error = %e, "failed to sync evicted shard"),
        }
        shards.remove(&name);
        evicted += 1;
        debug!(shard = %name, "evicted idle shard");
    }
}

fn is_hex_pair(s: &str) -> bool {
    s.len() == 2 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hash_of, HASH_LEN};
    use std::io::Read;
    use tempfile::TempDir;

    fn opts() -> FsOptions {
        FsOptions {
            max_open_files: 4,
            bytes_per_sync: 1 << 20,
            ..Default::default()
        }
    }

    fn put(fs: &Fs, key: &str, body: &[u8]) -> String {
        let hash = hash_of(key);
        let mut writer = fs.open_file_writer(&hash, -1, false).unwrap();
        writer.write_meta(200, 0, -1).unwrap();
        writer.write_body(body).unwrap();
        writer.close().unwrap();
        hash
    }

    fn put_hash(fs: &Fs, hash: &str, body: &[u8]) {
        let mut writer = fs.open_file_writer(hash, -1, false).unwrap();
        writer.write_meta(200, 0, -1).unwrap();
        writer.write_body(body).unwrap();
        writer.close().unwrap();
    }

    fn hash_in_shard(prefix: &str, fill: char) -> String {
        format!("{prefix}{}", fill.to_string().repeat(HASH_LEN - prefix.len()))
    }

    #[test]
    fn test_shard_routing() {
        let temp = TempDir::new().unwrap();
        let fs = Fs::open(temp.path(), opts()).unwrap();
        let hash = put(&fs, "route", b"x");
        fs.sync_all().unwrap();

        let name = shard_name(&hash);
        assert!(temp.path().join(format!("{name}.b")).exists());
        assert!(temp.path().join(format!("{name}.m")).exists());
        assert_eq!(fs.shard_names().unwrap(), vec![name]);
    }

    #[test]
    fn test_missing_shard_not_created() {
        let temp = TempDir::new().unwrap();
        let fs = Fs::open(temp.path(), opts()).unwrap();
        let hash = hash_of("nobody");

        assert!(!fs.exist_file(&hash).unwrap());
        assert!(fs.open_file_reader(&hash, false).unwrap_err().is_not_found());
        fs.remove_file(&hash).unwrap();
        assert!(fs.shard_names().unwrap().is_empty());
        assert_eq!(fs.stats().open_shards, 0);
    }

    #[test]
    fn test_lru_eviction() {
        let temp = TempDir::new().unwrap();
        let fs = Fs::open(temp.path(), opts()).unwrap();

        let hashes: Vec<_> = (0..12).map(|i| put(&fs, &format!("key-{i}"), b"body")).collect();
        assert!(fs.stats().open_shards <= 4);

        // evicted shards reopen from disk
        for hash in &hashes {
            let mut reader = fs.open_file_reader(hash, false).unwrap();
            let mut body = Vec::new();
            reader.read_to_end(&mut body).unwrap();
            assert_eq!(body, b"body");
        }
    }

    #[test]
    fn test_busy_shards_not_evicted() {
        let temp = TempDir::new().unwrap();
        let fs = Fs::open(temp.path(), opts()).unwrap();
        let held = put(&fs, "held", b"pinned");
        let reader = fs.open_file_reader(&held, false).unwrap();

        for i in 0..10 {
            put(&fs, &format!("filler-{i}"), b"f");
        }
        assert!(fs.stats().readers >= 1);
        drop(reader);
    }

    #[test]
    fn test_close_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let fs = Fs::open(temp.path(), opts()).unwrap();
        let hash = put(&fs, "bye", b"1");
        fs.close().unwrap();
        fs.close().unwrap();
        assert!(fs.exist_file(&hash).unwrap_err().is_closed());
        assert!(fs.open_file_writer(&hash, -1, false).unwrap_err().is_closed());
    }

    #[test]
    fn test_directory_lock() {
        let temp = TempDir::new().unwrap();
        let fs = Fs::open(temp.path(), opts()).unwrap();
        assert!(matches!(
            Fs::open(temp.path(), opts()),
            Err(BfsError::Locked { .. })
        ));
        fs.close().unwrap();
        Fs::open(temp.path(), opts()).unwrap();
    }

    #[test]
    fn test_remove_all() {
        let temp = TempDir::new().unwrap();
        let fs = Fs::open(temp.path(), opts()).unwrap();
        let hash = put(&fs, "gone", b"soon");
        fs.remove_all().unwrap();

        assert!(!fs.exist_file(&hash).unwrap());
        assert!(fs.shard_names().unwrap().is_empty());
        assert!(temp.path().join("fs.lock").exists());
        put(&fs, "again", b"ok");
    }

    #[test]
    fn test_compact_force() {
        let temp = TempDir::new().unwrap();
        let fs = Fs::open(temp.path(), opts()).unwrap();
        let hash = put(&fs, "churn", b"v1");
        for _ in 0..3 {
            put(&fs, "churn", b"v2");
        }
        fs.sync_all().unwrap();
        assert!(fs.stats().stale_records >= 3);

        assert_eq!(fs.compact(true).unwrap(), 1);
        assert_eq!(fs.stats().stale_records, 0);
        assert_eq!(fs.compact(true).unwrap(), 0);
        assert!(fs.exist_file(&hash).unwrap());
    }

    #[test]
    fn test_background_sync_publishes() {
        let temp = TempDir::new().unwrap();
        let fs = Fs::open(temp.path(), opts()).unwrap();
        let hash = put(&fs, "bg", b"later");
        assert!(!fs.exist_file(&hash).unwrap());

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !fs.exist_file(&hash).unwrap() {
            assert!(std::time::Instant::now() < deadline, "sync loop never ran");
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(fs.stats().unsynced_bytes, 0);
    }

    #[test]
    fn test_held_shard_blocks_only_itself() {
        let temp = TempDir::new().unwrap();
        let fs = Fs::open(temp.path(), opts()).unwrap();
        let same_shard = hash_in_shard("0000", 'b');
        let other_shard = hash_in_shard("ffff", 'a');
        let held = fs.inner.shard("00/00", true).unwrap().unwrap();

        let (locked_tx, locked_rx) = bounded::<()>(0);
        let (release_tx, release_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(1);

        thread::scope(|s| {
            s.spawn(|| {
                held.with_meta(|_| {
                    locked_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
            });
            locked_rx.recv().unwrap();

            s.spawn(|| {
                put_hash(&fs, &same_shard, b"queued");
                done_tx.send(()).unwrap();
            });

            put_hash(&fs, &other_shard, b"independent");
            fs.open_file_reader(&other_shard, false).unwrap();
            assert!(matches!(
                done_rx.recv_timeout(Duration::from_millis(200)),
                Err(RecvTimeoutError::Timeout)
            ));

            release_tx.send(()).unwrap();
            done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        });

        fs.sync_all().unwrap();
        assert!(fs.exist_file(&same_shard).unwrap());
        assert!(fs.exist_file(&other_shard).unwrap());
    }

    #[test]
    fn test_tick_syncs_at_most_max_sync_files() {
        let temp = TempDir::new().unwrap();
        let mut opts = FsOptions {
            max_sync_files: 1,
            sync_timeout_secs: 1,
            ..opts()
        };
        opts.ensure_defaults(temp.path());
        // no background thread: ticks are driven by hand
        let inner = FsInner {
            dir: temp.path().to_path_buf(),
            opts,
            shards: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            clock: AtomicU64::new(0),
        };

        for prefix in ["0000", "1111", "2222"] {
            let hash = hash_in_shard(prefix, 'c');
            let bfile = inner.shard(&shard_name(&hash), true).unwrap().unwrap();
            let mut writer = bfile.open_file_writer(&hash, -1, false).unwrap();
            writer.write_meta(200, 0, -1).unwrap();
            writer.write_body(b"pending").unwrap();
            writer.close().unwrap();
        }

        fn dirty(inner: &FsInner) -> usize {
            inner.open_shards().iter().filter(|b| b.needs_sync()).count()
        }
        assert_eq!(dirty(&inner), 3);
        inner.tick();
        assert_eq!(dirty(&inner), 3, "nothing is due before sync_timeout");

        thread::sleep(Duration::from_millis(1100));
        for expected in [2, 1, 0] {
            inner.tick();
            assert_eq!(dirty(&inner), expected);
        }
    }
}
