//! Blocks File (`.b`) and its paired Meta File.
//!
//! One lock guards the write cursor and the Meta File, so appending data and
//! recording its [`BlockInfo`] happen atomically with respect to every other
//! writer in the shard. Reads resolve offsets from a header snapshot and use
//! their own file handles, bounded only by the global read semaphore.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::queue::ArrayQueue;
use dashmap::DashSet;
use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::file_header::{BlockInfo, FileHeader};
use crate::file_reader::FileReader;
use crate::file_writer::FileWriter;
use crate::hash::check_hash_err;
use crate::limiter::write_permit;
use crate::meta_file::MetaFile;
use crate::{BfsError, Result};

/// Idle read handles kept per Blocks File
const READER_POOL_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Header,
    Body,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlocksFileStats {
    pub objects: usize,
    pub data_bytes: u64,
    pub meta_bytes: u64,
    pub stale_records: u64,
    pub unsynced_bytes: u64,
    pub writers: usize,
    pub readers: usize,
}

struct BlocksState {
    meta: MetaFile,
    write_pos: u64,
    unsynced_bytes: u64,
    sync_at: Instant,
}

pub struct BlocksFile {
    path: PathBuf,
    fp: File,
    state: RwLock<BlocksState>,
    bytes_per_sync: u64,
    closed: AtomicBool,
    /// Hashes with an open writer
    writing: DashSet<String>,
    readers: AtomicUsize,
    reader_pool: ArrayQueue<File>,
    last_access: AtomicU64,
}

impl BlocksFile {
    /// Open `<name>.b` and replay the paired `<name>.m`.
    pub fn open<P: AsRef<Path>>(path: P, bytes_per_sync: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let fp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let write_pos = fp.metadata()?.len();
        let meta = MetaFile::open(path.with_extension("m"))?;

        debug!(path = %path.display(), write_pos, objects = meta.len(), "blocks file opened");

        Ok(Self {
            path,
            fp,
            state: RwLock::new(BlocksState {
                meta,
                write_pos,
                unsynced_bytes: 0,
                sync_at: Instant::now(),
            }),
            bytes_per_sync,
            closed: AtomicBool::new(false),
            writing: DashSet::new(),
            readers: AtomicUsize::new(0),
            reader_pool: ArrayQueue::new(READER_POOL_SIZE),
            last_access: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta_path(&self) -> PathBuf {
        self.path.with_extension("m")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Append `data` and record it under `hash`. Returns bytes written.
    ///
    /// Data reaches the page cache only; see [`sync`](Self::sync).
    pub fn write(
        &self,
        hash: &str,
        block_type: BlockType,
        data: &[u8],
        origin_offset: u64,
    ) -> Result<usize> {
        let mut state = self.lock_state()?;
        let pos = state.write_pos;
        {
            let _permit = write_permit();
            write_all_at(&self.fp, data, pos)?;
        }

        let len = data.len() as u64;
        state.write_pos += len;
        state.unsynced_bytes += len;

        let block = BlockInfo::new(origin_offset, pos, len);
        match block_type {
            BlockType::Header => state.meta.write_header_block(hash, block)?,
            BlockType::Body => state.meta.write_body_block(hash, block)?,
        }
        Ok(data.len())
    }

    /// Start writing an object. Only one writer per hash may be open.
    pub fn open_file_writer(
        self: &Arc<Self>,
        hash: &str,
        body_size: i64,
        is_partial: bool,
    ) -> Result<FileWriter> {
        check_hash_err(hash)?;
        if is_partial && body_size < 0 {
            return Err(BfsError::InvalidBodySize(body_size));
        }
        {
            // registered under the lock so an idle-close cannot race us
            let _state = self.read_state()?;
            if !self.writing.insert(hash.to_string()) {
                return Err(BfsError::FileIsWriting {
                    hash: hash.to_string(),
                });
            }
        }

        let prepared = if is_partial {
            self.with_meta(|meta| {
                if !meta.reopen_partial(hash, body_size)? {
                    meta.write_meta(hash, 200, 0, body_size)?;
                }
                Ok(())
            })
        } else {
            Ok(())
        };
        if let Err(e) = prepared {
            self.release_writer(hash);
            return Err(e);
        }

        Ok(FileWriter::new(self.clone(), hash, body_size, is_partial))
    }

    /// Open a reader over a snapshot of the object's header.
    ///
    /// An object that was write-closed but not yet synced is synced first, so
    /// readers only ever see durable objects.
    pub fn open_file_reader(self: &Arc<Self>, hash: &str, is_partial: bool) -> Result<FileReader> {
        check_hash_err(hash)?;

        let snapshot = {
            let state = self.read_state()?;
            let header = state.meta.file_header(hash).unwrap_or_else(|e| {
                warn!(hash, error = %e, "undecodable header treated as absent");
                None
            });
            match header {
                None => return Err(not_found(hash)),
                Some(header) if header.is_writing && state.meta.is_pending_sync(hash) => None,
                Some(header) => Some(header.clone()),
            }
        };
        let header = match snapshot {
            Some(header) => header,
            None => {
                let mut state = self.lock_state()?;
                self.sync_locked(&mut state, true)?;
                state
                    .meta
                    .clone_file_header(hash)?
                    .ok_or_else(|| not_found(hash))?
            }
        };

        if header.is_writing && !is_partial {
            return Err(BfsError::FileIsWriting {
                hash: hash.to_string(),
            });
        }
        if !is_partial && !header.is_completed {
            return Err(not_found(hash));
        }

        {
            let _state = self.read_state()?;
            self.readers.fetch_add(1, Ordering::AcqRel);
        }
        let fp = match self.reader_pool.pop() {
            Some(fp) => fp,
            None => match File::open(&self.path) {
                Ok(fp) => fp,
                Err(e) => {
                    self.readers.fetch_sub(1, Ordering::AcqRel);
                    return Err(e.into());
                }
            },
        };
        Ok(FileReader::new(self.clone(), hash, header, fp))
    }

    /// Rebind `reader` to the current header of its hash.
    pub fn refresh_reader(&self, reader: &mut FileReader) -> Result<()> {
        let header = self
            .clone_file_header(reader.hash())?
            .ok_or_else(|| not_found(reader.hash()))?;
        reader.reset(header);
        Ok(())
    }

    pub fn exist_file(&self, hash: &str) -> Result<bool> {
        check_hash_err(hash)?;
        Ok(self.read_state()?.meta.exist_file(hash))
    }

    pub fn remove_file(&self, hash: &str) -> Result<()> {
        check_hash_err(hash)?;
        self.lock_state()?.meta.remove_file(hash)
    }

    pub fn clone_file_header(&self, hash: &str) -> Result<Option<FileHeader>> {
        check_hash_err(hash)?;
        self.read_state()?.meta.clone_file_header(hash)
    }

    /// Soft sync: only once `bytes_per_sync` unsynced bytes accumulated.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        self.sync_locked(&mut state, false)
    }

    /// fsync data and Meta File unconditionally.
    pub fn force_sync(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        self.sync_locked(&mut state, true)
    }

    fn sync_locked(&self, state: &mut BlocksState, force: bool) -> Result<()> {
        if !force && state.unsynced_bytes < self.bytes_per_sync {
            return Ok(());
        }
        if state.unsynced_bytes > 0 {
            let _permit = write_permit();
            self.fp.sync_data()?;
        }
        state.unsynced_bytes = 0;
        state.sync_at = Instant::now();
        // data first, then the records pointing at it
        state.meta.sync()
    }

    /// Time of the last data sync.
    pub fn sync_at(&self) -> Instant {
        self.state.read().sync_at
    }

    /// Unsynced data or Meta File records pending.
    pub fn needs_sync(&self) -> bool {
        let state = self.state.read();
        state.unsynced_bytes > 0 || state.meta.is_modified()
    }

    pub fn needs_compact(&self, min_stale: u64, stale_ratio: f64) -> bool {
        let state = self.state.read();
        !self.is_closed() && state.meta.needs_compact(min_stale, stale_ratio)
    }

    /// Rewrite the Meta File without stale records.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        self.sync_locked(&mut state, true)?;
        state.meta.compact()
    }

    /// Force-sync and close. Every later operation fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.sync_locked(&mut state, true);
        while self.reader_pool.pop().is_some() {}
        debug!(path = %self.path.display(), "blocks file closed");
        result
    }

    /// Close only if no writer or reader is registered. Returns whether the
    /// file was closed by this call.
    pub fn close_if_idle(&self) -> Result<bool> {
        let mut state = self.state.write();
        if self.is_closed() || !self.can_close() {
            return Ok(false);
        }
        self.closed.store(true, Ordering::Release);
        while self.reader_pool.pop().is_some() {}
        self.sync_locked(&mut state, true)?;
        Ok(true)
    }

    /// Delete both files from disk and close.
    pub fn remove_all(&self) -> Result<()> {
        let mut state = self.state.write();
        self.closed.store(true, Ordering::Release);
        while self.reader_pool.pop().is_some() {}
        state.meta.remove_all()?;
        state.write_pos = 0;
        state.unsynced_bytes = 0;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// No open writers or readers.
    pub fn can_close(&self) -> bool {
        self.writing.is_empty() && self.readers.load(Ordering::Acquire) == 0
    }

    pub fn stats(&self) -> BlocksFileStats {
        let state = self.state.read();
        BlocksFileStats {
            objects: state.meta.len(),
            data_bytes: state.write_pos,
            meta_bytes: state.meta.file_len(),
            stale_records: state.meta.stale_records(),
            unsynced_bytes: state.unsynced_bytes,
            writers: self.writing.len(),
            readers: self.readers.load(Ordering::Acquire),
        }
    }

    /// Run `f` with exclusive access to the Meta File.
    pub(crate) fn with_meta<R>(&self, f: impl FnOnce(&mut MetaFile) -> Result<R>) -> Result<R> {
        let mut state = self.lock_state()?;
        f(&mut state.meta)
    }

    pub(crate) fn release_writer(&self, hash: &str) {
        self.writing.remove(hash);
    }

    pub(crate) fn release_reader(&self, fp: File) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
        if !self.is_closed() {
            // pool full: the handle is simply closed
            let _ = self.reader_pool.push(fp);
        }
    }

    pub(crate) fn touch(&self, stamp: u64) {
        self.last_access.store(stamp, Ordering::Relaxed);
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    fn lock_state(&self) -> Result<RwLockWriteGuard<'_, BlocksState>> {
        let state = self.state.write();
        if self.is_closed() {
            return Err(BfsError::Closed);
        }
        Ok(state)
    }

    fn read_state(&self) -> Result<parking_lot::RwLockReadGuard<'_, BlocksState>> {
        let state = self.state.read();
        if self.is_closed() {
            return Err(BfsError::Closed);
        }
        Ok(state)
    }
}

impl std::fmt::Debug for BlocksFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlocksFile")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn not_found(hash: &str) -> BfsError {
    BfsError::NotFound {
        hash: hash.to_string(),
    }
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}
