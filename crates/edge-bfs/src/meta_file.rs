//! Meta File (`.m`): append-only log of Meta Blocks plus the in-memory
//! `hash -> header` index it reconstructs.
//!
//! Replaying every block in order, applying `+` (insert/overwrite) and `-`
//! (remove), yields the index exactly. A [`MetaFile`] lives inside its
//! [`BlocksFile`](crate::BlocksFile)'s lock; the mutating methods take
//! `&mut self`, so holding the write guard is enforced by the borrow checker.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::file_header::{BlockInfo, FileHeader};
use crate::hash::check_hash;
use crate::lazy_header::LazyFileHeader;
use crate::meta_block::{decode_meta_body, encode_meta_block, read_len, MetaAction, LEN_PREFIX, MIN_BODY_LEN};
use crate::{BfsError, Result};

/// Upper bound on a single record; anything larger is treated as corruption.
const MAX_BLOCK_LEN: usize = 64 << 20;

/// Result of walking a Meta File.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Well-formed records
    pub records: u64,
    /// Byte length covered by well-formed records
    pub good_len: u64,
    /// Actual file length
    pub file_len: u64,
    /// First framing error, if any
    pub error: Option<String>,
}

impl ScanReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
struct LoggedVersion {
    payload: Vec<u8>,
    /// Appended but not yet synced
    pending: bool,
}

#[derive(Debug)]
pub struct MetaFile {
    path: PathBuf,
    fp: File,
    header_map: HashMap<String, LazyFileHeader>,
    /// Write-closed since the last sync; their `is_writing` clears on sync.
    modified_hashes: HashSet<String>,
    /// Last logged version of entries that are being rewritten
    durable: HashMap<String, LoggedVersion>,
    is_modified: bool,
    records: u64,
    file_len: u64,
}

impl MetaFile {
    /// Open or create a Meta File and replay it, keeping payloads undecoded.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path.as_ref(), false)
    }

    /// Like [`open`](Self::open) but decodes every header during replay.
    pub fn open_eager<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path.as_ref(), true)
    }

    fn open_with(path: &Path, eager: bool) -> Result<Self> {
        let fp = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut header_map = HashMap::new();
        let report = scan_reader(BufReader::new(&fp), |action, hash, data| {
            match action {
                MetaAction::New => {
                    let lazy = if eager {
                        LazyFileHeader::decoded(data)?
                    } else {
                        LazyFileHeader::from_raw(data.to_vec())
                    };
                    header_map.insert(hash.to_string(), lazy);
                }
                MetaAction::Remove => {
                    header_map.remove(hash);
                }
            }
            Ok(())
        })?;

        if let Some(reason) = report.error {
            return Err(BfsError::Corrupted {
                path: path.to_path_buf(),
                offset: report.good_len,
                reason,
            });
        }

        debug!(
            path = %path.display(),
            records = report.records,
            objects = header_map.len(),
            "meta file loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            fp,
            header_map,
            modified_hashes: HashSet::new(),
            durable: HashMap::new(),
            is_modified: false,
            records: report.records,
            file_len: report.file_len,
        })
    }

    /// Walk a Meta File without building an index.
    pub fn verify<P: AsRef<Path>>(path: P) -> Result<ScanReport> {
        let fp = File::open(path)?;
        scan_reader(BufReader::new(fp), |_, _, _| Ok(()))
    }

    /// Truncate a corrupted Meta File at its last well-formed record.
    ///
    /// The caller must own the cache directory lock.
    pub fn repair<P: AsRef<Path>>(path: P) -> Result<ScanReport> {
        let path = path.as_ref();
        let report = Self::verify(path)?;
        if !report.is_ok() {
            let fp = OpenOptions::new().write(true).open(path)?;
            fp.set_len(report.good_len)?;
            fp.sync_all()?;
            warn!(
                path = %path.display(),
                dropped = report.file_len - report.good_len,
                "meta file truncated at last good record"
            );
        }
        Ok(report)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Install a fresh in-memory header marked as writing.
    ///
    /// Nothing is logged until [`write_close`](Self::write_close).
    pub fn write_meta(
        &mut self,
        hash: &str,
        status: i32,
        expires_at: i64,
        expected_file_size: i64,
    ) -> Result<()> {
        self.snapshot_durable(hash)?;
        self.modified_hashes.remove(hash);
        self.header_map.insert(
            hash.to_string(),
            LazyFileHeader::from_header(FileHeader::new_writing(
                status,
                expires_at,
                expected_file_size,
            )),
        );
        Ok(())
    }

    /// Change status/expiry of an existing entry, keeping its blocks.
    pub fn update_meta(&mut self, hash: &str, status: i32, expires_at: i64) -> Result<()> {
        let header = self.header_mut(hash)?;
        header.status = status;
        header.expires_at = expires_at;
        Ok(())
    }

    /// Resume writing a partial object with the same declared body size.
    ///
    /// Returns `false` when there is nothing to resume.
    pub fn reopen_partial(&mut self, hash: &str, body_size: i64) -> Result<bool> {
        let Some(lazy) = self.header_map.get(hash) else {
            return Ok(false);
        };
        let header = lazy.file_header()?;
        if header.is_writing || header.body_size != body_size {
            return Ok(false);
        }
        self.snapshot_durable(hash)?;
        self.header_mut(hash)?.is_writing = true;
        Ok(true)
    }

    /// Roll back an unfinished write: restore the last logged version, or
    /// forget an entry that never reached the log. Appends nothing.
    ///
    /// A restored version that is not synced yet stays hidden until the next
    /// [`sync`](Self::sync).
    pub fn abandon_write(&mut self, hash: &str) -> Result<()> {
        self.modified_hashes.remove(hash);
        let Some(logged) = self.durable.remove(hash) else {
            self.header_map.remove(hash);
            return Ok(());
        };
        let mut lazy = LazyFileHeader::from_raw(logged.payload);
        if logged.pending {
            lazy.file_header_mut()?.is_writing = true;
            self.modified_hashes.insert(hash.to_string());
        }
        self.header_map.insert(hash.to_string(), lazy);
        Ok(())
    }

    /// Remember the logged payload of `hash` before it is rewritten in memory.
    ///
    /// An entry already in an unlogged session keeps its earlier snapshot.
    fn snapshot_durable(&mut self, hash: &str) -> Result<()> {
        let Some(lazy) = self.header_map.get(hash) else {
            return Ok(());
        };
        if lazy.is_writing() && !self.modified_hashes.contains(hash) {
            return Ok(());
        }
        let logged = LoggedVersion {
            payload: lazy.payload()?,
            pending: self.modified_hashes.contains(hash),
        };
        self.durable.insert(hash.to_string(), logged);
        Ok(())
    }

    pub fn write_header_block(&mut self, hash: &str, block: BlockInfo) -> Result<()> {
        self.header_mut(hash)?.add_header_block(block);
        Ok(())
    }

    pub fn write_body_block(&mut self, hash: &str, block: BlockInfo) -> Result<()> {
        self.header_mut(hash)?.add_body_block(block);
        Ok(())
    }

    pub fn clear_header_blocks(&mut self, hash: &str) -> Result<()> {
        let header = self.header_mut(hash)?;
        header.header_blocks.clear();
        header.header_size = 0;
        Ok(())
    }

    /// Finalize an object and append its `+` record.
    ///
    /// The record is in the page cache only; `is_writing` clears on
    /// [`sync`](Self::sync).
    pub fn write_close(&mut self, hash: &str, header_size: i64, body_size: i64) -> Result<()> {
        let block = {
            let header = self.header_mut(hash)?;
            header.modified_at = unix_now();
            header.header_size = header_size;
            header.body_size = body_size;
            header.compact();
            header.encode(hash)?
        };

        self.append(&block)?;
        self.durable.remove(hash);
        self.modified_hashes.insert(hash.to_string());
        Ok(())
    }

    /// Drop an entry and log a `-` record. No-op for unknown hashes.
    pub fn remove_file(&mut self, hash: &str) -> Result<()> {
        if self.header_map.remove(hash).is_none() {
            return Ok(());
        }
        self.durable.remove(hash);
        self.modified_hashes.remove(hash);
        let block = encode_meta_block(MetaAction::Remove, hash, &[])?;
        self.append(&block)
    }

    pub fn file_header(&self, hash: &str) -> Result<Option<&FileHeader>> {
        self.header_map
            .get(hash)
            .map(LazyFileHeader::file_header)
            .transpose()
    }

    /// Snapshot of a header, safe to read while writers keep appending.
    pub fn clone_file_header(&self, hash: &str) -> Result<Option<FileHeader>> {
        Ok(self.file_header(hash)?.cloned())
    }

    /// Present, decodable and not being written.
    pub fn exist_file(&self, hash: &str) -> bool {
        let Some(lazy) = self.header_map.get(hash) else {
            return false;
        };
        match lazy.file_header() {
            Ok(header) => !header.is_writing,
            Err(e) => {
                warn!(hash = %hash, error = %e, "undecodable header treated as absent");
                false
            }
        }
    }

    /// Write-closed but not yet synced.
    pub fn is_pending_sync(&self, hash: &str) -> bool {
        self.modified_hashes.contains(hash)
    }

    pub fn is_modified(&self) -> bool {
        self.is_modified
    }

    /// fsync the log if modified, then publish write-closed objects.
    pub fn sync(&mut self) -> Result<()> {
        if !self.is_modified {
            return Ok(());
        }
        self.fp.sync_data()?;
        self.mark_synced();
        Ok(())
    }

    fn mark_synced(&mut self) {
        for hash in self.modified_hashes.drain() {
            if let Some(lazy) = self.header_map.get_mut(&hash) {
                match lazy.file_header_mut() {
                    Ok(header) => header.is_writing = false,
                    Err(e) => warn!(hash = %hash, error = %e, "failed to decode header on sync"),
                }
            }
        }
        for logged in self.durable.values_mut() {
            logged.pending = false;
        }
        self.is_modified = false;
    }

    /// Records no longer reflected in the index (superseded or removed).
    ///
    /// Entries in an unlogged write session own no record and are not
    /// counted against the total.
    pub fn stale_records(&self) -> u64 {
        let unlogged = self
            .header_map
            .iter()
            .filter(|(hash, _)| !self.has_live_record(hash))
            .count();
        let live = (self.header_map.len() - unlogged) as u64;
        self.records.saturating_sub(live)
    }

    /// The latest record for `hash` in the log describes its current or
    /// last durable version.
    fn has_live_record(&self, hash: &str) -> bool {
        self.header_map.get(hash).is_some_and(|lazy| {
            !lazy.is_writing()
                || self.modified_hashes.contains(hash)
                || self.durable.contains_key(hash)
        })
    }

    pub fn needs_compact(&self, min_stale: u64, stale_ratio: f64) -> bool {
        let stale = self.stale_records();
        self.records > 0 && stale >= min_stale && stale as f64 / self.records as f64 >= stale_ratio
    }

    /// Rewrite the log from the current index.
    ///
    /// Entries still being written keep their last logged version, if any;
    /// write-closed ones become durable, as after [`sync`](Self::sync). The
    /// data file must already be synced.
    pub fn compact(&mut self) -> Result<()> {
        let tmp_path = self.path.with_extension("m.compact");
        let mut records = 0u64;
        {
            let tmp = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            for (hash, lazy) in &self.header_map {
                let payload = if lazy.is_writing() && !self.modified_hashes.contains(hash) {
                    match self.durable.get(hash) {
                        Some(logged) => logged.payload.clone(),
                        None => continue,
                    }
                } else {
                    lazy.payload()?
                };
                let block = encode_meta_block(MetaAction::New, hash, &payload)?;
                writer.write_all(&block)?;
                records += 1;
            }
            let tmp = writer.into_inner().map_err(|e| e.into_error())?;
            tmp.sync_all()?;
        }

        let before = self.file_len;
        fs::rename(&tmp_path, &self.path)?;
        self.fp = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.file_len = self.fp.metadata()?.len();
        self.records = records;
        self.is_modified = true;
        self.mark_synced();

        debug!(
            path = %self.path.display(),
            before,
            after = self.file_len,
            records,
            "meta file compacted"
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.header_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.header_map.is_empty()
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        self.header_map.keys().map(String::as_str)
    }

    /// Delete the file from disk and forget every entry.
    pub fn remove_all(&mut self) -> Result<()> {
        self.header_map.clear();
        self.modified_hashes.clear();
        self.durable.clear();
        self.is_modified = false;
        self.records = 0;
        self.file_len = 0;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn header_mut(&mut self, hash: &str) -> Result<&mut FileHeader> {
        self.header_map
            .get_mut(hash)
            .ok_or_else(|| BfsError::NotFound {
                hash: hash.to_string(),
            })?
            .file_header_mut()
    }

    fn append(&mut self, block: &[u8]) -> Result<()> {
        if let Err(e) = self.fp.write_all(block) {
            // never leave a torn record behind
            if let Err(trunc) = self.fp.set_len(self.file_len) {
                warn!(path = %self.path.display(), error = %trunc, "failed to truncate torn record");
            }
            return Err(e.into());
        }
        self.file_len += block.len() as u64;
        self.records += 1;
        self.is_modified = true;
        Ok(())
    }
}

/// Walk framed records, stopping at the first framing error.
///
/// Errors returned by `visit` abort the walk; framing errors are reported in
/// the [`ScanReport`].
fn scan_reader<R, F>(mut reader: R, mut visit: F) -> Result<ScanReport>
where
    R: Read,
    F: FnMut(MetaAction, &str, &[u8]) -> Result<()>,
{
    let mut report = ScanReport::default();
    let mut prefix = [0u8; LEN_PREFIX];
    let mut body = Vec::new();

    loop {
        let n = read_full(&mut reader, &mut prefix)?;
        if n == 0 {
            break;
        }
        report.file_len += n as u64;
        if n < LEN_PREFIX {
            report.error.get_or_insert_with(|| "truncated length prefix".to_string());
            break;
        }

        let body_len = read_len(&prefix) as usize;
        if !(MIN_BODY_LEN..=MAX_BLOCK_LEN).contains(&body_len) {
            report.error = Some(format!("invalid block length {}", body_len));
            report.file_len += io::copy(&mut reader, &mut io::sink())?;
            break;
        }

        body.resize(body_len, 0);
        let n = read_full(&mut reader, &mut body)?;
        report.file_len += n as u64;
        if n < body_len {
            report.error = Some(format!("truncated block: want {} bytes, have {}", body_len, n));
            break;
        }

        let decoded = decode_meta_body(&body).and_then(|(action, hash, data)| {
            if check_hash(hash) {
                Ok((action, hash, data))
            } else {
                Err(BfsError::InvalidHash(hash.to_string()))
            }
        });
        match decoded {
            Ok((action, hash, data)) => visit(action, hash, data)?,
            Err(e) => {
                report.error = Some(e.to_string());
                report.file_len += io::copy(&mut reader, &mut io::sink())?;
                break;
            }
        }

        report.records += 1;
        report.good_len = report.file_len;
    }

    Ok(report)
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
