use std::io;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::blocks_file::{BlockType, BlocksFile};
use crate::{BfsError, Result};

/// Writes one object into its shard.
///
/// Call [`write_meta`](Self::write_meta) first, then any number of header
/// and body writes, then [`close`](Self::close). Dropping an unfinished
/// writer rolls the entry back to its last logged version; a writer dropped
/// before `write_meta` leaves the entry alone.
pub struct FileWriter {
    bfile: Arc<BlocksFile>,
    hash: String,
    /// Declared body size, `-1` when unknown
    body_size: i64,
    is_partial: bool,
    has_meta: bool,
    header_cleared: bool,
    expected_size: i64,
    real_header_size: i64,
    real_body_size: i64,
    body_offset: u64,
    finished: bool,
}

impl FileWriter {
    pub(crate) fn new(bfile: Arc<BlocksFile>, hash: &str, body_size: i64, is_partial: bool) -> Self {
        Self {
            bfile,
            hash: hash.to_string(),
            body_size,
            is_partial,
            // partial writers start on an existing or freshly installed header
            has_meta: is_partial,
            header_cleared: false,
            expected_size: -1,
            real_header_size: 0,
            real_body_size: 0,
            body_offset: 0,
            finished: false,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn is_partial(&self) -> bool {
        self.is_partial
    }

    pub fn body_size(&self) -> i64 {
        self.body_size
    }

    /// Body bytes written in this session.
    pub fn written_body_size(&self) -> i64 {
        self.real_body_size
    }

    /// Set status and expiry. For full writers this starts a fresh header,
    /// replacing any previous version of the object.
    pub fn write_meta(&mut self, status: i32, expires_at: i64, expected_file_size: i64) -> Result<()> {
        let hash = self.hash.as_str();
        if self.is_partial {
            self.bfile
                .with_meta(|meta| meta.update_meta(hash, status, expires_at))?;
        } else {
            let size = if self.body_size >= 0 {
                self.body_size
            } else {
                expected_file_size
            };
            self.bfile
                .with_meta(|meta| meta.write_meta(hash, status, expires_at, size))?;
            self.expected_size = expected_file_size;
            self.real_header_size = 0;
            self.real_body_size = 0;
            self.body_offset = 0;
        }
        self.has_meta = true;
        Ok(())
    }

    pub fn write_header(&mut self, data: &[u8]) -> Result<usize> {
        self.check_meta()?;
        if self.is_partial && !self.header_cleared {
            // a resumed object gets its header rewritten from scratch
            let hash = self.hash.as_str();
            self.bfile.with_meta(|meta| meta.clear_header_blocks(hash))?;
            self.header_cleared = true;
        }
        let n = self.bfile.write(
            &self.hash,
            BlockType::Header,
            data,
            self.real_header_size as u64,
        )?;
        self.real_header_size += n as i64;
        Ok(n)
    }

    /// Append body bytes at the current body offset.
    pub fn write_body(&mut self, data: &[u8]) -> Result<usize> {
        self.write_body_from(data, self.body_offset)
    }

    /// Write body bytes at an arbitrary offset. Partial writers only.
    pub fn write_body_at(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        if !self.is_partial {
            return Err(BfsError::PartialNotAllowed);
        }
        self.write_body_from(data, offset)
    }

    fn write_body_from(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        self.check_meta()?;
        let end = self.body_end(offset, data.len())?;
        let n = self.bfile.write(&self.hash, BlockType::Body, data, offset)?;
        self.body_offset = end;
        self.real_body_size += n as i64;
        Ok(n)
    }

    /// End offset of a body write, bounded by the declared size for partial
    /// writers.
    fn body_end(&self, offset: u64, len: usize) -> Result<u64> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if !self.is_partial || end <= self.body_size as u64 => Ok(end),
            _ => Err(BfsError::UnexpectedSize {
                expected: self.body_size,
                actual: end.and_then(|e| i64::try_from(e).ok()).unwrap_or(i64::MAX),
            }),
        }
    }

    /// Finalize the object. A size mismatch removes it and fails.
    pub fn close(mut self) -> Result<()> {
        self.finished = true;
        let result = self.finish();
        self.bfile.release_writer(&self.hash);
        result
    }

    /// Abandon the object and remove its entry.
    pub fn discard(mut self) -> Result<()> {
        self.finished = true;
        let hash = self.hash.as_str();
        let result = self.bfile.with_meta(|meta| meta.remove_file(hash));
        self.bfile.release_writer(&self.hash);
        result
    }

    fn finish(&self) -> Result<()> {
        if !self.has_meta {
            return Err(BfsError::MissingMeta);
        }

        let hash = self.hash.as_str();
        let (expected, body_size) = if self.is_partial {
            (self.body_size, self.body_size)
        } else {
            let expected = if self.body_size >= 0 {
                self.body_size
            } else {
                self.expected_size
            };
            (expected, self.real_body_size)
        };

        // partial writes are bounded as they happen
        if !self.is_partial && expected >= 0 && expected != self.real_body_size {
            self.bfile.with_meta(|meta| meta.remove_file(hash))?;
            return Err(BfsError::UnexpectedSize {
                expected,
                actual: self.real_body_size,
            });
        }

        let header_size = if self.is_partial && !self.header_cleared {
            // header untouched this session: keep what was stored
            self.bfile.with_meta(|meta| {
                Ok(meta.file_header(hash)?.map_or(0, |header| header.header_size))
            })?
        } else {
            self.real_header_size
        };
        self.bfile
            .with_meta(|meta| meta.write_close(hash, header_size, body_size))?;
        debug!(hash, header_size, body_size, partial = self.is_partial, "file writer closed");
        self.bfile.sync()
    }

    fn check_meta(&self) -> Result<()> {
        if self.has_meta {
            Ok(())
        } else {
            Err(BfsError::MissingMeta)
        }
    }
}

impl io::Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_body(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.has_meta {
            let hash = self.hash.as_str();
            let rolled_back = self.bfile.with_meta(|meta| meta.abandon_write(hash));
            if let Err(e) = rolled_back {
                warn!(hash, error = %e, "failed to roll back unfinished writer");
            }
        }
        self.bfile.release_writer(&self.hash);
    }
}

impl std::fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter")
            .field("hash", &self.hash)
            .field("body_size", &self.body_size)
            .field("is_partial", &self.is_partial)
            .field("written", &self.real_body_size)
            .finish()
    }
}
