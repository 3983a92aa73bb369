use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::blocks_file::{read_exact_at, BlocksFile};
use crate::file_header::FileHeader;
use crate::limiter::read_permit;
use crate::{BfsError, Result};

/// Reads one object through a snapshot of its header.
///
/// Body offsets are origin offsets (positions in the cached response body).
/// The file handle goes back to the shard's pool on drop.
pub struct FileReader {
    bfile: Arc<BlocksFile>,
    hash: String,
    header: FileHeader,
    fp: Option<File>,
    pos: u64,
}

impl FileReader {
    pub(crate) fn new(bfile: Arc<BlocksFile>, hash: &str, header: FileHeader, fp: File) -> Self {
        Self {
            bfile,
            hash: hash.to_string(),
            header,
            fp: Some(fp),
            pos: 0,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn file_header(&self) -> &FileHeader {
        &self.header
    }

    pub fn body_size(&self) -> i64 {
        self.header.body_size
    }

    /// Replace the header snapshot and rewind.
    pub fn reset(&mut self, header: FileHeader) {
        self.header = header;
        self.pos = 0;
    }

    /// Read body bytes at `offset`, never crossing a block boundary.
    ///
    /// Returns `Ok(0)` at or past the end of the body, and
    /// [`BfsError::NoBlockAt`] inside a hole of a partial object.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() || offset >= self.header.max_offset() {
            return Ok(0);
        }
        let block = self
            .header
            .block_at(offset)
            .ok_or(BfsError::NoBlockAt { offset })?;

        let n = buf.len().min((block.origin_offset_to - offset) as usize);
        let physical = block.bfile_offset_from + (offset - block.origin_offset_from);
        let fp = self.fp.as_ref().ok_or(BfsError::Closed)?;

        let _permit = read_permit();
        read_exact_at(fp, &mut buf[..n], physical)?;
        Ok(n)
    }

    /// The stored response header, concatenated from its blocks.
    pub fn read_header(&self) -> Result<Vec<u8>> {
        let fp = self.fp.as_ref().ok_or(BfsError::Closed)?;
        let mut blocks = self.header.header_blocks.clone();
        blocks.sort_by_key(|b| b.origin_offset_from);

        let mut out = Vec::with_capacity(self.header.header_size.max(0) as usize);
        for block in blocks {
            let start = out.len();
            out.resize(start + block.len() as usize, 0);
            let _permit = read_permit();
            read_exact_at(fp, &mut out[start..], block.bfile_offset_from)?;
        }
        Ok(out)
    }

    /// Return the file handle to the pool.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(fp) = self.fp.take() {
            self.bfile.release_reader(fp);
        }
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(d) => self.header.max_offset().checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader")
            .field("hash", &self.hash)
            .field("pos", &self.pos)
            .field("body_size", &self.header.body_size)
            .finish()
    }
}
