//! Per-object metadata: status, timestamps and the byte ranges that make up
//! the object's header and body inside the Blocks File.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::meta_block::{encode_meta_block, MetaAction};
use crate::Result;

/// Current [`FileHeader`] format version
pub const FILE_HEADER_VERSION: i32 = 1;

/// Prefix marking an uncompressed JSON payload in the Meta File
pub const JSON_PREFIX: &[u8] = b"json:";

/// A contiguous range of an object's stream, mapped to its physical location.
///
/// Both ranges are half-open: `[from, to)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    #[serde(rename = "1")]
    pub origin_offset_from: u64,
    #[serde(rename = "2")]
    pub origin_offset_to: u64,
    #[serde(rename = "3")]
    pub bfile_offset_from: u64,
    #[serde(rename = "4")]
    pub bfile_offset_to: u64,
}

impl BlockInfo {
    pub fn new(origin_offset: u64, bfile_offset: u64, len: u64) -> Self {
        Self {
            origin_offset_from: origin_offset,
            origin_offset_to: origin_offset + len,
            bfile_offset_from: bfile_offset,
            bfile_offset_to: bfile_offset + len,
        }
    }

    #[inline]
    pub fn contains(&self, offset: u64) -> bool {
        self.origin_offset_from <= offset && offset < self.origin_offset_to
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.origin_offset_to - self.origin_offset_from
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `next` continues this block both logically and physically.
    #[inline]
    fn is_followed_by(&self, next: &BlockInfo) -> bool {
        self.origin_offset_to == next.origin_offset_from
            && self.bfile_offset_to == next.bfile_offset_from
    }
}

/// Metadata of one cached object.
///
/// Serialized with numeric keys to keep the Meta File small.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileHeader {
    #[serde(rename = "1")]
    pub version: i32,
    #[serde(rename = "2")]
    pub modified_at: i64,
    #[serde(rename = "3")]
    pub expires_at: i64,
    #[serde(rename = "4")]
    pub status: i32,
    #[serde(rename = "5")]
    pub header_size: i64,
    /// Declared body size, `-1` while unknown
    #[serde(rename = "6")]
    pub body_size: i64,
    #[serde(rename = "7")]
    pub expired_body_size: i64,
    #[serde(rename = "8")]
    pub header_blocks: Vec<BlockInfo>,
    #[serde(rename = "9")]
    pub body_blocks: Vec<BlockInfo>,
    #[serde(rename = "10")]
    pub is_completed: bool,
    #[serde(rename = "11")]
    pub is_writing: bool,
}

impl FileHeader {
    /// Fresh header for an object about to be written.
    pub fn new_writing(status: i32, expires_at: i64, body_size: i64) -> Self {
        Self {
            version: FILE_HEADER_VERSION,
            status,
            expires_at,
            body_size,
            expired_body_size: body_size,
            is_writing: true,
            ..Default::default()
        }
    }

    /// Append a header block, extending the last one when contiguous.
    pub fn add_header_block(&mut self, block: BlockInfo) {
        push_block(&mut self.header_blocks, block);
    }

    /// Append a body block, extending the last one when contiguous.
    pub fn add_body_block(&mut self, block: BlockInfo) {
        push_block(&mut self.body_blocks, block);
    }

    /// Sort body blocks and recompute `is_completed`.
    ///
    /// Completed means the sorted blocks start at 0, the last one ends at
    /// `body_size`, and no adjacent pair leaves a gap. Overlaps are tolerated.
    pub fn compact(&mut self) {
        if self.body_blocks.is_empty() {
            self.is_completed = self.body_size == 0;
            return;
        }

        self.body_blocks.sort_by(|a, b| {
            a.origin_offset_from
                .cmp(&b.origin_offset_from)
                .then(a.origin_offset_to.cmp(&b.origin_offset_to))
        });

        let first = &self.body_blocks[0];
        let last = &self.body_blocks[self.body_blocks.len() - 1];
        if first.origin_offset_from != 0 || last.origin_offset_to as i64 != self.body_size {
            self.is_completed = false;
            return;
        }

        self.is_completed = self
            .body_blocks
            .windows(2)
            .all(|pair| pair[1].origin_offset_from <= pair[0].origin_offset_to);
    }

    /// Body block whose origin range contains `offset`.
    pub fn block_at(&self, offset: u64) -> Option<&BlockInfo> {
        match self.body_blocks.len() {
            0 => None,
            1 => {
                let block = &self.body_blocks[0];
                block.contains(offset).then_some(block)
            }
            _ => {
                let idx = self
                    .body_blocks
                    .partition_point(|b| b.origin_offset_to <= offset);
                match self.body_blocks.get(idx) {
                    Some(block) if block.contains(offset) => Some(block),
                    // unsorted or overlapping (writer still appending)
                    _ => self.body_blocks.iter().find(|b| b.contains(offset)),
                }
            }
        }
    }

    /// One past the last readable body offset.
    pub fn max_offset(&self) -> u64 {
        self.body_blocks
            .iter()
            .map(|b| b.origin_offset_to)
            .max()
            .unwrap_or(0)
    }

    /// Total body bytes recorded so far (overlaps counted twice).
    pub fn written_body_bytes(&self) -> u64 {
        self.body_blocks.iter().map(BlockInfo::len).sum()
    }

    /// Gzip-compressed JSON, the Meta File payload.
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2 + 16), Compression::fast());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    /// Uncompressed `json:`-prefixed payload.
    pub fn encode_payload_plain(&self) -> Result<Vec<u8>> {
        let mut payload = JSON_PREFIX.to_vec();
        serde_json::to_writer(&mut payload, self)?;
        Ok(payload)
    }

    /// Framed `+` Meta Block for this header.
    pub fn encode(&self, hash: &str) -> Result<Vec<u8>> {
        encode_meta_block(MetaAction::New, hash, &self.encode_payload()?)
    }
}

fn push_block(blocks: &mut Vec<BlockInfo>, block: BlockInfo) {
    if block.is_empty() {
        return;
    }
    if let Some(last) = blocks.last_mut() {
        if last.is_followed_by(&block) {
            last.origin_offset_to = block.origin_offset_to;
            last.bfile_offset_to = block.bfile_offset_to;
            return;
        }
    }
    blocks.push(block);
}
