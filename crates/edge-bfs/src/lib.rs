//! # edge-bfs
//!
//! Block-file storage engine for the edge node HTTP response cache.
//!
//! Objects (cached responses) are identified by a 32-char lowercase hex hash
//! and routed to a shard by the first four hex characters. Every shard is a
//! pair of append-only files: a Blocks File holding raw header/body bytes and
//! a Meta File logging where each object's bytes live.
//!
//! ## Directory Layout
//!
//! ```text
//! <fs-dir>/
//! ├── fs.lock        # process-exclusivity advisory lock
//! └── ab/
//!     ├── cd.b       # Blocks File: raw header/body bytes
//!     └── cd.m       # Meta File: [len][action][hash][gzip(json header)]*
//! ```
//!
//! ## Write path
//!
//! ```ignore
//! let fs = Fs::open(dir, FsOptions::default())?;
//! let mut writer = fs.open_file_writer(&hash, -1, false)?;
//! writer.write_meta(200, expires_at, -1)?;
//! writer.write_header(b"Content-Type: text/plain")?;
//! writer.write_body(b"hello")?;
//! writer.close()?;
//! ```
//!
//! A closed writer's object becomes durable (and visible to readers) once the
//! shard has been synced; the first reader of an unsynced object forces that
//! sync.

mod blocks_file;
mod file_header;
mod file_reader;
mod file_writer;
mod fs;
mod hash;
mod lazy_header;
pub mod limiter;
mod lock;
mod meta_block;
mod meta_file;
mod options;

pub use blocks_file::{BlockType, BlocksFile, BlocksFileStats};
pub use file_header::{BlockInfo, FileHeader};
pub use file_reader::FileReader;
pub use file_writer::FileWriter;
pub use fs::{Fs, FsStats};
pub use hash::{check_hash, check_hash_err, hash_of, shard_name, HASH_LEN};
pub use lazy_header::LazyFileHeader;
pub use lock::DirLock;
pub use meta_block::{decode_meta_block, encode_meta_block, MetaAction};
pub use meta_file::{MetaFile, ScanReport};
pub use options::{measure_disk_speed, DiskSpeed, FsOptions};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during block-file storage operations
#[derive(Error, Debug)]
pub enum BfsError {
    #[error("invalid hash: {0:?}")]
    InvalidHash(String),

    #[error("file not found: {hash}")]
    NotFound { hash: String },

    #[error("file is writing: {hash}")]
    FileIsWriting { hash: String },

    #[error("file closed")]
    Closed,

    #[error("unexpected body size: expected {expected}, got {actual}")]
    UnexpectedSize { expected: i64, actual: i64 },

    #[error("operation requires a partial writer")]
    PartialNotAllowed,

    #[error("partial objects need a known body size, got {0}")]
    InvalidBodySize(i64),

    #[error("no meta written before header/body")]
    MissingMeta,

    #[error("no block at offset {offset}")]
    NoBlockAt { offset: u64 },

    #[error("invalid meta block: {0}")]
    InvalidMetaBlock(String),

    #[error("corrupted meta file {path:?} at offset {offset}: {reason}")]
    Corrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("cache directory {path:?} is locked by another process")]
    Locked { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BfsError {
    /// Object is absent, or incomplete for a non-partial read.
    pub fn is_not_found(&self) -> bool {
        match self {
            BfsError::NotFound { .. } => true,
            BfsError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_writing(&self) -> bool {
        matches!(self, BfsError::FileIsWriting { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, BfsError::Closed)
    }
}

impl From<BfsError> for io::Error {
    fn from(e: BfsError) -> Self {
        match e {
            BfsError::Io(e) => e,
            e if e.is_not_found() => io::Error::new(io::ErrorKind::NotFound, e),
            e => io::Error::other(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, BfsError>;
