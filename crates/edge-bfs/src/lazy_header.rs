//! Lazily decoded [`FileHeader`].
//!
//! Replaying a Meta File keeps each record's payload as raw (usually gzip)
//! bytes; decoding happens on first access. A node holding millions of
//! objects only pays deserialization for the ones it actually touches.

use std::io::Read;

use flate2::read::GzDecoder;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::file_header::{FileHeader, JSON_PREFIX};
use crate::Result;

pub struct LazyFileHeader {
    raw: Mutex<Option<Vec<u8>>>,
    header: OnceCell<FileHeader>,
}

impl LazyFileHeader {
    pub fn from_header(header: FileHeader) -> Self {
        Self {
            raw: Mutex::new(None),
            header: OnceCell::with_value(header),
        }
    }

    /// Wrap a raw Meta Block payload without decoding it.
    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self {
            raw: Mutex::new(Some(raw)),
            header: OnceCell::new(),
        }
    }

    /// Decode eagerly.
    pub fn decoded(raw: &[u8]) -> Result<Self> {
        Ok(Self::from_header(decode_payload(raw)?))
    }

    pub fn is_decoded(&self) -> bool {
        self.header.get().is_some()
    }

    /// Decoded header, decoding and dropping the raw bytes on first access.
    pub fn file_header(&self) -> Result<&FileHeader> {
        self.header.get_or_try_init(|| {
            let mut raw = self.raw.lock();
            let bytes = raw.as_deref().unwrap_or_default();
            let header = decode_payload(bytes)?;
            *raw = None;
            Ok(header)
        })
    }

    /// Mutable access; requires exclusive access to the owning Meta File.
    pub fn file_header_mut(&mut self) -> Result<&mut FileHeader> {
        self.file_header()?;
        // initialized by the call above
        Ok(self
            .header
            .get_mut()
            .expect("header decoded by file_header()"))
    }

    /// Undecoded entries were loaded from the log and are never "writing".
    pub fn is_writing(&self) -> bool {
        self.header.get().is_some_and(|header| header.is_writing)
    }

    /// Payload bytes to re-log this entry, reusing the raw form when possible.
    pub(crate) fn payload(&self) -> Result<Vec<u8>> {
        if let Some(raw) = self.raw.lock().as_ref() {
            return Ok(raw.clone());
        }
        self.file_header()?.encode_payload()
    }
}

impl std::fmt::Debug for LazyFileHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyFileHeader")
            .field("decoded", &self.is_decoded())
            .finish()
    }
}

/// Decode a `+` record payload: gzip, or `json:`-prefixed plain JSON.
///
/// An object reloaded from the log can never still be writing.
pub fn decode_payload(raw: &[u8]) -> Result<FileHeader> {
    let mut header: FileHeader = if let Some(json) = raw.strip_prefix(JSON_PREFIX) {
        serde_json::from_slice(json)?
    } else {
        let mut json = Vec::with_capacity(raw.len() * 4);
        GzDecoder::new(raw).read_to_end(&mut json)?;
        serde_json::from_slice(&json)?
    };
    header.is_writing = false;
    Ok(header)
}
