//! Content hash helpers.
//!
//! Object keys are 32-char lowercase hex strings (an MD5 digest of the cache
//! key). Every public entry point validates the hash before touching disk.

use crate::{BfsError, Result};

/// Length of a content hash in hex characters
pub const HASH_LEN: usize = 32;

/// Check that `hash` is exactly [`HASH_LEN`] lowercase hex characters.
#[inline]
pub fn check_hash(hash: &str) -> bool {
    hash.len() == HASH_LEN
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Like [`check_hash`], but returns [`BfsError::InvalidHash`] on failure.
#[inline]
pub fn check_hash_err(hash: &str) -> Result<()> {
    if check_hash(hash) {
        Ok(())
    } else {
        Err(BfsError::InvalidHash(hash.to_string()))
    }
}

/// Derive a content hash from arbitrary key bytes.
pub fn hash_of(data: impl AsRef<[u8]>) -> String {
    format!("{:x}", md5::compute(data.as_ref()))
}

/// Shard name for a (valid) hash: `hh/pp`, the two-level directory fan-out.
///
/// Callers must validate the hash first.
pub fn shard_name(hash: &str) -> String {
    format!("{}/{}", &hash[..2], &hash[2..4])
}
