//! Meta Block framing
//!
//! ```text
//! [u32 BE: length of everything below][u8 action][32 bytes hash][payload]
//! ```
//!
//! The payload is empty for [`MetaAction::Remove`].

use crate::hash::HASH_LEN;
use crate::{BfsError, Result};

/// Size of the length prefix
pub const LEN_PREFIX: usize = 4;

/// Smallest valid body (action + hash)
pub const MIN_BODY_LEN: usize = 1 + HASH_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaAction {
    /// `+`: new or overwrite
    New,
    /// `-`: remove
    Remove,
}

impl MetaAction {
    pub fn as_byte(self) -> u8 {
        match self {
            MetaAction::New => b'+',
            MetaAction::Remove => b'-',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'+' => Some(MetaAction::New),
            b'-' => Some(MetaAction::Remove),
            _ => None,
        }
    }
}

/// Frame one record.
pub fn encode_meta_block(action: MetaAction, hash: &str, data: &[u8]) -> Result<Vec<u8>> {
    if hash.len() != HASH_LEN {
        return Err(BfsError::InvalidHash(hash.to_string()));
    }
    let data = match action {
        MetaAction::New => data,
        MetaAction::Remove => &[],
    };

    let body_len = MIN_BODY_LEN + data.len();
    let body_len_u32 = u32::try_from(body_len)
        .map_err(|_| BfsError::InvalidMetaBlock(format!("payload too large: {}", data.len())))?;

    let mut block = Vec::with_capacity(LEN_PREFIX + body_len);
    block.extend_from_slice(&body_len_u32.to_be_bytes());
    block.push(action.as_byte());
    block.extend_from_slice(hash.as_bytes());
    block.extend_from_slice(data);
    Ok(block)
}

/// Decode one framed record (length prefix included).
///
/// Trailing bytes beyond the declared length are ignored.
pub fn decode_meta_block(block: &[u8]) -> Result<(MetaAction, &str, &[u8])> {
    if block.len() < LEN_PREFIX {
        return Err(BfsError::InvalidMetaBlock("truncated length prefix".into()));
    }
    let body_len = read_len(block) as usize;
    let body = block
        .get(LEN_PREFIX..LEN_PREFIX + body_len)
        .ok_or_else(|| {
            BfsError::InvalidMetaBlock(format!(
                "truncated block: want {} bytes, have {}",
                body_len,
                block.len() - LEN_PREFIX
            ))
        })?;
    decode_meta_body(body)
}

/// Decode the part after the length prefix.
pub(crate) fn decode_meta_body(body: &[u8]) -> Result<(MetaAction, &str, &[u8])> {
    if body.len() < MIN_BODY_LEN {
        return Err(BfsError::InvalidMetaBlock(format!(
            "block too short: {} bytes",
            body.len()
        )));
    }
    let action = MetaAction::from_byte(body[0])
        .ok_or_else(|| BfsError::InvalidMetaBlock(format!("unknown action {:#04x}", body[0])))?;
    let hash = std::str::from_utf8(&body[1..MIN_BODY_LEN])
        .map_err(|_| BfsError::InvalidMetaBlock("hash is not ascii".into()))?;
    let data = match action {
        MetaAction::New => &body[MIN_BODY_LEN..],
        MetaAction::Remove => &[][..],
    };
    Ok((action, hash, data))
}

#[inline]
pub(crate) fn read_len(prefix: &[u8]) -> u32 {
    u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]])
}
