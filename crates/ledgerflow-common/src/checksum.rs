//! Content digests for idempotent persistence
//!
//! Sinks keep the digest of the last payload written under a natural key so a
//! replayed chunk can be recognised as a no-op.

use crate::error::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 (hex) over the JSON encoding of `value`
pub fn content_digest<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(digest_bytes(&bytes))
}

/// SHA-256 (hex) over raw bytes
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
