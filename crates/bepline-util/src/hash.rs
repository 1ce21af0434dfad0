//! SHA-256 helpers for content verification and cache naming.

use sha2::{Digest, Sha256};

use crate::error::UtilError;

/// Compute the SHA-256 hex digest of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Whether `s` looks like a SHA-256 hex digest (64 lowercase hex chars).
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Verify that `data` hashes to `expected`.
///
/// # Errors
/// Returns `UtilError::HashMismatch` naming `what` when the digests differ.
pub fn verify_sha256(what: &str, data: &[u8], expected: &str) -> Result<(), UtilError> {
    let actual = sha256_bytes(data);
    if actual != expected {
        return Err(UtilError::HashMismatch {
            what: what.to_owned(),
            expected: expected.to_owned(),
            actual,
        });
    }
    Ok(())
}

/// The first `len` hex chars of the SHA-256 of `data`.
pub fn short_hash(data: &[u8], len: usize) -> String {
    let mut full = sha256_bytes(data);
    full.truncate(len);
    full
}
