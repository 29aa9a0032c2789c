//! Digest utilities for output verification and content-derived identifiers

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;

/// Streaming SHA-256 of any readable source, hex encoded
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    hash_reader::<Sha256, _>(reader)
}

fn hash_reader<D: Digest, R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = D::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory value, hex encoded
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Leading `len` hex characters of the SHA-256 digest of `data`
///
/// `len` is clamped to the full 64-character digest.
pub fn short_sha256_hex(data: impl AsRef<[u8]>, len: usize) -> String {
    let mut digest = sha256_hex(data);
    digest.truncate(len.min(digest.len()));
    digest
}
