//! BLAKE3 content hashing of graph nodes.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};

/// Hash a file's content.
pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let content =
        fs::read(path).with_context(|| format!("hashing {}", path.display()))?;
    Ok(blake3::hash(&content).to_hex().to_string())
}

/// Hash an in-memory buffer. Used for rule signatures.
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Modification time as seconds since the epoch, if the file exists.
pub fn file_mtime(path: impl AsRef<Path>) -> Option<u64> {
    let meta = fs::metadata(path.as_ref()).ok()?;
    let mtime = meta.modified().ok()?;
    mtime.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}
