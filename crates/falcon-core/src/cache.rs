//! Build cache - node hashes persisted across daemon runs
//!
//! One sled database under the daemon's state directory. The scanner
//! compares each node's current BLAKE3 hash with the one recorded here by
//! the previous run to decide what is out of date; the builder records
//! fresh hashes as sources are accepted and outputs are produced.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::hasher;

/// Persistent hash store, rooted in the daemon's state directory.
pub struct CacheManager {
    db: sled::Db,
}

impl CacheManager {
    /// Open (or create) the cache under `falcon_dir`.
    pub fn open(falcon_dir: impl AsRef<Path>) -> Result<Self> {
        let falcon_dir = falcon_dir.as_ref();
        fs::create_dir_all(falcon_dir)
            .with_context(|| format!("creating {}", falcon_dir.display()))?;

        let db = sled::open(falcon_dir.join("db")).context("opening cache database")?;

        Ok(Self { db })
    }

    /// Hash a file's current content.
    pub fn hash_file(&self, path: impl AsRef<Path>) -> Result<String> {
        hasher::hash_file(path)
    }

    /// Hash recorded for a node path by a previous scan or build.
    pub fn stored_hash(&self, path: &str) -> Option<String> {
        let value = self.db.get(path.as_bytes()).ok()??;
        String::from_utf8(value.to_vec()).ok()
    }

    /// Persist the observed hash for a node path.
    pub fn store_hash(&self, path: &str, hash: &str) -> Result<()> {
        self.db.insert(path.as_bytes(), hash.as_bytes())?;
        Ok(())
    }
}
