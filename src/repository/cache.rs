// src/repository/cache.rs

//! Catalog cache store
//!
//! Layout under the cache root:
//! - `repos/<fingerprint>.json.zst`: one parsed catalog per repository
//!   identity and tracked variant set
//! - `sources/<sha256>/`: unpacked extra source tarballs

use super::index::RepositoryIndex;
use super::{RepositoryReference, SourceVariant};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Catalogs older than this are refetched
pub const CATALOG_TTL: Duration = Duration::from_secs(60 * 60);

/// zstd compression level for cached catalogs
const COMPRESSION_LEVEL: i32 = 3;

/// Filesystem cache for repository catalogs and unpacked sources
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache key for a repository and the variants tracked for it
    pub fn fingerprint(reference: &RepositoryReference, variants: &[SourceVariant]) -> String {
        let mut sorted = variants.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut hasher = Sha256::new();
        hasher.update(reference.name.as_bytes());
        hasher.update(b"\n");
        hasher.update(reference.location.trim_end_matches('/').as_bytes());
        for variant in sorted {
            hasher.update(b"\n");
            hasher.update(variant.as_str().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    fn index_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join("repos").join(format!("{}.json.zst", fingerprint))
    }

    /// Directory for an unpacked extra source keyed by archive hash
    pub fn source_dir(&self, archive_hash: &str) -> PathBuf {
        self.sources_root().join(archive_hash)
    }

    pub fn sources_root(&self) -> PathBuf {
        self.root.join("sources")
    }

    /// Directory for downloaded package archives
    pub fn downloads_root(&self) -> PathBuf {
        self.root.join("downloads")
    }

    /// Load a cached index if it is younger than `ttl`
    ///
    /// A missing or stale entry yields `Ok(None)`. An unreadable entry is
    /// logged and treated as missing so it gets refetched.
    pub fn load_index(&self, fingerprint: &str, ttl: Duration) -> Result<Option<RepositoryIndex>> {
        let path = self.index_path(fingerprint);
        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => return Ok(None),
        };

        let modified = metadata
            .modified()
            .map_err(|e| Error::CacheError(format!("No mtime for {}: {}", path.display(), e)))?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age >= ttl {
            debug!("Cached catalog {} is stale ({}s old)", fingerprint, age.as_secs());
            return Ok(None);
        }

        match self.read_index(&path) {
            Ok(index) if index.is_fresh(ttl) => Ok(Some(index)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("Ignoring unreadable cache entry {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    fn read_index(&self, path: &Path) -> Result<RepositoryIndex> {
        let compressed = fs::read(path)
            .map_err(|e| Error::CacheError(format!("Failed to read {}: {}", path.display(), e)))?;
        let json = zstd::decode_all(compressed.as_slice())
            .map_err(|e| Error::CacheError(format!("Failed to decompress {}: {}", path.display(), e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| Error::CacheError(format!("Failed to decode {}: {}", path.display(), e)))
    }

    /// Persist an index under its fingerprint
    pub fn save_index(&self, index: &RepositoryIndex) -> Result<()> {
        let path = self.index_path(index.fingerprint());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::CacheError(format!("Failed to create cache dir {}: {}", parent.display(), e))
            })?;
        }

        let json = serde_json::to_vec(index)
            .map_err(|e| Error::CacheError(format!("Failed to encode index: {}", e)))?;
        let compressed = zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)
            .map_err(|e| Error::CacheError(format!("Failed to compress index: {}", e)))?;

        // Write to temporary file first
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &compressed)
            .map_err(|e| Error::CacheError(format!("Failed to write cache: {}", e)))?;

        // Atomic rename
        fs::rename(&temp_path, &path)
            .map_err(|e| Error::CacheError(format!("Failed to rename cache file: {}", e)))?;

        debug!("Cached catalog for {} at {}", index.reference().name, path.display());
        Ok(())
    }
}
