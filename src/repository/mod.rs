// src/repository/mod.rs

//! Repository access and catalog caching
//!
//! This module provides functionality for:
//! - Describing repositories and their search order
//! - Reading catalogs and archives over HTTP or from local directories
//! - Caching parsed catalogs per repository fingerprint
//! - Building per-repository package indexes

pub mod cache;
pub mod index;
pub mod layout;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub use cache::CacheStore;
pub use index::{FetchContext, RepositoryIndex};
pub use layout::{Platform, SourceVariant};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A named repository location
///
/// `location` is an `http(s)://` URL, a `file://` URL or a plain path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryReference {
    pub name: String,
    pub location: String,
}

impl RepositoryReference {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        is_remote(&self.location)
    }
}

/// Whether a location needs the network
pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Filesystem path for a local location
pub fn local_path(location: &str) -> PathBuf {
    PathBuf::from(location.strip_prefix("file://").unwrap_or(location))
}

/// HTTP/local reader shared by catalog fetches and package downloads
///
/// No retries: a failed read is reported to the caller as-is.
#[derive(Debug, Clone)]
pub struct RepositoryClient {
    client: Client,
    timeout: Duration,
}

impl RepositoryClient {
    /// Create a new repository client
    pub fn new() -> Result<Self> {
        Self::with_timeout(HTTP_TIMEOUT)
    }

    /// Create a client whose requests give up after `timeout`
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    /// Request timeout capped by the token's remaining time
    fn effective_timeout(&self, cancel: &CancelToken) -> Duration {
        match cancel.remaining() {
            Some(left) => left.min(self.timeout),
            None => self.timeout,
        }
    }

    fn get(&self, url: &str, cancel: &CancelToken) -> Result<reqwest::blocking::Response> {
        cancel.check(url)?;

        let response = self
            .client
            .get(url)
            .timeout(self.effective_timeout(cancel))
            .send()
            .map_err(|e| Error::DownloadError(format!("Failed to download {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::DownloadError(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        Ok(response)
    }

    /// Read a whole file from a URL or local path
    pub fn fetch_bytes(&self, location: &str, cancel: &CancelToken) -> Result<Vec<u8>> {
        if is_remote(location) {
            let bytes = self
                .get(location, cancel)?
                .bytes()
                .map_err(|e| Error::DownloadError(format!("Failed to read response: {}", e)))?;
            return Ok(bytes.to_vec());
        }

        cancel.check(location)?;
        let path = local_path(location);
        fs::read(&path)
            .map_err(|e| Error::DownloadError(format!("Failed to read {}: {}", path.display(), e)))
    }

    /// Fetch catalog text, trying each candidate location in order
    ///
    /// Locations ending in `.gz` are decompressed.
    pub fn fetch_catalog(&self, locations: &[String], cancel: &CancelToken) -> Result<String> {
        let mut failures = Vec::new();

        for location in locations {
            debug!("Fetching catalog from {}", location);
            match self.fetch_bytes(location, cancel) {
                Ok(bytes) => return decode_catalog(location, &bytes),
                Err(Error::Cancelled(what)) => return Err(Error::Cancelled(what)),
                Err(e) => failures.push(e.to_string()),
            }
        }

        Err(Error::DownloadError(failures.join("; ")))
    }

    /// Download a file to the specified path
    pub fn download_file(&self, url: &str, dest_path: &Path, cancel: &CancelToken) -> Result<()> {
        info!("Downloading {} to {}", url, dest_path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {}", parent.display(), e))
            })?;
        }

        let mut response = self.get(url, cancel)?;

        // Write to temporary file first
        let temp_path = dest_path.with_extension("tmp");
        let mut file = File::create(&temp_path).map_err(|e| {
            Error::IoError(format!("Failed to create file {}: {}", temp_path.display(), e))
        })?;

        io::copy(&mut response, &mut file)
            .map_err(|e| Error::IoError(format!("Failed to write downloaded data: {}", e)))?;

        // Atomic rename from temp to final destination
        fs::rename(&temp_path, dest_path).map_err(|e| {
            Error::IoError(format!(
                "Failed to move {} to {}: {}",
                temp_path.display(),
                dest_path.display(),
                e
            ))
        })?;

        info!("Successfully downloaded to {}", dest_path.display());
        Ok(())
    }
}

fn decode_catalog(location: &str, bytes: &[u8]) -> Result<String> {
    if location.ends_with(".gz") {
        let mut gz = GzDecoder::new(bytes);
        let mut decompressed = String::new();
        gz.read_to_string(&mut decompressed).map_err(|e| {
            Error::ParseError(format!("Failed to decompress {}: {}", location, e))
        })?;
        return Ok(decompressed);
    }

    Ok(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[test]
    fn test_location_kinds() {
        assert!(is_remote("https://cloud.r-project.org"));
        assert!(!is_remote("/srv/cran"));
        assert_eq!(local_path("file:///srv/cran"), PathBuf::from("/srv/cran"));
        assert_eq!(local_path("/srv/cran"), PathBuf::from("/srv/cran"));
    }

    #[test]
    fn test_fetch_catalog_falls_back_to_plain() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("PACKAGES");
        fs::write(&plain, "Package: a\nVersion: 1.0\n").unwrap();

        let client = RepositoryClient::new().unwrap();
        let locations = vec![
            dir.path().join("PACKAGES.gz").display().to_string(),
            plain.display().to_string(),
        ];
        let text = client.fetch_catalog(&locations, &CancelToken::new()).unwrap();
        assert!(text.contains("Package: a"));
    }

    #[test]
    fn test_fetch_catalog_decompresses_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let gz_path = dir.path().join("PACKAGES.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"Package: b\nVersion: 2.0\n").unwrap();
        fs::write(&gz_path, encoder.finish().unwrap()).unwrap();

        let client = RepositoryClient::new().unwrap();
        let text = client
            .fetch_catalog(&[gz_path.display().to_string()], &CancelToken::new())
            .unwrap();
        assert!(text.contains("Package: b"));
    }

    #[test]
    fn test_fetch_respects_cancellation() {
        let client = RepositoryClient::new().unwrap();
        let token = CancelToken::new();
        token.cancel();
        let result = client.fetch_catalog(&["/nonexistent/PACKAGES".to_string()], &token);
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }
}
