// src/install/download.rs

//! Package archive retrieval for the install workers

use super::planner::{PackageSource, PlannedPackage};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::repository::{self, RepositoryClient};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Downloads currently in progress, shared by every worker
#[derive(Debug, Default)]
pub struct DownloadTracker {
    in_flight: RwLock<HashMap<String, Instant>>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking; returns how many downloads are now in flight
    fn begin(&self, package: &str) -> usize {
        let mut map = self.in_flight.write().unwrap_or_else(|e| e.into_inner());
        map.insert(package.to_string(), Instant::now());
        map.len()
    }

    /// Stop tracking; returns seconds spent
    fn finish(&self, package: &str) -> f64 {
        let mut map = self.in_flight.write().unwrap_or_else(|e| e.into_inner());
        map.remove(package)
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or_default()
    }
}

/// Turns a planned package into something the build tool can read
#[derive(Debug)]
pub struct PackageFetcher {
    client: RepositoryClient,
    downloads: PathBuf,
    tracker: DownloadTracker,
}

impl PackageFetcher {
    pub fn new(client: RepositoryClient, downloads: impl Into<PathBuf>) -> Self {
        Self {
            client,
            downloads: downloads.into(),
            tracker: DownloadTracker::new(),
        }
    }

    /// Local path of the package's archive or source tree
    ///
    /// Remote archives are downloaded into the download cache once per
    /// file name; local archives and extra sources are used in place.
    pub fn fetch(&self, package: &PlannedPackage, cancel: &CancelToken) -> Result<PathBuf> {
        let url = match &package.source {
            PackageSource::Directory { path } => return Ok(path.clone()),
            PackageSource::Archive { url } => url,
        };

        if !repository::is_remote(url) {
            let path = repository::local_path(url);
            if !path.is_file() {
                return Err(Error::DownloadError(format!(
                    "Archive for {} not found at {}",
                    package.name,
                    path.display()
                )));
            }
            return Ok(path);
        }

        let dest = self.downloads.join(file_name(url));
        if dest.is_file() {
            debug!("Using cached archive {}", dest.display());
            return Ok(dest);
        }

        let in_flight = self.tracker.begin(&package.name);
        info!(package = %package.name, url = %url, in_flight, "Download started");
        let result = self.client.download_file(url, &dest, cancel);
        let seconds = self.tracker.finish(&package.name);

        match &result {
            Ok(()) => info!(package = %package.name, seconds, "Download finished"),
            Err(e) => warn!(package = %package.name, error = %e, "Download failed"),
        }
        result.map(|()| dest)
    }
}

fn file_name(url: &str) -> &str {
    url.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or(url)
}
