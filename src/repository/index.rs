// src/repository/index.rs

//! Per-repository package index
//!
//! A `RepositoryIndex` holds one `name -> PackageRecord` map per tracked
//! source variant. Fetching reads every variant's catalog concurrently and
//! accepts a partial result: a repository without binaries is source-only,
//! not broken.

use super::cache::{CATALOG_TTL, CacheStore};
use super::layout::{self, Platform, SourceVariant};
use super::{RepositoryClient, RepositoryReference};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::packages::{PackageRecord, parse_catalog};
use crate::version::PackageVersion;
use chrono::{DateTime, Utc};
use crossbeam::channel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything an index fetch needs besides the repository itself
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub client: RepositoryClient,
    pub cache: CacheStore,
    pub platform: Platform,
    /// Language version used in binary catalog paths, e.g. `4.3`
    pub language_version: String,
    pub ttl: Duration,
    pub cancel: CancelToken,
}

impl FetchContext {
    pub fn new(
        client: RepositoryClient,
        cache: CacheStore,
        platform: Platform,
        language_version: impl Into<String>,
    ) -> Self {
        Self {
            client,
            cache,
            platform,
            language_version: language_version.into(),
            ttl: CATALOG_TTL,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Catalog for a single variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantCatalog {
    pub variant: SourceVariant,
    pub packages: HashMap<String, PackageRecord>,
}

impl VariantCatalog {
    /// Build a catalog, keeping the highest version when a name repeats
    pub fn from_records(variant: SourceVariant, records: Vec<PackageRecord>) -> Self {
        let mut packages: HashMap<String, PackageRecord> = HashMap::with_capacity(records.len());

        for record in records {
            match packages.get(&record.name) {
                Some(existing) if !is_newer(&record, existing) => {
                    debug!(
                        "Keeping {} {} over duplicate {}",
                        existing.name, existing.version, record.version
                    );
                }
                _ => {
                    packages.insert(record.name.clone(), record);
                }
            }
        }

        Self { variant, packages }
    }
}

fn is_newer(candidate: &PackageRecord, existing: &PackageRecord) -> bool {
    match (
        PackageVersion::parse(&candidate.version),
        PackageVersion::parse(&existing.version),
    ) {
        (Ok(a), Ok(b)) => a > b,
        _ => false,
    }
}

/// Cached catalog of one repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryIndex {
    reference: RepositoryReference,
    variants: Vec<SourceVariant>,
    catalogs: Vec<VariantCatalog>,
    fingerprint: String,
    fetched_at: DateTime<Utc>,
}

impl RepositoryIndex {
    /// Assemble an index from catalogs already in memory
    pub fn from_catalogs(reference: RepositoryReference, mut catalogs: Vec<VariantCatalog>) -> Self {
        catalogs.sort_by_key(|c| c.variant);
        let variants: Vec<_> = catalogs.iter().map(|c| c.variant).collect();
        Self::assemble(reference, variants, catalogs)
    }

    fn assemble(
        reference: RepositoryReference,
        variants: Vec<SourceVariant>,
        catalogs: Vec<VariantCatalog>,
    ) -> Self {
        let fingerprint = CacheStore::fingerprint(&reference, &variants);
        Self {
            reference,
            variants,
            catalogs,
            fingerprint,
            fetched_at: Utc::now(),
        }
    }

    /// Load from cache or read every tracked variant's catalog
    pub fn fetch(
        reference: RepositoryReference,
        variants: &[SourceVariant],
        ctx: &FetchContext,
    ) -> Result<Self> {
        let fingerprint = CacheStore::fingerprint(&reference, variants);
        if let Some(cached) = ctx.cache.load_index(&fingerprint, ctx.ttl)? {
            info!(
                "Using cached catalog for {} (fetched {})",
                reference.name,
                cached.fetched_at.to_rfc3339()
            );
            return Ok(cached);
        }

        info!("Fetching catalogs for repository {}", reference.name);
        let (tx, rx) = channel::bounded(variants.len().max(1));

        thread::scope(|scope| {
            for &variant in variants {
                let tx = tx.clone();
                let reference = &reference;
                scope.spawn(move || {
                    let result = fetch_variant(reference, variant, ctx);
                    // The receiver outlives every sender in this scope
                    let _ = tx.send((variant, result));
                });
            }
        });
        drop(tx);

        let mut catalogs = Vec::new();
        let mut failures = Vec::new();
        for (variant, result) in rx.iter() {
            match result {
                Ok(catalog) => {
                    debug!(
                        "{} {} catalog: {} packages",
                        reference.name,
                        variant,
                        catalog.packages.len()
                    );
                    catalogs.push(catalog);
                }
                Err(Error::Cancelled(what)) => return Err(Error::Cancelled(what)),
                Err(e) => {
                    warn!("No {} catalog for {}: {}", variant, reference.name, e);
                    failures.push(format!("{}: {}", variant, e));
                }
            }
        }

        if catalogs.is_empty() {
            return Err(Error::RepositoryUnavailable {
                repository: reference.name.clone(),
                reasons: failures,
            });
        }

        catalogs.sort_by_key(|c| c.variant);
        let mut tracked = variants.to_vec();
        tracked.sort();
        tracked.dedup();
        let index = Self::assemble(reference, tracked, catalogs);

        if let Err(e) = ctx.cache.save_index(&index) {
            warn!("Failed to cache catalog for {}: {}", index.reference.name, e);
        }
        Ok(index)
    }

    pub fn reference(&self) -> &RepositoryReference {
        &self.reference
    }

    pub fn name(&self) -> &str {
        &self.reference.name
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Whether the fetch timestamp is within `ttl` of now
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.fetched_at);
        age.to_std().map(|age| age < ttl).unwrap_or(true)
    }

    /// Variants whose catalog was actually read
    pub fn available_variants(&self) -> impl Iterator<Item = SourceVariant> + '_ {
        self.catalogs.iter().map(|c| c.variant)
    }

    pub fn catalog(&self, variant: SourceVariant) -> Option<&HashMap<String, PackageRecord>> {
        self.catalogs
            .iter()
            .find(|c| c.variant == variant)
            .map(|c| &c.packages)
    }

    pub fn get(&self, name: &str, variant: SourceVariant) -> Option<&PackageRecord> {
        self.catalog(variant).and_then(|packages| packages.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.catalogs.iter().any(|c| c.packages.contains_key(name))
    }

    /// Every package name across variants, possibly repeated
    pub fn package_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.catalogs
            .iter()
            .flat_map(|c| c.packages.keys().map(String::as_str))
    }
}

fn fetch_variant(
    reference: &RepositoryReference,
    variant: SourceVariant,
    ctx: &FetchContext,
) -> Result<VariantCatalog> {
    let locations = layout::catalog_locations(
        &reference.location,
        variant,
        ctx.platform,
        &ctx.language_version,
    )
    .ok_or_else(|| {
        Error::DownloadError(format!("{} packages are not published for {:?}", variant, ctx.platform))
    })?;

    let text = ctx.client.fetch_catalog(&locations, &ctx.cancel)?;
    let records = parse_catalog(&text)?;
    Ok(VariantCatalog::from_records(variant, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn write_catalog(repo: &Path, subdir: &str, body: &str) {
        let dir = repo.join(subdir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("PACKAGES"), body).unwrap();
    }

    fn context(cache: &Path, platform: Platform) -> FetchContext {
        FetchContext::new(
            RepositoryClient::new().unwrap(),
            CacheStore::new(cache),
            platform,
            "4.3.1",
        )
    }

    #[test]
    fn test_fetch_source_only_repository() {
        let repo = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_catalog(repo.path(), "src/contrib", "Package: glue\nVersion: 1.7.0\n");

        let reference = RepositoryReference::new("local", repo.path().display().to_string());
        let ctx = context(cache.path(), Platform::MacOs);
        let index = RepositoryIndex::fetch(
            reference,
            &[SourceVariant::Source, SourceVariant::Binary],
            &ctx,
        )
        .unwrap();

        assert_eq!(index.get("glue", SourceVariant::Source).unwrap().version, "1.7.0");
        assert!(index.catalog(SourceVariant::Binary).is_none());
        assert_eq!(index.available_variants().collect::<Vec<_>>(), vec![SourceVariant::Source]);
    }

    #[test]
    fn test_fetch_reads_binary_catalog() {
        let repo = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_catalog(repo.path(), "src/contrib", "Package: glue\nVersion: 1.7.0\n");
        write_catalog(repo.path(), "bin/macosx/contrib/4.3", "Package: glue\nVersion: 1.6.2\n");

        let reference = RepositoryReference::new("local", repo.path().display().to_string());
        let ctx = context(cache.path(), Platform::MacOs);
        let index = RepositoryIndex::fetch(
            reference,
            &[SourceVariant::Source, SourceVariant::Binary],
            &ctx,
        )
        .unwrap();

        assert_eq!(index.get("glue", SourceVariant::Binary).unwrap().version, "1.6.2");
    }

    #[test]
    fn test_fetch_fails_when_every_variant_fails() {
        let repo = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();

        let reference = RepositoryReference::new("empty", repo.path().display().to_string());
        let ctx = context(cache.path(), Platform::Linux);
        let err = RepositoryIndex::fetch(reference, &[SourceVariant::Source], &ctx).unwrap_err();

        match err {
            Error::RepositoryUnavailable { repository, reasons } => {
                assert_eq!(repository, "empty");
                assert_eq!(reasons.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_second_fetch_uses_cache() {
        let repo = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        write_catalog(repo.path(), "src/contrib", "Package: glue\nVersion: 1.7.0\n");

        let reference = RepositoryReference::new("local", repo.path().display().to_string());
        let ctx = context(cache.path(), Platform::Linux);
        let first = RepositoryIndex::fetch(reference.clone(), &[SourceVariant::Source], &ctx).unwrap();

        fs::remove_dir_all(repo.path().join("src")).unwrap();
        let second = RepositoryIndex::fetch(reference, &[SourceVariant::Source], &ctx).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert!(second.contains("glue"));
    }

    #[test]
    fn test_duplicate_names_keep_highest_version() {
        let catalog = VariantCatalog::from_records(
            SourceVariant::Source,
            vec![
                PackageRecord::new("x", "1.2"),
                PackageRecord::new("x", "1.10"),
                PackageRecord::new("x", "1.9"),
            ],
        );
        assert_eq!(catalog.packages["x"].version, "1.10");
    }
}
