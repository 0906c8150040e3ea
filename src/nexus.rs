// src/nexus.rs

//! Multi-repository package lookup
//!
//! A `PackageNexus` owns one `RepositoryIndex` per configured repository, in
//! search order, and resolves package names against them:
//! - a package pinned to a repository is only looked up there
//! - the variant is the package override, else the repository default,
//!   else the global default
//! - a binary lookup that misses falls back to the same repository's source

use crate::error::{Error, Result};
use crate::packages::PackageRecord;
use crate::repository::index::VariantCatalog;
use crate::repository::{FetchContext, RepositoryIndex, RepositoryReference, SourceVariant};
use crossbeam::channel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::thread;
use tracing::{debug, info};

/// Name of the pseudo-repository holding extra tarball sources
pub const LOCAL_SOURCES_REPOSITORY: &str = "local-sources";

/// Per-package pin of repository and/or variant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageOverride {
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub variant: Option<SourceVariant>,
}

/// Per-repository settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySettings {
    #[serde(default)]
    pub default_variant: Option<SourceVariant>,
}

/// Lookup configuration handed to the nexus at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NexusConfig {
    pub default_variant: SourceVariant,
    #[serde(default)]
    pub overrides: HashMap<String, PackageOverride>,
    #[serde(default)]
    pub repositories: HashMap<String, RepositorySettings>,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            default_variant: SourceVariant::Source,
            overrides: HashMap::new(),
            repositories: HashMap::new(),
        }
    }
}

/// Where a package was found
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub record: PackageRecord,
    pub repository: String,
    /// Repository location the archive is served from
    pub location: String,
    pub variant: SourceVariant,
}

/// Result of resolving several names at once
#[derive(Debug, Clone, Default)]
pub struct BatchResolution {
    pub found: Vec<Resolution>,
    pub missing: Vec<String>,
}

/// Ordered aggregate of repository indexes
#[derive(Debug, Clone)]
pub struct PackageNexus {
    indexes: Vec<RepositoryIndex>,
    config: NexusConfig,
}

impl PackageNexus {
    /// Fetch every repository concurrently and assemble the nexus
    ///
    /// Any repository failing to fetch fails the whole construction.
    pub fn build(
        references: Vec<RepositoryReference>,
        config: NexusConfig,
        ctx: &FetchContext,
    ) -> Result<Self> {
        let names: Vec<&str> = references.iter().map(|r| r.name.as_str()).collect();
        validate(&names, &config)?;

        let variants = ctx.platform.tracked_variants();
        let (tx, rx) = channel::bounded(references.len().max(1));

        thread::scope(|scope| {
            for (position, reference) in references.iter().enumerate() {
                let tx = tx.clone();
                let variants = &variants;
                scope.spawn(move || {
                    let result = RepositoryIndex::fetch(reference.clone(), variants, ctx);
                    // The receiver outlives every sender in this scope
                    let _ = tx.send((position, result));
                });
            }
        });
        drop(tx);

        let mut slots: Vec<Option<RepositoryIndex>> = vec![None; references.len()];
        for (position, result) in rx.iter() {
            slots[position] = Some(result?);
        }

        let indexes = slots.into_iter().flatten().collect::<Vec<_>>();
        info!("Package nexus ready with {} repositories", indexes.len());
        Ok(Self { indexes, config })
    }

    /// Assemble a nexus from indexes already loaded, in search order
    pub fn from_indexes(indexes: Vec<RepositoryIndex>, config: NexusConfig) -> Result<Self> {
        let names: Vec<&str> = indexes.iter().map(|i| i.name()).collect();
        validate(&names, &config)?;
        Ok(Self { indexes, config })
    }

    pub fn config(&self) -> &NexusConfig {
        &self.config
    }

    /// Register extra local sources ahead of every repository
    pub fn add_local_sources(&mut self, records: Vec<PackageRecord>) {
        if records.is_empty() {
            return;
        }

        let reference = RepositoryReference::new(LOCAL_SOURCES_REPOSITORY, "local");
        let catalog = VariantCatalog::from_records(SourceVariant::Source, records);
        let index = RepositoryIndex::from_catalogs(reference, vec![catalog]);

        self.indexes.retain(|i| i.name() != LOCAL_SOURCES_REPOSITORY);
        self.indexes.insert(0, index);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indexes.iter().any(|i| i.contains(name))
    }

    /// Resolve a package to the first matching record in search order
    ///
    /// Returns `Ok(None)` when no repository has it. A package-level variant
    /// that contradicts the repository-level default of the repository it
    /// resolves from is rejected instead of silently picking one.
    pub fn resolve(&self, name: &str) -> Result<Option<Resolution>> {
        let package_override = self.config.overrides.get(name);
        let pinned = package_override.and_then(|o| o.repository.as_deref());
        let package_variant = package_override.and_then(|o| o.variant);

        for index in &self.indexes {
            if index.name() == LOCAL_SOURCES_REPOSITORY {
                if let Some(record) = index.get(name, SourceVariant::Source) {
                    return Ok(Some(self.resolution(index, record, SourceVariant::Source)));
                }
                continue;
            }

            if pinned.is_some_and(|repo| repo != index.name()) {
                continue;
            }

            let repo_variant = self
                .config
                .repositories
                .get(index.name())
                .and_then(|s| s.default_variant);
            let wanted = package_variant
                .or(repo_variant)
                .unwrap_or(self.config.default_variant);

            let found = index.get(name, wanted).map(|r| (r, wanted)).or_else(|| {
                if wanted == SourceVariant::Binary {
                    index
                        .get(name, SourceVariant::Source)
                        .map(|r| (r, SourceVariant::Source))
                } else {
                    None
                }
            });

            let Some((record, variant)) = found else {
                continue;
            };

            if let (Some(pkg), Some(repo)) = (package_variant, repo_variant) {
                if pkg != repo {
                    return Err(Error::Configuration(format!(
                        "package '{}' asks for {} but repository '{}' is configured for {}",
                        name,
                        pkg,
                        index.name(),
                        repo
                    )));
                }
            }

            if variant != wanted {
                debug!(
                    "No {} build of {} in {}, using {}",
                    wanted,
                    name,
                    index.name(),
                    variant
                );
            }

            return Ok(Some(self.resolution(index, record, variant)));
        }

        Ok(None)
    }

    fn resolution(
        &self,
        index: &RepositoryIndex,
        record: &PackageRecord,
        variant: SourceVariant,
    ) -> Resolution {
        Resolution {
            record: record.clone(),
            repository: index.name().to_string(),
            location: index.reference().location.clone(),
            variant,
        }
    }

    /// Resolve several names, separating found from missing
    pub fn resolve_all<S: AsRef<str>>(&self, names: &[S]) -> Result<BatchResolution> {
        let mut batch = BatchResolution::default();
        for name in names {
            let name = name.as_ref();
            match self.resolve(name)? {
                Some(resolution) => batch.found.push(resolution),
                None => batch.missing.push(name.to_string()),
            }
        }
        Ok(batch)
    }

    /// Known package names within edit distance 1 of `name`
    pub fn suggest(&self, name: &str) -> Vec<String> {
        let known: BTreeSet<&str> = self.indexes.iter().flat_map(|i| i.package_names()).collect();

        known
            .into_iter()
            .filter(|candidate| *candidate != name && strsim::levenshtein(name, candidate) <= 1)
            .map(str::to_string)
            .collect()
    }
}

/// Reject overrides and settings that cannot be honoured
fn validate(repository_names: &[&str], config: &NexusConfig) -> Result<()> {
    let known = |name: &str| repository_names.contains(&name);

    for (package, package_override) in &config.overrides {
        let Some(repo) = package_override.repository.as_deref() else {
            continue;
        };
        if !known(repo) {
            return Err(Error::Configuration(format!(
                "package '{}' is pinned to unknown repository '{}'",
                package, repo
            )));
        }

        let repo_variant = config.repositories.get(repo).and_then(|s| s.default_variant);
        if let (Some(pkg), Some(repo_variant)) = (package_override.variant, repo_variant) {
            if pkg != repo_variant {
                return Err(Error::Configuration(format!(
                    "package '{}' asks for {} but pinned repository '{}' is configured for {}",
                    package, pkg, repo, repo_variant
                )));
            }
        }
    }

    for repo in config.repositories.keys() {
        if !known(repo) {
            return Err(Error::Configuration(format!(
                "settings given for unknown repository '{}'",
                repo
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{CacheStore, Platform, RepositoryClient};

    fn index(name: &str, variant: SourceVariant, records: &[(&str, &str)]) -> RepositoryIndex {
        let records = records
            .iter()
            .map(|(n, v)| PackageRecord::new(*n, *v))
            .collect();
        RepositoryIndex::from_catalogs(
            RepositoryReference::new(name, format!("https://{}.example", name)),
            vec![VariantCatalog::from_records(variant, records)],
        )
    }

    fn two_repos() -> Vec<RepositoryIndex> {
        vec![
            index("R1", SourceVariant::Source, &[("pkgX", "1.0")]),
            index("R2", SourceVariant::Source, &[("pkgX", "2.0"), ("pkgZ", "0.1")]),
        ]
    }

    #[test]
    fn test_first_repository_wins() {
        let nexus = PackageNexus::from_indexes(two_repos(), NexusConfig::default()).unwrap();
        let res = nexus.resolve("pkgX").unwrap().unwrap();
        assert_eq!(res.record.version, "1.0");
        assert_eq!(res.repository, "R1");
        assert_eq!(res.variant, SourceVariant::Source);
    }

    #[test]
    fn test_pinned_repository_skips_others() {
        let mut config = NexusConfig::default();
        config.overrides.insert(
            "pkgX".to_string(),
            PackageOverride {
                repository: Some("R2".to_string()),
                variant: None,
            },
        );
        let nexus = PackageNexus::from_indexes(two_repos(), config).unwrap();
        let res = nexus.resolve("pkgX").unwrap().unwrap();
        assert_eq!(res.record.version, "2.0");
        assert_eq!(res.repository, "R2");
    }

    #[test]
    fn test_pin_to_unknown_repository_is_rejected() {
        let mut config = NexusConfig::default();
        config.overrides.insert(
            "pkgX".to_string(),
            PackageOverride {
                repository: Some("R9".to_string()),
                variant: None,
            },
        );
        let err = PackageNexus::from_indexes(two_repos(), config).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_conflicting_variant_settings_are_rejected() {
        let mut config = NexusConfig::default();
        config.repositories.insert(
            "R2".to_string(),
            RepositorySettings {
                default_variant: Some(SourceVariant::Binary),
            },
        );
        config.overrides.insert(
            "pkgX".to_string(),
            PackageOverride {
                repository: Some("R2".to_string()),
                variant: Some(SourceVariant::Source),
            },
        );
        assert!(matches!(
            PackageNexus::from_indexes(two_repos(), config),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_unpinned_variant_conflict_fails_at_resolve() {
        let mut config = NexusConfig::default();
        config.repositories.insert(
            "R1".to_string(),
            RepositorySettings {
                default_variant: Some(SourceVariant::Source),
            },
        );
        config.overrides.insert(
            "pkgX".to_string(),
            PackageOverride {
                repository: None,
                variant: Some(SourceVariant::Binary),
            },
        );
        let nexus = PackageNexus::from_indexes(two_repos(), config).unwrap();
        assert!(matches!(nexus.resolve("pkgX"), Err(Error::Configuration(_))));
        // Packages without overrides are unaffected
        assert!(nexus.resolve("pkgZ").unwrap().is_some());
    }

    #[test]
    fn test_binary_falls_back_to_source() {
        let config = NexusConfig {
            default_variant: SourceVariant::Binary,
            ..NexusConfig::default()
        };
        let nexus = PackageNexus::from_indexes(two_repos(), config).unwrap();
        let res = nexus.resolve("pkgX").unwrap().unwrap();
        assert_eq!(res.variant, SourceVariant::Source);
        assert_eq!(res.repository, "R1");
    }

    #[test]
    fn test_resolve_all_and_suggestions() {
        let nexus = PackageNexus::from_indexes(two_repos(), NexusConfig::default()).unwrap();
        let batch = nexus.resolve_all(&["pkgX", "pkgY", "pkgZ"]).unwrap();
        assert_eq!(batch.found.len(), 2);
        assert_eq!(batch.missing, vec!["pkgY".to_string()]);
        assert_eq!(nexus.suggest("pkgY"), vec!["pkgX".to_string(), "pkgZ".to_string()]);
        assert!(nexus.suggest("completely-different").is_empty());
    }

    #[test]
    fn test_local_sources_take_precedence() {
        let mut nexus = PackageNexus::from_indexes(two_repos(), NexusConfig::default()).unwrap();
        nexus.add_local_sources(vec![PackageRecord::new("pkgX", "3.0")]);
        let res = nexus.resolve("pkgX").unwrap().unwrap();
        assert_eq!(res.repository, LOCAL_SOURCES_REPOSITORY);
        assert_eq!(res.record.version, "3.0");
    }

    #[test]
    fn test_build_fails_if_any_repository_is_unreachable() {
        let good = tempfile::tempdir().unwrap();
        let bad = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(good.path().join("src/contrib")).unwrap();
        std::fs::write(
            good.path().join("src/contrib/PACKAGES"),
            "Package: glue\nVersion: 1.7.0\n",
        )
        .unwrap();

        let ctx = FetchContext::new(
            RepositoryClient::new().unwrap(),
            CacheStore::new(cache.path()),
            Platform::Linux,
            "4.3",
        );

        let ok = PackageNexus::build(
            vec![RepositoryReference::new("good", good.path().display().to_string())],
            NexusConfig::default(),
            &ctx,
        )
        .unwrap();
        assert!(ok.contains("glue"));

        let err = PackageNexus::build(
            vec![
                RepositoryReference::new("good", good.path().display().to_string()),
                RepositoryReference::new("bad", bad.path().display().to_string()),
            ],
            NexusConfig::default(),
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, Error::RepositoryUnavailable { .. }));
    }
}
