// src/config.rs

//! Run configuration
//!
//! `Config` gathers everything a plan or install needs. It is plain data
//! (serde-deserializable), filled by the binary from command-line flags and
//! environment variables, and split into the per-component configs here.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::install::{EngineConfig, PackageSettings, PlannerConfig, RCommand};
use crate::nexus::{LOCAL_SOURCES_REPOSITORY, NexusConfig};
use crate::repository::cache::{CATALOG_TTL, CacheStore};
use crate::repository::index::FetchContext;
use crate::repository::layout::Platform;
use crate::repository::{RepositoryClient, RepositoryReference};
use crate::resolver::DependencyPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Language version assumed when none is configured
pub const DEFAULT_LANGUAGE_VERSION: &str = "4.3";

fn default_language_version() -> String {
    DEFAULT_LANGUAGE_VERSION.to_string()
}

fn default_r_executable() -> PathBuf {
    PathBuf::from("R")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Repositories in search order
    pub repositories: Vec<RepositoryReference>,
    #[serde(default)]
    pub nexus: NexusConfig,
    /// Target package library
    pub library: PathBuf,
    pub cache_root: PathBuf,
    /// Install history ledger; `None` disables recording
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub dependencies: DependencyPolicy,
    #[serde(default)]
    pub packages: HashMap<String, PackageSettings>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default = "Platform::current")]
    pub platform: Platform,
    #[serde(default = "default_language_version")]
    pub language_version: String,
    #[serde(default = "default_r_executable")]
    pub r_executable: PathBuf,
    /// Per-package build timeout in seconds
    #[serde(default)]
    pub build_timeout: Option<u64>,
    /// HTTP timeout in seconds
    #[serde(default)]
    pub http_timeout: Option<u64>,
    /// Catalog cache freshness in seconds
    #[serde(default)]
    pub catalog_ttl: Option<u64>,
}

impl Config {
    pub fn new(library: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            repositories: Vec::new(),
            nexus: NexusConfig::default(),
            library: library.into(),
            cache_root: cache_root.into(),
            db_path: None,
            update: false,
            strict: false,
            dependencies: DependencyPolicy::default(),
            packages: HashMap::new(),
            engine: EngineConfig::default(),
            platform: Platform::current(),
            language_version: default_language_version(),
            r_executable: default_r_executable(),
            build_timeout: None,
            http_timeout: None,
            catalog_ttl: None,
        }
    }

    pub fn with_repository(mut self, name: impl Into<String>, location: impl Into<String>) -> Self {
        self.repositories.push(RepositoryReference::new(name, location));
        self
    }

    /// Reject configurations no component could act on
    ///
    /// Override and settings references are checked again by the nexus.
    pub fn validate(&self) -> Result<()> {
        if self.repositories.is_empty() {
            return Err(Error::Configuration("no repositories configured".to_string()));
        }

        let mut seen = HashSet::new();
        for reference in &self.repositories {
            if reference.name.trim().is_empty() {
                return Err(Error::Configuration(format!(
                    "repository at {} has an empty name",
                    reference.location
                )));
            }
            if reference.name == LOCAL_SOURCES_REPOSITORY {
                return Err(Error::Configuration(format!(
                    "repository name '{}' is reserved",
                    LOCAL_SOURCES_REPOSITORY
                )));
            }
            if !seen.insert(reference.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "repository '{}' is listed twice",
                    reference.name
                )));
            }
        }

        if self.language_version.trim().is_empty() {
            return Err(Error::Configuration("language version is empty".to_string()));
        }
        Ok(())
    }

    pub fn cache(&self) -> CacheStore {
        CacheStore::new(&self.cache_root)
    }

    pub fn client(&self) -> Result<RepositoryClient> {
        match self.http_timeout {
            Some(secs) => RepositoryClient::with_timeout(Duration::from_secs(secs)),
            None => RepositoryClient::new(),
        }
    }

    pub fn fetch_context(&self, cancel: &CancelToken) -> Result<FetchContext> {
        let mut ctx = FetchContext::new(
            self.client()?,
            self.cache(),
            self.platform,
            self.language_version.clone(),
        )
        .with_cancel(cancel.clone());
        ctx.ttl = self
            .catalog_ttl
            .map(Duration::from_secs)
            .unwrap_or(CATALOG_TTL);
        Ok(ctx)
    }

    pub fn planner_config(&self) -> PlannerConfig {
        let mut planner =
            PlannerConfig::new(&self.library, self.platform, self.language_version.clone());
        planner.update = self.update;
        planner.strict = self.strict;
        planner.dependencies = self.dependencies;
        planner.packages = self.packages.clone();
        planner
    }

    pub fn build_tool(&self) -> RCommand {
        RCommand::new(&self.r_executable).with_timeout(self.build_timeout.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::layout::SourceVariant;

    fn config() -> Config {
        Config::new("/tmp/lib", "/tmp/cache")
            .with_repository("CRAN", "https://cran.example")
            .with_repository("internal", "/srv/repo")
    }

    #[test]
    fn test_valid_config() {
        config().validate().unwrap();
    }

    #[test]
    fn test_rejects_duplicate_repository() {
        let config = config().with_repository("CRAN", "https://mirror.example");
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_rejects_reserved_repository_name() {
        let config = config().with_repository(LOCAL_SOURCES_REPOSITORY, "/x");
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_rejects_empty_repository_list() {
        let config = Config::new("/tmp/lib", "/tmp/cache");
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_planner_config_carries_flags() {
        let mut config = config();
        config.update = true;
        config.packages.insert(
            "rlang".to_string(),
            PackageSettings {
                dependencies: None,
                force_update: true,
            },
        );

        let planner = config.planner_config();
        assert!(planner.update);
        assert!(!planner.strict);
        assert!(planner.packages["rlang"].force_update);
        assert_eq!(planner.library, PathBuf::from("/tmp/lib"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "repositories": [{"name": "CRAN", "location": "https://cran.example"}],
            "library": "/opt/lib",
            "cache_root": "/var/cache/statpkg",
            "nexus": {
                "default_variant": "source",
                "overrides": {"Rcpp": {"variant": "binary"}}
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.language_version, DEFAULT_LANGUAGE_VERSION);
        assert_eq!(config.r_executable, PathBuf::from("R"));
        assert_eq!(config.platform, Platform::current());
        assert_eq!(
            config.nexus.overrides["Rcpp"].variant,
            Some(SourceVariant::Binary)
        );
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_catalog_ttl_override() {
        let mut config = config();
        config.catalog_ttl = Some(5);
        let ctx = config.fetch_context(&CancelToken::new()).unwrap();
        assert_eq!(ctx.ttl, Duration::from_secs(5));
    }
}
