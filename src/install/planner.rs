// src/install/planner.rs

//! Install planning
//!
//! Turns a set of requested packages into an `InstallPlan`: the resolved
//! dependency layers, what is already in the target library, and for every
//! package whether it is installed, updated or left alone. Planning only
//! reads the filesystem; every error surfaces before anything is changed.

use super::library::{InstalledPackage, scan_library};
use super::sources::ExtraSource;
use crate::error::{Error, MissingPackage, Result};
use crate::nexus::{LOCAL_SOURCES_REPOSITORY, PackageNexus, Resolution};
use crate::repository::layout::{self, Platform, SourceVariant};
use crate::resolver::{DependencyGraphBuilder, DependencyPolicy, Layer, resolve_layers};
use crate::version::PackageVersion;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Per-package planning settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSettings {
    /// Replaces the default dependency policy for this package
    #[serde(default)]
    pub dependencies: Option<DependencyPolicy>,
    /// Update this package when outdated even without update mode
    #[serde(default)]
    pub force_update: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub library: PathBuf,
    /// Replace outdated packages
    #[serde(default)]
    pub update: bool,
    /// Refuse to create a missing library
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub dependencies: DependencyPolicy,
    #[serde(default)]
    pub packages: HashMap<String, PackageSettings>,
    pub platform: Platform,
    pub language_version: String,
}

impl PlannerConfig {
    pub fn new(library: impl Into<PathBuf>, platform: Platform, language_version: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            update: false,
            strict: false,
            dependencies: DependencyPolicy::default(),
            packages: HashMap::new(),
            platform,
            language_version: language_version.into(),
        }
    }
}

/// What the engine does with a planned package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanAction {
    Install,
    Update,
    Skip,
}

impl PlanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanAction::Install => "install",
            PlanAction::Update => "update",
            PlanAction::Skip => "skip",
        }
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a package is part of the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageRelation {
    UserRequested,
    Dependency,
}

impl fmt::Display for PackageRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageRelation::UserRequested => f.write_str("user-requested"),
            PackageRelation::Dependency => f.write_str("dependency"),
        }
    }
}

/// Where the build tool reads a package from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// Archive URL or local archive path
    Archive { url: String },
    /// Unpacked source tree
    Directory { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPackage {
    pub name: String,
    pub version: String,
    pub repository: String,
    pub variant: SourceVariant,
    pub source: PackageSource,
    pub relation: PackageRelation,
    pub action: PlanAction,
    pub installed_version: Option<String>,
}

/// An installed package older than what the repositories offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutdatedPackage {
    pub name: String,
    pub installed: String,
    pub available: String,
    /// Whether the plan replaces it
    pub scheduled: bool,
}

/// Everything one run needs to do
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub requested: Vec<String>,
    /// `name -> direct dependencies` for every package in the run
    pub dependencies: BTreeMap<String, Vec<String>>,
    pub layers: Vec<Layer>,
    pub packages: BTreeMap<String, PlannedPackage>,
    pub outdated: Vec<OutdatedPackage>,
    /// Library contents before the run
    pub installed: BTreeMap<String, InstalledPackage>,
    pub extra_sources: Vec<ExtraSource>,
    pub create_library: bool,
    pub update: bool,
    pub library: PathBuf,
}

impl InstallPlan {
    /// Every package name the run touches or checks
    pub fn universe(&self) -> BTreeSet<String> {
        self.requested
            .iter()
            .chain(self.dependencies.keys())
            .cloned()
            .collect()
    }

    pub fn package(&self, name: &str) -> Option<&PlannedPackage> {
        self.packages.get(name)
    }

    /// Packages absent from the library before the run
    pub fn new_packages(&self) -> Vec<String> {
        self.universe()
            .into_iter()
            .filter(|name| !self.installed.contains_key(name))
            .collect()
    }

    /// Whether the run changes anything at all
    pub fn has_work(&self) -> bool {
        self.packages.values().any(|p| p.action != PlanAction::Skip)
    }
}

/// Builds `InstallPlan`s from an explicit configuration
#[derive(Debug, Clone)]
pub struct InstallPlanner {
    config: PlannerConfig,
}

impl InstallPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan a run for `roots` plus any extra sources
    ///
    /// Extra sources are registered in the nexus ahead of every repository
    /// and are implicitly requested.
    pub fn plan<S: AsRef<str>>(
        &self,
        nexus: &mut PackageNexus,
        roots: &[S],
        extra_sources: Vec<ExtraSource>,
    ) -> Result<InstallPlan> {
        let library = self.config.library.clone();
        let create_library = !library.is_dir();
        if create_library {
            if self.config.strict {
                return Err(Error::Configuration(format!(
                    "library {} does not exist",
                    library.display()
                )));
            }
            info!("Library {} will be created", library.display());
        }

        nexus.add_local_sources(extra_sources.iter().map(|s| s.record.clone()).collect());

        let mut requested: Vec<String> = Vec::new();
        for name in roots
            .iter()
            .map(|r| r.as_ref().to_string())
            .chain(extra_sources.iter().map(|s| s.record.name.clone()))
        {
            if !requested.contains(&name) {
                requested.push(name);
            }
        }

        let batch = nexus.resolve_all(&requested)?;
        if !batch.missing.is_empty() {
            let missing = batch
                .missing
                .iter()
                .map(|name| MissingPackage {
                    name: name.clone(),
                    suggestions: nexus.suggest(name),
                })
                .collect();
            return Err(Error::PackageNotFound(missing));
        }

        let policies = self
            .config
            .packages
            .iter()
            .filter_map(|(name, settings)| settings.dependencies.map(|p| (name.clone(), p)))
            .collect();
        let graph = DependencyGraphBuilder::new(&*nexus)
            .with_default_policy(self.config.dependencies)
            .with_policies(policies)
            .build(&requested)?;
        let layers = resolve_layers(&graph)?;

        let installed = if create_library {
            BTreeMap::new()
        } else {
            scan_library(&library)?
        };

        let mut packages = BTreeMap::new();
        let mut outdated = Vec::new();
        for name in graph.names() {
            let resolution = nexus.resolve(name)?.ok_or_else(|| {
                Error::PackageNotFound(vec![MissingPackage {
                    name: name.to_string(),
                    suggestions: Vec::new(),
                }])
            })?;

            let relation = if requested.iter().any(|r| r == name) {
                PackageRelation::UserRequested
            } else {
                PackageRelation::Dependency
            };

            info!(
                package = name,
                version = %resolution.record.version,
                repository = %resolution.repository,
                relation = %relation,
                variant = %resolution.variant,
                "Resolved package"
            );

            let (action, stale) = self.decide(name, &resolution, installed.get(name));
            if let Some(stale) = stale {
                outdated.push(stale);
            }

            packages.insert(
                name.to_string(),
                PlannedPackage {
                    name: name.to_string(),
                    version: resolution.record.version.clone(),
                    repository: resolution.repository.clone(),
                    variant: resolution.variant,
                    source: self.source_for(&resolution),
                    relation,
                    action,
                    installed_version: installed.get(name).map(|p| p.version.clone()),
                },
            );
        }

        Ok(InstallPlan {
            requested,
            dependencies: graph.dependency_map(),
            layers,
            packages,
            outdated,
            installed,
            extra_sources,
            create_library,
            update: self.config.update,
            library,
        })
    }

    fn decide(
        &self,
        name: &str,
        resolution: &Resolution,
        installed: Option<&InstalledPackage>,
    ) -> (PlanAction, Option<OutdatedPackage>) {
        let Some(installed) = installed else {
            return (PlanAction::Install, None);
        };

        if resolution.repository == LOCAL_SOURCES_REPOSITORY {
            info!(package = name, "Extra source overwrites installed copy");
            return (PlanAction::Update, None);
        }

        if !is_older(&installed.version, &resolution.record.version) {
            debug!("{} {} is current", name, installed.version);
            return (PlanAction::Skip, None);
        }

        let forced = self
            .config
            .packages
            .get(name)
            .is_some_and(|s| s.force_update);
        let scheduled = self.config.update || forced;

        info!(
            package = name,
            installed = %installed.version,
            available = %resolution.record.version,
            "Outdated package"
        );
        if scheduled {
            info!(package = name, forced, "Scheduling update");
        } else {
            warn!(
                "{} {} is outdated ({} available), leaving it in place",
                name, installed.version, resolution.record.version
            );
        }

        let stale = OutdatedPackage {
            name: name.to_string(),
            installed: installed.version.clone(),
            available: resolution.record.version.clone(),
            scheduled,
        };
        let action = if scheduled {
            PlanAction::Update
        } else {
            PlanAction::Skip
        };
        (action, Some(stale))
    }

    fn source_for(&self, resolution: &Resolution) -> PackageSource {
        let record = &resolution.record;
        if let Some(dir) = &record.source_dir {
            return PackageSource::Directory { path: dir.clone() };
        }

        let file = layout::archive_file_name(
            &record.name,
            &record.version,
            resolution.variant,
            self.config.platform,
        );
        let contrib = layout::contrib_location(
            &resolution.location,
            resolution.variant,
            self.config.platform,
            &self.config.language_version,
        )
        .unwrap_or_else(|| format!("{}/src/contrib", resolution.location.trim_end_matches('/')));

        let url = match record.path.as_deref() {
            Some(sub) => format!("{}/{}/{}", contrib, sub.trim_matches('/'), file),
            None => format!("{}/{}", contrib, file),
        };
        PackageSource::Archive { url }
    }
}

fn is_older(installed: &str, available: &str) -> bool {
    match (PackageVersion::parse(installed), PackageVersion::parse(available)) {
        (Ok(a), Ok(b)) => a < b,
        _ => {
            warn!("Cannot compare versions {} and {}", installed, available);
            false
        }
    }
}
