// src/packages/mod.rs

//! Package metadata records
//!
//! A `PackageRecord` is one catalog entry (or one installed `DESCRIPTION`)
//! with its dependencies split by relation kind.

pub mod description;

use crate::version::{PackageVersion, VersionConstraint};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub use description::{parse_catalog, parse_dependency_list, parse_description};

/// Kind of relation between a package and one of its dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Relation {
    /// `Depends`: required at load time
    Depends,
    /// `Imports`: required namespace imports
    Imports,
    /// `LinkingTo`: headers needed at compile time
    LinkingTo,
    /// `Suggests`: optional
    Suggests,
}

impl Relation {
    /// Field name in catalog records
    pub fn field_name(&self) -> &'static str {
        match self {
            Relation::Depends => "Depends",
            Relation::Imports => "Imports",
            Relation::LinkingTo => "LinkingTo",
            Relation::Suggests => "Suggests",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field_name())
    }
}

/// One entry of a dependency field, e.g. `Rcpp (>= 1.0.0)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    pub constraint: Option<VersionConstraint>,
}

impl DependencySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: None,
        }
    }

    pub fn versioned(name: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self {
            name: name.into(),
            constraint: Some(constraint),
        }
    }
}

/// Parsed metadata for one package version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub depends: Vec<DependencySpec>,
    #[serde(default)]
    pub imports: Vec<DependencySpec>,
    #[serde(default)]
    pub linking_to: Vec<DependencySpec>,
    #[serde(default)]
    pub suggests: Vec<DependencySpec>,
    /// Sub-directory of the archive relative to the catalog (`Path` field)
    #[serde(default)]
    pub path: Option<String>,
    /// Unpacked source directory, set for local tarball sources only
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
}

impl PackageRecord {
    /// Create a record with no dependencies
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            depends: Vec::new(),
            imports: Vec::new(),
            linking_to: Vec::new(),
            suggests: Vec::new(),
            path: None,
            source_dir: None,
        }
    }

    /// Builder-style helper used by catalogs assembled in code
    pub fn with_dependencies(mut self, relation: Relation, names: &[&str]) -> Self {
        let deps = names.iter().map(|n| DependencySpec::new(*n));
        self.dependencies_mut(relation).extend(deps);
        self
    }

    pub fn dependencies(&self, relation: Relation) -> &[DependencySpec] {
        match relation {
            Relation::Depends => &self.depends,
            Relation::Imports => &self.imports,
            Relation::LinkingTo => &self.linking_to,
            Relation::Suggests => &self.suggests,
        }
    }

    fn dependencies_mut(&mut self, relation: Relation) -> &mut Vec<DependencySpec> {
        match relation {
            Relation::Depends => &mut self.depends,
            Relation::Imports => &mut self.imports,
            Relation::LinkingTo => &mut self.linking_to,
            Relation::Suggests => &mut self.suggests,
        }
    }

    pub fn parsed_version(&self) -> crate::Result<PackageVersion> {
        PackageVersion::parse(&self.version)
    }
}
