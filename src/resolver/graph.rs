// src/resolver/graph.rs

//! Dependency graph construction
//!
//! Expands a set of root packages into the full transitive graph using the
//! nexus. Edges only ever come from enabled hard relations; suggested
//! packages are pulled in as nodes without edges so that a suggestion cycle
//! can never become a dependency cycle.

use crate::error::{Error, MissingPackage, Result};
use crate::nexus::{PackageNexus, Resolution};
use crate::packages::{DependencySpec, Relation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Packages shipped with the language itself, never installed by statpkg
pub const BASE_PACKAGES: &[&str] = &[
    "R",
    "base",
    "compiler",
    "datasets",
    "graphics",
    "grDevices",
    "grid",
    "methods",
    "parallel",
    "splines",
    "stats",
    "stats4",
    "tcltk",
    "tools",
    "utils",
];

/// Which relation kinds become graph edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyPolicy {
    pub depends: bool,
    pub imports: bool,
    pub linking_to: bool,
    pub suggests: bool,
}

impl Default for DependencyPolicy {
    fn default() -> Self {
        Self {
            depends: true,
            imports: true,
            linking_to: true,
            suggests: false,
        }
    }
}

impl DependencyPolicy {
    /// Default policy with suggested packages included
    pub fn with_suggests() -> Self {
        Self {
            suggests: true,
            ..Self::default()
        }
    }

    pub fn includes(&self, relation: Relation) -> bool {
        match relation {
            Relation::Depends => self.depends,
            Relation::Imports => self.imports,
            Relation::LinkingTo => self.linking_to,
            Relation::Suggests => self.suggests,
        }
    }
}

/// A package and the names it directly depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    pub name: String,
    pub edges: Vec<String>,
}

impl DependencyNode {
    pub fn new(name: impl Into<String>, edges: Vec<String>) -> Self {
        Self {
            name: name.into(),
            edges,
        }
    }
}

/// Mapping of package name to node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, DependencyNode>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from `(name, direct dependencies)` pairs
    pub fn from_edges(edges: &[(&str, &[&str])]) -> Self {
        let mut graph = Self::new();
        for (name, deps) in edges {
            graph.insert(DependencyNode::new(
                *name,
                deps.iter().map(|d| d.to_string()).collect(),
            ));
        }
        graph
    }

    /// Insert a node; returns false if the name was already present
    pub fn insert(&mut self, node: DependencyNode) -> bool {
        if self.nodes.contains_key(&node.name) {
            return false;
        }
        self.nodes.insert(node.name.clone(), node);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&DependencyNode> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.nodes.keys().map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> + '_ {
        self.nodes.values()
    }

    /// `name -> direct dependencies`
    pub fn dependency_map(&self) -> BTreeMap<String, Vec<String>> {
        self.nodes
            .values()
            .map(|n| (n.name.clone(), n.edges.clone()))
            .collect()
    }
}

/// Package lookups the graph builder relies on
pub trait PackageLookup {
    /// Whether any repository lists `name`, ignoring pins and variants
    fn contains(&self, name: &str) -> bool;

    /// Resolve `name` honouring pins and variants
    fn resolve(&self, name: &str) -> Result<Option<Resolution>>;

    fn suggest(&self, name: &str) -> Vec<String>;
}

impl PackageLookup for PackageNexus {
    fn contains(&self, name: &str) -> bool {
        PackageNexus::contains(self, name)
    }

    fn resolve(&self, name: &str) -> Result<Option<Resolution>> {
        PackageNexus::resolve(self, name)
    }

    fn suggest(&self, name: &str) -> Vec<String> {
        PackageNexus::suggest(self, name)
    }
}

/// Expands root packages into a `DependencyGraph`
#[derive(Debug)]
pub struct DependencyGraphBuilder<'a, L: PackageLookup = PackageNexus> {
    nexus: &'a L,
    default_policy: DependencyPolicy,
    policies: HashMap<String, DependencyPolicy>,
    base_packages: HashSet<String>,
}

impl<'a, L: PackageLookup> DependencyGraphBuilder<'a, L> {
    pub fn new(nexus: &'a L) -> Self {
        Self {
            nexus,
            default_policy: DependencyPolicy::default(),
            policies: HashMap::new(),
            base_packages: BASE_PACKAGES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_default_policy(mut self, policy: DependencyPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Per-package policies, replacing the default for those packages
    pub fn with_policies(mut self, policies: HashMap<String, DependencyPolicy>) -> Self {
        self.policies = policies;
        self
    }

    fn policy_for(&self, name: &str) -> DependencyPolicy {
        self.policies.get(name).copied().unwrap_or(self.default_policy)
    }

    /// Expand every root into one graph
    ///
    /// Fails with `PackageNotFound` when a root, or a dependency some
    /// repository lists, cannot be resolved under the configured pins and
    /// variants.
    pub fn build<S: AsRef<str>>(&self, roots: &[S]) -> Result<DependencyGraph> {
        let mut missing = Vec::new();
        for name in roots.iter().map(AsRef::as_ref) {
            if self.nexus.resolve(name)?.is_none() {
                missing.push(MissingPackage {
                    name: name.to_string(),
                    suggestions: self.nexus.suggest(name),
                });
            }
        }
        if !missing.is_empty() {
            return Err(Error::PackageNotFound(missing));
        }

        let mut graph = DependencyGraph::new();
        for root in roots {
            self.expand(root.as_ref(), &mut graph)?;
        }

        debug!("Dependency graph holds {} packages", graph.len());
        Ok(graph)
    }

    fn expand(&self, name: &str, graph: &mut DependencyGraph) -> Result<()> {
        if graph.contains(name) {
            return Ok(());
        }

        let resolution = self.nexus.resolve(name)?.ok_or_else(|| unresolvable(name))?;
        let record = &resolution.record;
        let policy = self.policy_for(name);

        let mut edges: Vec<String> = Vec::new();
        for relation in [Relation::Depends, Relation::Imports, Relation::LinkingTo] {
            if !policy.includes(relation) {
                continue;
            }
            for dep in record.dependencies(relation) {
                if edges.contains(&dep.name) {
                    continue;
                }
                if let Some(target) = self.kept_target(name, &dep.name)? {
                    self.check_constraint(name, dep, &target);
                    edges.push(dep.name.clone());
                }
            }
        }

        let mut suggested: Vec<String> = Vec::new();
        if policy.includes(Relation::Suggests) {
            for dep in record.dependencies(Relation::Suggests) {
                if edges.contains(&dep.name) || suggested.contains(&dep.name) {
                    continue;
                }
                if self.kept_target(name, &dep.name)?.is_some() {
                    suggested.push(dep.name.clone());
                }
            }
        }

        let inserted = graph.insert(DependencyNode::new(name, edges.clone()));
        debug_assert!(inserted, "{} expanded twice", name);

        for target in edges.iter().chain(suggested.iter()) {
            if !graph.contains(target) {
                self.expand(target, graph)?;
            }
        }

        Ok(())
    }

    /// Resolve a dependency target worth keeping
    ///
    /// Base packages and names no repository lists are dropped. A name some
    /// repository lists but that does not resolve (pinned elsewhere, or only
    /// offered as another variant) is an error.
    fn kept_target(&self, parent: &str, target: &str) -> Result<Option<Resolution>> {
        if self.base_packages.contains(target) {
            return Ok(None);
        }
        if !self.nexus.contains(target) {
            warn!("{} needs {}, which no repository provides", parent, target);
            return Ok(None);
        }
        match self.nexus.resolve(target)? {
            Some(resolution) => Ok(Some(resolution)),
            None => Err(unresolvable(target)),
        }
    }

    fn check_constraint(&self, parent: &str, dep: &DependencySpec, target: &Resolution) {
        let Some(constraint) = &dep.constraint else {
            return;
        };

        match target.record.parsed_version() {
            Ok(version) if !constraint.matches(&version) => warn!(
                "{} requires {} ({}) but {} provides {}",
                parent, dep.name, constraint, target.repository, version
            ),
            Ok(_) => {}
            Err(e) => debug!("Cannot compare version of {}: {}", dep.name, e),
        }
    }
}

fn unresolvable(name: &str) -> Error {
    Error::PackageNotFound(vec![MissingPackage {
        name: name.to_string(),
        suggestions: Vec::new(),
    }])
}
