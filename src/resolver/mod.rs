// src/resolver/mod.rs

//! Dependency resolution
//!
//! Builds the transitive dependency graph of a set of root packages and
//! splits it into install layers.

pub mod graph;
pub mod layers;

pub use graph::{
    BASE_PACKAGES, DependencyGraph, DependencyGraphBuilder, DependencyNode, DependencyPolicy,
    PackageLookup,
};
pub use layers::{Layer, resolve_layers};
