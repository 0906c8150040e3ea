// src/resolver/layers.rs

use super::graph::DependencyGraph;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Packages that can be installed concurrently
pub type Layer = Vec<String>;

/// Split a graph into dependency layers (Kahn's algorithm)
///
/// Every package lands in a later layer than all of its dependencies. Layers
/// are sorted by name. A cycle yields `CircularDependency` with the nodes that
/// could not be placed and no partial layering.
pub fn resolve_layers(graph: &DependencyGraph) -> Result<Vec<Layer>> {
    let mut unresolved: BTreeMap<&str, BTreeSet<&str>> = graph
        .nodes()
        .map(|node| {
            let deps = node
                .edges
                .iter()
                .map(String::as_str)
                .filter(|dep| graph.contains(dep))
                .collect();
            (node.name.as_str(), deps)
        })
        .collect();

    let mut layers = Vec::new();
    while !unresolved.is_empty() {
        let ready: Vec<&str> = unresolved
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();

        if ready.is_empty() {
            let remaining: Vec<String> = unresolved.keys().map(|n| n.to_string()).collect();
            return Err(Error::CircularDependency(remaining));
        }

        for name in &ready {
            unresolved.remove(name);
        }
        for deps in unresolved.values_mut() {
            for name in &ready {
                deps.remove(name);
            }
        }

        debug!("Layer {}: {}", layers.len(), ready.join(", "));
        layers.push(ready.into_iter().map(str::to_string).collect());
    }

    Ok(layers)
}
