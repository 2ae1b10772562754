// src/setup/graph.rs

//! Provider/consumer graph between tasks and its installation order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{McuflowError, Result};
use crate::setup::registry::TaskRegistry;

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone, Default)]
struct TaskNode {
    /// Tasks providing a key this task needs (or optionally uses).
    deps: Vec<String>,
    /// Tasks consuming a key this task provides.
    dependents: Vec<String>,
}

/// Resolved task graph.
///
/// Edges run `provider -> consumer`. Building the graph fails if a key has
/// no provider, has two providers, or the edges form a cycle, so a
/// `TaskGraph` value is always installable.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: BTreeMap<String, TaskNode>,
    edges: BTreeSet<(String, String)>,
    providers: BTreeMap<String, String>,
    order: Vec<String>,
}

impl TaskGraph {
    pub fn build(registry: &TaskRegistry) -> Result<Self> {
        let mut providers: BTreeMap<String, String> = BTreeMap::new();
        for task in registry.tasks() {
            for key in task.provides() {
                if let Some(existing) = providers.get(key) {
                    return Err(McuflowError::AmbiguousProvider {
                        key: key.clone(),
                        first: existing.clone(),
                        second: task.name().to_string(),
                    });
                }
                providers.insert(key.clone(), task.name().to_string());
            }
        }

        let mut nodes: BTreeMap<String, TaskNode> = registry
            .names()
            .map(|name| (name.to_string(), TaskNode::default()))
            .collect();
        let mut edges: BTreeSet<(String, String)> = BTreeSet::new();

        for task in registry.tasks() {
            for key in task.dependencies() {
                let Some(provider) = providers.get(key) else {
                    return Err(McuflowError::UnresolvedDependency {
                        task: task.name().to_string(),
                        key: key.to_string(),
                    });
                };
                edges.insert((provider.clone(), task.name().to_string()));
            }
        }

        for (from, to) in &edges {
            if let Some(node) = nodes.get_mut(to) {
                node.deps.push(from.clone());
            }
            if let Some(node) = nodes.get_mut(from) {
                node.dependents.push(to.clone());
            }
        }

        let order = topological_order(&nodes, &edges)?;

        Ok(Self {
            nodes,
            edges,
            providers,
            order,
        })
    }

    /// Return all task names.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Deduplicated `(provider, consumer)` edges.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.edges.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }

    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    pub fn provider_of(&self, key: &str) -> Option<&str> {
        self.providers.get(key).map(String::as_str)
    }

    /// Every task appears after all tasks providing its dependencies.
    pub fn install_order(&self) -> &[String] {
        &self.order
    }

    /// Graphviz rendering of the graph.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph tasks {\n");
        for name in self.nodes.keys() {
            let _ = writeln!(out, "    \"{name}\";");
        }
        for (from, to) in &self.edges {
            let _ = writeln!(out, "    \"{from}\" -> \"{to}\";");
        }
        out.push_str("}\n");
        out
    }
}

fn topological_order(
    nodes: &BTreeMap<String, TaskNode>,
    edges: &BTreeSet<(String, String)>,
) -> Result<Vec<String>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in nodes.keys() {
        graph.add_node(name.as_str());
    }
    for (from, to) in edges {
        graph.add_edge(from.as_str(), to.as_str(), ());
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(cycle) => Err(McuflowError::DagCycle(format!(
            "cycle detected in task graph involving task '{}'",
            cycle.node_id()
        ))),
    }
}
