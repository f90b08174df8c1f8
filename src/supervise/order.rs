// src/supervise/order.rs

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::SupervisorError;

/// Internal node structure: stores immediate dependencies.
#[derive(Debug, Clone)]
struct Node {
    /// Direct dependencies: services that must be Running before this one
    /// starts.
    deps: Vec<String>,
}

/// Dependency graph over the registered services, keyed by service id.
///
/// Built once at registration; [`DependencyGraph::new`] fails with
/// `CyclicDependency` if the `depends_on` relation has a cycle, so every
/// constructed graph has a valid topological order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<String, Node>,
    /// Topological order: dependencies before dependents.
    start_order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph from `(id, depends_on)` pairs.
    ///
    /// Unknown dependency references are ignored here; config validation
    /// rejects them before a supervisor is ever constructed.
    pub fn new<'a, I>(services: I) -> Result<Self, SupervisorError>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let mut nodes: HashMap<String, Node> = HashMap::new();

        for (id, deps) in services {
            nodes.insert(id.to_string(), Node { deps: deps.to_vec() });
        }

        let start_order = topological_order(&nodes)?;

        Ok(Self { nodes, start_order })
    }

    /// Service ids in start order: every dependency before its dependents.
    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    /// Service ids in stop order: every dependent before its dependencies.
    pub fn stop_order(&self) -> Vec<String> {
        self.start_order.iter().rev().cloned().collect()
    }

    /// Immediate dependencies of a service.
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.nodes.get(id).map(|n| n.deps.as_slice()).unwrap_or(&[])
    }
}

fn topological_order(nodes: &HashMap<String, Node>) -> Result<Vec<String>, SupervisorError> {
    // Edge direction: dependency -> dependent, so toposort yields
    // dependencies first.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for id in nodes.keys() {
        graph.add_node(id.as_str());
    }

    for (id, node) in nodes.iter() {
        for dep in node.deps.iter() {
            if nodes.contains_key(dep) {
                graph.add_edge(dep.as_str(), id.as_str(), ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(|s| s.to_string()).collect()),
        Err(cycle) => Err(SupervisorError::CyclicDependency(
            cycle.node_id().to_string(),
        )),
    }
}
