//! Dependency graph over the resources of a Bundle
//!
//! Vertices are resource names interned to integer ids; edges express
//! "consumer depends on producer" and come from reference declarations. The
//! graph is rebuilt per reconciliation pass, so it is a flat arena of names
//! plus integer adjacency lists rather than a pointer structure.
//!
//! The topological order puts producers strictly before consumers and breaks
//! ties lexically by name, so a given spec always reconciles in the same
//! order regardless of map iteration order upstream.

use std::collections::{BTreeSet, HashMap};

use crate::crd::{Resource, ResourceName};
use crate::Error;

/// Dependency graph of one Bundle's resources
#[derive(Debug, Default)]
pub struct ResourceGraph {
    /// Vertex arena; the index is the vertex id
    names: Vec<ResourceName>,
    /// Interning table: name -> id
    index: HashMap<ResourceName, usize>,
    /// Adjacency: consumer id -> producer ids
    dependencies: Vec<Vec<usize>>,
}

impl ResourceGraph {
    /// Create an empty graph with room for `capacity` vertices
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            names: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            dependencies: Vec::with_capacity(capacity),
        }
    }

    /// Number of vertices
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the graph has no vertices
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Add a vertex, returning its id. Adding an existing name is a no-op.
    pub fn add_vertex(&mut self, name: impl Into<ResourceName>) -> usize {
        let name = name.into();
        if let Some(&id) = self.index.get(&name) {
            return id;
        }
        let id = self.names.len();
        self.index.insert(name.clone(), id);
        self.names.push(name);
        self.dependencies.push(Vec::new());
        id
    }

    /// Add a "consumer depends on producer" edge between existing vertices.
    ///
    /// Referencing a name that was never added is fatal for the bundle.
    pub fn add_edge(&mut self, consumer: &str, producer: &str) -> Result<(), Error> {
        let &consumer_id = self.index.get(consumer).ok_or_else(|| {
            Error::invalid_spec(format!("resource {consumer:?} is not part of the bundle"))
        })?;
        let &producer_id = self.index.get(producer).ok_or_else(|| {
            Error::invalid_spec(format!(
                "resource {consumer:?} references unknown resource {producer:?}"
            ))
        })?;
        let deps = &mut self.dependencies[consumer_id];
        if !deps.contains(&producer_id) {
            deps.push(producer_id);
        }
        Ok(())
    }

    /// Topological order of the vertices: every producer precedes all of its
    /// consumers, ties broken lexically by name.
    pub fn topological_sort(&self) -> Result<Vec<ResourceName>, Error> {
        let n = self.names.len();

        // Reverse adjacency: producer id -> consumer ids
        let mut dependents = vec![Vec::new(); n];
        for (consumer, deps) in self.dependencies.iter().enumerate() {
            for &producer in deps {
                dependents[producer].push(consumer);
            }
        }

        // Unsatisfied producer count per consumer
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();

        // Ordered frontier keyed by name for deterministic tie-breaking
        let mut ready: BTreeSet<(&str, usize)> = (0..n)
            .filter(|&id| remaining[id] == 0)
            .map(|id| (self.names[id].as_str(), id))
            .collect();

        let mut sorted = Vec::with_capacity(n);
        while let Some((_, id)) = ready.pop_first() {
            sorted.push(self.names[id].clone());
            for &consumer in &dependents[id] {
                remaining[consumer] -= 1;
                if remaining[consumer] == 0 {
                    ready.insert((self.names[consumer].as_str(), consumer));
                }
            }
        }

        if sorted.len() != n {
            let cycle = self.cycle_participants(&remaining);
            return Err(Error::invalid_spec(format!(
                "dependency cycle between resources: {}",
                cycle.join(" -> ")
            )));
        }
        Ok(sorted)
    }

    /// Extract one cycle from the vertices left unresolved after Kahn's
    /// algorithm, for the error message. Starts at the lexically smallest
    /// unresolved vertex and always follows the lexically smallest unresolved
    /// dependency, so the reported cycle is stable.
    fn cycle_participants(&self, remaining: &[usize]) -> Vec<ResourceName> {
        let alive: Vec<bool> = remaining.iter().map(|&r| r > 0).collect();
        let start = (0..self.names.len())
            .filter(|&id| alive[id])
            .min_by(|&a, &b| self.names[a].cmp(&self.names[b]))
            .expect("cycle extraction requires an unresolved vertex");

        let mut stack: Vec<usize> = Vec::new();
        let mut position: HashMap<usize, usize> = HashMap::new();
        let mut vertex = start;
        loop {
            if let Some(&pos) = position.get(&vertex) {
                return stack[pos..].iter().map(|&id| self.names[id].clone()).collect();
            }
            position.insert(vertex, stack.len());
            stack.push(vertex);
            // An unresolved vertex always has an unresolved dependency,
            // otherwise it would have entered the frontier.
            vertex = self.dependencies[vertex]
                .iter()
                .copied()
                .filter(|&d| alive[d])
                .min_by(|&a, &b| self.names[a].cmp(&self.names[b]))
                .expect("unresolved vertex has an unresolved dependency");
        }
    }
}

/// Build the graph for a bundle's resources and return their topological
/// order. Fails on a reference to a name outside the bundle or on a cycle.
pub fn sort_resources(resources: &[Resource]) -> Result<Vec<ResourceName>, Error> {
    let mut graph = ResourceGraph::with_capacity(resources.len());
    for res in resources {
        graph.add_vertex(res.name.clone());
    }
    for res in resources {
        for reference in &res.references {
            graph.add_edge(&res.name, &reference.resource)?;
        }
    }
    graph.topological_sort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Reference;

    fn resource(name: &str, refs: &[&str]) -> Resource {
        Resource {
            name: name.to_string(),
            references: refs
                .iter()
                .map(|r| Reference {
                    resource: r.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_linear_chain_sorts_producers_first() {
        // c -> b -> a declared out of order
        let resources = vec![
            resource("c", &["b"]),
            resource("a", &[]),
            resource("b", &["a"]),
        ];
        let sorted = sort_resources(&resources).unwrap();
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_independent_resources_sort_lexically() {
        let resources = vec![
            resource("zeta", &[]),
            resource("alpha", &[]),
            resource("mid", &[]),
        ];
        let sorted = sort_resources(&resources).unwrap();
        assert_eq!(sorted, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_diamond_orders_every_producer_before_consumers() {
        let resources = vec![
            resource("sink", &["left", "right"]),
            resource("left", &["src"]),
            resource("right", &["src"]),
            resource("src", &[]),
        ];
        let sorted = sort_resources(&resources).unwrap();
        let pos = |n: &str| sorted.iter().position(|s| s == n).unwrap();
        assert!(pos("src") < pos("left"));
        assert!(pos("src") < pos("right"));
        assert!(pos("left") < pos("sink"));
        assert!(pos("right") < pos("sink"));
        // Equal-rank vertices break ties lexically
        assert!(pos("left") < pos("right"));
    }

    #[test]
    fn test_cycle_is_fatal_and_names_participants() {
        let resources = vec![resource("a", &["b"]), resource("b", &["a"])];
        let err = sort_resources(&resources).unwrap_err();
        assert!(!err.is_retriable());
        let msg = err.to_string();
        assert!(msg.contains("dependency cycle"), "got: {msg}");
        assert!(msg.contains("a -> b") || msg.contains("b -> a"), "got: {msg}");
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let resources = vec![resource("a", &["a"])];
        let err = sort_resources(&resources).unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn test_unknown_reference_is_fatal() {
        let resources = vec![resource("a", &["ghost"])];
        let err = sort_resources(&resources).unwrap_err();
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_edges_do_not_break_the_sort() {
        let mut graph = ResourceGraph::with_capacity(2);
        graph.add_vertex("a");
        graph.add_vertex("b");
        graph.add_edge("b", "a").unwrap();
        graph.add_edge("b", "a").unwrap();
        assert_eq!(graph.topological_sort().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_sort_is_stable_across_declaration_orders() {
        let forward = vec![
            resource("a", &[]),
            resource("b", &["a"]),
            resource("x", &[]),
        ];
        let reversed = vec![
            resource("x", &[]),
            resource("b", &["a"]),
            resource("a", &[]),
        ];
        assert_eq!(
            sort_resources(&forward).unwrap(),
            sort_resources(&reversed).unwrap()
        );
    }

    #[test]
    fn test_empty_graph_sorts_empty() {
        assert!(sort_resources(&[]).unwrap().is_empty());
        assert!(ResourceGraph::default().is_empty());
    }
}
