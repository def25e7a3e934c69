//! Resource dependency graph.
//!
//! Turns a [`Program`] into a directed acyclic graph whose edges point from a
//! dependency to its dependent, and yields a stable topological order: ties
//! between independent resources are broken by declaration order.

use petgraph::Direction;
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::GraphError;
use crate::state::StackState;

use super::builder::Program;

/// A validated resource dependency graph.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    /// The underlying directed graph (edge: dependency -> dependent).
    graph: DiGraph<String, ()>,

    /// Map from resource name to node index.
    node_map: HashMap<String, NodeIndex>,
}

impl ResourceGraph {
    /// Builds the graph of a program.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate names, references to undeclared
    /// resources (from resources or exports) and reference cycles.
    pub fn build(program: &Program) -> Result<Self, GraphError> {
        let mut graph = Self::default();

        for resource in program.resources() {
            if graph.node_map.contains_key(&resource.name) {
                return Err(GraphError::DuplicateResource {
                    name: resource.name.clone(),
                });
            }
            graph.add_node(&resource.name);
        }

        for resource in program.resources() {
            let dependent = graph.node_map[&resource.name];
            for reference in &resource.depends_on {
                let dependency = graph.node_map.get(reference).copied().ok_or_else(|| {
                    GraphError::UndeclaredReference {
                        resource: resource.name.clone(),
                        reference: reference.clone(),
                    }
                })?;
                graph.graph.update_edge(dependency, dependent, ());
            }
        }

        for (name, export) in program.exports() {
            if let Some(reference) = export.resource() {
                if !graph.node_map.contains_key(reference) {
                    return Err(GraphError::UndeclaredReference {
                        resource: format!("output '{name}'"),
                        reference: reference.to_string(),
                    });
                }
            }
        }

        if is_cyclic_directed(&graph.graph) {
            return Err(GraphError::CyclicReference {
                cycle: graph.describe_cycle(),
            });
        }

        Ok(graph)
    }

    /// Rebuilds the graph recorded in a stack state.
    ///
    /// Dependencies on resources missing from the state are ignored. Nodes
    /// are added in name order, so ties are broken alphabetically.
    #[must_use]
    pub fn from_state(state: &StackState) -> Self {
        let mut graph = Self::default();

        for name in state.resources.keys() {
            graph.add_node(name);
        }

        for resource in state.resources.values() {
            let dependent = graph.node_map[&resource.name];
            for reference in &resource.depends_on {
                if let Some(&dependency) = graph.node_map.get(reference) {
                    graph.graph.update_edge(dependency, dependent, ());
                }
            }
        }

        graph
    }

    fn add_node(&mut self, name: &str) {
        let idx = self.graph.add_node(name.to_string());
        self.node_map.insert(name.to_string(), idx);
    }

    /// Returns resource names so that every dependency precedes its
    /// dependents. Independent resources keep declaration order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        let mut emitted = vec![false; self.graph.node_count()];

        while let Some(Reverse(i)) = ready.pop() {
            let idx = NodeIndex::new(i);
            order.push(self.graph[idx].clone());
            emitted[i] = true;

            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                let degree = &mut in_degree[next.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }

        // Only reachable for graphs rebuilt from a damaged state.
        for (i, done) in emitted.iter().enumerate() {
            if !done {
                order.push(self.graph[NodeIndex::new(i)].clone());
            }
        }

        order
    }

    /// Returns resource names so that every dependent precedes its
    /// dependencies.
    #[must_use]
    pub fn reverse_topological_order(&self) -> Vec<String> {
        let mut order = self.topological_order();
        order.reverse();
        order
    }

    /// Returns the direct dependencies of a resource, in declaration order.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Returns the direct dependents of a resource, in declaration order.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.node_map.get(name) else {
            return Vec::new();
        };

        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        neighbors.sort();
        neighbors.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// Returns true if the graph contains the resource.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.node_map.contains_key(name)
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Renders one cycle of the graph as `a -> b -> a`.
    fn describe_cycle(&self) -> String {
        let component = tarjan_scc(&self.graph).into_iter().find(|scc| {
            scc.len() > 1 || scc.first().is_some_and(|&n| self.graph.contains_edge(n, n))
        });

        let Some(component) = component else {
            return String::new();
        };

        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let Some(&start) = component.iter().min() else {
            return String::new();
        };

        let mut path = vec![start];
        let mut visited = HashSet::from([start]);
        if !self.walk_back(start, start, &members, &mut visited, &mut path) {
            path = component;
        }

        path.iter()
            .map(|&n| self.graph[n].as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    fn walk_back(
        &self,
        node: NodeIndex,
        start: NodeIndex,
        members: &HashSet<NodeIndex>,
        visited: &mut HashSet<NodeIndex>,
        path: &mut Vec<NodeIndex>,
    ) -> bool {
        let mut next_nodes: Vec<NodeIndex> =
            self.graph.neighbors_directed(node, Direction::Outgoing).collect();
        next_nodes.sort();

        for next in next_nodes {
            if next == start {
                path.push(start);
                return true;
            }
            if members.contains(&next) && visited.insert(next) {
                path.push(next);
                if self.walk_back(next, start, members, visited, path) {
                    return true;
                }
                path.pop();
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ResourceDefinition;
    use crate::state::{ResourceState, StackRef};
    use serde_json::json;

    fn def(name: &str, deps: &[&str]) -> ResourceDefinition {
        let mut d = ResourceDefinition::new(name, "test:Thing");
        d.depends_on = deps.iter().map(|s| (*s).to_string()).collect();
        d
    }

    fn program(defs: Vec<ResourceDefinition>) -> Program {
        let mut p = Program::new();
        for d in defs {
            p.resource(d);
        }
        p
    }

    #[test]
    fn test_order_respects_dependencies() {
        let p = program(vec![def("app", &["db", "cache"]), def("db", &[]), def("cache", &[])]);
        let graph = ResourceGraph::build(&p).unwrap();

        assert_eq!(graph.topological_order(), vec!["db", "cache", "app"]);
        assert_eq!(graph.reverse_topological_order(), vec!["app", "cache", "db"]);
        assert_eq!(graph.dependencies("app"), vec!["db", "cache"]);
        assert_eq!(graph.dependents("db"), vec!["app"]);
    }

    #[test]
    fn test_independent_resources_keep_declaration_order() {
        let p = program(vec![def("z", &[]), def("a", &[]), def("m", &[])]);
        let graph = ResourceGraph::build(&p).unwrap();
        assert_eq!(graph.topological_order(), vec!["z", "a", "m"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let p = program(vec![def("a", &["b"]), def("b", &["a"])]);
        let err = ResourceGraph::build(&p).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicReference {
                cycle: String::from("a -> b -> a")
            }
        );
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let p = program(vec![def("a", &["a"])]);
        let err = ResourceGraph::build(&p).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicReference {
                cycle: String::from("a -> a")
            }
        );
    }

    #[test]
    fn test_undeclared_reference() {
        let p = program(vec![def("a", &["ghost"])]);
        let err = ResourceGraph::build(&p).unwrap_err();
        assert!(matches!(err, GraphError::UndeclaredReference { ref reference, .. } if reference == "ghost"));
    }

    #[test]
    fn test_export_of_undeclared_resource() {
        let mut p = program(vec![def("a", &[])]);
        p.export("url", crate::program::ExportValue::Output {
            resource: String::from("b"),
            path: String::from("/url"),
        });
        assert!(matches!(
            ResourceGraph::build(&p),
            Err(GraphError::UndeclaredReference { .. })
        ));
    }

    #[test]
    fn test_duplicate_name() {
        let p = program(vec![def("a", &[]), def("a", &[])]);
        assert_eq!(
            ResourceGraph::build(&p).unwrap_err(),
            GraphError::DuplicateResource {
                name: String::from("a")
            }
        );
    }

    #[test]
    fn test_from_state_ignores_missing_dependencies() {
        let mut state = StackState::new(&StackRef::new("p", "s"));
        let mut b = ResourceState::new("b", "t", "id-b", json!({}), "h");
        b.depends_on = vec![String::from("a"), String::from("gone")];
        state.set_resource(b);
        state.set_resource(ResourceState::new("a", "t", "id-a", json!({}), "h"));

        let graph = ResourceGraph::from_state(&state);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.topological_order(), vec!["a", "b"]);
    }
}
