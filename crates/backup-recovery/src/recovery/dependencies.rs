//! Component dependency graph and restore ordering

use crate::error::{BackupRecoveryError, BackupRecoveryResult};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Dependency graph over the components of one backup.
///
/// Edges point from a dependent to the components it depends on. Node order
/// is the order components were added, which breaks ties in the restore
/// order so equal inputs always plan the same way.
#[derive(Debug, Clone, Default)]
pub struct ComponentGraph {
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    edges: BTreeMap<usize, BTreeSet<usize>>,
}

impl ComponentGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph of `components` with the declared dependencies that stay inside
    /// the set. Dependencies on components outside it are returned as
    /// `(dependent, dependency)` pairs.
    pub fn build(
        components: &[String],
        dependencies: &BTreeMap<String, Vec<String>>,
    ) -> (Self, Vec<(String, String)>) {
        let mut graph = Self::new();
        for component in components {
            graph.add_component(component);
        }

        let mut external = Vec::new();
        for component in components {
            for dependency in dependencies.get(component).into_iter().flatten() {
                if graph.contains(dependency) {
                    graph.add_dependency(component, dependency);
                } else {
                    external.push((component.clone(), dependency.clone()));
                }
            }
        }
        (graph, external)
    }

    /// Add a component with no edges
    pub fn add_component(&mut self, name: &str) {
        if self.index.contains_key(name) {
            return;
        }
        self.index.insert(name.to_string(), self.nodes.len());
        self.nodes.push(name.to_string());
    }

    /// `dependent` must be restored after `dependency`
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) {
        self.add_component(dependent);
        self.add_component(dependency);
        let (from, to) = (self.index[dependent], self.index[dependency]);
        self.edges.entry(from).or_default().insert(to);
    }

    /// Whether `name` is in the graph
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no components
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// One dependency cycle, if any, as a closed path
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        for node in 0..self.nodes.len() {
            if !visited.contains(&node) {
                if let Some(cycle) = self.find_cycle_from(node, &mut visited, &mut stack) {
                    return Some(cycle.into_iter().map(|i| self.nodes[i].clone()).collect());
                }
            }
        }
        None
    }

    fn find_cycle_from(
        &self,
        node: usize,
        visited: &mut HashSet<usize>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        visited.insert(node);
        stack.push(node);

        for &next in self.edges.get(&node).into_iter().flatten() {
            if let Some(position) = stack.iter().position(|&n| n == next) {
                let mut cycle = stack[position..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            if !visited.contains(&next) {
                if let Some(cycle) = self.find_cycle_from(next, visited, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        None
    }

    /// Every component, dependencies first (Kahn's algorithm, ties broken by
    /// insertion order)
    pub fn restore_order(&self) -> BackupRecoveryResult<Vec<String>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(BackupRecoveryError::Plan {
                reason: format!("dependency cycle: {}", cycle.join(" -> ")),
            });
        }

        let mut remaining: Vec<usize> = (0..self.nodes.len())
            .map(|node| self.edges.get(&node).map_or(0, BTreeSet::len))
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (&dependent, dependencies) in &self.edges {
            for &dependency in dependencies {
                dependents[dependency].push(dependent);
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.nodes.len())
            .filter(|&node| remaining[node] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = ready.pop_first() {
            order.push(self.nodes[node].clone());
            for &dependent in &dependents[node] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(BackupRecoveryError::Plan {
                reason: "failed to resolve all dependencies".to_string(),
            });
        }
        Ok(order)
    }

    /// Everything `name` depends on, directly or not, sorted
    pub fn transitive_dependencies(&self, name: &str) -> Vec<String> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut pending = vec![start];
        while let Some(node) = pending.pop() {
            for &next in self.edges.get(&node).into_iter().flatten() {
                if seen.insert(next) {
                    pending.push(next);
                }
            }
        }
        seen.remove(&start);

        let mut names: Vec<String> = seen.into_iter().map(|i| self.nodes[i].clone()).collect();
        names.sort();
        names
    }
}
