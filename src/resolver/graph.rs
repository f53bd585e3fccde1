//! Dependency graph
//!
//! Arena-backed directed graph: nodes own no references to each other,
//! only stable indices. Reverse edges are the incoming direction of the
//! same arena, so the transpose invariant holds by construction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::core::{MortarError, MortarResult};
use crate::resolver::version::{satisfies_all, VersionConstraint};

/// Where a node is in its resolution lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    Unresolved,
    Resolving,
    Resolved,
    Failed,
}

/// One resolved package in the graph.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub name: String,
    pub version: String,
    /// Constraints this node declares on its children, by child name.
    pub constraints: HashMap<String, String>,
    pub status: ResolutionStatus,
}

/// Name-indexed dependency graph plus the project's root set.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<DependencyNode, ()>,
    nodes: HashMap<String, NodeIndex>,
    roots: Vec<String>,
    /// Constraints the project itself declares on its direct dependencies.
    root_constraints: HashMap<String, String>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&DependencyNode> {
        self.nodes.get(name).map(|&idx| &self.graph[idx])
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn packages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Insert a package node; an existing node keeps its state.
    pub fn add_package(&mut self, name: &str, version: &str) {
        if self.nodes.contains_key(name) {
            return;
        }
        let idx = self.graph.add_node(DependencyNode {
            name: name.to_string(),
            version: version.to_string(),
            constraints: HashMap::new(),
            status: ResolutionStatus::Unresolved,
        });
        self.nodes.insert(name.to_string(), idx);
    }

    /// Mark a package as a direct dependency of the project.
    pub fn add_root(&mut self, name: &str, constraint: &str) {
        if !self.roots.iter().any(|r| r == name) {
            self.roots.push(name.to_string());
        }
        self.root_constraints
            .insert(name.to_string(), constraint.to_string());
    }

    /// Record that `parent` depends on `child` under `constraint`. Both
    /// nodes must already exist.
    pub fn add_dependency(&mut self, parent: &str, child: &str, constraint: &str) {
        let (Some(&parent_idx), Some(&child_idx)) =
            (self.nodes.get(parent), self.nodes.get(child))
        else {
            return;
        };
        if !self.graph.contains_edge(parent_idx, child_idx) {
            self.graph.add_edge(parent_idx, child_idx, ());
        }
        self.graph[parent_idx]
            .constraints
            .insert(child.to_string(), constraint.to_string());
    }

    pub fn set_status(&mut self, name: &str, status: ResolutionStatus) {
        if let Some(&idx) = self.nodes.get(name) {
            self.graph[idx].status = status;
        }
    }

    pub fn set_version(&mut self, name: &str, version: &str) {
        if let Some(&idx) = self.nodes.get(name) {
            self.graph[idx].version = version.to_string();
        }
    }

    /// Names of packages this node depends on (forward edges).
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Names of packages depending on this node (reverse edges).
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    fn neighbors(&self, name: &str, dir: Direction) -> Vec<String> {
        let Some(&idx) = self.nodes.get(name) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .graph
            .neighbors_directed(idx, dir)
            .map(|n| self.graph[n].name.clone())
            .collect();
        out.sort();
        out
    }

    /// Every constraint that applies to `name`: the project's own (as
    /// parent `"root"`) plus one per dependent edge.
    pub fn incoming_constraints(&self, name: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(c) = self.root_constraints.get(name) {
            out.push(("root".to_string(), c.clone()));
        }
        for parent in self.dependents(name) {
            if let Some(node) = self.node(&parent) {
                if let Some(c) = node.constraints.get(name) {
                    out.push((parent.clone(), c.clone()));
                }
            }
        }
        out
    }

    /// DFS coloring cycle detection. Returns the cycle path (first node
    /// repeated at the end) if any back-edge reaches a gray node.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            graph: &DiGraph<DependencyNode, ()>,
            node: NodeIndex,
            colors: &mut HashMap<NodeIndex, Color>,
            path: &mut Vec<NodeIndex>,
        ) -> Option<Vec<NodeIndex>> {
            colors.insert(node, Color::Gray);
            path.push(node);
            for next in graph.neighbors_directed(node, Direction::Outgoing) {
                match colors.get(&next).copied().unwrap_or(Color::White) {
                    Color::Gray => {
                        // Back-edge: slice the current path from the gray
                        // node and close the loop.
                        let start = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<NodeIndex> = path[start..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Color::White => {
                        if let Some(cycle) = visit(graph, next, colors, path) {
                            return Some(cycle);
                        }
                    }
                    Color::Black => {}
                }
            }
            path.pop();
            colors.insert(node, Color::Black);
            None
        }

        let mut colors = HashMap::new();
        for node in self.graph.node_indices() {
            if colors.get(&node).copied().map(|c| c == Color::White).unwrap_or(true) {
                let mut path = Vec::new();
                if let Some(cycle) = visit(&self.graph, node, &mut colors, &mut path) {
                    return Some(cycle.into_iter().map(|i| self.graph[i].name.clone()).collect());
                }
            }
        }
        None
    }

    /// Confirm the graph invariants: acyclicity, reachability of every
    /// node from the root set, and that every node's version satisfies
    /// every incoming constraint.
    pub fn validate(&self) -> MortarResult<()> {
        if let Some(cycle) = self.detect_cycle() {
            return Err(MortarError::CyclicDependency(cycle));
        }

        // Reachability from the root set.
        let mut reachable: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = self.roots.clone();
        while let Some(name) = stack.pop() {
            if !reachable.insert(name.clone()) {
                continue;
            }
            stack.extend(self.dependencies(&name));
        }
        for name in self.nodes.keys() {
            if !reachable.contains(name) {
                return Err(MortarError::OrphanPackage(name.clone()));
            }
        }

        // Constraint satisfaction.
        for (name, &idx) in &self.nodes {
            let version = &self.graph[idx].version;
            for (parent, constraint) in self.incoming_constraints(name) {
                let parsed = VersionConstraint::parse(&constraint)?;
                if !satisfies_all(version, std::iter::once(&parsed)) {
                    return Err(MortarError::ConstraintViolation {
                        package: name.clone(),
                        version: version.clone(),
                        constraint,
                        parent,
                    });
                }
            }
        }
        Ok(())
    }

    /// Leaves-first order; empty when the graph is cyclic.
    pub fn topological_order(&self) -> Vec<String> {
        match petgraph::algo::toposort(&self.graph, None) {
            Ok(order) => order
                .into_iter()
                .rev()
                .map(|idx| self.graph[idx].name.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Serializable snapshot of the resolved graph.
    pub fn to_lockfile(&self) -> Lockfile {
        let mut packages: Vec<LockedPackage> = self
            .nodes
            .values()
            .map(|&idx| {
                let node = &self.graph[idx];
                LockedPackage {
                    name: node.name.clone(),
                    version: node.version.clone(),
                    dependencies: node
                        .constraints
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                }
            })
            .collect();
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Lockfile {
            version: LOCKFILE_FORMAT_VERSION,
            roots: self.roots.clone(),
            root_constraints: self
                .root_constraints
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            packages,
        }
    }

    /// Rebuild a graph from a lockfile. All nodes load as `Resolved`.
    pub fn from_lockfile(lock: &Lockfile) -> Self {
        let mut graph = Self::new();
        for pkg in &lock.packages {
            graph.add_package(&pkg.name, &pkg.version);
        }
        for pkg in &lock.packages {
            for (child, constraint) in &pkg.dependencies {
                graph.add_dependency(&pkg.name, child, constraint);
            }
            graph.set_status(&pkg.name, ResolutionStatus::Resolved);
        }
        for root in &lock.roots {
            let constraint = lock
                .root_constraints
                .get(root)
                .cloned()
                .unwrap_or_else(|| "*".to_string());
            graph.add_root(root, &constraint);
        }
        graph
    }
}

const LOCKFILE_FORMAT_VERSION: u32 = 1;

/// On-disk form of a resolved graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockfile {
    pub version: u32,
    pub roots: Vec<String>,
    pub root_constraints: BTreeMap<String, String>,
    pub packages: Vec<LockedPackage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
    pub dependencies: BTreeMap<String, String>,
}

impl Lockfile {
    pub fn load(path: &Path) -> MortarResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> MortarResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
