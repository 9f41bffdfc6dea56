//! Dependency graph (DAG) construction and traversal
//!
//! Forward and reverse edges over node ids. Every traversal is ordered so
//! that results do not depend on hash iteration order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};
use strata_core::{Diagnostic, DiagnosticCode};

/// Node identifier (unique_id from manifest)
pub type NodeId = String;

/// Dependency graph with forward and reverse edges
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyGraph {
    /// Forward edges: node -> sorted nodes it depends on (parents)
    parents: BTreeMap<NodeId, Vec<NodeId>>,

    /// Reverse edges: node -> sorted nodes that depend on it (children)
    children: BTreeMap<NodeId, Vec<NodeId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a parent map, adding every parent as a node
    pub fn from_parent_map(parent_map: &BTreeMap<NodeId, Vec<NodeId>>) -> Self {
        let mut graph = Self::new();
        for (node, parents) in parent_map {
            graph.add_node(node);
            for parent in parents {
                graph.add_edge(node, parent);
            }
        }
        graph
    }

    pub fn add_node(&mut self, node: &str) {
        self.parents.entry(node.to_string()).or_default();
        self.children.entry(node.to_string()).or_default();
    }

    /// Record that `child` depends on `parent`
    pub fn add_edge(&mut self, child: &str, parent: &str) {
        self.add_node(child);
        self.add_node(parent);

        insert_sorted(self.parents.entry(child.to_string()).or_default(), parent);
        insert_sorted(self.children.entry(parent.to_string()).or_default(), child);
    }

    /// Drop the edge `child -> parent`, keeping both nodes
    pub fn remove_edge(&mut self, child: &str, parent: &str) {
        if let Some(parents) = self.parents.get_mut(child) {
            parents.retain(|p| p != parent);
        }
        if let Some(children) = self.children.get_mut(parent) {
            children.retain(|c| c != child);
        }
    }

    pub fn contains(&self, node: &str) -> bool {
        self.parents.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// All nodes in lexicographic order
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.parents.keys()
    }

    /// Immediate parents (dependencies) of a node
    pub fn parents(&self, node: &str) -> &[NodeId] {
        self.parents.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Immediate children (dependents) of a node
    pub fn children(&self, node: &str) -> &[NodeId] {
        self.children.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Transitive parents, excluding the node itself
    ///
    /// `depth` limits how many edges are followed; `None` is unbounded.
    pub fn upstream(&self, node: &str, depth: Option<usize>) -> BTreeSet<NodeId> {
        self.closure(node, depth, &self.parents)
    }

    /// Transitive children, excluding the node itself
    ///
    /// This is the blast radius of a failure at `node`.
    pub fn downstream(&self, node: &str, depth: Option<usize>) -> BTreeSet<NodeId> {
        self.closure(node, depth, &self.children)
    }

    fn closure(
        &self,
        node: &str,
        depth: Option<usize>,
        edges: &BTreeMap<NodeId, Vec<NodeId>>,
    ) -> BTreeSet<NodeId> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((node, 0usize));

        // BFS so the first visit of a node is at its minimal distance
        while let Some((current, distance)) = queue.pop_front() {
            if depth.is_some_and(|limit| distance >= limit) {
                continue;
            }

            for next in edges.get(current).map(Vec::as_slice).unwrap_or(&[]) {
                if next != node && visited.insert(next.clone()) {
                    queue.push_back((next.as_str(), distance + 1));
                }
            }
        }

        visited
    }

    /// Check if there's a path from source to target following child edges
    pub fn has_path(&self, source: &str, target: &str) -> bool {
        source == target || self.downstream(source, None).contains(target)
    }

    /// Find one cycle, returned as a closed path following dependency edges
    ///
    /// `["a", "b", "a"]` means `a` depends on `b` which depends on `a`.
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for start in self.parents.keys() {
            if marks.contains_key(start.as_str()) {
                continue;
            }

            // Explicit stack of (node, index of next parent to visit)
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), Mark::InProgress);

            while let Some(&(node, index)) = stack.last() {
                let parents = self.parents(node);

                if index >= parents.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                }

                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                let next = parents[index].as_str();
                match marks.get(next) {
                    Some(Mark::InProgress) => {
                        let position = stack.iter().position(|(id, _)| *id == next).unwrap_or(0);
                        let mut cycle: Vec<NodeId> =
                            stack[position..].iter().map(|(id, _)| id.to_string()).collect();
                        cycle.push(next.to_string());
                        return Some(cycle);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::InProgress);
                        stack.push((next, 0));
                    }
                }
            }
        }

        None
    }

    /// Fail with the cycle path if the graph is not a DAG
    pub fn check_acyclic(&self) -> Result<(), GraphCycleError> {
        match self.find_cycle() {
            Some(path) => Err(GraphCycleError { path }),
            None => Ok(()),
        }
    }

    /// Deterministic topological order (parents first)
    ///
    /// Kahn's algorithm; among ready nodes the lexicographically smallest id
    /// goes first.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>, GraphCycleError> {
        let mut remaining: HashMap<&str, usize> = self
            .parents
            .iter()
            .map(|(node, parents)| (node.as_str(), parents.len()))
            .collect();

        let mut ready: BinaryHeap<Reverse<&str>> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| Reverse(*node))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node.to_string());

            for child in self.children(node) {
                if let Some(count) = remaining.get_mut(child.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse(child.as_str()));
                    }
                }
            }
        }

        if order.len() != self.len() {
            let path = self.find_cycle().unwrap_or_default();
            return Err(GraphCycleError { path });
        }

        Ok(order)
    }

    /// Topological levels: level 0 has no parents, level n depends on n-1
    pub fn levels(&self) -> Result<Vec<Vec<NodeId>>, GraphCycleError> {
        let order = self.topological_sort()?;
        let mut level_of: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<NodeId>> = Vec::new();

        for node in &order {
            let level = self
                .parents(node)
                .iter()
                .filter_map(|parent| level_of.get(parent.as_str()))
                .map(|level| level + 1)
                .max()
                .unwrap_or(0);

            level_of.insert(node.as_str(), level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(node.clone());
        }

        Ok(levels)
    }

    /// Induced subgraph over `keep`
    pub fn subgraph(&self, keep: &BTreeSet<NodeId>) -> Self {
        let mut graph = Self::new();
        for node in keep.iter().filter(|n| self.contains(n)) {
            graph.add_node(node);
            for parent in self.parents(node).iter().filter(|p| keep.contains(*p)) {
                graph.add_edge(node, parent);
            }
        }
        graph
    }
}

fn insert_sorted(list: &mut Vec<NodeId>, value: &str) {
    if let Err(position) = list.binary_search_by(|probe| probe.as_str().cmp(value)) {
        list.insert(position, value.to_string());
    }
}

/// The edge relation contains a cycle
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Dependency cycle detected: {}", .path.join(" -> "))]
pub struct GraphCycleError {
    /// Closed path; first and last entries are the same node
    pub path: Vec<NodeId>,
}

impl GraphCycleError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let mut diagnostic = Diagnostic::error(DiagnosticCode::GraphCycle, self.to_string())
            .with_related(self.path.clone());
        if let Some(first) = self.path.first() {
            diagnostic = diagnostic.with_node(first.clone());
        }
        diagnostic
    }
}
