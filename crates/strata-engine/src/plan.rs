//! Execution plan: the selected sub-graph, flattened for scheduling
//!
//! Every plan node has a rank (its position in the plan), and parent and
//! child edges restricted to the plan. Ranks follow the selection's
//! topological order, so ready-queue ties always break the same way.

use std::collections::HashMap;
use strata_adapter::ExecutionRequest;
use strata_core::{NodeConfig, ResourceType};
use strata_graph::{Manifest, ManifestNode, Selection};

/// What the scheduler does with a node once it becomes eligible
#[derive(Debug, Clone, PartialEq)]
pub enum PlanAction {
    /// Send to the backend
    Execute(ExecutionRequest),

    /// Mark `not-run` without touching the backend
    NotRun(String),

    /// Skipped before the run starts (disabled dependency)
    Prune { blocked_by: String },
}

/// One node of the plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlanNode {
    pub unique_id: String,

    /// Node name, matched against `soft_dependencies`
    pub name: String,

    pub resource_type: ResourceType,

    pub config: NodeConfig,

    pub action: PlanAction,

    /// Ranks of parents whose failure can skip this node
    pub hard_parents: Vec<usize>,

    /// Ranks of parents listed in `soft_dependencies`
    pub soft_parents: Vec<usize>,

    /// Ranks of dependents
    pub children: Vec<usize>,
}

impl PlanNode {
    /// Number of parents, hard and soft
    pub fn parent_count(&self) -> usize {
        self.hard_parents.len() + self.soft_parents.len()
    }

    fn is_soft_parent(&self, parent: &ManifestNode) -> bool {
        self.config
            .soft_dependencies
            .iter()
            .any(|name| name == &parent.name || name == &parent.unique_id)
    }
}

/// Nodes in scheduling rank order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    nodes: Vec<PlanNode>,
    ranks: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Build the plan of a selection
    ///
    /// Referenced-only parents come first and are `not-run`, then the selected
    /// nodes in topological order, then pruned nodes, which are skipped.
    pub fn build(manifest: &Manifest, selection: &Selection, full_refresh: bool) -> Self {
        let mut plan = Self::default();

        for unique_id in &selection.referenced_only {
            if let Some(node) = manifest.get_node(unique_id) {
                plan.push(node, PlanAction::NotRun("referenced only".to_string()));
            }
        }

        for unique_id in &selection.selected {
            let Some(node) = manifest.get_node(unique_id) else {
                tracing::warn!(node = %unique_id, "selected node missing from manifest");
                continue;
            };
            let action = if node.is_executable() {
                PlanAction::Execute(request_for(node, full_refresh))
            } else {
                PlanAction::NotRun(format!("{} is not executed", node.config.materialized.as_str()))
            };
            plan.push(node, action);
        }

        for pruned in &selection.pruned {
            if let Some(node) = manifest.get_node(&pruned.unique_id) {
                plan.push(
                    node,
                    PlanAction::Prune {
                        blocked_by: pruned.disabled_ancestor.clone(),
                    },
                );
            }
        }

        plan.link(manifest);
        plan
    }

    fn push(&mut self, node: &ManifestNode, action: PlanAction) {
        if self.ranks.contains_key(&node.unique_id) {
            return;
        }
        self.ranks.insert(node.unique_id.clone(), self.nodes.len());
        self.nodes.push(PlanNode {
            unique_id: node.unique_id.clone(),
            name: node.name.clone(),
            resource_type: node.resource_type,
            config: node.config.clone(),
            action,
            hard_parents: Vec::new(),
            soft_parents: Vec::new(),
            children: Vec::new(),
        });
    }

    /// Wire parent/child edges between plan nodes
    fn link(&mut self, manifest: &Manifest) {
        for rank in 0..self.nodes.len() {
            if matches!(self.nodes[rank].action, PlanAction::Prune { .. }) {
                continue;
            }
            let Some(node) = manifest.get_node(&self.nodes[rank].unique_id) else {
                continue;
            };

            for parent_id in &node.depends_on.nodes {
                let Some(&parent_rank) = self.ranks.get(parent_id) else {
                    continue;
                };
                let soft = manifest
                    .get_node(parent_id)
                    .is_some_and(|parent| self.nodes[rank].is_soft_parent(parent));

                let plan_node = &mut self.nodes[rank];
                if soft {
                    plan_node.soft_parents.push(parent_rank);
                } else {
                    plan_node.hard_parents.push(parent_rank);
                }
                self.nodes[parent_rank].children.push(rank);
            }
        }
    }

    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub fn get(&self, rank: usize) -> Option<&PlanNode> {
        self.nodes.get(rank)
    }

    pub fn rank(&self, unique_id: &str) -> Option<usize> {
        self.ranks.get(unique_id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes that will be sent to the backend
    pub fn executable_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.action, PlanAction::Execute(_)))
            .count()
    }
}

fn request_for(node: &ManifestNode, full_refresh: bool) -> ExecutionRequest {
    ExecutionRequest {
        unique_id: node.unique_id.clone(),
        resource_type: node.resource_type,
        compiled_body: node.compiled_body.clone(),
        relation: node.relation.clone(),
        config: node.config.clone(),
        full_refresh,
    }
}
