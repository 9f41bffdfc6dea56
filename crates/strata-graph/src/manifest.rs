//! Manifest: the compiled, serialisable project snapshot
//!
//! Ordered maps only and no timestamps, so compiling an unchanged project
//! twice produces byte-identical JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use strata_core::{Materialization, NodeConfig, Relation, ResourceType};
use strata_project::{ColumnSpec, TestSpec};
use crate::dag::DependencyGraph;

/// Compiled project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Metadata about the manifest
    pub metadata: ManifestMetadata,

    /// Model and test nodes
    pub nodes: BTreeMap<String, ManifestNode>,

    /// Source definitions
    pub sources: BTreeMap<String, ManifestSource>,

    /// Disabled nodes, kept so references to them resolve
    #[serde(default)]
    pub disabled: BTreeMap<String, ManifestNode>,

    /// Parent map (node -> list of parent nodes)
    #[serde(default)]
    pub parent_map: BTreeMap<String, Vec<String>>,

    /// Child map (node -> list of child nodes)
    #[serde(default)]
    pub child_map: BTreeMap<String, Vec<String>>,
}

impl Manifest {
    /// Empty manifest for a project
    pub fn new(metadata: ManifestMetadata) -> Self {
        Self {
            metadata,
            nodes: BTreeMap::new(),
            sources: BTreeMap::new(),
            disabled: BTreeMap::new(),
            parent_map: BTreeMap::new(),
            child_map: BTreeMap::new(),
        }
    }

    /// Load manifest from file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_json(&contents)
    }

    /// Parse manifest from JSON string
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json).map_err(|e| ManifestError::ParseError(e.to_string()))
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, ManifestError> {
        serde_json::to_string_pretty(self).map_err(|e| ManifestError::SerializeError(e.to_string()))
    }

    /// Write manifest to file, creating parent directories
    pub fn write_to_file(&self, path: &Path) -> Result<(), ManifestError> {
        let json = self.to_json()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ManifestError::IoError(parent.display().to_string(), e.to_string()))?;
        }
        std::fs::write(path, json).map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))
    }

    /// Get a specific node by unique_id
    pub fn get_node(&self, unique_id: &str) -> Option<&ManifestNode> {
        self.nodes.get(unique_id)
    }

    /// Get a specific source by unique_id
    pub fn get_source(&self, unique_id: &str) -> Option<&ManifestSource> {
        self.sources.get(unique_id)
    }

    /// Whether an enabled node or source with this id exists
    pub fn contains(&self, unique_id: &str) -> bool {
        self.nodes.contains_key(unique_id) || self.sources.contains_key(unique_id)
    }

    /// Resource type of an enabled node or source
    pub fn resource_type(&self, unique_id: &str) -> Option<ResourceType> {
        if let Some(node) = self.nodes.get(unique_id) {
            return Some(node.resource_type);
        }
        self.sources.get(unique_id).map(|_| ResourceType::Source)
    }

    /// Model nodes
    pub fn models(&self) -> impl Iterator<Item = &ManifestNode> {
        self.nodes.values().filter(|n| n.resource_type == ResourceType::Model)
    }

    /// Test nodes
    pub fn tests(&self) -> impl Iterator<Item = &ManifestNode> {
        self.nodes.values().filter(|n| n.resource_type == ResourceType::Test)
    }

    /// Dependency graph over enabled nodes and sources
    pub fn graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for id in self.nodes.keys().chain(self.sources.keys()) {
            graph.add_node(id);
        }
        for (child, parents) in &self.parent_map {
            for parent in parents {
                graph.add_edge(child, parent);
            }
        }
        graph
    }
}

/// Manifest metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Root project name
    pub project_name: String,

    /// Version of the tool that wrote the manifest
    pub strata_version: String,

    /// sha256 of the vars the project was compiled with
    pub vars_hash: String,

    /// Target the project was compiled for
    pub target_name: String,
}

/// A model or test node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestNode {
    /// Unique identifier (e.g., "model.shop.orders")
    pub unique_id: String,

    /// Node name (e.g., "orders")
    pub name: String,

    pub resource_type: ResourceType,

    /// Package name
    pub package_name: String,

    /// Original file path
    pub original_file_path: String,

    /// Fully qualified name
    pub fqn: Vec<String>,

    /// Physical relation built by the node; none for tests and ephemerals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<Relation>,

    /// Resolved configuration
    pub config: NodeConfig,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub columns: BTreeMap<String, ColumnSpec>,

    /// Template text as written
    pub raw_body: String,

    /// Fully expanded body, empty for disabled nodes
    #[serde(default)]
    pub compiled_body: String,

    /// sha256 of the raw body
    pub checksum: String,

    /// Dependencies
    #[serde(default)]
    pub depends_on: DependsOn,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_metadata: Option<TestSpec>,
}

impl ManifestNode {
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Interpolated into dependents instead of being run
    pub fn is_ephemeral(&self) -> bool {
        self.resource_type == ResourceType::Model && self.config.materialized == Materialization::Ephemeral
    }

    /// Whether the scheduler sends this node to the backend
    pub fn is_executable(&self) -> bool {
        !self.is_ephemeral() && matches!(self.resource_type, ResourceType::Model | ResourceType::Test)
    }
}

/// Dependencies structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependsOn {
    /// Unique ids this node depends on
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Disabled definitions this node references; no edge is created
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled: Vec<String>,
}

/// A source in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSource {
    /// Unique identifier (e.g., "source.shop.raw.orders")
    pub unique_id: String,

    /// Source name (e.g., "raw")
    pub source_name: String,

    /// Table name (e.g., "orders")
    pub name: String,

    pub package_name: String,

    pub original_file_path: String,

    pub fqn: Vec<String>,

    /// Physical relation
    pub relation: Relation,

    pub config: NodeConfig,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub columns: BTreeMap<String, ColumnSpec>,
}

/// Manifest error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManifestError {
    #[error("IO error reading {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse manifest: {0}")]
    ParseError(String),

    #[error("Failed to serialize manifest: {0}")]
    SerializeError(String),
}
