//! Dependency graph and manifest for compiled strata projects
//!
//! This crate handles:
//! - The serialisable manifest (nodes, sources, disabled nodes, edges)
//! - Building dependency graphs (DAG) with cycle path reporting
//! - Resolving `ref()` and `source()` names across packages
//! - Selecting sub-graphs with the selector grammar

pub mod dag;
pub mod manifest;
pub mod resolve;
pub mod selector;

pub use dag::{DependencyGraph, GraphCycleError, NodeId};
pub use manifest::{DependsOn, Manifest, ManifestError, ManifestMetadata, ManifestNode, ManifestSource};
pub use resolve::{ReferenceIndex, Resolution};
pub use selector::{
    Atom, Method, PrunedNode, Selection, SelectionCriteria, SelectionError, Selector, SelectorExpr, SetExpr,
};
