//! Resolved reference table for one node

use crate::extract::{RefCall, SourceCall};
use std::collections::HashMap;

/// Prefix of the CTE an ephemeral model is interpolated as
pub const CTE_PREFIX: &str = "__strata__cte__";

/// CTE name an ephemeral model renders as
pub fn cte_name(name: &str) -> String {
    format!("{}{}", CTE_PREFIX, name)
}

/// What a `ref()` call renders as
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedRef {
    /// Physical relation name
    Relation(String),

    /// Ephemeral model, interpolated as a CTE
    Ephemeral { unique_id: String, name: String },
}

/// Calls a node may make during rendering, with what they resolve to
///
/// Only references seen during extraction are present, so a call missing
/// here was not declared.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    refs: HashMap<RefCall, ResolvedRef>,
    sources: HashMap<SourceCall, String>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_ref(&mut self, call: RefCall, resolved: ResolvedRef) {
        self.refs.insert(call, resolved);
    }

    pub fn insert_source(&mut self, call: SourceCall, relation: impl Into<String>) {
        self.sources.insert(call, relation.into());
    }

    pub fn get_ref(&self, call: &RefCall) -> Option<&ResolvedRef> {
        self.refs.get(call)
    }

    pub fn get_source(&self, call: &SourceCall) -> Option<&str> {
        self.sources.get(call).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.refs.len() + self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty() && self.sources.is_empty()
    }
}
