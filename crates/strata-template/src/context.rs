//! Typed rendering context
//!
//! Templates see a fixed set of names. Anything else is rejected with
//! [`TemplateError::UnknownContextKey`](crate::TemplateError) before rendering.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_core::{NodeConfig, Relation, TargetConfig};

/// Names a template may look up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    Ref,
    Source,
    Var,
    EnvVar,
    Config,
    IsIncremental,
    This,
    Target,
    Model,
}

impl ContextKey {
    pub const ALL: [ContextKey; 9] = [
        Self::Ref,
        Self::Source,
        Self::Var,
        Self::EnvVar,
        Self::Config,
        Self::IsIncremental,
        Self::This,
        Self::Target,
        Self::Model,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ref => "ref",
            Self::Source => "source",
            Self::Var => "var",
            Self::EnvVar => "env_var",
            Self::Config => "config",
            Self::IsIncremental => "is_incremental",
            Self::This => "this",
            Self::Target => "target",
            Self::Model => "model",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == name)
    }

    /// Whether the key is a callable rather than a value
    pub fn is_function(&self) -> bool {
        !matches!(self, Self::This | Self::Target | Self::Model)
    }
}

/// Template engine globals that need no context entry
pub(crate) const ENGINE_GLOBALS: &[&str] = &["range", "dict", "namespace", "loop", "debug"];

/// Target the project compiles for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetContext {
    pub name: String,
    pub schema: String,
    pub database: Option<String>,
    #[serde(rename = "type")]
    pub adapter_type: String,
    pub threads: usize,
}

impl From<&TargetConfig> for TargetContext {
    fn from(target: &TargetConfig) -> Self {
        Self {
            name: target.name.clone(),
            schema: target.schema.clone(),
            database: target.database.clone(),
            adapter_type: target.adapter_type.clone(),
            threads: target.threads,
        }
    }
}

impl Default for TargetContext {
    fn default() -> Self {
        Self::from(&TargetConfig::default())
    }
}

/// The node being rendered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelContext {
    pub name: String,
    pub unique_id: String,
    pub package: String,
    pub resource_type: String,
    pub config: NodeConfig,
}

/// Everything a single render can see
#[derive(Debug, Clone)]
pub struct TemplateContext {
    /// Own relation; none for tests
    pub this: Option<Relation>,

    pub target: TargetContext,

    pub model: ModelContext,

    /// Project vars merged with overrides
    pub vars: Arc<BTreeMap<String, serde_json::Value>>,

    /// Value returned by `is_incremental()`
    pub is_incremental: bool,
}

impl TemplateContext {
    pub fn new(model: ModelContext, target: TargetContext) -> Self {
        Self {
            this: None,
            target,
            model,
            vars: Arc::new(BTreeMap::new()),
            is_incremental: false,
        }
    }

    pub fn with_this(mut self, relation: Relation) -> Self {
        self.this = Some(relation);
        self
    }

    pub fn with_vars(mut self, vars: Arc<BTreeMap<String, serde_json::Value>>) -> Self {
        self.vars = vars;
        self
    }

    pub fn incremental(mut self, is_incremental: bool) -> Self {
        self.is_incremental = is_incremental;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_registry() {
        assert_eq!(ContextKey::parse("env_var"), Some(ContextKey::EnvVar));
        assert_eq!(ContextKey::parse("adapter"), None);
        assert!(ContextKey::Ref.is_function());
        assert!(!ContextKey::This.is_function());
    }

    #[test]
    fn target_from_profile() {
        let target = TargetContext::from(&TargetConfig::default());
        assert_eq!(target.name, "dev");
        assert_eq!(target.adapter_type, "mock");
        assert_eq!(target.schema, "public");
    }
}
