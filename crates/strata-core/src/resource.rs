//! Resource types and physical relation names

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Kind of resource a manifest node represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// A transformation producing one relation
    Model,

    /// An external relation declared but not built
    Source,

    /// An assertion query returning a failure count
    Test,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Source => "source",
            Self::Test => "test",
        }
    }

    /// Parse from the lowercase name used in selectors and unique ids
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "model" => Some(Self::Model),
            "source" => Some(Self::Source),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    /// Build a unique id (`model.shop.orders`)
    pub fn unique_id(&self, package: &str, name: &str) -> String {
        format!("{}.{}.{}", self.as_str(), package, name)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a raw definition as declared on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    /// Transformation materialized in the backend
    Model,

    /// Transformation interpolated into its dependents, never executed
    Ephemeral,

    /// External source relation
    Source,

    /// Data or generic test
    Test,
}

impl DefinitionKind {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Model | Self::Ephemeral => ResourceType::Model,
            Self::Source => ResourceType::Source,
            Self::Test => ResourceType::Test,
        }
    }

    /// Whether the scheduler runs this kind against the backend
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Model | Self::Test)
    }
}

/// How a test definition came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    /// Generated from a column test declared in a schema file
    Schema,

    /// A hand-written test query file
    Data,
}

impl TestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Data => "data",
        }
    }
}

/// Physical identifier of a relation in the backend
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Relation {
    /// Database/catalog name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Schema/dataset name
    pub schema: String,

    /// Table or view name
    pub identifier: String,
}

impl Relation {
    /// Create a new relation
    pub fn new(database: Option<String>, schema: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            database,
            schema: schema.into(),
            identifier: identifier.into(),
        }
    }

    /// Get fully qualified name
    pub fn fqn(&self) -> String {
        match &self.database {
            Some(database) => format!("{}.{}.{}", database, self.schema, self.identifier),
            None => format!("{}.{}", self.schema, self.identifier),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fqn())
    }
}

/// sha256 checksum of a definition body, hex encoded
pub fn checksum(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_fqn() {
        let relation = Relation::new(Some("analytics".into()), "staging", "orders");
        assert_eq!(relation.fqn(), "analytics.staging.orders");
        assert_eq!(Relation::new(None, "public", "users").to_string(), "public.users");
    }

    #[test]
    fn unique_ids() {
        assert_eq!(ResourceType::Model.unique_id("shop", "orders"), "model.shop.orders");
        assert_eq!(ResourceType::parse("test"), Some(ResourceType::Test));
        assert_eq!(ResourceType::parse("seed"), None);
    }

    #[test]
    fn ephemeral_is_a_model_that_never_runs() {
        assert_eq!(DefinitionKind::Ephemeral.resource_type(), ResourceType::Model);
        assert!(!DefinitionKind::Ephemeral.is_executable());
        assert!(!DefinitionKind::Source.is_executable());
        assert!(DefinitionKind::Test.is_executable());
    }

    #[test]
    fn checksum_is_stable() {
        assert_eq!(checksum("select 1"), checksum("select 1"));
        assert_ne!(checksum("select 1"), checksum("select 2"));
        assert_eq!(checksum("").len(), 64);
    }
}
