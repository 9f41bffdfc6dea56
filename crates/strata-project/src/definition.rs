//! Raw definitions produced by the loader

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_core::{checksum, DefinitionKind, PartialConfig, ResourceType, TestType};

/// A raw definition as read from the project tree
///
/// Immutable after load. The template resolver consumes it once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    /// Unique identifier (e.g., "model.shop.orders")
    pub unique_id: String,

    /// Name, unique within its package and resource type
    pub name: String,

    /// Package (namespace) the definition belongs to
    pub package: String,

    pub kind: DefinitionKind,

    /// Template text
    pub raw_body: String,

    /// sha256 of the raw body
    pub checksum: String,

    /// File the definition came from, relative to the project root
    pub original_file_path: String,

    /// Fully qualified name: package, directories, name
    pub fqn: Vec<String>,

    /// Declared configuration merged across project, package and node levels
    pub config: PartialConfig,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub columns: BTreeMap<String, ColumnSpec>,

    /// Set for sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,

    /// Set for tests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestSpec>,
}

impl Definition {
    /// Build a model or ephemeral definition
    pub fn model(
        package: &str,
        name: &str,
        raw_body: String,
        original_file_path: String,
        fqn: Vec<String>,
        config: PartialConfig,
    ) -> Self {
        let kind = if config.materialized == Some(strata_core::Materialization::Ephemeral) {
            DefinitionKind::Ephemeral
        } else {
            DefinitionKind::Model
        };

        Self {
            unique_id: ResourceType::Model.unique_id(package, name),
            name: name.to_string(),
            package: package.to_string(),
            kind,
            checksum: checksum(&raw_body),
            raw_body,
            original_file_path,
            fqn,
            config,
            description: String::new(),
            columns: BTreeMap::new(),
            source: None,
            test: None,
        }
    }

    /// Build a source table definition; sources have no template body
    pub fn source(
        package: &str,
        spec: SourceSpec,
        original_file_path: String,
        config: PartialConfig,
    ) -> Self {
        let name = format!("{}.{}", spec.source_name, spec.table_name);
        let fqn = vec![package.to_string(), spec.source_name.clone(), spec.table_name.clone()];

        Self {
            unique_id: ResourceType::Source.unique_id(package, &name),
            name,
            package: package.to_string(),
            kind: DefinitionKind::Source,
            raw_body: String::new(),
            checksum: checksum(""),
            original_file_path,
            fqn,
            config,
            description: String::new(),
            columns: BTreeMap::new(),
            source: Some(spec),
            test: None,
        }
    }

    /// Build a data or generic test definition
    pub fn test(
        package: &str,
        name: &str,
        raw_body: String,
        original_file_path: String,
        fqn: Vec<String>,
        config: PartialConfig,
        spec: TestSpec,
    ) -> Self {
        Self {
            unique_id: ResourceType::Test.unique_id(package, name),
            name: name.to_string(),
            package: package.to_string(),
            kind: DefinitionKind::Test,
            checksum: checksum(&raw_body),
            raw_body,
            original_file_path,
            fqn,
            config,
            description: String::new(),
            columns: BTreeMap::new(),
            source: None,
            test: Some(spec),
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        self.kind.resource_type()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled.unwrap_or(true)
    }
}

/// Documentation for one column
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

/// Physical location of an external source table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Source group name (e.g., "raw")
    pub source_name: String,

    /// Table name used in `source()` calls
    pub table_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    pub schema: String,

    /// Physical table name
    pub identifier: String,
}

/// Test metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    pub test_type: TestType,

    /// Generic test name (unique, not_null, ...) for schema tests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,

    /// Name of the model or `source.table` the test is attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<String>,

    /// Generic test arguments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kwargs: BTreeMap<String, serde_json::Value>,
}

impl TestSpec {
    /// Metadata for a hand-written test file
    pub fn data() -> Self {
        Self {
            test_type: TestType::Data,
            test_name: None,
            column_name: None,
            attached_to: None,
            kwargs: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Materialization;

    #[test]
    fn ephemeral_kind_follows_declared_config() {
        let config = PartialConfig {
            materialized: Some(Materialization::Ephemeral),
            ..Default::default()
        };
        let definition = Definition::model(
            "shop",
            "base_orders",
            "select 1".into(),
            "models/base_orders.sql".into(),
            vec!["shop".into(), "base_orders".into()],
            config,
        );

        assert_eq!(definition.kind, DefinitionKind::Ephemeral);
        assert_eq!(definition.unique_id, "model.shop.base_orders");
        assert_eq!(definition.checksum, checksum("select 1"));
    }

    #[test]
    fn source_ids_include_source_name() {
        let spec = SourceSpec {
            source_name: "raw".into(),
            table_name: "orders".into(),
            database: None,
            schema: "raw".into(),
            identifier: "orders".into(),
        };
        let definition = Definition::source("shop", spec, "models/sources.toml".into(), PartialConfig::default());

        assert_eq!(definition.unique_id, "source.shop.raw.orders");
        assert_eq!(definition.name, "raw.orders");
        assert!(definition.is_enabled());
    }
}
