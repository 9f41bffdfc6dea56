//! Schema files: source declarations and model patches
//!
//! Any `*.toml` file under a model path is a schema file:
//!
//! ```toml
//! [[sources]]
//! name = "raw"
//! schema = "raw_data"
//!
//! [[sources.tables]]
//! name = "orders"
//! columns = [{ name = "id", tests = ["unique", "not_null"] }]
//!
//! [[models]]
//! name = "stg_orders"
//! config = { materialized = "table" }
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use strata_core::PartialConfig;

/// Parsed schema file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaFile {
    #[serde(default)]
    pub sources: Vec<SourceEntry>,

    #[serde(default)]
    pub models: Vec<ModelPatch>,
}

impl SchemaFile {
    pub fn from_toml(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|e| e.to_string())
    }
}

/// A `[[sources]]` group
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceEntry {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub database: Option<String>,

    /// Defaults to the source name
    #[serde(default)]
    pub schema: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub config: Option<PartialConfig>,

    #[serde(default)]
    pub tables: Vec<SourceTable>,
}

/// A `[[sources.tables]]` entry
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceTable {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Physical table name, defaults to the table name
    #[serde(default)]
    pub identifier: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub config: Option<PartialConfig>,

    #[serde(default)]
    pub columns: Vec<ColumnEntry>,
}

/// A `[[models]]` patch
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPatch {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub config: Option<PartialConfig>,

    #[serde(default)]
    pub columns: Vec<ColumnEntry>,
}

/// Column documentation and tests
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnEntry {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub data_type: Option<String>,

    #[serde(default)]
    pub tests: Vec<ColumnTest>,
}

/// A generic test attached to a column
///
/// Either a bare name (`"unique"`) or a single-key table with arguments
/// (`{ accepted_values = { values = ["a", "b"] } }`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ColumnTest {
    Name(String),
    Configured(BTreeMap<String, toml::Value>),
}

impl ColumnTest {
    /// Split into test name and argument table
    pub fn parts(&self) -> Result<(String, toml::Table), String> {
        match self {
            Self::Name(name) => Ok((name.clone(), toml::Table::new())),
            Self::Configured(map) => {
                if map.len() != 1 {
                    return Err(format!(
                        "column test must have exactly one name, found {}",
                        map.len()
                    ));
                }

                let (name, args) = map
                    .iter()
                    .next()
                    .ok_or_else(|| "empty column test".to_string())?;

                match args {
                    toml::Value::Table(table) => Ok((name.clone(), table.clone())),
                    other => Err(format!(
                        "arguments of test '{}' must be a table, found {}",
                        name,
                        other.type_str()
                    )),
                }
            }
        }
    }
}
