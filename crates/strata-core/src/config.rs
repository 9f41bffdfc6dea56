//! Configuration schema (strata_project.toml, profiles.toml) and node config merging
//!
//! Declared configuration is merged in a fixed order, coarsest first:
//! project defaults < package level < node level < inline `config()` call.
//! `tags` accumulate across levels, every other key overrides.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Materialization strategy for a model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    /// Backend view
    #[default]
    View,

    /// Backend table rebuilt on every run
    Table,

    /// Backend table appended to when it already exists
    Incremental,

    /// Never built; interpolated into dependents
    Ephemeral,
}

impl Materialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Table => "table",
            Self::Incremental => "incremental",
            Self::Ephemeral => "ephemeral",
        }
    }
}

/// What a node does when upstream work fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamFailurePolicy {
    /// Skip as soon as any hard dependency fails or is skipped
    #[default]
    Any,

    /// Skip only when every hard dependency failed or was skipped
    All,

    /// Run once all dependencies are terminal, whatever their outcome
    Never,
}

/// Severity of a failing test
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestSeverity {
    #[default]
    Error,
    Warn,
}

/// Fully resolved configuration of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub enabled: bool,
    pub materialized: Materialization,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Per-node timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    pub retries: u32,
    pub on_upstream_failure: UpstreamFailurePolicy,
    /// Names of parents whose failure never skips this node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub soft_dependencies: Vec<String>,
    pub severity: TestSeverity,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        PartialConfig::default().resolve()
    }
}

/// One layer of declared configuration; unset keys defer to coarser layers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materialized: Option<Materialization>,
    #[serde(default, deserialize_with = "string_or_list", skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_upstream_failure: Option<UpstreamFailurePolicy>,
    #[serde(default, deserialize_with = "string_or_list", skip_serializing_if = "Option::is_none")]
    pub soft_dependencies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<TestSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<BTreeMap<String, serde_json::Value>>,
}

macro_rules! override_fields {
    ($target:ident, $other:ident, $($field:ident),+) => {
        $(
            if $other.$field.is_some() {
                $target.$field = $other.$field.clone();
            }
        )+
    };
}

impl PartialConfig {
    /// Keys recognised as node configuration inside nested scopes
    pub const KEYS: &'static [&'static str] = &[
        "enabled",
        "materialized",
        "tags",
        "schema",
        "alias",
        "database",
        "timeout",
        "retries",
        "on_upstream_failure",
        "soft_dependencies",
        "severity",
        "meta",
    ];

    /// Parse a layer from JSON keyword arguments (inline `config()` calls)
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse a layer from a TOML table holding only config keys
    pub fn from_toml_table(table: toml::Table) -> Result<Self, ConfigError> {
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError(e.to_string()))
    }

    /// Apply a finer layer on top of this one
    pub fn merge(&mut self, other: &PartialConfig) {
        override_fields!(
            self,
            other,
            enabled,
            materialized,
            schema,
            alias,
            database,
            timeout,
            retries,
            on_upstream_failure,
            soft_dependencies,
            severity
        );

        if let Some(tags) = &other.tags {
            self.tags.get_or_insert_with(Vec::new).extend(tags.iter().cloned());
        }

        if let Some(meta) = &other.meta {
            let target = self.meta.get_or_insert_with(BTreeMap::new);
            for (key, value) in meta {
                target.insert(key.clone(), value.clone());
            }
        }
    }

    /// Merge a sequence of layers, coarsest first
    pub fn layered<'a>(layers: impl IntoIterator<Item = &'a PartialConfig>) -> Self {
        let mut merged = PartialConfig::default();
        for layer in layers {
            merged.merge(layer);
        }
        merged
    }

    /// Fill in defaults for unset keys
    pub fn resolve(&self) -> NodeConfig {
        let mut tags = self.tags.clone().unwrap_or_default();
        tags.sort();
        tags.dedup();

        NodeConfig {
            enabled: self.enabled.unwrap_or(true),
            materialized: self.materialized.unwrap_or_default(),
            tags,
            schema: self.schema.clone(),
            alias: self.alias.clone(),
            database: self.database.clone(),
            timeout: self.timeout,
            retries: self.retries.unwrap_or(0),
            on_upstream_failure: self.on_upstream_failure.unwrap_or_default(),
            soft_dependencies: self.soft_dependencies.clone().unwrap_or_default(),
            severity: self.severity.unwrap_or_default(),
            meta: self.meta.clone().unwrap_or_default(),
        }
    }
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(Option::<OneOrMany>::deserialize(deserializer)?.map(|value| match value {
        OneOrMany::One(single) => vec![single],
        OneOrMany::Many(list) => list,
    }))
}

/// Nested configuration scopes (`[models.<package>.<dir>]`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigScope {
    /// Config keys set at this level
    pub config: PartialConfig,

    /// Child scopes keyed by package, directory or node name
    pub children: BTreeMap<String, ConfigScope>,
}

impl ConfigScope {
    /// Split a TOML table into config keys and nested scopes
    pub fn from_table(table: &toml::Table) -> Result<Self, ConfigError> {
        let mut flat = toml::Table::new();
        let mut children = BTreeMap::new();

        for (key, value) in table {
            // `+materialized` is accepted as an explicit config marker
            let name = key.strip_prefix('+').unwrap_or(key);

            if PartialConfig::KEYS.contains(&name) {
                flat.insert(name.to_string(), value.clone());
            } else if let toml::Value::Table(inner) = value {
                let child = Self::from_table(inner)
                    .map_err(|e| e.within(key))?;
                children.insert(key.clone(), child);
            } else {
                return Err(ConfigError::UnknownKey(key.clone()));
            }
        }

        Ok(Self {
            config: PartialConfig::from_toml_table(flat)?,
            children,
        })
    }

    /// Layers applying to `path`, coarsest first
    pub fn layers_for<S: AsRef<str>>(&self, path: &[S]) -> Vec<&PartialConfig> {
        let mut layers = vec![&self.config];
        let mut scope = self;

        for segment in path {
            match scope.children.get(segment.as_ref()) {
                Some(child) => {
                    layers.push(&child.config);
                    scope = child;
                }
                None => break,
            }
        }

        layers
    }

    /// Layers below the root applying to `path` (root flat keys excluded)
    pub fn scoped_layers_for<S: AsRef<str>>(&self, path: &[S]) -> Vec<&PartialConfig> {
        self.layers_for(path).into_iter().skip(1).collect()
    }
}

/// Project file (strata_project.toml)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project (root namespace) name
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Profile to pick connection targets from
    #[serde(default)]
    pub profile: Option<String>,

    #[serde(rename = "model-paths", default = "default_model_paths")]
    pub model_paths: Vec<String>,

    #[serde(rename = "test-paths", default = "default_test_paths")]
    pub test_paths: Vec<String>,

    #[serde(rename = "packages-install-path", default = "default_packages_path")]
    pub packages_install_path: String,

    /// Project variables available through var()
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,

    /// Model config scopes
    #[serde(default)]
    pub models: toml::Table,

    /// Test config scopes
    #[serde(default)]
    pub tests: toml::Table,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_model_paths() -> Vec<String> {
    vec!["models".to_string()]
}

fn default_test_paths() -> Vec<String> {
    vec!["tests".to_string()]
}

fn default_packages_path() -> String {
    "strata_packages".to_string()
}

impl ProjectConfig {
    /// File name looked up in a project root
    pub const FILE_NAME: &'static str = "strata_project.toml";

    /// Minimal project config with defaults
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            profile: None,
            model_paths: default_model_paths(),
            test_paths: default_test_paths(),
            packages_install_path: default_packages_path(),
            vars: BTreeMap::new(),
            models: toml::Table::new(),
            tests: toml::Table::new(),
            project_root: PathBuf::new(),
        }
    }

    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

        let mut config = Self::from_toml(&contents)?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parsed model config scopes
    pub fn model_scope(&self) -> Result<ConfigScope, ConfigError> {
        ConfigScope::from_table(&self.models).map_err(|e| e.within("models"))
    }

    /// Parsed test config scopes
    pub fn test_scope(&self) -> Result<ConfigScope, ConfigError> {
        ConfigScope::from_table(&self.tests).map_err(|e| e.within("tests"))
    }
}

/// Connection target (one output of a profile)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target name (dev, prod, ...)
    #[serde(skip)]
    pub name: String,

    /// Adapter type (mock, postgres, ...)
    #[serde(rename = "type")]
    pub adapter_type: String,

    /// Default database
    #[serde(default)]
    pub database: Option<String>,

    /// Default schema
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Worker/connection count
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Adapter-specific settings
    #[serde(flatten)]
    pub settings: BTreeMap<String, toml::Value>,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_threads() -> usize {
    4
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: "dev".to_string(),
            adapter_type: "mock".to_string(),
            database: None,
            schema: default_schema(),
            threads: default_threads(),
            settings: BTreeMap::new(),
        }
    }
}

impl TargetConfig {
    /// Get an adapter setting rendered as a string
    pub fn setting(&self, key: &str) -> Option<String> {
        self.settings.get(key).map(|value| match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Profiles file (profiles.toml)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilesConfig {
    /// Default target name
    pub target: String,

    /// Available targets
    pub outputs: BTreeMap<String, TargetConfig>,
}

impl ProfilesConfig {
    /// Load profiles from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    /// Load profiles from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Pick a target by name, or the default one
    pub fn target(&self, name: Option<&str>) -> Result<TargetConfig, ConfigError> {
        let name = name.unwrap_or(&self.target);
        let mut target = self
            .outputs
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))?;
        target.name = name.to_string();
        Ok(target)
    }
}

/// Simple glob matching (any number of `*` wildcards)
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];

    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };

    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }

    rest.ends_with(last)
}

/// Config error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unknown config key '{0}'")]
    UnknownKey(String),

    #[error("Target '{0}' not found in profiles")]
    UnknownTarget(String),
}

impl ConfigError {
    /// Prefix a key path onto the error for nested scopes
    fn within(self, scope: &str) -> Self {
        match self {
            Self::UnknownKey(key) => Self::UnknownKey(format!("{}.{}", scope, key)),
            Self::ParseError(message) => Self::ParseError(format!("in [{}]: {}", scope, message)),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_node_config() {
        let config = NodeConfig::default();
        assert!(config.enabled);
        assert_eq!(config.materialized, Materialization::View);
        assert_eq!(config.on_upstream_failure, UpstreamFailurePolicy::Any);
        assert_eq!(config.retries, 0);
    }

    #[test]
    fn merge_order_and_tag_accumulation() {
        let project = PartialConfig {
            materialized: Some(Materialization::View),
            tags: Some(vec!["nightly".into()]),
            ..Default::default()
        };
        let package = PartialConfig {
            materialized: Some(Materialization::Table),
            tags: Some(vec!["finance".into(), "nightly".into()]),
            ..Default::default()
        };
        let node = PartialConfig {
            alias: Some("orders_v2".into()),
            ..Default::default()
        };

        let resolved = PartialConfig::layered([&project, &package, &node]).resolve();
        assert_eq!(resolved.materialized, Materialization::Table);
        assert_eq!(resolved.tags, vec!["finance".to_string(), "nightly".to_string()]);
        assert_eq!(resolved.alias.as_deref(), Some("orders_v2"));
    }

    #[test]
    fn scopes_split_config_from_children() {
        let project = ProjectConfig::from_toml(
            r#"
            name = "shop"

            [models]
            materialized = "view"

            [models.shop.staging]
            +materialized = "table"
            tags = "staging"
            "#,
        )
        .unwrap();

        let scope = project.model_scope().unwrap();
        let layers = scope.layers_for(&["shop", "staging", "stg_orders"]);
        assert_eq!(layers.len(), 3);

        let resolved = PartialConfig::layered(layers).resolve();
        assert_eq!(resolved.materialized, Materialization::Table);
        assert_eq!(resolved.tags, vec!["staging".to_string()]);
    }

    #[test]
    fn unknown_scalar_key_is_rejected() {
        let table: toml::Table = toml::from_str("materialised = \"table\"").unwrap();
        assert_eq!(
            ConfigScope::from_table(&table),
            Err(ConfigError::UnknownKey("materialised".to_string()))
        );
    }

    #[test]
    fn wrong_type_is_a_parse_error() {
        let table: toml::Table = toml::from_str("retries = \"three\"").unwrap();
        assert!(matches!(ConfigScope::from_table(&table), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn project_defaults() {
        let project = ProjectConfig::from_toml("name = \"shop\"").unwrap();
        assert_eq!(project.model_paths, vec!["models".to_string()]);
        assert_eq!(project.test_paths, vec!["tests".to_string()]);
        assert_eq!(project.packages_install_path, "strata_packages");
    }

    #[test]
    fn profile_target_lookup() {
        let profiles = ProfilesConfig::from_toml(
            r#"
            target = "dev"

            [outputs.dev]
            type = "postgres"
            schema = "analytics"
            threads = 8
            host = "localhost"
            port = 5432
            "#,
        )
        .unwrap();

        let target = profiles.target(None).unwrap();
        assert_eq!(target.name, "dev");
        assert_eq!(target.threads, 8);
        assert_eq!(target.setting("port").as_deref(), Some("5432"));
        assert!(profiles.target(Some("prod")).is_err());
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("staging.*", "staging.users"));
        assert!(glob_match("*.sql", "model.sql"));
        assert!(glob_match("stg_*_daily", "stg_orders_daily"));
        assert!(!glob_match("staging.*", "prod.users"));
        assert!(!glob_match("a*a", "a"));
    }
}
