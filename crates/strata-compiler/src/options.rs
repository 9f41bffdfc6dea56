//! Compile options

use crate::error::CompileError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use strata_core::TargetConfig;

/// Everything a compile needs besides the project tree
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Directory holding `strata_project.toml`
    pub project_dir: PathBuf,

    /// Target the relations are named for
    pub target: TargetConfig,

    /// `--vars` overrides; win over every project's `[vars]`
    pub vars: BTreeMap<String, serde_json::Value>,

    /// Render incremental models as full rebuilds
    pub full_refresh: bool,
}

impl CompileOptions {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            target: TargetConfig::default(),
            vars: BTreeMap::new(),
            full_refresh: false,
        }
    }

    pub fn with_target(mut self, target: TargetConfig) -> Self {
        self.target = target;
        self
    }

    pub fn with_vars(mut self, vars: BTreeMap<String, serde_json::Value>) -> Self {
        self.vars = vars;
        self
    }

    pub fn full_refresh(mut self, full_refresh: bool) -> Self {
        self.full_refresh = full_refresh;
        self
    }
}

/// Parse `--vars` given as TOML, either `a = 1` or `{ a = 1, b = "x" }`
pub fn parse_vars(input: &str) -> Result<BTreeMap<String, serde_json::Value>, CompileError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(BTreeMap::new());
    }

    let table: toml::Table = if trimmed.starts_with('{') {
        let wrapped: toml::Table = toml::from_str(&format!("vars = {}", trimmed))
            .map_err(|e| CompileError::InvalidVars(e.to_string()))?;
        match wrapped.get("vars") {
            Some(toml::Value::Table(table)) => table.clone(),
            _ => return Err(CompileError::InvalidVars("expected an inline table".to_string())),
        }
    } else {
        toml::from_str(trimmed).map_err(|e| CompileError::InvalidVars(e.to_string()))?
    };

    table
        .into_iter()
        .map(|(key, value)| {
            serde_json::to_value(value)
                .map(|json| (key, json))
                .map_err(|e| CompileError::InvalidVars(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn vars_inline_table() {
        let vars = parse_vars(r#"{ start_date = "2024-01-01", limit = 10 }"#).unwrap();
        assert_eq!(vars.get("start_date"), Some(&json!("2024-01-01")));
        assert_eq!(vars.get("limit"), Some(&json!(10)));
    }

    #[test]
    fn vars_key_value_lines() {
        let vars = parse_vars("region = 'eu'\nflags = [1, 2]").unwrap();
        assert_eq!(vars.get("region"), Some(&json!("eu")));
        assert_eq!(vars.get("flags"), Some(&json!([1, 2])));
    }

    #[test]
    fn vars_invalid() {
        assert!(matches!(parse_vars("{ broken"), Err(CompileError::InvalidVars(_))));
        assert!(parse_vars("  ").unwrap().is_empty());
    }
}
