//! Physical relation naming

use strata_core::{Materialization, NodeConfig, Relation, ResourceType, TargetConfig};
use strata_project::Definition;

/// Schema a node builds into: the target schema, suffixed by a custom one
///
/// `schema = "staging"` on target schema `analytics` gives `analytics_staging`.
pub fn schema_name(target: &TargetConfig, custom: Option<&str>) -> String {
    match custom.map(str::trim).filter(|s| !s.is_empty()) {
        Some(custom) => format!("{}_{}", target.schema, custom),
        None => target.schema.clone(),
    }
}

/// Relation a definition reads from or builds
///
/// Tests and ephemeral models build nothing and get `None`.
pub fn relation_for(definition: &Definition, config: &NodeConfig, target: &TargetConfig) -> Option<Relation> {
    if let Some(source) = &definition.source {
        return Some(Relation::new(
            source.database.clone().or_else(|| target.database.clone()),
            source.schema.clone(),
            source.identifier.clone(),
        ));
    }

    if definition.resource_type() != ResourceType::Model || config.materialized == Materialization::Ephemeral {
        return None;
    }

    Some(physical_relation(definition, config, target))
}

/// Relation a model would build if it were materialized
pub fn physical_relation(definition: &Definition, config: &NodeConfig, target: &TargetConfig) -> Relation {
    Relation::new(
        config.database.clone().or_else(|| target.database.clone()),
        schema_name(target, config.schema.as_deref()),
        config.alias.clone().unwrap_or_else(|| definition.name.clone()),
    )
}
