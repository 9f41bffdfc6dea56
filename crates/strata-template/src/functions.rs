//! Template functions
//!
//! Implements `ref()`, `source()`, `var()`, `env_var()`, `config()` and
//! `is_incremental()`. Each function closes over the state of the node
//! being rendered; typed failures are parked in that state so the renderer
//! can report them instead of the engine's generic error.

use crate::error::TemplateError;
use crate::extract::{RefCall, SourceCall};
use crate::references::{cte_name, ReferenceTable, ResolvedRef};
use minijinja::value::Kwargs;
use minijinja::{Error, ErrorKind, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Per-render state shared with the template functions
pub(crate) struct RenderState {
    node: String,
    references: Arc<ReferenceTable>,
    vars: Arc<BTreeMap<String, serde_json::Value>>,
    failure: Mutex<Option<TemplateError>>,
    ephemerals: Mutex<Vec<String>>,
}

impl RenderState {
    pub(crate) fn new(
        node: &str,
        references: Arc<ReferenceTable>,
        vars: Arc<BTreeMap<String, serde_json::Value>>,
    ) -> Self {
        Self {
            node: node.to_string(),
            references,
            vars,
            failure: Mutex::new(None),
            ephemerals: Mutex::new(Vec::new()),
        }
    }

    /// Record a typed failure and hand the engine an error to abort with
    fn fail(&self, error: TemplateError) -> Error {
        let message = error.to_string();
        if let Ok(mut slot) = self.failure.lock() {
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        Error::new(ErrorKind::InvalidOperation, message)
    }

    pub(crate) fn take_failure(&self) -> Option<TemplateError> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Ephemeral unique ids referenced, in call order
    pub(crate) fn take_ephemerals(&self) -> Vec<String> {
        self.ephemerals
            .lock()
            .map(|mut list| std::mem::take(&mut *list))
            .unwrap_or_default()
    }

    fn resolve_ref(&self, call: RefCall) -> Result<Value, Error> {
        match self.references.get_ref(&call) {
            Some(ResolvedRef::Relation(relation)) => Ok(Value::from(relation.as_str())),
            Some(ResolvedRef::Ephemeral { unique_id, name }) => {
                if let Ok(mut list) = self.ephemerals.lock() {
                    if !list.contains(unique_id) {
                        list.push(unique_id.clone());
                    }
                }
                Ok(Value::from(cte_name(name)))
            }
            None => Err(self.fail(TemplateError::UndeclaredDependency {
                node: self.node.clone(),
                reference: call.to_string(),
            })),
        }
    }
}

/// ref() function - references another model
///
/// Usage: {{ ref('model_name') }} or {{ ref('package', 'model_name') }}
/// Returns: the resolved relation, or the CTE name of an ephemeral model
pub(crate) fn ref_function(
    state: Arc<RenderState>,
) -> impl Fn(String, Option<String>) -> Result<Value, Error> + Send + Sync + 'static {
    move |first: String, second: Option<String>| {
        let call = match second {
            Some(name) => RefCall::qualified(first, name),
            None => RefCall::new(first),
        };
        state.resolve_ref(call)
    }
}

/// source() function - references a source table
///
/// Usage: {{ source('source_name', 'table_name') }}
pub(crate) fn source_function(
    state: Arc<RenderState>,
) -> impl Fn(String, String) -> Result<Value, Error> + Send + Sync + 'static {
    move |source: String, table: String| {
        let call = SourceCall::new(source, table);
        match state.references.get_source(&call) {
            Some(relation) => Ok(Value::from(relation)),
            None => Err(state.fail(TemplateError::UndeclaredDependency {
                node: state.node.clone(),
                reference: call.to_string(),
            })),
        }
    }
}

/// var() function - project variables with optional default
pub(crate) fn var_function(
    state: Arc<RenderState>,
) -> impl Fn(String, Option<Value>) -> Result<Value, Error> + Send + Sync + 'static {
    move |name: String, default: Option<Value>| match (state.vars.get(&name), default) {
        (Some(value), _) => Ok(Value::from_serialize(value)),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(state.fail(TemplateError::MissingVariable {
            node: state.node.clone(),
            name,
        })),
    }
}

/// env_var() function - process environment with optional default
pub(crate) fn env_var_function(
    state: Arc<RenderState>,
) -> impl Fn(String, Option<String>) -> Result<Value, Error> + Send + Sync + 'static {
    move |name: String, default: Option<String>| match std::env::var(&name).ok().or(default) {
        Some(value) => Ok(Value::from(value)),
        None => Err(state.fail(TemplateError::MissingEnvVar {
            node: state.node.clone(),
            name,
        })),
    }
}

/// config() function
///
/// Config was already collected during extraction, so this renders nothing.
pub(crate) fn config_function(kwargs: Kwargs) -> Result<Value, Error> {
    let keys: Vec<String> = kwargs.args().map(str::to_string).collect();
    for key in &keys {
        let _: Value = kwargs.get(key)?;
    }
    Ok(Value::from(""))
}

/// is_incremental() function
pub(crate) fn is_incremental_function(is_incremental: bool) -> impl Fn() -> Result<bool, Error> + Send + Sync + 'static {
    move || Ok(is_incremental)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(table: ReferenceTable) -> Arc<RenderState> {
        let mut vars = BTreeMap::new();
        vars.insert("start_date".to_string(), serde_json::json!("2024-01-01"));
        Arc::new(RenderState::new("model.shop.orders", Arc::new(table), Arc::new(vars)))
    }

    #[test]
    fn ref_resolves_relation() {
        let mut table = ReferenceTable::new();
        table.insert_ref(RefCall::new("customers"), ResolvedRef::Relation("analytics.customers".into()));

        let ref_fn = ref_function(state(table));
        let result = ref_fn("customers".into(), None).unwrap();
        assert_eq!(result.as_str(), Some("analytics.customers"));
    }

    #[test]
    fn ref_to_ephemeral_renders_cte_name() {
        let mut table = ReferenceTable::new();
        table.insert_ref(
            RefCall::new("base"),
            ResolvedRef::Ephemeral { unique_id: "model.shop.base".into(), name: "base".into() },
        );

        let state = state(table);
        let ref_fn = ref_function(state.clone());
        let result = ref_fn("base".into(), None).unwrap();
        assert_eq!(result.as_str(), Some("__strata__cte__base"));
        assert_eq!(state.take_ephemerals(), vec!["model.shop.base".to_string()]);
    }

    #[test]
    fn undeclared_ref_records_typed_failure() {
        let state = state(ReferenceTable::new());
        let ref_fn = ref_function(state.clone());
        assert!(ref_fn("shop".into(), Some("ghost".into())).is_err());
        assert_eq!(
            state.take_failure(),
            Some(TemplateError::UndeclaredDependency {
                node: "model.shop.orders".into(),
                reference: "ref('shop', 'ghost')".into(),
            })
        );
    }

    #[test]
    fn var_with_default_and_missing() {
        let state = state(ReferenceTable::new());
        let var_fn = var_function(state.clone());

        assert_eq!(var_fn("start_date".into(), None).unwrap().as_str(), Some("2024-01-01"));
        assert_eq!(var_fn("limit".into(), Some(Value::from(10))).unwrap(), Value::from(10));
        assert!(var_fn("limit".into(), None).is_err());
        assert!(matches!(state.take_failure(), Some(TemplateError::MissingVariable { .. })));
    }
}
