//! Template rendering (pass 2)

use crate::context::{ContextKey, TemplateContext, ENGINE_GLOBALS};
use crate::error::TemplateError;
use crate::functions::{self, RenderState};
use crate::references::ReferenceTable;
use minijinja::value::{Object, ObjectRepr};
use minijinja::{context, Environment, Error as JinjaError, ErrorKind, UndefinedBehavior, Value};
use std::fmt;
use std::sync::Arc;
use strata_core::Relation;

/// Output of rendering one body
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    /// Rendered text, ephemeral references left as CTE names
    pub sql: String,

    /// Unique ids of ephemeral models referenced, in call order
    pub ephemeral_refs: Vec<String>,
}

/// Check if a body contains template syntax
pub fn has_template_syntax(body: &str) -> bool {
    body.contains("{{") || body.contains("{%") || body.contains("{#")
}

/// Render a body with the fixed context and a resolved reference table
pub fn render(
    node: &str,
    body: &str,
    context: &TemplateContext,
    references: Arc<ReferenceTable>,
) -> Result<Rendered, TemplateError> {
    if !has_template_syntax(body) {
        return Ok(Rendered {
            sql: body.to_string(),
            ephemeral_refs: Vec::new(),
        });
    }

    let state = Arc::new(RenderState::new(node, references, context.vars.clone()));
    let env = environment(&state, context.is_incremental);

    let template = env
        .template_from_str(body)
        .map_err(|e| jinja_error(node, e))?;

    let mut unknown: Vec<String> = template
        .undeclared_variables(false)
        .into_iter()
        .filter(|name| ContextKey::parse(name).is_none() && !ENGINE_GLOBALS.contains(&name.as_str()))
        .collect();
    unknown.sort();
    if let Some(key) = unknown.into_iter().next() {
        return Err(TemplateError::UnknownContextKey {
            node: node.to_string(),
            key,
        });
    }

    let this = match &context.this {
        Some(relation) => Value::from_object(RelationValue(relation.clone())),
        None => Value::from(()),
    };

    let sql = template
        .render(context! {
            this => this,
            target => Value::from_serialize(&context.target),
            model => Value::from_serialize(&context.model),
        })
        .map_err(|e| state.take_failure().unwrap_or_else(|| jinja_error(node, e)))?;

    Ok(Rendered {
        sql,
        ephemeral_refs: state.take_ephemerals(),
    })
}

fn environment(state: &Arc<RenderState>, is_incremental: bool) -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);

    env.add_function(ContextKey::Ref.as_str(), functions::ref_function(state.clone()));
    env.add_function(ContextKey::Source.as_str(), functions::source_function(state.clone()));
    env.add_function(ContextKey::Var.as_str(), functions::var_function(state.clone()));
    env.add_function(ContextKey::EnvVar.as_str(), functions::env_var_function(state.clone()));
    env.add_function(ContextKey::Config.as_str(), functions::config_function);
    env.add_function(
        ContextKey::IsIncremental.as_str(),
        functions::is_incremental_function(is_incremental),
    );

    env
}

fn jinja_error(node: &str, error: JinjaError) -> TemplateError {
    match error.kind() {
        ErrorKind::SyntaxError => TemplateError::Syntax {
            node: node.to_string(),
            message: error.to_string(),
            line: error.line(),
        },
        _ => TemplateError::Render {
            node: node.to_string(),
            message: error.to_string(),
            line: error.line(),
        },
    }
}

/// `this`: renders as the relation name, exposes its parts as attributes
#[derive(Debug)]
struct RelationValue(Relation);

impl Object for RelationValue {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "database" => Some(Value::from(self.0.database.clone())),
            "schema" => Some(Value::from(self.0.schema.as_str())),
            "identifier" | "name" => Some(Value::from(self.0.identifier.as_str())),
            _ => None,
        }
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ModelContext, TargetContext};
    use crate::extract::{RefCall, SourceCall};
    use crate::references::ResolvedRef;
    use std::collections::BTreeMap;
    use strata_core::NodeConfig;

    fn context() -> TemplateContext {
        let model = ModelContext {
            name: "orders".into(),
            unique_id: "model.shop.orders".into(),
            package: "shop".into(),
            resource_type: "model".into(),
            config: NodeConfig::default(),
        };

        let mut vars = BTreeMap::new();
        vars.insert("min_total".to_string(), serde_json::json!(10));

        TemplateContext::new(model, TargetContext::default())
            .with_this(Relation::new(None, "analytics", "orders"))
            .with_vars(Arc::new(vars))
    }

    fn table() -> Arc<ReferenceTable> {
        let mut table = ReferenceTable::new();
        table.insert_ref(RefCall::new("customers"), ResolvedRef::Relation("analytics.customers".into()));
        table.insert_source(SourceCall::new("raw", "orders"), "raw_data.orders");
        Arc::new(table)
    }

    #[test]
    fn renders_refs_sources_and_vars() {
        let rendered = render(
            "model.shop.orders",
            "select * from {{ source('raw', 'orders') }} o\njoin {{ ref('customers') }} c using (customer_id)\nwhere total > {{ var('min_total') }}",
            &context(),
            table(),
        )
        .unwrap();

        assert_eq!(
            rendered.sql,
            "select * from raw_data.orders o\njoin analytics.customers c using (customer_id)\nwhere total > 10"
        );
        assert!(rendered.ephemeral_refs.is_empty());
    }

    #[test]
    fn this_target_and_model_are_available() {
        let rendered = render(
            "model.shop.orders",
            "{{ config(materialized='table') }}-- {{ this }} in {{ this.schema }} on {{ target.name }} for {{ model.name }}",
            &context(),
            table(),
        )
        .unwrap();

        assert_eq!(rendered.sql, "-- analytics.orders in analytics on dev for orders");
    }

    #[test]
    fn conditionals_are_evaluated() {
        let body = "select * from {{ ref('customers') }}{% if is_incremental() %} where updated_at > (select max(updated_at) from {{ this }}){% endif %}";

        let full = render("model.shop.orders", body, &context(), table()).unwrap();
        assert_eq!(full.sql, "select * from analytics.customers");

        let incremental = render("model.shop.orders", body, &context().incremental(true), table()).unwrap();
        assert!(incremental.sql.ends_with("(select max(updated_at) from analytics.orders)"));
    }

    #[test]
    fn unknown_context_key_is_rejected() {
        let result = render("model.shop.orders", "select {{ adapter.quote('x') }}", &context(), table());
        assert_eq!(
            result,
            Err(TemplateError::UnknownContextKey {
                node: "model.shop.orders".into(),
                key: "adapter".into(),
            })
        );
    }

    #[test]
    fn undeclared_ref_is_reported() {
        let result = render("model.shop.orders", "select * from {{ ref('payments') }}", &context(), table());
        assert!(matches!(result, Err(TemplateError::UndeclaredDependency { reference, .. }) if reference == "ref('payments')"));
    }

    #[test]
    fn missing_variable_is_reported() {
        let result = render("model.shop.orders", "select {{ var('nope') }}", &context(), table());
        assert!(matches!(result, Err(TemplateError::MissingVariable { name, .. }) if name == "nope"));
    }

    #[test]
    fn plain_sql_passes_through() {
        let rendered = render("model.shop.orders", "select 1", &context(), table()).unwrap();
        assert_eq!(rendered.sql, "select 1");
    }
}
