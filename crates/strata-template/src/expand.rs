//! Demand-driven expansion with ephemeral interpolation
//!
//! Expanding a node renders its body, then expands every ephemeral model it
//! referenced and prepends them as CTEs. Results are memoised; a node that
//! is re-entered while its own expansion is in progress is a circular
//! template context.

use crate::context::TemplateContext;
use crate::error::TemplateError;
use crate::references::{cte_name, ReferenceTable};
use crate::render::render;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A node ready for pass 2
#[derive(Debug, Clone)]
pub struct ExpansionUnit {
    pub unique_id: String,
    pub body: String,
    pub context: TemplateContext,
    pub references: Arc<ReferenceTable>,
}

/// An ephemeral model interpolated into a dependent
#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub unique_id: String,
    pub name: String,
    pub sql: String,
}

/// Result of expanding one node
#[derive(Debug, Clone, PartialEq)]
pub struct Expanded {
    /// Rendered body without injected CTEs
    pub rendered: String,

    /// Rendered body with ephemeral CTEs injected
    pub compiled: String,

    /// Ephemeral ancestors, in injection order
    pub ctes: Vec<Cte>,
}

/// Expands units on demand, memoising results
pub struct Expander<'a> {
    units: &'a BTreeMap<String, ExpansionUnit>,
    memo: HashMap<String, Result<Expanded, TemplateError>>,
    stack: Vec<String>,
}

impl<'a> Expander<'a> {
    pub fn new(units: &'a BTreeMap<String, ExpansionUnit>) -> Self {
        Self {
            units,
            memo: HashMap::new(),
            stack: Vec::new(),
        }
    }

    /// Expand a node, expanding the ephemeral models it needs first
    pub fn expand(&mut self, unique_id: &str) -> Result<Expanded, TemplateError> {
        if let Some(result) = self.memo.get(unique_id) {
            return result.clone();
        }

        if let Some(position) = self.stack.iter().position(|id| id == unique_id) {
            let mut chain = self.stack[position..].to_vec();
            chain.push(unique_id.to_string());
            return Err(TemplateError::CircularContext { chain });
        }

        let Some(unit) = self.units.get(unique_id) else {
            return Err(TemplateError::Render {
                node: unique_id.to_string(),
                message: "node has no template to expand".to_string(),
                line: None,
            });
        };

        tracing::trace!(node = %unique_id, depth = self.stack.len(), "Expanding");

        self.stack.push(unique_id.to_string());
        let result = self.expand_unit(unit);
        self.stack.pop();

        self.memo.insert(unique_id.to_string(), result.clone());
        result
    }

    fn expand_unit(&mut self, unit: &ExpansionUnit) -> Result<Expanded, TemplateError> {
        let rendered = render(&unit.unique_id, &unit.body, &unit.context, unit.references.clone())?;

        let mut ctes: Vec<Cte> = Vec::new();
        for ephemeral in rendered.ephemeral_refs {
            let expanded = match self.expand(&ephemeral) {
                Ok(expanded) => expanded,
                Err(error @ TemplateError::CircularContext { .. }) => return Err(error),
                Err(_) => {
                    return Err(TemplateError::EphemeralFailed {
                        node: unit.unique_id.clone(),
                        ephemeral,
                    })
                }
            };

            for cte in expanded.ctes {
                if !ctes.iter().any(|c| c.unique_id == cte.unique_id) {
                    ctes.push(cte);
                }
            }

            if !ctes.iter().any(|c| c.unique_id == ephemeral) {
                let name = self
                    .units
                    .get(&ephemeral)
                    .map(|u| u.context.model.name.clone())
                    .unwrap_or_else(|| ephemeral.clone());
                ctes.push(Cte {
                    unique_id: ephemeral,
                    name: cte_name(&name),
                    sql: expanded.rendered,
                });
            }
        }

        Ok(Expanded {
            compiled: inject_ctes(&rendered.sql, &ctes),
            rendered: rendered.sql,
            ctes,
        })
    }
}

/// Prepend CTEs, merging into a leading `with` clause when there is one
pub fn inject_ctes(sql: &str, ctes: &[Cte]) -> String {
    if ctes.is_empty() {
        return sql.to_string();
    }

    let definitions = ctes
        .iter()
        .map(|cte| format!("{} as (\n{}\n)", cte.name, cte.sql.trim()))
        .collect::<Vec<_>>()
        .join(",\n");

    let trimmed = sql.trim_start();
    match strip_keyword(trimmed, "with") {
        Some(rest) => match strip_keyword(rest, "recursive") {
            Some(rest) => format!("with recursive {},\n{}", definitions, rest),
            None => format!("with {},\n{}", definitions, rest),
        },
        None => format!("with {}\n{}", definitions, trimmed),
    }
}

/// Strip a leading case-insensitive keyword followed by whitespace
fn strip_keyword<'s>(sql: &'s str, keyword: &str) -> Option<&'s str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    if head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace) {
        Some(rest.trim_start())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ModelContext, TargetContext};
    use crate::extract::RefCall;
    use crate::references::ResolvedRef;
    use pretty_assertions::assert_eq;
    use strata_core::NodeConfig;

    fn unit(name: &str, body: &str, refs: &[(&str, ResolvedRef)]) -> (String, ExpansionUnit) {
        let unique_id = format!("model.shop.{}", name);
        let mut table = ReferenceTable::new();
        for (target, resolved) in refs {
            table.insert_ref(RefCall::new(*target), resolved.clone());
        }

        let model = ModelContext {
            name: name.to_string(),
            unique_id: unique_id.clone(),
            package: "shop".into(),
            resource_type: "model".into(),
            config: NodeConfig::default(),
        };

        (
            unique_id.clone(),
            ExpansionUnit {
                unique_id,
                body: body.to_string(),
                context: TemplateContext::new(model, TargetContext::default()),
                references: Arc::new(table),
            },
        )
    }

    fn ephemeral(name: &str) -> ResolvedRef {
        ResolvedRef::Ephemeral {
            unique_id: format!("model.shop.{}", name),
            name: name.to_string(),
        }
    }

    #[test]
    fn ephemeral_chain_is_injected_in_dependency_order() {
        let units: BTreeMap<_, _> = [
            unit("base", "select * from raw.orders", &[]),
            unit("enriched", "select * from {{ ref('base') }}", &[("base", ephemeral("base"))]),
            unit(
                "orders",
                "select * from {{ ref('enriched') }}",
                &[("enriched", ephemeral("enriched"))],
            ),
        ]
        .into_iter()
        .collect();

        let mut expander = Expander::new(&units);
        let expanded = expander.expand("model.shop.orders").unwrap();

        assert_eq!(
            expanded.compiled,
            "with __strata__cte__base as (\nselect * from raw.orders\n),\n\
             __strata__cte__enriched as (\nselect * from __strata__cte__base\n)\n\
             select * from __strata__cte__enriched"
        );
        assert_eq!(expanded.ctes.len(), 2);
    }

    #[test]
    fn leading_with_is_merged() {
        let ctes = vec![Cte {
            unique_id: "model.shop.base".into(),
            name: "__strata__cte__base".into(),
            sql: "select 1 as id".into(),
        }];

        assert_eq!(
            inject_ctes("WITH totals as (select 2) select * from totals", &ctes),
            "with __strata__cte__base as (\nselect 1 as id\n),\ntotals as (select 2) select * from totals"
        );
    }

    #[test]
    fn circular_expansion_reports_chain() {
        let units: BTreeMap<_, _> = [
            unit("a", "select * from {{ ref('b') }}", &[("b", ephemeral("b"))]),
            unit("b", "select * from {{ ref('a') }}", &[("a", ephemeral("a"))]),
        ]
        .into_iter()
        .collect();

        let mut expander = Expander::new(&units);
        let error = expander.expand("model.shop.a").unwrap_err();
        assert_eq!(
            error,
            TemplateError::CircularContext {
                chain: vec!["model.shop.a".into(), "model.shop.b".into(), "model.shop.a".into()],
            }
        );
    }

    #[test]
    fn failed_ephemeral_fails_dependents() {
        let units: BTreeMap<_, _> = [
            unit("base", "select {{ var('missing') }}", &[]),
            unit("orders", "select * from {{ ref('base') }}", &[("base", ephemeral("base"))]),
        ]
        .into_iter()
        .collect();

        let mut expander = Expander::new(&units);
        assert!(matches!(
            expander.expand("model.shop.orders"),
            Err(TemplateError::EphemeralFailed { .. })
        ));
        assert!(matches!(
            expander.expand("model.shop.base"),
            Err(TemplateError::MissingVariable { .. })
        ));
    }
}
