//! Template resolution for strata definitions
//!
//! This crate handles:
//! - Pass 1: extracting `ref()`, `source()` and `config()` calls without evaluation
//! - Pass 2: rendering with a fixed, typed context (ref, source, var, env_var, ...)
//! - Interpolating ephemeral models as CTEs, with circular expansion detection
//! - Error handling with stable diagnostics

pub mod context;
pub mod error;
pub mod expand;
pub mod extract;
mod functions;
pub mod references;
pub mod render;

pub use context::{ContextKey, ModelContext, TargetContext, TemplateContext};
pub use error::TemplateError;
pub use expand::{inject_ctes, Cte, Expanded, Expander, ExpansionUnit};
pub use extract::{extract, scan, validate_syntax, Extraction, RefCall, SourceCall};
pub use references::{cte_name, ReferenceTable, ResolvedRef, CTE_PREFIX};
pub use render::{has_template_syntax, render, Rendered};
