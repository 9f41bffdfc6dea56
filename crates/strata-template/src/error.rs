//! Template errors

use strata_core::{Diagnostic, DiagnosticCode};

/// Compile-time template error, scoped to one node
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("Template syntax error in {node}: {message}")]
    Syntax {
        node: String,
        message: String,
        line: Option<usize>,
    },

    #[error("{node} references {reference} which does not exist{}", .hint.as_ref().map(|h| format!(" ({})", h)).unwrap_or_default())]
    UnresolvedReference {
        node: String,
        reference: String,
        hint: Option<String>,
    },

    #[error("{node} calls {reference} which was not found during reference extraction")]
    UndeclaredDependency { node: String, reference: String },

    #[error("Circular template expansion: {}", .chain.join(" -> "))]
    CircularContext { chain: Vec<String> },

    #[error("{node} uses unknown context key '{key}'")]
    UnknownContextKey { node: String, key: String },

    #[error("{node} uses variable '{name}' which is not defined and has no default")]
    MissingVariable { node: String, name: String },

    #[error("{node} uses environment variable '{name}' which is not set and has no default")]
    MissingEnvVar { node: String, name: String },

    #[error("Failed to render {node}: {message}")]
    Render {
        node: String,
        message: String,
        line: Option<usize>,
    },

    #[error("{node} depends on ephemeral {ephemeral} which failed to compile")]
    EphemeralFailed { node: String, ephemeral: String },
}

impl TemplateError {
    /// Node whose compilation failed
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Syntax { node, .. }
            | Self::UnresolvedReference { node, .. }
            | Self::UndeclaredDependency { node, .. }
            | Self::UnknownContextKey { node, .. }
            | Self::MissingVariable { node, .. }
            | Self::MissingEnvVar { node, .. }
            | Self::Render { node, .. }
            | Self::EphemeralFailed { node, .. } => Some(node),
            Self::CircularContext { chain } => chain.first().map(String::as_str),
        }
    }

    pub fn code(&self) -> DiagnosticCode {
        match self {
            Self::Syntax { .. } => DiagnosticCode::TemplateSyntaxError,
            Self::UnresolvedReference { .. } => DiagnosticCode::UnresolvedReference,
            Self::UndeclaredDependency { .. } => DiagnosticCode::UndeclaredDependency,
            Self::CircularContext { .. } => DiagnosticCode::CircularContext,
            Self::UnknownContextKey { .. } => DiagnosticCode::UnknownContextKey,
            Self::MissingVariable { .. } | Self::MissingEnvVar { .. } => DiagnosticCode::MissingVariable,
            Self::Render { .. } | Self::EphemeralFailed { .. } => DiagnosticCode::TemplateRenderError,
        }
    }

    /// Convert to a stable diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        let mut diagnostic = Diagnostic::error(self.code(), self.to_string());

        if let Some(node) = self.node() {
            diagnostic = diagnostic.with_node(node);
        }

        match self {
            Self::UnresolvedReference { reference, .. } | Self::UndeclaredDependency { reference, .. } => {
                diagnostic.with_token(reference.clone())
            }
            Self::UnknownContextKey { key, .. } => diagnostic.with_token(key.clone()),
            Self::MissingVariable { name, .. } | Self::MissingEnvVar { name, .. } => {
                diagnostic.with_token(name.clone())
            }
            Self::CircularContext { chain } => diagnostic.with_related(chain.clone()),
            Self::EphemeralFailed { ephemeral, .. } => diagnostic.with_related(vec![ephemeral.clone()]),
            _ => diagnostic,
        }
    }

    /// Source line, when the template engine reported one
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::Syntax { line, .. } | Self::Render { line, .. } => *line,
            _ => None,
        }
    }
}
