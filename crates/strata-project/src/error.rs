//! Loader errors

use strata_core::{Diagnostic, DiagnosticCode, Location};

/// File-level loading error
///
/// Collected per file; one bad file never aborts loading of the others.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error("Project file not found: {0}")]
    MissingProjectFile(String),

    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Malformed config in {path}: {message}")]
    MalformedConfig { path: String, message: String },

    #[error("Duplicate {resource} '{name}' in package '{package}' ({first} and {second})")]
    DuplicateDefinition {
        resource: String,
        package: String,
        name: String,
        first: String,
        second: String,
    },
}

impl LoadError {
    /// File the error was raised for
    pub fn path(&self) -> &str {
        match self {
            Self::MissingProjectFile(path) => path,
            Self::Io { path, .. } => path,
            Self::MalformedConfig { path, .. } => path,
            Self::DuplicateDefinition { second, .. } => second,
        }
    }

    /// Convert to a stable diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        let code = match self {
            Self::MissingProjectFile(_) | Self::Io { .. } => DiagnosticCode::LoadIoError,
            Self::MalformedConfig { .. } => DiagnosticCode::LoadMalformedConfig,
            Self::DuplicateDefinition { .. } => DiagnosticCode::LoadDuplicateDefinition,
        };

        let diagnostic = Diagnostic::error(code, self.to_string())
            .with_location(Location::new(self.path()));

        match self {
            Self::DuplicateDefinition { first, name, .. } => diagnostic
                .with_token(name.clone())
                .with_related(vec![first.clone()]),
            _ => diagnostic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_both_files() {
        let error = LoadError::DuplicateDefinition {
            resource: "model".into(),
            package: "shop".into(),
            name: "orders".into(),
            first: "models/a/orders.sql".into(),
            second: "models/b/orders.sql".into(),
        };

        let diagnostic = error.to_diagnostic();
        assert_eq!(diagnostic.code, DiagnosticCode::LoadDuplicateDefinition);
        assert!(diagnostic.message.contains("models/a/orders.sql"));
        assert!(diagnostic.message.contains("models/b/orders.sql"));
        assert_eq!(diagnostic.related, vec!["models/a/orders.sql".to_string()]);
    }
}
