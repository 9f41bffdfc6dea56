//! Diagnostic codes and error reporting
//!
//! IMPORTANT: Diagnostic codes are versioned and stable.
//! NEVER rename or remove codes - they are part of the public API.
//! Add new codes with new names only.

use serde::{Deserialize, Serialize};

/// Diagnostic code registry (v1)
///
/// These codes are STABLE and VERSIONED.
/// Do NOT rename or remove codes - only add new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticCode {
    // Loading (1xxx)
    /// A project file could not be read
    LoadIoError,

    /// A declared-config block or schema file is malformed
    LoadMalformedConfig,

    /// Two definitions share a name within one namespace
    LoadDuplicateDefinition,

    /// A schema-file patch names a definition that does not exist
    LoadOrphanPatch,

    // Templates (2xxx)
    /// Template body cannot be parsed
    TemplateSyntaxError,

    /// A reference names no known definition or source
    UnresolvedReference,

    /// Expanding a node transitively requires expanding itself
    CircularContext,

    /// A reference only discovered during expansion
    UndeclaredDependency,

    /// Template looked up a name outside the fixed context
    UnknownContextKey,

    /// Template failed during rendering
    TemplateRenderError,

    /// var() called for an undefined variable without default
    MissingVariable,

    // Graph (3xxx)
    /// The dependency relation contains a cycle
    GraphCycle,

    /// A node references a disabled definition
    DisabledDependency,

    /// A selected node was dropped because an ancestor is unavailable
    SelectionPruned,

    // General (9xxx)
    /// General informational message
    Info,

    /// General warning message
    Warning,
}

impl DiagnosticCode {
    /// Get the diagnostic code as a stable string identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadIoError => "LOAD_IO_ERROR",
            Self::LoadMalformedConfig => "LOAD_MALFORMED_CONFIG",
            Self::LoadDuplicateDefinition => "LOAD_DUPLICATE_DEFINITION",
            Self::LoadOrphanPatch => "LOAD_ORPHAN_PATCH",
            Self::TemplateSyntaxError => "TEMPLATE_SYNTAX_ERROR",
            Self::UnresolvedReference => "UNRESOLVED_REFERENCE",
            Self::CircularContext => "CIRCULAR_CONTEXT",
            Self::UndeclaredDependency => "UNDECLARED_DEPENDENCY",
            Self::UnknownContextKey => "UNKNOWN_CONTEXT_KEY",
            Self::TemplateRenderError => "TEMPLATE_RENDER_ERROR",
            Self::MissingVariable => "MISSING_VARIABLE",
            Self::GraphCycle => "GRAPH_CYCLE",
            Self::DisabledDependency => "DISABLED_DEPENDENCY",
            Self::SelectionPruned => "SELECTION_PRUNED",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
        }
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Diagnostic severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational message
    Info,

    /// Warning - should be reviewed but not blocking
    Warn,

    /// Error - blocks the compile
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Source location in a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// File path relative to project root
    pub file: String,

    /// Optional line number (1-indexed)
    pub line: Option<usize>,

    /// Optional column number (1-indexed)
    pub column: Option<usize>,
}

impl Location {
    /// Create a new location with just a file path
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
            column: None,
        }
    }

    /// Create a location with file and line number
    pub fn with_line(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line: Some(line),
            column: None,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "{}:{}:{}", self.file, line, column),
            (Some(line), None) => write!(f, "{}:{}", self.file, line),
            _ => write!(f, "{}", self.file),
        }
    }
}

/// A diagnostic message with structured metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable diagnostic code
    pub code: DiagnosticCode,

    /// Severity level
    pub severity: Severity,

    /// Human-readable message
    pub message: String,

    /// Unique id of the definition the diagnostic is about, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Source location (best-effort)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,

    /// Offending token, e.g. the unresolved reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Related node ids (cycle path, circular chain, pruned descendants)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with minimal fields
    pub fn new(code: DiagnosticCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            node: None,
            location: None,
            token: None,
            related: Vec::new(),
        }
    }

    /// Shorthand for an error-severity diagnostic
    pub fn error(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Error, message)
    }

    /// Shorthand for a warning-severity diagnostic
    pub fn warn(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Warn, message)
    }

    /// Set the node the diagnostic belongs to
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Set the location
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Set the offending token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set related node ids
    pub fn with_related(mut self, related: Vec<String>) -> Self {
        self.related = related;
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.code, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " (at {})", location)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_code_stability() {
        // Ensure codes are stable strings
        assert_eq!(DiagnosticCode::UnresolvedReference.as_str(), "UNRESOLVED_REFERENCE");
        assert_eq!(DiagnosticCode::GraphCycle.as_str(), "GRAPH_CYCLE");
        assert_eq!(DiagnosticCode::CircularContext.to_string(), "CIRCULAR_CONTEXT");
    }

    #[test]
    fn diagnostic_serialization() {
        let diag = Diagnostic::error(
            DiagnosticCode::UnresolvedReference,
            "Model 'orders' references unknown node 'customers'",
        )
        .with_node("model.shop.orders")
        .with_token("customers")
        .with_location(Location::with_line("models/orders.sql", 3));

        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("UNRESOLVED_REFERENCE"));
        assert!(json.contains("\"error\""));
        assert!(json.contains("\"token\":\"customers\""));
        assert!(!json.contains("related"));
    }

    #[test]
    fn location_display() {
        assert_eq!(Location::new("a.sql").to_string(), "a.sql");
        assert_eq!(Location::with_line("a.sql", 4).to_string(), "a.sql:4");
    }
}
