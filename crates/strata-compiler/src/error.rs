//! Compile errors

use strata_core::{Report, Severity};

/// A compile that produced at least one error diagnostic
///
/// Carries every diagnostic of the compile, not just the first.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Compilation failed with {} error(s)", .report.summary.errors)]
pub struct CompileFailure {
    pub report: Report,
}

impl CompileFailure {
    /// Messages of the error diagnostics, in report order
    pub fn messages(&self) -> Vec<String> {
        self.report
            .diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| d.message.clone())
            .collect()
    }
}

/// Errors raised before a compile starts
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("Invalid --vars: {0}")]
    InvalidVars(String),
}
