//! Strata Core
//!
//! Core domain model shared by the compiler and the executor.
//! Never rename diagnostic codes - they are part of the public API.

pub mod diagnostic;
pub mod resource;
pub mod report;
pub mod config;

pub use diagnostic::{Diagnostic, DiagnosticCode, Severity, Location};
pub use resource::{ResourceType, DefinitionKind, TestType, Relation, checksum};
pub use report::{Report, ReportSummary, ReportVersion};
pub use config::{
    ConfigError, ConfigScope, Materialization, NodeConfig, PartialConfig, ProfilesConfig,
    ProjectConfig, TargetConfig, TestSeverity, UpstreamFailurePolicy, glob_match,
};
