//! Run report schema (stable v1)
//!
//! Written once per run, after every node reached a terminal status.
//! Versioned like the compile report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use strata_core::{ReportVersion, ResourceType};

/// Terminal status of a node in one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Success,

    /// Test with failing rows and `severity = "warn"`; satisfies dependents
    Warn,

    Error,

    /// Never started because of upstream failure, cancellation or a
    /// disabled dependency
    Skipped,

    /// Ephemeral or referenced-only; satisfies dependents without running
    NotRun,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::NotRun => "not-run",
        }
    }

    /// Whether dependents treat this node as failed
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Error | Self::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a node was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A hard parent ended `error` or `skipped`
    UpstreamFailed,

    /// The run was stopped before the node started
    Cancelled,

    /// The node references a disabled definition
    DisabledDependency,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UpstreamFailed => "upstream failed",
            Self::Cancelled => "cancelled",
            Self::DisabledDependency => "disabled dependency",
        })
    }
}

/// Outcome of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub unique_id: String,

    pub resource_type: ResourceType,

    pub status: NodeStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Wall time in seconds, zero for nodes that never ran
    pub elapsed: f64,

    /// Worker that ran the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<usize>,

    /// Executions attempted, retries included
    pub attempts: u32,

    /// Adapter status text or error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Failing rows reported by a test
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,

    /// Ancestor that caused the skip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl NodeResult {
    fn empty(unique_id: &str, resource_type: ResourceType, status: NodeStatus) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            resource_type,
            status,
            started_at: None,
            finished_at: None,
            elapsed: 0.0,
            worker: None,
            attempts: 0,
            message: None,
            failures: None,
            rows_affected: None,
            blocked_by: None,
            skip_reason: None,
        }
    }

    /// A node satisfied without running
    pub fn not_run(unique_id: &str, resource_type: ResourceType, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::empty(unique_id, resource_type, NodeStatus::NotRun)
        }
    }

    /// A node that never started
    pub fn skipped(
        unique_id: &str,
        resource_type: ResourceType,
        reason: SkipReason,
        blocked_by: Option<String>,
    ) -> Self {
        let message = match &blocked_by {
            Some(ancestor) => format!("Skipped ({}): {}", reason, ancestor),
            None => format!("Skipped ({})", reason),
        };
        Self {
            message: Some(message),
            blocked_by,
            skip_reason: Some(reason),
            ..Self::empty(unique_id, resource_type, NodeStatus::Skipped)
        }
    }
}

/// Counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub success: usize,
    pub warn: usize,
    pub error: usize,
    pub skipped: usize,
    pub not_run: usize,
}

impl RunSummary {
    fn count(results: &[NodeResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for result in results {
            match result.status {
                NodeStatus::Success => summary.success += 1,
                NodeStatus::Warn => summary.warn += 1,
                NodeStatus::Error => summary.error += 1,
                NodeStatus::Skipped => summary.skipped += 1,
                NodeStatus::NotRun => summary.not_run += 1,
            }
        }
        summary
    }
}

/// Run-level metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub target_name: String,

    pub adapter: String,

    pub threads: usize,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Wall time of the whole run in seconds
    pub elapsed: f64,

    /// Whether the caller stopped the run before it completed
    pub cancelled: bool,
}

/// Run report
///
/// Lists every node of the executed sub-graph, in scheduling rank order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub version: ReportVersion,

    pub metadata: RunMetadata,

    pub results: Vec<NodeResult>,

    pub summary: RunSummary,
}

impl RunReport {
    pub fn new(metadata: RunMetadata, results: Vec<NodeResult>) -> Self {
        let summary = RunSummary::count(&results);
        Self {
            version: ReportVersion::CURRENT,
            metadata,
            results,
            summary,
        }
    }

    /// False when any node ended `error` or `skipped`
    pub fn success(&self) -> bool {
        self.summary.error == 0 && self.summary.skipped == 0
    }

    pub fn get(&self, unique_id: &str) -> Option<&NodeResult> {
        self.results.iter().find(|r| r.unique_id == unique_id)
    }

    /// Status of a node, if it was part of the run
    pub fn status(&self, unique_id: &str) -> Option<NodeStatus> {
        self.get(unique_id).map(|r| r.status)
    }

    pub fn with_status(&self, status: NodeStatus) -> impl Iterator<Item = &NodeResult> {
        self.results.iter().filter(move |r| r.status == status)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn metadata() -> RunMetadata {
        let now = Utc::now();
        RunMetadata {
            target_name: "dev".into(),
            adapter: "mock".into(),
            threads: 4,
            started_at: now,
            finished_at: now,
            elapsed: 0.0,
            cancelled: false,
        }
    }

    fn success(id: &str) -> NodeResult {
        NodeResult {
            attempts: 1,
            ..NodeResult::empty(id, ResourceType::Model, NodeStatus::Success)
        }
    }

    #[test]
    fn warn_and_not_run_count_as_success() {
        let report = RunReport::new(
            metadata(),
            vec![
                success("model.shop.orders"),
                NodeResult::not_run("model.shop.stg_orders", ResourceType::Model, "ephemeral"),
                NodeResult {
                    failures: Some(2),
                    ..NodeResult::empty("test.shop.unique_orders_id", ResourceType::Test, NodeStatus::Warn)
                },
            ],
        );
        assert!(report.success());
        assert_eq!(report.summary.warn, 1);
        assert_eq!(report.summary.not_run, 1);
    }

    #[test]
    fn skipped_fails_the_run() {
        let report = RunReport::new(
            metadata(),
            vec![NodeResult::skipped(
                "model.shop.orders",
                ResourceType::Model,
                SkipReason::UpstreamFailed,
                Some("model.shop.stg_orders".into()),
            )],
        );
        assert!(!report.success());
        assert_eq!(
            report.get("model.shop.orders").unwrap().message.as_deref(),
            Some("Skipped (upstream failed): model.shop.stg_orders")
        );
    }

    #[test]
    fn statuses_serialise_in_kebab_case() {
        let json = serde_json::to_string(&NodeStatus::NotRun).unwrap();
        assert_eq!(json, "\"not-run\"");
        let json = serde_json::to_string(&SkipReason::UpstreamFailed).unwrap();
        assert_eq!(json, "\"upstream_failed\"");
    }

    #[test]
    fn report_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target").join("run_results.json");
        let report = RunReport::new(metadata(), vec![success("model.shop.orders")]);

        report.save_to_file(&path).unwrap();
        let loaded: RunReport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, report);
    }
}
