//! Strata engine - concurrency-bounded execution of compiled manifests
//!
//! This crate implements the scheduler side of a run:
//! - Execution plans built from a manifest selection
//! - A worker pool pulling eligible nodes in deterministic rank order
//! - Skip propagation along dependency edges, per-node skip policies
//! - Timeouts, retries, fail-fast and external cancellation
//! - The run report

pub mod config;
pub mod error;
pub mod executor;
pub mod plan;
pub mod report;
pub mod stop;

pub use config::RunConfig;
pub use error::NodeError;
pub use executor::Executor;
pub use plan::{ExecutionPlan, PlanAction, PlanNode};
pub use report::{NodeResult, NodeStatus, RunMetadata, RunReport, RunSummary, SkipReason};
pub use stop::StopHandle;
