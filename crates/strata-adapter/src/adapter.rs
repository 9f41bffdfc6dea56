//! Backend adapter capability trait
//!
//! The executor only ever talks to a backend through [`BackendAdapter`]:
//! open a connection, execute one compiled body on it, close it.

use serde::{Deserialize, Serialize};
use std::fmt;
use strata_core::{Materialization, NodeConfig, Relation, ResourceType};

/// One node's work, as handed to an adapter
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// Unique id of the node being executed
    pub unique_id: String,

    /// Model or test
    pub resource_type: ResourceType,

    /// Fully expanded body (no template syntax left)
    pub compiled_body: String,

    /// Relation the node builds; `None` for tests
    pub relation: Option<Relation>,

    /// Resolved node configuration
    pub config: NodeConfig,

    /// Rebuild incremental models from scratch
    pub full_refresh: bool,
}

impl ExecutionRequest {
    /// Request for a model
    pub fn model(unique_id: impl Into<String>, compiled_body: impl Into<String>, relation: Relation) -> Self {
        Self {
            unique_id: unique_id.into(),
            resource_type: ResourceType::Model,
            compiled_body: compiled_body.into(),
            relation: Some(relation),
            config: NodeConfig::default(),
            full_refresh: false,
        }
    }

    /// Request for a test
    pub fn test(unique_id: impl Into<String>, compiled_body: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            resource_type: ResourceType::Test,
            compiled_body: compiled_body.into(),
            relation: None,
            config: NodeConfig::default(),
            full_refresh: false,
        }
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_full_refresh(mut self, full_refresh: bool) -> Self {
        self.full_refresh = full_refresh;
        self
    }

    pub fn materialization(&self) -> Materialization {
        self.config.materialized
    }

    pub fn is_test(&self) -> bool {
        self.resource_type == ResourceType::Test
    }
}

/// What the backend reported for a successful execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Short status text ("CREATE VIEW", "SELECT 1", ...)
    pub message: String,

    /// Rows written, when the backend reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,

    /// Failing row count returned by a test query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures: Option<u64>,
}

impl ExecutionOutcome {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows_affected = Some(rows);
        self
    }

    pub fn with_failures(mut self, failures: u64) -> Self {
        self.failures = Some(failures);
        self
    }
}

/// Errors raised by a backend adapter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("Execution failed: {0}")]
    ExecutionError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Execution aborted: {0}")]
    Aborted(String),

    #[error("Connection pool is closed")]
    PoolClosed,
}

impl AdapterError {
    /// Whether retrying the same statement could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionError(_) | Self::ExecutionError(_))
    }
}

/// Capability interface of a storage backend
///
/// Implementations must be shareable across worker tasks. A connection is
/// owned by one worker at a time; [`BackendAdapter::abort`] is called from a
/// different task while that worker is still inside `execute`, so aborts are
/// addressed by node id rather than by connection.
#[async_trait::async_trait]
pub trait BackendAdapter: Send + Sync + 'static {
    /// Live connection handle
    type Connection: Send + 'static;

    /// Adapter name (e.g., "mock", "postgres")
    fn name(&self) -> &'static str;

    /// Open a new connection
    async fn open(&self) -> Result<Self::Connection, AdapterError>;

    /// Execute one node's compiled body
    async fn execute(
        &self,
        connection: &mut Self::Connection,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, AdapterError>;

    /// Close a connection
    async fn close(&self, connection: Self::Connection) -> Result<(), AdapterError>;

    /// Abort the in-flight execution of `unique_id`, if any
    async fn abort(&self, _unique_id: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Check credentials by opening and closing one connection
    async fn test_connection(&self) -> Result<(), AdapterError> {
        let connection = self.open().await?;
        self.close(connection).await
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(rows) = self.rows_affected {
            write!(f, " ({} rows)", rows)?;
        }
        if let Some(failures) = self.failures {
            write!(f, " ({} failures)", failures)?;
        }
        Ok(())
    }
}
