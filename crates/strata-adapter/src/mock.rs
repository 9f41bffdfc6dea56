//! Mock backend adapter for testing
//!
//! This adapter executes nothing. It returns scripted outcomes and records
//! every call, which makes it useful for:
//! - Unit testing scheduling order and concurrency bounds
//! - Simulating backend failures, flaky statements and hung queries
//! - Exercising timeouts and cancellation without a live database
//! - Dry runs from the command line (`--adapter mock`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use strata_adapter::{MockAdapter, BackendAdapter, ExecutionRequest};
//! use std::time::Duration;
//!
//! let adapter = MockAdapter::new()
//!     .with_latency(Duration::from_millis(20))
//!     .with_failure("model.shop.orders", "relation \"raw.orders\" does not exist")
//!     .with_scalar("test.shop.unique_orders_id", 3);
//!
//! let mut connection = adapter.open().await?;
//! let outcome = adapter.execute(&mut connection, &request).await;
//! assert_eq!(adapter.peak_concurrency(), 1);
//! ```

use crate::adapter::{AdapterError, BackendAdapter, ExecutionOutcome, ExecutionRequest};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strata_core::Materialization;
use tokio::sync::Notify;

/// Connection handle handed out by [`MockAdapter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockConnection {
    pub id: usize,
}

/// How a recorded execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedResult {
    /// Still running
    Running,
    Success,
    Failed(String),
    /// Aborted, or dropped by the caller before it finished
    Aborted,
}

/// One call to `execute`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub unique_id: String,
    pub connection: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: RecordedResult,
}

impl ExecutionRecord {
    /// Whether two executions were running at the same time
    pub fn overlaps(&self, other: &ExecutionRecord) -> bool {
        let self_end = self.finished_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
        let other_end = other.finished_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.started_at < other_end && other.started_at < self_end
    }
}

#[derive(Default)]
struct Recorder {
    executions: Vec<ExecutionRecord>,
    in_flight: HashSet<String>,
    abort_requested: HashSet<String>,
    aborted: Vec<String>,
    flaky_remaining: HashMap<String, u32>,
}

/// Mock backend adapter
///
/// Scripted behavior is fixed at construction with the `with_*` builders;
/// everything observed at run time is available through the accessors.
///
/// # Example
///
/// ```rust,ignore
/// let adapter = MockAdapter::new()
///     .with_hang("model.shop.slow")       // never finishes unless aborted
///     .with_flaky("model.shop.orders", 2); // fails twice, then succeeds
/// ```
pub struct MockAdapter {
    /// Nodes that always fail, with their error message
    failures: HashMap<String, String>,

    /// Failing row counts returned by tests (default 0)
    scalars: HashMap<String, u64>,

    /// Nodes that block until aborted
    hangs: HashSet<String>,

    /// Latency applied to every execution
    latency: Duration,

    /// Per-node latency overrides
    node_latency: HashMap<String, Duration>,

    /// Fail every `open`
    fail_open: bool,

    recorder: Mutex<Recorder>,
    abort_signal: Notify,
    opened: AtomicUsize,
    closed: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl MockAdapter {
    /// Create a mock adapter where every execution succeeds immediately
    pub fn new() -> Self {
        Self {
            failures: HashMap::new(),
            scalars: HashMap::new(),
            hangs: HashSet::new(),
            latency: Duration::ZERO,
            node_latency: HashMap::new(),
            fail_open: false,
            recorder: Mutex::new(Recorder::default()),
            abort_signal: Notify::new(),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Fail every execution of `unique_id`
    pub fn with_failure(mut self, unique_id: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(unique_id.into(), message.into());
        self
    }

    /// Fail the first `times` executions of `unique_id`, then succeed
    pub fn with_flaky(self, unique_id: impl Into<String>, times: u32) -> Self {
        self.recorder().flaky_remaining.insert(unique_id.into(), times);
        self
    }

    /// Failing row count a test query returns
    pub fn with_scalar(mut self, unique_id: impl Into<String>, failures: u64) -> Self {
        self.scalars.insert(unique_id.into(), failures);
        self
    }

    /// Block every execution of `unique_id` until it is aborted
    pub fn with_hang(mut self, unique_id: impl Into<String>) -> Self {
        self.hangs.insert(unique_id.into());
        self
    }

    /// Simulated latency for every execution
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Simulated latency for one node
    pub fn with_node_latency(mut self, unique_id: impl Into<String>, latency: Duration) -> Self {
        self.node_latency.insert(unique_id.into(), latency);
        self
    }

    /// Fail every `open` call
    pub fn with_open_failure(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Every execution so far, in start order
    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.recorder().executions.clone()
    }

    /// Ids of executed nodes, in start order (retries appear repeatedly)
    pub fn executed_ids(&self) -> Vec<String> {
        self.recorder().executions.iter().map(|e| e.unique_id.clone()).collect()
    }

    /// Number of times `unique_id` was executed
    pub fn execution_count(&self, unique_id: &str) -> usize {
        self.recorder().executions.iter().filter(|e| e.unique_id == unique_id).count()
    }

    /// Ids passed to `abort`, in call order
    pub fn aborted(&self) -> Vec<String> {
        self.recorder().aborted.clone()
    }

    /// Highest number of executions observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn recorder(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, unique_id: &str, connection: usize) -> InFlight<'_> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let mut recorder = self.recorder();
        recorder.in_flight.insert(unique_id.to_string());
        recorder.executions.push(ExecutionRecord {
            unique_id: unique_id.to_string(),
            connection,
            started_at: Utc::now(),
            finished_at: None,
            result: RecordedResult::Running,
        });

        InFlight {
            adapter: self,
            unique_id: unique_id.to_string(),
            index: recorder.executions.len() - 1,
            result: RecordedResult::Aborted,
        }
    }

    /// Sleep for `duration` (forever when `None`) unless aborted first
    async fn wait(&self, unique_id: &str, duration: Option<Duration>) -> Result<(), AdapterError> {
        let sleep = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(sleep);

        loop {
            let notified = self.abort_signal.notified();
            if self.recorder().abort_requested.remove(unique_id) {
                return Err(AdapterError::Aborted(unique_id.to_string()));
            }
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                _ = notified => {}
            }
        }
    }

    fn scripted_outcome(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, AdapterError> {
        let id = request.unique_id.as_str();

        if let Some(message) = self.failures.get(id) {
            return Err(AdapterError::ExecutionError(message.clone()));
        }

        {
            let mut recorder = self.recorder();
            if let Some(remaining) = recorder.flaky_remaining.get_mut(id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(AdapterError::ExecutionError(format!("transient failure in {}", id)));
                }
            }
        }

        if request.is_test() {
            let failures = self.scalars.get(id).copied().unwrap_or(0);
            return Ok(ExecutionOutcome::new(format!("SELECT {}", failures)).with_failures(failures));
        }

        let message = match request.materialization() {
            Materialization::View => "CREATE VIEW",
            Materialization::Table => "CREATE TABLE",
            Materialization::Incremental => "INSERT",
            Materialization::Ephemeral => "OK",
        };
        Ok(ExecutionOutcome::new(message))
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks one running execution; finalises its record when dropped
struct InFlight<'a> {
    adapter: &'a MockAdapter,
    unique_id: String,
    index: usize,
    result: RecordedResult,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let result = std::mem::replace(&mut self.result, RecordedResult::Aborted);
        let mut recorder = self.adapter.recorder();
        recorder.in_flight.remove(&self.unique_id);
        recorder.abort_requested.remove(&self.unique_id);
        if let Some(record) = recorder.executions.get_mut(self.index) {
            record.finished_at = Some(Utc::now());
            record.result = result;
        }
        drop(recorder);
        self.adapter.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl BackendAdapter for MockAdapter {
    type Connection = MockConnection;

    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(&self) -> Result<MockConnection, AdapterError> {
        if self.fail_open {
            return Err(AdapterError::ConnectionError("mock connection refused".to_string()));
        }
        let id = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection { id })
    }

    async fn execute(
        &self,
        connection: &mut MockConnection,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome, AdapterError> {
        let id = request.unique_id.as_str();
        let mut in_flight = self.start(id, connection.id);

        let duration = if self.hangs.contains(id) {
            None
        } else {
            Some(self.node_latency.get(id).copied().unwrap_or(self.latency))
        };
        self.wait(id, duration).await?;

        let outcome = self.scripted_outcome(request);
        in_flight.result = match &outcome {
            Ok(_) => RecordedResult::Success,
            Err(e) => RecordedResult::Failed(e.to_string()),
        };
        outcome
    }

    async fn close(&self, _connection: MockConnection) -> Result<(), AdapterError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self, unique_id: &str) -> Result<(), AdapterError> {
        {
            let mut recorder = self.recorder();
            recorder.aborted.push(unique_id.to_string());
            // An abort never outlives the execution it was meant for
            if !recorder.in_flight.contains(unique_id) {
                return Ok(());
            }
            recorder.abort_requested.insert(unique_id.to_string());
        }
        self.abort_signal.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use strata_core::Relation;

    fn model(id: &str) -> ExecutionRequest {
        ExecutionRequest::model(id, "select 1", Relation::new(None, "analytics", id))
    }

    #[tokio::test]
    async fn succeeds_by_default() {
        let adapter = MockAdapter::new();
        let mut connection = adapter.open().await.unwrap();

        let outcome = adapter.execute(&mut connection, &model("model.shop.orders")).await.unwrap();
        assert_eq!(outcome.message, "CREATE VIEW");

        let records = adapter.executions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result, RecordedResult::Success);
        assert!(records[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn scripted_failure_and_scalar() {
        let adapter = MockAdapter::new()
            .with_failure("model.shop.orders", "boom")
            .with_scalar("test.shop.unique_orders_id", 2);
        let mut connection = adapter.open().await.unwrap();

        let error = adapter.execute(&mut connection, &model("model.shop.orders")).await.unwrap_err();
        assert_eq!(error, AdapterError::ExecutionError("boom".into()));

        let test = ExecutionRequest::test("test.shop.unique_orders_id", "select count(*) as failures");
        let outcome = adapter.execute(&mut connection, &test).await.unwrap();
        assert_eq!(outcome.failures, Some(2));
    }

    #[tokio::test]
    async fn flaky_node_recovers() {
        let adapter = MockAdapter::new().with_flaky("model.shop.orders", 1);
        let mut connection = adapter.open().await.unwrap();

        assert!(adapter.execute(&mut connection, &model("model.shop.orders")).await.is_err());
        assert!(adapter.execute(&mut connection, &model("model.shop.orders")).await.is_ok());
        assert_eq!(adapter.execution_count("model.shop.orders"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hang_ends_on_abort() {
        let adapter = Arc::new(MockAdapter::new().with_hang("model.shop.slow"));
        let runner = Arc::clone(&adapter);
        let handle = tokio::spawn(async move {
            let mut connection = runner.open().await.unwrap();
            runner.execute(&mut connection, &model("model.shop.slow")).await
        });

        while adapter.executions().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        adapter.abort("model.shop.slow").await.unwrap();

        let result = handle.await.unwrap();
        assert_eq!(result, Err(AdapterError::Aborted("model.shop.slow".into())));
        assert_eq!(adapter.aborted(), vec!["model.shop.slow".to_string()]);
        assert_eq!(adapter.executions()[0].result, RecordedResult::Aborted);
    }

    #[tokio::test]
    async fn abort_of_idle_node_is_ignored() {
        let adapter = MockAdapter::new();
        adapter.abort("model.shop.orders").await.unwrap();
        assert_eq!(adapter.aborted(), vec!["model.shop.orders".to_string()]);

        let mut connection = adapter.open().await.unwrap();
        assert!(adapter.execute(&mut connection, &model("model.shop.orders")).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_execution_is_recorded_as_aborted() {
        let adapter = MockAdapter::new().with_latency(Duration::from_secs(5));
        let mut connection = adapter.open().await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            adapter.execute(&mut connection, &model("model.shop.orders")),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(adapter.executions()[0].result, RecordedResult::Aborted);
        assert_eq!(adapter.peak_concurrency(), 1);
    }

    #[test]
    fn overlap_uses_open_intervals() {
        let start = Utc::now();
        let record = |offset: i64, length: i64| ExecutionRecord {
            unique_id: "x".into(),
            connection: 0,
            started_at: start + chrono::Duration::milliseconds(offset),
            finished_at: Some(start + chrono::Duration::milliseconds(offset + length)),
            result: RecordedResult::Success,
        };
        assert!(record(0, 10).overlaps(&record(5, 10)));
        assert!(!record(0, 10).overlaps(&record(10, 10)));
    }
}
