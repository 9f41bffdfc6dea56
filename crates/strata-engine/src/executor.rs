//! Concurrency-bounded executor
//!
//! Runs an [`ExecutionPlan`] on a fixed number of worker tasks. Each worker
//! takes the lowest-ranked eligible node from a shared ready queue, checks
//! out one pooled connection and executes the node through the adapter.
//!
//! Per node, across one run:
//!
//! ```text
//! pending -> ready -> running -> success | warn | error
//!    \
//!     +-> skipped   (upstream failure, cancellation or disabled dependency)
//!     +-> not-run   (ephemeral or referenced-only)
//! ```
//!
//! A node's fate is decided as soon as its parents allow it: under the
//! default `any` policy the first failing hard parent skips it at once, and
//! the skip cascades down the graph in the same step. Unrelated branches
//! keep running.

use crate::config::RunConfig;
use crate::error::NodeError;
use crate::plan::{ExecutionPlan, PlanAction, PlanNode};
use crate::report::{NodeResult, NodeStatus, RunMetadata, RunReport, SkipReason};
use crate::stop::StopHandle;
use chrono::Utc;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use strata_adapter::{BackendAdapter, ConnectionPool, ExecutionOutcome, ExecutionRequest};
use strata_core::{TestSeverity, UpstreamFailurePolicy};
use strata_graph::{Manifest, Selection};
use tokio::sync::Notify;
use tokio::task::JoinSet;

/// Executes plans against one backend adapter
pub struct Executor<A: BackendAdapter> {
    adapter: Arc<A>,
    config: RunConfig,
    stop: StopHandle,
}

impl<A: BackendAdapter> Executor<A> {
    pub fn new(adapter: Arc<A>, config: RunConfig) -> Self {
        Self {
            adapter,
            config,
            stop: StopHandle::new(),
        }
    }

    /// Use an externally owned stop handle (e.g., wired to Ctrl-C)
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Handle that cancels runs of this executor
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Plan and execute a selection of the manifest
    pub async fn run_selection(&self, manifest: &Manifest, selection: &Selection) -> RunReport {
        let plan = ExecutionPlan::build(manifest, selection, self.config.full_refresh);
        self.run(plan).await
    }

    /// Execute a plan to completion or cancellation
    ///
    /// Always returns a report covering every plan node.
    pub async fn run(&self, plan: ExecutionPlan) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let threads = self.config.threads.min(plan.executable_count()).max(1);

        tracing::info!(
            nodes = plan.len(),
            executable = plan.executable_count(),
            threads,
            adapter = self.adapter.name(),
            "starting run"
        );

        let pool = Arc::new(ConnectionPool::new(Arc::clone(&self.adapter), threads));
        let run = Arc::new(Run::new(plan, pool, self.config.clone(), self.stop.clone()));
        run.seed();

        let mut workers = JoinSet::new();
        for worker in 0..threads {
            workers.spawn(Arc::clone(&run).work(worker));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                // A lost worker would leave its node undecided forever
                tracing::error!(error = %e, "worker task failed, stopping run");
                run.halt.stop();
            }
        }

        run.cancel_remaining();
        if let Err(e) = run.pool.shutdown().await {
            tracing::warn!(error = %e, "failed to close connection pool");
        }

        let metadata = RunMetadata {
            target_name: self.config.target.name.clone(),
            adapter: self.adapter.name().to_string(),
            threads,
            started_at,
            finished_at: Utc::now(),
            elapsed: clock.elapsed().as_secs_f64(),
            cancelled: self.stop.is_stopped(),
        };
        let report = RunReport::new(metadata, run.collect());

        tracing::info!(
            success = report.summary.success,
            warn = report.summary.warn,
            error = report.summary.error,
            skipped = report.summary.skipped,
            not_run = report.summary.not_run,
            elapsed = report.metadata.elapsed,
            "run finished"
        );
        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Ready,
    Running,
    Done,
}

enum Decision {
    Wait,
    Ready,
    Skip,
}

/// Scheduling state, guarded by one lock
struct Scheduling {
    ready: BinaryHeap<Reverse<usize>>,
    phase: Vec<Phase>,

    /// Parents that have not reached a terminal status
    waiting_on: Vec<usize>,

    /// Hard parents that ended `error` or `skipped`
    failed_hard: Vec<usize>,

    /// First hard parent that blocked the node
    blocker: Vec<Option<usize>>,

    undecided: usize,
}

/// State shared by the workers of one run
struct Run<A: BackendAdapter> {
    plan: ExecutionPlan,
    results: Vec<OnceLock<NodeResult>>,
    state: Mutex<Scheduling>,
    wake: Notify,
    pool: Arc<ConnectionPool<A>>,
    config: RunConfig,

    /// Caller's stop handle, never stopped by the run itself
    stop: StopHandle,

    /// Run-local stop, raised by fail-fast or a lost worker
    halt: StopHandle,
}

impl<A: BackendAdapter> Run<A> {
    fn new(plan: ExecutionPlan, pool: Arc<ConnectionPool<A>>, config: RunConfig, stop: StopHandle) -> Self {
        let len = plan.len();
        let state = Scheduling {
            ready: BinaryHeap::new(),
            phase: vec![Phase::Pending; len],
            waiting_on: plan.nodes().iter().map(PlanNode::parent_count).collect(),
            failed_hard: vec![0; len],
            blocker: vec![None; len],
            undecided: len,
        };
        Self {
            results: (0..len).map(|_| OnceLock::new()).collect(),
            plan,
            state: Mutex::new(state),
            wake: Notify::new(),
            pool,
            config,
            stop,
            halt: StopHandle::new(),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stop.is_stopped() || self.halt.is_stopped()
    }

    async fn stopped(&self) {
        tokio::select! {
            _ = self.stop.stopped() => {}
            _ = self.halt.stopped() => {}
        }
    }

    fn state(&self) -> MutexGuard<'_, Scheduling> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle pruned nodes and queue every node without parents
    fn seed(&self) {
        let mut state = self.state();
        for (rank, node) in self.plan.nodes().iter().enumerate() {
            if let PlanAction::Prune { blocked_by } = &node.action {
                let result = NodeResult::skipped(
                    &node.unique_id,
                    node.resource_type,
                    SkipReason::DisabledDependency,
                    Some(blocked_by.clone()),
                );
                self.settle(&mut state, rank, result);
            }
        }
        for rank in 0..self.plan.len() {
            if state.phase[rank] == Phase::Pending && state.waiting_on[rank] == 0 {
                if let Some(result) = self.make_ready(&mut state, rank) {
                    self.settle(&mut state, rank, result);
                }
            }
        }
        drop(state);
        self.wake.notify_waiters();
    }

    /// Worker loop: pull the lowest-ranked ready node until nothing is left
    async fn work(self: Arc<Self>, worker: usize) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.state();
                if state.undecided == 0 || self.is_stopped() {
                    return;
                }
                match state.ready.pop() {
                    Some(Reverse(rank)) => {
                        state.phase[rank] = Phase::Running;
                        Some(rank)
                    }
                    None => None,
                }
            };

            match next {
                Some(rank) => {
                    let result = self.execute(rank, worker).await;
                    let failed = result.status == NodeStatus::Error;

                    let mut state = self.state();
                    self.settle(&mut state, rank, result);
                    drop(state);

                    if failed && self.config.fail_fast && !self.is_stopped() {
                        tracing::info!(worker, "fail-fast: cancelling the rest of the run");
                        self.halt.stop();
                    }
                    self.wake.notify_waiters();
                }
                None => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.stopped() => {}
                    }
                }
            }
        }
    }

    /// Record a terminal result and decide every dependent it unblocks
    fn settle(&self, state: &mut Scheduling, rank: usize, result: NodeResult) {
        let mut work = vec![(rank, result)];

        while let Some((rank, result)) = work.pop() {
            let blocks = result.status.blocks_dependents();
            if self.results[rank].set(result).is_err() {
                continue;
            }
            state.phase[rank] = Phase::Done;
            state.undecided -= 1;

            let Some(node) = self.plan.get(rank) else {
                continue;
            };
            for &child in &node.children {
                if state.phase[child] != Phase::Pending {
                    continue;
                }
                state.waiting_on[child] = state.waiting_on[child].saturating_sub(1);

                let Some(child_node) = self.plan.get(child) else {
                    continue;
                };
                if blocks && child_node.hard_parents.contains(&rank) {
                    state.failed_hard[child] += 1;
                    state.blocker[child].get_or_insert(rank);
                }

                match decide(state, child, child_node) {
                    Decision::Wait => {}
                    Decision::Ready => {
                        if let Some(settled) = self.make_ready(state, child) {
                            work.push((child, settled));
                        }
                    }
                    Decision::Skip => {
                        let reason = if self.is_stopped() {
                            SkipReason::Cancelled
                        } else {
                            SkipReason::UpstreamFailed
                        };
                        let blocked_by = state.blocker[child].and_then(|b| self.plan.get(b)).map(|b| b.unique_id.clone());
                        tracing::debug!(node = %child_node.unique_id, blocked_by = ?blocked_by, %reason, "skipping");
                        state.phase[child] = Phase::Ready;
                        work.push((
                            child,
                            NodeResult::skipped(&child_node.unique_id, child_node.resource_type, reason, blocked_by),
                        ));
                    }
                }
            }
        }
    }

    /// Queue a node whose parents allow it to run
    ///
    /// Nodes that are never executed are not queued; their `not-run` result
    /// is handed back for the caller to settle.
    fn make_ready(&self, state: &mut Scheduling, rank: usize) -> Option<NodeResult> {
        let node = self.plan.get(rank)?;
        match &node.action {
            PlanAction::Execute(_) => {
                tracing::debug!(node = %node.unique_id, rank, "ready");
                state.phase[rank] = Phase::Ready;
                state.ready.push(Reverse(rank));
                None
            }
            PlanAction::NotRun(message) => {
                tracing::debug!(node = %node.unique_id, rank, "not run");
                state.phase[rank] = Phase::Ready;
                Some(NodeResult::not_run(&node.unique_id, node.resource_type, message.clone()))
            }
            PlanAction::Prune { .. } => None,
        }
    }

    /// Execute one node, with retries, timeout and cancellation
    async fn execute(&self, rank: usize, worker: usize) -> NodeResult {
        let node = &self.plan.nodes()[rank];
        let PlanAction::Execute(request) = &node.action else {
            return NodeResult::not_run(&node.unique_id, node.resource_type, "not executable");
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        let attempts = AtomicU32::new(0);
        tracing::info!(node = %node.unique_id, worker, "started");

        let outcome = tokio::select! {
            outcome = self.attempts(node, request, &attempts) => outcome,
            _ = self.stopped() => {
                if let Err(e) = self.pool.adapter().abort(&node.unique_id).await {
                    tracing::warn!(node = %node.unique_id, error = %e, "abort failed");
                }
                Err(NodeError::Cancelled)
            }
        };

        let mut result = NodeResult {
            unique_id: node.unique_id.clone(),
            resource_type: node.resource_type,
            status: NodeStatus::Success,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            elapsed: clock.elapsed().as_secs_f64(),
            worker: Some(worker),
            attempts: attempts.load(Ordering::SeqCst),
            message: None,
            failures: None,
            rows_affected: None,
            blocked_by: None,
            skip_reason: None,
        };

        match outcome {
            Ok(outcome) => {
                result.failures = outcome.failures;
                result.rows_affected = outcome.rows_affected;
                result.status = test_status(request, node, &outcome);
                result.message = Some(match outcome.failures {
                    Some(failures) if failures > 0 && request.is_test() => NodeError::TestFailures(failures).to_string(),
                    _ => outcome.message,
                });
            }
            Err(e) => {
                result.status = NodeStatus::Error;
                result.message = Some(e.to_string());
            }
        }

        match result.status {
            NodeStatus::Error => tracing::info!(
                node = %result.unique_id,
                worker,
                attempts = result.attempts,
                error = result.message.as_deref().unwrap_or_default(),
                "failed"
            ),
            status => tracing::info!(
                node = %result.unique_id,
                worker,
                %status,
                elapsed = result.elapsed,
                "finished"
            ),
        }
        result
    }

    /// Run attempts until one succeeds or the retry budget is spent
    async fn attempts(
        &self,
        node: &PlanNode,
        request: &ExecutionRequest,
        attempts: &AtomicU32,
    ) -> Result<ExecutionOutcome, NodeError> {
        let timeout = self.config.timeout_for(node.config.timeout);
        loop {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.attempt(request, timeout).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt <= node.config.retries => {
                    tracing::warn!(node = %node.unique_id, attempt, error = %e, "retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, request: &ExecutionRequest, timeout: Option<Duration>) -> Result<ExecutionOutcome, NodeError> {
        let mut connection = self.pool.acquire().await?;
        let adapter = self.pool.adapter();

        let Some(limit) = timeout else {
            return Ok(adapter.execute(&mut *connection, request).await?);
        };

        let result = tokio::time::timeout(limit, adapter.execute(&mut *connection, request)).await;
        match result {
            Ok(outcome) => Ok(outcome?),
            Err(_) => {
                if let Err(e) = adapter.abort(&request.unique_id).await {
                    tracing::warn!(node = %request.unique_id, error = %e, "abort after timeout failed");
                }
                // The connection may still be busy with the abandoned statement
                if let Err(e) = connection.discard().await {
                    tracing::debug!(error = %e, "failed to close timed-out connection");
                }
                Err(NodeError::Timeout(limit))
            }
        }
    }

    /// Skip every node that never reached a terminal status
    fn cancel_remaining(&self) {
        let mut state = self.state();
        for rank in 0..self.plan.len() {
            if self.results[rank].get().is_some() {
                continue;
            }
            let Some(node) = self.plan.get(rank) else {
                continue;
            };
            let blocked_by = state.blocker[rank]
                .and_then(|b| self.plan.get(b))
                .map(|b| b.unique_id.clone());
            let result = NodeResult::skipped(&node.unique_id, node.resource_type, SkipReason::Cancelled, blocked_by);
            if self.results[rank].set(result).is_ok() {
                state.phase[rank] = Phase::Done;
                state.undecided -= 1;
            }
        }
    }

    /// Results in rank order
    fn collect(&self) -> Vec<NodeResult> {
        self.results.iter().filter_map(|slot| slot.get().cloned()).collect()
    }
}

/// Whether a node can be decided given its parents so far
fn decide(state: &Scheduling, rank: usize, node: &PlanNode) -> Decision {
    let waiting = state.waiting_on[rank];
    let failed = state.failed_hard[rank];

    match node.config.on_upstream_failure {
        UpstreamFailurePolicy::Any if failed > 0 => Decision::Skip,
        UpstreamFailurePolicy::All if waiting == 0 && failed > 0 && failed == node.hard_parents.len() => {
            Decision::Skip
        }
        _ if waiting == 0 => Decision::Ready,
        _ => Decision::Wait,
    }
}

/// Status of a successful execution; tests with failing rows fail or warn
fn test_status(request: &ExecutionRequest, node: &PlanNode, outcome: &ExecutionOutcome) -> NodeStatus {
    match outcome.failures {
        Some(failures) if failures > 0 && request.is_test() => match node.config.severity {
            TestSeverity::Warn => NodeStatus::Warn,
            TestSeverity::Error => NodeStatus::Error,
        },
        _ => NodeStatus::Success,
    }
}
