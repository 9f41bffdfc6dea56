//! Scheduling tests against the mock adapter

use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strata_adapter::MockAdapter;
use strata_core::{Materialization, NodeConfig, Relation, ResourceType, TestSeverity, UpstreamFailurePolicy};
use strata_engine::{ExecutionPlan, Executor, NodeStatus, RunConfig, RunReport, SkipReason};
use strata_graph::{
    DependsOn, Manifest, ManifestMetadata, ManifestNode, Selection, SelectionCriteria, Selector,
};

/// Hand-built manifest of the `shop` project
struct Fixture {
    manifest: Manifest,
}

impl Fixture {
    fn new() -> Self {
        Self {
            manifest: Manifest::new(ManifestMetadata {
                project_name: "shop".into(),
                strata_version: "0.1.0".into(),
                vars_hash: String::new(),
                target_name: "dev".into(),
            }),
        }
    }

    fn model(self, name: &str, parents: &[&str]) -> Self {
        self.model_with(name, parents, NodeConfig::default())
    }

    fn model_with(self, name: &str, parents: &[&str], config: NodeConfig) -> Self {
        let relation = (config.materialized != Materialization::Ephemeral)
            .then(|| Relation::new(None, "analytics", name));
        self.insert(ResourceType::Model, name, parents, config, relation)
    }

    fn test(self, name: &str, parent: &str, severity: TestSeverity) -> Self {
        let config = NodeConfig {
            severity,
            ..NodeConfig::default()
        };
        self.insert(ResourceType::Test, name, &[parent], config, None)
    }

    fn insert(
        mut self,
        resource_type: ResourceType,
        name: &str,
        parents: &[&str],
        config: NodeConfig,
        relation: Option<Relation>,
    ) -> Self {
        let unique_id = resource_type.unique_id("shop", name);
        let parents: Vec<String> = parents.iter().map(|p| id(p)).collect();

        for parent in &parents {
            self.manifest
                .child_map
                .entry(parent.clone())
                .or_default()
                .push(unique_id.clone());
        }
        self.manifest.parent_map.insert(unique_id.clone(), parents.clone());
        self.manifest.nodes.insert(
            unique_id.clone(),
            ManifestNode {
                unique_id,
                name: name.to_string(),
                resource_type,
                package_name: "shop".into(),
                original_file_path: format!("models/{}.sql", name),
                fqn: vec!["shop".into(), name.to_string()],
                relation,
                config,
                description: String::new(),
                columns: BTreeMap::new(),
                raw_body: "select 1".into(),
                compiled_body: "select 1".into(),
                checksum: String::new(),
                depends_on: DependsOn {
                    nodes: parents,
                    disabled: Vec::new(),
                },
                test_metadata: None,
            },
        );
        self
    }

    fn disable_reference(mut self, name: &str, disabled: &str) -> Self {
        if let Some(node) = self.manifest.nodes.get_mut(&id(name)) {
            node.depends_on.disabled.push(id(disabled));
        }
        self
    }

    fn select(&self, criteria: &SelectionCriteria) -> Selection {
        Selector::new(&self.manifest).select(criteria).unwrap()
    }

    fn plan(&self) -> ExecutionPlan {
        ExecutionPlan::build(&self.manifest, &self.select(&SelectionCriteria::default()), false)
    }
}

/// `orders` -> `model.shop.orders`; ids with a dot pass through
fn id(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("model.shop.{}", name)
    }
}

fn config(threads: usize) -> RunConfig {
    RunConfig::default().with_threads(threads)
}

async fn run(fixture: &Fixture, adapter: MockAdapter, config: RunConfig) -> (RunReport, Arc<MockAdapter>) {
    let adapter = Arc::new(adapter);
    let report = Executor::new(Arc::clone(&adapter), config).run(fixture.plan()).await;
    (report, adapter)
}

fn status(report: &RunReport, name: &str) -> NodeStatus {
    report.status(&id(name)).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_nodes_run_concurrently() {
    let fixture = Fixture::new().model("a", &[]).model("b", &[]).model("c", &[]);
    let adapter = MockAdapter::new().with_latency(Duration::from_millis(100));

    let (report, adapter) = run(&fixture, adapter, config(3)).await;

    assert!(report.success());
    assert_eq!(report.summary.success, 3);
    assert_eq!(adapter.peak_concurrency(), 3);

    let records = adapter.executions();
    assert!(records[0].overlaps(&records[1]));
    assert!(records[1].overlaps(&records[2]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dependents_start_after_parents_finish() {
    let fixture = Fixture::new().model("a", &[]).model("b", &["a"]);
    let adapter = MockAdapter::new().with_latency(Duration::from_millis(30));

    let (report, adapter) = run(&fixture, adapter, config(4)).await;

    let a = report.get("model.shop.a").unwrap();
    let b = report.get("model.shop.b").unwrap();
    assert!(a.finished_at.unwrap() <= b.started_at.unwrap());
    assert!(!adapter.executions()[0].overlaps(&adapter.executions()[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn siblings_start_together_once_parent_succeeds() {
    let fixture = Fixture::new().model("a", &[]).model("b", &["a"]).model("c", &["a"]);
    let adapter = MockAdapter::new().with_latency(Duration::from_millis(100));

    let (report, adapter) = run(&fixture, adapter, config(2)).await;

    assert_eq!(report.summary.success, 3);
    assert_eq!(adapter.peak_concurrency(), 2);

    let record = |name: &str| {
        adapter
            .executions()
            .into_iter()
            .find(|r| r.unique_id == id(name))
            .unwrap()
    };
    let (a, b, c) = (record("a"), record("b"), record("c"));
    assert!(a.finished_at.unwrap() <= b.started_at);
    assert!(a.finished_at.unwrap() <= c.started_at);
    assert!(b.overlaps(&c));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_skips_transitive_dependents_only() {
    let fixture = Fixture::new()
        .model("a", &[])
        .model("b", &["a"])
        .model("c", &["b"])
        .model("d", &[]);
    let adapter = MockAdapter::new().with_failure("model.shop.a", "relation \"raw.orders\" does not exist");

    let (report, adapter) = run(&fixture, adapter, config(2)).await;

    assert_eq!(status(&report, "a"), NodeStatus::Error);
    assert_eq!(status(&report, "b"), NodeStatus::Skipped);
    assert_eq!(status(&report, "c"), NodeStatus::Skipped);
    assert_eq!(status(&report, "d"), NodeStatus::Success);

    let b = report.get("model.shop.b").unwrap();
    assert_eq!(b.blocked_by.as_deref(), Some("model.shop.a"));
    assert_eq!(b.skip_reason, Some(SkipReason::UpstreamFailed));
    assert_eq!(b.attempts, 0);
    let c = report.get("model.shop.c").unwrap();
    assert_eq!(c.blocked_by.as_deref(), Some("model.shop.b"));

    assert!(report
        .get("model.shop.a")
        .unwrap()
        .message
        .as_deref()
        .unwrap()
        .contains("does not exist"));
    assert_eq!(adapter.execution_count("model.shop.b"), 0);
    assert!(!report.success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_threads() {
    let mut fixture = Fixture::new();
    for i in 0..8 {
        fixture = fixture.model(&format!("m{}", i), &[]);
    }
    let adapter = MockAdapter::new().with_latency(Duration::from_millis(20));

    let (report, adapter) = run(&fixture, adapter, config(2)).await;

    assert_eq!(report.summary.success, 8);
    assert_eq!(adapter.peak_concurrency(), 2);
    assert_eq!(adapter.opened(), 2);
    assert_eq!(adapter.closed(), 2);
}

#[tokio::test]
async fn single_worker_follows_rank_order() {
    let fixture = Fixture::new()
        .model("stg_orders", &[])
        .model("stg_customers", &[])
        .model("orders", &["stg_orders", "stg_customers"])
        .model("customers", &["stg_customers"]);

    let (report, adapter) = run(&fixture, MockAdapter::new(), config(1)).await;

    let order: Vec<String> = report.results.iter().map(|r| r.unique_id.clone()).collect();
    assert_eq!(adapter.executed_ids(), order);
    assert_eq!(
        order,
        vec![
            "model.shop.stg_customers".to_string(),
            "model.shop.customers".to_string(),
            "model.shop.stg_orders".to_string(),
            "model.shop.orders".to_string(),
        ]
    );
    assert!(report.results.iter().all(|r| r.worker == Some(0)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_marks_error_and_skips_dependents() {
    let fixture = Fixture::new().model("slow", &[]).model("after", &["slow"]);
    let adapter = MockAdapter::new().with_hang("model.shop.slow");
    let config = config(2).with_default_timeout(Duration::from_millis(50));

    let (report, _) = run(&fixture, adapter, config).await;

    let slow = report.get("model.shop.slow").unwrap();
    assert_eq!(slow.status, NodeStatus::Error);
    assert_eq!(slow.message.as_deref(), Some("Timed out after 0.05s"));
    assert_eq!(status(&report, "after"), NodeStatus::Skipped);
}

#[tokio::test]
async fn retries_recover_flaky_nodes() {
    let retrying = NodeConfig {
        retries: 2,
        ..NodeConfig::default()
    };
    let fixture = Fixture::new().model_with("flaky", &[], retrying);
    let adapter = MockAdapter::new().with_flaky("model.shop.flaky", 2);

    let (report, adapter) = run(&fixture, adapter, config(1)).await;

    let flaky = report.get("model.shop.flaky").unwrap();
    assert_eq!(flaky.status, NodeStatus::Success);
    assert_eq!(flaky.attempts, 3);
    assert_eq!(adapter.execution_count("model.shop.flaky"), 3);
}

#[tokio::test]
async fn retries_are_bounded() {
    let retrying = NodeConfig {
        retries: 1,
        ..NodeConfig::default()
    };
    let fixture = Fixture::new().model_with("flaky", &[], retrying);
    let adapter = MockAdapter::new().with_flaky("model.shop.flaky", 5);

    let (report, _) = run(&fixture, adapter, config(1)).await;

    let flaky = report.get("model.shop.flaky").unwrap();
    assert_eq!(flaky.status, NodeStatus::Error);
    assert_eq!(flaky.attempts, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_aborts_in_flight_and_skips_the_rest() {
    let fixture = Fixture::new()
        .model("hung", &[])
        .model("downstream", &["hung"])
        .model("quick", &[]);
    let adapter = Arc::new(MockAdapter::new().with_hang("model.shop.hung"));
    let executor = Arc::new(Executor::new(Arc::clone(&adapter), config(2)));
    let stop = executor.stop_handle();

    let plan = fixture.plan();
    let running = Arc::clone(&executor);
    let task = tokio::spawn(async move { running.run(plan).await });

    while adapter.execution_count("model.shop.hung") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    stop.stop();

    let report = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

    let hung = report.get("model.shop.hung").unwrap();
    assert_eq!(hung.status, NodeStatus::Error);
    assert_eq!(hung.message.as_deref(), Some("Cancelled"));
    assert_eq!(adapter.aborted(), vec!["model.shop.hung".to_string()]);

    let downstream = report.get("model.shop.downstream").unwrap();
    assert_eq!(downstream.status, NodeStatus::Skipped);
    assert_eq!(downstream.skip_reason, Some(SkipReason::Cancelled));

    assert!(report.metadata.cancelled);
    assert_eq!(report.results.len(), 3);
}

#[tokio::test]
async fn stop_before_run_skips_everything() {
    let fixture = Fixture::new().model("a", &[]).model("b", &["a"]);
    let adapter = Arc::new(MockAdapter::new());
    let executor = Executor::new(Arc::clone(&adapter), config(2));
    executor.stop_handle().stop();

    let report = executor.run(fixture.plan()).await;

    assert_eq!(report.summary.skipped, 2);
    assert!(report.results.iter().all(|r| r.skip_reason == Some(SkipReason::Cancelled)));
    assert!(adapter.executions().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn skip_policies_per_node() {
    let all = NodeConfig {
        on_upstream_failure: UpstreamFailurePolicy::All,
        ..NodeConfig::default()
    };
    let never = NodeConfig {
        on_upstream_failure: UpstreamFailurePolicy::Never,
        ..NodeConfig::default()
    };
    let soft = NodeConfig {
        soft_dependencies: vec!["broken".into()],
        ..NodeConfig::default()
    };
    let fixture = Fixture::new()
        .model("broken", &[])
        .model("healthy", &[])
        .model("any_parent", &["broken", "healthy"])
        .model_with("all_parents", &["broken", "healthy"], all.clone())
        .model_with("only_broken", &["broken"], all)
        .model_with("always", &["broken"], never)
        .model_with("tolerant", &["broken", "healthy"], soft);
    let adapter = MockAdapter::new().with_failure("model.shop.broken", "boom");

    let (report, _) = run(&fixture, adapter, config(4)).await;

    assert_eq!(status(&report, "any_parent"), NodeStatus::Skipped);
    assert_eq!(status(&report, "all_parents"), NodeStatus::Success);
    assert_eq!(status(&report, "only_broken"), NodeStatus::Skipped);
    assert_eq!(status(&report, "always"), NodeStatus::Success);
    assert_eq!(status(&report, "tolerant"), NodeStatus::Success);
}

#[tokio::test]
async fn fail_fast_cancels_remaining_nodes() {
    let fixture = Fixture::new().model("a", &[]).model("b", &[]).model("c", &[]);
    let adapter = MockAdapter::new().with_failure("model.shop.a", "boom");

    let (report, adapter) = run(&fixture, adapter, config(1).fail_fast(true)).await;

    assert_eq!(status(&report, "a"), NodeStatus::Error);
    assert_eq!(status(&report, "b"), NodeStatus::Skipped);
    assert_eq!(report.get("model.shop.c").unwrap().skip_reason, Some(SkipReason::Cancelled));
    assert_eq!(adapter.executed_ids(), vec!["model.shop.a".to_string()]);
}

#[tokio::test]
async fn executor_runs_again_after_fail_fast() {
    let first = Fixture::new().model("a", &[]).model("b", &[]);
    let second = Fixture::new().model("x", &[]);
    let adapter = Arc::new(MockAdapter::new().with_failure("model.shop.a", "boom"));
    let executor = Executor::new(Arc::clone(&adapter), config(1).fail_fast(true));

    let report = executor.run(first.plan()).await;
    assert_eq!(status(&report, "a"), NodeStatus::Error);
    assert_eq!(report.get("model.shop.b").unwrap().skip_reason, Some(SkipReason::Cancelled));
    assert!(!report.metadata.cancelled);
    assert!(!executor.stop_handle().is_stopped());

    let report = executor.run(second.plan()).await;
    assert_eq!(status(&report, "x"), NodeStatus::Success);
    assert!(report.success());
}

#[tokio::test]
async fn failing_tests_warn_or_error_by_severity() {
    let fixture = Fixture::new()
        .model("orders", &[])
        .test("unique_orders_id", "orders", TestSeverity::Warn)
        .test("not_null_orders_id", "orders", TestSeverity::Error)
        .model("report", &["orders"]);
    let adapter = MockAdapter::new()
        .with_scalar("test.shop.unique_orders_id", 3)
        .with_scalar("test.shop.not_null_orders_id", 1);

    let (report, _) = run(&fixture, adapter, config(2)).await;

    let unique = report.get("test.shop.unique_orders_id").unwrap();
    assert_eq!(unique.status, NodeStatus::Warn);
    assert_eq!(unique.failures, Some(3));
    assert_eq!(unique.message.as_deref(), Some("Got 3 failing row(s)"));

    assert_eq!(report.status("test.shop.not_null_orders_id"), Some(NodeStatus::Error));
    assert_eq!(status(&report, "report"), NodeStatus::Success);
    assert!(!report.success());
}

#[tokio::test]
async fn ephemeral_nodes_are_not_run_and_satisfy_dependents() {
    let ephemeral = NodeConfig {
        materialized: Materialization::Ephemeral,
        ..NodeConfig::default()
    };
    let fixture = Fixture::new()
        .model_with("stg_orders", &[], ephemeral)
        .model("orders", &["stg_orders"]);

    let (report, adapter) = run(&fixture, MockAdapter::new(), config(2)).await;

    assert_eq!(status(&report, "stg_orders"), NodeStatus::NotRun);
    assert_eq!(status(&report, "orders"), NodeStatus::Success);
    assert_eq!(adapter.executed_ids(), vec!["model.shop.orders".to_string()]);
    assert!(report.success());
}

#[tokio::test]
async fn referenced_only_parents_are_not_run() {
    let fixture = Fixture::new().model("stg_orders", &[]).model("orders", &["stg_orders"]);
    let selection = fixture.select(&SelectionCriteria::select("orders"));
    let adapter = Arc::new(MockAdapter::new());

    let report = Executor::new(Arc::clone(&adapter), config(2))
        .run_selection(&fixture.manifest, &selection)
        .await;

    assert_eq!(status(&report, "stg_orders"), NodeStatus::NotRun);
    assert_eq!(status(&report, "orders"), NodeStatus::Success);
    assert_eq!(adapter.executed_ids(), vec!["model.shop.orders".to_string()]);
}

#[tokio::test]
async fn pruned_nodes_are_skipped_with_disabled_ancestor() {
    let fixture = Fixture::new()
        .model("uses_legacy", &[])
        .model("downstream", &["uses_legacy"])
        .model("fine", &[])
        .disable_reference("uses_legacy", "legacy");

    let (report, adapter) = run(&fixture, MockAdapter::new(), config(2)).await;

    let pruned = report.get("model.shop.downstream").unwrap();
    assert_eq!(pruned.status, NodeStatus::Skipped);
    assert_eq!(pruned.skip_reason, Some(SkipReason::DisabledDependency));
    assert_eq!(pruned.blocked_by.as_deref(), Some("model.shop.legacy"));
    assert_eq!(adapter.executed_ids(), vec!["model.shop.fine".to_string()]);
}

#[test]
fn plan_splits_soft_and_hard_parents() {
    let soft = NodeConfig {
        soft_dependencies: vec!["model.shop.audit".into()],
        ..NodeConfig::default()
    };
    let fixture = Fixture::new()
        .model("audit", &[])
        .model("orders", &[])
        .model_with("report", &["audit", "orders"], soft);
    let plan = fixture.plan();

    let report = plan.get(plan.rank("model.shop.report").unwrap()).unwrap();
    assert_eq!(report.hard_parents, vec![plan.rank("model.shop.orders").unwrap()]);
    assert_eq!(report.soft_parents, vec![plan.rank("model.shop.audit").unwrap()]);
    assert_eq!(plan.executable_count(), 3);
}
