//! Integration tests for the compile pipeline

use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use strata_compiler::{compile, CompileOptions};
use strata_core::{DiagnosticCode, Materialization, ResourceType, TargetConfig};
use tempfile::TempDir;

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    write(
        root,
        "strata_project.toml",
        r#"
name = "shop"

[vars]
min_total = 0

[models.shop.marts]
materialized = "table"
"#,
    );
    write(
        root,
        "models/staging/stg_orders.sql",
        "{{ config(materialized='ephemeral') }}select * from {{ source('raw', 'orders') }} where total > {{ var('min_total') }}",
    );
    write(root, "models/staging/stg_customers.sql", "select * from {{ source('raw', 'customers') }}");
    write(
        root,
        "models/marts/orders.sql",
        "select o.*, c.name from {{ ref('stg_orders') }} o join {{ ref('stg_customers') }} c using (customer_id)",
    );
    write(
        root,
        "models/staging/sources.toml",
        r#"
[[sources]]
name = "raw"
schema = "raw_data"

[[sources.tables]]
name = "orders"

[[sources.tables]]
name = "customers"
"#,
    );
    write(
        root,
        "models/marts/schema.toml",
        r#"
[[models]]
name = "orders"

[[models.columns]]
name = "id"
tests = ["unique", "not_null"]
"#,
    );

    dir
}

fn options(dir: &TempDir) -> CompileOptions {
    CompileOptions::new(dir.path()).with_target(TargetConfig {
        schema: "analytics".into(),
        ..TargetConfig::default()
    })
}

#[test]
fn compiles_project_into_manifest() {
    let dir = project();
    let compilation = compile(&options(&dir)).unwrap();
    let manifest = &compilation.manifest;

    assert!(!compilation.report.has_errors());
    assert_eq!(
        manifest.nodes.keys().collect::<Vec<_>>(),
        vec![
            "model.shop.orders",
            "model.shop.stg_customers",
            "model.shop.stg_orders",
            "test.shop.not_null_orders_id",
            "test.shop.unique_orders_id",
        ]
    );
    assert_eq!(manifest.sources.len(), 2);

    let orders = manifest.get_node("model.shop.orders").unwrap();
    assert_eq!(orders.config.materialized, Materialization::Table);
    assert_eq!(orders.relation.as_ref().unwrap().to_string(), "analytics.orders");
    assert_eq!(
        orders.depends_on.nodes,
        vec!["model.shop.stg_customers".to_string(), "model.shop.stg_orders".to_string()]
    );
    assert_eq!(
        orders.compiled_body,
        "with __strata__cte__stg_orders as (\nselect * from raw_data.orders where total > 0\n)\n\
         select o.*, c.name from __strata__cte__stg_orders o join analytics.stg_customers c using (customer_id)"
    );

    let staged = manifest.get_node("model.shop.stg_orders").unwrap();
    assert!(staged.is_ephemeral());
    assert_eq!(staged.relation, None);

    let test = manifest.get_node("test.shop.unique_orders_id").unwrap();
    assert_eq!(test.resource_type, ResourceType::Test);
    assert_eq!(test.depends_on.nodes, vec!["model.shop.orders".to_string()]);
    assert!(test.compiled_body.contains("from analytics.orders"));

    assert_eq!(
        manifest.child_map["source.shop.raw.orders"],
        vec!["model.shop.stg_orders".to_string()]
    );
}

#[test]
fn compiling_twice_is_byte_identical() {
    let dir = project();
    let first = compile(&options(&dir)).unwrap().manifest.to_json().unwrap();
    let second = compile(&options(&dir)).unwrap().manifest.to_json().unwrap();
    assert_eq!(first, second);
}

#[test]
fn errors_from_several_files_are_reported_together() {
    let dir = project();
    write(dir.path(), "models/bad_ref.sql", "select * from {{ ref('missing') }}");
    write(dir.path(), "models/bad_syntax.sql", "select {{ ref('orders' }}");

    let failure = compile(&options(&dir)).unwrap_err();
    let report = &failure.report;
    assert_eq!(report.summary.errors, 2);

    let unresolved = report
        .diagnostics
        .iter()
        .find(|d| d.code == DiagnosticCode::UnresolvedReference)
        .unwrap();
    assert_eq!(unresolved.node.as_deref(), Some("model.shop.bad_ref"));
    assert_eq!(unresolved.token.as_deref(), Some("ref('missing')"));
    assert_eq!(unresolved.location.as_ref().unwrap().file, "models/bad_ref.sql");

    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.code == DiagnosticCode::TemplateSyntaxError && d.node.as_deref() == Some("model.shop.bad_syntax")));
}

#[test]
fn dependency_cycle_names_full_path() {
    let dir = project();
    write(dir.path(), "models/a.sql", "select * from {{ ref('b') }}");
    write(dir.path(), "models/b.sql", "select * from {{ ref('c') }}");
    write(dir.path(), "models/c.sql", "select * from {{ ref('a') }}");

    let failure = compile(&options(&dir)).unwrap_err();
    let cycle = failure
        .report
        .diagnostics
        .iter()
        .find(|d| d.code == DiagnosticCode::GraphCycle)
        .unwrap();

    assert_eq!(
        cycle.message,
        "Dependency cycle detected: model.shop.a -> model.shop.b -> model.shop.c -> model.shop.a"
    );
}

#[test]
fn ephemeral_self_reference_is_circular_context() {
    let dir = project();
    write(dir.path(), "models/loop_a.sql", "{{ config(materialized='ephemeral') }}select * from {{ ref('loop_b') }}");
    write(dir.path(), "models/loop_b.sql", "{{ config(materialized='ephemeral') }}select * from {{ ref('loop_a') }}");

    let failure = compile(&options(&dir)).unwrap_err();
    let codes: Vec<DiagnosticCode> = failure.report.diagnostics.iter().map(|d| d.code).collect();

    assert!(codes.contains(&DiagnosticCode::CircularContext));
    assert!(!codes.contains(&DiagnosticCode::GraphCycle));
}

#[test]
fn disabled_reference_creates_no_edge() {
    let dir = project();
    write(dir.path(), "models/legacy.sql", "{{ config(enabled=false) }}select 1 as id");
    write(dir.path(), "models/uses_legacy.sql", "select * from {{ ref('legacy') }}");

    let compilation = compile(&options(&dir)).unwrap();
    let manifest = &compilation.manifest;

    assert!(manifest.disabled.contains_key("model.shop.legacy"));
    assert!(!manifest.nodes.contains_key("model.shop.legacy"));

    let node = manifest.get_node("model.shop.uses_legacy").unwrap();
    assert!(node.depends_on.nodes.is_empty());
    assert_eq!(node.depends_on.disabled, vec!["model.shop.legacy".to_string()]);
    assert_eq!(node.compiled_body, "select * from analytics.legacy");

    assert!(compilation
        .report
        .diagnostics
        .iter()
        .any(|d| d.code == DiagnosticCode::DisabledDependency));
}

#[test]
fn var_overrides_win_and_change_hash() {
    let dir = project();
    let base = compile(&options(&dir)).unwrap().manifest;

    let mut vars = BTreeMap::new();
    vars.insert("min_total".to_string(), serde_json::json!(100));
    let overridden = compile(&options(&dir).with_vars(vars)).unwrap().manifest;

    assert!(overridden.nodes["model.shop.orders"].compiled_body.contains("total > 100"));
    assert_ne!(base.metadata.vars_hash, overridden.metadata.vars_hash);
}

#[test]
fn incremental_branch_follows_full_refresh() {
    let dir = project();
    write(
        dir.path(),
        "models/events.sql",
        "{{ config(materialized='incremental') }}select * from {{ source('raw', 'orders') }}{% if is_incremental() %} where id > (select max(id) from {{ this }}){% endif %}",
    );

    let incremental = compile(&options(&dir)).unwrap().manifest;
    assert!(incremental.nodes["model.shop.events"]
        .compiled_body
        .ends_with("where id > (select max(id) from analytics.events)"));

    let full = compile(&options(&dir).full_refresh(true)).unwrap().manifest;
    assert_eq!(full.nodes["model.shop.events"].compiled_body, "select * from raw_data.orders");
}

#[test]
fn unknown_context_key_fails_the_node() {
    let dir = project();
    write(dir.path(), "models/adapter_call.sql", "select {{ adapter.dispatch('x') }}");

    let failure = compile(&options(&dir)).unwrap_err();
    let diagnostic = &failure.report.errors().next().unwrap();
    assert_eq!(diagnostic.code, DiagnosticCode::UnknownContextKey);
    assert_eq!(diagnostic.token.as_deref(), Some("adapter"));
}
