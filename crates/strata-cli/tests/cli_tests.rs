//! End-to-end tests of the `strata` binary against the mock adapter

use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    write(root, "strata_project.toml", "name = \"shop\"\n");
    write(root, "models/stg_orders.sql", "select 1 as id");
    write(root, "models/orders.sql", "select * from {{ ref('stg_orders') }}");
    write(
        root,
        "models/schema.toml",
        r#"
[[models]]
name = "orders"

[[models.columns]]
name = "id"
tests = ["unique"]
"#,
    );

    dir
}

fn strata(dir: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_strata"))
        .arg("--project-dir")
        .arg(dir.path())
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .unwrap()
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn compile_writes_manifest() {
    let dir = project();
    let output = strata(&dir, &["compile"]);

    assert!(output.status.success());
    let manifest = fs::read_to_string(dir.path().join("target/manifest.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&manifest).unwrap();
    assert!(json["nodes"]["model.shop.orders"].is_object());
}

#[test]
fn compile_failure_exits_non_zero() {
    let dir = project();
    write(dir.path(), "models/broken.sql", "select * from {{ ref('missing') }}");

    let output = strata(&dir, &["compile"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("UNRESOLVED_REFERENCE"));
    assert!(!dir.path().join("target/manifest.json").exists());
}

#[test]
fn ls_prints_selected_ids() {
    let dir = project();
    let output = strata(&dir, &["ls", "--select", "+orders", "--resource-type", "model"]);

    assert!(output.status.success());
    assert_eq!(
        stdout_lines(&output),
        vec!["model.shop.stg_orders".to_string(), "model.shop.orders".to_string()]
    );
}

#[test]
fn build_writes_run_results() {
    let dir = project();
    let output = strata(&dir, &["build", "--threads", "2"]);

    assert!(output.status.success());
    let results = fs::read_to_string(dir.path().join("target/run_results.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&results).unwrap();
    assert_eq!(json["summary"]["total"], 3);
    assert_eq!(json["summary"]["success"], 3);
    assert_eq!(json["metadata"]["adapter"], "mock");
}

#[test]
fn test_command_runs_only_tests() {
    let dir = project();
    let output = strata(&dir, &["test"]);

    assert!(output.status.success());
    let results = fs::read_to_string(dir.path().join("target/run_results.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&results).unwrap();
    let ids: Vec<&str> = json["results"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|r| r["status"] == "success")
        .map(|r| r["unique_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["test.shop.unique_orders_id"]);
}

#[test]
fn unknown_profile_target_fails() {
    let dir = project();
    write(
        dir.path(),
        "profiles.toml",
        r#"
target = "dev"

[outputs.dev]
type = "mock"
schema = "analytics"
"#,
    );

    let output = strata(&dir, &["--target", "prod", "compile"]);
    assert!(!output.status.success());
}
