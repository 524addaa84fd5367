//! Integration tests for the cadence-cli commands.
//!
//! These exercise the same code paths as the binary against throwaway
//! project directories. Only subprocess steps are used, so no terminal
//! multiplexer is required.

use std::path::Path;

use cadence_cli::commands::workflow::{self, RunOptions};
use serde_json::json;

fn write_workflow(project: &Path, file: &str, body: &str) {
    let dir = project.join(".cadence/workflows");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(file), body).unwrap();
}

const GREETING: &str = r#"
name: greeting
description: Say hello
variables:
  who: world
steps:
  - name: compose
    tool: set
    var: message
    value: "hello {who}"
  - name: shout
    tool: bash
    command: "echo {message} | tr a-z A-Z"
    output_var: loud
"#;

#[tokio::test]
async fn test_run_with_variable_override() {
    let tmp = tempfile::tempdir().unwrap();
    write_workflow(tmp.path(), "greeting.yaml", GREETING);

    let opts = RunOptions {
        vars: vec!["who=cadence".to_string()],
        ..Default::default()
    };
    let report = workflow::execute(tmp.path(), "greeting", &opts).await.unwrap();

    assert!(report.success);
    assert_eq!(
        report.context.variables.get("loud"),
        Some(&json!("HELLO CADENCE"))
    );

    let view = workflow::report_json(&report);
    assert_eq!(view["workflow"], "greeting");
    assert_eq!(view["steps"].as_array().unwrap().len(), 2);
    assert_eq!(view["steps"][1]["status"], "succeeded");
}

#[tokio::test]
async fn test_run_by_file_stem_and_path() {
    let tmp = tempfile::tempdir().unwrap();
    write_workflow(tmp.path(), "hello-file.yml", GREETING);

    assert!(workflow::run(tmp.path(), "hello-file", &RunOptions::default())
        .await
        .is_ok());

    let path = tmp.path().join(".cadence/workflows/hello-file.yml");
    assert!(workflow::run(tmp.path(), path.to_str().unwrap(), &RunOptions::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_run_reports_failed_steps() {
    let tmp = tempfile::tempdir().unwrap();
    write_workflow(
        tmp.path(),
        "broken.yaml",
        r#"
name: broken
steps:
  - name: ok
    tool: bash
    command: "true"
  - name: explode
    tool: bash
    command: "exit 4"
  - name: never
    tool: log
    message: unreachable
"#,
    );

    let err = workflow::run(tmp.path(), "broken", &RunOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, "Workflow failed. Failed steps: explode");
}

#[tokio::test]
async fn test_run_rejects_malformed_var() {
    let tmp = tempfile::tempdir().unwrap();
    write_workflow(tmp.path(), "greeting.yaml", GREETING);

    let opts = RunOptions {
        vars: vec!["no-equals-sign".to_string()],
        ..Default::default()
    };
    let err = workflow::execute(tmp.path(), "greeting", &opts).await.unwrap_err();
    assert!(err.contains("KEY=VALUE"));
}

#[test]
fn test_validate_accepts_and_rejects() {
    let tmp = tempfile::tempdir().unwrap();
    write_workflow(tmp.path(), "greeting.yaml", GREETING);
    write_workflow(
        tmp.path(),
        "bad-jump.yaml",
        r#"
name: bad-jump
steps:
  - name: first
    tool: goto
    target: nowhere
"#,
    );

    assert!(workflow::validate(tmp.path(), "greeting").is_ok());

    let err = workflow::validate(tmp.path(), "bad-jump").unwrap_err();
    assert!(err.contains("nowhere"), "unexpected error: {}", err);
}

#[test]
fn test_validate_checks_shared_references() {
    let tmp = tempfile::tempdir().unwrap();
    write_workflow(
        tmp.path(),
        "uses-missing.yaml",
        r#"
name: uses-missing
steps:
  - name: call
    tool: shared
    uses: "project:does-not-exist"
"#,
    );

    assert!(workflow::validate(tmp.path(), "uses-missing").is_err());
}

#[test]
fn test_list_and_unknown_workflow() {
    let tmp = tempfile::tempdir().unwrap();
    assert!(workflow::list(tmp.path()).is_ok());

    write_workflow(tmp.path(), "greeting.yaml", GREETING);
    assert!(workflow::list(tmp.path()).is_ok());

    let err = workflow::validate(tmp.path(), "missing").unwrap_err();
    assert!(err.contains("Workflow not found"));
}
