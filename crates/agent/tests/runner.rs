#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_agent::config::{AutomationConfig, ExecutionConfig};
use relay_agent::gateway::{Gateway, MemoryGateway};
use relay_agent::runner::Runner;
use relay_core::model::{ExecutionStatus, WorkItem};
use relay_core::task::TaskRecord;
use serde_json::json;

use common::{runner, task, OWNER};

async fn claimed(gw: &Arc<MemoryGateway>, task_id: &str, params: serde_json::Value) -> WorkItem {
    let mut item = WorkItem::pending(task_id, 0);
    item.input_params = params.as_object().cloned().unwrap_or_default();
    gw.insert_item(&item).await.unwrap();
    gw.claim(&item.id, "me", 1).await.unwrap().unwrap()
}

async fn run_with(runner: &Runner, gw: &Arc<MemoryGateway>, record: TaskRecord, params: serde_json::Value) -> WorkItem {
    let task_id = record.id.clone();
    gw.put_task(record);
    let item = claimed(gw, &task_id, params).await;
    runner.run(item.clone()).await;
    gw.item(&item.id).unwrap()
}

async fn run_task(gw: &Arc<MemoryGateway>, record: TaskRecord, params: serde_json::Value) -> WorkItem {
    run_with(&runner(gw), gw, record, params).await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_records_output() {
    let gw = Arc::new(MemoryGateway::new());
    let done = run_task(&gw, task("t1", "single", json!({"command": "echo hello"})), json!({})).await;

    assert_eq!(done.status, ExecutionStatus::Completed);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    let out = done.output_result.unwrap();
    assert_eq!(out["exit_code"], 0);
    assert_eq!(out["stdout"], "hello\n");
    assert_eq!(out["mode"], "captured");
    assert_eq!(done.error_message, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_params_override_command() {
    let gw = Arc::new(MemoryGateway::new());
    let done = run_task(
        &gw,
        task("t1", "custom", json!({"command": "echo configured"})),
        json!({"command": "echo {{who}}", "who": "override"}),
    )
    .await;
    assert_eq!(done.output_result.unwrap()["stdout"], "override\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_workflow_stops_at_first_failure() {
    let gw = Arc::new(MemoryGateway::new());
    let record = TaskRecord {
        id: "wf".into(),
        name: "wf".into(),
        owner_id: OWNER.into(),
        task_type: "workflow".into(),
        configuration: Default::default(),
        workflow: vec![
            json!({"name": "ok", "command": "echo one"}),
            json!({"name": "fail", "command": "exit 4"}),
            json!({"name": "never", "command": "echo three"}),
        ],
    };
    let done = run_task(&gw, record, json!({})).await;

    assert_eq!(done.status, ExecutionStatus::Failed);
    let out = done.output_result.unwrap();
    let steps = out["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0]["name"], "ok");
    assert_eq!(steps[1]["exit_code"], 4);
    assert_eq!(out["completed_steps"], 2);
    assert_eq!(out["total_steps"], 3);
    assert!(done.error_message.unwrap().contains("fail"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_runs_every_iteration() {
    let gw = Arc::new(MemoryGateway::new());
    let done = run_task(
        &gw,
        task("b", "batch", json!({"command": "echo {index}/{count}; test {index} -ne 2", "count": 3})),
        json!({}),
    )
    .await;

    assert_eq!(done.status, ExecutionStatus::Failed);
    let out = done.output_result.unwrap();
    let iterations = out["iterations"].as_array().unwrap();
    assert_eq!(iterations.len(), 3);
    assert_eq!(iterations[2]["stdout"], "3/3\n");
    assert_eq!(out["succeeded"], 2);
    assert_eq!(out["failed"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_monitoring_counts_alerts() {
    let gw = Arc::new(MemoryGateway::new());
    let done = run_task(
        &gw,
        task("m", "monitoring", json!({"command": "printf 'cpu ok\\ndisk ERROR\\nnet down\\n'"})),
        json!({}),
    )
    .await;
    assert_eq!(done.status, ExecutionStatus::Completed);
    let out = done.output_result.unwrap();
    assert_eq!(out["alert_count"], 2);
    assert_eq!(out["alerts"], json!(["disk ERROR", "net down"]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_report_shapes_output() {
    let gw = Arc::new(MemoryGateway::new());
    let done = run_task(&gw, task("r", "report", json!({"command": "printf 'a\\nb\\n'"})), json!({})).await;
    let out = done.output_result.unwrap();
    assert_eq!(out["report"], "a\nb\n");
    assert_eq!(out["line_count"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_fails_item() {
    let gw = Arc::new(MemoryGateway::new());
    let done = run_task(
        &gw,
        task("t", "single", json!({"command": "exec sleep 5", "timeoutSeconds": 1})),
        json!({}),
    )
    .await;
    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(done.error_message.as_deref(), Some("timed out after 1s"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_stops_compound_command() {
    let gw = Arc::new(MemoryGateway::new());
    let started = Instant::now();
    let done = run_task(
        &gw,
        task("t", "single", json!({"command": "sleep 5; echo late", "timeoutSeconds": 1})),
        json!({}),
    )
    .await;
    assert!(started.elapsed() < Duration::from_secs(4), "took {:?}", started.elapsed());
    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(done.output_result.unwrap()["stdout"], "");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_spawn_failure_fails_item_with_message() {
    let gw = Arc::new(MemoryGateway::new());
    let done = run_task(
        &gw,
        task("t", "single", json!({"command": "true", "workingDir": "/definitely/not/here"})),
        json!({}),
    )
    .await;
    assert_eq!(done.status, ExecutionStatus::Failed);
    assert!(done.error_message.unwrap().contains("failed to spawn"));
    assert!(done.output_result.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_task_type_fails_without_running() {
    let gw = Arc::new(MemoryGateway::new());
    let done = run_task(&gw, task("t", "telepathy", json!({})), json!({})).await;
    assert_eq!(done.status, ExecutionStatus::Failed);
    assert!(done.started_at.is_none());
    assert!(done.error_message.unwrap().contains("unknown task type"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rules_use_engine_and_passthrough_fallback_keeps_exit_code() {
    let gw = Arc::new(MemoryGateway::new());
    let done = run_task(
        &gw,
        task(
            "t",
            "single",
            json!({
                "command": "printf 'ok? '; read a; echo \"a=$a\"",
                "autoResponses": [{"trigger": "ok\\?", "input": "yes"}]
            }),
        ),
        json!({}),
    )
    .await;
    let out = done.output_result.unwrap();
    assert_eq!(out["mode"], "scripted");
    assert_eq!(out["fired"], json!([0]));
    assert!(out["stdout"].as_str().unwrap().contains("a=yes"));

    let done = run_task(
        &gw,
        task(
            "t2",
            "single",
            json!({
                "command": "exit 6",
                "autoResponses": [{"trigger": "([", "input": "yes"}]
            }),
        ),
        json!({}),
    )
    .await;
    assert_eq!(done.status, ExecutionStatus::Failed);
    let out = done.output_result.unwrap();
    assert_eq!(out["mode"], "passthrough");
    assert_eq!(out["exit_code"], 6);
    assert_eq!(out["warnings"].as_array().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_write_failure_does_not_stop_the_run() {
    let gw = Arc::new(MemoryGateway::new());
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    gw.put_task(task(
        "t",
        "single",
        json!({"command": "echo ran > \"$MARKER\"", "env": {"MARKER": marker.display().to_string()}}),
    ));
    let item = claimed(&gw, "t", json!({})).await;

    gw.set_fail_updates(true);
    runner(&gw).run(item.clone()).await;

    assert!(marker.exists());
    assert_eq!(gw.item(&item.id).unwrap().status, ExecutionStatus::Claimed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_finished_item_is_not_run_into_again() {
    let gw = Arc::new(MemoryGateway::new());
    let done = run_task(&gw, task("t", "single", json!({"command": "echo once"})), json!({})).await;
    assert_eq!(done.status, ExecutionStatus::Completed);

    runner(&gw).run(done.clone()).await;
    let again = gw.item(&done.id).unwrap();
    assert_eq!(again.status, ExecutionStatus::Completed);
    assert_eq!(again.started_at, done.started_at);
    assert_eq!(again.completed_at, done.completed_at);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminal_spawn_reports_exit_code_only() {
    let gw = Arc::new(MemoryGateway::new());
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("opened");
    let config = ExecutionConfig {
        terminal_command: vec!["env".into()],
        ..Default::default()
    };
    let runner = Runner::new(gw.clone(), config, AutomationConfig::default());
    let done = run_with(
        &runner,
        &gw,
        task(
            "t",
            "single",
            json!({
                "command": "echo hidden; touch \"$MARKER\"; exit 3",
                "interactive": true,
                "spawnInTerminal": true,
                "env": {"MARKER": marker.display().to_string()}
            }),
        ),
        json!({}),
    )
    .await;

    assert!(marker.exists());
    assert_eq!(done.status, ExecutionStatus::Failed);
    let out = done.output_result.unwrap();
    assert_eq!(out["mode"], "terminal");
    assert_eq!(out["exit_code"], 3);
    assert_eq!(out["stdout"], "");
    assert_eq!(out["stderr"], "");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interactive_goes_to_terminal_when_configured() {
    let gw = Arc::new(MemoryGateway::new());
    let config = ExecutionConfig {
        terminal_command: vec!["env".into()],
        spawn_interactive_in_terminal: true,
        ..Default::default()
    };
    let runner = Runner::new(gw.clone(), config, AutomationConfig::default());
    let done = run_with(
        &runner,
        &gw,
        task("t", "single", json!({"command": "true", "interactive": true})),
        json!({}),
    )
    .await;

    assert_eq!(done.status, ExecutionStatus::Completed);
    let out = done.output_result.unwrap();
    assert_eq!(out["mode"], "terminal");
    assert_eq!(out["exit_code"], 0);
}
