//! Execution runner: turns a claimed work item into processes and a result row.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use relay_core::interactive::needs_interaction;
use relay_core::model::{ExecutionStatus, StatusPatch, WorkItem};
use relay_core::now_ms;
use relay_core::task::{render_batch, render_params, CommandStep, TaskDefinition, TaskKind};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::automation::{AutomationEngine, EngineOutcome, Mode};
use crate::config::{AutomationConfig, ExecutionConfig};
use crate::gateway::SharedGateway;
use crate::process::{self, CommandLine};
use crate::reporter::StatusReporter;

/// Final shape of one run, before it is written back.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
}

pub struct Runner {
    gateway: SharedGateway,
    reporter: StatusReporter,
    engine: AutomationEngine,
    config: ExecutionConfig,
}

impl Runner {
    pub fn new(gateway: SharedGateway, config: ExecutionConfig, automation: AutomationConfig) -> Self {
        Self {
            reporter: StatusReporter::new(gateway.clone()),
            engine: AutomationEngine::new(config.shell.clone(), automation, config.max_output_bytes),
            gateway,
            config,
        }
    }

    /// Run a claimed item to completion and report every transition.
    pub async fn run(&self, item: WorkItem) {
        let task = match self.resolve(&item).await {
            Ok(task) => task,
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "cannot resolve task");
                let patch = StatusPatch {
                    completed_at: Some(now_ms()),
                    error_message: Some(format!("{e:#}")),
                    ..Default::default()
                };
                self.reporter.report(&item.id, ExecutionStatus::Failed, patch).await;
                return;
            }
        };

        info!(item_id = %item.id, task_id = %task.id, task_type = task.kind.type_name(), "starting work item");
        let started = StatusPatch {
            started_at: Some(now_ms()),
            ..Default::default()
        };
        let running = self
            .reporter
            .report(&item.id, ExecutionStatus::Running, started.clone())
            .await;

        let (status, patch) = match self.execute(&task, &item.input_params).await {
            Ok(result) => {
                let status = if result.success {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
                (
                    status,
                    StatusPatch {
                        completed_at: Some(now_ms()),
                        output_result: Some(result.output),
                        error_message: result.error,
                        ..Default::default()
                    },
                )
            }
            Err(e) => (
                ExecutionStatus::Failed,
                StatusPatch {
                    completed_at: Some(now_ms()),
                    error_message: Some(format!("{e:#}")),
                    ..Default::default()
                },
            ),
        };
        info!(item_id = %item.id, status = status.as_str(), "work item finished");
        if !running {
            // Completed is only reachable through running.
            self.reporter.report(&item.id, ExecutionStatus::Running, started).await;
        }
        self.reporter.report(&item.id, status, patch).await;
    }

    async fn resolve(&self, item: &WorkItem) -> Result<TaskDefinition> {
        let record = self
            .gateway
            .get_task(&item.task_id)
            .await?
            .ok_or_else(|| anyhow!("task {} not found", item.task_id))?;
        Ok(TaskDefinition::decode(&record)?)
    }

    /// Dispatch on the task kind. `Err` means a spawn-level failure.
    pub async fn execute(&self, task: &TaskDefinition, params: &Map<String, Value>) -> Result<RunResult> {
        match &task.kind {
            TaskKind::Single(step) | TaskKind::Custom(step) => {
                let out = self.run_step(step, &override_line(step, params)).await?;
                Ok(RunResult {
                    success: succeeded(&out),
                    error: failure_message(&out),
                    output: command_result(&out),
                })
            }
            TaskKind::Report(step) => {
                let out = self.run_step(step, &override_line(step, params)).await?;
                Ok(RunResult {
                    success: succeeded(&out),
                    error: failure_message(&out),
                    output: json!({
                        "exit_code": out.exit_code,
                        "report": out.stdout,
                        "line_count": out.stdout.lines().count(),
                    }),
                })
            }
            TaskKind::Monitoring(spec) => {
                let out = self.run_step(&spec.step, &override_line(&spec.step, params)).await?;
                let alerts = spec.alerts(&out.stdout);
                Ok(RunResult {
                    success: succeeded(&out),
                    error: failure_message(&out),
                    output: json!({
                        "exit_code": out.exit_code,
                        "alert_count": alerts.len(),
                        "alerts": alerts,
                    }),
                })
            }
            TaskKind::Workflow(steps) => {
                let mut results = Vec::with_capacity(steps.len());
                let mut error = None;
                for (index, ws) in steps.iter().enumerate() {
                    let out = self
                        .run_step(&ws.step, &render_params(&ws.step.command, params))
                        .await?;
                    results.push(json!({
                        "name": ws.name,
                        "index": index,
                        "exit_code": out.exit_code,
                        "stdout": out.stdout,
                        "stderr": out.stderr,
                    }));
                    if !succeeded(&out) {
                        error = Some(format!(
                            "step '{}' failed: {}",
                            ws.name,
                            failure_message(&out).unwrap_or_default()
                        ));
                        break;
                    }
                }
                Ok(RunResult {
                    success: error.is_none(),
                    output: json!({
                        "completed_steps": results.len(),
                        "total_steps": steps.len(),
                        "steps": results,
                    }),
                    error,
                })
            }
            TaskKind::Batch(spec) => {
                let mut iterations = Vec::with_capacity(spec.count as usize);
                let mut failed = 0usize;
                for index in 1..=spec.count {
                    let line = render_params(&render_batch(&spec.template.command, index, spec.count), params);
                    let out = self.run_step(&spec.template, &line).await?;
                    if !succeeded(&out) {
                        failed += 1;
                    }
                    iterations.push(json!({
                        "index": index,
                        "exit_code": out.exit_code,
                        "stdout": out.stdout,
                        "stderr": out.stderr,
                    }));
                }
                Ok(RunResult {
                    success: failed == 0,
                    error: (failed > 0).then(|| format!("{failed} of {} iterations failed", spec.count)),
                    output: json!({
                        "succeeded": iterations.len() - failed,
                        "failed": failed,
                        "iterations": iterations,
                    }),
                })
            }
        }
    }

    /// Run one rendered command line the way its step asks for.
    async fn run_step(&self, step: &CommandStep, line: &str) -> Result<EngineOutcome> {
        if line.trim().is_empty() {
            bail!("command is empty");
        }
        let cmd = CommandLine {
            line: line.to_string(),
            working_dir: step.working_dir.clone().or_else(|| self.config.working_dir.clone()),
            env: step.env.clone(),
        };
        let interactive = needs_interaction(step.interactive, line);

        if interactive && (step.spawn_in_terminal || self.config.spawn_interactive_in_terminal) {
            let exit_code = process::run_in_terminal(&self.config.terminal_command, &self.config.shell, &cmd)
                .await
                .map_err(|e| anyhow!("failed to open terminal: {e}"))?;
            return Ok(EngineOutcome {
                mode: Mode::Terminal,
                exit_code,
                ..Default::default()
            });
        }
        if interactive || !step.auto_responses.is_empty() {
            return Ok(self.engine.run(&cmd, &step.auto_responses).await?);
        }

        let timeout = step.timeout_seconds.map(Duration::from_secs);
        let captured = process::run_captured(&self.config.shell, &cmd, timeout, self.config.max_output_bytes)
            .await
            .map_err(|e| anyhow!("failed to spawn command: {e}"))?;
        let mut warnings = vec![];
        if captured.timed_out {
            warnings.push(format!("timed out after {}s", step.timeout_seconds.unwrap_or_default()));
        }
        Ok(EngineOutcome {
            mode: Mode::Captured,
            exit_code: captured.exit_code,
            stdout: captured.stdout,
            stderr: captured.stderr,
            warnings,
            ..Default::default()
        })
    }
}

/// `input_params.command` replaces the configured line; placeholders are then filled.
fn override_line(step: &CommandStep, params: &Map<String, Value>) -> String {
    let base = params
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or(&step.command);
    render_params(base, params)
}

fn succeeded(out: &EngineOutcome) -> bool {
    out.exit_code == Some(0)
}

fn failure_message(out: &EngineOutcome) -> Option<String> {
    if succeeded(out) {
        return None;
    }
    if let Some(w) = out.warnings.iter().find(|w| w.starts_with("timed out")) {
        return Some(w.clone());
    }
    Some(match out.exit_code {
        Some(code) => format!("command exited with code {code}"),
        None => "command terminated by signal".to_string(),
    })
}

fn command_result(out: &EngineOutcome) -> Value {
    let mut result = json!({
        "exit_code": out.exit_code,
        "stdout": out.stdout,
        "stderr": out.stderr,
        "mode": out.mode,
    });
    if !out.fired.is_empty() {
        result["fired"] = json!(out.fired);
    }
    if out.interrupted {
        result["interrupted"] = json!(true);
    }
    if !out.warnings.is_empty() {
        result["warnings"] = json!(out.warnings);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_command_overrides_configured_line() {
        let step = CommandStep {
            command: "echo default".into(),
            ..Default::default()
        };
        let params = json!({"command": "echo {{who}}", "who": "ops"}).as_object().cloned().unwrap();
        assert_eq!(override_line(&step, &params), "echo ops");
        assert_eq!(override_line(&step, &Map::new()), "echo default");
    }

    #[test]
    fn failure_messages_follow_exit() {
        let ok = EngineOutcome {
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(failure_message(&ok), None);
        let bad = EngineOutcome {
            exit_code: Some(2),
            ..Default::default()
        };
        assert_eq!(failure_message(&bad).as_deref(), Some("command exited with code 2"));
        let timed_out = EngineOutcome {
            warnings: vec!["timed out after 1s".into()],
            ..Default::default()
        };
        assert_eq!(failure_message(&timed_out).as_deref(), Some("timed out after 1s"));
    }
}
