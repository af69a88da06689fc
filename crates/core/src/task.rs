//! Task definitions.
//!
//! The backend stores a task as a loosely typed row (`task_type` string plus a
//! free-form `configuration` object). [`TaskDefinition::decode`] turns that row
//! into a closed [`TaskKind`] once, at load time, so the runner never looks up
//! optional keys.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Upper bound on `batch.count`.
pub const MAX_BATCH_COUNT: u32 = 100;

/// Default monitoring keywords (matched case-insensitively, per line).
pub const DEFAULT_FAILURE_KEYWORDS: &[&str] = &["error", "fail", "critical", "down"];

/// Raw task row as stored by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    /// Record key.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// User who owns the task; checked against the destination's owners.
    pub owner_id: String,
    /// `single`, `workflow`, `batch`, `report`, `monitoring` or `custom`.
    pub task_type: String,
    /// Type-specific settings, decoded by [`TaskDefinition::decode`].
    #[serde(default)]
    pub configuration: Map<String, Value>,
    /// Steps of a `workflow` task.
    #[serde(default)]
    pub workflow: Vec<Value>,
}

/// Decoded, immutable-for-the-run task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    /// Record key.
    pub id: String,
    /// Display name.
    pub name: String,
    /// User who owns the task.
    pub owner_id: String,
    /// What to run.
    pub kind: TaskKind,
}

/// One variant per task type, each carrying only what it needs.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Run one command.
    Single(CommandStep),
    /// Run steps in order, stopping at the first non-zero exit.
    Workflow(Vec<WorkflowStep>),
    /// Run a templated command `count` times.
    Batch(BatchSpec),
    /// Run one command; the result is shaped as a report.
    Report(CommandStep),
    /// Run one command; output lines are scanned for failure keywords.
    Monitoring(MonitoringSpec),
    /// Run one command; raw result.
    Custom(CommandStep),
}

impl TaskKind {
    /// Wire name of the task type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Single(_) => "single",
            Self::Workflow(_) => "workflow",
            Self::Batch(_) => "batch",
            Self::Report(_) => "report",
            Self::Monitoring(_) => "monitoring",
            Self::Custom(_) => "custom",
        }
    }
}

/// How to run one shell line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandStep {
    /// Shell line. May be empty when the work item supplies `input_params.command`.
    #[serde(default)]
    pub command: String,
    /// Explicit interactivity flag. Signature detection applies on top of it.
    #[serde(default)]
    pub interactive: bool,
    /// Hand an interactive command to a visible terminal window.
    #[serde(default, alias = "spawn_in_terminal")]
    pub spawn_in_terminal: bool,
    /// Directory to run in; the agent's configured default applies when absent.
    #[serde(default, alias = "working_dir")]
    pub working_dir: Option<String>,
    /// Extra environment, on top of the agent's own.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Only enforced for non-interactive commands.
    #[serde(default, alias = "timeout_seconds")]
    pub timeout_seconds: Option<u64>,
    /// Scripted input. Non-empty rules force a scripted run.
    #[serde(default, alias = "auto_responses")]
    pub auto_responses: Vec<AutoResponseRule>,
}

/// Named workflow step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    /// Label used in results and error messages.
    #[serde(default)]
    pub name: String,
    /// The command itself.
    #[serde(flatten)]
    pub step: CommandStep,
}

/// Bounded, numbered repetition of a command template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSpec {
    /// `{index}` (1-based) and `{count}` are substituted per iteration.
    #[serde(flatten)]
    pub template: CommandStep,
    /// Iterations, at most [`MAX_BATCH_COUNT`].
    pub count: u32,
}

/// Single command plus the keywords that count as alerts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    /// The command whose output is scanned.
    #[serde(flatten)]
    pub step: CommandStep,
    /// Case-insensitive substrings that mark a line as an alert.
    #[serde(default = "default_failure_keywords", alias = "failure_keywords")]
    pub failure_keywords: Vec<String>,
}

fn default_failure_keywords() -> Vec<String> {
    DEFAULT_FAILURE_KEYWORDS.iter().map(|s| s.to_string()).collect()
}

impl MonitoringSpec {
    /// Output lines containing any failure keyword.
    pub fn alerts<'a>(&self, output: &'a str) -> Vec<&'a str> {
        let keywords: Vec<String> = self
            .failure_keywords
            .iter()
            .map(|k| k.to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        output
            .lines()
            .filter(|line| {
                let lower = line.to_lowercase();
                keywords.iter().any(|k| lower.contains(k.as_str()))
            })
            .collect()
    }
}

/// Scripted keystroke injection for an interactive child.
///
/// Rules are consumed strictly in list order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoResponseRule {
    /// Regex matched against the child's output. `None` means timer-driven.
    #[serde(default)]
    pub trigger: Option<String>,
    /// Text sent to the child; a newline is appended when missing.
    #[serde(default)]
    pub input: String,
    /// Milliseconds.
    #[serde(default, rename = "delay")]
    pub delay_ms: u64,
    /// Timer measured from process start rather than from the previous rule.
    #[serde(default)]
    pub immediate: bool,
    /// Interrupt the child shortly after this rule fires.
    #[serde(default, alias = "close_after")]
    pub close_after: bool,
}

impl AutoResponseRule {
    /// Wait before the input is sent.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Fires on time alone.
    pub fn is_untriggered(&self) -> bool {
        self.trigger.as_deref().map_or(true, str::is_empty)
    }

    /// Bytes written to the child, newline-terminated.
    pub fn input_bytes(&self) -> Vec<u8> {
        let mut bytes = self.input.as_bytes().to_vec();
        if !bytes.ends_with(b"\n") {
            bytes.push(b'\n');
        }
        bytes
    }
}

/// Why a task row could not be decoded.
#[derive(Debug, Error)]
pub enum TaskDecodeError {
    /// `task_type` names no known type.
    #[error("unknown task type '{0}'")]
    UnknownTaskType(String),
    /// `configuration` does not fit the type's shape.
    #[error("invalid {task_type} configuration: {source}")]
    InvalidConfiguration {
        /// Type the row claimed.
        task_type: String,
        /// Underlying decode failure.
        #[source]
        source: serde_json::Error,
    },
    /// A workflow task with no steps.
    #[error("workflow has no steps")]
    EmptyWorkflow,
    /// Batch count of zero or above the cap.
    #[error("batch count {0} outside 1..={max}", max = MAX_BATCH_COUNT)]
    BatchCount(u32),
}

impl TaskDefinition {
    /// Decode a raw row into a typed definition.
    pub fn decode(record: &TaskRecord) -> Result<Self, TaskDecodeError> {
        let config = Value::Object(record.configuration.clone());
        let kind = match record.task_type.as_str() {
            "single" => TaskKind::Single(from_config(&record.task_type, config)?),
            "report" => TaskKind::Report(from_config(&record.task_type, config)?),
            "custom" => TaskKind::Custom(from_config(&record.task_type, config)?),
            "monitoring" => TaskKind::Monitoring(from_config(&record.task_type, config)?),
            "batch" => {
                let spec: BatchSpec = from_config(&record.task_type, config)?;
                if spec.count == 0 || spec.count > MAX_BATCH_COUNT {
                    return Err(TaskDecodeError::BatchCount(spec.count));
                }
                TaskKind::Batch(spec)
            }
            "workflow" => {
                if record.workflow.is_empty() {
                    return Err(TaskDecodeError::EmptyWorkflow);
                }
                let mut steps = Vec::with_capacity(record.workflow.len());
                for (index, raw) in record.workflow.iter().enumerate() {
                    let mut step: WorkflowStep = from_config(&record.task_type, raw.clone())?;
                    if step.name.is_empty() {
                        step.name = format!("step-{}", index + 1);
                    }
                    steps.push(step);
                }
                TaskKind::Workflow(steps)
            }
            other => return Err(TaskDecodeError::UnknownTaskType(other.to_string())),
        };

        Ok(Self {
            id: record.id.clone(),
            name: record.name.clone(),
            owner_id: record.owner_id.clone(),
            kind,
        })
    }
}

fn from_config<T: serde::de::DeserializeOwned>(
    task_type: &str,
    value: Value,
) -> Result<T, TaskDecodeError> {
    serde_json::from_value(value).map_err(|source| TaskDecodeError::InvalidConfiguration {
        task_type: task_type.to_string(),
        source,
    })
}

/// Substitute `{{key}}` placeholders from the work item's input params.
///
/// String values are inserted verbatim, other values as compact JSON.
/// Unknown placeholders are left as-is.
pub fn render_params(template: &str, params: &Map<String, Value>) -> String {
    let mut out = template.to_string();
    for (key, value) in params {
        let needle = format!("{{{{{key}}}}}");
        if !out.contains(&needle) {
            continue;
        }
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&needle, &replacement);
    }
    out
}

/// Substitute the batch placeholders `{index}` and `{count}`.
pub fn render_batch(template: &str, index: u32, count: u32) -> String {
    template
        .replace("{index}", &index.to_string())
        .replace("{count}", &count.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(task_type: &str, configuration: Value, workflow: Vec<Value>) -> TaskRecord {
        TaskRecord {
            id: "t1".into(),
            name: "demo".into(),
            owner_id: "u1".into(),
            task_type: task_type.into(),
            configuration: configuration.as_object().cloned().unwrap_or_default(),
            workflow,
        }
    }

    #[test]
    fn decodes_single_with_rules() {
        let rec = record(
            "single",
            json!({
                "command": "claude chat",
                "interactive": true,
                "autoResponses": [
                    {"trigger": "\\(y/n\\)", "input": "y", "delay": 200},
                    {"input": "/exit", "immediate": true, "delay": 5000, "closeAfter": true}
                ]
            }),
            vec![],
        );
        let def = TaskDefinition::decode(&rec).unwrap();
        let TaskKind::Single(step) = def.kind else {
            panic!("expected single");
        };
        assert_eq!(step.command, "claude chat");
        assert_eq!(step.auto_responses.len(), 2);
        assert_eq!(step.auto_responses[0].delay_ms, 200);
        assert!(step.auto_responses[1].close_after);
        assert!(step.auto_responses[1].is_untriggered());
    }

    #[test]
    fn decodes_workflow_and_names_steps() {
        let rec = record(
            "workflow",
            json!({}),
            vec![json!({"name": "build", "command": "make"}), json!({"command": "make test"})],
        );
        let def = TaskDefinition::decode(&rec).unwrap();
        let TaskKind::Workflow(steps) = def.kind else {
            panic!("expected workflow");
        };
        assert_eq!(steps[0].name, "build");
        assert_eq!(steps[1].name, "step-2");
        assert_eq!(steps[1].step.command, "make test");
    }

    #[test]
    fn rejects_unknown_type_empty_workflow_and_bad_batch() {
        assert!(matches!(
            TaskDefinition::decode(&record("nope", json!({}), vec![])),
            Err(TaskDecodeError::UnknownTaskType(_))
        ));
        assert!(matches!(
            TaskDefinition::decode(&record("workflow", json!({}), vec![])),
            Err(TaskDecodeError::EmptyWorkflow)
        ));
        assert!(matches!(
            TaskDefinition::decode(&record("batch", json!({"command": "x", "count": 0}), vec![])),
            Err(TaskDecodeError::BatchCount(0))
        ));
        assert!(matches!(
            TaskDefinition::decode(&record("batch", json!({"command": "x"}), vec![])),
            Err(TaskDecodeError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn monitoring_defaults_keywords() {
        let def = TaskDefinition::decode(&record("monitoring", json!({"command": "check"}), vec![]))
            .unwrap();
        let TaskKind::Monitoring(spec) = def.kind else {
            panic!("expected monitoring");
        };
        let alerts = spec.alerts("all good\nDisk ERROR on sda\nservice down\n");
        assert_eq!(alerts, vec!["Disk ERROR on sda", "service down"]);
    }

    #[test]
    fn input_is_newline_terminated_once() {
        let rule = AutoResponseRule {
            input: "yes".into(),
            ..Default::default()
        };
        assert_eq!(rule.input_bytes(), b"yes\n");
        let rule = AutoResponseRule {
            input: "yes\n".into(),
            ..Default::default()
        };
        assert_eq!(rule.input_bytes(), b"yes\n");
    }

    #[test]
    fn renders_placeholders() {
        let params = json!({"target": "db1", "n": 3}).as_object().cloned().unwrap();
        assert_eq!(render_params("ping {{target}} -c {{n}} {{missing}}", &params), "ping db1 -c 3 {{missing}}");
        assert_eq!(render_batch("job {index}/{count}", 2, 5), "job 2/5");
    }
}
