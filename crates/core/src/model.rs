//! Backend rows and the work item lifecycle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::{new_ulid, EpochMs};

/// Lifecycle status of a work item (an "execution" row).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created by a producer, not yet owned by any destination.
    Pending,
    /// Owned by a destination (claim fence set), not yet started.
    Claimed,
    /// Process spawned by the owning destination.
    Running,
    /// Finished; every command exited with zero.
    Completed,
    /// Finished with a non-zero exit, a spawn error or an unresolvable task.
    Failed,
}

impl ExecutionStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [ExecutionStatus; 5] = [
        Self::Pending,
        Self::Claimed,
        Self::Running,
        Self::Completed,
        Self::Failed,
    ];

    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal forward transition.
    ///
    /// `Pending -> Claimed` is only ever written by the conditional claim.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::{Claimed, Completed, Failed, Pending, Running};
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Running)
                | (Claimed, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    /// Wire string, as stored in the backend.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One unit of work, to be run exactly once by one destination.
///
/// `destination_id` and `claimed_at` are set together by the conditional claim.
/// A non-null `destination_id` is terminal ownership for the active lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    /// Record key (a ULID for locally created items).
    pub id: String,
    /// Task to run.
    pub task_id: String,
    /// Schedule that materialized the item, if any.
    #[serde(default)]
    pub schedule_id: Option<String>,
    /// Lifecycle position; see [`ExecutionStatus::can_transition_to`].
    pub status: ExecutionStatus,
    /// Owner. Set by a producer to pre-assign, or by the claim.
    #[serde(default)]
    pub destination_id: Option<String>,
    /// Claim fence.
    #[serde(default)]
    pub claimed_at: Option<EpochMs>,
    /// Per-run parameters; `command` overrides the task's line.
    #[serde(default)]
    pub input_params: Map<String, Value>,
    /// Structured result, written with the terminal status.
    #[serde(default)]
    pub output_result: Option<Value>,
    /// Failure reason for a failed item.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Creation time; candidates are taken oldest first.
    pub queued_at: EpochMs,
    /// Set when the item starts running.
    #[serde(default)]
    pub started_at: Option<EpochMs>,
    /// Set with the terminal status.
    #[serde(default)]
    pub completed_at: Option<EpochMs>,
}

impl WorkItem {
    /// A fresh pending item for `task_id`.
    pub fn pending(task_id: impl Into<String>, queued_at: EpochMs) -> Self {
        Self {
            id: new_ulid().to_string(),
            task_id: task_id.into(),
            schedule_id: None,
            status: ExecutionStatus::Pending,
            destination_id: None,
            claimed_at: None,
            input_params: Map::new(),
            output_result: None,
            error_message: None,
            queued_at,
            started_at: None,
            completed_at: None,
        }
    }

    /// Pre-assign the item to a destination (claim fence still unset).
    pub fn assigned_to(mut self, destination_id: impl Into<String>) -> Self {
        self.destination_id = Some(destination_id.into());
        self
    }

    /// Whether `destination_id` may attempt the conditional claim on this item.
    ///
    /// Mirrors the backend predicate: pending and either unowned, or assigned
    /// to this destination with no claim fence yet.
    pub fn claimable_by(&self, destination_id: &str) -> bool {
        if self.status != ExecutionStatus::Pending {
            return false;
        }
        match self.destination_id.as_deref() {
            None => true,
            Some(owner) => owner == destination_id && self.claimed_at.is_none(),
        }
    }
}

/// Partial update of a work item row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusPatch {
    /// Set when the item starts running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<EpochMs>,
    /// Set with the terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<EpochMs>,
    /// Structured run result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_result: Option<Value>,
    /// Human-readable failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StatusPatch {
    /// Apply the patch and the new status to an item in place.
    pub fn apply(&self, status: ExecutionStatus, item: &mut WorkItem) {
        item.status = status;
        if let Some(v) = self.started_at {
            item.started_at = Some(v);
        }
        if let Some(v) = self.completed_at {
            item.completed_at = Some(v);
        }
        if let Some(v) = &self.output_result {
            item.output_result = Some(v.clone());
        }
        if let Some(v) = &self.error_message {
            item.error_message = Some(v.clone());
        }
    }
}

/// Operational status of a destination (one running agent).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStatus {
    /// Accepting work.
    Online,
    /// Stopped cleanly.
    Offline,
    /// Every execution slot is taken.
    Busy,
    /// Set by an operator; the agent does not pick this itself.
    Maintenance,
    /// The agent hit an error it could not recover from.
    Error,
}

/// This agent's identity row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Destination {
    /// Stable destination id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Authorization scope: tasks owned by one of these ids may run here.
    #[serde(default)]
    pub owner_ids: Vec<String>,
    /// Current operational status.
    pub status: DestinationStatus,
    /// Last time the row was written.
    pub updated_at: EpochMs,
}

/// Append-only liveness telemetry. Not claim state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    /// Record key (ULID).
    pub id: String,
    /// Reporting destination.
    pub destination_id: String,
    /// Status at the time of the beat.
    pub status: DestinationStatus,
    /// Work items executing at the time of the beat.
    pub active_executions: usize,
    /// When the beat was taken.
    pub at: EpochMs,
}

/// Recurring (or one-shot) definition that materializes pending work items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    /// Record key.
    pub id: String,
    /// Task each materialized item runs.
    pub task_id: String,
    /// Pre-assignment copied onto each materialized item.
    #[serde(default)]
    pub destination_id: Option<String>,
    /// Disabled schedules never fire. One-shots disable themselves.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Repeat period. `None` means one-shot.
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    /// Slot the schedule fires at next.
    pub next_run_at: EpochMs,
    /// When the schedule last fired.
    #[serde(default)]
    pub last_run_at: Option<EpochMs>,
    /// Copied onto each materialized item.
    #[serde(default)]
    pub input_params: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Schedule {
    /// Due at `now`?
    pub fn is_due(&self, now: EpochMs) -> bool {
        self.enabled && self.next_run_at <= now
    }

    /// The slot after the current one, and whether the schedule stays enabled.
    ///
    /// Missed slots are not replayed: the next slot is the first one after `now`.
    pub fn advance(&self, now: EpochMs) -> (EpochMs, bool) {
        match self.interval_seconds {
            Some(secs) if secs > 0 => {
                let step = (secs as i64) * 1000;
                let mut next = self.next_run_at + step;
                if next <= now {
                    let behind = now - next;
                    next += (behind / step + 1) * step;
                }
                (next, true)
            }
            _ => (self.next_run_at, false),
        }
    }

    /// Build the pending work item for the current slot.
    pub fn materialize(&self, now: EpochMs) -> WorkItem {
        let mut item = WorkItem::pending(self.task_id.clone(), now);
        item.schedule_id = Some(self.id.clone());
        item.destination_id = self.destination_id.clone();
        item.input_params = self.input_params.clone();
        item
    }
}
