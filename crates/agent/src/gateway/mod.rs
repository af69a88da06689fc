//! Backend gateway: the only path to shared state.
//!
//! The agent depends on four operation shapes: a conditional row update (the
//! claim and the schedule advance), filtered queries, a filtered change feed,
//! and plain insert/update. Everything is passed around as `Arc<dyn Gateway>`
//! so tests can swap in [`MemoryGateway`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use relay_core::api::ChangeKind;
use relay_core::model::{Destination, ExecutionStatus, Heartbeat, Schedule, StatusPatch, WorkItem};
use relay_core::task::TaskRecord;
use relay_core::EpochMs;

pub mod memory;
pub mod surreal;

pub use memory::MemoryGateway;
pub use surreal::SurrealGateway;

/// Shared handle passed to every component at construction.
pub type SharedGateway = Arc<dyn Gateway>;

/// One change notification for a work item row.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub item: WorkItem,
}

/// Change feed. Ends when the subscription drops.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// Row predicates for detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemFilter {
    /// Pending, pre-assigned to this destination, claim fence unset.
    AssignedUnclaimed { destination_id: String },
    /// Pending and owned by nobody.
    UnassignedPending,
    /// Either of the above.
    Candidates { destination_id: String },
}

impl ItemFilter {
    /// Evaluate the predicate in-process.
    pub fn matches(&self, item: &WorkItem) -> bool {
        if item.status != ExecutionStatus::Pending {
            return false;
        }
        match self {
            Self::AssignedUnclaimed { destination_id } => {
                item.destination_id.as_deref() == Some(destination_id.as_str())
                    && item.claimed_at.is_none()
            }
            Self::UnassignedPending => item.destination_id.is_none(),
            Self::Candidates { destination_id } => item.claimable_by(destination_id),
        }
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Conditional claim. Sets `destination_id`, `claimed_at` and
    /// `status = claimed` only if the row exists, is pending, and is either
    /// unowned or assigned to `destination_id` without a claim fence.
    ///
    /// `Ok(None)` means zero rows were affected: the race was lost or the row is gone.
    async fn claim(
        &self,
        item_id: &str,
        destination_id: &str,
        claimed_at: EpochMs,
    ) -> Result<Option<WorkItem>>;

    async fn query_items(&self, filter: &ItemFilter, limit: usize) -> Result<Vec<WorkItem>>;

    async fn subscribe(&self, filter: &ItemFilter) -> Result<ChangeStream>;

    async fn get_item(&self, item_id: &str) -> Result<Option<WorkItem>>;

    /// Partial update of a work item row.
    async fn update_item(&self, item_id: &str, status: ExecutionStatus, patch: &StatusPatch)
        -> Result<()>;

    async fn insert_item(&self, item: &WorkItem) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    async fn due_schedules(&self, now: EpochMs, limit: usize) -> Result<Vec<Schedule>>;

    /// Conditional schedule advance: only applies while `next_run_at` still
    /// equals `expected_next_run_at`. Returns whether this caller won the slot.
    async fn advance_schedule(
        &self,
        schedule_id: &str,
        expected_next_run_at: EpochMs,
        next_run_at: EpochMs,
        enabled: bool,
        last_run_at: EpochMs,
    ) -> Result<bool>;

    async fn upsert_destination(&self, destination: &Destination) -> Result<()>;

    async fn insert_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()>;
}
