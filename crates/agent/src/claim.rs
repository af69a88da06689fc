//! Claim coordinator.
//!
//! The conditional write in [`Gateway::claim`] is what keeps two destinations
//! from running the same item. Everything here only decides whether that write
//! is worth attempting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_core::model::WorkItem;
use relay_core::now_ms;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::detect::Channel;
use crate::gateway::SharedGateway;

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This destination now owns the item.
    Claimed(WorkItem),
    /// Someone else got there first, or the row is gone.
    AlreadyClaimed,
    /// Not ours to run.
    Rejected(String),
}

pub struct ClaimCoordinator {
    gateway: SharedGateway,
    destination_id: String,
    owner_ids: Vec<String>,
    seen_ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl ClaimCoordinator {
    pub fn new(
        gateway: SharedGateway,
        destination_id: impl Into<String>,
        owner_ids: Vec<String>,
        seen_ttl: Duration,
    ) -> Self {
        Self {
            gateway,
            destination_id: destination_id.into(),
            owner_ids,
            seen_ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    /// Try to take ownership of `item`.
    ///
    /// Gateway failures are returned as errors and are not remembered, so the
    /// next detection retries.
    pub async fn try_claim(&self, item: &WorkItem, channel: Channel) -> Result<ClaimOutcome> {
        if !item.claimable_by(&self.destination_id) {
            trace!(item_id = %item.id, %channel, "not claimable here");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        if self.recently_decided(&item.id) {
            trace!(item_id = %item.id, %channel, "claim already decided recently");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        if let Some(reason) = self.authorize(item).await? {
            debug!(item_id = %item.id, %channel, %reason, "rejecting work item");
            self.remember(&item.id);
            return Ok(ClaimOutcome::Rejected(reason));
        }

        let claimed = self
            .gateway
            .claim(&item.id, &self.destination_id, now_ms())
            .await
            .with_context(|| format!("claiming {}", item.id))?;
        self.remember(&item.id);

        match claimed {
            Some(item) => Ok(ClaimOutcome::Claimed(item)),
            None => {
                trace!(item_id = %item.id, %channel, "claim lost");
                Ok(ClaimOutcome::AlreadyClaimed)
            }
        }
    }

    /// `Some(reason)` when the item's task is outside this destination's scope.
    async fn authorize(&self, item: &WorkItem) -> Result<Option<String>> {
        let task = self
            .gateway
            .get_task(&item.task_id)
            .await
            .with_context(|| format!("loading task {}", item.task_id))?;
        let Some(task) = task else {
            return Ok(Some(format!("task {} not found", item.task_id)));
        };
        if self.owner_ids.iter().any(|owner| *owner == task.owner_id) {
            Ok(None)
        } else {
            Ok(Some(format!(
                "task {} belongs to {}, outside this destination's scope",
                task.id, task.owner_id
            )))
        }
    }

    fn recently_decided(&self, item_id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap();
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < self.seen_ttl);
        seen.contains_key(item_id)
    }

    fn remember(&self, item_id: &str) {
        if self.seen_ttl.is_zero() {
            return;
        }
        self.seen
            .lock()
            .unwrap()
            .insert(item_id.to_string(), Instant::now());
    }
}
