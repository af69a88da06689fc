use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use relay_core::model::WorkItem;
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info};

use crate::claim::{ClaimCoordinator, ClaimOutcome};
use crate::detect::Channel;
use crate::runner::Runner;

/// What happened to an offered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Claimed here and handed to the runner.
    Started,
    /// Already running locally; nothing was attempted.
    AlreadyExecuting,
    /// Not claimed (lost, gone or rejected).
    Skipped,
}

/// Owns the local "currently executing" set and starts runs.
pub struct Dispatcher {
    coordinator: ClaimCoordinator,
    runner: Arc<Runner>,
    executing: Arc<Mutex<HashSet<String>>>,
    idle: Arc<Notify>,
    limit: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub fn new(coordinator: ClaimCoordinator, runner: Arc<Runner>, max_concurrent: Option<usize>) -> Self {
        Self {
            coordinator,
            runner,
            executing: Arc::new(Mutex::new(HashSet::new())),
            idle: Arc::new(Notify::new()),
            limit: max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    pub async fn offer(&self, item: WorkItem, channel: Channel) -> Result<Dispatched> {
        if self.is_executing(&item.id) {
            return Ok(Dispatched::AlreadyExecuting);
        }
        let claimed = match self.coordinator.try_claim(&item, channel).await? {
            ClaimOutcome::Claimed(claimed) => claimed,
            ClaimOutcome::AlreadyClaimed | ClaimOutcome::Rejected(_) => return Ok(Dispatched::Skipped),
        };
        if !self.executing.lock().unwrap().insert(claimed.id.clone()) {
            return Ok(Dispatched::AlreadyExecuting);
        }
        info!(item_id = %claimed.id, %channel, "claimed work item");
        self.start(claimed);
        Ok(Dispatched::Started)
    }

    fn start(&self, item: WorkItem) {
        let runner = self.runner.clone();
        let executing = self.executing.clone();
        let idle = self.idle.clone();
        let limit = self.limit.clone();

        tokio::spawn(async move {
            let _permit = match limit {
                Some(sem) => sem.acquire_owned().await.ok(),
                None => None,
            };
            let item_id = item.id.clone();
            let run = tokio::spawn(async move { runner.run(item).await });
            if let Err(e) = run.await {
                error!(%item_id, error = %e, "run aborted");
            }
            let mut set = executing.lock().unwrap();
            set.remove(&item_id);
            if set.is_empty() {
                idle.notify_waiters();
            }
        });
    }

    pub fn is_executing(&self, item_id: &str) -> bool {
        self.executing.lock().unwrap().contains(item_id)
    }

    /// Ids of items currently executing, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.executing.lock().unwrap().iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.executing.lock().unwrap().len()
    }

    /// Resolve once nothing is executing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}
