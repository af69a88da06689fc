use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use relay_core::api::ChangeKind;
use relay_core::model::{
    Destination, ExecutionStatus, Heartbeat, Schedule, StatusPatch, WorkItem,
};
use relay_core::task::TaskRecord;
use relay_core::EpochMs;
use tokio::sync::broadcast;

use super::{ChangeEvent, ChangeStream, Gateway, ItemFilter};

const FEED_CAPACITY: usize = 256;

/// Row-level writes, in the order they were applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Inserted { item_id: String },
    Claimed { item_id: String, destination_id: String },
    StatusUpdated { item_id: String, status: ExecutionStatus },
    ScheduleAdvanced { schedule_id: String, next_run_at: EpochMs },
}

/// In-process backend. Not durable; used by tests and by `endpoint = "memory"`.
pub struct MemoryGateway {
    inner: Mutex<Inner>,
    claim_calls: AtomicUsize,
    subscriptions: AtomicUsize,
    fail_updates: AtomicBool,
}

struct Inner {
    items: HashMap<String, WorkItem>,
    tasks: HashMap<String, TaskRecord>,
    schedules: HashMap<String, Schedule>,
    destinations: HashMap<String, Destination>,
    heartbeats: Vec<Heartbeat>,
    mutations: Vec<Mutation>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                items: HashMap::new(),
                tasks: HashMap::new(),
                schedules: HashMap::new(),
                destinations: HashMap::new(),
                heartbeats: Vec::new(),
                mutations: Vec::new(),
                feed,
            }),
            claim_calls: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
            fail_updates: AtomicBool::new(false),
        }
    }

    pub fn put_task(&self, task: TaskRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.insert(task.id.clone(), task);
    }

    pub fn put_schedule(&self, schedule: Schedule) {
        let mut inner = self.inner.lock().unwrap();
        inner.schedules.insert(schedule.id.clone(), schedule);
    }

    /// Remove a row, as an upstream delete/archive would.
    pub fn remove_item(&self, item_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.remove(item_id) {
            let _ = inner.feed.send(ChangeEvent {
                kind: ChangeKind::Deleted,
                item,
            });
        }
    }

    pub fn item(&self, item_id: &str) -> Option<WorkItem> {
        self.inner.lock().unwrap().items.get(item_id).cloned()
    }

    pub fn items(&self) -> Vec<WorkItem> {
        self.inner.lock().unwrap().items.values().cloned().collect()
    }

    pub fn schedule(&self, schedule_id: &str) -> Option<Schedule> {
        self.inner.lock().unwrap().schedules.get(schedule_id).cloned()
    }

    pub fn destination(&self, destination_id: &str) -> Option<Destination> {
        self.inner
            .lock()
            .unwrap()
            .destinations
            .get(destination_id)
            .cloned()
    }

    pub fn heartbeats(&self) -> Vec<Heartbeat> {
        self.inner.lock().unwrap().heartbeats.clone()
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.inner.lock().unwrap().mutations.clone()
    }

    /// Mutations touching one item.
    pub fn mutations_for(&self, item_id: &str) -> Vec<Mutation> {
        self.mutations()
            .into_iter()
            .filter(|m| match m {
                Mutation::Inserted { item_id: id }
                | Mutation::Claimed { item_id: id, .. }
                | Mutation::StatusUpdated { item_id: id, .. } => id == item_id,
                Mutation::ScheduleAdvanced { .. } => false,
            })
            .collect()
    }

    /// Number of conditional claim writes attempted against this backend.
    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }

    /// Number of change-feed subscriptions opened so far.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Make every `update_item` fail until reset.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// End every open change feed, as a dropped connection would.
    pub fn disconnect_feeds(&self) {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        let mut inner = self.inner.lock().unwrap();
        inner.feed = feed;
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn claim(
        &self,
        item_id: &str,
        destination_id: &str,
        claimed_at: EpochMs,
    ) -> Result<Option<WorkItem>> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        let Some(item) = inner.items.get_mut(item_id) else {
            return Ok(None);
        };
        if !item.claimable_by(destination_id) {
            return Ok(None);
        }
        item.destination_id = Some(destination_id.to_string());
        item.claimed_at = Some(claimed_at);
        item.status = ExecutionStatus::Claimed;
        let claimed = item.clone();

        inner.mutations.push(Mutation::Claimed {
            item_id: item_id.to_string(),
            destination_id: destination_id.to_string(),
        });
        let _ = inner.feed.send(ChangeEvent {
            kind: ChangeKind::Updated,
            item: claimed.clone(),
        });
        Ok(Some(claimed))
    }

    async fn query_items(&self, filter: &ItemFilter, limit: usize) -> Result<Vec<WorkItem>> {
        let inner = self.inner.lock().unwrap();
        let mut items: Vec<WorkItem> = inner
            .items
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.queued_at);
        items.truncate(limit);
        Ok(items)
    }

    async fn subscribe(&self, filter: &ItemFilter) -> Result<ChangeStream> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let rx = self.inner.lock().unwrap().feed.subscribe();
        let filter = filter.clone();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let filter = filter.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if event.kind != ChangeKind::Deleted && filter.matches(&event.item) => {
                            return Some((Ok(event), rx));
                        }
                        Ok(_) => continue,
                        // The poll loop covers whatever was dropped.
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn get_item(&self, item_id: &str) -> Result<Option<WorkItem>> {
        Ok(self.item(item_id))
    }

    async fn update_item(
        &self,
        item_id: &str,
        status: ExecutionStatus,
        patch: &StatusPatch,
    ) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            bail!("backend unavailable");
        }
        let mut inner = self.inner.lock().unwrap();
        let Some(item) = inner.items.get_mut(item_id) else {
            bail!("work item {item_id} not found");
        };
        if !item.status.can_transition_to(status) {
            if item.status.is_terminal() {
                bail!("work item {item_id} is already {}", item.status.as_str());
            }
            bail!(
                "work item {item_id} cannot move from {} to {}",
                item.status.as_str(),
                status.as_str()
            );
        }
        patch.apply(status, item);
        let updated = item.clone();
        inner.mutations.push(Mutation::StatusUpdated {
            item_id: item_id.to_string(),
            status,
        });
        let _ = inner.feed.send(ChangeEvent {
            kind: ChangeKind::Updated,
            item: updated,
        });
        Ok(())
    }

    async fn insert_item(&self, item: &WorkItem) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.contains_key(&item.id) {
            bail!("work item {} already exists", item.id);
        }
        inner.items.insert(item.id.clone(), item.clone());
        inner.mutations.push(Mutation::Inserted {
            item_id: item.id.clone(),
        });
        let _ = inner.feed.send(ChangeEvent {
            kind: ChangeKind::Created,
            item: item.clone(),
        });
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.inner.lock().unwrap().tasks.get(task_id).cloned())
    }

    async fn due_schedules(&self, now: EpochMs, limit: usize) -> Result<Vec<Schedule>> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<Schedule> = inner
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn advance_schedule(
        &self,
        schedule_id: &str,
        expected_next_run_at: EpochMs,
        next_run_at: EpochMs,
        enabled: bool,
        last_run_at: EpochMs,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(schedule) = inner.schedules.get_mut(schedule_id) else {
            return Ok(false);
        };
        if !schedule.enabled || schedule.next_run_at != expected_next_run_at {
            return Ok(false);
        }
        schedule.next_run_at = next_run_at;
        schedule.enabled = enabled;
        schedule.last_run_at = Some(last_run_at);
        inner.mutations.push(Mutation::ScheduleAdvanced {
            schedule_id: schedule_id.to_string(),
            next_run_at,
        });
        Ok(true)
    }

    async fn upsert_destination(&self, destination: &Destination) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .destinations
            .insert(destination.id.clone(), destination.clone());
        Ok(())
    }

    async fn insert_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        self.inner.lock().unwrap().heartbeats.push(heartbeat.clone());
        Ok(())
    }
}
