use std::time::Duration;

use anyhow::{Context, Result};
use relay_core::{now_ms, EpochMs};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::ScheduleConfig;
use crate::gateway::SharedGateway;

/// Materializes pending work items from due schedules.
///
/// Several agents may check the same schedule; the conditional advance picks
/// one winner per slot and only the winner inserts.
pub struct ScheduleTrigger {
    gateway: SharedGateway,
    config: ScheduleConfig,
}

impl ScheduleTrigger {
    pub fn new(gateway: SharedGateway, config: ScheduleConfig) -> Self {
        Self { gateway, config }
    }

    /// One pass at `now`. Returns how many items this call inserted.
    pub async fn check_once(&self, now: EpochMs) -> Result<usize> {
        let due = self
            .gateway
            .due_schedules(now, self.config.batch_limit)
            .await
            .context("loading due schedules")?;

        let mut inserted = 0;
        for schedule in due {
            let (next_run_at, enabled) = schedule.advance(now);
            let won = self
                .gateway
                .advance_schedule(&schedule.id, schedule.next_run_at, next_run_at, enabled, now)
                .await
                .with_context(|| format!("advancing schedule {}", schedule.id))?;
            if !won {
                debug!(schedule_id = %schedule.id, "slot taken by another trigger");
                continue;
            }

            let item = schedule.materialize(now);
            match self.gateway.insert_item(&item).await {
                Ok(()) => {
                    info!(schedule_id = %schedule.id, item_id = %item.id, "scheduled work item queued");
                    inserted += 1;
                }
                Err(e) => warn!(schedule_id = %schedule.id, error = %e, "inserting scheduled item failed"),
            }
        }
        Ok(inserted)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            return;
        }
        let mut tick = interval(Duration::from_secs(self.config.check_interval_seconds.max(1)));
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.check_once(now_ms()).await {
                warn!(error = %e, "schedule check failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use relay_core::model::{ExecutionStatus, Schedule};
    use std::sync::Arc;

    fn schedule(interval_seconds: Option<u64>) -> Schedule {
        Schedule {
            id: "s1".into(),
            task_id: "t1".into(),
            destination_id: Some("me".into()),
            enabled: true,
            interval_seconds,
            next_run_at: 1_000,
            last_run_at: None,
            input_params: serde_json::json!({"target": "db"}).as_object().cloned().unwrap(),
        }
    }

    #[tokio::test]
    async fn one_slot_materializes_once_across_triggers() {
        let gw = Arc::new(MemoryGateway::new());
        gw.put_schedule(schedule(Some(60)));
        let a = ScheduleTrigger::new(gw.clone(), ScheduleConfig::default());
        let b = ScheduleTrigger::new(gw.clone(), ScheduleConfig::default());

        let (x, y) = tokio::join!(a.check_once(2_000), b.check_once(2_000));
        assert_eq!(x.unwrap() + y.unwrap(), 1);

        let items = gw.items();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.status, ExecutionStatus::Pending);
        assert_eq!(item.schedule_id.as_deref(), Some("s1"));
        assert_eq!(item.destination_id.as_deref(), Some("me"));
        assert_eq!(item.input_params["target"], "db");
        assert_eq!(gw.schedule("s1").unwrap().next_run_at, 61_000);
    }

    #[tokio::test]
    async fn one_shot_is_disabled_after_firing() {
        let gw = Arc::new(MemoryGateway::new());
        gw.put_schedule(schedule(None));
        let t = ScheduleTrigger::new(gw.clone(), ScheduleConfig::default());
        assert_eq!(t.check_once(5_000).await.unwrap(), 1);
        assert_eq!(t.check_once(6_000).await.unwrap(), 0);
        let s = gw.schedule("s1").unwrap();
        assert!(!s.enabled);
        assert_eq!(s.last_run_at, Some(5_000));
    }

    #[tokio::test]
    async fn not_yet_due_is_left_alone() {
        let gw = Arc::new(MemoryGateway::new());
        gw.put_schedule(schedule(Some(60)));
        let t = ScheduleTrigger::new(gw.clone(), ScheduleConfig::default());
        assert_eq!(t.check_once(999).await.unwrap(), 0);
        assert!(gw.items().is_empty());
    }
}
