#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_agent::claim::ClaimCoordinator;
use relay_agent::config::{AutomationConfig, ExecutionConfig};
use relay_agent::dispatch::Dispatcher;
use relay_agent::gateway::MemoryGateway;
use relay_agent::runner::Runner;
use relay_core::task::TaskRecord;
use serde_json::Value;

pub const OWNER: &str = "u1";

pub fn task(id: &str, task_type: &str, configuration: Value) -> TaskRecord {
    TaskRecord {
        id: id.into(),
        name: id.into(),
        owner_id: OWNER.into(),
        task_type: task_type.into(),
        configuration: configuration.as_object().cloned().unwrap_or_default(),
        workflow: vec![],
    }
}

pub fn runner(gw: &Arc<MemoryGateway>) -> Runner {
    Runner::new(gw.clone(), ExecutionConfig::default(), AutomationConfig::default())
}

pub fn dispatcher(gw: &Arc<MemoryGateway>, destination_id: &str, seen_ttl: Duration) -> Arc<Dispatcher> {
    let coordinator = ClaimCoordinator::new(gw.clone(), destination_id, vec![OWNER.into()], seen_ttl);
    Arc::new(Dispatcher::new(coordinator, Arc::new(runner(gw)), None))
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
