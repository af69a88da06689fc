use std::sync::Arc;
use std::time::Duration;

use relay_core::model::{Destination, DestinationStatus, Heartbeat};
use relay_core::{new_ulid, now_ms};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::gateway::SharedGateway;

/// Destination row lifecycle plus periodic liveness rows.
pub struct Heartbeater {
    gateway: SharedGateway,
    dispatcher: Arc<Dispatcher>,
    destination_id: String,
    name: String,
    owner_ids: Vec<String>,
    every: Duration,
}

impl Heartbeater {
    pub fn new(
        gateway: SharedGateway,
        dispatcher: Arc<Dispatcher>,
        destination_id: impl Into<String>,
        name: impl Into<String>,
        owner_ids: Vec<String>,
        every: Duration,
    ) -> Self {
        Self {
            gateway,
            dispatcher,
            destination_id: destination_id.into(),
            name: name.into(),
            owner_ids,
            every: every.max(Duration::from_secs(1)),
        }
    }

    /// Current status: busy while anything is executing.
    pub fn status(&self) -> DestinationStatus {
        if self.dispatcher.active_count() > 0 {
            DestinationStatus::Busy
        } else {
            DestinationStatus::Online
        }
    }

    pub async fn set_status(&self, status: DestinationStatus) {
        let row = Destination {
            id: self.destination_id.clone(),
            name: self.name.clone(),
            owner_ids: self.owner_ids.clone(),
            status,
            updated_at: now_ms(),
        };
        if let Err(e) = self.gateway.upsert_destination(&row).await {
            warn!(destination_id = %self.destination_id, error = %e, "destination update failed");
        }
    }

    pub async fn beat(&self) {
        let status = self.status();
        let row = Heartbeat {
            id: new_ulid().to_string(),
            destination_id: self.destination_id.clone(),
            status,
            active_executions: self.dispatcher.active_count(),
            at: now_ms(),
        };
        if let Err(e) = self.gateway.insert_heartbeat(&row).await {
            warn!(destination_id = %self.destination_id, error = %e, "heartbeat failed");
            return;
        }
        self.set_status(status).await;
    }

    /// Online on start, then a heartbeat per interval until shutdown.
    /// Going offline is left to the caller, after in-flight runs drain.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.set_status(DestinationStatus::Online).await;
        info!(destination_id = %self.destination_id, "destination online");

        let mut tick = interval(self.every);
        loop {
            tokio::select! {
                _ = tick.tick() => self.beat().await,
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }
}
