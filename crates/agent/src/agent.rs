//! Wires the components together and owns their tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use relay_core::model::DestinationStatus;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::claim::ClaimCoordinator;
use crate::config::{AgentConfig, BackendConfig};
use crate::detect::Detector;
use crate::dispatch::Dispatcher;
use crate::gateway::{MemoryGateway, SharedGateway, SurrealGateway};
use crate::heartbeat::Heartbeater;
use crate::http;
use crate::runner::Runner;
use crate::schedule::ScheduleTrigger;

/// Open the configured backend.
pub async fn connect_gateway(config: &BackendConfig) -> Result<SharedGateway> {
    if config.endpoint == "memory" {
        warn!("using the in-memory backend; nothing is persisted or shared");
        return Ok(Arc::new(MemoryGateway::new()));
    }
    let gw = SurrealGateway::connect(config).await?;
    Ok(Arc::new(gw))
}

pub struct Agent {
    config: AgentConfig,
    destination_id: String,
    gateway: SharedGateway,
    dispatcher: Arc<Dispatcher>,
    detector: Arc<Detector>,
    heartbeat: Arc<Heartbeater>,
    schedule: Arc<ScheduleTrigger>,
}

impl Agent {
    pub fn new(mut config: AgentConfig, gateway: SharedGateway) -> Self {
        let destination_id = config.resolve_destination_id();

        let runner = Arc::new(Runner::new(
            gateway.clone(),
            config.execution.clone(),
            config.automation.clone(),
        ));
        let coordinator = ClaimCoordinator::new(
            gateway.clone(),
            destination_id.clone(),
            config.destination.owner_ids.clone(),
            config.detection.seen_ttl(),
        );
        let dispatcher = Arc::new(Dispatcher::new(coordinator, runner, config.execution.max_concurrent));
        let detector = Arc::new(Detector::new(
            gateway.clone(),
            dispatcher.clone(),
            destination_id.clone(),
            config.detection.clone(),
        ));
        let heartbeat = Arc::new(Heartbeater::new(
            gateway.clone(),
            dispatcher.clone(),
            destination_id.clone(),
            config.destination.name.clone(),
            config.destination.owner_ids.clone(),
            std::time::Duration::from_secs(config.heartbeat.interval_seconds),
        ));
        let schedule = Arc::new(ScheduleTrigger::new(gateway.clone(), config.schedule.clone()));

        Self {
            config,
            destination_id,
            gateway,
            dispatcher,
            detector,
            heartbeat,
            schedule,
        }
    }

    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Run until `shutdown` flips to true, then let in-flight items finish.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(destination_id = %self.destination_id, "agent starting");
        if self.config.destination.owner_ids.is_empty() {
            warn!("no owner_ids configured; every work item will be rejected");
        }

        // Bind first so a taken port fails the run before anything is claimed.
        let listener = match self.config.status_api.listen {
            Some(addr) => {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("binding status endpoint {addr}"))?;
                info!("status endpoint on http://{}", addr);
                Some(listener)
            }
            None => None,
        };

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        if let Some(listener) = listener {
            let app = http::router(
                self.destination_id.clone(),
                self.gateway.clone(),
                self.dispatcher.clone(),
                self.heartbeat.clone(),
            );
            let rx = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(stopped(rx))
                    .await;
                if let Err(e) = served {
                    warn!(error = %e, "status endpoint failed");
                }
            }));
        }
        {
            let d = self.detector.clone();
            let rx = shutdown.clone();
            tasks.push(tokio::spawn(async move { d.run_push(rx).await }));
        }
        {
            let d = self.detector.clone();
            let rx = shutdown.clone();
            tasks.push(tokio::spawn(async move { d.run_poll(rx).await }));
        }
        {
            let h = self.heartbeat.clone();
            let rx = shutdown.clone();
            tasks.push(tokio::spawn(async move { h.run(rx).await }));
        }
        {
            let s = self.schedule.clone();
            let rx = shutdown.clone();
            tasks.push(tokio::spawn(async move { s.run(rx).await }));
        }

        stopped(shutdown).await;
        info!("shutdown requested; waiting for background tasks");
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task aborted");
            }
        }

        let active = self.dispatcher.active_count();
        if active > 0 {
            info!(active, "waiting for in-flight work items");
        }
        self.dispatcher.wait_idle().await;
        self.heartbeat.set_status(DestinationStatus::Offline).await;
        info!(destination_id = %self.destination_id, "agent stopped");
        Ok(())
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
