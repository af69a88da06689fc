//! Detection channels: a push listener on the change feed and a poll loop.
//!
//! Both feed the dispatcher independently. Neither knows about the other.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use relay_core::model::WorkItem;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::DetectionConfig;
use crate::dispatch::Dispatcher;
use crate::gateway::{ItemFilter, SharedGateway};

/// Where a candidate item was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Push,
    Poll,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Push => "push",
            Self::Poll => "poll",
        })
    }
}

pub struct Detector {
    gateway: SharedGateway,
    dispatcher: Arc<Dispatcher>,
    destination_id: String,
    config: DetectionConfig,
}

impl Detector {
    pub fn new(
        gateway: SharedGateway,
        dispatcher: Arc<Dispatcher>,
        destination_id: impl Into<String>,
        config: DetectionConfig,
    ) -> Self {
        Self {
            gateway,
            dispatcher,
            destination_id: destination_id.into(),
            config,
        }
    }

    /// One re-scan: assigned-to-me first, then the unowned backlog.
    /// Returns how many candidates were offered.
    pub async fn poll_once(&self) -> usize {
        let filters = [
            ItemFilter::AssignedUnclaimed {
                destination_id: self.destination_id.clone(),
            },
            ItemFilter::UnassignedPending,
        ];
        let mut offered = 0;
        for filter in &filters {
            match self.gateway.query_items(filter, self.config.poll_limit).await {
                Ok(items) => {
                    for item in items {
                        self.offer(item, Channel::Poll).await;
                        offered += 1;
                    }
                }
                Err(e) => warn!(error = %e, ?filter, "poll query failed"),
            }
        }
        offered
    }

    /// Poll for the agent's lifetime. The first tick fires immediately.
    pub async fn run_poll(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            let offered = self.poll_once().await;
            debug!(offered, "poll pass done");
        }
        debug!("poll loop stopped");
    }

    /// Follow the change feed, resubscribing with backoff whenever it drops.
    pub async fn run_push(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.push_enabled {
            info!("push channel disabled");
            return;
        }
        let filter = ItemFilter::Candidates {
            destination_id: self.destination_id.clone(),
        };
        let max = Duration::from_millis(self.config.backoff_max_ms);
        let mut backoff = Backoff::new(Duration::from_millis(self.config.backoff_initial_ms), max);

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.gateway.subscribe(&filter).await {
                Ok(mut feed) => {
                    info!("change feed subscribed");
                    let since = Instant::now();
                    loop {
                        tokio::select! {
                            next = feed.next() => match next {
                                Some(Ok(event)) => {
                                    backoff.reset();
                                    self.offer(event.item, Channel::Push).await;
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "change feed error");
                                    break;
                                }
                                None => {
                                    warn!("change feed ended");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => return,
                        }
                    }
                    if since.elapsed() >= max {
                        backoff.reset();
                    }
                }
                Err(e) => warn!(error = %e, "change feed subscribe failed"),
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "resubscribing after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("push listener stopped");
    }

    async fn offer(&self, item: WorkItem, channel: Channel) {
        let item_id = item.id.clone();
        if let Err(e) = self.dispatcher.offer(item, channel).await {
            warn!(%item_id, %channel, error = %e, "claim attempt failed");
        }
    }
}
