//! Wire types shared by the agent and its callers.

use serde::{Deserialize, Serialize};

use crate::model::DestinationStatus;

/// Local status endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Destination this agent runs as.
    pub destination_id: String,
    /// Last status the heartbeater reported.
    pub status: DestinationStatus,
    /// Ids of work items currently executing on this destination.
    pub active: Vec<String>,
}

/// Change-feed event kinds, as delivered by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Row inserted.
    Created,
    /// Row modified in place.
    Updated,
    /// Row removed.
    Deleted,
}
