use relay_core::model::{ExecutionStatus, StatusPatch};
use tracing::{debug, warn};

use crate::gateway::SharedGateway;

/// Writes status transitions back to the work item row.
///
/// A failed write is a visibility problem only: it is logged and dropped.
/// The backend rejects transitions outside the status table, so a late or
/// repeated report cannot reopen a finished item.
#[derive(Clone)]
pub struct StatusReporter {
    gateway: SharedGateway,
}

impl StatusReporter {
    pub fn new(gateway: SharedGateway) -> Self {
        Self { gateway }
    }

    /// Returns whether the write landed.
    pub async fn report(&self, item_id: &str, status: ExecutionStatus, patch: StatusPatch) -> bool {
        match self.gateway.update_item(item_id, status, &patch).await {
            Ok(()) => {
                debug!(%item_id, status = status.as_str(), "status reported");
                true
            }
            Err(e) => {
                warn!(%item_id, status = status.as_str(), error = %e, "status report failed");
                false
            }
        }
    }
}
