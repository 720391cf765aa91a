use std::sync::Arc;

use http::StatusCode;
use tracing::{debug, info, warn};

use crate::models::request::ClientIdentity;
use crate::storage::BanStore;

use super::rules::StatusCodes;

/// Counts backend responses with a configured status as client failures.
///
/// The response itself is never altered; the observer only feeds the ban
/// store so that clients provoking errors end up banned.
pub struct StatusObserver {
    codes: StatusCodes,
    store: Arc<dyn BanStore>,
}

impl StatusObserver {
    pub fn new(codes: StatusCodes, store: Arc<dyn BanStore>) -> Self {
        Self { codes, store }
    }

    pub fn matches(&self, status: StatusCode) -> bool {
        self.codes.contains(status.as_u16())
    }

    /// Record a failure for `client` when `status` is a counted one.
    pub async fn observe(&self, client: &ClientIdentity, status: StatusCode) {
        if !self.matches(status) {
            return;
        }

        match self.store.record_failure(&client.remote_ip).await {
            Ok(true) => {
                debug!(client_ip = %client, status = status.as_u16(), "Backend status counted as failure");
            }
            Ok(false) => {
                info!(client_ip = %client, status = status.as_u16(), "Client reached ban threshold on backend status");
            }
            Err(e) => {
                warn!(
                    client_ip = %client,
                    store = self.store.kind(),
                    error = %e,
                    "Failed to record status failure"
                );
            }
        }
    }
}
