//! The standard chain stages: static IP lists, URL patterns and the ban
//! check.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::StageError;
use crate::models::request::{ClientIdentity, RequestView};
use crate::models::threat::Decision;
use crate::storage::blocklist::IpList;
use crate::storage::BanStore;

use super::chain::Stage;
use super::url_filter::UrlList;

// ---------------------------------------------------------------------------
// IP lists
// ---------------------------------------------------------------------------

/// Rejects listed clients. No failure is counted.
pub struct DenyIpStage {
    list: IpList,
}

impl DenyIpStage {
    pub fn new(list: IpList) -> Self {
        Self { list }
    }
}

#[async_trait]
impl Stage for DenyIpStage {
    fn name(&self) -> &'static str {
        "deny-ip"
    }

    async fn evaluate(
        &self,
        _req: &RequestView<'_>,
        client: &ClientIdentity,
    ) -> Result<Decision, StageError> {
        if self.list.contains(&client.remote_ip) {
            info!(client_ip = %client, "Blocked by IP denylist");
            return Ok(Decision::Reject);
        }
        Ok(Decision::Continue)
    }
}

/// Lets listed clients through without consulting later stages.
pub struct AllowIpStage {
    list: IpList,
}

impl AllowIpStage {
    pub fn new(list: IpList) -> Self {
        Self { list }
    }
}

#[async_trait]
impl Stage for AllowIpStage {
    fn name(&self) -> &'static str {
        "allow-ip"
    }

    async fn evaluate(
        &self,
        _req: &RequestView<'_>,
        client: &ClientIdentity,
    ) -> Result<Decision, StageError> {
        if self.list.contains(&client.remote_ip) {
            debug!(client_ip = %client, "Allowlisted IP - bypassing ban check");
            return Ok(Decision::Pass);
        }
        Ok(Decision::Continue)
    }
}

// ---------------------------------------------------------------------------
// URL patterns
// ---------------------------------------------------------------------------

/// Rejects requests for forbidden URLs and counts a failure against the
/// client, so repeated probing ends in a ban.
pub struct DenyUrlStage {
    list: UrlList,
    store: Arc<dyn BanStore>,
}

impl DenyUrlStage {
    pub fn new(list: UrlList, store: Arc<dyn BanStore>) -> Self {
        Self { list, store }
    }
}

#[async_trait]
impl Stage for DenyUrlStage {
    fn name(&self) -> &'static str {
        "deny-url"
    }

    async fn evaluate(
        &self,
        req: &RequestView<'_>,
        client: &ClientIdentity,
    ) -> Result<Decision, StageError> {
        let Some(pattern) = self.list.find(req.url) else {
            return Ok(Decision::Continue);
        };

        match self.store.record_failure(&client.remote_ip).await {
            Ok(_) => {}
            Err(e) => warn!(
                client_ip = %client,
                store = self.store.kind(),
                error = %e,
                "Failed to record URL failure"
            ),
        }

        info!(client_ip = %client, url = %req.url, pattern = %pattern, "Blocked by URL rule");
        Ok(Decision::Reject)
    }
}

/// Lets requests for listed URLs through without a ban check.
pub struct AllowUrlStage {
    list: UrlList,
}

impl AllowUrlStage {
    pub fn new(list: UrlList) -> Self {
        Self { list }
    }
}

#[async_trait]
impl Stage for AllowUrlStage {
    fn name(&self) -> &'static str {
        "allow-url"
    }

    async fn evaluate(
        &self,
        req: &RequestView<'_>,
        client: &ClientIdentity,
    ) -> Result<Decision, StageError> {
        if let Some(pattern) = self.list.find(req.url) {
            debug!(client_ip = %client, url = %req.url, pattern = %pattern, "Allowed by URL rule");
            return Ok(Decision::Pass);
        }
        Ok(Decision::Continue)
    }
}

// ---------------------------------------------------------------------------
// Ban check
// ---------------------------------------------------------------------------

/// Rejects currently banned clients. Never counts a failure.
pub struct BanCheckStage {
    store: Arc<dyn BanStore>,
}

impl BanCheckStage {
    pub fn new(store: Arc<dyn BanStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for BanCheckStage {
    fn name(&self) -> &'static str {
        "ban-check"
    }

    async fn evaluate(
        &self,
        _req: &RequestView<'_>,
        client: &ClientIdentity,
    ) -> Result<Decision, StageError> {
        if self.store.is_not_banned(&client.remote_ip).await? {
            return Ok(Decision::Continue);
        }
        debug!(client_ip = %client, store = self.store.kind(), "Blocked by active ban");
        Ok(Decision::Reject)
    }
}
