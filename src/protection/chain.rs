use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use tracing::{debug, warn};

use crate::error::{ResolveError, StageError};
use crate::models::request::{ClientIdentity, RequestView};
use crate::models::threat::{Decision, Outcome};
use crate::storage::blocklist::IpList;
use crate::storage::{BanStore, NoopStore};

use super::resolver::TrustedProxies;
use super::rules::RuleSet;
use super::stages::{AllowIpStage, AllowUrlStage, BanCheckStage, DenyIpStage, DenyUrlStage};
use super::url_filter::UrlList;

/// One step of the evaluation chain.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn evaluate(
        &self,
        req: &RequestView<'_>,
        client: &ClientIdentity,
    ) -> Result<Decision, StageError>;
}

/// Result of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    pub identity: ClientIdentity,
}

/// Ordered evaluation pipeline run for every inbound request.
///
/// The client identity is resolved once, then handed to each stage in turn
/// until one rejects or passes. A stage that fails is skipped so that a
/// broken backend never blocks traffic.
pub struct Chain {
    proxies: TrustedProxies,
    stages: Vec<Box<dyn Stage>>,
    status_override: bool,
}

impl Chain {
    /// Chain with an explicit stage list.
    pub fn new(proxies: TrustedProxies, stages: Vec<Box<dyn Stage>>, status_override: bool) -> Self {
        Self {
            proxies,
            stages,
            status_override,
        }
    }

    pub fn builder() -> ChainBuilder {
        ChainBuilder::default()
    }

    /// Names of the configured stages, in evaluation order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn evaluate(
        &self,
        conn_addr: &str,
        headers: &HeaderMap,
        url: &str,
    ) -> Result<Verdict, ResolveError> {
        let identity = self.proxies.resolve(conn_addr, headers)?;
        let req = RequestView::new(url);

        for stage in &self.stages {
            match stage.evaluate(&req, &identity).await {
                Ok(Decision::Continue) => {}
                Ok(Decision::Reject) => {
                    return Ok(Verdict {
                        outcome: Outcome::Reject,
                        identity,
                    });
                }
                Ok(Decision::Pass) => {
                    debug!(client_ip = %identity, stage = stage.name(), "Remaining stages skipped");
                    break;
                }
                Err(e) => {
                    warn!(
                        client_ip = %identity,
                        stage = stage.name(),
                        error = %e,
                        "Stage failed, letting request through"
                    );
                }
            }
        }

        let outcome = if self.status_override {
            Outcome::PassToOverride
        } else {
            Outcome::Pass
        };
        Ok(Verdict { outcome, identity })
    }
}

// ---------------------------------------------------------------------------
// ChainBuilder
// ---------------------------------------------------------------------------

/// Assembles the standard stage order:
/// deny-IP, allow-IP, deny-URL, allow-URL, ban-check.
///
/// Stages whose list is empty are left out. The ban check is always
/// present; without a store it never bans.
#[derive(Default)]
pub struct ChainBuilder {
    proxies: TrustedProxies,
    deny_ips: IpList,
    allow_ips: IpList,
    deny_urls: UrlList,
    allow_urls: UrlList,
    store: Option<Arc<dyn BanStore>>,
    status_override: bool,
}

impl ChainBuilder {
    pub fn trusted_proxies(mut self, proxies: TrustedProxies) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn deny_ips(mut self, list: IpList) -> Self {
        self.deny_ips = list;
        self
    }

    pub fn allow_ips(mut self, list: IpList) -> Self {
        self.allow_ips = list;
        self
    }

    pub fn deny_urls(mut self, list: UrlList) -> Self {
        self.deny_urls = list;
        self
    }

    pub fn allow_urls(mut self, list: UrlList) -> Self {
        self.allow_urls = list;
        self
    }

    /// Take URL lists and the status override switch from compiled rules.
    pub fn rules(self, rules: &RuleSet) -> Self {
        self.deny_urls(rules.deny_urls.clone())
            .allow_urls(rules.allow_urls.clone())
            .status_override(rules.status_codes.is_some())
    }

    pub fn store(mut self, store: Arc<dyn BanStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Hand passing requests to the status observer instead of straight
    /// to the backend.
    pub fn status_override(mut self, enabled: bool) -> Self {
        self.status_override = enabled;
        self
    }

    pub fn build(self) -> Chain {
        let store = self.store.unwrap_or_else(|| Arc::new(NoopStore));
        let mut stages: Vec<Box<dyn Stage>> = Vec::with_capacity(5);

        if !self.deny_ips.is_empty() {
            stages.push(Box::new(DenyIpStage::new(self.deny_ips)));
        }
        if !self.allow_ips.is_empty() {
            stages.push(Box::new(AllowIpStage::new(self.allow_ips)));
        }
        if !self.deny_urls.is_empty() {
            stages.push(Box::new(DenyUrlStage::new(self.deny_urls, store.clone())));
        }
        if !self.allow_urls.is_empty() {
            stages.push(Box::new(AllowUrlStage::new(self.allow_urls)));
        }
        stages.push(Box::new(BanCheckStage::new(store)));

        Chain::new(self.proxies, stages, self.status_override)
    }
}
