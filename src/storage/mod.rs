//! Ban state storage.
//!
//! Every backend implements [`BanStore`]: the failure-counting state
//! machine keyed by client identity. [`memory::MemoryStore`] keeps records
//! in-process, [`shared::SharedStore`] keeps them in an external key-value
//! store so bans survive restarts and are shared between proxy instances,
//! and [`NoopStore`] answers with fixed values.

pub mod blocklist;
pub mod memory;
pub mod shared;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::settings::BackendConfig;
use crate::error::StoreResult;
use crate::protection::rules::BanPolicy;

use self::memory::MemoryStore;
use self::shared::{RedisKv, SharedStore};

/// Per-identity ban state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientRecord {
    /// Failures recorded in the current window.
    pub fail_count: u64,
    /// Set once `fail_count` reached the threshold.
    pub is_banned: bool,
    /// Never cleared; implies a deny decision.
    pub banned_permanently: bool,
    /// Never counted or banned.
    pub ban_immune: bool,
}

impl ClientRecord {
    /// Whether a request from this client must be rejected.
    pub fn denies(&self) -> bool {
        !self.ban_immune && (self.is_banned || self.banned_permanently)
    }
}

#[async_trait]
pub trait BanStore: Send + Sync {
    /// Record one failure for `id`.
    ///
    /// Returns `false` once the ban threshold is reached (and for
    /// permanently banned clients), `true` otherwise.
    async fn record_failure(&self, id: &str) -> StoreResult<bool>;

    /// Non-mutating probe: `true` unless `id` is currently banned.
    async fn is_not_banned(&self, id: &str) -> StoreResult<bool>;

    /// Ban `id` for good. The record no longer expires.
    async fn ban_permanently(&self, id: &str) -> StoreResult<()>;

    /// Exempt `id` from counting and banning. The record no longer expires.
    async fn make_immune(&self, id: &str) -> StoreResult<()>;

    /// Drop whatever is known about `id`.
    async fn forget(&self, id: &str) -> StoreResult<()>;

    /// Short backend name for logs.
    fn kind(&self) -> &'static str;
}

/// Store that never bans anybody.
///
/// Used when ban tracking is disabled (`maxretry` absent or zero) and as a
/// test double.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

#[async_trait]
impl BanStore for NoopStore {
    async fn record_failure(&self, _id: &str) -> StoreResult<bool> {
        Ok(true)
    }

    async fn is_not_banned(&self, _id: &str) -> StoreResult<bool> {
        Ok(true)
    }

    async fn ban_permanently(&self, _id: &str) -> StoreResult<()> {
        Ok(())
    }

    async fn make_immune(&self, _id: &str) -> StoreResult<()> {
        Ok(())
    }

    async fn forget(&self, _id: &str) -> StoreResult<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "noop"
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// The ban store chosen for this process.
pub struct Backend {
    pub store: Arc<dyn BanStore>,
    /// Set for the in-process store, which needs a periodic sweep.
    pub memory: Option<Arc<MemoryStore>>,
}

/// Build the store named by `config.kind`.
///
/// Without a policy ban tracking is off and a [`NoopStore`] is returned
/// whatever the configured type. Unknown types fall back to the
/// in-process store.
pub fn open(config: &BackendConfig, policy: Option<BanPolicy>) -> StoreResult<Backend> {
    let Some(policy) = policy else {
        info!("Ban tracking disabled (maxretry not set)");
        return Ok(Backend {
            store: Arc::new(NoopStore),
            memory: None,
        });
    };

    match config.kind.trim().to_ascii_lowercase().as_str() {
        "redis" => {
            let redis = &config.redis;
            let kv = RedisKv::new(&redis.host, redis.password.as_deref(), redis.db)?;
            info!(host = %redis.host, db = redis.db, "Using redis ban store");
            let timeout = Duration::from_millis(config.timeout_ms);
            Ok(Backend {
                store: Arc::new(SharedStore::new(kv, policy, timeout)),
                memory: None,
            })
        }
        kind => {
            if kind != "memory" {
                warn!(backend = %config.kind, "Unknown backend type, falling back to memory");
            }
            let memory = Arc::new(MemoryStore::new(policy));
            Ok(Backend {
                store: memory.clone(),
                memory: Some(memory),
            })
        }
    }
}
