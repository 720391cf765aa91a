//! Ban store backed by an external key-value store.
//!
//! Each client identity maps to one hash at `fail2ban:addresses:<id>` with
//! the fields `isbanned`, `bannedpermanently`, `banimmune` and `failcount`.
//! Failure counting relies on the store's atomic field increment and expiry
//! on the store's per-key TTL, so several proxy instances can share bans and
//! bans survive restarts.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::protection::rules::BanPolicy;

use super::{BanStore, ClientRecord};

const KEY_PREFIX: &str = "fail2ban:addresses:";

const IS_BANNED: &str = "isbanned";
const BANNED_PERMANENTLY: &str = "bannedpermanently";
const BAN_IMMUNE: &str = "banimmune";
const FAIL_COUNT: &str = "failcount";

const DEFAULT_REDIS_PORT: u16 = 6379;

fn record_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

// ---------------------------------------------------------------------------
// KvStore – the primitives the shared store needs
// ---------------------------------------------------------------------------

/// Time-to-live applied to a key together with a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Set or refresh the time-to-live.
    After(Duration),
    /// Remove any time-to-live.
    Never,
}

/// Minimal hash-with-TTL key-value interface. Any store that can apply each
/// write and its expiry as one atomic step can back a [`SharedStore`].
#[async_trait]
pub trait KvStore: Send + Sync {
    /// All fields of the hash at `key`; empty when the key does not exist.
    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Selected fields of the hash at `key`, in the order asked for.
    async fn hget_fields(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>>;

    /// Add `delta` to an integer field and apply `expiry`, atomically.
    /// Returns the new value.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64, expiry: Expiry)
        -> StoreResult<i64>;

    /// Write `pairs` and apply `expiry`, atomically.
    async fn hset_many(&self, key: &str, pairs: &[(&str, &str)], expiry: Expiry)
        -> StoreResult<()>;

    /// Replace the whole hash with `pairs` and apply `expiry`, atomically.
    async fn hreplace(&self, key: &str, pairs: &[(&str, &str)], expiry: Expiry)
        -> StoreResult<()>;

    async fn del(&self, key: &str) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// RedisKv
// ---------------------------------------------------------------------------

/// [`KvStore`] over Redis. The connection is opened on first use and
/// re-established transparently by the connection manager.
pub struct RedisKv {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisKv {
    /// Prepare a client for `host` (`host:port`). No connection is made yet.
    pub fn new(host: &str, password: Option<&str>, db: i64) -> StoreResult<Self> {
        let client = redis::Client::open(connection_info(host, password, db)?)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(conn.clone())
    }
}

/// Connection parameters for `host`, given as `name`, `name:port`,
/// `ip:port` or `[v6]:port`. The port defaults to 6379.
fn connection_info(host: &str, password: Option<&str>, db: i64) -> StoreResult<ConnectionInfo> {
    let host = host.trim();
    let invalid = || StoreError::Backend(format!("invalid redis address: {host:?}"));

    let (name, port) = if let Ok(addr) = host.parse::<SocketAddr>() {
        (addr.ip().to_string(), addr.port())
    } else if let Ok(ip) = host.parse::<IpAddr>() {
        (ip.to_string(), DEFAULT_REDIS_PORT)
    } else if let Some((name, port)) = host.rsplit_once(':') {
        if name.is_empty() || name.contains(':') {
            return Err(invalid());
        }
        (name.to_string(), port.parse().map_err(|_| invalid())?)
    } else if host.is_empty() {
        return Err(invalid());
    } else {
        (host.to_string(), DEFAULT_REDIS_PORT)
    };

    Ok(ConnectionInfo {
        addr: ConnectionAddr::Tcp(name, port),
        redis: RedisConnectionInfo {
            db,
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
            ..Default::default()
        },
    })
}

/// Queue the command that applies `expiry` to `key`.
fn push_expiry(pipe: &mut redis::Pipeline, key: &str, expiry: Expiry) {
    match expiry {
        Expiry::After(ttl) => {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
            pipe.cmd("PEXPIRE").arg(key).arg(millis).ignore();
        }
        Expiry::Never => {
            pipe.cmd("PERSIST").arg(key).ignore();
        }
    }
}

fn push_hset(pipe: &mut redis::Pipeline, key: &str, pairs: &[(&str, &str)]) {
    pipe.cmd("HSET").arg(key);
    for (field, value) in pairs {
        pipe.arg(*field).arg(*value);
    }
    pipe.ignore();
}

#[async_trait]
impl KvStore for RedisKv {
    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(fields)
    }

    async fn hget_fields(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>> {
        let mut conn = self.connection().await?;
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn hincr_by(
        &self,
        key: &str,
        field: &str,
        delta: i64,
        expiry: Expiry,
    ) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("HINCRBY").arg(key).arg(field).arg(delta);
        push_expiry(&mut pipe, key, expiry);
        let (value,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(value)
    }

    async fn hset_many(
        &self,
        key: &str,
        pairs: &[(&str, &str)],
        expiry: Expiry,
    ) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        push_hset(&mut pipe, key, pairs);
        push_expiry(&mut pipe, key, expiry);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn hreplace(
        &self,
        key: &str,
        pairs: &[(&str, &str)],
        expiry: Expiry,
    ) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(key).ignore();
        push_hset(&mut pipe, key, pairs);
        push_expiry(&mut pipe, key, expiry);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SharedStore
// ---------------------------------------------------------------------------

/// Ban store whose state lives in a [`KvStore`].
///
/// Every operation is bounded by `timeout`; an expired deadline surfaces as
/// [`StoreError::Timeout`].
pub struct SharedStore<K> {
    kv: K,
    policy: BanPolicy,
    timeout: Duration,
}

impl<K: KvStore> SharedStore<K> {
    pub fn new(kv: K, policy: BanPolicy, timeout: Duration) -> Self {
        info!(
            max_retry = policy.max_retry,
            ban_time_secs = policy.ban_time.as_secs(),
            find_time_secs = policy.find_time.as_secs(),
            timeout_ms = timeout.as_millis() as u64,
            "Shared ban store initialized"
        );
        Self { kv, policy, timeout }
    }

    async fn bounded<T>(&self, op: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    async fn load(&self, key: &str) -> StoreResult<ClientRecord> {
        let fields = self.kv.hget_all(key).await?;
        Ok(ClientRecord {
            fail_count: match fields.get(FAIL_COUNT) {
                Some(v) => v.parse().map_err(|_| StoreError::Corrupt {
                    field: FAIL_COUNT,
                    value: v.clone(),
                })?,
                None => 0,
            },
            is_banned: decode_flag(IS_BANNED, fields.get(IS_BANNED))?,
            banned_permanently: decode_flag(BANNED_PERMANENTLY, fields.get(BANNED_PERMANENTLY))?,
            ban_immune: decode_flag(BAN_IMMUNE, fields.get(BAN_IMMUNE))?,
        })
    }

    async fn record_failure_inner(&self, id: &str) -> StoreResult<bool> {
        let key = record_key(id);
        let record = self.load(&key).await?;

        if record.banned_permanently {
            return Ok(false);
        }
        if record.ban_immune {
            return Ok(true);
        }

        // The counter never exists without a TTL. If the ban write below is
        // interrupted, the next failure applies it again.
        let fail_count = self
            .kv
            .hincr_by(&key, FAIL_COUNT, 1, Expiry::After(self.policy.find_time))
            .await?;

        if fail_count >= i64::from(self.policy.max_retry) {
            self.kv
                .hset_many(&key, &[(IS_BANNED, "1")], Expiry::After(self.policy.ban_time))
                .await?;
            if !record.is_banned {
                info!(
                    client_ip = %id,
                    fail_count,
                    ban_time_secs = self.policy.ban_time.as_secs(),
                    "Client banned"
                );
            }
            return Ok(false);
        }

        debug!(client_ip = %id, fail_count, "Failure recorded");
        Ok(true)
    }

    async fn is_not_banned_inner(&self, id: &str) -> StoreResult<bool> {
        let key = record_key(id);
        let values = self
            .kv
            .hget_fields(&key, &[IS_BANNED, BANNED_PERMANENTLY, BAN_IMMUNE])
            .await?;
        let field = |i: usize| values.get(i).and_then(Option::as_ref);

        let record = ClientRecord {
            fail_count: 0,
            is_banned: decode_flag(IS_BANNED, field(0))?,
            banned_permanently: decode_flag(BANNED_PERMANENTLY, field(1))?,
            ban_immune: decode_flag(BAN_IMMUNE, field(2))?,
        };
        Ok(!record.denies())
    }

    async fn ban_permanently_inner(&self, id: &str) -> StoreResult<()> {
        self.kv
            .hset_many(
                &record_key(id),
                &[(BANNED_PERMANENTLY, "1"), (IS_BANNED, "1"), (BAN_IMMUNE, "0")],
                Expiry::Never,
            )
            .await
    }

    async fn make_immune_inner(&self, id: &str) -> StoreResult<()> {
        self.kv
            .hreplace(&record_key(id), &[(BAN_IMMUNE, "1")], Expiry::Never)
            .await
    }
}

/// Decode a boolean hash field. Missing and empty fields read as `false`.
fn decode_flag(field: &'static str, value: Option<&String>) -> StoreResult<bool> {
    match value.map(|v| v.trim()) {
        None | Some("") | Some("0") | Some("false") => Ok(false),
        Some("1") | Some("true") => Ok(true),
        Some(other) => Err(StoreError::Corrupt {
            field,
            value: other.to_string(),
        }),
    }
}

#[async_trait]
impl<K: KvStore> BanStore for SharedStore<K> {
    async fn record_failure(&self, id: &str) -> StoreResult<bool> {
        self.bounded(self.record_failure_inner(id)).await
    }

    async fn is_not_banned(&self, id: &str) -> StoreResult<bool> {
        self.bounded(self.is_not_banned_inner(id)).await
    }

    async fn ban_permanently(&self, id: &str) -> StoreResult<()> {
        self.bounded(self.ban_permanently_inner(id)).await?;
        info!(client_ip = %id, "Client banned permanently");
        Ok(())
    }

    async fn make_immune(&self, id: &str) -> StoreResult<()> {
        self.bounded(self.make_immune_inner(id)).await?;
        info!(client_ip = %id, "Client made ban-immune");
        Ok(())
    }

    async fn forget(&self, id: &str) -> StoreResult<()> {
        self.bounded(self.kv.del(&record_key(id))).await
    }

    fn kind(&self) -> &'static str {
        "shared"
    }
}
