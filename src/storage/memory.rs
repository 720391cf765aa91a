use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::StoreResult;
use crate::protection::rules::BanPolicy;

use super::{BanStore, ClientRecord};

#[derive(Debug, Clone)]
struct Entry {
    record: ClientRecord,
    /// `None` for permanent and immune records.
    expires_at: Option<Instant>,
}

impl Entry {
    fn fresh() -> Self {
        Self {
            record: ClientRecord::default(),
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process ban store. State is lost on restart.
///
/// Each read-modify-write happens under the map's entry guard, which locks
/// only the shard holding that identity. Expired records are dropped lazily
/// on access and in bulk by [`MemoryStore::cleanup`].
pub struct MemoryStore {
    records: DashMap<String, Entry>,
    policy: BanPolicy,
}

impl MemoryStore {
    pub fn new(policy: BanPolicy) -> Self {
        info!(
            max_retry = policy.max_retry,
            ban_time_secs = policy.ban_time.as_secs(),
            find_time_secs = policy.find_time.as_secs(),
            "In-memory ban store initialized"
        );
        Self {
            records: DashMap::with_capacity(1_024),
            policy,
        }
    }

    /// Current record for `id`, if one exists and has not expired.
    pub fn snapshot(&self, id: &str) -> Option<ClientRecord> {
        let now = Instant::now();
        self.records
            .get(id)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.record)
    }

    /// Number of records held, expired ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Evict expired records. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|id, entry| {
            let expired = entry.is_expired(now);
            if expired && entry.record.is_banned {
                debug!(client_ip = %id, "Ban expired");
            }
            !expired
        });
        before.saturating_sub(self.records.len())
    }
}

#[async_trait]
impl BanStore for MemoryStore {
    async fn record_failure(&self, id: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entry = self.records.entry(id.to_string()).or_insert_with(Entry::fresh);

        if entry.is_expired(now) {
            *entry = Entry::fresh();
        }

        if entry.record.banned_permanently {
            return Ok(false);
        }
        if entry.record.ban_immune {
            return Ok(true);
        }

        entry.record.fail_count += 1;

        if entry.record.fail_count >= u64::from(self.policy.max_retry) {
            let newly_banned = !entry.record.is_banned;
            entry.record.is_banned = true;
            entry.expires_at = Some(now + self.policy.ban_time);
            let fail_count = entry.record.fail_count;
            drop(entry);

            if newly_banned {
                info!(
                    client_ip = %id,
                    fail_count,
                    ban_time_secs = self.policy.ban_time.as_secs(),
                    "Client banned"
                );
            }
            return Ok(false);
        }

        entry.expires_at = Some(now + self.policy.find_time);
        debug!(client_ip = %id, fail_count = entry.record.fail_count, "Failure recorded");
        Ok(true)
    }

    async fn is_not_banned(&self, id: &str) -> StoreResult<bool> {
        let now = Instant::now();

        match self.records.get(id) {
            None => return Ok(true),
            Some(entry) if !entry.is_expired(now) => return Ok(!entry.record.denies()),
            Some(_) => {}
        }

        // Expired: discard so the client starts fresh.
        self.records.remove_if(id, |_, entry| entry.is_expired(now));
        Ok(true)
    }

    async fn ban_permanently(&self, id: &str) -> StoreResult<()> {
        let mut entry = self.records.entry(id.to_string()).or_insert_with(Entry::fresh);
        entry.record.banned_permanently = true;
        entry.record.is_banned = true;
        entry.record.ban_immune = false;
        entry.expires_at = None;
        drop(entry);

        info!(client_ip = %id, "Client banned permanently");
        Ok(())
    }

    async fn make_immune(&self, id: &str) -> StoreResult<()> {
        let mut entry = self.records.entry(id.to_string()).or_insert_with(Entry::fresh);
        entry.record = ClientRecord {
            ban_immune: true,
            ..ClientRecord::default()
        };
        entry.expires_at = None;
        drop(entry);

        info!(client_ip = %id, "Client made ban-immune");
        Ok(())
    }

    async fn forget(&self, id: &str) -> StoreResult<()> {
        if self.records.remove(id).is_some() {
            info!(client_ip = %id, "Client record removed");
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn policy(max_retry: u32) -> BanPolicy {
        BanPolicy {
            max_retry,
            ban_time: Duration::from_secs(300),
            find_time: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn test_banned_after_exactly_max_retry() {
        let store = MemoryStore::new(policy(3));

        assert!(store.record_failure("192.0.2.1").await.unwrap());
        assert!(store.record_failure("192.0.2.1").await.unwrap());
        assert!(store.is_not_banned("192.0.2.1").await.unwrap());

        assert!(!store.record_failure("192.0.2.1").await.unwrap());
        assert!(!store.is_not_banned("192.0.2.1").await.unwrap());
        assert!(store.is_not_banned("192.0.2.2").await.unwrap());
    }

    #[tokio::test]
    async fn test_check_does_not_mutate() {
        let store = MemoryStore::new(policy(3));
        store.record_failure("192.0.2.1").await.unwrap();
        for _ in 0..10 {
            assert!(store.is_not_banned("192.0.2.1").await.unwrap());
        }
        assert_eq!(store.snapshot("192.0.2.1").unwrap().fail_count, 1);
    }

    #[tokio::test]
    async fn test_immune_never_banned() {
        let store = MemoryStore::new(policy(2));
        store.make_immune("192.0.2.1").await.unwrap();

        for _ in 0..20 {
            assert!(store.record_failure("192.0.2.1").await.unwrap());
        }
        assert!(store.is_not_banned("192.0.2.1").await.unwrap());
        assert_eq!(store.snapshot("192.0.2.1").unwrap().fail_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_ban_outlives_windows() {
        let store = MemoryStore::new(policy(3));
        store.ban_permanently("192.0.2.1").await.unwrap();

        assert!(!store.record_failure("192.0.2.1").await.unwrap());
        tokio::time::advance(Duration::from_secs(3_600)).await;
        assert_eq!(store.cleanup(), 0);
        assert!(!store.is_not_banned("192.0.2.1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_reset_after_findtime() {
        let store = MemoryStore::new(policy(3));
        store.record_failure("192.0.2.1").await.unwrap();
        store.record_failure("192.0.2.1").await.unwrap();

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(store.snapshot("192.0.2.1").is_none());

        assert!(store.record_failure("192.0.2.1").await.unwrap());
        assert!(store.record_failure("192.0.2.1").await.unwrap());
        assert!(store.is_not_banned("192.0.2.1").await.unwrap());
        assert_eq!(store.snapshot("192.0.2.1").unwrap().fail_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_refreshes_findtime() {
        let store = MemoryStore::new(policy(3));
        store.record_failure("192.0.2.1").await.unwrap();
        tokio::time::advance(Duration::from_secs(100)).await;
        store.record_failure("192.0.2.1").await.unwrap();
        tokio::time::advance(Duration::from_secs(100)).await;

        assert!(!store.record_failure("192.0.2.1").await.unwrap());
        assert!(!store.is_not_banned("192.0.2.1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_lasts_bantime_then_clears() {
        let store = MemoryStore::new(policy(3));
        for _ in 0..3 {
            store.record_failure("192.0.2.1").await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!store.is_not_banned("192.0.2.1").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.is_not_banned("192.0.2.1").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_evicts_expired() {
        let store = MemoryStore::new(policy(3));
        store.record_failure("192.0.2.1").await.unwrap();
        store.record_failure("192.0.2.2").await.unwrap();
        store.make_immune("192.0.2.3").await.unwrap();

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(store.cleanup(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_forget_clears_ban() {
        let store = MemoryStore::new(policy(1));
        store.record_failure("192.0.2.1").await.unwrap();
        assert!(!store.is_not_banned("192.0.2.1").await.unwrap());

        store.forget("192.0.2.1").await.unwrap();
        assert!(store.is_not_banned("192.0.2.1").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_failures_not_lost() {
        let store = Arc::new(MemoryStore::new(policy(10_000)));

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.record_failure("192.0.2.1").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.snapshot("192.0.2.1").unwrap().fail_count, 200);
    }
}
