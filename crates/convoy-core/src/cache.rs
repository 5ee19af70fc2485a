//! State cache.
//!
//! A read-through projection of registry state. Entries are JSON documents
//! with a short TTL, invalidated by every mutation of their journey. The
//! cache is never the only copy of anything: on a miss, or when the backend
//! is down, reads go straight to the [`SessionRegistry`].
//!
//! Each journey carries an invalidation generation. A rebuild that overlaps
//! an invalidation of its journey is returned to its caller but never left
//! in the backend.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::model::{JourneyId, MemberSnapshot, MemberState};
use crate::registry::SessionRegistry;

/// Default TTL of a full journey snapshot.
pub const DEFAULT_JOURNEY_TTL: Duration = Duration::from_secs(30);

/// Default TTL of a single member's state.
pub const DEFAULT_MEMBER_TTL: Duration = Duration::from_secs(10);

/// Cache backend errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend could not be reached.
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    /// A cached document could not be encoded or decoded.
    #[error("Cache entry is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Key/value storage with per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
}

/// In-process [`CacheBackend`] with lazy expiry.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: DashMap<String, Entry>,
}

impl MemoryCacheBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Key of a journey's full snapshot.
#[must_use]
pub fn snapshot_key(journey_id: JourneyId) -> String {
    format!("journey:{journey_id}:snapshot")
}

/// Key of one member's state within a journey.
#[must_use]
pub fn member_key(journey_id: JourneyId, user_id: &str) -> String {
    format!("journey:{journey_id}:member:{user_id}")
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL of full journey snapshots.
    pub journey_ttl: Duration,
    /// TTL of single member reads.
    pub member_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            journey_ttl: DEFAULT_JOURNEY_TTL,
            member_ttl: DEFAULT_MEMBER_TTL,
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Backend errors absorbed by falling back to the registry.
    pub failures: u64,
}

/// Read-through cache in front of the registry.
pub struct StateCache {
    backend: Arc<dyn CacheBackend>,
    registry: Arc<SessionRegistry>,
    config: CacheConfig,
    /// Bumped by every invalidation of a journey, before the delete.
    generations: DashMap<JourneyId, u64>,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
}

impl StateCache {
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, registry: Arc<SessionRegistry>) -> Self {
        Self::with_config(backend, registry, CacheConfig::default())
    }

    #[must_use]
    pub fn with_config(
        backend: Arc<dyn CacheBackend>,
        registry: Arc<SessionRegistry>,
        config: CacheConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            config,
            generations: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Full snapshot of a journey.
    ///
    /// # Errors
    ///
    /// Only registry errors; backend failures fall back silently.
    pub async fn snapshot(&self, journey_id: JourneyId) -> Result<MemberSnapshot> {
        let key = snapshot_key(journey_id);
        let generation = self.generation(journey_id);
        if let Some(snapshot) = self.lookup::<MemberSnapshot>(&key).await {
            return Ok(snapshot);
        }

        let snapshot = self.registry.build_snapshot(journey_id).await?;
        self.store_if_current(journey_id, generation, &key, &snapshot, self.config.journey_ttl)
            .await;
        Ok(snapshot)
    }

    /// One member's current state, `None` if they never started an instance.
    ///
    /// # Errors
    ///
    /// Only registry errors; backend failures fall back silently.
    pub async fn member(
        &self,
        journey_id: JourneyId,
        user_id: &str,
    ) -> Result<Option<MemberState>> {
        let key = member_key(journey_id, user_id);
        let generation = self.generation(journey_id);
        if let Some(state) = self.lookup::<MemberState>(&key).await {
            return Ok(Some(state));
        }

        let state = self.registry.build_member_state(journey_id, user_id).await?;
        if let Some(state) = &state {
            self.store_if_current(journey_id, generation, &key, state, self.config.member_ttl)
                .await;
        }
        Ok(state)
    }

    /// Drop the journey's snapshot entry.
    pub async fn invalidate_journey(&self, journey_id: JourneyId) {
        self.bump_generation(journey_id);
        self.evict(&snapshot_key(journey_id)).await;
    }

    /// Drop the entries affected by a mutation of one member's instance.
    pub async fn invalidate_member(&self, journey_id: JourneyId, user_id: &str) {
        self.bump_generation(journey_id);
        self.evict(&member_key(journey_id, user_id)).await;
        self.evict(&snapshot_key(journey_id)).await;
    }

    fn generation(&self, journey_id: JourneyId) -> u64 {
        self.generations.get(&journey_id).map_or(0, |g| *g)
    }

    fn bump_generation(&self, journey_id: JourneyId) {
        *self.generations.entry(journey_id).or_default() += 1;
    }

    /// Store a rebuilt entry unless its journey was invalidated since
    /// `generation` was read.
    ///
    /// An invalidation can also land between the check and the write, after
    /// its own delete already ran, so the generation is checked again once
    /// the entry is written.
    async fn store_if_current<T: Serialize>(
        &self,
        journey_id: JourneyId,
        generation: u64,
        key: &str,
        value: &T,
        ttl: Duration,
    ) {
        if self.generation(journey_id) != generation {
            debug!(key = %key, "Skipping cache write of a superseded rebuild");
            return;
        }
        self.store(key, value, ttl).await;
        if self.generation(journey_id) != generation {
            debug!(key = %key, "Rebuild raced an invalidation, evicting");
            self.evict(key).await;
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_slice(&raw) {
                Ok(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    trace!(key = %key, "Cache hit");
                    Some(value)
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "Discarding malformed cache entry");
                    self.evict(key).await;
                    None
                }
            },
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "Cache miss");
                None
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Cache read failed, falling back to registry");
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_vec(value) {
            Ok(raw) => Bytes::from(raw),
            Err(e) => {
                warn!(key = %key, error = %e, "Could not encode cache entry");
                return;
            }
        };
        if let Err(e) = self.backend.set(key, raw, ttl).await {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, error = %e, "Cache write failed");
        }
    }

    async fn evict(&self, key: &str) {
        match self.backend.delete(key).await {
            Ok(()) => debug!(key = %key, "Cache entry invalidated"),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Cache invalidation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryError, MembershipDirectory, MemoryDirectory};
    use crate::model::{Coordinates, LocationReport, MemberIdentity, MemberRole};
    use crate::registry::NewJourney;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    struct DownBackend;

    #[async_trait]
    impl CacheBackend for DownBackend {
        async fn get(&self, _: &str) -> Result<Option<Bytes>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn set(&self, _: &str, _: Bytes, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    fn registry() -> Arc<SessionRegistry> {
        let directory = MemoryDirectory::new();
        directory.add_member("riders", "owner", MemberRole::Owner);
        directory.add_member("riders", "alice", MemberRole::Member);
        Arc::new(SessionRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::new(directory),
        ))
    }

    async fn journey(registry: &SessionRegistry) -> JourneyId {
        registry
            .start_group_journey(
                "owner",
                NewJourney {
                    group_id: "riders".into(),
                    title: "Loop".into(),
                    description: None,
                    destination: Coordinates::new(45.1, 7.1),
                },
            )
            .await
            .unwrap()
            .id
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_backend_expiry() {
        let backend = MemoryCacheBackend::new();
        backend
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(backend.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(backend.get("k").await.unwrap().is_none());
        assert!(backend.is_empty());

        backend
            .set("a", Bytes::from_static(b"1"), Duration::from_secs(1))
            .await
            .unwrap();
        backend
            .set("b", Bytes::from_static(b"2"), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backend.purge_expired(), 1);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_read_through_then_hit() {
        let registry = registry();
        let cache = StateCache::new(Arc::new(MemoryCacheBackend::new()), registry.clone());
        let journey_id = journey(&registry).await;

        let first = cache.snapshot(journey_id).await.unwrap();
        let second = cache.snapshot(journey_id).await.unwrap();
        assert_eq!(first.generated_at, second.generated_at);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, failures: 0 });
    }

    #[tokio::test]
    async fn test_invalidation_exposes_new_state() {
        let registry = registry();
        let cache = StateCache::new(Arc::new(MemoryCacheBackend::new()), registry.clone());
        let journey_id = journey(&registry).await;
        let instance = registry
            .start_member_instance(journey_id, "alice", Coordinates::new(45.0, 7.0))
            .await
            .unwrap();

        let before = cache.member(journey_id, "alice").await.unwrap().unwrap();
        assert_eq!(before.instance.current, Coordinates::new(45.0, 7.0));
        cache.snapshot(journey_id).await.unwrap();

        let moved = Coordinates::new(45.0009, 7.0);
        registry
            .update_instance_location(
                instance.id,
                "alice",
                LocationReport::at(moved)
                    .recorded_at(instance.started_at + ChronoDuration::seconds(3)),
            )
            .await
            .unwrap();
        cache.invalidate_member(journey_id, "alice").await;

        let after = cache.member(journey_id, "alice").await.unwrap().unwrap();
        assert_eq!(after.instance.current, moved);
        let snapshot = cache.snapshot(journey_id).await.unwrap();
        assert_eq!(snapshot.member("alice").unwrap().instance.current, moved);
    }

    /// Parks the first identity lookup after arming until released.
    #[derive(Default)]
    struct GatedDirectory {
        inner: MemoryDirectory,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl MembershipDirectory for GatedDirectory {
        async fn role(
            &self,
            group_id: &str,
            user_id: &str,
        ) -> std::result::Result<Option<MemberRole>, DirectoryError> {
            self.inner.role(group_id, user_id).await
        }

        async fn identity(
            &self,
            user_id: &str,
        ) -> std::result::Result<Option<MemberIdentity>, DirectoryError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.identity(user_id).await
        }
    }

    #[tokio::test]
    async fn test_slow_rebuild_does_not_outlive_invalidation() {
        let directory = Arc::new(GatedDirectory::default());
        directory.inner.add_member("riders", "owner", MemberRole::Owner);
        directory.inner.add_member("riders", "alice", MemberRole::Member);
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(MemoryStore::new()),
            directory.clone(),
        ));
        let cache = Arc::new(StateCache::new(
            Arc::new(MemoryCacheBackend::new()),
            registry.clone(),
        ));
        let journey_id = journey(&registry).await;
        let instance = registry
            .start_member_instance(journey_id, "alice", Coordinates::new(45.0, 7.0))
            .await
            .unwrap();

        // The rebuild reads the instance, then stalls on the display name.
        directory.armed.store(true, Ordering::SeqCst);
        let rebuild = tokio::spawn({
            let cache = cache.clone();
            async move { cache.snapshot(journey_id).await }
        });
        directory.entered.notified().await;

        let moved = Coordinates::new(45.0009, 7.0);
        registry
            .update_instance_location(
                instance.id,
                "alice",
                LocationReport::at(moved)
                    .recorded_at(instance.started_at + ChronoDuration::seconds(3)),
            )
            .await
            .unwrap();
        cache.invalidate_member(journey_id, "alice").await;
        directory.release.notify_one();

        let stale = rebuild.await.unwrap().unwrap();
        assert_eq!(
            stale.member("alice").unwrap().instance.current,
            Coordinates::new(45.0, 7.0)
        );

        let fresh = cache.snapshot(journey_id).await.unwrap();
        assert_eq!(fresh.member("alice").unwrap().instance.current, moved);
        let member = cache.member(journey_id, "alice").await.unwrap().unwrap();
        assert_eq!(member.instance.current, moved);
    }

    #[tokio::test]
    async fn test_unknown_member_is_not_cached() {
        let registry = registry();
        let cache = StateCache::new(Arc::new(MemoryCacheBackend::new()), registry.clone());
        let journey_id = journey(&registry).await;

        assert!(cache.member(journey_id, "alice").await.unwrap().is_none());
        assert!(cache.member(journey_id, "alice").await.unwrap().is_none());
        assert_eq!(cache.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_backend_outage_falls_back_to_registry() {
        let registry = registry();
        let cache = StateCache::new(Arc::new(DownBackend), registry.clone());
        let journey_id = journey(&registry).await;

        let snapshot = cache.snapshot(journey_id).await.unwrap();
        assert_eq!(snapshot.journey.id, journey_id);
        cache.invalidate_journey(journey_id).await;

        // Read failure, write failure, invalidation failure.
        assert_eq!(cache.stats().failures, 3);
    }

    #[tokio::test]
    async fn test_unknown_journey_is_not_found() {
        let cache = StateCache::new(Arc::new(MemoryCacheBackend::new()), registry());
        let err = cache.snapshot(uuid::Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_key_layout() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            snapshot_key(id),
            "journey:00000000-0000-0000-0000-000000000000:snapshot"
        );
        assert!(member_key(id, "alice").ends_with(":member:alice"));
    }
}
