//! The engine facade.
//!
//! [`Convoy`] wires the registry, cache, hub and timeline together and is
//! what the server talks to. Every mutation runs persist, then invalidate,
//! then publish: a failure between steps leaves the registry correct and the
//! projections heal on their next read.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cache::{CacheBackend, CacheConfig, MemoryCacheBackend, StateCache};
use crate::directory::MembershipDirectory;
use crate::error::Result;
use crate::gps::GpsSanitizer;
use crate::hub::{BroadcastHub, HubConfig, PublishOutcome};
use crate::model::{
    Coordinates, GroupJourney, InstanceId, JourneyId, JourneyInstance, LocationReport,
    MemberIdentity, MemberSnapshot, MemberState, RideEvent,
};
use crate::registry::{CompletionFeed, NewJourney, SessionRegistry, DEFAULT_AUTH_TIMEOUT};
use crate::room::RoomSubscription;
use crate::store::{JourneyStore, Page};
use crate::timeline::{EventTimeline, NewEvent};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ConvoyConfig {
    pub sanitizer: GpsSanitizer,
    /// Window for directory lookups during authorization.
    pub auth_timeout: Duration,
    pub cache: CacheConfig,
    pub hub: HubConfig,
    /// Receives a record for every completed instance.
    pub completion_feed: Option<CompletionFeed>,
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        Self {
            sanitizer: GpsSanitizer::default(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            cache: CacheConfig::default(),
            hub: HubConfig::default(),
            completion_feed: None,
        }
    }
}

/// The group journey synchronization engine.
pub struct Convoy {
    registry: Arc<SessionRegistry>,
    cache: Arc<StateCache>,
    hub: Arc<BroadcastHub>,
    timeline: EventTimeline,
}

impl Convoy {
    /// Create an engine with an in-memory cache and default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn JourneyStore>, directory: Arc<dyn MembershipDirectory>) -> Self {
        Self::with_config(
            store,
            directory,
            Arc::new(MemoryCacheBackend::new()),
            ConvoyConfig::default(),
        )
    }

    #[must_use]
    pub fn with_config(
        store: Arc<dyn JourneyStore>,
        directory: Arc<dyn MembershipDirectory>,
        cache_backend: Arc<dyn CacheBackend>,
        config: ConvoyConfig,
    ) -> Self {
        info!(
            ceiling_kmh = config.sanitizer.ceiling_kmh,
            update_interval_ms = config.hub.update_interval.as_millis() as u64,
            journey_ttl_secs = config.cache.journey_ttl.as_secs(),
            "Starting convoy engine"
        );

        let mut registry = SessionRegistry::new(store, directory)
            .with_sanitizer(config.sanitizer)
            .with_auth_timeout(config.auth_timeout);
        if let Some(feed) = config.completion_feed {
            registry = registry.with_completion_feed(feed);
        }
        let registry = Arc::new(registry);
        let cache = Arc::new(StateCache::with_config(
            cache_backend,
            registry.clone(),
            config.cache,
        ));
        let hub = Arc::new(BroadcastHub::with_config(
            registry.clone(),
            cache.clone(),
            config.hub,
        ));
        let timeline = EventTimeline::new(registry.clone(), hub.clone());

        Self {
            registry,
            cache,
            hub,
            timeline,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    #[must_use]
    pub fn timeline(&self) -> &EventTimeline {
        &self.timeline
    }

    // ----- journeys ------------------------------------------------------

    pub async fn start_group_journey(
        &self,
        creator_id: &str,
        request: NewJourney,
    ) -> Result<GroupJourney> {
        self.registry.start_group_journey(creator_id, request).await
    }

    pub async fn admin_end_journey(
        &self,
        journey_id: JourneyId,
        caller_id: &str,
    ) -> Result<GroupJourney> {
        let journey = self.registry.admin_end_journey(journey_id, caller_id).await?;
        self.cache.invalidate_journey(journey_id).await;
        Ok(journey)
    }

    pub async fn cancel_journey(
        &self,
        journey_id: JourneyId,
        caller_id: &str,
    ) -> Result<GroupJourney> {
        let journey = self.registry.cancel_journey(journey_id, caller_id).await?;
        self.cache.invalidate_journey(journey_id).await;
        Ok(journey)
    }

    /// A journey, for a member of its group.
    pub async fn journey(&self, journey_id: JourneyId, caller_id: &str) -> Result<GroupJourney> {
        self.registry
            .authorize_journey_member(journey_id, caller_id)
            .await
    }

    pub async fn journeys_for_group(
        &self,
        group_id: &str,
        caller_id: &str,
    ) -> Result<Vec<GroupJourney>> {
        self.registry.journeys_for_group(group_id, caller_id).await
    }

    // ----- instances -----------------------------------------------------

    pub async fn start_member_instance(
        &self,
        journey_id: JourneyId,
        user_id: &str,
        start: Coordinates,
    ) -> Result<JourneyInstance> {
        let instance = self
            .registry
            .start_member_instance(journey_id, user_id, start)
            .await?;
        self.settle(&instance).await;
        Ok(instance)
    }

    /// Rate-limited, persisted and broadcast fix.
    pub async fn update_location(
        &self,
        instance_id: InstanceId,
        caller_id: &str,
        report: LocationReport,
    ) -> Result<PublishOutcome> {
        self.hub
            .publish_location(instance_id, caller_id, report)
            .await
    }

    pub async fn pause_instance(
        &self,
        instance_id: InstanceId,
        caller_id: &str,
    ) -> Result<JourneyInstance> {
        let instance = self.registry.pause_instance(instance_id, caller_id).await?;
        self.settle(&instance).await;
        Ok(instance)
    }

    pub async fn resume_instance(
        &self,
        instance_id: InstanceId,
        caller_id: &str,
    ) -> Result<JourneyInstance> {
        let instance = self.registry.resume_instance(instance_id, caller_id).await?;
        self.settle(&instance).await;
        Ok(instance)
    }

    pub async fn complete_instance(
        &self,
        instance_id: InstanceId,
        caller_id: &str,
        end: Option<Coordinates>,
    ) -> Result<JourneyInstance> {
        let instance = self
            .registry
            .complete_instance(instance_id, caller_id, end)
            .await?;
        self.settle(&instance).await;
        Ok(instance)
    }

    /// Invalidate, then publish, after a persisted status change.
    async fn settle(&self, instance: &JourneyInstance) {
        self.cache
            .invalidate_member(instance.journey_id, &instance.user_id)
            .await;
        self.hub.publish_status(instance);
    }

    // ----- reads ---------------------------------------------------------

    pub async fn snapshot(&self, journey_id: JourneyId, caller_id: &str) -> Result<MemberSnapshot> {
        self.hub.request_snapshot(journey_id, caller_id).await
    }

    pub async fn member_state(
        &self,
        journey_id: JourneyId,
        caller_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberState>> {
        self.registry
            .authorize_journey_member(journey_id, caller_id)
            .await?;
        self.cache.member(journey_id, user_id).await
    }

    // ----- rooms ---------------------------------------------------------

    pub async fn join(
        &self,
        journey_id: JourneyId,
        connection_id: &str,
        identity: &MemberIdentity,
    ) -> Result<(MemberSnapshot, RoomSubscription)> {
        self.hub.join(journey_id, connection_id, identity).await
    }

    pub fn leave(&self, journey_id: JourneyId, connection_id: &str) -> Result<()> {
        self.hub.leave(journey_id, connection_id)
    }

    pub fn disconnect(&self, connection_id: &str) -> usize {
        self.hub.disconnect(connection_id)
    }

    // ----- timeline ------------------------------------------------------

    pub async fn append_event(
        &self,
        journey_id: JourneyId,
        caller_id: &str,
        event: NewEvent,
    ) -> Result<RideEvent> {
        self.timeline.append_event(journey_id, caller_id, event).await
    }

    pub async fn list_events(
        &self,
        journey_id: JourneyId,
        caller_id: &str,
        page: Page,
    ) -> Result<Vec<RideEvent>> {
        self.timeline.list_events(journey_id, caller_id, page).await
    }
}
