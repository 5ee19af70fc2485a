//! Session registry.
//!
//! Owns the lifecycle of group journeys and member instances and is the only
//! component that writes to the [`JourneyStore`]. Every mutating call checks
//! the caller against the record it touches.
//!
//! Instance state machine:
//!
//! ```text
//!   ACTIVE ──pause──▶ PAUSED
//!     ▲  │              │ │
//!     │  └──complete─┐  │ └──complete──┐
//!     └────resume────┼──┘              │
//!                    ▼                 ▼
//!                 COMPLETED ◀──────────┘   (terminal)
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directory::{DirectoryError, MembershipDirectory};
use crate::error::{ConvoyError, Result};
use crate::gps::{self, DistanceSource, GpsSanitizer};
use crate::model::{
    CompletionRecord, Coordinates, GroupJourney, InstanceId, InstanceStatus, JourneyId,
    JourneyInstance, JourneyStatus, LocationReport, MemberIdentity, MemberRole, MemberSnapshot,
    MemberState, RideEvent, RoutePoint,
};
use crate::store::{JourneyStore, Page};

/// Longest accepted journey title.
pub const MAX_TITLE_LENGTH: usize = 200;

/// Longest accepted journey description.
pub const MAX_DESCRIPTION_LENGTH: usize = 2000;

/// Default window for directory lookups during authorization.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Fire-and-forget feed of completed instances for the gamification side.
#[derive(Debug, Clone)]
pub struct CompletionFeed {
    sender: mpsc::UnboundedSender<CompletionRecord>,
}

impl CompletionFeed {
    /// Create a feed and the receiver its consumer drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CompletionRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Hand off a record. Never blocks; a gone consumer is only logged.
    pub fn publish(&self, record: CompletionRecord) {
        let instance = record.instance_id;
        if self.sender.send(record).is_err() {
            warn!(instance = %instance, "Completion feed consumer is gone, record dropped");
        }
    }
}

/// Input for [`SessionRegistry::start_group_journey`].
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct NewJourney {
    pub group_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub destination: Coordinates,
}

impl NewJourney {
    fn validate(&self) -> Result<()> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(ConvoyError::validation("title must not be empty"));
        }
        if title.chars().count() > MAX_TITLE_LENGTH {
            return Err(ConvoyError::validation(format!(
                "title exceeds {MAX_TITLE_LENGTH} characters"
            )));
        }
        if self
            .description
            .as_ref()
            .is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_LENGTH)
        {
            return Err(ConvoyError::validation(format!(
                "description exceeds {MAX_DESCRIPTION_LENGTH} characters"
            )));
        }
        self.destination.validate()
    }
}

/// Result of a location update.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    /// The instance after the update.
    pub instance: JourneyInstance,
    /// `false` when the fix was dropped as implausible. The instance is then
    /// unchanged and nothing should be broadcast.
    pub accepted: bool,
    /// Where the recorded distance came from, when a segment was measured.
    pub distance_source: Option<DistanceSource>,
}

type InstanceLocks = DashMap<InstanceId, Arc<Mutex<()>>>;

/// Exclusive hold on one instance's read-modify-write cycle.
///
/// Dropping it unlocks, then forgets the map entry unless another caller is
/// already waiting on the same lock.
struct InstanceGuard<'a> {
    locks: &'a InstanceLocks,
    instance_id: InstanceId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.instance_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// The durable lifecycle of journeys, instances and timeline events.
pub struct SessionRegistry {
    store: Arc<dyn JourneyStore>,
    directory: Arc<dyn MembershipDirectory>,
    sanitizer: GpsSanitizer,
    auth_timeout: Duration,
    /// Serializes read-modify-write cycles on the same instance.
    instance_locks: InstanceLocks,
    completions: Option<CompletionFeed>,
}

impl SessionRegistry {
    /// Create a registry with the default sanitizer and auth timeout.
    #[must_use]
    pub fn new(store: Arc<dyn JourneyStore>, directory: Arc<dyn MembershipDirectory>) -> Self {
        Self {
            store,
            directory,
            sanitizer: GpsSanitizer::default(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            instance_locks: DashMap::new(),
            completions: None,
        }
    }

    #[must_use]
    pub fn with_sanitizer(mut self, sanitizer: GpsSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    #[must_use]
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_completion_feed(mut self, feed: CompletionFeed) -> Self {
        self.completions = Some(feed);
        self
    }

    #[must_use]
    pub fn sanitizer(&self) -> &GpsSanitizer {
        &self.sanitizer
    }

    // ----- authorization -------------------------------------------------

    async fn within_auth_window<T>(
        &self,
        what: &str,
        lookup: impl Future<Output = std::result::Result<T, DirectoryError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.auth_timeout, lookup).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(
                    lookup = what,
                    timeout_ms = self.auth_timeout.as_millis() as u64,
                    "Authorization timed out"
                );
                Err(ConvoyError::Timeout(format!("{what} lookup timed out")))
            }
        }
    }

    /// Require `user_id` to belong to `group_id`.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::Forbidden`] for non-members, [`ConvoyError::Timeout`]
    /// if the directory does not answer within the auth window.
    pub async fn authorize_member(&self, group_id: &str, user_id: &str) -> Result<MemberRole> {
        let role = self
            .within_auth_window("membership", self.directory.role(group_id, user_id))
            .await?;
        role.ok_or_else(|| {
            ConvoyError::forbidden(format!("{user_id} is not a member of group {group_id}"))
        })
    }

    /// Require `user_id` to be a member of the journey's group.
    ///
    /// # Errors
    ///
    /// As [`Self::authorize_member`], plus [`ConvoyError::NotFound`].
    pub async fn authorize_journey_member(
        &self,
        journey_id: JourneyId,
        user_id: &str,
    ) -> Result<GroupJourney> {
        let journey = self.journey(journey_id).await?;
        self.authorize_member(&journey.group_id, user_id).await?;
        Ok(journey)
    }

    /// Require `caller_id` to own the instance.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::NotFound`] or [`ConvoyError::Forbidden`].
    pub async fn authorize_owner(
        &self,
        instance_id: InstanceId,
        caller_id: &str,
    ) -> Result<JourneyInstance> {
        let instance = self.instance(instance_id).await?;
        if instance.user_id != caller_id {
            return Err(ConvoyError::forbidden(format!(
                "{caller_id} does not own instance {instance_id}"
            )));
        }
        Ok(instance)
    }

    /// Display identity for a user, falling back to the bare id.
    ///
    /// Bounded by the auth window like every other directory call: a slow
    /// directory degrades names, it never stalls a snapshot.
    pub async fn identity(&self, user_id: &str) -> MemberIdentity {
        match self
            .within_auth_window("identity", self.directory.identity(user_id))
            .await
        {
            Ok(Some(identity)) => identity,
            Ok(None) => MemberIdentity::new(user_id, user_id),
            Err(e) => {
                warn!(user = %user_id, error = %e, "Identity lookup failed, using bare id");
                MemberIdentity::new(user_id, user_id)
            }
        }
    }

    // ----- journeys ------------------------------------------------------

    /// Create a journey with a destination and no instances.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::Validation`] for malformed input,
    /// [`ConvoyError::Forbidden`] unless the creator owns or administers the
    /// group.
    pub async fn start_group_journey(
        &self,
        creator_id: &str,
        request: NewJourney,
    ) -> Result<GroupJourney> {
        request.validate()?;

        let role = self.authorize_member(&request.group_id, creator_id).await?;
        if !role.can_manage() {
            return Err(ConvoyError::forbidden(format!(
                "{creator_id} cannot start journeys in group {}",
                request.group_id
            )));
        }

        let now = Utc::now();
        let journey = GroupJourney {
            id: Uuid::new_v4(),
            group_id: request.group_id,
            creator_id: creator_id.to_string(),
            title: request.title.trim().to_string(),
            description: request.description,
            destination: request.destination,
            status: JourneyStatus::Active,
            created_at: now,
            started_at: now,
            completed_at: None,
        };
        self.store.insert_journey(journey.clone()).await?;

        info!(
            journey = %journey.id,
            group = %journey.group_id,
            creator = %creator_id,
            "Journey started"
        );
        Ok(journey)
    }

    /// Mark a journey COMPLETED. Member instances are deliberately untouched.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::Forbidden`] unless the caller created the journey or
    /// manages the group; [`ConvoyError::Conflict`] if it already ended.
    pub async fn admin_end_journey(
        &self,
        journey_id: JourneyId,
        caller_id: &str,
    ) -> Result<GroupJourney> {
        self.close_journey(journey_id, caller_id, JourneyStatus::Completed)
            .await
    }

    /// Mark a journey CANCELLED. Member instances are deliberately untouched.
    ///
    /// # Errors
    ///
    /// As [`Self::admin_end_journey`].
    pub async fn cancel_journey(
        &self,
        journey_id: JourneyId,
        caller_id: &str,
    ) -> Result<GroupJourney> {
        self.close_journey(journey_id, caller_id, JourneyStatus::Cancelled)
            .await
    }

    async fn close_journey(
        &self,
        journey_id: JourneyId,
        caller_id: &str,
        status: JourneyStatus,
    ) -> Result<GroupJourney> {
        let mut journey = self.journey(journey_id).await?;

        if journey.creator_id != caller_id {
            let role = self.authorize_member(&journey.group_id, caller_id).await?;
            if !role.can_manage() {
                return Err(ConvoyError::forbidden(format!(
                    "{caller_id} cannot end journey {journey_id}"
                )));
            }
        }
        if journey.status != JourneyStatus::Active {
            return Err(ConvoyError::conflict(format!(
                "journey {journey_id} is already {:?}",
                journey.status
            )));
        }

        journey.status = status;
        journey.completed_at = Some(Utc::now());
        self.store.update_journey(&journey).await?;

        info!(journey = %journey_id, by = %caller_id, status = ?status, "Journey closed");
        Ok(journey)
    }

    /// Load a journey.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::NotFound`] for unknown ids.
    pub async fn journey(&self, journey_id: JourneyId) -> Result<GroupJourney> {
        self.store
            .journey(journey_id)
            .await?
            .ok_or_else(|| ConvoyError::not_found(format!("journey {journey_id}")))
    }

    /// Journeys of a group, for one of its members.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::Forbidden`] for non-members.
    pub async fn journeys_for_group(
        &self,
        group_id: &str,
        caller_id: &str,
    ) -> Result<Vec<GroupJourney>> {
        self.authorize_member(group_id, caller_id).await?;
        Ok(self.store.journeys_for_group(group_id).await?)
    }

    // ----- instances -----------------------------------------------------

    /// Start tracking a member at their own coordinates.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::NotFound`] for unknown journeys,
    /// [`ConvoyError::Forbidden`] for non-members,
    /// [`ConvoyError::Conflict`] if the member already has a live instance or
    /// the journey has ended.
    pub async fn start_member_instance(
        &self,
        journey_id: JourneyId,
        user_id: &str,
        start: Coordinates,
    ) -> Result<JourneyInstance> {
        start.validate()?;

        let journey = self.authorize_journey_member(journey_id, user_id).await?;
        if journey.status != JourneyStatus::Active {
            return Err(ConvoyError::conflict(format!(
                "journey {journey_id} is {:?}",
                journey.status
            )));
        }

        let now = Utc::now();
        let instance = JourneyInstance {
            id: Uuid::new_v4(),
            journey_id,
            user_id: user_id.to_string(),
            status: InstanceStatus::Active,
            start,
            current: start,
            distance_km: 0.0,
            moving_seconds: 0.0,
            average_speed_kmh: 0.0,
            top_speed_kmh: 0.0,
            route: vec![RoutePoint::new(start, now)],
            started_at: now,
            last_update_at: now,
            completed_at: None,
            segment_break: false,
        };
        self.store.insert_instance(instance.clone()).await?;

        info!(journey = %journey_id, instance = %instance.id, user = %user_id, "Instance started");
        Ok(instance)
    }

    /// Load an instance.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::NotFound`] for unknown ids.
    pub async fn instance(&self, instance_id: InstanceId) -> Result<JourneyInstance> {
        self.store
            .instance(instance_id)
            .await?
            .ok_or_else(|| ConvoyError::not_found(format!("instance {instance_id}")))
    }

    /// All instances of a journey.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn instances_for_journey(
        &self,
        journey_id: JourneyId,
    ) -> Result<Vec<JourneyInstance>> {
        Ok(self.store.instances_for_journey(journey_id).await?)
    }

    /// The user's most recent instance in a journey, any status.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn latest_instance_of(
        &self,
        journey_id: JourneyId,
        user_id: &str,
    ) -> Result<Option<JourneyInstance>> {
        Ok(self
            .instances_for_journey(journey_id)
            .await?
            .into_iter()
            .filter(|i| i.user_id == user_id)
            .max_by_key(|i| i.started_at))
    }

    /// Check ownership, then lock the instance and reload it.
    ///
    /// Ids the caller does not own are turned away before a lock exists, so
    /// unknown ids never reach the lock map.
    async fn lock_owned_instance(
        &self,
        instance_id: InstanceId,
        caller_id: &str,
    ) -> Result<(InstanceGuard<'_>, JourneyInstance)> {
        self.authorize_owner(instance_id, caller_id).await?;

        let lock = self
            .instance_locks
            .entry(instance_id)
            .or_default()
            .value()
            .clone();
        let guard = InstanceGuard {
            locks: &self.instance_locks,
            instance_id,
            guard: Some(lock.lock_owned().await),
        };

        let instance = self.instance(instance_id).await?;
        Ok((guard, instance))
    }

    /// Number of instances with a live mutation lock.
    #[must_use]
    pub fn locked_instances(&self) -> usize {
        self.instance_locks.len()
    }

    /// Record a new fix for an ACTIVE instance.
    ///
    /// An implausible fix is dropped silently: the call succeeds with
    /// `accepted == false` and the instance unchanged.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::Validation`], [`ConvoyError::NotFound`],
    /// [`ConvoyError::Forbidden`] for non-owners, and
    /// [`ConvoyError::Conflict`] unless the instance is ACTIVE.
    pub async fn update_instance_location(
        &self,
        instance_id: InstanceId,
        caller_id: &str,
        report: LocationReport,
    ) -> Result<LocationUpdate> {
        report.validate()?;

        let (_guard, mut instance) = self.lock_owned_instance(instance_id, caller_id).await?;
        if instance.status != InstanceStatus::Active {
            return Err(ConvoyError::conflict(format!(
                "instance {instance_id} is {:?}, not ACTIVE",
                instance.status
            )));
        }

        let now = Utc::now();
        let Some(distance_source) = self.apply_fix(&mut instance, &report, now) else {
            return Ok(LocationUpdate {
                instance,
                accepted: false,
                distance_source: None,
            });
        };

        self.store.update_instance(&instance).await?;
        debug!(
            instance = %instance_id,
            distance_km = instance.distance_km,
            moving_seconds = instance.moving_seconds,
            "Location recorded"
        );

        Ok(LocationUpdate {
            instance,
            accepted: true,
            distance_source,
        })
    }

    /// Append a fix to the route and fold it into the statistics.
    ///
    /// The start point carries the server clock. A first fix stamped by the
    /// device cannot be timed against it, so it anchors the first segment:
    /// nothing is measured and it is not checked for plausibility.
    ///
    /// Returns `None` if the fix was rejected, otherwise the distance source
    /// of the measured segment (`Some(None)` when no segment was measured).
    fn apply_fix(
        &self,
        instance: &mut JourneyInstance,
        report: &LocationReport,
        now: DateTime<Utc>,
    ) -> Option<Option<DistanceSource>> {
        let point = RoutePoint {
            coordinates: report.coordinates,
            recorded_at: report.recorded_at.unwrap_or(now),
            speed: report.speed,
            heading: report.heading,
        };

        let device_anchor = instance.route.len() == 1 && report.recorded_at.is_some();

        let mut source = None;
        if let Some(last) = instance.last_point().copied() {
            if !device_anchor && !self.sanitizer.is_plausible(&last, &point) {
                warn!(
                    instance = %instance.id,
                    latitude = point.coordinates.latitude,
                    longitude = point.coordinates.longitude,
                    implied_kmh = ?gps::implied_speed_kmh(&last, &point),
                    ceiling_kmh = self.sanitizer.ceiling_kmh,
                    "Dropped implausible fix"
                );
                return None;
            }

            if instance.segment_break || device_anchor {
                instance.segment_break = false;
            } else {
                let seconds = gps::elapsed_seconds(&last, &point);
                let segment_km = gps::haversine_km(last.coordinates, point.coordinates);
                let moving_seconds = instance.moving_seconds + seconds;
                let reconciled = self.sanitizer.reconcile_distance(
                    report.client_distance_km,
                    instance.distance_km + segment_km,
                    moving_seconds,
                );

                instance.distance_km = reconciled.km.max(instance.distance_km);
                instance.moving_seconds = moving_seconds;
                if let Some(kmh) = gps::implied_speed_kmh(&last, &point) {
                    instance.top_speed_kmh = instance.top_speed_kmh.max(kmh);
                }
                source = Some(reconciled.source);
            }
        }

        if let Some(reported) = report.speed.filter(|s| *s <= self.sanitizer.ceiling_kmh) {
            instance.top_speed_kmh = instance.top_speed_kmh.max(reported);
        }
        instance.average_speed_kmh =
            gps::average_speed(instance.distance_km, instance.moving_seconds);
        instance.route.push(point);
        instance.current = point.coordinates;
        instance.last_update_at = now;

        Some(source)
    }

    /// ACTIVE → PAUSED.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::Conflict`] unless the instance is ACTIVE.
    pub async fn pause_instance(
        &self,
        instance_id: InstanceId,
        caller_id: &str,
    ) -> Result<JourneyInstance> {
        self.transition(instance_id, caller_id, InstanceStatus::Active, |instance| {
            instance.status = InstanceStatus::Paused;
        })
        .await
    }

    /// PAUSED → ACTIVE. The next fix opens a fresh segment.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::Conflict`] unless the instance is PAUSED.
    pub async fn resume_instance(
        &self,
        instance_id: InstanceId,
        caller_id: &str,
    ) -> Result<JourneyInstance> {
        self.transition(instance_id, caller_id, InstanceStatus::Paused, |instance| {
            instance.status = InstanceStatus::Active;
            instance.segment_break = true;
        })
        .await
    }

    async fn transition(
        &self,
        instance_id: InstanceId,
        caller_id: &str,
        expected: InstanceStatus,
        apply: impl FnOnce(&mut JourneyInstance),
    ) -> Result<JourneyInstance> {
        let (_guard, mut instance) = self.lock_owned_instance(instance_id, caller_id).await?;
        if instance.status != expected {
            return Err(ConvoyError::conflict(format!(
                "instance {instance_id} is {:?}, expected {expected:?}",
                instance.status
            )));
        }

        apply(&mut instance);
        instance.last_update_at = Utc::now();
        self.store.update_instance(&instance).await?;

        debug!(instance = %instance_id, status = ?instance.status, "Instance transitioned");
        Ok(instance)
    }

    /// ACTIVE or PAUSED → COMPLETED, freezing the statistics.
    ///
    /// A second call fails, so a retried submission cannot complete twice.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::Conflict`] if already COMPLETED.
    pub async fn complete_instance(
        &self,
        instance_id: InstanceId,
        caller_id: &str,
        end: Option<Coordinates>,
    ) -> Result<JourneyInstance> {
        if let Some(end) = end {
            end.validate()?;
        }

        let (guard, mut instance) = self.lock_owned_instance(instance_id, caller_id).await?;
        if instance.status.is_terminal() {
            return Err(ConvoyError::conflict(format!(
                "instance {instance_id} is already COMPLETED"
            )));
        }

        let now = Utc::now();
        if let Some(end) = end {
            if instance.status == InstanceStatus::Paused {
                instance.segment_break = true;
            }
            // A rejected end fix still completes the instance.
            let _ = self.apply_fix(&mut instance, &LocationReport::at(end), now);
        }

        instance.status = InstanceStatus::Completed;
        instance.segment_break = false;
        instance.completed_at = Some(now);
        instance.last_update_at = now;
        instance.average_speed_kmh = self
            .sanitizer
            .final_average_speed(instance.distance_km, instance.moving_seconds);
        instance.top_speed_kmh = instance.top_speed_kmh.min(self.sanitizer.ceiling_kmh);

        self.store.update_instance(&instance).await?;
        drop(guard);

        info!(
            instance = %instance_id,
            distance_km = instance.reported_distance_km(),
            moving_seconds = instance.moving_seconds,
            "Instance completed"
        );

        if let Some(feed) = &self.completions {
            feed.publish(CompletionRecord::from_instance(&instance));
        }
        Ok(instance)
    }

    // ----- projections ---------------------------------------------------

    /// Build the full member snapshot of a journey from the store.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::NotFound`] for unknown journeys.
    pub async fn build_snapshot(&self, journey_id: JourneyId) -> Result<MemberSnapshot> {
        let journey = self.journey(journey_id).await?;
        let instances = self.instances_for_journey(journey_id).await?;

        let mut members = Vec::with_capacity(instances.len());
        for instance in instances {
            let member = self.identity(&instance.user_id).await;
            members.push(MemberState { member, instance });
        }

        Ok(MemberSnapshot {
            journey,
            members,
            online: Vec::new(),
            generated_at: Utc::now(),
        })
    }

    /// Build one member's state from the store.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn build_member_state(
        &self,
        journey_id: JourneyId,
        user_id: &str,
    ) -> Result<Option<MemberState>> {
        let Some(instance) = self.latest_instance_of(journey_id, user_id).await? else {
            return Ok(None);
        };
        let member = self.identity(user_id).await;
        Ok(Some(MemberState { member, instance }))
    }

    // ----- timeline storage ----------------------------------------------

    /// Persist a timeline event.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn record_event(&self, event: RideEvent) -> Result<()> {
        Ok(self.store.insert_event(event).await?)
    }

    /// Events of a journey ordered by creation time.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn events(&self, journey_id: JourneyId, page: Page) -> Result<Vec<RideEvent>> {
        Ok(self.store.events_for_journey(journey_id, page).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    const GROUP: &str = "riders";

    fn directory() -> Arc<MemoryDirectory> {
        let directory = MemoryDirectory::new();
        directory.add_user(MemberIdentity::new("owner", "Olga"));
        directory.add_user(MemberIdentity::new("alice", "Alice"));
        directory.add_member(GROUP, "owner", MemberRole::Owner);
        directory.add_member(GROUP, "admin", MemberRole::Admin);
        directory.add_member(GROUP, "alice", MemberRole::Member);
        directory.add_member(GROUP, "bob", MemberRole::Member);
        Arc::new(directory)
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(MemoryStore::new()), directory())
    }

    fn new_journey() -> NewJourney {
        NewJourney {
            group_id: GROUP.into(),
            title: "Coast run".into(),
            description: None,
            destination: Coordinates::new(44.4, 8.9),
        }
    }

    async fn journey_with_instance(registry: &SessionRegistry) -> (GroupJourney, JourneyInstance) {
        let journey = registry
            .start_group_journey("owner", new_journey())
            .await
            .unwrap();
        let instance = registry
            .start_member_instance(journey.id, "alice", Coordinates::new(45.0, 7.0))
            .await
            .unwrap();
        (journey, instance)
    }

    /// A report `secs` after the instance started, `north_deg` north of start.
    fn report(instance: &JourneyInstance, north_deg: f64, secs: i64) -> LocationReport {
        LocationReport::at(Coordinates::new(
            instance.start.latitude + north_deg,
            instance.start.longitude,
        ))
        .recorded_at(instance.started_at + ChronoDuration::seconds(secs))
    }

    /// Record the device-stamped fix that anchors the first segment.
    async fn anchor(registry: &SessionRegistry, instance: &JourneyInstance) {
        let update = registry
            .update_instance_location(instance.id, "alice", report(instance, 0.0, 0))
            .await
            .unwrap();
        assert!(update.accepted);
        assert_eq!(update.distance_source, None);
    }

    #[tokio::test]
    async fn test_journey_starts_without_instances() {
        let registry = registry();
        let journey = registry
            .start_group_journey("owner", new_journey())
            .await
            .unwrap();

        assert_eq!(journey.status, JourneyStatus::Active);
        assert!(registry.instances_for_journey(journey.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_managers_start_journeys() {
        let registry = registry();

        let err = registry
            .start_group_journey("alice", new_journey())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let err = registry
            .start_group_journey("stranger", new_journey())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        assert!(registry.start_group_journey("admin", new_journey()).await.is_ok());
    }

    #[tokio::test]
    async fn test_journey_validation() {
        let registry = registry();

        let mut bad = new_journey();
        bad.destination = Coordinates::new(120.0, 0.0);
        assert_eq!(
            registry.start_group_journey("owner", bad).await.unwrap_err().kind(),
            ErrorKind::Validation
        );

        let mut blank = new_journey();
        blank.title = "   ".into();
        assert_eq!(
            registry.start_group_journey("owner", blank).await.unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[tokio::test]
    async fn test_start_instance_rules() {
        let registry = registry();
        let (journey, _) = journey_with_instance(&registry).await;

        let dup = registry
            .start_member_instance(journey.id, "alice", Coordinates::new(45.1, 7.1))
            .await
            .unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::Conflict);

        let outsider = registry
            .start_member_instance(journey.id, "mallory", Coordinates::new(45.1, 7.1))
            .await
            .unwrap_err();
        assert_eq!(outsider.kind(), ErrorKind::Forbidden);

        let missing = registry
            .start_member_instance(Uuid::new_v4(), "alice", Coordinates::new(45.1, 7.1))
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_concurrent_starts_yield_one_live_instance() {
        let registry = Arc::new(registry());
        let journey_id = registry
            .start_group_journey("owner", new_journey())
            .await
            .unwrap()
            .id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .start_member_instance(journey_id, "bob", Coordinates::new(45.0, 7.0))
                    .await
                    .is_ok()
            }));
        }

        let mut started = 0;
        for handle in handles {
            if handle.await.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_updates_accumulate_distance() {
        let registry = registry();
        let (_, instance) = journey_with_instance(&registry).await;
        anchor(&registry, &instance).await;

        let mut previous = 0.0;
        for step in 1..=3 {
            let update = registry
                .update_instance_location(
                    instance.id,
                    "alice",
                    report(&instance, 0.0009 * step as f64, 3 * step),
                )
                .await
                .unwrap();
            assert!(update.accepted);
            assert!(update.instance.distance_km >= previous);
            previous = update.instance.distance_km;
        }

        let stored = registry.instance(instance.id).await.unwrap();
        assert_eq!(stored.reported_distance_km(), 0.3);
        assert_eq!(stored.moving_seconds, 9.0);
        assert_eq!(stored.route.len(), 5);
        assert!(stored.average_speed_kmh > 100.0 && stored.average_speed_kmh < 130.0);
    }

    #[tokio::test]
    async fn test_implausible_fix_is_dropped_silently() {
        let registry = registry();
        let (_, instance) = journey_with_instance(&registry).await;
        anchor(&registry, &instance).await;

        let spike = registry
            .update_instance_location(instance.id, "alice", report(&instance, 5.0, 1))
            .await
            .unwrap();
        assert!(!spike.accepted);

        // The next good fix is measured against the anchor, not the spike.
        let good = registry
            .update_instance_location(instance.id, "alice", report(&instance, 0.001, 5))
            .await
            .unwrap();
        assert!(good.accepted);

        let stored = registry.instance(instance.id).await.unwrap();
        assert_eq!(stored.route.len(), 3);
        assert_eq!(stored.reported_distance_km(), 0.11);
    }

    #[tokio::test]
    async fn test_client_distance_is_capped() {
        let registry = registry();
        let (_, instance) = journey_with_instance(&registry).await;
        anchor(&registry, &instance).await;

        let update = registry
            .update_instance_location(
                instance.id,
                "alice",
                report(&instance, 0.0009, 3).with_client_distance(50.0),
            )
            .await
            .unwrap();

        assert_eq!(update.distance_source, Some(DistanceSource::Capped));
        // 250 km/h for 3 s.
        assert!((update.instance.distance_km - 250.0 * 3.0 / 3600.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_only_owner_mutates() {
        let registry = registry();
        let (_, instance) = journey_with_instance(&registry).await;

        let err = registry
            .update_instance_location(instance.id, "bob", report(&instance, 0.0009, 3))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        assert_eq!(
            registry.pause_instance(instance.id, "bob").await.unwrap_err().kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(
            registry
                .complete_instance(instance.id, "owner", None)
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::Forbidden
        );
    }

    #[tokio::test]
    async fn test_pause_resume_round_trip() {
        let registry = registry();
        let (_, instance) = journey_with_instance(&registry).await;
        anchor(&registry, &instance).await;
        registry
            .update_instance_location(instance.id, "alice", report(&instance, 0.0009, 3))
            .await
            .unwrap();
        let before = registry.instance(instance.id).await.unwrap().distance_km;

        let paused = registry.pause_instance(instance.id, "alice").await.unwrap();
        assert_eq!(paused.status, InstanceStatus::Paused);
        assert_eq!(
            registry.pause_instance(instance.id, "alice").await.unwrap_err().kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            registry
                .update_instance_location(instance.id, "alice", report(&instance, 0.0018, 6))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::Conflict
        );

        let resumed = registry.resume_instance(instance.id, "alice").await.unwrap();
        assert_eq!(resumed.status, InstanceStatus::Active);
        assert_eq!(resumed.distance_km, before);
        assert_eq!(
            registry.resume_instance(instance.id, "alice").await.unwrap_err().kind(),
            ErrorKind::Conflict
        );

        // Travel while paused is not counted: the first fix after resume
        // only anchors the next segment.
        let anchor = registry
            .update_instance_location(instance.id, "alice", report(&instance, 0.0045, 60))
            .await
            .unwrap();
        assert!(anchor.accepted);
        assert_eq!(anchor.instance.distance_km, before);
    }

    #[tokio::test]
    async fn test_complete_once() {
        let (feed, mut records) = CompletionFeed::channel();
        let registry = SessionRegistry::new(Arc::new(MemoryStore::new()), directory())
            .with_completion_feed(feed);
        let (journey, instance) = journey_with_instance(&registry).await;
        anchor(&registry, &instance).await;

        registry
            .update_instance_location(instance.id, "alice", report(&instance, 0.0009, 3))
            .await
            .unwrap();
        let done = registry
            .complete_instance(instance.id, "alice", None)
            .await
            .unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert!(done.completed_at.is_some());

        let again = registry
            .complete_instance(instance.id, "alice", None)
            .await
            .unwrap_err();
        assert_eq!(again.kind(), ErrorKind::Conflict);

        let record = records.try_recv().unwrap();
        assert_eq!(record.instance_id, instance.id);
        assert_eq!(record.distance_km, 0.1);
        assert!(records.try_recv().is_err());

        // Completion frees the pair for a new instance.
        assert!(registry
            .start_member_instance(journey.id, "alice", Coordinates::new(45.0, 7.0))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_complete_from_paused() {
        let registry = registry();
        let (_, instance) = journey_with_instance(&registry).await;
        anchor(&registry, &instance).await;
        registry
            .update_instance_location(instance.id, "alice", report(&instance, 0.0009, 3))
            .await
            .unwrap();
        let paused = registry.pause_instance(instance.id, "alice").await.unwrap();

        let done = registry
            .complete_instance(instance.id, "alice", None)
            .await
            .unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.distance_km, paused.distance_km);
        assert_eq!(done.moving_seconds, 3.0);
        assert_eq!(done.average_speed_kmh, paused.average_speed_kmh);
    }

    #[tokio::test]
    async fn test_completion_survives_dropped_feed() {
        let (feed, records) = CompletionFeed::channel();
        drop(records);
        let registry = SessionRegistry::new(Arc::new(MemoryStore::new()), directory())
            .with_completion_feed(feed);
        let (_, instance) = journey_with_instance(&registry).await;

        assert!(registry.complete_instance(instance.id, "alice", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_admin_end_leaves_instances_alone() {
        let registry = registry();
        let (journey, instance) = journey_with_instance(&registry).await;

        assert_eq!(
            registry.admin_end_journey(journey.id, "alice").await.unwrap_err().kind(),
            ErrorKind::Forbidden
        );

        let ended = registry.admin_end_journey(journey.id, "admin").await.unwrap();
        assert_eq!(ended.status, JourneyStatus::Completed);
        assert_eq!(
            registry.instance(instance.id).await.unwrap().status,
            InstanceStatus::Active
        );

        assert_eq!(
            registry.cancel_journey(journey.id, "owner").await.unwrap_err().kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            registry
                .start_member_instance(journey.id, "bob", Coordinates::new(45.0, 7.0))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::Conflict
        );
    }

    #[tokio::test]
    async fn test_first_fix_tolerates_device_clock_skew() {
        let registry = registry();
        let (_, instance) = journey_with_instance(&registry).await;

        // A device ten seconds behind the server.
        let behind = registry
            .update_instance_location(instance.id, "alice", report(&instance, 0.0009, -10))
            .await
            .unwrap();
        assert!(behind.accepted);
        assert_eq!(behind.instance.distance_km, 0.0);

        let next = registry
            .update_instance_location(instance.id, "alice", report(&instance, 0.0018, -7))
            .await
            .unwrap();
        assert!(next.accepted);
        assert_eq!(next.instance.reported_distance_km(), 0.1);
        assert_eq!(next.instance.moving_seconds, 3.0);
    }

    #[tokio::test]
    async fn test_device_clock_ahead_does_not_inflate_moving_time() {
        let registry = registry();
        let (_, instance) = journey_with_instance(&registry).await;

        for (north, secs) in [(0.0, 3600), (0.0009, 3603)] {
            let update = registry
                .update_instance_location(instance.id, "alice", report(&instance, north, secs))
                .await
                .unwrap();
            assert!(update.accepted);
        }

        let stored = registry.instance(instance.id).await.unwrap();
        assert_eq!(stored.moving_seconds, 3.0);
        assert_eq!(stored.reported_distance_km(), 0.1);
    }

    #[tokio::test]
    async fn test_end_fix_without_device_time_is_measured() {
        let registry = registry();
        let (_, instance) = journey_with_instance(&registry).await;

        let done = registry
            .complete_instance(instance.id, "alice", Some(Coordinates::new(45.0, 7.0)))
            .await
            .unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.route.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_instances_leave_no_locks() {
        let registry = registry();
        for _ in 0..1000 {
            let err = registry
                .pause_instance(Uuid::new_v4(), "alice")
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
        assert_eq!(registry.locked_instances(), 0);

        let (_, instance) = journey_with_instance(&registry).await;
        assert!(registry.pause_instance(instance.id, "bob").await.is_err());
        anchor(&registry, &instance).await;
        registry.pause_instance(instance.id, "alice").await.unwrap();
        registry.resume_instance(instance.id, "alice").await.unwrap();
        assert_eq!(registry.locked_instances(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_updates_release_their_lock() {
        let registry = Arc::new(registry());
        let (_, instance) = journey_with_instance(&registry).await;
        let instance_id = instance.id;

        let mut handles = Vec::new();
        for step in 0..8 {
            let registry = registry.clone();
            let report = report(&instance, 0.0001 * step as f64, 10 * step);
            handles.push(tokio::spawn(async move {
                registry
                    .update_instance_location(instance_id, "alice", report)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.locked_instances(), 0);
    }

    struct StalledDirectory;

    #[async_trait]
    impl MembershipDirectory for StalledDirectory {
        async fn role(
            &self,
            _: &str,
            _: &str,
        ) -> std::result::Result<Option<MemberRole>, DirectoryError> {
            std::future::pending().await
        }

        async fn identity(
            &self,
            _: &str,
        ) -> std::result::Result<Option<MemberIdentity>, DirectoryError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorization_fails_closed() {
        let registry =
            SessionRegistry::new(Arc::new(MemoryStore::new()), Arc::new(StalledDirectory))
                .with_auth_timeout(Duration::from_millis(500));

        let err = registry.authorize_member(GROUP, "alice").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_identity_falls_back_to_bare_id() {
        let registry =
            SessionRegistry::new(Arc::new(MemoryStore::new()), Arc::new(StalledDirectory))
                .with_auth_timeout(Duration::from_millis(500));

        let identity = registry.identity("alice").await;
        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.display_name, "alice");
    }
}
