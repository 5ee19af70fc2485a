//! Realtime broadcast hub.
//!
//! The hub manages one [`Room`] per group journey. Connections join a room
//! explicitly, after a membership check, and receive incremental patches for
//! every other member's accepted fixes. Location publishing is rate limited
//! per instance and follows the persist → invalidate → publish order.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use convoy_protocol::PresenceAction;

use crate::cache::StateCache;
use crate::error::{ConvoyError, Result};
use crate::model::{
    InstanceId, InstanceStatus, JourneyId, JourneyInstance, LocationPatch, LocationReport,
    MemberIdentity, MemberSnapshot, RideEvent, UserId,
};
use crate::presence::PresenceState;
use crate::registry::SessionRegistry;
use crate::room::{Push, Room, RoomSubscription, StatusChange, DEFAULT_ROOM_CAPACITY};

/// Default minimum spacing between accepted fixes of one instance.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(2000);

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Broadcast capacity of each room.
    pub room_capacity: usize,
    /// Minimum spacing between accepted fixes of one instance.
    pub update_interval: Duration,
    /// Whether to delete rooms when their last connection leaves.
    pub auto_delete_empty_rooms: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            room_capacity: DEFAULT_ROOM_CAPACITY,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            auto_delete_empty_rooms: true,
        }
    }
}

/// Outcome of [`BroadcastHub::publish_location`].
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Persisted and broadcast.
    Accepted {
        patch: LocationPatch,
        recipients: usize,
    },
    /// Dropped as implausible. Nothing was persisted or broadcast.
    Filtered,
    /// Arrived inside the instance's rate window. Retry after the given wait.
    Throttled { retry_after: Duration },
}

/// Per-instance rate gate. Held across persist → invalidate → publish so one
/// instance's patches leave in acceptance order.
#[derive(Debug, Default)]
struct RateGate {
    last_accepted: Option<Instant>,
}

/// Undoes a room subscription unless the join that made it completes.
///
/// A join future dropped mid-flight would otherwise leave the connection in
/// the room's presence and in the connection index.
struct PendingJoin<'a> {
    hub: &'a BroadcastHub,
    journey_id: JourneyId,
    connection_id: &'a str,
    completed: bool,
}

impl Drop for PendingJoin<'_> {
    fn drop(&mut self) {
        if !self.completed {
            debug!(
                journey = %self.journey_id,
                connection = %self.connection_id,
                "Join abandoned, leaving room"
            );
            self.hub.remove_from_room(self.journey_id, self.connection_id);
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Number of live rooms.
    pub room_count: usize,
    /// Number of connections in at least one room.
    pub connection_count: usize,
    /// Total room memberships.
    pub total_memberships: usize,
    /// Instances with a rate gate.
    pub gate_count: usize,
}

/// The realtime broadcast hub.
pub struct BroadcastHub {
    registry: Arc<SessionRegistry>,
    cache: Arc<StateCache>,
    /// Rooms indexed by journey.
    rooms: DashMap<JourneyId, Room>,
    /// Connection memberships (connection_id -> journeys joined).
    connections: DashMap<String, DashSet<JourneyId>>,
    gates: DashMap<InstanceId, Arc<Mutex<RateGate>>>,
    config: HubConfig,
}

impl BroadcastHub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, cache: Arc<StateCache>) -> Self {
        Self::with_config(registry, cache, HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(
        registry: Arc<SessionRegistry>,
        cache: Arc<StateCache>,
        config: HubConfig,
    ) -> Self {
        info!("Creating broadcast hub with config: {:?}", config);
        Self {
            registry,
            cache,
            rooms: DashMap::new(),
            connections: DashMap::new(),
            gates: DashMap::new(),
            config,
        }
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            room_count: self.rooms.len(),
            connection_count: self.connections.len(),
            total_memberships: self.connections.iter().map(|c| c.len()).sum(),
            gate_count: self.gates.len(),
        }
    }

    #[must_use]
    pub fn room_exists(&self, journey_id: JourneyId) -> bool {
        self.rooms.contains_key(&journey_id)
    }

    #[must_use]
    pub fn occupant_count(&self, journey_id: JourneyId) -> usize {
        self.rooms
            .get(&journey_id)
            .map(|r| r.occupant_count())
            .unwrap_or(0)
    }

    /// Connections currently in a journey's room.
    #[must_use]
    pub fn online(&self, journey_id: JourneyId) -> Vec<PresenceState> {
        self.rooms
            .get(&journey_id)
            .map(|r| r.presence().snapshot())
            .unwrap_or_default()
    }

    /// Journeys a connection has joined.
    #[must_use]
    pub fn connection_journeys(&self, connection_id: &str) -> Vec<JourneyId> {
        self.connections
            .get(connection_id)
            .map(|s| s.iter().map(|j| *j).collect())
            .unwrap_or_default()
    }

    // ----- membership ----------------------------------------------------

    /// Join a connection to a journey's room.
    ///
    /// Returns the current snapshot, with the online roster filled in, and
    /// the connection's notification stream. Existing occupants get a
    /// presence notification.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::Forbidden`] for non-members,
    /// [`ConvoyError::Timeout`] if authorization does not complete in time,
    /// [`ConvoyError::Conflict`] if the connection is already in the room.
    pub async fn join(
        &self,
        journey_id: JourneyId,
        connection_id: &str,
        identity: &MemberIdentity,
    ) -> Result<(MemberSnapshot, RoomSubscription)> {
        self.registry
            .authorize_journey_member(journey_id, &identity.user_id)
            .await?;

        let (subscription, member) = {
            let mut room = self.rooms.entry(journey_id).or_insert_with(|| {
                debug!(journey = %journey_id, "Creating room");
                Room::with_capacity(journey_id, self.config.room_capacity)
            });
            if room.is_occupied_by(connection_id) {
                return Err(ConvoyError::conflict(format!(
                    "connection {connection_id} already joined journey {journey_id}"
                )));
            }
            room.subscribe(connection_id, identity)
        };
        self.connections
            .entry(connection_id.to_string())
            .or_default()
            .insert(journey_id);
        let mut pending = PendingJoin {
            hub: self,
            journey_id,
            connection_id,
            completed: false,
        };

        // Subscribed before reading, so nothing published in between is lost.
        let mut snapshot = self.cache.snapshot(journey_id).await?;
        snapshot.online = self.online(journey_id);
        pending.completed = true;

        self.broadcast(
            journey_id,
            Push::Presence {
                action: PresenceAction::Joined,
                member,
            },
            None,
            Some(connection_id.to_string()),
        );

        debug!(
            journey = %journey_id,
            connection = %connection_id,
            user = %identity.user_id,
            members = snapshot.members.len(),
            "Joined journey room"
        );
        Ok((snapshot, subscription))
    }

    /// Remove a connection from a room and tell the remaining occupants.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::NotFound`] if the connection is not in the room.
    pub fn leave(&self, journey_id: JourneyId, connection_id: &str) -> Result<()> {
        let state = self.remove_from_room(journey_id, connection_id).ok_or_else(|| {
            ConvoyError::not_found(format!(
                "connection {connection_id} is not in journey {journey_id}"
            ))
        })?;

        self.broadcast(
            journey_id,
            Push::Presence {
                action: PresenceAction::Left,
                member: state,
            },
            None,
            None,
        );
        Ok(())
    }

    /// Handle an abrupt connection loss.
    ///
    /// Emits a `Disconnected` presence in every room the connection was in.
    /// Instances are not touched: a rider stays ACTIVE across network loss.
    /// Returns the number of rooms left.
    pub fn disconnect(&self, connection_id: &str) -> usize {
        let Some((_, journeys)) = self.connections.remove(connection_id) else {
            return 0;
        };

        let mut left = 0;
        for journey_id in journeys {
            if let Some(state) = self.unsubscribe_room(journey_id, connection_id) {
                left += 1;
                self.broadcast(
                    journey_id,
                    Push::Presence {
                        action: PresenceAction::Disconnected,
                        member: state,
                    },
                    None,
                    None,
                );
            }
        }

        debug!(connection = %connection_id, rooms = left, "Connection disconnected");
        left
    }

    /// Record activity for a connection in every room it joined.
    pub fn touch(&self, connection_id: &str) {
        for journey_id in self.connection_journeys(connection_id) {
            if let Some(mut room) = self.rooms.get_mut(&journey_id) {
                room.presence_mut().touch(connection_id);
            }
        }
    }

    /// Drop connections silent for longer than `timeout`.
    pub fn prune_stale(&self, timeout: Duration) -> Vec<(JourneyId, PresenceState)> {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.prune_stale_at(timeout, now_ms)
    }

    /// [`Self::prune_stale`] against an explicit clock, Unix milliseconds.
    ///
    /// Also forgets rate gates left idle past the update interval.
    pub fn prune_stale_at(
        &self,
        timeout: Duration,
        now_ms: u64,
    ) -> Vec<(JourneyId, PresenceState)> {
        self.prune_idle_gates();

        let journeys: Vec<JourneyId> = self.rooms.iter().map(|r| *r.key()).collect();

        let mut pruned = Vec::new();
        for journey_id in journeys {
            let stale = match self.rooms.get_mut(&journey_id) {
                Some(mut room) => room.presence_mut().prune_stale_at(timeout, now_ms),
                None => continue,
            };

            for state in stale {
                if let Some(joined) = self.connections.get(&state.connection_id) {
                    joined.remove(&journey_id);
                }
                self.connections
                    .remove_if(&state.connection_id, |_, joined| joined.is_empty());
                self.broadcast(
                    journey_id,
                    Push::Presence {
                        action: PresenceAction::Disconnected,
                        member: state.clone(),
                    },
                    None,
                    None,
                );
                pruned.push((journey_id, state));
            }
            self.delete_if_empty(journey_id);
        }

        if !pruned.is_empty() {
            debug!(count = pruned.len(), "Pruned stale connections");
        }
        pruned
    }

    fn remove_from_room(
        &self,
        journey_id: JourneyId,
        connection_id: &str,
    ) -> Option<PresenceState> {
        if let Some(joined) = self.connections.get(connection_id) {
            joined.remove(&journey_id);
        }
        self.connections
            .remove_if(connection_id, |_, joined| joined.is_empty());
        self.unsubscribe_room(journey_id, connection_id)
    }

    fn unsubscribe_room(
        &self,
        journey_id: JourneyId,
        connection_id: &str,
    ) -> Option<PresenceState> {
        let state = self
            .rooms
            .get_mut(&journey_id)
            .and_then(|mut room| room.unsubscribe(connection_id));
        self.delete_if_empty(journey_id);
        state
    }

    fn delete_if_empty(&self, journey_id: JourneyId) {
        if self.config.auto_delete_empty_rooms
            && self.rooms.remove_if(&journey_id, |_, room| room.is_empty()).is_some()
        {
            debug!(journey = %journey_id, "Deleted empty room");
        }
    }

    // ----- publishing ----------------------------------------------------

    /// Record and fan out a fix.
    ///
    /// At most one fix per instance is accepted per update interval. The
    /// patch goes to every connection in the room except the publisher's.
    ///
    /// # Errors
    ///
    /// As [`SessionRegistry::update_instance_location`]. Throttling and
    /// filtering are outcomes, not errors.
    pub async fn publish_location(
        &self,
        instance_id: InstanceId,
        caller_id: &str,
        report: LocationReport,
    ) -> Result<PublishOutcome> {
        report.validate()?;

        // Ownership first, so a throttle reply never leaks instance existence.
        let instance = self.registry.authorize_owner(instance_id, caller_id).await?;
        if instance.status != InstanceStatus::Active {
            return Err(ConvoyError::conflict(format!(
                "instance {instance_id} is {:?}, not ACTIVE",
                instance.status
            )));
        }

        let gate = self.gates.entry(instance_id).or_default().value().clone();
        let mut gate = gate.lock().await;

        if let Some(last) = gate.last_accepted {
            let elapsed = last.elapsed();
            if elapsed < self.config.update_interval {
                let retry_after = self.config.update_interval - elapsed;
                trace!(
                    instance = %instance_id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Location update throttled"
                );
                return Ok(PublishOutcome::Throttled { retry_after });
            }
        }

        let update = self
            .registry
            .update_instance_location(instance_id, caller_id, report)
            .await?;
        if !update.accepted {
            return Ok(PublishOutcome::Filtered);
        }
        gate.last_accepted = Some(Instant::now());

        self.cache
            .invalidate_member(update.instance.journey_id, &update.instance.user_id)
            .await;

        let patch = LocationPatch::from_instance(&update.instance);
        let recipients = self.broadcast(
            patch.journey_id,
            Push::LocationUpdated(patch.clone()),
            Some(patch.user_id.clone()),
            None,
        );

        trace!(instance = %instance_id, recipients, "Location patch published");
        Ok(PublishOutcome::Accepted { patch, recipients })
    }

    /// Full snapshot on demand, for resync after a reconnect or a lag.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::Forbidden`] for non-members, [`ConvoyError::NotFound`].
    pub async fn request_snapshot(
        &self,
        journey_id: JourneyId,
        caller_id: &str,
    ) -> Result<MemberSnapshot> {
        self.registry
            .authorize_journey_member(journey_id, caller_id)
            .await?;
        let mut snapshot = self.cache.snapshot(journey_id).await?;
        snapshot.online = self.online(journey_id);
        Ok(snapshot)
    }

    /// Announce an instance status transition to its room.
    pub fn publish_status(&self, instance: &JourneyInstance) -> usize {
        if instance.status.is_terminal() {
            self.evict_gate(instance.id);
        }
        self.broadcast(
            instance.journey_id,
            Push::StatusChanged(StatusChange::from_instance(instance)),
            None,
            None,
        )
    }

    /// Announce a new timeline event to its room, once.
    pub fn publish_event(&self, event: &RideEvent) -> usize {
        self.broadcast(event.journey_id, Push::EventAppended(event.clone()), None, None)
    }

    /// Forget an instance's rate gate.
    pub fn evict_gate(&self, instance_id: InstanceId) {
        if self.gates.remove(&instance_id).is_some() {
            trace!(instance = %instance_id, "Evicted rate gate");
        }
    }

    /// Forget gates that no publish holds and whose window has passed.
    ///
    /// Covers instances that stop publishing without ever completing.
    /// Returns the number of gates removed.
    pub fn prune_idle_gates(&self) -> usize {
        let interval = self.config.update_interval;
        let before = self.gates.len();
        self.gates.retain(|_, gate| {
            if Arc::strong_count(gate) > 1 {
                return true;
            }
            gate.try_lock()
                .map(|g| g.last_accepted.is_some_and(|at| at.elapsed() < interval))
                .unwrap_or(true)
        });
        let pruned = before.saturating_sub(self.gates.len());
        if pruned > 0 {
            trace!(count = pruned, "Pruned idle rate gates");
        }
        pruned
    }

    fn broadcast(
        &self,
        journey_id: JourneyId,
        push: Push,
        exclude_user: Option<UserId>,
        exclude_connection: Option<String>,
    ) -> usize {
        match self.rooms.get(&journey_id) {
            Some(room) => room.publish(push, exclude_user, exclude_connection),
            None => {
                trace!(journey = %journey_id, "No room to publish to");
                0
            }
        }
    }
}
