//! Journey rooms.
//!
//! One room per group journey. Connections that explicitly joined receive
//! every notification published to the room, except the ones addressed
//! away from them (a rider never receives the patch for their own fix).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use convoy_protocol::PresenceAction;

use crate::model::{
    round2, InstanceId, InstanceStatus, JourneyId, JourneyInstance, LocationPatch, MemberIdentity,
    RideEvent, UserId,
};
use crate::presence::{Presence, PresenceState};

/// Default broadcast capacity per room.
pub const DEFAULT_ROOM_CAPACITY: usize = 256;

/// Instance status transition announced to the room.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub instance_id: InstanceId,
    pub user_id: UserId,
    pub status: InstanceStatus,
    pub distance_km: f64,
    pub moving_seconds: f64,
    pub average_speed_kmh: f64,
    pub top_speed_kmh: f64,
    pub changed_at: DateTime<Utc>,
}

impl StatusChange {
    #[must_use]
    pub fn from_instance(instance: &JourneyInstance) -> Self {
        Self {
            instance_id: instance.id,
            user_id: instance.user_id.clone(),
            status: instance.status,
            distance_km: instance.reported_distance_km(),
            moving_seconds: instance.moving_seconds,
            average_speed_kmh: round2(instance.average_speed_kmh),
            top_speed_kmh: round2(instance.top_speed_kmh),
            changed_at: instance.last_update_at,
        }
    }
}

/// What a notification carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    LocationUpdated(LocationPatch),
    Presence {
        action: PresenceAction,
        member: PresenceState,
    },
    StatusChanged(StatusChange),
    EventAppended(RideEvent),
}

/// A notification delivered to room subscribers.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Per-room sequence number, in publish order.
    pub sequence: u64,
    pub journey_id: JourneyId,
    /// Connections of this user do not receive the notification.
    pub exclude_user: Option<UserId>,
    /// This connection does not receive the notification.
    pub exclude_connection: Option<String>,
    pub push: Push,
}

impl Notification {
    /// Whether the given connection should receive this notification.
    #[must_use]
    pub fn is_visible_to(&self, connection_id: &str, user_id: &str) -> bool {
        self.exclude_user.as_deref() != Some(user_id)
            && self.exclude_connection.as_deref() != Some(connection_id)
    }
}

/// Errors surfaced by a [`RoomSubscription`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The subscriber fell behind and missed notifications; resync with a
    /// snapshot.
    #[error("Subscriber lagged by {0} notifications")]
    Lagged(u64),

    /// The room was closed.
    #[error("Room closed")]
    Closed,
}

/// A connection's view of a room's notification stream.
#[derive(Debug)]
pub struct RoomSubscription {
    journey_id: JourneyId,
    connection_id: String,
    user_id: UserId,
    receiver: broadcast::Receiver<Arc<Notification>>,
}

impl RoomSubscription {
    #[must_use]
    pub fn journey_id(&self) -> JourneyId {
        self.journey_id
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Wait for the next notification addressed to this connection.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Lagged`] if notifications were dropped,
    /// or [`SubscriptionError::Closed`] once the room is gone.
    pub async fn recv(&mut self) -> Result<Arc<Notification>, SubscriptionError> {
        loop {
            match self.receiver.recv().await {
                Ok(n) if n.is_visible_to(&self.connection_id, &self.user_id) => return Ok(n),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(SubscriptionError::Lagged(missed))
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }

    /// Take the next pending notification without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Notification>> {
        loop {
            match self.receiver.try_recv() {
                Ok(n) if n.is_visible_to(&self.connection_id, &self.user_id) => return Some(n),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// A journey room.
#[derive(Debug)]
pub struct Room {
    journey_id: JourneyId,
    sender: broadcast::Sender<Arc<Notification>>,
    presence: Presence,
    sequence: AtomicU64,
}

impl Room {
    /// Create a room with the default capacity.
    #[must_use]
    pub fn new(journey_id: JourneyId) -> Self {
        Self::with_capacity(journey_id, DEFAULT_ROOM_CAPACITY)
    }

    /// Create a room with a specific broadcast capacity.
    #[must_use]
    pub fn with_capacity(journey_id: JourneyId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            journey_id,
            sender,
            presence: Presence::new(),
            sequence: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn journey_id(&self) -> JourneyId {
        self.journey_id
    }

    /// Number of connections in the room.
    #[must_use]
    pub fn occupant_count(&self) -> usize {
        self.presence.count()
    }

    #[must_use]
    pub fn is_occupied_by(&self, connection_id: &str) -> bool {
        self.presence.is_present(connection_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.presence.is_empty()
    }

    #[must_use]
    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut Presence {
        &mut self.presence
    }

    /// Add a connection and hand back its notification stream.
    pub fn subscribe(
        &mut self,
        connection_id: &str,
        identity: &MemberIdentity,
    ) -> (RoomSubscription, PresenceState) {
        self.presence.join(connection_id, identity);
        let state = self
            .presence
            .get(connection_id)
            .cloned()
            .unwrap_or_else(|| PresenceState::new(connection_id, identity));

        debug!(journey = %self.journey_id, connection = %connection_id, "Connection joined room");

        let subscription = RoomSubscription {
            journey_id: self.journey_id,
            connection_id: connection_id.to_string(),
            user_id: identity.user_id.clone(),
            receiver: self.sender.subscribe(),
        };
        (subscription, state)
    }

    /// Remove a connection. Returns its presence if it was in the room.
    pub fn unsubscribe(&mut self, connection_id: &str) -> Option<PresenceState> {
        let state = self.presence.leave(connection_id);
        if state.is_some() {
            debug!(journey = %self.journey_id, connection = %connection_id, "Connection left room");
        }
        state
    }

    /// Publish a notification. Returns the number of live receivers.
    pub fn publish(
        &self,
        push: Push,
        exclude_user: Option<UserId>,
        exclude_connection: Option<String>,
    ) -> usize {
        let notification = Notification {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            journey_id: self.journey_id,
            exclude_user,
            exclude_connection,
            push,
        };
        trace!(
            journey = %self.journey_id,
            sequence = notification.sequence,
            "Publishing notification"
        );
        self.sender.send(Arc::new(notification)).unwrap_or_default()
    }
}
