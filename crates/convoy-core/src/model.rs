//! Domain records for group journeys.
//!
//! The registry persists [`GroupJourney`], [`JourneyInstance`] and
//! [`RideEvent`]; everything else here is a projection or a message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConvoyError, Result};
use crate::presence::PresenceState;

/// Journey identifier.
pub type JourneyId = Uuid;
/// Instance identifier.
pub type InstanceId = Uuid;
/// Timeline event identifier.
pub type EventId = Uuid;
/// User identifier issued by the identity collaborator.
pub type UserId = String;
/// Group identifier issued by the membership directory.
pub type GroupId = String;

/// Round to two decimals, the precision distances are reported at.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// A WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Reject non-finite or out-of-range coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`ConvoyError::Validation`] naming the offending axis.
    pub fn validate(&self) -> Result<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ConvoyError::validation(format!(
                "latitude {} out of range",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ConvoyError::validation(format!(
                "longitude {} out of range",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// Status of a shared journey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JourneyStatus {
    Active,
    Completed,
    Cancelled,
}

/// Status of one member's instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Active,
    Paused,
    Completed,
}

impl InstanceStatus {
    /// Completed instances are immutable.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Completed)
    }
}

/// Role of a user within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    /// Owners and admins may start and end group journeys.
    #[must_use]
    pub fn can_manage(self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Admin)
    }
}

/// Stable identity of a user, as yielded by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberIdentity {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl MemberIdentity {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    #[must_use]
    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}

/// A shared journey. Holds a destination only; riders bring their own start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupJourney {
    pub id: JourneyId,
    pub group_id: GroupId,
    pub creator_id: UserId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub destination: Coordinates,
    pub status: JourneyStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A single accepted GPS fix on an instance's route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub coordinates: Coordinates,
    pub recorded_at: DateTime<Utc>,
    /// Device-reported speed in km/h.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Heading in degrees clockwise from north.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
}

impl RoutePoint {
    #[must_use]
    pub fn new(coordinates: Coordinates, recorded_at: DateTime<Utc>) -> Self {
        Self {
            coordinates,
            recorded_at,
            speed: None,
            heading: None,
        }
    }
}

/// One member's personal progress within a group journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyInstance {
    pub id: InstanceId,
    pub journey_id: JourneyId,
    pub user_id: UserId,
    pub status: InstanceStatus,
    pub start: Coordinates,
    pub current: Coordinates,
    pub distance_km: f64,
    pub moving_seconds: f64,
    pub average_speed_kmh: f64,
    pub top_speed_kmh: f64,
    pub route: Vec<RoutePoint>,
    pub started_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set by a resume: the next accepted fix opens a new segment instead of
    /// extending the one that ended at the pause.
    #[serde(default, skip_serializing)]
    pub segment_break: bool,
}

impl JourneyInstance {
    /// The fix the next update is measured against.
    #[must_use]
    pub fn last_point(&self) -> Option<&RoutePoint> {
        self.route.last()
    }

    /// Distance as reported to clients.
    #[must_use]
    pub fn reported_distance_km(&self) -> f64 {
        round2(self.distance_km)
    }
}

/// Position report for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    pub coordinates: Coordinates,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    /// Cumulative distance in km as tracked by the device.
    #[serde(default)]
    pub client_distance_km: Option<f64>,
    /// Device fix time; the server's clock is used when absent.
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl LocationReport {
    #[must_use]
    pub fn at(coordinates: Coordinates) -> Self {
        Self {
            coordinates,
            speed: None,
            heading: None,
            client_distance_km: None,
            recorded_at: None,
        }
    }

    #[must_use]
    pub fn recorded_at(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    #[must_use]
    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    #[must_use]
    pub fn with_client_distance(mut self, km: f64) -> Self {
        self.client_distance_km = Some(km);
        self
    }

    /// Validate coordinates and the optional measurements.
    ///
    /// # Errors
    ///
    /// Returns [`ConvoyError::Validation`] on the first bad field.
    pub fn validate(&self) -> Result<()> {
        self.coordinates.validate()?;
        if let Some(speed) = self.speed {
            if !speed.is_finite() || speed < 0.0 {
                return Err(ConvoyError::validation(format!("speed {speed} is invalid")));
            }
        }
        if let Some(heading) = self.heading {
            if !heading.is_finite() || !(0.0..360.0).contains(&heading) {
                return Err(ConvoyError::validation(format!(
                    "heading {heading} is outside [0, 360)"
                )));
            }
        }
        if let Some(km) = self.client_distance_km {
            if !km.is_finite() || km < 0.0 {
                return Err(ConvoyError::validation(format!(
                    "client distance {km} is invalid"
                )));
            }
        }
        Ok(())
    }
}

/// Closed set of timeline event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Message,
    Photo,
    Checkpoint,
    Status,
    Emergency,
    Custom,
}

impl std::str::FromStr for EventType {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MESSAGE" => Ok(EventType::Message),
            "PHOTO" => Ok(EventType::Photo),
            "CHECKPOINT" => Ok(EventType::Checkpoint),
            "STATUS" => Ok(EventType::Status),
            "EMERGENCY" => Ok(EventType::Emergency),
            "CUSTOM" => Ok(EventType::Custom),
            other => Err(ConvoyError::validation(format!("unknown event type {other:?}"))),
        }
    }
}

/// Typed body of a timeline event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventBody {
    Message {
        text: String,
    },
    Photo {
        media_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Checkpoint {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Status {
        status: String,
    },
    Emergency {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Forward-compatible escape hatch for client-defined events.
    Custom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl EventBody {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            EventBody::Message { .. } => EventType::Message,
            EventBody::Photo { .. } => EventType::Photo,
            EventBody::Checkpoint { .. } => EventType::Checkpoint,
            EventBody::Status { .. } => EventType::Status,
            EventBody::Emergency { .. } => EventType::Emergency,
            EventBody::Custom { .. } => EventType::Custom,
        }
    }
}

/// Immutable timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideEvent {
    pub id: EventId,
    pub journey_id: JourneyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    pub user_id: UserId,
    #[serde(flatten)]
    pub body: EventBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    pub created_at: DateTime<Utc>,
}

/// One entry of a member snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberState {
    pub member: MemberIdentity,
    pub instance: JourneyInstance,
}

/// Full current state of every instance of a journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSnapshot {
    pub journey: GroupJourney,
    pub members: Vec<MemberState>,
    /// Connections currently in the journey room. Filled in by the hub.
    #[serde(default)]
    pub online: Vec<PresenceState>,
    pub generated_at: DateTime<Utc>,
}

impl MemberSnapshot {
    /// Find a member's most recent instance.
    #[must_use]
    pub fn member(&self, user_id: &str) -> Option<&MemberState> {
        self.members
            .iter()
            .filter(|m| m.instance.user_id == user_id)
            .max_by_key(|m| m.instance.started_at)
    }
}

/// Incremental update pushed to room members for one accepted fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPatch {
    pub journey_id: JourneyId,
    pub instance_id: InstanceId,
    pub user_id: UserId,
    pub coordinates: Coordinates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    pub distance_km: f64,
    pub moving_seconds: f64,
    pub average_speed_kmh: f64,
    pub top_speed_kmh: f64,
    pub recorded_at: DateTime<Utc>,
}

impl LocationPatch {
    /// Build the patch for the newest route point of an instance.
    #[must_use]
    pub fn from_instance(instance: &JourneyInstance) -> Self {
        let point = instance.last_point();
        Self {
            journey_id: instance.journey_id,
            instance_id: instance.id,
            user_id: instance.user_id.clone(),
            coordinates: instance.current,
            speed: point.and_then(|p| p.speed),
            heading: point.and_then(|p| p.heading),
            distance_km: instance.reported_distance_km(),
            moving_seconds: instance.moving_seconds.round(),
            average_speed_kmh: round2(instance.average_speed_kmh),
            top_speed_kmh: round2(instance.top_speed_kmh),
            recorded_at: point.map_or(instance.last_update_at, |p| p.recorded_at),
        }
    }
}

/// Final statistics of a completed instance, for the gamification feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub instance_id: InstanceId,
    pub journey_id: JourneyId,
    pub user_id: UserId,
    pub distance_km: f64,
    pub moving_seconds: f64,
    pub average_speed_kmh: f64,
    pub top_speed_kmh: f64,
    pub completed_at: DateTime<Utc>,
}

impl CompletionRecord {
    #[must_use]
    pub fn from_instance(instance: &JourneyInstance) -> Self {
        Self {
            instance_id: instance.id,
            journey_id: instance.journey_id,
            user_id: instance.user_id.clone(),
            distance_km: instance.reported_distance_km(),
            moving_seconds: instance.moving_seconds,
            average_speed_kmh: round2(instance.average_speed_kmh),
            top_speed_kmh: round2(instance.top_speed_kmh),
            completed_at: instance.completed_at.unwrap_or(instance.last_update_at),
        }
    }
}
