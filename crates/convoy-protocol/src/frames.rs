//! Frame types for the Convoy protocol.
//!
//! Frames are the unit of communication on the push channel between a
//! rider's client and the server. Each frame is serialized using MessagePack.
//! Domain bodies (snapshots, patches, events) travel as self-describing
//! values so the wire format does not pin the engine's internal types.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Join = 0x03,
    Leave = 0x04,
    UpdateLocation = 0x05,
    RequestSnapshot = 0x06,
    Snapshot = 0x07,
    LocationUpdated = 0x08,
    Presence = 0x09,
    StatusChanged = 0x0A,
    EventAppended = 0x0B,
    Throttled = 0x0C,
    Ack = 0x0D,
    Error = 0x0E,
    Ping = 0x0F,
    Pong = 0x10,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Join),
            0x04 => Ok(FrameType::Leave),
            0x05 => Ok(FrameType::UpdateLocation),
            0x06 => Ok(FrameType::RequestSnapshot),
            0x07 => Ok(FrameType::Snapshot),
            0x08 => Ok(FrameType::LocationUpdated),
            0x09 => Ok(FrameType::Presence),
            0x0A => Ok(FrameType::StatusChanged),
            0x0B => Ok(FrameType::EventAppended),
            0x0C => Ok(FrameType::Throttled),
            0x0D => Ok(FrameType::Ack),
            0x0E => Ok(FrameType::Error),
            0x0F => Ok(FrameType::Ping),
            0x10 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Presence action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PresenceAction {
    /// A member joined the journey room.
    Joined = 0,
    /// A member explicitly left the room.
    Left = 1,
    /// A member's connection dropped or went silent.
    Disconnected = 2,
}

impl From<PresenceAction> for u8 {
    fn from(pa: PresenceAction) -> u8 {
        pa as u8
    }
}

impl TryFrom<u8> for PresenceAction {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceAction::Joined),
            1 => Ok(PresenceAction::Left),
            2 => Ok(PresenceAction::Disconnected),
            _ => Err("Invalid presence action"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial handshake carrying the session token.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version.
        version: u8,
        /// Session token, verified by the identity collaborator.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Connection established and authenticated.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Authenticated user.
        user_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Join a journey room.
    #[serde(rename = "join")]
    Join {
        /// Request ID for the response.
        id: u64,
        /// Journey to join.
        journey_id: String,
    },

    /// Leave a journey room.
    #[serde(rename = "leave")]
    Leave {
        /// Request ID for the response.
        id: u64,
        /// Journey to leave.
        journey_id: String,
    },

    /// Report a new position for the caller's instance.
    #[serde(rename = "update_location")]
    UpdateLocation {
        /// Request ID for the response.
        id: u64,
        /// Instance being tracked.
        instance_id: String,
        latitude: f64,
        longitude: f64,
        /// Speed in km/h as measured by the device.
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        /// Heading in degrees.
        #[serde(skip_serializing_if = "Option::is_none")]
        heading: Option<f64>,
        /// Cumulative distance in kilometers as tracked by the device.
        #[serde(skip_serializing_if = "Option::is_none")]
        client_distance: Option<f64>,
        /// Fix time in Unix milliseconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        recorded_at: Option<i64>,
    },

    /// Ask for the full member snapshot of a journey.
    #[serde(rename = "request_snapshot")]
    RequestSnapshot {
        /// Request ID for the response.
        id: u64,
        /// Journey to snapshot.
        journey_id: String,
    },

    /// Full member snapshot, in response to a join or snapshot request.
    #[serde(rename = "snapshot")]
    Snapshot {
        /// ID of the request this answers.
        id: u64,
        /// Journey the snapshot describes.
        journey_id: String,
        /// Snapshot body.
        snapshot: serde_json::Value,
    },

    /// Incremental patch for one instance.
    #[serde(rename = "location_updated")]
    LocationUpdated {
        journey_id: String,
        patch: serde_json::Value,
    },

    /// Presence change in a room.
    #[serde(rename = "presence")]
    Presence {
        journey_id: String,
        action: PresenceAction,
        member: serde_json::Value,
    },

    /// An instance changed status (paused, resumed, completed).
    #[serde(rename = "status_changed")]
    StatusChanged {
        journey_id: String,
        instance: serde_json::Value,
    },

    /// A timeline event was appended.
    #[serde(rename = "event_appended")]
    EventAppended {
        journey_id: String,
        event: serde_json::Value,
    },

    /// A location update arrived inside the per-instance rate window.
    #[serde(rename = "throttled")]
    Throttled {
        /// ID of the throttled request.
        id: u64,
        /// Milliseconds until the next update will be accepted.
        retry_after_ms: u64,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Numeric error code.
        code: u16,
        /// Machine-readable error kind.
        kind: String,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Join { .. } => FrameType::Join,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::UpdateLocation { .. } => FrameType::UpdateLocation,
            Frame::RequestSnapshot { .. } => FrameType::RequestSnapshot,
            Frame::Snapshot { .. } => FrameType::Snapshot,
            Frame::LocationUpdated { .. } => FrameType::LocationUpdated,
            Frame::Presence { .. } => FrameType::Presence,
            Frame::StatusChanged { .. } => FrameType::StatusChanged,
            Frame::EventAppended { .. } => FrameType::EventAppended,
            Frame::Throttled { .. } => FrameType::Throttled,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Whether a client is allowed to send this frame.
    #[must_use]
    pub fn is_client_frame(&self) -> bool {
        matches!(
            self,
            Frame::Connect { .. }
                | Frame::Join { .. }
                | Frame::Leave { .. }
                | Frame::UpdateLocation { .. }
                | Frame::RequestSnapshot { .. }
                | Frame::Ping { .. }
                | Frame::Pong { .. }
        )
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>) -> Self {
        Frame::Connect { version, token }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        version: u8,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(id: u64, journey_id: impl Into<String>) -> Self {
        Frame::Join {
            id,
            journey_id: journey_id.into(),
        }
    }

    /// Create a new Leave frame.
    #[must_use]
    pub fn leave(id: u64, journey_id: impl Into<String>) -> Self {
        Frame::Leave {
            id,
            journey_id: journey_id.into(),
        }
    }

    /// Create a location update with only the mandatory fields set.
    #[must_use]
    pub fn update_location(
        id: u64,
        instance_id: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Frame::UpdateLocation {
            id,
            instance_id: instance_id.into(),
            latitude,
            longitude,
            speed: None,
            heading: None,
            client_distance: None,
            recorded_at: None,
        }
    }

    /// Create a new RequestSnapshot frame.
    #[must_use]
    pub fn request_snapshot(id: u64, journey_id: impl Into<String>) -> Self {
        Frame::RequestSnapshot {
            id,
            journey_id: journey_id.into(),
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create a new Throttled frame.
    #[must_use]
    pub fn throttled(id: u64, retry_after_ms: u64) -> Self {
        Frame::Throttled { id, retry_after_ms }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}
