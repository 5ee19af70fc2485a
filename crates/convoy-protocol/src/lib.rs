//! # convoy-protocol
//!
//! Wire protocol for the Convoy push channel.
//!
//! Clients join a journey room, stream their own position, and receive
//! incremental patches, presence changes and timeline events for the other
//! riders in the room.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Session handshake
//! - `Join` / `Leave` - Journey room membership
//! - `UpdateLocation` - Position report for the caller's own instance
//! - `RequestSnapshot` / `Snapshot` - Full resync after reconnect
//! - `LocationUpdated` / `Presence` / `StatusChanged` / `EventAppended` - Pushes
//! - `Ack` / `Error` / `Throttled` - Responses
//!
//! ## Example
//!
//! ```rust
//! use convoy_protocol::{Frame, codec};
//!
//! let frame = Frame::update_location(1, "instance-id", 52.52, 13.405);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, FrameType, PresenceAction};
pub use version::{Version, PROTOCOL_VERSION};
