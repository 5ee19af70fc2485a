//! # convoy-core
//!
//! The group journey synchronization engine.
//!
//! Several people ride together; each tracks their own progress while
//! watching everyone else's live position. This crate provides:
//!
//! - **Registry** - Journey and instance lifecycle, the single source of truth
//! - **GPS** - Distance math, outlier filtering, client distance reconciliation
//! - **Cache** - Read-through snapshots, invalidated on every mutation
//! - **Hub** - Per-journey rooms, presence and rate-limited patch fan-out
//! - **Timeline** - Append-only ride events pushed through the same rooms
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────┐
//!                    │   Convoy    │
//!                    └─────────────┘
//!          ┌────────────┬────┴──────┬─────────────┐
//!          ▼            ▼           ▼             ▼
//!   ┌────────────┐ ┌─────────┐ ┌──────────┐ ┌──────────┐
//!   │  Registry  │◀│  Cache  │◀│   Hub    │◀│ Timeline │
//!   └────────────┘ └─────────┘ └──────────┘ └──────────┘
//!     │        │                    │
//!     ▼        ▼                    ▼
//! ┌───────┐ ┌─────┐          ┌─────────────┐
//! │ Store │ │ GPS │          │Room/Presence│
//! └───────┘ └─────┘          └─────────────┘
//! ```

pub mod cache;
pub mod directory;
pub mod engine;
pub mod error;
pub mod gps;
pub mod hub;
pub mod model;
pub mod presence;
pub mod registry;
pub mod room;
pub mod store;
pub mod timeline;

pub use cache::{CacheBackend, CacheConfig, CacheError, CacheStats, MemoryCacheBackend, StateCache};
pub use directory::{DirectoryError, IdentityVerifier, MembershipDirectory, MemoryDirectory};
pub use engine::{Convoy, ConvoyConfig};
pub use error::{ConvoyError, ErrorKind, Result};
pub use gps::{DistanceSource, GpsSanitizer, ReconciledDistance};
pub use hub::{BroadcastHub, HubConfig, HubStats, PublishOutcome};
pub use model::{
    CompletionRecord, Coordinates, EventBody, EventType, GroupJourney, InstanceId, InstanceStatus,
    JourneyId, JourneyInstance, JourneyStatus, LocationPatch, LocationReport, MemberIdentity,
    MemberRole, MemberSnapshot, MemberState, RideEvent, RoutePoint,
};
pub use presence::{Presence, PresenceState};
pub use registry::{CompletionFeed, LocationUpdate, NewJourney, SessionRegistry};
pub use room::{Notification, Push, Room, RoomSubscription, StatusChange, SubscriptionError};
pub use store::{JourneyStore, MemoryStore, Page, StoreError};
pub use timeline::{EventTimeline, NewEvent};
