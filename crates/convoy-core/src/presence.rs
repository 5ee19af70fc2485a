//! Presence tracking for journey rooms.
//!
//! Presence records which connections are currently in a room and who they
//! belong to. It is connection state only and never touches instances: a
//! rider whose connection drops stays ACTIVE.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::model::{MemberIdentity, UserId};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Presence state for a single connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    /// Connection ID.
    pub connection_id: String,
    /// Authenticated user behind the connection.
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// When the connection joined, Unix milliseconds.
    pub joined_at: u64,
    /// Last heartbeat or activity, Unix milliseconds.
    pub last_seen: u64,
}

impl PresenceState {
    /// Create a new presence state.
    #[must_use]
    pub fn new(connection_id: impl Into<String>, identity: &MemberIdentity) -> Self {
        let now = now_millis();
        Self {
            connection_id: connection_id.into(),
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            avatar_url: identity.avatar_url.clone(),
            joined_at: now,
            last_seen: now,
        }
    }

    /// Update the last seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = now_millis();
    }

    /// Whether there was no activity for `timeout` as of `now_ms`.
    #[must_use]
    pub fn is_stale_at(&self, timeout: Duration, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen) > timeout.as_millis() as u64
    }

    /// Whether there was no activity for `timeout`.
    #[must_use]
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.is_stale_at(timeout, now_millis())
    }
}

/// Presence tracker for a room.
#[derive(Debug, Default)]
pub struct Presence {
    /// Map of connection ID to presence state.
    members: HashMap<String, PresenceState>,
}

impl Presence {
    /// Create a new presence tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of present connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Check if a connection is present.
    #[must_use]
    pub fn is_present(&self, connection_id: &str) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Whether any connection of `user_id` is present.
    #[must_use]
    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.members.values().any(|s| s.user_id == user_id)
    }

    /// Get the presence state for a connection.
    #[must_use]
    pub fn get(&self, connection_id: &str) -> Option<&PresenceState> {
        self.members.get(connection_id)
    }

    /// Add a connection to presence.
    ///
    /// Returns `true` if this is a new connection, `false` if it rejoined.
    pub fn join(&mut self, connection_id: impl Into<String>, identity: &MemberIdentity) -> bool {
        let conn_id = connection_id.into();
        let state = PresenceState::new(conn_id.clone(), identity);
        let is_new = self.members.insert(conn_id.clone(), state).is_none();

        if is_new {
            debug!(connection = %conn_id, user = %identity.user_id, "Presence: member joined");
        }

        is_new
    }

    /// Remove a connection from presence.
    pub fn leave(&mut self, connection_id: &str) -> Option<PresenceState> {
        let state = self.members.remove(connection_id);
        if state.is_some() {
            debug!(connection = %connection_id, "Presence: member left");
        }
        state
    }

    /// Touch a connection's last seen timestamp.
    pub fn touch(&mut self, connection_id: &str) -> bool {
        if let Some(state) = self.members.get_mut(connection_id) {
            state.touch();
            true
        } else {
            false
        }
    }

    /// Remove connections with no activity for `timeout` as of `now_ms`.
    pub fn prune_stale_at(&mut self, timeout: Duration, now_ms: u64) -> Vec<PresenceState> {
        let stale: Vec<String> = self
            .members
            .iter()
            .filter(|(_, state)| state.is_stale_at(timeout, now_ms))
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|id| {
                debug!(connection = %id, "Presence: pruned stale member");
                self.members.remove(id)
            })
            .collect()
    }

    /// Remove connections with no activity for `timeout`.
    pub fn prune_stale(&mut self, timeout: Duration) -> Vec<PresenceState> {
        self.prune_stale_at(timeout, now_millis())
    }

    /// Presence as a serializable roster, oldest join first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceState> {
        let mut roster: Vec<_> = self.members.values().cloned().collect();
        roster.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.connection_id.cmp(&b.connection_id))
        });
        roster
    }

    /// Check if presence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> MemberIdentity {
        MemberIdentity::new("alice", "Alice").with_avatar("https://cdn/alice.png")
    }

    #[test]
    fn test_presence_join_leave() {
        let mut presence = Presence::new();

        assert!(presence.join("conn-1", &alice()));
        assert!(!presence.join("conn-1", &alice()));

        assert_eq!(presence.count(), 1);
        assert!(presence.is_user_online("alice"));

        let state = presence.leave("conn-1").unwrap();
        assert_eq!(state.display_name, "Alice");
        assert!(!presence.is_present("conn-1"));
        assert!(presence.leave("conn-1").is_none());
    }

    #[test]
    fn test_prune_stale() {
        let mut presence = Presence::new();
        presence.join("conn-1", &alice());
        presence.join("conn-2", &MemberIdentity::new("bob", "Bob"));

        let last_seen = presence.get("conn-2").unwrap().last_seen;
        let timeout = Duration::from_secs(60);

        assert!(presence.prune_stale_at(timeout, last_seen + 1_000).is_empty());

        let pruned = presence.prune_stale_at(timeout, last_seen + 61_000);
        assert_eq!(pruned.len(), 2);
        assert!(presence.is_empty());
    }

    #[test]
    fn test_touch_unknown_connection() {
        let mut presence = Presence::new();
        assert!(!presence.touch("ghost"));
        presence.join("conn-1", &alice());
        assert!(presence.touch("conn-1"));
    }
}
