//! Event timeline.
//!
//! Append-only log of ride events, pushed through the same room as location
//! patches. Posting requires participation (an instance in the journey);
//! reading only requires group membership.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ConvoyError, Result};
use crate::hub::BroadcastHub;
use crate::model::{Coordinates, EventBody, InstanceId, JourneyId, RideEvent};
use crate::registry::SessionRegistry;
use crate::store::Page;

/// Longest accepted message, caption or status text.
pub const MAX_TEXT_LENGTH: usize = 2000;

/// A timeline entry as submitted by a participant.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewEvent {
    /// Defaults to the caller's latest instance in the journey.
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    #[serde(flatten)]
    pub body: EventBody,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
}

impl NewEvent {
    #[must_use]
    pub fn new(body: EventBody) -> Self {
        Self {
            instance_id: None,
            body,
            coordinates: None,
        }
    }

    #[must_use]
    pub fn at(mut self, coordinates: Coordinates) -> Self {
        self.coordinates = Some(coordinates);
        self
    }

    fn validate(&self) -> Result<()> {
        if let Some(coordinates) = &self.coordinates {
            coordinates.validate()?;
        }

        match &self.body {
            EventBody::Message { text } => {
                require_text("text", text)?;
            }
            EventBody::Photo { media_ref, caption } => {
                require_text("media_ref", media_ref)?;
                limit_text("caption", caption.as_deref())?;
            }
            EventBody::Checkpoint { .. } => {
                if self.coordinates.is_none() {
                    return Err(ConvoyError::validation("checkpoint requires coordinates"));
                }
            }
            EventBody::Status { status } => {
                require_text("status", status)?;
            }
            EventBody::Emergency { message } | EventBody::Custom { message, .. } => {
                limit_text("message", message.as_deref())?;
            }
        }
        Ok(())
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ConvoyError::validation(format!("{field} must not be empty")));
    }
    limit_text(field, Some(value))
}

fn limit_text(field: &str, value: Option<&str>) -> Result<()> {
    if value.is_some_and(|v| v.chars().count() > MAX_TEXT_LENGTH) {
        return Err(ConvoyError::validation(format!(
            "{field} exceeds {MAX_TEXT_LENGTH} characters"
        )));
    }
    Ok(())
}

/// The journey timeline.
pub struct EventTimeline {
    registry: Arc<SessionRegistry>,
    hub: Arc<BroadcastHub>,
}

impl EventTimeline {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, hub: Arc<BroadcastHub>) -> Self {
        Self { registry, hub }
    }

    /// Persist an event and push it to the journey room, once.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::Validation`] for malformed bodies,
    /// [`ConvoyError::NotFound`] for unknown journeys, and
    /// [`ConvoyError::Forbidden`] unless the caller holds an instance in the
    /// journey.
    pub async fn append_event(
        &self,
        journey_id: JourneyId,
        caller_id: &str,
        event: NewEvent,
    ) -> Result<RideEvent> {
        event.validate()?;
        self.registry.journey(journey_id).await?;

        let instance_id = match event.instance_id {
            Some(instance_id) => {
                let instance = self.registry.authorize_owner(instance_id, caller_id).await?;
                if instance.journey_id != journey_id {
                    return Err(ConvoyError::validation(format!(
                        "instance {instance_id} belongs to another journey"
                    )));
                }
                instance_id
            }
            None => self
                .registry
                .latest_instance_of(journey_id, caller_id)
                .await?
                .map(|i| i.id)
                .ok_or_else(|| {
                    ConvoyError::forbidden(format!(
                        "{caller_id} has not joined journey {journey_id}"
                    ))
                })?,
        };

        let event = RideEvent {
            id: Uuid::new_v4(),
            journey_id,
            instance_id: Some(instance_id),
            user_id: caller_id.to_string(),
            body: event.body,
            coordinates: event.coordinates,
            created_at: Utc::now(),
        };
        self.registry.record_event(event.clone()).await?;

        let recipients = self.hub.publish_event(&event);
        debug!(
            journey = %journey_id,
            event = %event.id,
            kind = ?event.body.event_type(),
            recipients,
            "Event appended"
        );
        Ok(event)
    }

    /// Events of a journey in creation order.
    ///
    /// # Errors
    ///
    /// [`ConvoyError::Forbidden`] for non-members of the journey's group.
    pub async fn list_events(
        &self,
        journey_id: JourneyId,
        caller_id: &str,
        page: Page,
    ) -> Result<Vec<RideEvent>> {
        self.registry
            .authorize_journey_member(journey_id, caller_id)
            .await?;
        self.registry.events(journey_id, page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCacheBackend, StateCache};
    use crate::directory::MemoryDirectory;
    use crate::error::ErrorKind;
    use crate::model::{EventType, MemberIdentity, MemberRole};
    use crate::registry::NewJourney;
    use crate::room::Push;
    use crate::store::MemoryStore;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        hub: Arc<BroadcastHub>,
        timeline: EventTimeline,
        journey_id: JourneyId,
    }

    async fn fixture() -> Fixture {
        let directory = MemoryDirectory::new();
        directory.add_member("riders", "owner", MemberRole::Owner);
        directory.add_member("riders", "alice", MemberRole::Member);
        directory.add_member("riders", "bob", MemberRole::Member);
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::new(directory),
        ));
        let cache = Arc::new(StateCache::new(
            Arc::new(MemoryCacheBackend::new()),
            registry.clone(),
        ));
        let hub = Arc::new(BroadcastHub::new(registry.clone(), cache));
        let journey_id = registry
            .start_group_journey(
                "owner",
                NewJourney {
                    group_id: "riders".into(),
                    title: "Alps".into(),
                    description: Some("two passes".into()),
                    destination: Coordinates::new(46.0, 8.0),
                },
            )
            .await
            .unwrap()
            .id;
        registry
            .start_member_instance(journey_id, "alice", Coordinates::new(45.0, 7.0))
            .await
            .unwrap();

        Fixture {
            timeline: EventTimeline::new(registry.clone(), hub.clone()),
            registry,
            hub,
            journey_id,
        }
    }

    fn message(text: &str) -> NewEvent {
        NewEvent::new(EventBody::Message { text: text.into() })
    }

    #[tokio::test]
    async fn test_append_requires_participation() {
        let f = fixture().await;

        let err = f
            .timeline
            .append_event(f.journey_id, "bob", message("hello"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let event = f
            .timeline
            .append_event(f.journey_id, "alice", message("hello"))
            .await
            .unwrap();
        assert!(event.instance_id.is_some());
        assert_eq!(event.body.event_type(), EventType::Message);
    }

    #[tokio::test]
    async fn test_members_list_without_instance() {
        let f = fixture().await;
        for text in ["one", "two", "three"] {
            f.timeline
                .append_event(f.journey_id, "alice", message(text))
                .await
                .unwrap();
        }

        let events = f
            .timeline
            .list_events(f.journey_id, "bob", Page::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let err = f
            .timeline
            .list_events(f.journey_id, "mallory", Page::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_event_validation() {
        let f = fixture().await;
        let cases = [
            message("   "),
            message(&"x".repeat(MAX_TEXT_LENGTH + 1)),
            NewEvent::new(EventBody::Photo {
                media_ref: String::new(),
                caption: None,
            }),
            NewEvent::new(EventBody::Checkpoint { name: None }),
            NewEvent::new(EventBody::Status {
                status: String::new(),
            }),
            message("hi").at(Coordinates::new(95.0, 0.0)),
        ];

        for case in cases {
            let err = f
                .timeline
                .append_event(f.journey_id, "alice", case)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }

        let checkpoint = NewEvent::new(EventBody::Checkpoint {
            name: Some("Col du Galibier".into()),
        })
        .at(Coordinates::new(45.06, 6.41));
        assert!(f
            .timeline
            .append_event(f.journey_id, "alice", checkpoint)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_event_broadcast_once_to_everyone() {
        let f = fixture().await;
        let (_, mut alice) = f
            .hub
            .join(f.journey_id, "conn-a", &MemberIdentity::new("alice", "Alice"))
            .await
            .unwrap();
        let (_, mut bob) = f
            .hub
            .join(f.journey_id, "conn-b", &MemberIdentity::new("bob", "Bob"))
            .await
            .unwrap();
        while alice.try_recv().is_some() {}

        let event = f
            .timeline
            .append_event(f.journey_id, "alice", message("regroup at the fountain"))
            .await
            .unwrap();

        for subscription in [&mut alice, &mut bob] {
            let n = subscription.try_recv().unwrap();
            assert!(matches!(&n.push, Push::EventAppended(e) if e.id == event.id));
            assert!(subscription.try_recv().is_none());
        }
    }

    #[tokio::test]
    async fn test_foreign_instance_rejected() {
        let f = fixture().await;
        let bobs = f
            .registry
            .start_member_instance(f.journey_id, "bob", Coordinates::new(45.0, 7.0))
            .await
            .unwrap();

        let mut event = message("not mine");
        event.instance_id = Some(bobs.id);
        let err = f
            .timeline
            .append_event(f.journey_id, "alice", event)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }
}
