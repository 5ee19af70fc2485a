//! Durable storage for journeys, instances and timeline events.
//!
//! The store is the single source of truth. Everything else in the engine
//! (cache entries, room membership) can be rebuilt from it.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::model::{GroupJourney, InstanceId, JourneyId, JourneyInstance, RideEvent, UserId};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness rule would be violated.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// The record to update does not exist.
    #[error("Missing: {0}")]
    Missing(String),

    /// The backing storage failed.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Offset pagination over a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 100;

    /// Build a page, clamping the limit to `1..=MAX_LIMIT`.
    #[must_use]
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, Self::DEFAULT_LIMIT)
    }
}

/// Create/read/update access to the durable journey records.
#[async_trait]
pub trait JourneyStore: Send + Sync {
    async fn insert_journey(&self, journey: GroupJourney) -> Result<(), StoreError>;

    async fn journey(&self, id: JourneyId) -> Result<Option<GroupJourney>, StoreError>;

    async fn update_journey(&self, journey: &GroupJourney) -> Result<(), StoreError>;

    async fn journeys_for_group(&self, group_id: &str) -> Result<Vec<GroupJourney>, StoreError>;

    /// Insert an instance.
    ///
    /// Must fail with [`StoreError::Duplicate`] if the same user already has
    /// a non-terminal instance in the same journey. The check and the insert
    /// are atomic.
    async fn insert_instance(&self, instance: JourneyInstance) -> Result<(), StoreError>;

    async fn instance(&self, id: InstanceId) -> Result<Option<JourneyInstance>, StoreError>;

    async fn update_instance(&self, instance: &JourneyInstance) -> Result<(), StoreError>;

    /// All instances of a journey, in start order.
    async fn instances_for_journey(
        &self,
        journey_id: JourneyId,
    ) -> Result<Vec<JourneyInstance>, StoreError>;

    async fn insert_event(&self, event: RideEvent) -> Result<(), StoreError>;

    /// Events of a journey ordered by creation time.
    async fn events_for_journey(
        &self,
        journey_id: JourneyId,
        page: Page,
    ) -> Result<Vec<RideEvent>, StoreError>;
}

#[derive(Debug, Default)]
struct InstanceTable {
    rows: HashMap<InstanceId, JourneyInstance>,
    /// (journey, user) -> the pair's non-terminal instance.
    live: HashMap<(JourneyId, UserId), InstanceId>,
}

/// In-process [`JourneyStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    journeys: DashMap<JourneyId, GroupJourney>,
    instances: RwLock<InstanceTable>,
    events: DashMap<JourneyId, Vec<RideEvent>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JourneyStore for MemoryStore {
    async fn insert_journey(&self, journey: GroupJourney) -> Result<(), StoreError> {
        if self.journeys.contains_key(&journey.id) {
            return Err(StoreError::Duplicate(format!("journey {}", journey.id)));
        }
        self.journeys.insert(journey.id, journey);
        Ok(())
    }

    async fn journey(&self, id: JourneyId) -> Result<Option<GroupJourney>, StoreError> {
        Ok(self.journeys.get(&id).map(|j| j.clone()))
    }

    async fn update_journey(&self, journey: &GroupJourney) -> Result<(), StoreError> {
        match self.journeys.get_mut(&journey.id) {
            Some(mut row) => {
                *row = journey.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(format!("journey {}", journey.id))),
        }
    }

    async fn journeys_for_group(&self, group_id: &str) -> Result<Vec<GroupJourney>, StoreError> {
        let mut journeys: Vec<_> = self
            .journeys
            .iter()
            .filter(|j| j.group_id == group_id)
            .map(|j| j.clone())
            .collect();
        journeys.sort_by_key(|j| j.created_at);
        Ok(journeys)
    }

    async fn insert_instance(&self, instance: JourneyInstance) -> Result<(), StoreError> {
        let mut table = self.instances.write().await;
        let key = (instance.journey_id, instance.user_id.clone());

        if !instance.status.is_terminal() {
            if let Some(existing) = table.live.get(&key) {
                return Err(StoreError::Duplicate(format!(
                    "user {} already has live instance {existing} in journey {}",
                    instance.user_id, instance.journey_id
                )));
            }
            table.live.insert(key, instance.id);
        }
        table.rows.insert(instance.id, instance);
        Ok(())
    }

    async fn instance(&self, id: InstanceId) -> Result<Option<JourneyInstance>, StoreError> {
        Ok(self.instances.read().await.rows.get(&id).cloned())
    }

    async fn update_instance(&self, instance: &JourneyInstance) -> Result<(), StoreError> {
        let mut table = self.instances.write().await;
        if !table.rows.contains_key(&instance.id) {
            return Err(StoreError::Missing(format!("instance {}", instance.id)));
        }
        if instance.status.is_terminal() {
            let key = (instance.journey_id, instance.user_id.clone());
            if table.live.get(&key) == Some(&instance.id) {
                table.live.remove(&key);
            }
        }
        table.rows.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn instances_for_journey(
        &self,
        journey_id: JourneyId,
    ) -> Result<Vec<JourneyInstance>, StoreError> {
        let table = self.instances.read().await;
        let mut instances: Vec<_> = table
            .rows
            .values()
            .filter(|i| i.journey_id == journey_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(instances)
    }

    async fn insert_event(&self, event: RideEvent) -> Result<(), StoreError> {
        let mut events = self.events.entry(event.journey_id).or_default();
        // Keep the log sorted; equal timestamps stay in append order.
        let at = events.partition_point(|e| e.created_at <= event.created_at);
        events.insert(at, event);
        Ok(())
    }

    async fn events_for_journey(
        &self,
        journey_id: JourneyId,
        page: Page,
    ) -> Result<Vec<RideEvent>, StoreError> {
        Ok(self
            .events
            .get(&journey_id)
            .map(|events| {
                events
                    .iter()
                    .skip(page.offset)
                    .take(page.limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coordinates, EventBody, InstanceStatus};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn instance(journey_id: JourneyId, user: &str) -> JourneyInstance {
        let now = Utc::now();
        let start = Coordinates::new(45.0, 7.0);
        JourneyInstance {
            id: Uuid::new_v4(),
            journey_id,
            user_id: user.into(),
            status: InstanceStatus::Active,
            start,
            current: start,
            distance_km: 0.0,
            moving_seconds: 0.0,
            average_speed_kmh: 0.0,
            top_speed_kmh: 0.0,
            route: Vec::new(),
            started_at: now,
            last_update_at: now,
            completed_at: None,
            segment_break: false,
        }
    }

    #[tokio::test]
    async fn test_one_live_instance_per_pair() {
        let store = MemoryStore::new();
        let journey = Uuid::new_v4();

        let mut first = instance(journey, "alice");
        store.insert_instance(first.clone()).await.unwrap();
        assert!(matches!(
            store.insert_instance(instance(journey, "alice")).await,
            Err(StoreError::Duplicate(_))
        ));

        // Another user, or another journey, is fine.
        store.insert_instance(instance(journey, "bob")).await.unwrap();
        store
            .insert_instance(instance(Uuid::new_v4(), "alice"))
            .await
            .unwrap();

        // Completing frees the slot.
        first.status = InstanceStatus::Completed;
        store.update_instance(&first).await.unwrap();
        store.insert_instance(instance(journey, "alice")).await.unwrap();
        assert_eq!(store.instances_for_journey(journey).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_update_missing_instance() {
        let store = MemoryStore::new();
        let ghost = instance(Uuid::new_v4(), "alice");
        assert!(matches!(
            store.update_instance(&ghost).await,
            Err(StoreError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn test_events_ordered_and_paged() {
        let store = MemoryStore::new();
        let journey = Uuid::new_v4();
        let base = Utc::now();

        for (i, offset) in [2, 0, 1].into_iter().enumerate() {
            store
                .insert_event(RideEvent {
                    id: Uuid::new_v4(),
                    journey_id: journey,
                    instance_id: None,
                    user_id: "alice".into(),
                    body: EventBody::Message {
                        text: format!("m{i}"),
                    },
                    coordinates: None,
                    created_at: base + Duration::seconds(offset),
                })
                .await
                .unwrap();
        }

        let all = store.events_for_journey(journey, Page::default()).await.unwrap();
        let texts: Vec<_> = all
            .iter()
            .map(|e| match &e.body {
                EventBody::Message { text } => text.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(texts, vec!["m1", "m2", "m0"]);

        let second = store.events_for_journey(journey, Page::new(1, 1)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, all[1].id);
    }

    #[test]
    fn test_page_clamping() {
        assert_eq!(Page::new(0, 0).limit, 1);
        assert_eq!(Page::new(0, 10_000).limit, Page::MAX_LIMIT);
    }
}
