//! In-memory state store.
//!
//! Mirrors the PostgreSQL semantics closely enough to drive the engine in
//! tests and dry runs: commits are staged on a copy and swapped in only when
//! every mutation applied, and the "one open alarm per key" rule is enforced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use pvwatch_core::{
    Alarm, Counter, CycleChanges, DetectionKey, EntityId, RuleType, Severity,
};

use crate::error::StorageError;
use crate::traits::{AlarmOperations, StateStore};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    alarms: Vec<Alarm>,
    counters: HashMap<DetectionKey, Counter>,
}

impl MemoryState {
    fn open_alarm(&self, key: &DetectionKey) -> Option<&Alarm> {
        self.alarms.iter().find(|a| a.is_open() && &a.key == key)
    }

    fn alarm_mut(&mut self, id: Uuid) -> Result<&mut Alarm, StorageError> {
        self.alarms
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StorageError::AlarmNotFound(id))
    }

    fn apply(&mut self, changes: &CycleChanges) -> Result<Vec<Uuid>, StorageError> {
        for (key, counter) in &changes.counter_upserts {
            if counter.count == 0 {
                self.counters.remove(key);
            } else {
                self.counters.insert(key.clone(), *counter);
            }
        }
        for key in &changes.counter_deletes {
            self.counters.remove(key);
        }

        let mut closed = Vec::with_capacity(changes.closed.len());
        for closure in &changes.closed {
            let alarm = self.alarm_mut(closure.alarm_id)?;
            if alarm.is_open() {
                alarm.cleared_at = Some(closure.cleared_at);
                closed.push(closure.alarm_id);
            } else {
                warn!(alarm_id = %closure.alarm_id, "alarm already closed, skipping closure");
            }
        }

        for alarm in &changes.opened {
            if self.open_alarm(&alarm.key).is_some() {
                return Err(StorageError::AlarmAlreadyOpen(alarm.key.to_string()));
            }
            self.alarms.push(alarm.clone());
        }
        Ok(closed)
    }
}

/// Process-local [`StateStore`] and [`AlarmOperations`] implementation.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
    fail_next_commit: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit` fail without applying anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Insert an alarm row as-is (open or closed).
    pub async fn seed_alarm(&self, alarm: Alarm) {
        self.state.write().await.alarms.push(alarm);
    }

    pub async fn seed_counter(&self, key: DetectionKey, counter: Counter) {
        self.state.write().await.counters.insert(key, counter);
    }

    /// Every alarm row, open and closed.
    pub async fn alarms(&self) -> Vec<Alarm> {
        self.state.read().await.alarms.clone()
    }

    pub async fn open_alarms_for(&self, key: &DetectionKey) -> Vec<Alarm> {
        self.state
            .read()
            .await
            .alarms
            .iter()
            .filter(|a| a.is_open() && &a.key == key)
            .cloned()
            .collect()
    }

    pub async fn counter(&self, key: &DetectionKey) -> Option<Counter> {
        self.state.read().await.counters.get(key).copied()
    }

    pub async fn counter_count(&self) -> usize {
        self.state.read().await.counters.len()
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStore {
    async fn load_open_alarms(&self) -> Result<Vec<Alarm>, StorageError> {
        let state = self.state.read().await;
        Ok(state.alarms.iter().filter(|a| a.is_open()).cloned().collect())
    }

    async fn load_counters(&self) -> Result<Vec<(DetectionKey, Counter)>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .counters
            .iter()
            .filter(|(_, c)| c.count > 0)
            .map(|(k, c)| (k.clone(), *c))
            .collect())
    }

    async fn commit(&self, changes: &CycleChanges) -> Result<Vec<Uuid>, StorageError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Other("injected commit failure".to_string()));
        }

        let mut state = self.state.write().await;
        let mut staged = state.clone();
        let closed = staged.apply(changes)?;
        *state = staged;

        debug!(
            upserts = changes.counter_upserts.len(),
            deletes = changes.counter_deletes.len(),
            opened = changes.opened.len(),
            closed = closed.len(),
            "in-memory commit applied"
        );
        Ok(closed)
    }
}

#[async_trait::async_trait]
impl AlarmOperations for InMemoryStore {
    async fn open_external_event(
        &self,
        entity: EntityId,
        severity: Severity,
        detail: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<Alarm, StorageError> {
        let key = DetectionKey::new(entity, RuleType::ExternalVendorEvent, detail);
        let mut state = self.state.write().await;
        if let Some(existing) = state.open_alarm(&key) {
            return Ok(existing.clone());
        }
        let alarm = Alarm::open(key, severity, message, at);
        state.alarms.push(alarm.clone());
        Ok(alarm)
    }

    async fn close_alarm(
        &self,
        alarm_id: Uuid,
        at: DateTime<Utc>,
        observation: Option<&str>,
    ) -> Result<Alarm, StorageError> {
        let mut state = self.state.write().await;
        let alarm = state.alarm_mut(alarm_id)?;
        if !alarm.is_open() {
            return Err(StorageError::AlarmClosed(alarm_id));
        }
        alarm.cleared_at = Some(at);
        if let Some(note) = observation {
            alarm.observation = Some(note.to_string());
        }
        Ok(alarm.clone())
    }

    async fn annotate_alarm(&self, alarm_id: Uuid, observation: &str) -> Result<Alarm, StorageError> {
        let mut state = self.state.write().await;
        let alarm = state.alarm_mut(alarm_id)?;
        if !alarm.is_open() {
            return Err(StorageError::AlarmClosed(alarm_id));
        }
        alarm.observation = Some(observation.to_string());
        Ok(alarm.clone())
    }

    async fn alarm_history(&self, entity: &EntityId) -> Result<Vec<Alarm>, StorageError> {
        let state = self.state.read().await;
        let mut history: Vec<Alarm> = state
            .alarms
            .iter()
            .filter(|a| a.key.entity() == entity)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pvwatch_core::AlarmClosure;

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, min, 0).unwrap()
    }

    fn key(detail: &str) -> DetectionKey {
        DetectionKey::new(EntityId::new("p1", "inv1"), RuleType::StringDown, detail)
    }

    #[tokio::test]
    async fn commit_applies_all_changes() {
        let store = InMemoryStore::new();
        let alarm = Alarm::open(key("String 1"), Severity::High, "down", at(0));
        let changes = CycleChanges {
            counter_upserts: vec![(key("String 1"), Counter { count: 2, last_detected_at: at(0) })],
            counter_deletes: vec![],
            opened: vec![alarm.clone()],
            closed: vec![],
        };
        store.commit(&changes).await.unwrap();

        assert_eq!(store.load_open_alarms().await.unwrap(), vec![alarm]);
        assert_eq!(store.counter(&key("String 1")).await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn duplicate_open_alarm_rejects_whole_commit() {
        let store = InMemoryStore::new();
        store
            .seed_alarm(Alarm::open(key("String 1"), Severity::High, "down", at(0)))
            .await;

        let changes = CycleChanges {
            counter_upserts: vec![(key("String 2"), Counter { count: 1, last_detected_at: at(5) })],
            counter_deletes: vec![],
            opened: vec![Alarm::open(key("String 1"), Severity::High, "down again", at(5))],
            closed: vec![],
        };
        let err = store.commit(&changes).await.unwrap_err();
        assert!(matches!(err, StorageError::AlarmAlreadyOpen(_)));

        // Counter upsert from the rejected commit must not be visible.
        assert!(store.counter(&key("String 2")).await.is_none());
        assert_eq!(store.open_alarms_for(&key("String 1")).await.len(), 1);
    }

    #[tokio::test]
    async fn injected_failure_leaves_state_untouched() {
        let store = InMemoryStore::new();
        store.fail_next_commit();
        let changes = CycleChanges {
            counter_upserts: vec![(key("String 1"), Counter { count: 1, last_detected_at: at(0) })],
            ..Default::default()
        };
        assert!(store.commit(&changes).await.is_err());
        assert_eq!(store.counter_count().await, 0);

        // Only the next commit fails.
        store.commit(&changes).await.unwrap();
        assert_eq!(store.counter_count().await, 1);
    }

    #[tokio::test]
    async fn closure_and_counter_delete() {
        let store = InMemoryStore::new();
        let alarm = Alarm::open(key("String 1"), Severity::High, "down", at(0));
        store.seed_alarm(alarm.clone()).await;
        store
            .seed_counter(key("String 1"), Counter { count: 3, last_detected_at: at(0) })
            .await;

        let changes = CycleChanges {
            counter_upserts: vec![],
            counter_deletes: vec![key("String 1")],
            opened: vec![],
            closed: vec![AlarmClosure { alarm_id: alarm.id, cleared_at: at(10) }],
        };
        assert_eq!(store.commit(&changes).await.unwrap(), vec![alarm.id]);

        assert!(store.load_open_alarms().await.unwrap().is_empty());
        assert!(store.load_counters().await.unwrap().is_empty());
        assert_eq!(store.alarms().await[0].cleared_at, Some(at(10)));
    }

    #[tokio::test]
    async fn closure_of_operator_closed_alarm_is_not_reported() {
        let store = InMemoryStore::new();
        let alarm = Alarm::open(key("String 1"), Severity::High, "down", at(0));
        store.seed_alarm(alarm.clone()).await;
        store.close_alarm(alarm.id, at(5), Some("replaced fuse")).await.unwrap();

        let changes = CycleChanges {
            closed: vec![AlarmClosure { alarm_id: alarm.id, cleared_at: at(10) }],
            ..Default::default()
        };
        assert!(store.commit(&changes).await.unwrap().is_empty());
        assert_eq!(store.alarms().await[0].cleared_at, Some(at(5)));
    }

    #[tokio::test]
    async fn external_event_is_opened_once_and_closed_by_operator() {
        let store = InMemoryStore::new();
        let entity = EntityId::new("p1", "inv1");
        let first = store
            .open_external_event(entity.clone(), Severity::Medium, "Grid fault 301", "grid fault", at(0))
            .await
            .unwrap();
        let second = store
            .open_external_event(entity.clone(), Severity::Medium, "Grid fault 301", "grid fault", at(5))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let closed = store
            .close_alarm(first.id, at(30), Some("reset by site technician"))
            .await
            .unwrap();
        assert_eq!(closed.cleared_at, Some(at(30)));
        assert_eq!(closed.observation.as_deref(), Some("reset by site technician"));

        let err = store.close_alarm(first.id, at(31), None).await.unwrap_err();
        assert!(matches!(err, StorageError::AlarmClosed(_)));
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let store = InMemoryStore::new();
        store.seed_alarm(Alarm::open(key("String 1"), Severity::High, "a", at(0))).await;
        store.seed_alarm(Alarm::open(key("String 2"), Severity::High, "b", at(20))).await;
        store
            .seed_alarm(Alarm::open(
                DetectionKey::new(EntityId::new("p1", "inv2"), RuleType::StringDown, "String 1"),
                Severity::High,
                "other inverter",
                at(10),
            ))
            .await;

        let history = store.alarm_history(&EntityId::new("p1", "inv1")).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "b");
        assert_eq!(history[1].message, "a");
    }

    #[tokio::test]
    async fn annotate_sets_observation() {
        let store = InMemoryStore::new();
        let alarm = Alarm::open(key("String 1"), Severity::High, "down", at(0));
        store.seed_alarm(alarm.clone()).await;
        let annotated = store.annotate_alarm(alarm.id, "fuse replaced").await.unwrap();
        assert_eq!(annotated.observation.as_deref(), Some("fuse replaced"));
        assert!(matches!(
            store.annotate_alarm(Uuid::new_v4(), "x").await.unwrap_err(),
            StorageError::AlarmNotFound(_)
        ));
    }
}
