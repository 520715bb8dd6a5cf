use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use pvwatch_core::{
    ActiveChannels, Alarm, Counter, CycleChanges, DetectionConfig, DetectionKey, EntityConfig,
    EntityId, GroupingTopology, InverterSnapshot, NotificationKind, RuleType, Severity, VendorKind,
};
use pvwatch_storage::{AlarmOperations, CycleInput, InMemoryStore, StateStore, StorageError};

use super::{CycleError, LifecycleCoordinator};
use crate::detection::DetectionEngine;

fn at(min: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap() + chrono::Duration::minutes(min)
}

fn entity(inverter: &str) -> EntityId {
    EntityId::new("p1", inverter)
}

fn config() -> EntityConfig {
    EntityConfig {
        grouping: GroupingTopology::Single,
        active_channels: ActiveChannels::new(vec![1, 2]).unwrap(),
        vendor_kind: VendorKind::PerString,
    }
}

fn snapshot(inverter: &str, currents: &[f64]) -> InverterSnapshot {
    InverterSnapshot::new(entity(inverter), "sunvendor", currents.iter().copied().map(Some).collect())
}

fn coordinator(store: Arc<InMemoryStore>) -> LifecycleCoordinator {
    LifecycleCoordinator::new(
        store,
        DetectionEngine::new(DetectionConfig::default()),
        Some("admin-chat"),
    )
}

#[tokio::test]
async fn intents_carry_owner_when_distinct() {
    let store = Arc::new(InMemoryStore::new());
    let key = DetectionKey::new(entity("inv1"), RuleType::StringDown, "String 2");
    store.seed_counter(key.clone(), Counter { count: 1, last_detected_at: at(-5) }).await;

    let coord = coordinator(store.clone());
    let input = CycleInput::new(at(0))
        .with_entity(snapshot("inv1", &[15.0, 0.2]).with_owner("owner-chat"), config());
    let outcome = coord.run_cycle(&input).await.unwrap();

    assert_eq!(outcome.intents.len(), 1);
    let intent = &outcome.intents[0];
    assert_eq!(intent.kind, NotificationKind::Opened);
    assert_eq!(intent.problem_detail, "String 2");
    assert_eq!(intent.recipients.admin.as_deref(), Some("admin-chat"));
    assert_eq!(intent.recipients.owner.as_deref(), Some("owner-chat"));
}

#[tokio::test]
async fn owner_same_as_admin_is_dropped() {
    let store = Arc::new(InMemoryStore::new());
    let key = DetectionKey::new(entity("inv1"), RuleType::StringDown, "String 2");
    store.seed_alarm(Alarm::open(key, Severity::High, "down", at(-30))).await;

    let coord = coordinator(store.clone());
    let input = CycleInput::new(at(0))
        .with_entity(snapshot("inv1", &[15.0, 14.0]).with_owner("admin-chat"), config());
    let outcome = coord.run_cycle(&input).await.unwrap();

    assert_eq!(outcome.intents.len(), 1);
    assert_eq!(outcome.intents[0].kind, NotificationKind::Cleared);
    assert_eq!(outcome.intents[0].recipients.owner, None);
}

#[tokio::test]
async fn without_admin_target_only_owner_is_addressed() {
    let store = Arc::new(InMemoryStore::new());
    let key = DetectionKey::new(entity("inv1"), RuleType::StringDown, "String 2");
    store.seed_alarm(Alarm::open(key, Severity::High, "down", at(-30))).await;
    let coord = LifecycleCoordinator::new(
        store.clone(),
        DetectionEngine::new(DetectionConfig::default()),
        None,
    );

    let input = CycleInput::new(at(0))
        .with_entity(snapshot("inv1", &[15.0, 14.0]).with_owner("owner-chat"), config());
    let outcome = coord.run_cycle(&input).await.unwrap();

    let recipients = &outcome.intents[0].recipients;
    assert_eq!(recipients.admin, None);
    assert_eq!(recipients.all().collect::<Vec<_>>(), vec!["owner-chat"]);
}

#[tokio::test]
async fn unconfigured_inverter_keeps_its_alarms() {
    let store = Arc::new(InMemoryStore::new());
    let key = DetectionKey::new(entity("inv1"), RuleType::StringDown, "String 2");
    store.seed_alarm(Alarm::open(key.clone(), Severity::High, "down", at(-30))).await;

    let coord = coordinator(store.clone());
    let mut input = CycleInput::new(at(0));
    input.snapshots.push(snapshot("inv1", &[15.0, 14.0]));
    let outcome = coord.run_cycle(&input).await.unwrap();

    assert_eq!(outcome.report.entities_skipped, 1);
    assert_eq!(outcome.report.entities_evaluated, 0);
    assert_eq!(outcome.report.alarms_cleared, 0);
    assert_eq!(store.open_alarms_for(&key).await.len(), 1);
}

#[tokio::test]
async fn alarms_of_inverters_missing_from_batch_clear() {
    let store = Arc::new(InMemoryStore::new());
    let key = DetectionKey::new(entity("gone"), RuleType::StringDown, "String 1");
    store.seed_alarm(Alarm::open(key.clone(), Severity::High, "down", at(-30))).await;

    let coord = coordinator(store.clone());
    let outcome = coord.run_cycle(&CycleInput::new(at(0))).await.unwrap();

    assert_eq!(outcome.report.alarms_cleared, 1);
    assert!(store.open_alarms_for(&key).await.is_empty());
    assert_eq!(outcome.intents[0].recipients.owner, None);
}

#[tokio::test]
async fn duplicate_snapshot_counts_once() {
    let store = Arc::new(InMemoryStore::new());
    let coord = coordinator(store.clone());
    let input = CycleInput::new(at(0))
        .with_entity(snapshot("inv1", &[15.0, 0.2]), config())
        .with_entity(snapshot("inv1", &[15.0, 0.1]), config());
    let outcome = coord.run_cycle(&input).await.unwrap();

    assert_eq!(outcome.report.entities_evaluated, 1);
    let key = DetectionKey::new(entity("inv1"), RuleType::StringDown, "String 2");
    assert_eq!(store.counter(&key).await.map(|c| c.count), Some(1));
    assert!(outcome.opened.is_empty());
}

#[tokio::test]
async fn report_counts_changes() {
    let store = Arc::new(InMemoryStore::new());
    let stale = DetectionKey::new(entity("inv1"), RuleType::StringDown, "String 1");
    store.seed_counter(stale.clone(), Counter { count: 1, last_detected_at: at(-5) }).await;

    let coord = coordinator(store.clone());
    let input = CycleInput::new(at(0)).with_entity(snapshot("inv1", &[15.0, 0.2]), config());
    let report = coord.run_cycle(&input).await.unwrap().report;

    assert_eq!(report.at, Some(at(0)));
    assert_eq!(report.entities_evaluated, 1);
    assert_eq!(report.counters_written, 1);
    assert_eq!(report.counters_deleted, 1);
    assert_eq!(report.alarms_opened, 0);
    assert!(store.counter(&stale).await.is_none());
}

/// Delays loads, and acknowledges commits only after they were applied.
struct SlowStore {
    inner: InMemoryStore,
    load_delay: Duration,
    commit_delay: Duration,
}

impl SlowStore {
    fn slow_load(delay_ms: u64) -> Self {
        Self {
            inner: InMemoryStore::new(),
            load_delay: Duration::from_millis(delay_ms),
            commit_delay: Duration::ZERO,
        }
    }

    fn slow_commit(delay_ms: u64) -> Self {
        Self {
            inner: InMemoryStore::new(),
            load_delay: Duration::ZERO,
            commit_delay: Duration::from_millis(delay_ms),
        }
    }
}

#[async_trait::async_trait]
impl StateStore for SlowStore {
    async fn load_open_alarms(&self) -> Result<Vec<Alarm>, StorageError> {
        tokio::time::sleep(self.load_delay).await;
        self.inner.load_open_alarms().await
    }

    async fn load_counters(&self) -> Result<Vec<(DetectionKey, Counter)>, StorageError> {
        self.inner.load_counters().await
    }

    async fn commit(&self, changes: &CycleChanges) -> Result<Vec<Uuid>, StorageError> {
        let closed = self.inner.commit(changes).await?;
        tokio::time::sleep(self.commit_delay).await;
        Ok(closed)
    }
}

/// An operator closes every alarm right after the cycle loaded it.
struct OperatorRaceStore {
    inner: InMemoryStore,
}

#[async_trait::async_trait]
impl StateStore for OperatorRaceStore {
    async fn load_open_alarms(&self) -> Result<Vec<Alarm>, StorageError> {
        let open = self.inner.load_open_alarms().await?;
        for alarm in &open {
            self.inner.close_alarm(alarm.id, at(-1), Some("closed on site")).await?;
        }
        Ok(open)
    }

    async fn load_counters(&self) -> Result<Vec<(DetectionKey, Counter)>, StorageError> {
        self.inner.load_counters().await
    }

    async fn commit(&self, changes: &CycleChanges) -> Result<Vec<Uuid>, StorageError> {
        self.inner.commit(changes).await
    }
}

#[tokio::test]
async fn expired_budget_fails_cycle_without_writes() {
    let store = Arc::new(SlowStore::slow_load(300));
    let coord = LifecycleCoordinator::new(
        store.clone(),
        DetectionEngine::new(DetectionConfig::default()),
        Some("admin-chat"),
    );
    let input = CycleInput::new(at(0)).with_entity(snapshot("inv1", &[15.0, 0.2]), config());

    let result = coord.run_cycle_within(&input, Duration::from_millis(20)).await;
    assert!(matches!(result, Err(CycleError::Timeout(_))));
    assert_eq!(store.inner.counter_count().await, 0);
}

#[tokio::test]
async fn started_commit_outlives_the_budget() {
    let store = Arc::new(SlowStore::slow_commit(200));
    let key = DetectionKey::new(entity("inv1"), RuleType::StringDown, "String 2");
    store.inner.seed_counter(key.clone(), Counter { count: 1, last_detected_at: at(-5) }).await;
    let coord = LifecycleCoordinator::new(
        store.clone(),
        DetectionEngine::new(DetectionConfig::default()),
        Some("admin-chat"),
    );
    let input = CycleInput::new(at(0)).with_entity(snapshot("inv1", &[15.0, 0.2]), config());

    let outcome = coord
        .run_cycle_within(&input, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(outcome.report.alarms_opened, 1);
    assert_eq!(outcome.intents.len(), 1);
    assert_eq!(store.inner.open_alarms_for(&key).await.len(), 1);
}

#[tokio::test]
async fn closure_skipped_by_store_sends_no_cleared_intent() {
    let store = Arc::new(OperatorRaceStore { inner: InMemoryStore::new() });
    let key = DetectionKey::new(entity("inv1"), RuleType::StringDown, "String 2");
    store.inner.seed_alarm(Alarm::open(key, Severity::High, "down", at(-30))).await;
    let coord = LifecycleCoordinator::new(
        store.clone(),
        DetectionEngine::new(DetectionConfig::default()),
        Some("admin-chat"),
    );
    let input = CycleInput::new(at(0)).with_entity(snapshot("inv1", &[15.0, 14.0]), config());

    let outcome = coord.run_cycle(&input).await.unwrap();
    assert_eq!(outcome.report.alarms_cleared, 0);
    assert!(outcome.cleared.is_empty());
    assert!(outcome.intents.is_empty());
    assert_eq!(store.inner.alarms().await[0].cleared_at, Some(at(-1)));
}

#[tokio::test]
async fn concurrent_cycles_do_not_overlap() {
    let store = Arc::new(SlowStore::slow_load(50));
    let coord = Arc::new(LifecycleCoordinator::new(
        store.clone(),
        DetectionEngine::new(DetectionConfig::default()),
        Some("admin-chat"),
    ));
    let input = CycleInput::new(at(0)).with_entity(snapshot("inv1", &[15.0, 0.2]), config());

    let a = {
        let coord = coord.clone();
        let input = input.clone();
        tokio::spawn(async move { coord.run_cycle(&input).await })
    };
    let b = {
        let coord = coord.clone();
        let input = input.clone();
        tokio::spawn(async move { coord.run_cycle(&input).await })
    };
    let first = a.await.unwrap().unwrap();
    let second = b.await.unwrap().unwrap();

    // Serialized cycles see each other's counters: 1 then 2, and the second opens.
    let key = DetectionKey::new(entity("inv1"), RuleType::StringDown, "String 2");
    assert_eq!(store.inner.counter(&key).await.map(|c| c.count), Some(2));
    assert_eq!(first.report.alarms_opened + second.report.alarms_opened, 1);
    assert_eq!(store.inner.open_alarms_for(&key).await.len(), 1);
}
