//! Storage contracts shared by the lifecycle coordinator and the worker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use pvwatch_core::{
    Alarm, Counter, CycleChanges, DetectionKey, EntityConfig, EntityId, InverterSnapshot,
    RecoveryGraceStatus, Severity,
};

use crate::error::StorageError;

/// Everything one cycle evaluates.
#[derive(Debug, Clone)]
pub struct CycleInput {
    pub now: DateTime<Utc>,
    pub snapshots: Vec<InverterSnapshot>,
    /// Validated configuration per inverter. Inverters whose stored
    /// configuration failed validation are absent.
    pub configs: HashMap<EntityId, EntityConfig>,
    pub grace: RecoveryGraceStatus,
}

impl CycleInput {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            snapshots: Vec::new(),
            configs: HashMap::new(),
            grace: RecoveryGraceStatus::new(),
        }
    }

    pub fn with_entity(mut self, snapshot: InverterSnapshot, config: EntityConfig) -> Self {
        self.configs.insert(snapshot.entity.clone(), config);
        self.snapshots.push(snapshot);
        self
    }
}

/// Counter Store and Alarm Registry as seen by one cycle.
///
/// `commit` is all-or-nothing: on error nothing from `changes` is visible.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// All alarms with no `cleared_at`.
    async fn load_open_alarms(&self) -> Result<Vec<Alarm>, StorageError>;

    /// All counters with a value above zero.
    async fn load_counters(&self) -> Result<Vec<(DetectionKey, Counter)>, StorageError>;

    /// Persist one cycle's counter and alarm mutations atomically.
    ///
    /// Returns the ids of the alarms this commit closed. A closure whose alarm
    /// is no longer open (an operator got there first) is skipped and left
    /// out.
    async fn commit(&self, changes: &CycleChanges) -> Result<Vec<Uuid>, StorageError>;
}

/// Operator-driven alarm actions, outside the per-cycle scan.
#[async_trait::async_trait]
pub trait AlarmOperations: Send + Sync {
    /// Open an `EXTERNAL_VENDOR_EVENT` alarm. Returns the already-open alarm
    /// when one exists for the same key.
    async fn open_external_event(
        &self,
        entity: EntityId,
        severity: Severity,
        detail: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<Alarm, StorageError>;

    /// Close an open alarm of any type, optionally leaving an observation.
    async fn close_alarm(
        &self,
        alarm_id: Uuid,
        at: DateTime<Utc>,
        observation: Option<&str>,
    ) -> Result<Alarm, StorageError>;

    /// Set the operator observation on an open alarm.
    async fn annotate_alarm(&self, alarm_id: Uuid, observation: &str) -> Result<Alarm, StorageError>;

    /// Open and closed alarms of one inverter, newest first.
    async fn alarm_history(&self, entity: &EntityId) -> Result<Vec<Alarm>, StorageError>;
}

/// Supplies the inputs of one cycle.
#[async_trait::async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn cycle_input(&self, now: DateTime<Utc>) -> Result<CycleInput, StorageError>;
}
