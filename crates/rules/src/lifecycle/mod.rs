//! The per-cycle alarm lifecycle.
//!
//! One cycle runs five steps against the shared state store:
//!
//! 1. Load open alarms and non-zero counters.
//! 2. Evaluate every inverter snapshot, collecting the still-detected set.
//! 3. Reconcile: open alarms missing from that set are closed, unless their
//!    rule type never auto-clears.
//! 4. Commit all counter and alarm changes in one atomic write.
//! 5. Hand notification intents to the caller, who dispatches them after the
//!    commit. Delivery failures never touch persisted state. A closure the
//!    store skipped, because an operator closed the alarm first, gets no
//!    intent.
//!
//! [`LifecycleCoordinator`] serializes cycles with an internal guard, so a
//! cycle started while another is in flight waits for it.

mod reconcile;

#[cfg(test)]
mod tests;

pub use reconcile::alarms_to_close;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pvwatch_core::{
    Alarm, AlarmClosure, CycleChanges, EntityId, InverterSnapshot, NotificationIntent,
    NotificationKind, Recipients,
};
use pvwatch_notify::{Dispatcher, NotificationSummary};
use pvwatch_storage::{CycleInput, StateStore, StorageError};

use crate::detection::{DetectionEngine, Evaluation};
use crate::state::{CounterIndex, OpenAlarmIndex};

// ── Errors ──────────────────────────────────────────────────────────

/// Why a cycle failed. A failed cycle persists nothing.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("failed to load cycle state: {0}")]
    Load(StorageError),

    #[error("failed to persist cycle changes: {0}")]
    Persist(StorageError),

    #[error("cycle exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("invalid cycle schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },
}

// ── Report ──────────────────────────────────────────────────────────

/// Totals of one committed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub at: Option<DateTime<Utc>>,
    pub entities_evaluated: usize,
    /// Inverters without a valid configuration; their open alarms were kept.
    pub entities_skipped: usize,
    /// Active channels with no usable reading.
    pub channels_skipped: usize,
    pub alarms_opened: usize,
    pub alarms_cleared: usize,
    pub counters_written: usize,
    pub counters_deleted: usize,
    pub duration_ms: u64,
}

/// An evaluated cycle waiting for its commit.
struct PlannedCycle {
    now: DateTime<Utc>,
    report: CycleReport,
    changes: CycleChanges,
    to_close: Vec<Alarm>,
    owners: HashMap<EntityId, Option<String>>,
}

/// What a committed cycle changed, plus the notifications it owes.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub report: CycleReport,
    pub opened: Vec<Alarm>,
    pub cleared: Vec<Alarm>,
    pub intents: Vec<NotificationIntent>,
}

// ── Coordinator ─────────────────────────────────────────────────────

pub struct LifecycleCoordinator {
    store: Arc<dyn StateStore>,
    engine: DetectionEngine,
    admin_target: Option<String>,
    cycle_guard: Mutex<()>,
}

impl LifecycleCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        engine: DetectionEngine,
        admin_target: Option<&str>,
    ) -> Self {
        Self {
            store,
            engine,
            admin_target: admin_target.map(str::to_string),
            cycle_guard: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &DetectionEngine {
        &self.engine
    }

    /// Run one cycle and commit its changes.
    ///
    /// Nothing is written on error. Intents in the returned outcome refer to
    /// committed alarms only.
    pub async fn run_cycle(&self, input: &CycleInput) -> Result<CycleOutcome, CycleError> {
        let _guard = self.cycle_guard.lock().await;
        let started = Instant::now();
        let planned = self.plan(input).await?;
        self.commit(planned, started).await
    }

    /// Run one cycle under a wall-clock budget.
    ///
    /// The budget covers waiting for the cycle guard, loading and evaluating.
    /// A cycle that runs out of budget fails before anything is written. Once
    /// the commit has started it runs to completion, so a `Timeout` always
    /// means the store is untouched.
    pub async fn run_cycle_within(
        &self,
        input: &CycleInput,
        budget: Duration,
    ) -> Result<CycleOutcome, CycleError> {
        let started = Instant::now();
        let (_guard, planned) = tokio::time::timeout(budget, async {
            let guard = self.cycle_guard.lock().await;
            let planned = self.plan(input).await?;
            Ok::<_, CycleError>((guard, planned))
        })
        .await
        .map_err(|_| CycleError::Timeout(budget))??;
        self.commit(planned, started).await
    }

    /// Load state and evaluate every snapshot, without writing anything.
    async fn plan(&self, input: &CycleInput) -> Result<PlannedCycle, CycleError> {
        let now = input.now;

        let open = OpenAlarmIndex::from_alarms(
            self.store.load_open_alarms().await.map_err(CycleError::Load)?,
        );
        let counters =
            CounterIndex::from_loaded(self.store.load_counters().await.map_err(CycleError::Load)?);
        debug!(open_alarms = open.len(), counters = counters.len(), "cycle state loaded");

        let snapshots = latest_per_entity(&input.snapshots);
        let mut report = CycleReport {
            at: Some(now),
            ..CycleReport::default()
        };

        let mut eval = Evaluation::new(counters, &open, now);
        for snapshot in &snapshots {
            match input.configs.get(&snapshot.entity) {
                Some(config) => {
                    self.engine.evaluate(&mut eval, snapshot, config, &input.grace);
                    report.entities_evaluated += 1;
                }
                None => {
                    warn!(
                        plant = %snapshot.entity.plant,
                        inverter = %snapshot.entity.inverter,
                        "no valid configuration, skipping inverter and keeping its alarms"
                    );
                    eval.hold_entity(&snapshot.entity);
                    report.entities_skipped += 1;
                }
            }
        }
        let evaluated = eval.finish();
        report.channels_skipped = evaluated.channels_skipped;

        let to_close = alarms_to_close(&open, &evaluated.still_detected, now);
        let changes = CycleChanges {
            closed: to_close
                .iter()
                .map(|alarm| AlarmClosure {
                    alarm_id: alarm.id,
                    cleared_at: now,
                })
                .collect(),
            opened: evaluated.opened,
            counter_upserts: evaluated.counter_upserts,
            counter_deletes: evaluated.counter_deletes,
        };

        Ok(PlannedCycle {
            now,
            report,
            changes,
            to_close,
            owners: owner_targets(&snapshots),
        })
    }

    /// Write a planned cycle and build its notifications from what the store
    /// actually applied.
    async fn commit(&self, planned: PlannedCycle, started: Instant) -> Result<CycleOutcome, CycleError> {
        let PlannedCycle {
            now,
            mut report,
            changes,
            to_close,
            owners,
        } = planned;

        let closed_ids: HashSet<Uuid> = if changes.is_empty() {
            HashSet::new()
        } else {
            self.store
                .commit(&changes)
                .await
                .map_err(CycleError::Persist)?
                .into_iter()
                .collect()
        };
        let cleared: Vec<Alarm> = to_close
            .into_iter()
            .filter(|alarm| closed_ids.contains(&alarm.id))
            .collect();

        for alarm in &changes.opened {
            info!(
                plant = alarm.key.plant(),
                inverter = alarm.key.inverter(),
                rule = alarm.key.rule().as_str(),
                detail = alarm.key.detail(),
                severity = alarm.severity.as_str(),
                "alarm opened"
            );
        }
        for alarm in &cleared {
            info!(
                plant = alarm.key.plant(),
                inverter = alarm.key.inverter(),
                rule = alarm.key.rule().as_str(),
                detail = alarm.key.detail(),
                "alarm cleared"
            );
        }

        report.alarms_opened = changes.opened.len();
        report.alarms_cleared = cleared.len();
        report.counters_written = changes.counter_upserts.len();
        report.counters_deleted = changes.counter_deletes.len();
        report.duration_ms = started.elapsed().as_millis() as u64;

        let intents = self.intents(&changes.opened, &cleared, &owners, now);

        Ok(CycleOutcome {
            report,
            opened: changes.opened,
            cleared,
            intents,
        })
    }

    /// Deliver a committed cycle's notifications.
    pub async fn notify(&self, outcome: &CycleOutcome, dispatcher: &Dispatcher) -> NotificationSummary {
        let summary = dispatcher.dispatch_all(&outcome.intents).await;
        if summary.is_degraded() {
            warn!(
                delivered = summary.delivered,
                failed = summary.failed,
                rate_limited = summary.rate_limited,
                retry_after_secs = ?summary.retry_after_secs,
                "some alarm notifications were not delivered"
            );
        }
        summary
    }

    /// Run one cycle, then notify. Notification failures do not fail the cycle.
    pub async fn run_and_notify(
        &self,
        input: &CycleInput,
        dispatcher: &Dispatcher,
    ) -> Result<(CycleReport, NotificationSummary), CycleError> {
        let outcome = self.run_cycle(input).await?;
        let summary = self.notify(&outcome, dispatcher).await;
        Ok((outcome.report, summary))
    }

    fn intents(
        &self,
        opened: &[Alarm],
        cleared: &[Alarm],
        owners: &HashMap<EntityId, Option<String>>,
        now: DateTime<Utc>,
    ) -> Vec<NotificationIntent> {
        let recipients = |alarm: &Alarm| {
            let owner = owners.get(alarm.key.entity()).and_then(Option::as_deref);
            Recipients::new(self.admin_target.as_deref(), owner)
        };

        opened
            .iter()
            .map(|alarm| NotificationIntent::new(NotificationKind::Opened, alarm, now, recipients(alarm)))
            .chain(cleared.iter().map(|alarm| {
                NotificationIntent::new(NotificationKind::Cleared, alarm, now, recipients(alarm))
            }))
            .collect()
    }
}

/// One snapshot per inverter; a later duplicate replaces an earlier one so no
/// counter moves twice in a cycle.
fn latest_per_entity(snapshots: &[InverterSnapshot]) -> Vec<&InverterSnapshot> {
    let mut position: HashMap<&EntityId, usize> = HashMap::new();
    let mut latest: Vec<&InverterSnapshot> = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        match position.get(&snapshot.entity) {
            Some(&idx) => {
                warn!(entity = %snapshot.entity, "duplicate snapshot in batch, using the later one");
                latest[idx] = snapshot;
            }
            None => {
                position.insert(&snapshot.entity, latest.len());
                latest.push(snapshot);
            }
        }
    }
    latest
}

fn owner_targets(snapshots: &[&InverterSnapshot]) -> HashMap<EntityId, Option<String>> {
    snapshots
        .iter()
        .map(|s| (s.entity.clone(), s.owner_target.clone()))
        .collect()
}
