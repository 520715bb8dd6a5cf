//! Detection rules and the per-cycle evaluation they write into.
//!
//! Every rule reduces one reading to an [`Observation`]:
//!
//! - `Present` increments the key's counter and opens an alarm once the
//!   confirmation threshold is reached.
//! - `Absent` resets the counter. An open alarm for the key is not marked
//!   still-detected, so reconciliation closes it.
//! - `Held` freezes the counter and keeps any open alarm alive. Rules hold
//!   below their activity floor, and channels hold when the reading is missing
//!   or the inverter is offline.
//!
//! The [`DetectionEngine`] applies all rules of one inverter to an
//! [`Evaluation`], which owns the counters and collects the still-detected
//! set and the alarms to open.

pub mod half_string;
pub mod mppt;
pub mod offline;
pub mod string_down;
pub mod units;


use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use pvwatch_core::{
    Alarm, Counter, DetectionConfig, DetectionKey, EntityConfig, EntityId, InverterSnapshot,
    RecoveryGraceStatus, RuleType, Severity,
};

use crate::state::{CounterIndex, OpenAlarmIndex};

pub use units::{MonitoredUnit, OFFLINE_DETAIL};

/// Slack on band edges so a reading exactly at `fraction * peak` is inside
/// the band even when the product rounds away from it.
const BAND_EDGE_TOLERANCE: f64 = 1e-9;

/// Whether `reading` lies in `[low * peak, high * peak]`, edges inclusive.
pub(crate) fn within_band(reading: f64, peak: f64, (low, high): (f64, f64)) -> bool {
    reading >= low * peak - BAND_EDGE_TOLERANCE && reading <= high * peak + BAND_EDGE_TOLERANCE
}

/// What one rule saw for one key this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Present,
    Absent,
    Held,
}

// ── Evaluation ──────────────────────────────────────────────────────

/// Mutable state of one cycle's detection pass.
pub struct Evaluation<'a> {
    now: DateTime<Utc>,
    open: &'a OpenAlarmIndex,
    counters: CounterIndex,
    still_detected: HashSet<DetectionKey>,
    opened: Vec<Alarm>,
    channels_skipped: usize,
}

/// Result of a detection pass, ready for reconciliation.
#[derive(Debug, Default)]
pub struct EvaluationOutcome {
    pub still_detected: HashSet<DetectionKey>,
    pub opened: Vec<Alarm>,
    pub counter_upserts: Vec<(DetectionKey, Counter)>,
    pub counter_deletes: Vec<DetectionKey>,
    pub channels_skipped: usize,
}

impl<'a> Evaluation<'a> {
    pub fn new(counters: CounterIndex, open: &'a OpenAlarmIndex, now: DateTime<Utc>) -> Self {
        Self {
            now,
            open,
            counters,
            still_detected: HashSet::new(),
            opened: Vec::new(),
            channels_skipped: 0,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn counters(&self) -> &CounterIndex {
        &self.counters
    }

    /// Apply an observation to a key that needs `confirm` consecutive cycles.
    pub fn debounced(
        &mut self,
        key: DetectionKey,
        observation: Observation,
        confirm: u32,
        severity: Severity,
        message: impl FnOnce() -> String,
    ) {
        match observation {
            Observation::Present => {
                let count = self.counters.increment(&key, self.now);
                if self.open.contains(&key) {
                    self.still_detected.insert(key);
                } else if count >= confirm {
                    self.open_alarm(key, severity, message());
                } else {
                    debug!(key = %key, count, confirm, "detection accruing");
                }
            }
            Observation::Absent => self.counters.reset(&key),
            Observation::Held => self.hold(&key),
        }
    }

    /// Apply an observation to a key that opens on the first detected cycle.
    pub fn immediate(
        &mut self,
        key: DetectionKey,
        observation: Observation,
        severity: Severity,
        message: impl FnOnce() -> String,
    ) {
        match observation {
            Observation::Present => {
                if self.open.contains(&key) {
                    self.still_detected.insert(key);
                } else {
                    self.open_alarm(key, severity, message());
                }
            }
            Observation::Absent => {}
            Observation::Held => self.hold(&key),
        }
    }

    /// Keep an open alarm for the key alive without touching its counter.
    pub fn hold(&mut self, key: &DetectionKey) {
        if self.open.contains(key) {
            self.still_detected.insert(key.clone());
        }
    }

    /// Keep every open alarm of an inverter alive.
    pub fn hold_entity(&mut self, entity: &EntityId) {
        let keys: Vec<DetectionKey> = self.open.keys_for_entity(entity).cloned().collect();
        self.still_detected.extend(keys);
    }

    fn skip_channel(&mut self) {
        self.channels_skipped += 1;
    }

    fn open_alarm(&mut self, key: DetectionKey, severity: Severity, message: String) {
        debug!(key = %key, severity = severity.as_str(), "detection confirmed");
        self.opened.push(Alarm::open(key.clone(), severity, message, self.now));
        self.still_detected.insert(key);
    }

    pub fn finish(self) -> EvaluationOutcome {
        let (counter_upserts, counter_deletes) = self.counters.into_writes();
        EvaluationOutcome {
            still_detected: self.still_detected,
            opened: self.opened,
            counter_upserts,
            counter_deletes,
            channels_skipped: self.channels_skipped,
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Rules that apply to one channel of an inverter.
fn channel_rules(config: &EntityConfig, channel: u16) -> &'static [RuleType] {
    if config.is_aggregated() {
        &[
            RuleType::StringDown,
            RuleType::MpptTwoStringsDown,
            RuleType::MpptOneStringDown,
        ]
    } else if config.half_string_eligible(channel) {
        &[RuleType::StringDown, RuleType::HalfStringWorking]
    } else {
        &[RuleType::StringDown]
    }
}

/// Applies the detection rules to inverter snapshots.
#[derive(Debug, Clone, Default)]
pub struct DetectionEngine {
    config: DetectionConfig,
}

impl DetectionEngine {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Evaluate every rule of one inverter.
    pub fn evaluate(
        &self,
        eval: &mut Evaluation<'_>,
        snapshot: &InverterSnapshot,
        config: &EntityConfig,
        grace: &RecoveryGraceStatus,
    ) {
        let entity = &snapshot.entity;
        let peak = snapshot.peak_current;

        let offline_key = DetectionKey::new(entity.clone(), RuleType::InverterOffline, OFFLINE_DETAIL);
        let observation = offline::observe(snapshot, grace, eval.now());
        eval.immediate(offline_key, observation, Severity::Critical, || {
            offline::message(snapshot)
        });

        let aggregated = config.is_aggregated();
        for channel in config.active_channels.iter() {
            let unit = MonitoredUnit::for_channel(channel, aggregated);
            let detail = unit.detail();
            let key = |rule: RuleType| DetectionKey::new(entity.clone(), rule, detail.as_str());

            // Offline readings say nothing about individual channels.
            let reading = match (snapshot.is_offline, snapshot.reading(channel)) {
                (false, Some(reading)) => reading,
                (offline, _) => {
                    if !offline {
                        warn!(entity = %entity, channel, "channel reading missing, holding its rules");
                        eval.skip_channel();
                    }
                    for rule in channel_rules(config, channel) {
                        eval.hold(&key(*rule));
                    }
                    continue;
                }
            };

            eval.debounced(
                key(RuleType::StringDown),
                string_down::observe(peak, reading, &self.config),
                self.config.string_down_confirm,
                Severity::High,
                || string_down::message(&detail, peak, reading),
            );

            if aggregated {
                let observation = mppt::observe(peak, reading, &self.config);
                eval.debounced(
                    key(RuleType::MpptTwoStringsDown),
                    observation.two_down(),
                    self.config.partial_confirm,
                    Severity::High,
                    || mppt::message(&detail, peak, reading, 2),
                );
                eval.debounced(
                    key(RuleType::MpptOneStringDown),
                    observation.one_down(),
                    self.config.partial_confirm,
                    Severity::Medium,
                    || mppt::message(&detail, peak, reading, 1),
                );
            } else if config.half_string_eligible(channel) {
                eval.debounced(
                    key(RuleType::HalfStringWorking),
                    half_string::observe(peak, reading, &self.config),
                    self.config.partial_confirm,
                    Severity::Medium,
                    || half_string::message(&detail, peak, reading),
                );
            }
        }
    }
}
