//! Alarm identity, debounce counters, alarm records and notification intents.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PvError;
use crate::telemetry::EntityId;

// ── Rule type ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    StringDown,
    HalfStringWorking,
    MpptOneStringDown,
    MpptTwoStringsDown,
    InverterOffline,
    ExternalVendorEvent,
}

impl RuleType {
    pub const ALL: [RuleType; 6] = [
        RuleType::StringDown,
        RuleType::HalfStringWorking,
        RuleType::MpptOneStringDown,
        RuleType::MpptTwoStringsDown,
        RuleType::InverterOffline,
        RuleType::ExternalVendorEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::StringDown => "STRING_DOWN",
            RuleType::HalfStringWorking => "HALF_STRING_WORKING",
            RuleType::MpptOneStringDown => "MPPT_ONE_STRING_DOWN",
            RuleType::MpptTwoStringsDown => "MPPT_TWO_STRINGS_DOWN",
            RuleType::InverterOffline => "INVERTER_OFFLINE",
            RuleType::ExternalVendorEvent => "EXTERNAL_VENDOR_EVENT",
        }
    }

    /// Whether the per-cycle reconciliation may close alarms of this type.
    ///
    /// Vendor events are opened out of band and only an operator closes them.
    pub fn auto_clears(&self) -> bool {
        !matches!(self, RuleType::ExternalVendorEvent)
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = PvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuleType::ALL
            .into_iter()
            .find(|r| r.as_str() == s.trim())
            .ok_or_else(|| PvError::UnknownRuleType(s.to_string()))
    }
}

// ── Severity ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = PvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            other => Err(PvError::UnknownSeverity(other.to_string())),
        }
    }
}

// ── Detection key ─────────────────────────────────────────────

/// Identity of one alarm condition: inverter, rule and discriminator.
///
/// The same key addresses the debounce counter and the open alarm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DetectionKey {
    entity: EntityId,
    rule: RuleType,
    detail: String,
}

impl DetectionKey {
    pub fn new(entity: EntityId, rule: RuleType, detail: impl Into<String>) -> Self {
        Self {
            entity,
            rule,
            detail: detail.into(),
        }
    }

    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    pub fn plant(&self) -> &str {
        &self.entity.plant
    }

    pub fn inverter(&self) -> &str {
        &self.entity.inverter
    }

    pub fn rule(&self) -> RuleType {
        self.rule
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for DetectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.entity, self.rule, self.detail)
    }
}

// ── Counters ──────────────────────────────────────────────────

/// Consecutive-occurrence counter for one detection key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub count: u32,
    pub last_detected_at: DateTime<Utc>,
}

// ── Alarms ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: Uuid,
    pub key: DetectionKey,
    pub severity: Severity,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
    /// Free-text note left by an operator.
    pub observation: Option<String>,
}

impl Alarm {
    pub fn open(
        key: DetectionKey,
        severity: Severity,
        message: impl Into<String>,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            severity,
            message: message.into(),
            triggered_at,
            cleared_at: None,
            observation: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.cleared_at.is_none()
    }
}

/// An open alarm being closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmClosure {
    pub alarm_id: Uuid,
    pub cleared_at: DateTime<Utc>,
}

// ── Cycle changes ─────────────────────────────────────────────

/// Every state mutation produced by one cycle, persisted as a single unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleChanges {
    pub counter_upserts: Vec<(DetectionKey, Counter)>,
    pub counter_deletes: Vec<DetectionKey>,
    pub opened: Vec<Alarm>,
    pub closed: Vec<AlarmClosure>,
}

impl CycleChanges {
    pub fn is_empty(&self) -> bool {
        self.counter_upserts.is_empty()
            && self.counter_deletes.is_empty()
            && self.opened.is_empty()
            && self.closed.is_empty()
    }
}

// ── Notification intents ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Opened,
    Cleared,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Opened => "opened",
            NotificationKind::Cleared => "cleared",
        }
    }
}

/// Who receives a notification. The owner is kept only when distinct from admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipients {
    pub admin: Option<String>,
    pub owner: Option<String>,
}

impl Recipients {
    /// Blank targets count as unset, and an owner equal to the admin is
    /// dropped so nobody gets the same message twice.
    pub fn new(admin: Option<&str>, owner: Option<&str>) -> Self {
        let admin = admin.map(str::trim).filter(|a| !a.is_empty());
        let owner = owner
            .map(str::trim)
            .filter(|o| !o.is_empty() && Some(*o) != admin);
        Self {
            admin: admin.map(str::to_string),
            owner: owner.map(str::to_string),
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.admin.as_deref().into_iter().chain(self.owner.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.admin.is_none() && self.owner.is_none()
    }
}

/// A message to deliver after a cycle committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub kind: NotificationKind,
    pub plant: String,
    pub inverter: String,
    pub rule_type: RuleType,
    pub problem_detail: String,
    pub severity: Severity,
    pub message: String,
    pub at: DateTime<Utc>,
    pub recipients: Recipients,
}

impl NotificationIntent {
    pub fn new(kind: NotificationKind, alarm: &Alarm, at: DateTime<Utc>, recipients: Recipients) -> Self {
        Self {
            kind,
            plant: alarm.key.plant().to_string(),
            inverter: alarm.key.inverter().to_string(),
            rule_type: alarm.key.rule(),
            problem_detail: alarm.key.detail().to_string(),
            severity: alarm.severity,
            message: alarm.message.clone(),
            at,
            recipients,
        }
    }
}
