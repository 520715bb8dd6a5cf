//! Per-cycle telemetry and per-inverter configuration.
//!
//! An [`InverterSnapshot`] is the reading of one inverter for one monitoring
//! cycle. An [`EntityConfig`] describes how its channels are wired. Both are
//! produced outside the engine and validated here, at the boundary, so the
//! detection loop only ever sees typed values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PvError;

// ── Entity identity ───────────────────────────────────────────

/// Identity of one monitored inverter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub plant: String,
    pub inverter: String,
}

impl EntityId {
    pub fn new(plant: impl Into<String>, inverter: impl Into<String>) -> Self {
        Self {
            plant: plant.into(),
            inverter: inverter.into(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plant, self.inverter)
    }
}

// ── Vendor kind ───────────────────────────────────────────────

/// How the vendor API reports channel currents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorKind {
    /// One reading per physical string.
    PerString,
    /// One reading per MPPT unit aggregating three strings.
    Aggregated,
}

impl VendorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VendorKind::PerString => "per_string",
            VendorKind::Aggregated => "aggregated",
        }
    }
}

impl FromStr for VendorKind {
    type Err = PvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_string" | "string" => Ok(VendorKind::PerString),
            "aggregated" => Ok(VendorKind::Aggregated),
            other => Err(PvError::UnknownVendorKind(other.to_string())),
        }
    }
}

// ── Grouping topology ─────────────────────────────────────────

/// How physical strings are grouped onto the inverter's channels.
///
/// Tags as stored in configuration:
/// - `ALL_1P`: one string per channel
/// - `ALL_2P`: two parallel strings on every channel
/// - `ALL_3P`: three strings aggregated per channel (MPPT unit)
/// - `2P_RANGE:<first>-<last>`: two parallel strings on channels `first..=last` only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupingTopology {
    Single,
    Parallel,
    Aggregated,
    ParallelRange { first: u16, last: u16 },
}

impl GroupingTopology {
    pub fn tag(&self) -> String {
        match self {
            GroupingTopology::Single => "ALL_1P".to_string(),
            GroupingTopology::Parallel => "ALL_2P".to_string(),
            GroupingTopology::Aggregated => "ALL_3P".to_string(),
            GroupingTopology::ParallelRange { first, last } => format!("2P_RANGE:{first}-{last}"),
        }
    }
}

impl FromStr for GroupingTopology {
    type Err = PvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_uppercase();
        match tag.as_str() {
            "ALL_1P" => return Ok(GroupingTopology::Single),
            "ALL_2P" => return Ok(GroupingTopology::Parallel),
            "ALL_3P" => return Ok(GroupingTopology::Aggregated),
            _ => {}
        }

        let range = tag
            .strip_prefix("2P_RANGE:")
            .ok_or_else(|| PvError::UnknownGrouping(s.to_string()))?;
        let (first, last) = range
            .split_once('-')
            .ok_or_else(|| PvError::UnknownGrouping(s.to_string()))?;
        let first: u16 = first
            .trim()
            .parse()
            .map_err(|_| PvError::UnknownGrouping(s.to_string()))?;
        let last: u16 = last
            .trim()
            .parse()
            .map_err(|_| PvError::UnknownGrouping(s.to_string()))?;
        if first == 0 || last < first {
            return Err(PvError::UnknownGrouping(s.to_string()));
        }
        Ok(GroupingTopology::ParallelRange { first, last })
    }
}

impl Serialize for GroupingTopology {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.tag())
    }
}

impl<'de> Deserialize<'de> for GroupingTopology {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(serde::de::Error::custom)
    }
}

// ── Active channels ───────────────────────────────────────────

/// Validated set of active 1-based channel indices.
///
/// Never empty, sorted ascending, no duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<i64>", into = "Vec<u16>")]
pub struct ActiveChannels(Vec<u16>);

impl ActiveChannels {
    /// Validate a list of raw indices.
    pub fn new(raw: Vec<i64>) -> Result<Self, PvError> {
        if raw.is_empty() {
            return Err(PvError::InvalidChannels("no active channels".to_string()));
        }
        let mut channels = Vec::with_capacity(raw.len());
        for idx in raw {
            let channel = u16::try_from(idx)
                .ok()
                .filter(|c| *c > 0)
                .ok_or_else(|| PvError::InvalidChannels(format!("channel index {idx} out of range")))?;
            channels.push(channel);
        }
        channels.sort_unstable();
        channels.dedup();
        Ok(Self(channels))
    }

    /// Parse the stored configuration value.
    ///
    /// Accepts a JSON array of integers, a string holding a JSON array, or a
    /// string with a comma-separated list (`"1,2,5"`).
    pub fn from_json(value: &serde_json::Value) -> Result<Self, PvError> {
        match value {
            serde_json::Value::Array(items) => {
                let raw = items
                    .iter()
                    .map(|v| {
                        v.as_i64()
                            .ok_or_else(|| PvError::InvalidChannels(format!("non-integer entry {v}")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Self::new(raw)
            }
            serde_json::Value::String(s) => s.parse(),
            other => Err(PvError::InvalidChannels(format!("unsupported value {other}"))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, channel: u16) -> bool {
        self.0.binary_search(&channel).is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for ActiveChannels {
    type Err = PvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.starts_with('[') {
            let value: serde_json::Value = serde_json::from_str(trimmed)
                .map_err(|e| PvError::InvalidChannels(e.to_string()))?;
            return Self::from_json(&value);
        }
        let raw = trimmed
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|part| {
                part.trim()
                    .parse::<i64>()
                    .map_err(|_| PvError::InvalidChannels(format!("not a number: {part}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(raw)
    }
}

impl TryFrom<Vec<i64>> for ActiveChannels {
    type Error = PvError;

    fn try_from(raw: Vec<i64>) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<ActiveChannels> for Vec<u16> {
    fn from(channels: ActiveChannels) -> Self {
        channels.0
    }
}

// ── Entity configuration ──────────────────────────────────────

/// Channel wiring of one inverter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub grouping: GroupingTopology,
    pub active_channels: ActiveChannels,
    pub vendor_kind: VendorKind,
}

impl EntityConfig {
    /// Whether each reported channel is an MPPT unit of three strings.
    pub fn is_aggregated(&self) -> bool {
        self.vendor_kind == VendorKind::Aggregated || self.grouping == GroupingTopology::Aggregated
    }

    /// Whether a channel carries two parallel strings and can run at half current.
    pub fn half_string_eligible(&self, channel: u16) -> bool {
        if self.is_aggregated() {
            return false;
        }
        match self.grouping {
            GroupingTopology::Parallel => true,
            GroupingTopology::ParallelRange { first, last } => (first..=last).contains(&channel),
            GroupingTopology::Single | GroupingTopology::Aggregated => false,
        }
    }
}

// ── Snapshot ──────────────────────────────────────────────────

/// Telemetry of one inverter for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterSnapshot {
    pub entity: EntityId,
    /// Vendor API the reading came from; keys the recovery grace lookup.
    pub vendor: String,
    /// Channel currents in amps; index 0 is channel 1.
    pub currents: Vec<Option<f64>>,
    /// Highest reading across all channels.
    pub peak_current: f64,
    /// Owner's notification target, if the plant has one.
    pub owner_target: Option<String>,
    /// Stale data or error status reported by the vendor.
    pub is_offline: bool,
}

impl InverterSnapshot {
    pub fn new(entity: EntityId, vendor: impl Into<String>, currents: Vec<Option<f64>>) -> Self {
        let peak_current = currents
            .iter()
            .flatten()
            .copied()
            .filter(|c| c.is_finite())
            .fold(0.0_f64, f64::max);
        Self {
            entity,
            vendor: vendor.into(),
            currents,
            peak_current,
            owner_target: None,
            is_offline: false,
        }
    }

    pub fn with_owner(mut self, target: impl Into<String>) -> Self {
        self.owner_target = Some(target.into());
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.is_offline = offline;
        self
    }

    /// Current of a 1-based channel, if reported and finite.
    pub fn reading(&self, channel: u16) -> Option<f64> {
        let idx = usize::from(channel).checked_sub(1)?;
        self.currents
            .get(idx)
            .copied()
            .flatten()
            .filter(|c| c.is_finite())
    }
}
