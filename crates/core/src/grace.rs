//! Recovery grace windows for vendor APIs.
//!
//! When a vendor API comes back after failing, its inverters report stale
//! data until the backlog is caught up. Offline detection for that vendor is
//! suppressed until the window ends.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default window after a vendor API recovers.
pub const DEFAULT_RECOVERY_GRACE_MINUTES: i64 = 18;

/// Last known health of one vendor API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorHealth {
    pub vendor: String,
    pub healthy: bool,
    pub grace_ends_at: Option<DateTime<Utc>>,
}

impl VendorHealth {
    pub fn healthy(vendor: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            healthy: true,
            grace_ends_at: None,
        }
    }

    /// Apply a fresh health probe.
    ///
    /// Failing to healthy opens a grace window of `grace`; healthy to failing
    /// drops any running window. Other probes keep the current window.
    pub fn transition(&self, healthy_now: bool, now: DateTime<Utc>, grace: Duration) -> Self {
        let grace_ends_at = match (self.healthy, healthy_now) {
            (false, true) => Some(now + grace),
            (true, false) => None,
            _ => self.grace_ends_at,
        };
        Self {
            vendor: self.vendor.clone(),
            healthy: healthy_now,
            grace_ends_at,
        }
    }
}

/// Grace window end per vendor, as read at the start of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryGraceStatus {
    ends_at: HashMap<String, DateTime<Utc>>,
}

impl RecoveryGraceStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, vendor: impl Into<String>, ends_at: Option<DateTime<Utc>>) {
        let vendor = vendor.into();
        match ends_at {
            Some(end) => {
                self.ends_at.insert(vendor, end);
            }
            None => {
                self.ends_at.remove(&vendor);
            }
        }
    }

    /// Whether offline detection for `vendor` is suppressed at `now`.
    pub fn suppresses_offline(&self, vendor: &str, now: DateTime<Utc>) -> bool {
        self.ends_at.get(vendor).is_some_and(|end| now < *end)
    }
}

impl FromIterator<VendorHealth> for RecoveryGraceStatus {
    fn from_iter<I: IntoIterator<Item = VendorHealth>>(iter: I) -> Self {
        let mut status = Self::new();
        for health in iter {
            status.set(health.vendor, health.grace_ends_at);
        }
        status
    }
}
