//! Closing open alarms that the current cycle no longer detects.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use pvwatch_core::{Alarm, DetectionKey};

use crate::state::OpenAlarmIndex;

/// Open alarms to close this cycle, with `cleared_at` set to `now`.
///
/// Every rule type clears the same way: an alarm closes when its key is not
/// in the still-detected set. Types that do not auto-clear are left alone.
pub fn alarms_to_close(
    open: &OpenAlarmIndex,
    still_detected: &HashSet<DetectionKey>,
    now: DateTime<Utc>,
) -> Vec<Alarm> {
    let mut closed: Vec<Alarm> = open
        .iter()
        .filter(|alarm| alarm.key.rule().auto_clears())
        .filter(|alarm| !still_detected.contains(&alarm.key))
        .map(|alarm| Alarm {
            cleared_at: Some(now),
            ..alarm.clone()
        })
        .collect();
    closed.sort_by(|a, b| a.key.cmp(&b.key));
    closed
}
