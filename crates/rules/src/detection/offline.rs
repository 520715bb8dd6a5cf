//! INVERTER_OFFLINE: stale data or an error status, gated by vendor recovery grace.

use chrono::{DateTime, Utc};

use pvwatch_core::{InverterSnapshot, RecoveryGraceStatus};

use super::Observation;

/// Offline inverters are held while their vendor is inside its grace window,
/// so catch-up lag after an API outage neither opens nor clears the alarm.
pub fn observe(
    snapshot: &InverterSnapshot,
    grace: &RecoveryGraceStatus,
    now: DateTime<Utc>,
) -> Observation {
    if !snapshot.is_offline {
        Observation::Absent
    } else if grace.suppresses_offline(&snapshot.vendor, now) {
        Observation::Held
    } else {
        Observation::Present
    }
}

pub fn message(snapshot: &InverterSnapshot) -> String {
    format!(
        "Inverter {} is offline or reporting an error status ({})",
        snapshot.entity.inverter, snapshot.vendor
    )
}
