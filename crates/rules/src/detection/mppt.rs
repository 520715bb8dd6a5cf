//! MPPT partial faults on aggregated inverters.
//!
//! Each channel is an MPPT input carrying three strings, so losing one or two
//! of them shows up as the channel running at a fraction of the inverter's
//! peak. The two-down band is checked first; a channel can sit in at most one
//! band per cycle.

use pvwatch_core::DetectionConfig;

use super::{within_band, Observation};

/// Which partial fault, if any, a channel shows this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpptObservation {
    TwoDown,
    OneDown,
    Normal,
    Held,
}

impl MpptObservation {
    /// Observation for the two-down key.
    pub fn two_down(self) -> Observation {
        match self {
            MpptObservation::TwoDown => Observation::Present,
            MpptObservation::Held => Observation::Held,
            MpptObservation::OneDown | MpptObservation::Normal => Observation::Absent,
        }
    }

    /// Observation for the one-down key. A two-down cycle breaks the
    /// one-down streak.
    pub fn one_down(self) -> Observation {
        match self {
            MpptObservation::OneDown => Observation::Present,
            MpptObservation::Held => Observation::Held,
            MpptObservation::TwoDown | MpptObservation::Normal => Observation::Absent,
        }
    }
}

pub fn observe(peak: f64, reading: f64, config: &DetectionConfig) -> MpptObservation {
    if peak < config.partial_floor {
        MpptObservation::Held
    } else if within_band(reading, peak, config.mppt_two_down_band) {
        MpptObservation::TwoDown
    } else if within_band(reading, peak, config.mppt_one_down_band) {
        MpptObservation::OneDown
    } else {
        MpptObservation::Normal
    }
}

pub fn message(unit: &str, peak: f64, reading: f64, strings_down: u8) -> String {
    let share = if peak > 0.0 { reading / peak * 100.0 } else { 0.0 };
    let what = if strings_down >= 2 {
        "two strings likely down"
    } else {
        "one string likely down"
    };
    format!("{unit} at {reading:.2} A ({share:.0}% of peak {peak:.2} A): {what}")
}
