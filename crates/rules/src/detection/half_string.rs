//! HALF_STRING_WORKING: one of two parallel strings on a channel has dropped out.

use pvwatch_core::DetectionConfig;

use super::{within_band, Observation};

pub fn observe(peak: f64, reading: f64, config: &DetectionConfig) -> Observation {
    if peak < config.partial_floor {
        return Observation::Held;
    }
    if within_band(reading, peak, config.half_string_band) && reading < peak {
        Observation::Present
    } else {
        Observation::Absent
    }
}

pub fn message(unit: &str, peak: f64, reading: f64) -> String {
    let share = if peak > 0.0 { reading / peak * 100.0 } else { 0.0 };
    format!(
        "{unit} at {reading:.2} A ({share:.0}% of peak {peak:.2} A): one of two parallel strings likely down"
    )
}
