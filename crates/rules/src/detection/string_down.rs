//! STRING_DOWN: a channel producing nothing while the inverter is clearly active.

use pvwatch_core::DetectionConfig;

use super::Observation;

pub fn observe(peak: f64, reading: f64, config: &DetectionConfig) -> Observation {
    if peak <= config.string_down_floor {
        return Observation::Held;
    }
    if reading <= config.string_down_max_current {
        Observation::Present
    } else {
        Observation::Absent
    }
}

pub fn message(unit: &str, peak: f64, reading: f64) -> String {
    format!("{unit} reading {reading:.2} A while inverter peak is {peak:.2} A")
}
