//! What a reported channel stands for, and how alarms name it.

use std::fmt;
use std::ops::RangeInclusive;

/// Physical strings behind one MPPT input on aggregated inverters.
pub const STRINGS_PER_MPPT: u16 = 3;

/// Detail of the single offline key per inverter.
pub const OFFLINE_DETAIL: &str = "Inverter";

/// The unit a channel reading describes.
///
/// Per-string inverters report one string per channel. Aggregated inverters
/// report one MPPT input per channel, and MPPT `n` carries strings
/// `3n-2 ..= 3n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitoredUnit {
    String(u16),
    Mppt(u16),
}

impl MonitoredUnit {
    pub fn for_channel(channel: u16, aggregated: bool) -> Self {
        if aggregated {
            MonitoredUnit::Mppt(channel)
        } else {
            MonitoredUnit::String(channel)
        }
    }

    /// Strings wired into this unit.
    pub fn member_strings(&self) -> RangeInclusive<u16> {
        match *self {
            MonitoredUnit::String(n) => n..=n,
            MonitoredUnit::Mppt(n) => {
                let last = n.saturating_mul(STRINGS_PER_MPPT);
                last.saturating_sub(STRINGS_PER_MPPT - 1).max(1)..=last
            }
        }
    }

    /// Problem detail used in detection keys.
    pub fn detail(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for MonitoredUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitoredUnit::String(n) => write!(f, "String {n}"),
            MonitoredUnit::Mppt(n) => {
                let members: Vec<String> = self.member_strings().map(|s| s.to_string()).collect();
                write!(f, "MPPT {n} (strings {})", members.join(", "))
            }
        }
    }
}
