//! Wire ↔ display unit conversion.
//!
//! The generator reports currents in µA, voltages in V and timer values in whole
//! seconds, while operators set and read mA, kV and H:M:S. All conversions are
//! integer floor divisions: the firmware never reports sub-unit precision, and the
//! truncation direction has to match what the front panel shows.

use serde::{Deserialize, Serialize};

/// Number of wire units in one display unit for a given quantity.
///
/// Firmware revisions disagree on whether the current is already reported in mA,
/// so the factor is configuration rather than a hard-coded constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitScale(pub i32);

impl UnitScale {
    /// µA → mA, V → kV.
    pub const MILLI: UnitScale = UnitScale(1000);
    /// Wire and display units are the same.
    pub const IDENTITY: UnitScale = UnitScale(1);

    /// Convert a wire value to display units, flooring the result.
    pub fn to_display(self, wire: i32) -> i32 {
        wire.div_euclid(self.0)
    }

    /// Convert a display value back to wire units.
    pub fn to_wire(self, display: i32) -> i32 {
        display.saturating_mul(self.0)
    }
}

impl Default for UnitScale {
    fn default() -> Self {
        UnitScale::MILLI
    }
}

/// Microamps to milliamps (floor).
pub fn micro_to_milli(wire: i32) -> i32 {
    UnitScale::MILLI.to_display(wire)
}

/// Volts to kilovolts (floor).
pub fn volts_to_kilovolts(wire: i32) -> i32 {
    UnitScale::MILLI.to_display(wire)
}

/// A duration split into hours, minutes and seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hms {
    pub hours: i32,
    pub minutes: i32,
    pub seconds: i32,
}

impl Hms {
    /// Components are taken as given, without carrying overflow into the
    /// next unit.
    pub fn new(hours: i32, minutes: i32, seconds: i32) -> Self {
        Self {
            hours,
            minutes,
            seconds,
        }
    }

    /// Split a total number of seconds: `m, s = divmod(t, 60); h, m = divmod(m, 60)`.
    pub fn from_total_seconds(total: i32) -> Self {
        let minutes = total.div_euclid(60);
        let seconds = total.rem_euclid(60);
        Self {
            hours: minutes.div_euclid(60),
            minutes: minutes.rem_euclid(60),
            seconds,
        }
    }

    pub fn total_seconds(&self) -> i32 {
        self.hours * 3600 + self.minutes * 60 + self.seconds
    }
}

impl std::fmt::Display for Hms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)
    }
}
