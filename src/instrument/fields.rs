//! Typed field, value and action declarations of the generator.
//!
//! Each writable field and action carries its command alias, the states in
//! which it may be used and, for numeric fields, its accepted range.

use super::state::InstrumentState;
use crate::error::{XrayError, XrayResult};
use crate::protocol::codec::format_setpoint;
use crate::protocol::Hms;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// A field the caller may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WritableField {
    /// Tube current target, mA (`SC`).
    CurrentSetpoint,
    /// Tube voltage target, kV (`SV`).
    VoltageSetpoint,
    ExposureHours,
    ExposureMinutes,
    ExposureSeconds,
    WarmupInterval,
    WarmupVoltage,
    /// Water-flow alarm threshold, Hz (`SW:14`).
    WaterFlowMinimum,
    KeypadEnabled,
    BeamShutterControl,
}

impl WritableField {
    pub const ALL: [WritableField; 10] = [
        WritableField::CurrentSetpoint,
        WritableField::VoltageSetpoint,
        WritableField::ExposureHours,
        WritableField::ExposureMinutes,
        WritableField::ExposureSeconds,
        WritableField::WarmupInterval,
        WritableField::WarmupVoltage,
        WritableField::WaterFlowMinimum,
        WritableField::KeypadEnabled,
        WritableField::BeamShutterControl,
    ];

    pub fn key(self) -> &'static str {
        match self {
            WritableField::CurrentSetpoint => "current.setpoint",
            WritableField::VoltageSetpoint => "voltage.setpoint",
            WritableField::ExposureHours => "exposure_timer.hours",
            WritableField::ExposureMinutes => "exposure_timer.minutes",
            WritableField::ExposureSeconds => "exposure_timer.seconds",
            WritableField::WarmupInterval => "warmup.interval",
            WritableField::WarmupVoltage => "warmup.voltage",
            WritableField::WaterFlowMinimum => "water_flow.minimum",
            WritableField::KeypadEnabled => "keypad.enabled",
            WritableField::BeamShutterControl => "beam_shutter.control",
        }
    }

    pub fn allowed_states(self) -> &'static [InstrumentState] {
        match self {
            WritableField::BeamShutterControl => InstrumentState::ANY,
            _ => InstrumentState::OPERATIONAL,
        }
    }

    /// Inclusive range of numeric fields.
    pub fn range(self) -> Option<(i32, i32)> {
        match self {
            WritableField::CurrentSetpoint => Some((0, 80)),
            WritableField::VoltageSetpoint | WritableField::WarmupVoltage => Some((0, 60)),
            WritableField::ExposureHours => Some((0, 99)),
            WritableField::ExposureMinutes | WritableField::ExposureSeconds => Some((0, 59)),
            WritableField::WarmupInterval => Some((0, 4)),
            WritableField::WaterFlowMinimum => Some((181, 250)),
            WritableField::KeypadEnabled => Some((0, 1)),
            WritableField::BeamShutterControl => None,
        }
    }

    /// Command alias for fields written straight to the instrument. Fields
    /// without one are stored and sent later by an action.
    pub fn alias(self) -> Option<&'static str> {
        match self {
            WritableField::CurrentSetpoint => Some("SC:{value};;;;"),
            WritableField::VoltageSetpoint => Some("SV:{value};;;;"),
            WritableField::WaterFlowMinimum => Some("SW:14:{value};;;;"),
            WritableField::KeypadEnabled => Some("KB:{value};;;;"),
            WritableField::BeamShutterControl => Some("CC:{value};;;;"),
            _ => None,
        }
    }

    /// Validate a numeric value against the field's range.
    pub fn check_int(self, value: &FieldValue) -> XrayResult<i32> {
        let v = value.to_int(self.key())?;
        if let Some((min, max)) = self.range() {
            if !(min..=max).contains(&v) {
                return Err(XrayError::OutOfRange {
                    field: self.key(),
                    value: v,
                    min,
                    max,
                });
            }
        }
        Ok(v)
    }

    /// Validate `value` and render the token substituted into the alias.
    pub fn render(self, value: &FieldValue) -> XrayResult<String> {
        match self {
            WritableField::BeamShutterControl => {
                ShutterControl::from_value(value).map(|c| c.wire().to_string())
            }
            WritableField::CurrentSetpoint | WritableField::VoltageSetpoint => {
                self.check_int(value).map(format_setpoint)
            }
            _ => self.check_int(value).map(|v| v.to_string()),
        }
    }
}

impl fmt::Display for WritableField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for WritableField {
    type Err = XrayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WritableField::ALL
            .into_iter()
            .find(|f| f.key() == s)
            .ok_or_else(|| XrayError::UnknownField(s.to_string()))
    }
}

/// A value supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i32),
    Text(String),
}

impl FieldValue {
    pub fn to_int(&self, field: &str) -> XrayResult<i32> {
        match self {
            FieldValue::Int(v) => Ok(*v),
            FieldValue::Text(s) => s.trim().parse().map_err(|_| XrayError::InvalidValue {
                field: field.to_string(),
                reason: format!("'{}' is not an integer", s),
            }),
        }
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Int(i32::from(v))
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

/// Who operates beam shutter 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterControl {
    Keypad,
    Computer,
}

impl ShutterControl {
    pub fn wire(self) -> &'static str {
        match self {
            ShutterControl::Keypad => "0000",
            ShutterControl::Computer => "0010",
        }
    }

    fn from_value(value: &FieldValue) -> XrayResult<Self> {
        let token = match value {
            FieldValue::Int(v) => format!("{:04}", v),
            FieldValue::Text(s) => s.trim().to_ascii_lowercase(),
        };
        match token.as_str() {
            "0000" | "keypad" => Ok(ShutterControl::Keypad),
            "0010" | "computer" => Ok(ShutterControl::Computer),
            _ => Err(XrayError::InvalidValue {
                field: WritableField::BeamShutterControl.key().to_string(),
                reason: format!("expected 0000 (keypad) or 0010 (computer), got '{}'", token),
            }),
        }
    }
}

/// A parameterless command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    On,
    Off,
    /// Send the stored voltage and current setpoints.
    SetVoltageCurrent,
    ExposureTimerOn,
    ExposureTimerOff,
    /// Send the stored exposure duration.
    SetExposureTimer,
    AcknowledgeError,
    /// Send the stored warm-up interval and voltage.
    SetWarmupProgram,
    OpenShutter,
    CloseShutter,
}

impl Action {
    pub const ALL: [Action; 10] = [
        Action::On,
        Action::Off,
        Action::SetVoltageCurrent,
        Action::ExposureTimerOn,
        Action::ExposureTimerOff,
        Action::SetExposureTimer,
        Action::AcknowledgeError,
        Action::SetWarmupProgram,
        Action::OpenShutter,
        Action::CloseShutter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Action::On => "on",
            Action::Off => "off",
            Action::SetVoltageCurrent => "set_voltage_current",
            Action::ExposureTimerOn => "exposure_timer_on",
            Action::ExposureTimerOff => "exposure_timer_off",
            Action::SetExposureTimer => "set_exposure_timer",
            Action::AcknowledgeError => "acknowledge_error",
            Action::SetWarmupProgram => "set_warmup_program",
            Action::OpenShutter => "open_shutter",
            Action::CloseShutter => "close_shutter",
        }
    }

    pub fn allowed_states(self) -> &'static [InstrumentState] {
        match self {
            Action::On => &[InstrumentState::Off],
            Action::Off => &[InstrumentState::On],
            Action::SetVoltageCurrent
            | Action::ExposureTimerOn
            | Action::ExposureTimerOff
            | Action::SetExposureTimer => InstrumentState::OPERATIONAL,
            Action::AcknowledgeError
            | Action::SetWarmupProgram
            | Action::OpenShutter
            | Action::CloseShutter => InstrumentState::ANY,
        }
    }

    /// Alias of single-command actions. `set_voltage_current` is a sequence
    /// and has none.
    pub fn alias(self) -> Option<&'static str> {
        match self {
            Action::On => Some("HV:1;;;;"),
            Action::Off => Some("HV:0;;;;"),
            Action::SetVoltageCurrent => None,
            Action::ExposureTimerOn => Some("TS:3;;;;"),
            Action::ExposureTimerOff => Some("TE:3;;;;"),
            Action::SetExposureTimer => Some("TP:3,{hours},{minutes},{seconds};;;;"),
            Action::AcknowledgeError => Some("CL;;;;"),
            Action::SetWarmupProgram => Some("WU:{interval},{voltage};;;;"),
            Action::OpenShutter => Some("OS:3;;;;"),
            Action::CloseShutter => Some("CS:3;;;;"),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = XrayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| XrayError::UnknownAction(s.to_string()))
    }
}

/// Stored warm-up program parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmupProgram {
    pub interval: i32,
    pub voltage_kv: i32,
}

/// Targets held by the controller, in display units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Setpoints {
    pub current_ma: i32,
    pub voltage_kv: i32,
    pub exposure_timer: Hms,
    pub warmup: WarmupProgram,
}

impl Setpoints {
    /// Remember a validated value. Fields the controller does not track are
    /// ignored.
    pub(crate) fn store(&mut self, field: WritableField, value: i32) {
        match field {
            WritableField::CurrentSetpoint => self.current_ma = value,
            WritableField::VoltageSetpoint => self.voltage_kv = value,
            WritableField::ExposureHours => self.exposure_timer.hours = value,
            WritableField::ExposureMinutes => self.exposure_timer.minutes = value,
            WritableField::ExposureSeconds => self.exposure_timer.seconds = value,
            WritableField::WarmupInterval => self.warmup.interval = value,
            WritableField::WarmupVoltage => self.warmup.voltage_kv = value,
            WritableField::WaterFlowMinimum
            | WritableField::KeypadEnabled
            | WritableField::BeamShutterControl => {}
        }
    }
}

/// A quantity read on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PolledField {
    CurrentTarget,
    CurrentActual,
    VoltageTarget,
    VoltageActual,
    ExposureTarget,
    ExposureActual,
    FaultCode,
    StatusWord(u8),
    WaterFlowMinimum,
    WaterFlowActual,
    WarmupTime,
    Focus,
    Anode,
}

impl PolledField {
    /// Every polled field, in the order one poll cycle reads them.
    pub const ALL: [PolledField; 17] = [
        PolledField::FaultCode,
        PolledField::StatusWord(1),
        PolledField::StatusWord(2),
        PolledField::StatusWord(3),
        PolledField::StatusWord(4),
        PolledField::StatusWord(6),
        PolledField::CurrentTarget,
        PolledField::CurrentActual,
        PolledField::VoltageTarget,
        PolledField::VoltageActual,
        PolledField::ExposureTarget,
        PolledField::ExposureActual,
        PolledField::WaterFlowMinimum,
        PolledField::WaterFlowActual,
        PolledField::WarmupTime,
        PolledField::Focus,
        PolledField::Anode,
    ];

    /// Read-only alias. Status words are queried as `SR:<id>`.
    pub fn alias(self) -> Cow<'static, str> {
        let alias = match self {
            PolledField::StatusWord(id) => {
                return Cow::Owned(format!(";;SR:{:02};*{{value:d}};", id));
            }
            PolledField::CurrentTarget => ";;CN;*{value:d};",
            PolledField::CurrentActual => ";;CA;*{value:d};",
            PolledField::VoltageTarget => ";;VN;*{value:d};",
            PolledField::VoltageActual => ";;VA;*{value:d};",
            PolledField::ExposureTarget => ";;TN:3;*{value:d};",
            PolledField::ExposureActual => ";;TA:3;*{value:d};",
            PolledField::FaultCode => ";;SR:12;*{value:d};",
            PolledField::WaterFlowMinimum => ";;SR:14;*{value:d};",
            PolledField::WaterFlowActual => ";;SR:15;*{value:d};",
            PolledField::WarmupTime => ";;WT;*{value:d};",
            PolledField::Focus => ";;FR;*{value};",
            PolledField::Anode => ";;MR;*{value};",
        };
        Cow::Borrowed(alias)
    }

    pub fn name(self) -> String {
        match self {
            PolledField::CurrentTarget => "current.target".to_string(),
            PolledField::CurrentActual => "current.actual".to_string(),
            PolledField::VoltageTarget => "voltage.target".to_string(),
            PolledField::VoltageActual => "voltage.actual".to_string(),
            PolledField::ExposureTarget => "exposure_timer.target".to_string(),
            PolledField::ExposureActual => "exposure_timer.actual".to_string(),
            PolledField::FaultCode => "status_word.12".to_string(),
            PolledField::StatusWord(id) => format!("status_word.{}", id),
            PolledField::WaterFlowMinimum => "water_flow.minimum".to_string(),
            PolledField::WaterFlowActual => "water_flow.actual".to_string(),
            PolledField::WarmupTime => "warmup.time".to_string(),
            PolledField::Focus => "focus".to_string(),
            PolledField::Anode => "anode".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Alias;

    #[test]
    fn test_field_keys_round_trip() {
        for field in WritableField::ALL {
            assert_eq!(field.key().parse::<WritableField>().unwrap(), field);
        }
        assert!(matches!(
            "current.setpiont".parse::<WritableField>(),
            Err(XrayError::UnknownField(_))
        ));
    }

    #[test]
    fn test_action_names_round_trip() {
        for action in Action::ALL {
            assert_eq!(action.name().parse::<Action>().unwrap(), action);
        }
        assert!("warmup_start".parse::<Action>().is_err());
    }

    #[test]
    fn test_all_aliases_parse() {
        for field in WritableField::ALL {
            if let Some(alias) = field.alias() {
                Alias::parse(alias).unwrap();
            }
        }
        for action in Action::ALL {
            if let Some(alias) = action.alias() {
                Alias::parse(alias).unwrap();
            }
        }
        for field in PolledField::ALL {
            Alias::parse(&field.alias()).unwrap().read_command().unwrap();
        }
    }

    #[test]
    fn test_status_word_query_follows_id() {
        let query = |id: u8| {
            Alias::parse(&PolledField::StatusWord(id).alias())
                .unwrap()
                .read_command()
                .unwrap()
                .to_string()
        };
        assert_eq!(query(1), "SR:01");
        assert_eq!(query(4), "SR:04");
        assert_eq!(query(6), "SR:06");
        assert_eq!(query(7), "SR:07");
    }

    #[test]
    fn test_render_pads_setpoints() {
        assert_eq!(WritableField::CurrentSetpoint.render(&5.into()).unwrap(), "05");
        assert_eq!(WritableField::VoltageSetpoint.render(&"45".into()).unwrap(), "45");
        assert_eq!(WritableField::WaterFlowMinimum.render(&181.into()).unwrap(), "181");
        assert_eq!(WritableField::KeypadEnabled.render(&true.into()).unwrap(), "1");
    }

    #[test]
    fn test_range_checks() {
        let err = WritableField::CurrentSetpoint.render(&81.into()).unwrap_err();
        assert!(matches!(
            err,
            XrayError::OutOfRange {
                field: "current.setpoint",
                value: 81,
                min: 0,
                max: 80
            }
        ));
        assert!(WritableField::WaterFlowMinimum.check_int(&180.into()).is_err());
        assert!(WritableField::ExposureMinutes.check_int(&60.into()).is_err());
        assert!(matches!(
            WritableField::VoltageSetpoint.check_int(&"forty".into()),
            Err(XrayError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_beam_shutter_control_values() {
        let field = WritableField::BeamShutterControl;
        assert_eq!(field.render(&"0010".into()).unwrap(), "0010");
        assert_eq!(field.render(&"keypad".into()).unwrap(), "0000");
        assert_eq!(field.render(&10.into()).unwrap(), "0010");
        assert!(field.render(&"0001".into()).is_err());
    }

    #[test]
    fn test_allowed_states() {
        assert_eq!(
            WritableField::CurrentSetpoint.allowed_states(),
            InstrumentState::OPERATIONAL
        );
        assert_eq!(Action::On.allowed_states(), &[InstrumentState::Off]);
        assert!(Action::AcknowledgeError
            .allowed_states()
            .contains(&InstrumentState::Error));
    }

    #[test]
    fn test_setpoints_store() {
        let mut sp = Setpoints::default();
        sp.store(WritableField::ExposureMinutes, 30);
        sp.store(WritableField::CurrentSetpoint, 5);
        sp.store(WritableField::KeypadEnabled, 1);
        assert_eq!(sp.exposure_timer, Hms::new(0, 30, 0));
        assert_eq!(sp.current_ma, 5);
    }
}
