//! Seifert ID3003-style X-ray generator controller.
//!
//! `SeifertXray` owns one adapter session and the state machine for one
//! generator. Everything a host needs goes through three calls:
//!
//! - [`SeifertXray::apply_write`] validates a field value against the current
//!   state and range, then sends it (or stores it for a later action).
//! - [`SeifertXray::poll_once`] reads every telemetry field once and returns the
//!   refreshed [`Snapshot`]. A malformed reply skips that field only; a timeout
//!   or connection failure aborts the poll.
//! - [`SeifertXray::invoke_command`] runs a parameterless [`Action`].
//!
//! All three hold the controller lock for their whole duration, so a poll and a
//! write never interleave on the wire. Poll cadence is up to the caller.
//!
//! ## Configuration Example
//!
//! ```toml
//! [instrument]
//! id = "xrd-lab"
//! host = "192.168.1.20"
//! port = 10001
//! timeout_ms = 1000
//!
//! [units]
//! current_wire_per_display = 1000  # µA on the wire, mA for operators
//! voltage_wire_per_display = 1000  # V on the wire, kV for operators
//! ```

use super::fields::{Action, FieldValue, PolledField, Setpoints, WritableField};
use super::state::{InstrumentState, InstrumentStateMachine, Transition};
use crate::adapters::{Adapter, TcpAdapterBuilder};
use crate::config::{UnitSettings, XrayConfig};
use crate::error::{FormatErrorKind, XrayError, XrayResult};
use crate::protocol::codec::{format_setpoint, template_vars};
use crate::protocol::status_word::{self, map_for, DecodedStatusWord};
use crate::protocol::{Alias, Hms, ReplyValue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Notifications for the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum InstrumentEvent {
    StateChanged {
        from: InstrumentState,
        to: InstrumentState,
        transition: Transition,
    },
    Fault {
        code: i32,
        message: String,
    },
    /// A polled field was skipped because its reply was malformed.
    FieldError {
        field: String,
        error: String,
    },
    ConnectionLost {
        error: String,
    },
}

/// Target and actual value of one quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SetpointPair {
    /// Target in display units (mA or kV).
    pub target: i32,
    /// Measured value in display units.
    pub actual: i32,
    /// Target in wire units (µA or V), as reported.
    pub target_raw: i32,
    /// Measured value in wire units.
    pub actual_raw: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExposureTimer {
    pub target: Hms,
    pub actual: Hms,
    pub target_seconds: i32,
    pub actual_seconds: i32,
}

/// Water flow in Hz: alarm threshold (`SR:14`) and measured rate (`SR:15`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WaterFlow {
    pub minimum: i32,
    pub actual: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldFault {
    pub field: String,
    pub error: String,
}

/// Latest known telemetry. Fields whose last read failed keep their previous
/// value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    /// Instrument id from the configuration.
    pub id: String,
    /// Completion time of the last successful poll; `None` before the first.
    pub timestamp: Option<DateTime<Utc>>,
    pub state: InstrumentState,
    pub current: SetpointPair,
    pub voltage: SetpointPair,
    pub exposure_timer: ExposureTimer,
    /// Raw `SR:12` value; 0 and the configured non-fault codes are not faults.
    pub fault_code: i32,
    pub fault_message: String,
    /// Decoded bit-field status words keyed by `SR` number.
    pub status_words: BTreeMap<u8, DecodedStatusWord>,
    /// Beam shutter 3, from status word 4.
    pub beam_shutter_open: Option<bool>,
    pub water_flow: WaterFlow,
    /// Remaining warm-up time in seconds (`WT`).
    pub warmup_time: i32,
    pub focus: String,
    pub anode: String,
    /// Fields skipped in the most recent poll.
    pub errors: Vec<FieldFault>,
}

struct Inner {
    machine: InstrumentStateMachine,
    setpoints: Setpoints,
    snapshot: Snapshot,
}

/// Controller for one generator.
///
/// Cheap to share behind an `Arc`: every operation takes `&self` and the
/// internal lock keeps polls, writes and commands from overlapping.
pub struct SeifertXray {
    id: String,
    adapter: Arc<dyn Adapter>,
    reply_width: usize,
    units: UnitSettings,
    inner: Mutex<Inner>,
    events: broadcast::Sender<InstrumentEvent>,
}

impl SeifertXray {
    /// Controller driving `adapter`. Fails if `config` does not validate.
    pub fn new(adapter: Arc<dyn Adapter>, config: &XrayConfig) -> XrayResult<Self> {
        config.validate()?;
        let machine = InstrumentStateMachine::new(
            config.faults.non_fault_codes.clone(),
            config.instrument.auto_follow,
        );
        let snapshot = Snapshot {
            id: config.instrument.id.clone(),
            fault_message: status_word::fault_message(0),
            ..Snapshot::default()
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            id: config.instrument.id.clone(),
            adapter,
            reply_width: config.instrument.reply_width,
            units: config.units,
            inner: Mutex::new(Inner {
                machine,
                setpoints: Setpoints::default(),
                snapshot,
            }),
            events,
        })
    }

    /// Controller with a TCP session built from `config`. Not yet connected.
    pub fn from_config(config: &XrayConfig) -> XrayResult<Self> {
        let instrument = &config.instrument;
        let adapter = TcpAdapterBuilder::new(instrument.host.clone(), instrument.port)
            .with_name(instrument.id.clone())
            .with_timeout(instrument.timeout())
            .with_connect_timeout(instrument.connect_timeout())
            .with_terminator(instrument.terminator.clone())
            .build();
        Self::new(Arc::new(adapter), config)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    /// Receiver for events emitted from now on. Slow receivers lose the
    /// oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<InstrumentEvent> {
        self.events.subscribe()
    }

    /// Open the session. A no-op when already connected.
    pub async fn connect(&self) -> XrayResult<()> {
        self.adapter.connect().await
    }

    /// Drop the current session and open a new one. Never done implicitly.
    pub async fn reconnect(&self) -> XrayResult<()> {
        let _guard = self.inner.lock().await;
        info!(instrument = %self.id, "Reconnecting");
        self.adapter.close().await?;
        self.adapter.connect().await
    }

    pub async fn close(&self) -> XrayResult<()> {
        let _guard = self.inner.lock().await;
        self.adapter.close().await
    }

    pub async fn state(&self) -> InstrumentState {
        self.inner.lock().await.machine.state()
    }

    pub async fn setpoints(&self) -> Setpoints {
        self.inner.lock().await.setpoints
    }

    /// Snapshot from the most recent poll.
    pub async fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().await;
        let mut snapshot = inner.snapshot.clone();
        snapshot.state = inner.machine.state();
        snapshot
    }

    /// Write `value` to `field`.
    ///
    /// Rejected with `StateViolation` or `OutOfRange` before anything is sent.
    pub async fn apply_write(&self, field: WritableField, value: FieldValue) -> XrayResult<()> {
        let mut inner = self.inner.lock().await;
        inner.machine.ensure_allowed(field.key(), field.allowed_states())?;
        let token = field.render(&value)?;

        if let Some(alias) = field.alias() {
            self.send_alias(alias, &template_vars([("value", token.clone())]))
                .await?;
        }
        if field.range().is_some() {
            let v = field.check_int(&value)?;
            inner.setpoints.store(field, v);
        }

        info!(instrument = %self.id, field = %field, value = %token, "Field written");
        Ok(())
    }

    /// [`apply_write`](Self::apply_write) addressed by key, e.g. `"current.setpoint"`.
    pub async fn apply_write_key(&self, key: &str, value: FieldValue) -> XrayResult<()> {
        let field: WritableField = key.parse()?;
        self.apply_write(field, value).await
    }

    /// Run `action` if the current state allows it.
    ///
    /// Actions built from stored fields (`set_exposure_timer`,
    /// `set_warmup_program`, `set_voltage_current`) send the values stored by
    /// earlier [`apply_write`](Self::apply_write) calls.
    pub async fn invoke_command(&self, action: Action) -> XrayResult<()> {
        let mut inner = self.inner.lock().await;
        match action {
            Action::On => self.turn_on_locked(&mut inner).await.map(|_| ()),
            Action::Off => self.turn_off_locked(&mut inner).await.map(|_| ()),
            Action::AcknowledgeError => self.acknowledge_locked(&mut inner).await.map(|_| ()),
            Action::SetVoltageCurrent => {
                inner
                    .machine
                    .ensure_allowed(action.name(), action.allowed_states())?;
                let sp = inner.setpoints;
                self.send_alias(
                    WritableField::VoltageSetpoint.alias().unwrap_or_default(),
                    &template_vars([("value", format_setpoint(sp.voltage_kv))]),
                )
                .await?;
                self.send_alias(
                    WritableField::CurrentSetpoint.alias().unwrap_or_default(),
                    &template_vars([("value", format_setpoint(sp.current_ma))]),
                )
                .await?;
                info!(instrument = %self.id, voltage_kv = sp.voltage_kv, current_ma = sp.current_ma, "Voltage and current set");
                Ok(())
            }
            _ => {
                inner
                    .machine
                    .ensure_allowed(action.name(), action.allowed_states())?;
                let vars = action_vars(action, &inner.setpoints);
                self.send_alias(action.alias().unwrap_or_default(), &vars).await?;
                info!(instrument = %self.id, action = %action, "Command sent");
                Ok(())
            }
        }
    }

    /// [`invoke_command`](Self::invoke_command) addressed by name, e.g. `"open_shutter"`.
    pub async fn invoke_command_name(&self, name: &str) -> XrayResult<()> {
        let action: Action = name.parse()?;
        self.invoke_command(action).await
    }

    /// Switch high voltage on. Only legal from `Off`; the state only changes
    /// once status word 1 confirms it.
    pub async fn turn_on(&self) -> XrayResult<InstrumentState> {
        let mut inner = self.inner.lock().await;
        self.turn_on_locked(&mut inner).await
    }

    pub async fn turn_off(&self) -> XrayResult<InstrumentState> {
        let mut inner = self.inner.lock().await;
        self.turn_off_locked(&mut inner).await
    }

    /// Clear the active fault. Leaves `Error` once `SR:12` reads no-fault,
    /// either right away or on a later poll.
    pub async fn acknowledge(&self) -> XrayResult<InstrumentState> {
        let mut inner = self.inner.lock().await;
        self.acknowledge_locked(&mut inner).await
    }

    /// Read every polled field once.
    pub async fn poll_once(&self) -> XrayResult<Snapshot> {
        let mut inner = self.inner.lock().await;
        let mut errors = Vec::new();

        for field in PolledField::ALL {
            let result = match self.query(field).await {
                Ok(value) => self.apply_polled(&mut inner, field, value),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_connection_level() => {
                    warn!(instrument = %self.id, field = %field.name(), error = %e, "Poll aborted");
                    return Err(e);
                }
                Err(e) => {
                    warn!(instrument = %self.id, field = %field.name(), error = %e, "Skipping field");
                    self.emit(InstrumentEvent::FieldError {
                        field: field.name(),
                        error: e.to_string(),
                    });
                    errors.push(FieldFault {
                        field: field.name(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let state = inner.machine.state();
        let snapshot = &mut inner.snapshot;
        snapshot.errors = errors;
        snapshot.state = state;
        snapshot.timestamp = Some(Utc::now());
        debug!(instrument = %self.id, state = %state, skipped = snapshot.errors.len(), "Poll complete");
        Ok(snapshot.clone())
    }

    async fn turn_on_locked(&self, inner: &mut Inner) -> XrayResult<InstrumentState> {
        inner
            .machine
            .ensure_allowed("turn_on", Action::On.allowed_states())?;
        self.send_alias(Action::On.alias().unwrap_or_default(), &HashMap::new())
            .await?;
        let high_voltage = self.read_high_voltage(inner).await?;
        let from = inner.machine.state();
        if let Some(t) = inner.machine.confirm_turn_on(high_voltage) {
            self.emit_transition(from, inner.machine.state(), t);
        }
        Ok(inner.machine.state())
    }

    async fn turn_off_locked(&self, inner: &mut Inner) -> XrayResult<InstrumentState> {
        inner
            .machine
            .ensure_allowed("turn_off", Action::Off.allowed_states())?;
        self.send_alias(Action::Off.alias().unwrap_or_default(), &HashMap::new())
            .await?;
        let high_voltage = self.read_high_voltage(inner).await?;
        let from = inner.machine.state();
        if let Some(t) = inner.machine.confirm_turn_off(high_voltage) {
            self.emit_transition(from, inner.machine.state(), t);
        }
        Ok(inner.machine.state())
    }

    async fn acknowledge_locked(&self, inner: &mut Inner) -> XrayResult<InstrumentState> {
        self.send_alias(
            Action::AcknowledgeError.alias().unwrap_or_default(),
            &HashMap::new(),
        )
        .await?;
        inner.machine.acknowledge_sent();

        let value = self.query(PolledField::FaultCode).await?;
        self.apply_polled(inner, PolledField::FaultCode, value)?;
        if inner.machine.state() == InstrumentState::Error {
            info!(
                instrument = %self.id,
                code = inner.machine.fault_code(),
                "Fault still active after acknowledge"
            );
        }
        Ok(inner.machine.state())
    }

    /// Read status word 1 and return its high-voltage bit.
    async fn read_high_voltage(&self, inner: &mut Inner) -> XrayResult<bool> {
        let field = PolledField::StatusWord(1);
        let value = self.query(field).await?;
        let decoded = decode_word(1, &value)?;
        let on = decoded.is_set("high_voltage") == Some(true);
        inner.snapshot.status_words.insert(1, decoded);
        Ok(on)
    }

    /// Fold one polled value into the snapshot and the state machine.
    fn apply_polled(&self, inner: &mut Inner, field: PolledField, value: ReplyValue) -> XrayResult<()> {
        let current = self.units.current_wire_per_display;
        let voltage = self.units.voltage_wire_per_display;

        match field {
            PolledField::Focus => inner.snapshot.focus = value.into_text(),
            PolledField::Anode => inner.snapshot.anode = value.into_text(),
            PolledField::FaultCode => {
                let code = int_value(&value)?;
                self.apply_fault_code(inner, code);
            }
            PolledField::StatusWord(id) => {
                let decoded = decode_word(id, &value)?;
                if id == 1 {
                    let on = decoded.is_set("high_voltage") == Some(true);
                    let from = inner.machine.state();
                    if let Some(t) = inner.machine.observe_hardware(on) {
                        self.emit_transition(from, inner.machine.state(), t);
                    }
                }
                if id == 4 {
                    inner.snapshot.beam_shutter_open = decoded.is_set("shutter_3_status");
                }
                inner.snapshot.status_words.insert(id, decoded);
            }
            _ => {
                let v = int_value(&value)?;
                let snapshot = &mut inner.snapshot;
                match field {
                    PolledField::CurrentTarget => {
                        snapshot.current.target_raw = v;
                        snapshot.current.target = current.to_display(v);
                    }
                    PolledField::CurrentActual => {
                        snapshot.current.actual_raw = v;
                        snapshot.current.actual = current.to_display(v);
                    }
                    PolledField::VoltageTarget => {
                        snapshot.voltage.target_raw = v;
                        snapshot.voltage.target = voltage.to_display(v);
                    }
                    PolledField::VoltageActual => {
                        snapshot.voltage.actual_raw = v;
                        snapshot.voltage.actual = voltage.to_display(v);
                    }
                    PolledField::ExposureTarget => {
                        snapshot.exposure_timer.target_seconds = v;
                        snapshot.exposure_timer.target = Hms::from_total_seconds(v);
                    }
                    PolledField::ExposureActual => {
                        snapshot.exposure_timer.actual_seconds = v;
                        snapshot.exposure_timer.actual = Hms::from_total_seconds(v);
                    }
                    PolledField::WaterFlowMinimum => snapshot.water_flow.minimum = v,
                    PolledField::WaterFlowActual => snapshot.water_flow.actual = v,
                    PolledField::WarmupTime => snapshot.warmup_time = v,
                    PolledField::FaultCode
                    | PolledField::Focus
                    | PolledField::Anode
                    | PolledField::StatusWord(_) => {}
                }
            }
        }
        Ok(())
    }

    fn apply_fault_code(&self, inner: &mut Inner, code: i32) {
        let message = status_word::fault_message(code);
        inner.snapshot.fault_code = code;
        inner.snapshot.fault_message = message.clone();

        let from = inner.machine.state();
        if let Some(t) = inner.machine.observe_fault_code(code) {
            if let Transition::Fault(code) = t {
                error!(instrument = %self.id, code, message = %message, "Instrument fault");
                self.emit(InstrumentEvent::Fault { code, message });
            }
            self.emit_transition(from, inner.machine.state(), t);
        }
    }

    async fn query(&self, field: PolledField) -> XrayResult<ReplyValue> {
        let alias = Alias::parse(&field.alias())?;
        let command = alias.read_command()?;
        let raw = self
            .adapter
            .exchange(command, None)
            .await
            .map_err(|e| self.note_failure(e))?;
        alias
            .read_reply()?
            .parse_reply(&raw, self.reply_width, self.adapter.terminator())
    }

    async fn send_alias(&self, alias: &str, vars: &HashMap<String, String>) -> XrayResult<()> {
        let alias = Alias::parse(alias)?;
        let command = alias.write_command(vars)?;
        match alias.write_reply() {
            Some(reply) => {
                let raw = self
                    .adapter
                    .exchange(&command, None)
                    .await
                    .map_err(|e| self.note_failure(e))?;
                reply.parse_reply(&raw, self.reply_width, self.adapter.terminator())?;
            }
            None => self
                .adapter
                .send(&command)
                .await
                .map_err(|e| self.note_failure(e))?,
        }
        Ok(())
    }

    fn note_failure(&self, err: XrayError) -> XrayError {
        if matches!(err, XrayError::Connection(_) | XrayError::NotConnected(_)) {
            error!(instrument = %self.id, error = %err, "Connection lost");
            self.emit(InstrumentEvent::ConnectionLost {
                error: err.to_string(),
            });
        }
        err
    }

    fn emit_transition(&self, from: InstrumentState, to: InstrumentState, transition: Transition) {
        self.emit(InstrumentEvent::StateChanged {
            from,
            to,
            transition,
        });
    }

    fn emit(&self, event: InstrumentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn action_vars(action: Action, setpoints: &Setpoints) -> HashMap<String, String> {
    match action {
        Action::SetExposureTimer => {
            let t = setpoints.exposure_timer;
            template_vars([
                ("hours", format_setpoint(t.hours)),
                ("minutes", format_setpoint(t.minutes)),
                ("seconds", format_setpoint(t.seconds)),
            ])
        }
        Action::SetWarmupProgram => template_vars([
            ("interval", setpoints.warmup.interval.to_string()),
            ("voltage", format_setpoint(setpoints.warmup.voltage_kv)),
        ]),
        _ => HashMap::new(),
    }
}

fn int_value(value: &ReplyValue) -> XrayResult<i32> {
    value
        .as_int()
        .ok_or_else(|| XrayError::Template("integer field declared as text".to_string()))
}

fn decode_word(id: u8, value: &ReplyValue) -> XrayResult<DecodedStatusWord> {
    let v = int_value(value)?;
    let byte = u8::try_from(v)
        .map_err(|_| XrayError::format(FormatErrorKind::Overflow, v.to_string().as_bytes()))?;
    let map = map_for(id).ok_or_else(|| XrayError::Template(format!("no bit map for SW{}", id)))?;
    Ok(status_word::decode(byte, map))
}
