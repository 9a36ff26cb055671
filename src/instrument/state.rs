//! Operational state of the generator and the rules for moving between states.
//!
//! The machine never talks to the instrument itself. The controller asks it
//! whether an operation is legal, performs the I/O, and then reports what the
//! hardware said back through the `confirm_*` / `observe_*` methods.

use crate::error::{XrayError, XrayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Operational state as tracked by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentState {
    #[default]
    Off,
    On,
    Error,
}

impl InstrumentState {
    pub const ANY: &'static [InstrumentState] =
        &[InstrumentState::Off, InstrumentState::On, InstrumentState::Error];
    pub const OPERATIONAL: &'static [InstrumentState] = &[InstrumentState::Off, InstrumentState::On];
}

impl fmt::Display for InstrumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstrumentState::Off => "Off",
            InstrumentState::On => "On",
            InstrumentState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// A state change, as reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transition {
    TurnedOn,
    TurnedOff,
    ObservedOn,
    ObservedOff,
    Fault(i32),
    Acknowledged,
}

#[derive(Debug, Clone)]
pub struct InstrumentStateMachine {
    state: InstrumentState,
    /// Where an acknowledged fault returns to.
    resume: InstrumentState,
    fault_code: i32,
    ack_pending: bool,
    non_fault_codes: Vec<i32>,
    auto_follow: bool,
}

impl Default for InstrumentStateMachine {
    fn default() -> Self {
        Self::new(vec![76], true)
    }
}

impl InstrumentStateMachine {
    /// `non_fault_codes` are nonzero `SR:12` values that are informational
    /// (76 is "Stand-by").
    pub fn new(non_fault_codes: Vec<i32>, auto_follow: bool) -> Self {
        Self {
            state: InstrumentState::Off,
            resume: InstrumentState::Off,
            fault_code: 0,
            ack_pending: false,
            non_fault_codes,
            auto_follow,
        }
    }

    pub fn state(&self) -> InstrumentState {
        self.state
    }

    /// Last fault code seen on `SR:12`.
    pub fn fault_code(&self) -> i32 {
        self.fault_code
    }

    pub fn resume_state(&self) -> InstrumentState {
        self.resume
    }

    pub fn is_ack_pending(&self) -> bool {
        self.ack_pending
    }

    pub fn auto_follow(&self) -> bool {
        self.auto_follow
    }

    pub fn is_fault(&self, code: i32) -> bool {
        code != 0 && !self.non_fault_codes.contains(&code)
    }

    /// Fail with `StateViolation` unless the current state is in `allowed`.
    pub fn ensure_allowed(&self, operation: &str, allowed: &[InstrumentState]) -> XrayResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(XrayError::StateViolation {
                operation: operation.to_string(),
                state: self.state,
            })
        }
    }

    /// High voltage read back after `HV:1`.
    pub fn confirm_turn_on(&mut self, high_voltage: bool) -> Option<Transition> {
        if self.state != InstrumentState::Off {
            return None;
        }
        if !high_voltage {
            warn!("High voltage did not come on after turn_on; staying Off");
            return None;
        }
        self.state = InstrumentState::On;
        info!("Instrument turned On");
        Some(Transition::TurnedOn)
    }

    /// High voltage read back after `HV:0`.
    pub fn confirm_turn_off(&mut self, high_voltage: bool) -> Option<Transition> {
        if self.state != InstrumentState::On {
            return None;
        }
        if high_voltage {
            warn!("High voltage still on after turn_off; staying On");
            return None;
        }
        self.state = InstrumentState::Off;
        info!("Instrument turned Off");
        Some(Transition::TurnedOff)
    }

    /// Reconcile with the polled high-voltage bit.
    ///
    /// Idempotent. While in `Error` only the resume state follows the hardware.
    pub fn observe_hardware(&mut self, high_voltage: bool) -> Option<Transition> {
        if !self.auto_follow {
            return None;
        }
        let observed = if high_voltage {
            InstrumentState::On
        } else {
            InstrumentState::Off
        };

        if self.state == InstrumentState::Error {
            self.resume = observed;
            return None;
        }
        if self.state == observed {
            return None;
        }

        info!(from = %self.state, to = %observed, "Following hardware state");
        self.state = observed;
        Some(if high_voltage {
            Transition::ObservedOn
        } else {
            Transition::ObservedOff
        })
    }

    /// Feed the latest `SR:12` value.
    pub fn observe_fault_code(&mut self, code: i32) -> Option<Transition> {
        self.fault_code = code;

        if self.is_fault(code) {
            if self.state == InstrumentState::Error {
                return None;
            }
            warn!(code, from = %self.state, "Fault reported, entering Error");
            self.resume = self.state;
            self.state = InstrumentState::Error;
            self.ack_pending = false;
            return Some(Transition::Fault(code));
        }

        if self.state == InstrumentState::Error && self.ack_pending {
            self.state = self.resume;
            self.ack_pending = false;
            info!(to = %self.state, "Fault acknowledged");
            return Some(Transition::Acknowledged);
        }
        None
    }

    /// Record that the acknowledge command went out. The fault is only
    /// cleared once `SR:12` reads back as no-fault.
    pub fn acknowledge_sent(&mut self) {
        if self.state == InstrumentState::Error {
            self.ack_pending = true;
        }
    }
}
