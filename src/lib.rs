//! Core library for the Seifert X-ray generator adapter.
//!
//! This library contains the protocol codec, the TCP session and the
//! instrument controller for GE/Seifert ID3003-style X-ray generators. It is
//! used by the `seifert_xray` command-line tool and by hosts that embed the
//! controller and drive `poll_once` on their own schedule.

pub mod adapters;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod protocol;
pub mod simulator;

pub use config::XrayConfig;
pub use error::{XrayError, XrayResult};
pub use instrument::{Action, FieldValue, InstrumentEvent, InstrumentState, SeifertXray, Snapshot, WritableField};
