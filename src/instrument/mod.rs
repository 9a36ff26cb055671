//! Generator control: state machine, typed fields and the controller.

pub mod fields;
pub mod seifert_xray;
pub mod state;

pub use fields::{Action, FieldValue, PolledField, Setpoints, ShutterControl, WritableField};
pub use seifert_xray::{InstrumentEvent, SeifertXray, Snapshot};
pub use state::{InstrumentState, InstrumentStateMachine, Transition};
