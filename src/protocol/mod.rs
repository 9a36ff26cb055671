//! The generator's wire protocol: command/reply codec, status-word decoding and
//! unit conversion. Nothing in here performs I/O.

pub mod codec;
pub mod status_word;
pub mod units;

pub use codec::{Alias, Command, ReplyTemplate, ReplyValue, DEFAULT_REPLY_WIDTH, REPLY_MARKER};
pub use status_word::{decode, fault_message, DecodedStatusWord, StatusWordMap};
pub use units::{Hms, UnitScale};
