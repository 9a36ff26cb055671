//! Transport adapters
//!
//! An [`Adapter`] owns the single connection to one generator and performs
//! request/reply exchanges on it, one at a time. The controller only talks to
//! this trait, so tests can swap the TCP session for [`MockAdapter`].

pub mod mock;
pub mod tcp_adapter;

pub use mock::{MockAdapter, MockFailure};
pub use tcp_adapter::{TcpAdapter, TcpAdapterBuilder};

use crate::error::XrayResult;
use crate::protocol::Command;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Terminator appended to commands and expected at the end of replies.
    fn terminator(&self) -> &str;

    /// Settings of this adapter, for diagnostics.
    fn default_config(&self) -> serde_json::Value;

    async fn connect(&self) -> XrayResult<()>;

    /// Release the connection. Closing an already closed adapter is a no-op.
    async fn close(&self) -> XrayResult<()>;

    async fn is_connected(&self) -> bool;

    /// Send a command that produces no reply.
    async fn send(&self, command: &Command) -> XrayResult<()>;

    /// Send a command and read one terminator-delimited reply.
    ///
    /// `timeout` overrides the adapter's default reply timeout. The returned
    /// bytes include the terminator.
    async fn exchange(&self, command: &Command, timeout: Option<Duration>) -> XrayResult<Vec<u8>>;
}
