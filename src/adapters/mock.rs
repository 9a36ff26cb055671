//! Scripted in-memory adapter for tests.
//!
//! Replies are keyed by the rendered command (`"SR:01"`). A queued one-shot
//! reply wins over the standing reply for the same command, which lets a test
//! script "HV off, then HV on" sequences. Queries without any reply time out,
//! like a silent instrument would.

use super::Adapter;
use crate::error::{XrayError, XrayResult};
use crate::protocol::Command;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Failure to inject for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Answer with [`XrayError::Timeout`].
    Timeout,
    /// Drop the connection; later calls fail with `NotConnected`.
    Disconnect,
}

#[derive(Default)]
struct MockState {
    connected: bool,
    replies: HashMap<String, Vec<u8>>,
    queued: HashMap<String, VecDeque<Vec<u8>>>,
    failures: HashMap<String, MockFailure>,
    sent: Vec<String>,
    latency: Duration,
}

/// In-memory [`Adapter`] answering from scripted replies.
#[derive(Default)]
pub struct MockAdapter {
    state: Mutex<MockState>,
}

impl MockAdapter {
    /// A connected adapter without any scripted replies.
    pub fn new() -> Self {
        let adapter = Self::default();
        adapter.lock().connected = true;
        adapter
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Standing reply for `command`; the terminator is appended.
    pub fn set_reply(&self, command: &str, reply: &str) {
        self.lock()
            .replies
            .insert(command.to_string(), format!("{}\n", reply).into_bytes());
    }

    /// Standing numeric reply in the instrument's 10-digit format.
    pub fn set_int(&self, command: &str, value: i32) {
        self.set_reply(command, &format!("*{:010}", value));
    }

    /// One-shot reply consumed by the next exchange of `command`.
    pub fn push_reply(&self, command: &str, reply: &str) {
        self.lock()
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(format!("{}\n", reply).into_bytes());
    }

    pub fn push_int(&self, command: &str, value: i32) {
        self.push_reply(command, &format!("*{:010}", value));
    }

    pub fn fail(&self, command: &str, failure: MockFailure) {
        self.lock().failures.insert(command.to_string(), failure);
    }

    /// Delay every send and exchange, so concurrent callers get a chance to
    /// interleave.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn clear_failure(&self, command: &str) {
        self.lock().failures.remove(command);
    }

    /// Every command sent so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn record(&self, command: &Command) -> XrayResult<String> {
        let mut state = self.lock();
        if !state.connected {
            return Err(XrayError::NotConnected("mock".to_string()));
        }
        let key = command.to_string();
        state.sent.push(key.clone());
        match state.failures.get(&key) {
            Some(MockFailure::Timeout) => Err(XrayError::Timeout {
                command: key,
                timeout: Duration::from_secs(1),
            }),
            Some(MockFailure::Disconnect) => {
                state.connected = false;
                Err(XrayError::Connection(format!("mock dropped on '{}'", key)))
            }
            None => Ok(key),
        }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn terminator(&self) -> &str {
        "\n"
    }

    fn default_config(&self) -> serde_json::Value {
        json!({ "replies": self.lock().replies.len() })
    }

    async fn connect(&self) -> XrayResult<()> {
        self.lock().connected = true;
        Ok(())
    }

    async fn close(&self) -> XrayResult<()> {
        self.lock().connected = false;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn send(&self, command: &Command) -> XrayResult<()> {
        self.record(command)?;
        self.delay().await;
        Ok(())
    }

    async fn exchange(&self, command: &Command, timeout: Option<Duration>) -> XrayResult<Vec<u8>> {
        let key = self.record(command)?;
        self.delay().await;
        let mut state = self.lock();
        if let Some(reply) = state.queued.get_mut(&key).and_then(VecDeque::pop_front) {
            return Ok(reply);
        }
        state
            .replies
            .get(&key)
            .cloned()
            .ok_or_else(|| XrayError::Timeout {
                command: key,
                timeout: timeout.unwrap_or(Duration::from_secs(1)),
            })
    }
}
