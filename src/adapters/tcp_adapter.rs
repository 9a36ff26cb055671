//! TCP session to the generator's serial device server.

use super::Adapter;
use crate::error::{FormatErrorKind, XrayError, XrayResult};
use crate::protocol::Command;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Replies longer than this are rejected; the longest real reply is a dozen bytes.
pub const MAX_RESPONSE_SIZE: usize = 1024;

/// Builder for [`TcpAdapter`].
///
/// Defaults: 1 s reply timeout, 3 s connect timeout, `"\n"` terminator.
///
/// ```no_run
/// use std::time::Duration;
/// use seifert_xray::adapters::TcpAdapterBuilder;
///
/// let adapter = TcpAdapterBuilder::new("192.168.1.20", 10001)
///     .with_timeout(Duration::from_millis(500))
///     .build();
/// ```
pub struct TcpAdapterBuilder {
    name: String,
    host: String,
    port: u16,
    timeout: Duration,
    connect_timeout: Duration,
    terminator: String,
}

impl TcpAdapterBuilder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            name: "xray".to_string(),
            host: host.into(),
            port,
            timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(3),
            terminator: "\n".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Default reply timeout for [`Adapter::exchange`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    pub fn build(self) -> TcpAdapter {
        TcpAdapter {
            name: self.name,
            host: self.host,
            port: self.port,
            timeout: self.timeout,
            connect_timeout: self.connect_timeout,
            terminator: self.terminator,
            session: Mutex::new(Session::default()),
        }
    }
}

#[derive(Default)]
struct Session {
    stream: Option<TcpStream>,
    /// Bytes read but not yet handed out as a reply.
    buffer: Vec<u8>,
    /// Command whose reply is still owed by the instrument.
    stale: Option<String>,
}

impl Session {
    fn stream(&mut self, name: &str) -> XrayResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| XrayError::NotConnected(name.to_string()))
    }

    /// Forget the connection together with everything read from it.
    fn reset(&mut self) {
        self.stream = None;
        self.buffer.clear();
        self.stale = None;
    }

    /// Split the first terminator-delimited reply off the buffer.
    fn take_reply(&mut self, terminator: &[u8]) -> Option<Vec<u8>> {
        if terminator.is_empty() {
            return (!self.buffer.is_empty()).then(|| std::mem::take(&mut self.buffer));
        }
        let end = self
            .buffer
            .windows(terminator.len())
            .position(|w| w == terminator)?
            + terminator.len();
        let rest = self.buffer.split_off(end);
        Some(std::mem::replace(&mut self.buffer, rest))
    }

    /// Pull whatever the socket already holds and discard complete replies.
    ///
    /// A complete reply pays off the stale command. Bytes of a reply that is
    /// still arriving stay buffered while a stale command is pending, so the
    /// next read can discard the rest of it.
    fn drain_buffered(&mut self, name: &str, terminator: &[u8]) {
        if let Some(stream) = self.stream.as_mut() {
            let mut buf = [0u8; 256];
            while let Ok(n) = stream.try_read(&mut buf) {
                if n == 0 {
                    break;
                }
                self.buffer.extend_from_slice(&buf[..n]);
            }
        }

        while let Some(reply) = self.take_reply(terminator) {
            let stale = self.stale.take();
            warn!(
                adapter = name,
                stale_command = stale.as_deref().unwrap_or("<none>"),
                discarded = %String::from_utf8_lossy(&reply).trim_end(),
                "Discarded late reply before next command"
            );
        }
        if self.stale.is_none() && !self.buffer.is_empty() {
            warn!(
                adapter = name,
                discarded = %String::from_utf8_lossy(&self.buffer),
                "Discarded unsolicited bytes before next command"
            );
            self.buffer.clear();
        }
    }
}

/// One TCP connection to a generator, serialising all exchanges.
pub struct TcpAdapter {
    name: String,
    host: String,
    port: u16,
    timeout: Duration,
    connect_timeout: Duration,
    terminator: String,
    session: Mutex<Session>,
}

impl TcpAdapter {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TcpAdapterBuilder::new(host, port).build()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn write_command(
        &self,
        session: &mut Session,
        command: &Command,
        timeout: Duration,
    ) -> XrayResult<()> {
        session.drain_buffered(&self.name, self.terminator.as_bytes());
        let bytes = command.encode(&self.terminator);
        let stream = session.stream(&self.name)?;

        debug!(adapter = %self.name, command = %command, "Sending command");
        let written = tokio::time::timeout(timeout, stream.write_all(&bytes)).await;
        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                session.reset();
                Err(XrayError::Connection(format!(
                    "write of '{}' to {} failed: {}",
                    command,
                    self.address(),
                    e
                )))
            }
            Err(_) => {
                session.reset();
                Err(XrayError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Read the reply to `command`.
    ///
    /// If an earlier command timed out and its reply has not shown up yet, the
    /// first reply on the wire belongs to it and is discarded. When the
    /// deadline passes while that pairing is still in play, the session is
    /// dropped: there is no way left to tell which reply answers what.
    async fn read_reply(
        &self,
        session: &mut Session,
        command: &Command,
        timeout: Duration,
    ) -> XrayResult<Vec<u8>> {
        let terminator = self.terminator.as_bytes();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut owed = session.stale.take();
        let resyncing = owed.is_some();
        let mut buf = [0u8; 128];

        loop {
            if let Some(reply) = session.take_reply(terminator) {
                if let Some(stale) = owed.take() {
                    warn!(
                        adapter = %self.name,
                        stale_command = %stale,
                        command = %command,
                        discarded = %String::from_utf8_lossy(&reply).trim_end(),
                        "Discarded late reply"
                    );
                    continue;
                }
                let text = String::from_utf8_lossy(&reply);
                debug!(adapter = %self.name, reply = %text.trim_end(), "Received reply");
                return Ok(reply);
            }

            if session.buffer.len() > MAX_RESPONSE_SIZE {
                let raw = std::mem::take(&mut session.buffer);
                session.reset();
                return Err(XrayError::format(
                    FormatErrorKind::TooLarge {
                        max_bytes: MAX_RESPONSE_SIZE,
                    },
                    &raw,
                ));
            }

            let stream = session.stream(&self.name)?;
            let read = tokio::time::timeout_at(deadline, stream.read(&mut buf)).await;
            match read {
                Ok(Ok(0)) => {
                    session.reset();
                    return Err(XrayError::Connection(format!(
                        "{} closed the connection while waiting for reply to '{}'",
                        self.address(),
                        command
                    )));
                }
                Ok(Ok(n)) => session.buffer.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => {
                    session.reset();
                    return Err(XrayError::Connection(format!(
                        "read from {} failed: {}",
                        self.address(),
                        e
                    )));
                }
                Err(_) if resyncing => {
                    session.reset();
                    error!(
                        adapter = %self.name,
                        command = %command,
                        "Lost track of replies after a timeout; session dropped"
                    );
                    return Err(XrayError::Connection(format!(
                        "no reply to '{}' within {:?} while a late reply was outstanding; session to {} dropped",
                        command,
                        timeout,
                        self.address()
                    )));
                }
                Err(_) => {
                    session.stale = Some(command.to_string());
                    return Err(XrayError::Timeout {
                        command: command.to_string(),
                        timeout,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Adapter for TcpAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn terminator(&self) -> &str {
        &self.terminator
    }

    fn default_config(&self) -> serde_json::Value {
        json!({
            "host": self.host,
            "port": self.port,
            "timeout_ms": self.timeout.as_millis() as u64,
            "connect_timeout_ms": self.connect_timeout.as_millis() as u64,
            "terminator": self.terminator,
        })
    }

    async fn connect(&self) -> XrayResult<()> {
        let mut session = self.session.lock().await;
        if session.stream.is_some() {
            return Ok(());
        }

        let address = self.address();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                XrayError::Connection(format!(
                    "connecting to {} timed out after {:?}",
                    address, self.connect_timeout
                ))
            })?
            .map_err(|e| XrayError::Connection(format!("connecting to {} failed: {}", address, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| XrayError::Connection(e.to_string()))?;

        session.reset();
        session.stream = Some(stream);
        info!(adapter = %self.name, %address, "Connected");
        Ok(())
    }

    async fn close(&self) -> XrayResult<()> {
        let mut session = self.session.lock().await;
        if let Some(mut stream) = session.stream.take() {
            // The peer may already be gone; the socket is released either way.
            let _ = stream.shutdown().await;
            info!(adapter = %self.name, "Connection closed");
        }
        session.reset();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.session.lock().await.stream.is_some()
    }

    async fn send(&self, command: &Command) -> XrayResult<()> {
        let mut session = self.session.lock().await;
        self.write_command(&mut session, command, self.timeout).await
    }

    async fn exchange(&self, command: &Command, timeout: Option<Duration>) -> XrayResult<Vec<u8>> {
        let timeout = timeout.unwrap_or(self.timeout);
        let mut session = self.session.lock().await;
        self.write_command(&mut session, command, timeout).await?;
        self.read_reply(&mut session, command, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn test_builder_defaults() {
        let adapter = TcpAdapterBuilder::new("localhost", 10001).build();
        assert_eq!(adapter.name(), "xray");
        assert_eq!(adapter.terminator(), "\n");
        assert_eq!(adapter.timeout(), Duration::from_secs(1));
        let config = adapter.default_config();
        assert_eq!(config["port"], 10001);
        assert_eq!(config["timeout_ms"], 1000);
    }

    #[tokio::test]
    async fn test_exchange_reads_one_reply() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, "CN");
            // Split the reply to exercise the read loop.
            write.write_all(b"*00000").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            write.write_all(b"05000\n").await.unwrap();
        });

        let adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        let reply = adapter.exchange(&Command::new("CN"), None).await.unwrap();
        assert_eq!(reply, b"*0000005000\n".to_vec());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_requires_connection() {
        let adapter = TcpAdapter::new("127.0.0.1", 1);
        let err = adapter.exchange(&Command::new("CN"), None).await.unwrap_err();
        assert!(matches!(err, XrayError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (listener, port) = listener().await;
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        let start = std::time::Instant::now();
        let err = adapter
            .exchange(&Command::new("SR").arg("01"), None)
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        match err {
            XrayError::Timeout { command, timeout } => {
                assert_eq!(command, "SR:01");
                assert_eq!(timeout, Duration::from_secs(1));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);
        // A timeout leaves the session usable.
        assert!(adapter.is_connected().await);
    }

    #[tokio::test]
    async fn test_late_reply_is_discarded() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "CN");
            tokio::time::sleep(Duration::from_millis(200)).await;
            write.write_all(b"*0000000001\n").await.unwrap();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "VN");
            write.write_all(b"*0000000002\n").await.unwrap();
        });

        let adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        let err = adapter
            .exchange(&Command::new("CN"), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, XrayError::Timeout { .. }));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let reply = adapter.exchange(&Command::new("VN"), None).await.unwrap();
        assert_eq!(reply, b"*0000000002\n".to_vec());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_reply_after_next_command_is_not_returned() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "SR:12");
            // Hold the fault-code reply until the next query is on the wire.
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "SR:01");
            write.write_all(b"*0000000033\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            write.write_all(b"*0000000064\n").await.unwrap();
        });

        let adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        let err = adapter
            .exchange(&Command::new("SR").arg("12"), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, XrayError::Timeout { .. }));

        let reply = adapter
            .exchange(&Command::new("SR").arg("01"), None)
            .await
            .unwrap();
        assert_eq!(reply, b"*0000000064\n".to_vec());
        assert!(adapter.is_connected().await);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_reply_in_one_segment_with_next_reply() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "CN");
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "VN");
            write
                .write_all(b"*0000017000\n*0000019000\n")
                .await
                .unwrap();
        });

        let adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        assert!(adapter
            .exchange(&Command::new("CN"), Some(Duration::from_millis(50)))
            .await
            .is_err());
        let reply = adapter.exchange(&Command::new("VN"), None).await.unwrap();
        assert_eq!(reply, b"*0000019000\n".to_vec());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unpaired_reply_after_timeout_drops_session() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            // SR:12 is never answered; only one reply ever comes back.
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "SR:12");
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "SR:01");
            write.write_all(b"*0000000064\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        assert!(adapter
            .exchange(&Command::new("SR").arg("12"), Some(Duration::from_millis(50)))
            .await
            .is_err());

        let err = adapter
            .exchange(&Command::new("SR").arg("01"), Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, XrayError::Connection(_)), "{:?}", err);
        assert!(!adapter.is_connected().await);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_drops_session() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, _write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let _ = lines.next_line().await;
        });

        let adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        let err = adapter.exchange(&Command::new("CN"), None).await.unwrap_err();
        assert!(matches!(err, XrayError::Connection(_)), "{:?}", err);
        assert!(!adapter.is_connected().await);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_reply_is_rejected() {
        let (listener, port) = listener().await;
        let _server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let _ = socket.read(&mut buf).await;
            socket.write_all(&[b'0'; MAX_RESPONSE_SIZE + 10]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        let err = adapter.exchange(&Command::new("FR"), None).await.unwrap_err();
        assert!(matches!(
            err,
            XrayError::Format {
                reason: FormatErrorKind::TooLarge { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_send_does_not_wait_for_reply() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            lines.next_line().await.unwrap().unwrap()
        });

        let adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        adapter.send(&Command::new("HV").arg(1)).await.unwrap();
        assert_eq!(server.await.unwrap(), "HV:1");
        adapter.close().await.unwrap();
        assert!(!adapter.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, port) = listener().await;
        drop(listener);
        let adapter = TcpAdapter::new("127.0.0.1", port);
        assert!(matches!(
            adapter.connect().await,
            Err(XrayError::Connection(_))
        ));
    }
}
