//! In-process generator simulator.
//!
//! Speaks the same line protocol as the real device server: one command per
//! `\n`-terminated line, replies only to queries. State lives in a
//! [`GeneratorModel`] that tests can inspect and modify while a client is
//! connected, e.g. to raise a fault or make one mnemonic reply malformed.

use crate::protocol::Command;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HIGH_VOLTAGE_BIT: i32 = 1 << 6;
const TIMER_3_BIT: i32 = 1 << 5;
const SHUTTER_3_CONTROL_BIT: i32 = 1 << 1;
const SHUTTER_3_OPEN_BITS: i32 = 0b1100_0000;
const WARMUP_ACTIVE_BIT: i32 = 1 << 3;

/// Internal state of the simulated generator, in wire units.
#[derive(Debug, Clone)]
pub struct GeneratorModel {
    pub current_target_ua: i32,
    pub current_actual_ua: i32,
    pub voltage_target_v: i32,
    pub voltage_actual_v: i32,
    pub exposure_seconds: i32,
    pub fault_code: i32,
    /// Keep the fault code after `CL`, as a generator with a persisting cause does.
    pub fault_latched: bool,
    pub status_word_1: i32,
    pub status_word_2: i32,
    pub status_word_3: i32,
    pub status_word_4: i32,
    pub status_word_6: i32,
    pub water_flow_minimum: i32,
    pub water_flow_actual: i32,
    pub warmup_seconds_left: i32,
    pub warmup_program: (i32, i32),
    pub keypad_enabled: bool,
    pub shutter_control: String,
    pub focus: String,
    pub anode: String,
    /// Never answer.
    pub silent: bool,
    /// Mnemonics whose replies are sent truncated.
    pub malformed: HashSet<String>,
}

impl Default for GeneratorModel {
    fn default() -> Self {
        Self {
            current_target_ua: 17_000,
            current_actual_ua: 17_000,
            voltage_target_v: 19_000,
            voltage_actual_v: 19_000,
            exposure_seconds: 45_246,
            fault_code: 76,
            fault_latched: false,
            status_word_1: 32,
            status_word_2: 32,
            status_word_3: 16,
            status_word_4: 8,
            status_word_6: 4,
            water_flow_minimum: 100,
            water_flow_actual: 90,
            warmup_seconds_left: 999,
            warmup_program: (0, 0),
            keypad_enabled: true,
            shutter_control: "0000".to_string(),
            focus: "0.15 x 8 mm".to_string(),
            anode: "Co".to_string(),
            silent: false,
            malformed: HashSet::new(),
        }
    }
}

fn int_reply(value: i32) -> Option<String> {
    Some(format!("*{:010}", value))
}

fn arg(command: &Command, index: usize) -> Option<i32> {
    command.args().get(index).and_then(|a| a.trim().parse().ok())
}

impl GeneratorModel {
    pub fn high_voltage(&self) -> bool {
        self.status_word_1 & HIGH_VOLTAGE_BIT != 0
    }

    /// Apply one command line and return the reply, without terminator.
    pub fn handle(&mut self, line: &str) -> Option<String> {
        let command = match Command::parse(line) {
            Ok(c) => c,
            Err(_) => return None,
        };

        let reply = match command.mnemonic() {
            "HV" => {
                match arg(&command, 0) {
                    Some(1) => self.status_word_1 |= HIGH_VOLTAGE_BIT,
                    Some(0) => self.status_word_1 &= !HIGH_VOLTAGE_BIT,
                    _ => warn!(%line, "Bad HV argument"),
                }
                None
            }
            "SC" => {
                if let Some(ma) = arg(&command, 0) {
                    self.current_target_ua = ma * 1000;
                    self.current_actual_ua = self.current_target_ua;
                }
                None
            }
            "SV" => {
                if let Some(kv) = arg(&command, 0) {
                    self.voltage_target_v = kv * 1000;
                    self.voltage_actual_v = self.voltage_target_v;
                }
                None
            }
            "CN" => int_reply(self.current_target_ua),
            "CA" => int_reply(self.current_actual_ua),
            "VN" => int_reply(self.voltage_target_v),
            "VA" => int_reply(self.voltage_actual_v),
            "TN" | "TA" => int_reply(self.exposure_seconds),
            "TP" => {
                if let (Some(h), Some(m), Some(s)) =
                    (arg(&command, 1), arg(&command, 2), arg(&command, 3))
                {
                    self.exposure_seconds = h * 3600 + m * 60 + s;
                }
                None
            }
            "TS" => {
                self.status_word_2 |= TIMER_3_BIT;
                None
            }
            "TE" => {
                self.status_word_2 &= !TIMER_3_BIT;
                None
            }
            "SR" => match command.args().first().map(String::as_str) {
                Some("12") => int_reply(self.fault_code),
                Some("01") => int_reply(self.status_word_1),
                Some("02") => int_reply(self.status_word_2),
                Some("03") => int_reply(self.status_word_3),
                Some("04") => int_reply(self.status_word_4),
                Some("06") => int_reply(self.status_word_6),
                Some("14") => int_reply(self.water_flow_minimum),
                Some("15") => int_reply(self.water_flow_actual),
                _ => None,
            },
            "SW" => {
                // SW:14:181 parses as mnemonic SW, argument "14:181".
                let value = command
                    .args()
                    .first()
                    .and_then(|a| a.split_once(':'))
                    .and_then(|(word, v)| (word == "14").then_some(v))
                    .and_then(|v| v.parse().ok());
                if let Some(v) = value {
                    self.water_flow_minimum = v;
                }
                None
            }
            "CL" => {
                if !self.fault_latched {
                    self.fault_code = 0;
                }
                None
            }
            "WU" => {
                if let (Some(t), Some(v)) = (arg(&command, 0), arg(&command, 1)) {
                    self.warmup_program = (t, v);
                    self.status_word_6 |= WARMUP_ACTIVE_BIT;
                }
                None
            }
            "WT" => int_reply(self.warmup_seconds_left),
            "KB" => {
                self.keypad_enabled = arg(&command, 0) == Some(1);
                None
            }
            "CC" => {
                if let Some(control) = command.args().first() {
                    self.shutter_control = control.clone();
                    if control == "0010" {
                        self.status_word_2 |= SHUTTER_3_CONTROL_BIT;
                    } else {
                        self.status_word_2 &= !SHUTTER_3_CONTROL_BIT;
                    }
                }
                None
            }
            "OS" => {
                self.status_word_4 |= SHUTTER_3_OPEN_BITS;
                None
            }
            "CS" => {
                self.status_word_4 &= !SHUTTER_3_OPEN_BITS;
                None
            }
            "FR" => Some(format!("*{}", self.focus)),
            "MR" => Some(format!("*{}", self.anode)),
            other => {
                warn!(mnemonic = other, "Unknown command");
                None
            }
        };

        reply.map(|r| {
            if self.malformed.contains(command.mnemonic()) {
                let keep = r.chars().count().saturating_sub(5).max(1);
                r.chars().take(keep).collect()
            } else {
                r
            }
        })
    }
}

/// A running simulator. Stops when dropped.
pub struct SimulatorHandle {
    addr: SocketAddr,
    model: Arc<Mutex<GeneratorModel>>,
    task: JoinHandle<()>,
}

impl SimulatorHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Run `f` against the model.
    pub async fn with_model<R>(&self, f: impl FnOnce(&mut GeneratorModel) -> R) -> R {
        let mut model = self.model.lock().await;
        f(&mut model)
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Bind to `addr` (use port 0 for an ephemeral port) and serve in the background.
pub async fn spawn(addr: &str, model: GeneratorModel) -> io::Result<SimulatorHandle> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let model = Arc::new(Mutex::new(model));
    let task = tokio::spawn(serve(listener, Arc::clone(&model)));
    info!(addr = %local, "Simulator listening");
    Ok(SimulatorHandle {
        addr: local,
        model,
        task,
    })
}

/// Accept connections forever, one task per client.
pub async fn serve(listener: TcpListener, model: Arc<Mutex<GeneratorModel>>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                info!(%peer, "Client connected");
                let model = Arc::clone(&model);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(socket, model).await {
                        debug!(%peer, error = %e, "Client session ended with error");
                    }
                    info!(%peer, "Client disconnected");
                });
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
            }
        }
    }
}

async fn handle_client(socket: TcpStream, model: Arc<Mutex<GeneratorModel>>) -> io::Result<()> {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r');
        debug!(%line, "Received");
        let reply = {
            let mut model = model.lock().await;
            let reply = model.handle(line);
            if model.silent {
                None
            } else {
                reply
            }
        };
        if let Some(reply) = reply {
            debug!(%reply, "Replying");
            write.write_all(format!("{}\n", reply).as_bytes()).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_voltage_toggles_status_word_1() {
        let mut model = GeneratorModel::default();
        assert!(!model.high_voltage());
        assert_eq!(model.handle("HV:1"), None);
        assert!(model.high_voltage());
        assert_eq!(model.handle("SR:01").as_deref(), Some("*0000000096"));
        model.handle("HV:0");
        assert_eq!(model.handle("SR:01").as_deref(), Some("*0000000032"));
    }

    #[test]
    fn test_current_setpoint_echo() {
        let mut model = GeneratorModel::default();
        model.handle("SC:05");
        assert_eq!(model.handle("CN").as_deref(), Some("*0000005000"));
        assert_eq!(model.handle("CA").as_deref(), Some("*0000005000"));
        model.handle("SV:45");
        assert_eq!(model.handle("VN").as_deref(), Some("*0000045000"));
    }

    #[test]
    fn test_exposure_timer() {
        let mut model = GeneratorModel::default();
        model.handle("TP:3,01,30,05");
        assert_eq!(model.handle("TN:3").as_deref(), Some("*0000005405"));
        model.handle("TS:3");
        assert_eq!(model.status_word_2 & TIMER_3_BIT, TIMER_3_BIT);
        model.handle("TE:3");
        assert_eq!(model.status_word_2 & TIMER_3_BIT, 0);
    }

    #[test]
    fn test_clear_fault() {
        let mut model = GeneratorModel {
            fault_code: 33,
            ..GeneratorModel::default()
        };
        model.handle("CL");
        assert_eq!(model.fault_code, 0);

        model.fault_code = 33;
        model.fault_latched = true;
        model.handle("CL");
        assert_eq!(model.handle("SR:12").as_deref(), Some("*0000000033"));
    }

    #[test]
    fn test_shutter_and_water_flow() {
        let mut model = GeneratorModel::default();
        model.handle("OS:3");
        assert_eq!(model.status_word_4 & SHUTTER_3_OPEN_BITS, SHUTTER_3_OPEN_BITS);
        model.handle("CS:3");
        assert_eq!(model.status_word_4 & SHUTTER_3_OPEN_BITS, 0);
        model.handle("SW:14:181");
        assert_eq!(model.handle("SR:14").as_deref(), Some("*0000000181"));
        model.handle("CC:0010");
        assert_eq!(model.shutter_control, "0010");
        model.handle("KB:0");
        assert!(!model.keypad_enabled);
    }

    #[test]
    fn test_text_replies_and_malformed_mode() {
        let mut model = GeneratorModel::default();
        assert_eq!(model.handle("MR").as_deref(), Some("*Co"));
        assert_eq!(model.handle("FR").as_deref(), Some("*0.15 x 8 mm"));
        model.malformed.insert("CA".to_string());
        assert_eq!(model.handle("CA").as_deref(), Some("*00000"));
        assert_eq!(model.handle("XX"), None);
    }

    #[test]
    fn test_malformed_text_reply_keeps_char_boundaries() {
        let mut model = GeneratorModel {
            focus: "0,4 × 12 mm".to_string(),
            ..GeneratorModel::default()
        };
        model.malformed.insert("FR".to_string());
        assert_eq!(model.handle("FR").as_deref(), Some("*0,4 × "));

        model.anode = "µ".to_string();
        model.malformed.insert("MR".to_string());
        assert_eq!(model.handle("MR").as_deref(), Some("*"));
    }

    #[tokio::test]
    async fn test_serves_over_tcp() {
        let sim = spawn("127.0.0.1:0", GeneratorModel::default()).await.unwrap();
        let stream = TcpStream::connect(sim.addr()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"HV:1\nSR:01\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "*0000000096");
        assert!(sim.with_model(|m| m.high_voltage()).await);
    }
}
