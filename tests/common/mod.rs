//! Shared helpers for the simulator-backed integration tests.

#![allow(dead_code)] // Not every test binary uses every helper

use seifert_xray::simulator::{self, GeneratorModel, SimulatorHandle};
use seifert_xray::{SeifertXray, XrayConfig};
use std::time::Duration;

/// How far a measured duration may stray from the expected one.
#[derive(Debug, Clone, Copy)]
pub enum TimingTolerance {
    /// 20%, local development
    Normal,
    /// 50%, loaded CI runners
    Relaxed,
}

impl TimingTolerance {
    pub fn factor(&self) -> f64 {
        match self {
            TimingTolerance::Normal => 0.20,
            TimingTolerance::Relaxed => 0.50,
        }
    }
}

/// `Relaxed` when the `CI` variable is set.
pub fn env_timing_tolerance() -> TimingTolerance {
    if std::env::var("CI").is_ok() {
        TimingTolerance::Relaxed
    } else {
        TimingTolerance::Normal
    }
}

/// Panics unless `actual` is within `tolerance` of `expected`.
pub fn assert_duration_near(
    actual: Duration,
    expected: Duration,
    tolerance: TimingTolerance,
    context: &str,
) {
    let factor = tolerance.factor();
    let min = expected.mul_f64(1.0 - factor);
    let max = expected.mul_f64(1.0 + factor);

    assert!(
        actual >= min && actual <= max,
        "{}: expected {:?} ±{:.0}%, got {:?}",
        context,
        expected,
        factor * 100.0,
        actual,
    );
}

/// Configuration pointing at a local simulator.
pub fn config_for(port: u16) -> XrayConfig {
    let mut config = XrayConfig::default();
    config.instrument.id = "sim".to_string();
    config.instrument.host = "127.0.0.1".to_string();
    config.instrument.port = port;
    config
}

/// Start a simulator on an ephemeral port.
pub async fn start_simulator(model: GeneratorModel) -> SimulatorHandle {
    simulator::spawn("127.0.0.1:0", model)
        .await
        .expect("simulator should bind")
}

/// Simulator plus a connected controller.
pub async fn connected(model: GeneratorModel) -> (SimulatorHandle, SeifertXray) {
    let sim = start_simulator(model).await;
    let xray = SeifertXray::from_config(&config_for(sim.port())).expect("config should be valid");
    xray.connect().await.expect("controller should connect");
    (sim, xray)
}
