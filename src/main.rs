//! Command-line tool for a Seifert X-ray generator.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use seifert_xray::config::DEFAULT_CONFIG_PATH;
use seifert_xray::{logging, Action, FieldValue, SeifertXray, WritableField, XrayConfig};
use tracing::{info, warn};

/// Control and monitor a Seifert X-ray generator over TCP.
#[derive(Parser, Debug)]
#[command(name = "seifert_xray")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the generator host.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Override the generator port.
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll all telemetry and print it as JSON.
    Poll {
        /// Keep polling at this interval instead of exiting after one poll.
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Stop after this many polls (with --interval-ms).
        #[arg(long)]
        count: Option<u64>,
    },
    /// Switch high voltage on.
    On,
    /// Switch high voltage off.
    Off,
    /// Write one field, e.g. `write current.setpoint 5`.
    Write {
        field: String,
        value: String,
    },
    /// Run an action, e.g. `invoke open_shutter`.
    Invoke {
        action: String,
    },
    /// List writable fields and actions.
    List,
    /// Print the effective configuration.
    ShowConfig,
}

fn parse_value(raw: &str) -> FieldValue {
    raw.parse::<i32>()
        .map(FieldValue::Int)
        .unwrap_or_else(|_| FieldValue::Text(raw.to_string()))
}

async fn connected(config: &XrayConfig) -> Result<SeifertXray> {
    let xray = SeifertXray::from_config(config)?;
    xray.connect().await.with_context(|| {
        format!(
            "Failed to connect to {}:{}",
            config.instrument.host, config.instrument.port
        )
    })?;
    // Sync the state machine with the hardware before issuing commands.
    xray.poll_once().await.context("Initial poll failed")?;
    Ok(xray)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = XrayConfig::load_from(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(host) = args.host {
        config.instrument.host = host;
    }
    if let Some(port) = args.port {
        config.instrument.port = port;
    }
    config.validate()?;

    logging::init_from_config(&config.logging)
        .map_err(|e| anyhow!("Failed to initialise logging: {}", e))?;

    match args.command {
        Command::ShowConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Command::List => {
            for field in WritableField::ALL {
                let range = field
                    .range()
                    .map(|(min, max)| format!("{}..={}", min, max))
                    .unwrap_or_else(|| "0000|0010".to_string());
                println!("field  {:<24} {}", field.key(), range);
            }
            for action in Action::ALL {
                println!("action {}", action.name());
            }
        }
        Command::Poll { interval_ms, count } => {
            let xray = connected(&config).await?;
            let mut events = xray.subscribe();
            let mut polls = 0u64;
            loop {
                let snapshot = xray.poll_once().await?;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                while let Ok(event) = events.try_recv() {
                    info!(?event, "Instrument event");
                }
                polls += 1;

                let Some(ms) = interval_ms else { break };
                if count.is_some_and(|c| polls >= c) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            xray.close().await?;
        }
        Command::On => {
            let xray = connected(&config).await?;
            let state = xray.turn_on().await?;
            println!("{}", state);
            xray.close().await?;
        }
        Command::Off => {
            let xray = connected(&config).await?;
            let state = xray.turn_off().await?;
            println!("{}", state);
            xray.close().await?;
        }
        Command::Write { field, value } => {
            let xray = connected(&config).await?;
            xray.apply_write_key(&field, parse_value(&value))
                .await
                .with_context(|| format!("Writing {} = {} failed", field, value))?;
            println!("{}", serde_json::to_string_pretty(&xray.setpoints().await)?);
            xray.close().await?;
        }
        Command::Invoke { action } => {
            let xray = connected(&config).await?;
            if let Err(e) = xray.invoke_command_name(&action).await {
                warn!(%action, error = %e, "Command failed");
                return Err(e.into());
            }
            let snapshot = xray.poll_once().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            xray.close().await?;
        }
    }

    Ok(())
}
