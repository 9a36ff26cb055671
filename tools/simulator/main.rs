//! Stand-alone generator simulator for bench work without hardware.

use anyhow::{Context, Result};
use clap::Parser;
use seifert_xray::simulator::{self, GeneratorModel};
use tracing_subscriber::EnvFilter;

/// Serve the Seifert generator protocol on a TCP port.
#[derive(Parser, Debug)]
#[command(name = "xray_simulator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1:10001")]
    bind: String,

    /// Initial fault code reported on SR:12.
    #[arg(long, default_value_t = 76)]
    fault: i32,

    /// Keep the fault after CL.
    #[arg(long)]
    latched: bool,

    /// Never reply.
    #[arg(long)]
    silent: bool,

    /// Send truncated replies for these mnemonics (repeatable).
    #[arg(long)]
    malformed: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let model = GeneratorModel {
        fault_code: args.fault,
        fault_latched: args.latched,
        silent: args.silent,
        malformed: args.malformed.into_iter().collect(),
        ..GeneratorModel::default()
    };

    let handle = simulator::spawn(&args.bind, model)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    println!("Simulator listening on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    println!("Shutting down");
    Ok(())
}
