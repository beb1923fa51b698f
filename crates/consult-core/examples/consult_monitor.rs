//! Consult Live Data Monitor
//!
//! Runs a Consult session and prints every snapshot and trouble code report
//! as one JSON object per line.
//!
//! Usage:
//!   cargo run --example consult_monitor -- [OPTIONS] [PORT]
//!
//! Options:
//!   --port PORT          Serial port (default: first detected port)
//!   --baud RATE          Baud rate (default: 9600)
//!   --config FILE        Load settings from a JSON config file
//!   --registers LIST     Comma separated register names (e.g. rpm,speed)
//!   --dtc-interval MS    Read trouble codes every MS milliseconds
//!   --demo               Talk to the built-in simulated ECU instead of a port
//!   --list               List serial ports and exit
//!
//! Logging is controlled by RUST_LOG (default: info).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use consult_core::prelude::*;
use consult_core::protocol::list_ports;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Prints events to stdout
struct JsonPrinter;

impl TelemetrySink for JsonPrinter {
    fn publish(&mut self, event: TelemetryEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Failed to serialize event: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = ConsultConfig::default();
    let mut demo = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let path = args.get(i).context("--config needs a file")?;
                let loaded = ConsultConfig::load(path)
                    .with_context(|| format!("Failed to load config {}", path))?;
                config = loaded;
            }
            "--port" | "-p" => {
                i += 1;
                config.port_name = args.get(i).context("--port needs a name")?.clone();
            }
            "--baud" | "-b" => {
                i += 1;
                let rate = args.get(i).context("--baud needs a rate")?;
                config.baud_rate = rate.parse().context("Invalid baud rate")?;
            }
            "--registers" | "-r" => {
                i += 1;
                let list = args.get(i).context("--registers needs a list")?;
                config.registers = list.split(',').map(|s| s.trim().to_string()).collect();
            }
            "--dtc-interval" => {
                i += 1;
                let ms = args.get(i).context("--dtc-interval needs milliseconds")?;
                config.dtc_interval_ms = Some(ms.parse().context("Invalid DTC interval")?);
            }
            "--demo" => demo = true,
            "--list" | "-l" => {
                for port in list_ports() {
                    println!(
                        "{}\t{}",
                        port.name,
                        port.product.as_deref().unwrap_or("-")
                    );
                }
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            arg if !arg.starts_with('-') => config.port_name = arg.to_string(),
            other => bail!("Unknown option: {}", other),
        }
        i += 1;
    }

    // Fail on bad register names before touching the port
    let selection = config.selection()?;
    info!("Polling {:?}", selection.names());

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    // Nothing sends commands; the sender only keeps the channel open
    let (_commands, commands_rx) = tokio::sync::mpsc::unbounded_channel();

    let summary = if demo {
        info!("Running against simulated ECU");
        let (host, ecu_side) = tokio::io::duplex(1024);
        let ecu = SimulatedEcu::new().with_jitter(0x5A);
        let ecu_task = tokio::spawn(ecu.serve(
            ecu_side,
            Duration::from_millis(100),
            cancel.clone(),
        ));
        let summary = run_session(host, &config, JsonPrinter, commands_rx, cancel).await?;
        ecu_task.await??;
        summary
    } else {
        if config.port_name.is_empty() {
            config.port_name = match list_ports().into_iter().next() {
                Some(port) => port.name,
                None => bail!("No serial port found; pass --port or use --demo"),
            };
        }
        info!("Opening {} at {} baud", config.port_name, config.baud_rate);
        run_serial_session(&config, JsonPrinter, commands_rx, cancel).await?
    };

    info!(
        "Session ended: {} snapshots, {} frames, {} stale, {} malformed, {} overflows",
        summary.stats.snapshots,
        summary.stats.frames,
        summary.stats.stale_frames,
        summary.stats.malformed_frames,
        summary.stats.overflows
    );
    Ok(())
}

fn print_help() {
    println!("Consult Live Data Monitor");
    println!();
    println!("Usage: consult_monitor [OPTIONS] [PORT]");
    println!();
    println!("Options:");
    println!("  -p, --port PORT        Serial port (default: first detected port)");
    println!("  -b, --baud RATE        Baud rate (default: 9600)");
    println!("  -c, --config FILE      Load settings from a JSON config file");
    println!("  -r, --registers LIST   Comma separated register names");
    println!("      --dtc-interval MS  Read trouble codes every MS milliseconds");
    println!("      --demo             Use the built-in simulated ECU");
    println!("  -l, --list             List serial ports and exit");
    println!("  -h, --help             Show this help");
    println!();
    println!("Registers:");
    for register in consult_core::protocol::registers::catalog() {
        println!("  {:<26} {} ({})", register.name, register.label, register.units);
    }
}
