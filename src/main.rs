//! CLI entry point for the frame receiver.
//!
//! Loads configuration, starts one receive pipeline and services it until
//! Ctrl+C, a fatal receive thread error, or `--frames` frames have arrived.
//! Each completed frame is logged and its buffer released, standing in for a
//! downstream frame processor.
//!
//! # Usage
//!
//! ```bash
//! frame-receiver --config config/frame_receiver.toml
//! frame-receiver --port 9000 --log-format json --frames 100
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use frame_receiver::config::ReceiverConfig;
use frame_receiver::controller::FrameReceiverController;
use frame_receiver::tracing_init::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Interval between periodic status reports.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "frame-receiver")]
#[command(about = "Receive UDP detector packets into shared frame buffers", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config/frame_receiver.toml")]
    config: PathBuf,

    /// Override the UDP port
    #[arg(long)]
    port: Option<u16>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format (pretty, compact, json)
    #[arg(long, default_value = "compact")]
    log_format: String,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ReceiverConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.rx_port = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.validate().context("invalid configuration")?;
    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let format: OutputFormat = cli.log_format.parse()?;
    tracing_init::init(TracingConfig::from_receiver_config(&config)?.with_format(format))?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        r.store(false, Ordering::SeqCst);
    })?;

    let mut controller = FrameReceiverController::new(config)?;
    controller.start().context("starting receive thread")?;
    if let Some(addr) = controller.local_addr() {
        info!(%addr, identity = controller.identity().unwrap_or_default(), "Receiving");
    }

    let frames_seen = run(&mut controller, &running, cli.frames)?;

    let summary = controller.stop().context("stopping receive thread")?;
    info!(
        frames_seen,
        frames_completed = summary.get("frames_completed").and_then(|v| v.as_u64()),
        packets_lost = summary.get("packets_lost").and_then(|v| v.as_u64()),
        "Frame receiver shut down"
    );
    Ok(())
}

fn run(
    controller: &mut FrameReceiverController,
    running: &AtomicBool,
    limit: Option<u64>,
) -> Result<u64> {
    let events = controller.frame_ready_events();
    let poll = controller.config().poll_interval();
    let mut frames_seen = 0u64;
    let mut last_status = Instant::now();

    while running.load(Ordering::Relaxed) {
        controller.service(poll)?;

        for frame in events.try_iter() {
            frames_seen += 1;
            debug!(
                frame = frame.frame,
                buffer_id = frame.handle.id(),
                len = frame.handle.len(),
                packets = frame.packets,
                complete = frame.complete,
                "Frame received"
            );
            if !frame.complete {
                warn!(frame = frame.frame, packets = frame.packets, "Incomplete frame");
            }
            frame.handle.release()?;
        }

        if let Some(error) = controller.thread_error() {
            anyhow::bail!("receive thread failed: {}", error);
        }
        if limit.is_some_and(|n| frames_seen >= n) {
            break;
        }

        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            let status = controller.status()?;
            info!(
                state = %status.state,
                packets_received = status.counters.packets_received,
                frames_completed = status.counters.frames_completed,
                frames_dropped = status.counters.frames_dropped,
                packets_lost = status.counters.packets_lost,
                empty_buffers = status.counters.empty_buffers,
                "Receiver status"
            );
        }
    }
    Ok(frames_seen)
}
