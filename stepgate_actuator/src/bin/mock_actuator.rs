use anyhow::Context;
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use stepgate_actuator::{ActuatorOptions, ActuatorThread};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock_actuator")]
struct Args {
    #[arg(long, env = "STEPGATE_ACTUATOR_ADDR", default_value = "127.0.0.1:8000")]
    addr: String,

    /// Write the bound address here (useful with port 0).
    #[arg(long, value_name = "PATH")]
    addr_file: Option<PathBuf>,

    /// Exit after this many milliseconds instead of running forever.
    #[arg(long)]
    run_for_ms: Option<u64>,

    /// Report `gpio_available: true` in the connection status.
    #[arg(long, default_value_t = false)]
    gpio_available: bool,

    /// Leave pings unanswered.
    #[arg(long, default_value_t = false)]
    no_pong: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let options = ActuatorOptions {
        gpio_available: args.gpio_available,
        answer_pings: !args.no_pong,
        ..ActuatorOptions::default()
    };
    let actuator = ActuatorThread::spawn_with_addr(&args.addr, options)
        .with_context(|| format!("failed to bind {}", args.addr))?;

    if let Some(path) = &args.addr_file {
        std::fs::write(path, actuator.listen_addr().to_string())
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    println!("mock_actuator listening on {}", actuator.url());

    let events = actuator.events();
    let deadline = args
        .run_for_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => info!(?event, "actuator event"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
    }

    actuator.shutdown();
    Ok(())
}
