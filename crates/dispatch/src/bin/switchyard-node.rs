//! switchyard-node — runs a dispatcher with a few synthetic handlers.
//!
//! Useful for watching scheduling, timeouts, bulkheads and autotune
//! behave under generated load.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, idle until Ctrl-C
//! switchyard-node
//!
//! # Config file plus 500 synthetic messages at 50/s
//! switchyard-node --config switchyard.toml --messages 500 --rate 50
//!
//! # Via environment variables
//! SWITCHYARD_CONFIG=switchyard.toml SWITCHYARD_MESSAGES=100 switchyard-node
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use switchyard_core::{load_dotenv, RoutingKey, SwitchyardConfig};
use switchyard_dispatch::{handler_fn, CancelSignal, Dispatcher, Envelope, WorkError};

/// Dispatch core runner with synthetic load.
#[derive(Parser, Debug)]
#[command(name = "switchyard-node", version, about)]
struct Cli {
    /// TOML config file; defaults plus env overrides when omitted.
    #[arg(long, env = "SWITCHYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Number of synthetic messages to generate (0 = none).
    #[arg(long, env = "SWITCHYARD_MESSAGES", default_value_t = 0)]
    messages: u64,

    /// Synthetic messages per second.
    #[arg(long, env = "SWITCHYARD_RATE", default_value_t = 20)]
    rate: u64,

    /// Simulated handler work per message, in milliseconds.
    #[arg(long, env = "SWITCHYARD_WORK_MS", default_value_t = 200)]
    work_ms: u64,

    /// Soft timeout applied to every synthetic message, in milliseconds.
    #[arg(long, env = "SWITCHYARD_TIMEOUT_MS", default_value_t = 1_000)]
    timeout_ms: u64,

    /// Stop once all generated messages have finished instead of waiting
    /// for a shutdown signal.
    #[arg(long, env = "SWITCHYARD_EXIT_WHEN_DONE", default_value_t = false)]
    exit_when_done: bool,
}

/// Payload carried by synthetic messages.
#[derive(Debug, Serialize, Deserialize)]
struct SyntheticOrder {
    seq: u64,
    work_ms: u64,
    /// Ignore the cancel signal, to exercise the kill path.
    stubborn: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!(?cli, "starting switchyard-node");

    let config = match &cli.config {
        Some(path) => SwitchyardConfig::from_file(path)?,
        None => SwitchyardConfig::from_env()?,
    };
    config.log_summary();

    let dispatcher = Arc::new(Dispatcher::new(&config)?);
    register_handlers(&dispatcher)?;
    dispatcher.start()?;

    let generator = (cli.messages > 0).then(|| {
        let dispatcher = dispatcher.clone();
        let messages = cli.messages;
        let rate = cli.rate.max(1);
        let work_ms = cli.work_ms;
        let timeout = Duration::from_millis(cli.timeout_ms);
        tokio::spawn(async move { generate(&dispatcher, messages, rate, work_ms, timeout).await })
    });

    match generator {
        Some(generator) if cli.exit_when_done => {
            tokio::select! {
                _ = shutdown_signal() => info!("shutdown signal received"),
                result = generator => {
                    if let Err(e) = result {
                        warn!(error = %e, "load generator failed");
                    }
                    wait_for_idle(&dispatcher).await;
                }
            }
        }
        _ => {
            shutdown_signal().await;
            info!("shutdown signal received");
        }
    }

    dispatcher.stop().await;
    let snapshot = dispatcher.snapshot();
    info!(
        snapshot = %serde_json::to_string(&snapshot)?,
        "final scheduler snapshot"
    );
    info!("switchyard-node exited cleanly");
    Ok(())
}

fn register_handlers(dispatcher: &Dispatcher) -> anyhow::Result<()> {
    dispatcher.register_handler(
        "orders-create",
        RoutingKey::parse("orders/create/")?,
        handler_fn(|envelope, cancel| async move {
            let order: SyntheticOrder = envelope
                .decode()
                .map_err(|e| WorkError::failed(format!("bad payload: {e}")))?;
            simulate(&order, &cancel).await
        }),
    )?;

    dispatcher.register_handler(
        "orders-any",
        RoutingKey::parse("orders//")?,
        handler_fn(|envelope, cancel| async move {
            let order: SyntheticOrder = envelope
                .decode()
                .map_err(|e| WorkError::failed(format!("bad payload: {e}")))?;
            if order.seq % 17 == 0 {
                return Err(WorkError::failed(format!("order {} rejected", order.seq)));
            }
            simulate(&order, &cancel).await
        }),
    )?;

    dispatcher.register_handler(
        "audit",
        RoutingKey::parse("audit//")?,
        handler_fn(|_envelope, _cancel| async move { Ok(()) }),
    )?;
    Ok(())
}

async fn simulate(order: &SyntheticOrder, cancel: &CancelSignal) -> Result<(), WorkError> {
    let work = tokio::time::sleep(Duration::from_millis(order.work_ms));
    if order.stubborn {
        work.await;
        return Ok(());
    }
    tokio::select! {
        _ = work => Ok(()),
        _ = cancel.cancelled() => Err(WorkError::Cancelled),
    }
}

async fn generate(dispatcher: &Dispatcher, messages: u64, rate: u64, work_ms: u64, timeout: Duration) {
    let mut ticker = tokio::time::interval(Duration::from_millis(1_000 / rate).max(Duration::from_millis(1)));
    for seq in 0..messages {
        ticker.tick().await;

        let (key, priority) = match seq % 4 {
            0 => ("orders/create/web", 5),
            1 => ("orders/refund/web", 1),
            2 => ("orders/create/batch", 0),
            _ => ("audit/record/", -1),
        };
        let order = SyntheticOrder {
            seq,
            // Every tenth message overruns its timeout.
            work_ms: if seq % 10 == 9 { work_ms * 20 } else { work_ms },
            stubborn: seq % 50 == 49,
        };

        let envelope = match RoutingKey::parse(key).map(|key| Envelope::new(key, priority, &order)) {
            Ok(Ok(envelope)) => envelope.caller("generator").max_processing_time(timeout),
            Ok(Err(e)) => {
                warn!(seq, error = %e, "failed to encode synthetic order");
                continue;
            }
            Err(e) => {
                warn!(seq, error = %e, "bad synthetic routing key");
                continue;
            }
        };

        if let Err(e) = dispatcher.dispatch(envelope) {
            warn!(seq, error = %e, "dispatch rejected");
        }
    }
    info!(messages, "load generation finished");
}

async fn wait_for_idle(dispatcher: &Dispatcher) {
    let mut snapshots = dispatcher.scheduler().subscribe();
    let idle = snapshots
        .wait_for(|s| s.queued == 0 && s.active == 0)
        .await
        .is_ok();
    if idle {
        info!("all generated work finished");
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            warn!(error = %e, "failed to listen for ctrl_c");
        }
    }
}
