//! Go Dispatcher worker binary
//!
//! Reads `{"connector": ..., "envelope": {...}}` lines from stdin, dispatches
//! each one and writes every published envelope to stdout in the same shape.

use std::sync::Arc;

use go_dispatcher::{ChannelBus, Published, Worker, WorkerConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine readable
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("GO_DISPATCHER_LOG_JSON").is_ok() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("Starting go-dispatcher v{}", env!("CARGO_PKG_VERSION"));

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!(path = %path, "Loading worker config");
            WorkerConfig::load(&path)?
        }
        None => {
            warn!("No config path given, using defaults");
            WorkerConfig::default()
        }
    };

    let (bus, mut published) = ChannelBus::new();
    let worker = Arc::new(Worker::new(config, Arc::new(bus))?);

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(item) = published.recv().await {
            let line = match serde_json::to_string(&item) {
                Ok(line) => line,
                Err(e) => {
                    error!(
                        connector = %item.connector,
                        error = %e,
                        "Failed to encode published envelope"
                    );
                    continue;
                }
            };
            if stdout.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let input: Published = match serde_json::from_str(&line) {
                    Ok(input) => input,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed input line");
                        continue;
                    }
                };
                let worker = worker.clone();
                tasks.spawn(async move {
                    if let Err(e) = worker.handle(&input.connector, input.envelope).await {
                        error!(
                            connector = %input.connector,
                            error = %e,
                            "Worker failed to dispatch"
                        );
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    while tasks.join_next().await.is_some() {}

    let stats = worker.stats();
    info!(
        inbound = stats.inbound_received,
        outbound = stats.outbound_received,
        events = stats.events_received,
        published = stats.published,
        dropped = stats.dropped,
        uptime_secs = stats.uptime_secs,
        "Dispatch statistics"
    );

    // Dropping the worker drops the bus sender and lets the printer finish
    drop(worker);
    printer.await?;

    info!("Shutting down go-dispatcher");
    Ok(())
}
