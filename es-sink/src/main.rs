//! Reads newline delimited JSON documents from stdin and writes them to Elasticsearch until
//! stdin is exhausted or a shutdown signal arrives.

use std::env;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use es_sink::metrics::{MetricsState, registered_sink_metrics, start_metrics_server};
use es_sink::{ElasticSearchSink, Record, Settings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod setup_tracing;

const ENV_ES_SINK_METRICS_ADDR: &str = "ES_SINK_METRICS_ADDR";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:2469";

#[derive(Default)]
struct Outcomes {
    acked: AtomicU64,
    failed: AtomicU64,
}

/// A line read from stdin. Outcomes are only logged and counted, stdin cannot redeliver.
struct LineRecord {
    value: Bytes,
    line: u64,
    outcomes: Arc<Outcomes>,
}

impl Record for LineRecord {
    fn key(&self) -> Option<&str> {
        None
    }

    fn value(&self) -> &Bytes {
        &self.value
    }

    fn sequence(&self) -> u64 {
        self.line
    }

    fn ack(self: Box<Self>) {
        self.outcomes.acked.fetch_add(1, Ordering::Relaxed);
        debug!(line = self.line, "Record written");
    }

    fn fail(self: Box<Self>) {
        self.outcomes.failed.fetch_add(1, Ordering::Relaxed);
        warn!(line = self.line, "Record could not be written");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = Settings::from_env()?;
    info!(?settings, "Loaded settings");

    let metrics_addr: SocketAddr = env::var(ENV_ES_SINK_METRICS_ADDR)
        .unwrap_or_else(|_| DEFAULT_METRICS_ADDR.to_string())
        .parse()?;
    let metrics_state = MetricsState::default();
    let shutdown = CancellationToken::new();

    let metrics_server = tokio::spawn(start_metrics_server(
        metrics_addr,
        metrics_state.clone(),
        shutdown.clone(),
    ));

    let metrics = registered_sink_metrics(&settings.index_name);
    let sink = ElasticSearchSink::open(settings, metrics).await?;
    metrics_state.set_ready(true);
    info!(mode = %sink.mode(), "Sink is ready, reading records from stdin");

    let outcomes = Arc::new(Outcomes::default());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number = 0u64;
    let signal = shutdown_signal();
    tokio::pin!(signal);

    loop {
        let line = tokio::select! {
            _ = &mut signal => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("Reached end of input");
            break;
        };

        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        sink.write(Box::new(LineRecord {
            value: Bytes::from(line),
            line: line_number,
            outcomes: Arc::clone(&outcomes),
        }))
        .await;
    }

    metrics_state.set_ready(false);
    let closed = sink.close().await;
    info!(
        acked = outcomes.acked.load(Ordering::Relaxed),
        failed = outcomes.failed.load(Ordering::Relaxed),
        "Sink closed"
    );

    shutdown.cancel();
    if let Err(e) = metrics_server.await? {
        warn!(?e, "Metrics server stopped with an error");
    }

    closed?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
