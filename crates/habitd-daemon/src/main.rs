//! habitd - singleton daemon for EMA check-ins
//!
//! Responsibilities:
//! - Own the global state (DB, scheduler, LLM engines, event bus)
//! - Run the scheduling tick loop and the extraction worker loop
//! - Serve the JSON-RPC endpoint (line-delimited JSON over TCP)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use habitd_api::ApiService;
use habitd_core::config::AppConfig;
use habitd_core::core::{CheckinControl, CheckinControlOptions, ExtractionWorker};
use habitd_core::events::CoreEvent;

/// Responses drained per worker pass
const WORKER_BATCH_SIZE: i64 = 10;

fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var("HABITD_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".habitd")
}

fn config_path(home: &std::path::Path) -> PathBuf {
    if let Ok(path) = std::env::var("HABITD_CONFIG") {
        return PathBuf::from(path);
    }
    home.join("config.yaml")
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("HABITD_LOG_LEVEL") {
        v
    } else {
        "info".to_string()
    };
    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

/// One RPC connection: line-delimited JSON requests, one response per line
async fn handle_connection(service: Arc<ApiService>, stream: TcpStream) -> Result<()> {
    let peer = stream.peer_addr().ok();
    debug!(?peer, "RPC connection opened");
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = service.handle_line(&line).await;
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        write_half.write_all(encoded.as_bytes()).await?;
    }
    debug!(?peer, "RPC connection closed");
    Ok(())
}

/// Extraction worker loop: wakes on new responses and on a poll fallback.
/// Runs outside the scheduling loop so a slow LLM call never delays
/// reminder delivery or escalation.
async fn worker_loop(worker: ExtractionWorker, notify: Arc<Notify>, poll_seconds: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(poll_seconds));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = notify.notified() => {}
        }
        match worker.run_once().await {
            Ok(n) if n > 0 => debug!(count = n, "Extraction pass completed"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Extraction pass failed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let home = default_home();
    std::fs::create_dir_all(&home).ok();

    // Dual-layer logging: stderr + file (daily rotation)
    let log_dir = home.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "habitd.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    // Panic hook: make sure panics reach the log file too
    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "DAEMON PANIC: {}", payload);
    }));

    let config = AppConfig::load(&config_path(&home));
    let db_path = home.join("habitd.db");
    info!(home = %home.display(), db = %db_path.display(), "habitd starting");

    let control = Arc::new(CheckinControl::new(CheckinControlOptions {
        db_path,
        config: config.clone(),
    })?);

    // Startup recovery: stale processing rows, pending escalations, and
    // due reminders are all re-derived from persisted state
    control.tick().await;

    let service = Arc::new(ApiService::new(control.clone()));
    let worker = ExtractionWorker::new(control.clone(), WORKER_BATCH_SIZE);

    // New responses wake the worker immediately; the interval is a fallback
    let worker_notify = Arc::new(Notify::new());
    {
        let notify = worker_notify.clone();
        let mut events = control.events().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CoreEvent::ResponseQueued { .. }) => notify.notify_one(),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
    tokio::spawn(worker_loop(worker, worker_notify, config.server.worker_poll_seconds));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "habitd RPC endpoint listening");

    let mut tick_interval =
        tokio::time::interval(std::time::Duration::from_secs(config.server.tick_seconds));
    info!(tick_seconds = config.server.tick_seconds, "Scheduler loop started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let conn_service = service.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn_service, stream).await {
                                warn!(error = %e, "RPC connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Accept failed"),
                }
            }
            _ = tick_interval.tick() => {
                control.tick().await;
            }
        }
    }
}
