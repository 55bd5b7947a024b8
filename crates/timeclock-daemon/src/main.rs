//! Timeclock daemon
//!
//! Serves the terminal-facing push protocol and the operator API, runs the
//! pull-sync scheduler, and hosts the template convergence engine.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use timeclock_daemon::context::AppContext;
use timeclock_daemon::forward::Forwarder;
use timeclock_daemon::storage::Database;
use timeclock_daemon::{ingest, ops, sweep};

#[derive(Parser, Debug)]
#[command(name = "timeclock-daemon")]
#[command(version, about = "Timeclock daemon - biometric terminal sync engine")]
struct Args {
    /// Bind address for the terminal push protocol (`/iclock/*`). Keep
    /// this listener firewalled to the terminal subnets: the vendor
    /// protocol carries no authentication.
    #[arg(long, default_value = "0.0.0.0:8081", env = "TIMECLOCK_PUSH_ADDR")]
    push_addr: SocketAddr,

    /// Bind address for the operator API.
    #[arg(long, default_value = "127.0.0.1:8071", env = "TIMECLOCK_OPS_ADDR")]
    ops_addr: SocketAddr,

    /// Database file path
    #[arg(long, env = "TIMECLOCK_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Seconds between pull-sync sweeps over all enabled terminals.
    #[arg(long, default_value_t = 300, env = "TIMECLOCK_SYNC_INTERVAL")]
    sync_interval: u64,

    /// Timeout in seconds for each control-channel operation against one
    /// terminal. A full sweep's worst case is roughly this times the
    /// device count.
    #[arg(long, default_value_t = 10, env = "TIMECLOCK_TERMINAL_TIMEOUT")]
    terminal_timeout: u64,

    /// Attendance-aggregation endpoint punch batches are forwarded to.
    /// Unset disables forwarding.
    #[arg(long, env = "TIMECLOCK_FORWARD_URL")]
    forward_url: Option<String>,

    /// Shared secret carried in the forwarding header.
    #[arg(long, default_value = "", env = "TIMECLOCK_FORWARD_SECRET")]
    forward_secret: String,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "TIMECLOCK_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TIMECLOCK_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("timeclock_daemon={}", args.log_level);
    timeclock_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        push_addr = %args.push_addr,
        ops_addr = %args.ops_addr,
        sync_interval = args.sync_interval,
        forwarding = args.forward_url.is_some(),
        "Starting timeclock-daemon"
    );

    // Initialize database
    let db = if let Some(path) = &args.db_path {
        info!(path = %path.display(), "Opening database");
        Database::open(path).await?
    } else {
        let default_path = default_db_path()?;
        info!(path = %default_path.display(), "Opening database (default path)");
        Database::open(&default_path).await?
    };

    let forwarder = Forwarder::new(args.forward_url.clone(), &args.forward_secret)?;

    // Daemon-level shutdown channel (Ctrl+C / SIGTERM)
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Manual sync requests funnel through the scheduler task so device
    // sweeps stay strictly sequential.
    let (sweep_tx, sweep_rx) = tokio::sync::mpsc::channel(16);

    let ctx = Arc::new(AppContext::new(
        db,
        forwarder,
        Duration::from_secs(args.terminal_timeout),
        sweep_tx,
    ));

    let scheduler_handle = sweep::spawn_scheduler(
        Arc::clone(&ctx),
        Duration::from_secs(args.sync_interval),
        sweep_rx,
        shutdown_rx,
    );

    let push_listener = tokio::net::TcpListener::bind(args.push_addr).await?;
    let ops_listener = tokio::net::TcpListener::bind(args.ops_addr).await?;

    let push_app = ingest::router(Arc::clone(&ctx));
    let ops_app = ops::router(Arc::clone(&ctx));

    let mut push_shutdown = shutdown_tx.subscribe();
    let mut push_handle = tokio::spawn(async move {
        axum::serve(
            push_listener,
            push_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = push_shutdown.changed().await;
        })
        .await
    });

    let mut ops_shutdown = shutdown_tx.subscribe();
    let mut ops_handle = tokio::spawn(async move {
        axum::serve(ops_listener, ops_app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = ops_shutdown.changed().await;
            })
            .await
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready to serve (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(push_addr = %args.push_addr, ops_addr = %args.ops_addr, "Listeners ready");

    tokio::select! {
        result = &mut push_handle => {
            result??;
        }
        result = &mut ops_handle => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    // Stop the scheduler and drain the listeners. A handle that already
    // completed inside the select above must not be awaited twice.
    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    if !push_handle.is_finished() {
        let _ = push_handle.await;
    }
    if !ops_handle.is_finished() {
        let _ = ops_handle.await;
    }

    info!("Daemon stopped");
    Ok(())
}

/// Default database path: ~/.timeclock/timeclock.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".timeclock").join("timeclock.db"))
}
