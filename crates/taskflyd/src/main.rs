//! taskflyd — the TaskFly controller daemon.
//!
//! Single long-running process: owns the persistent state store, the
//! deployment working directory, and the HTTP API that both operators
//! and node agents talk to. A background sweeper retires finished
//! deployments.
//!
//! # Usage
//!
//! ```text
//! taskflyd --listen-port 8080 --callback-ip 10.0.0.1
//! TASKFLY_STATE_DIR=/var/lib/taskfly taskflyd --verbose
//! ```
//!
//! Flags override environment variables, which override the defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use taskfly_api::{build_router, ApiState};
use taskfly_orchestrator::{LocalBackend, Orchestrator};
use taskfly_state::Store;

/// How long in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "taskflyd", about = "TaskFly controller daemon")]
struct Cli {
    /// IP address to listen on.
    #[arg(short = 'l', long, env = "TASKFLY_LISTEN_IP", default_value = "0.0.0.0")]
    listen_ip: String,

    /// Port to listen on.
    #[arg(short = 'p', long, env = "TASKFLY_LISTEN_PORT", default_value = "8080")]
    listen_port: u16,

    /// Address remote nodes use to call back to this daemon.
    #[arg(long, env = "TASKFLY_CALLBACK_IP", default_value = "localhost")]
    callback_ip: String,

    /// Port remote nodes use to call back to this daemon (defaults to
    /// the listen port).
    #[arg(long, env = "TASKFLY_CALLBACK_PORT")]
    callback_port: Option<u16>,

    /// Directory for bundles and per-deployment working directories
    /// (default: ~/.taskfly/deployments).
    #[arg(long, env = "TASKFLY_DEPLOYMENT_DIR")]
    deployment_dir: Option<PathBuf>,

    /// Directory for persisted controller state
    /// (default: ~/.taskfly/state).
    #[arg(long, env = "TASKFLY_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, env = "TASKFLY_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug"
    } else {
        "info,taskflyd=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.parse().unwrap()),
        )
        .init();

    info!("TaskFly daemon starting");

    // ── Directories and state ──────────────────────────────────────

    let base_dir = default_base_dir();
    let deployment_dir = cli
        .deployment_dir
        .unwrap_or_else(|| base_dir.join("deployments"));
    let state_dir = cli.state_dir.unwrap_or_else(|| base_dir.join("state"));

    std::fs::create_dir_all(&deployment_dir).with_context(|| {
        format!(
            "failed to create deployment directory {}",
            deployment_dir.display()
        )
    })?;
    info!(path = %deployment_dir.display(), "using deployment directory");

    let store = Store::open(&state_dir).context("failed to open state store")?;
    info!(path = %state_dir.display(), "state store initialized");

    // ── Orchestrator ───────────────────────────────────────────────

    let callback_port = cli.callback_port.unwrap_or(cli.listen_port);
    let callback_url = format!("http://{}:{}", cli.callback_ip, callback_port);
    let orchestrator = Arc::new(
        Orchestrator::new(store, deployment_dir, callback_url.clone())
            .with_backend(Arc::new(LocalBackend::new())),
    );
    info!(callback = %callback_url, "orchestrator initialized");

    // ── Background sweeper ─────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(orchestrator.clone().run_sweeper(shutdown_rx.clone()));

    // ── API server ─────────────────────────────────────────────────

    let router = build_router(ApiState::new(orchestrator));
    let addr: SocketAddr = format!("{}:{}", cli.listen_ip, cli.listen_port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "API server listening");

    let mut graceful_rx = shutdown_rx.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = graceful_rx.changed().await;
        info!("shutdown signal received, draining requests");
    });

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_tx.send(true);
        }
    });

    // Give in-flight requests a bounded drain window, then force exit.
    let mut drain_rx = shutdown_rx;
    tokio::select! {
        result = server => result.context("server failed")?,
        _ = async {
            let _ = drain_rx.changed().await;
            tokio::time::sleep(SHUTDOWN_DRAIN).await;
        } => {
            warn!("drain window elapsed, forcing shutdown");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    info!("TaskFly daemon stopped");
    Ok(())
}

/// `~/.taskfly`, falling back to the current directory when the home
/// directory cannot be determined.
fn default_base_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".taskfly")
}
