//! taskfly-agent binary — runs on each worker host.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use taskfly_agent::{Agent, AgentConfig};

#[derive(Parser)]
#[command(name = "taskfly-agent", about = "TaskFly node agent")]
struct Cli {
    /// Provision token issued by the controller.
    #[arg(long, env = "TASKFLY_PROVISION_TOKEN")]
    token: String,

    /// Base URL of the controller (e.g. http://10.0.0.1:8080).
    #[arg(long, env = "TASKFLY_DAEMON_URL")]
    daemon: String,

    /// Working directory (default: /tmp/taskfly-<token>).
    #[arg(long, env = "TASKFLY_WORK_DIR")]
    workdir: Option<PathBuf>,

    /// Heartbeat interval in seconds.
    #[arg(long, default_value = "3")]
    heartbeat_interval: u64,

    /// Log push interval in seconds.
    #[arg(long, default_value = "3")]
    log_push_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taskfly_agent=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let work_dir = cli
        .workdir
        .unwrap_or_else(|| PathBuf::from(format!("/tmp/taskfly-{}", cli.token)));

    info!(
        daemon = %cli.daemon,
        work_dir = %work_dir.display(),
        "TaskFly agent starting"
    );

    let mut config = AgentConfig::new(cli.token, cli.daemon, work_dir);
    config.heartbeat_interval = Duration::from_secs(cli.heartbeat_interval);
    config.log_push_interval = Duration::from_secs(cli.log_push_interval);

    let agent = Agent::new(config)?;
    agent.run().await?;

    info!("agent stopped");
    Ok(())
}
