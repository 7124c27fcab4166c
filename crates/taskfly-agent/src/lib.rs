//! taskfly-agent — worker-side agent.
//!
//! Runs on each provisioned host. The agent registers once with its
//! provision token, downloads and safely extracts the worker bundle,
//! executes the deployment's entry script with the node's configuration
//! exported as environment variables, and reports the outcome. Two
//! background loops keep the controller informed: a heartbeat (with
//! system metrics, obeying the shutdown flag in the response) and a log
//! push that drains buffered script output.

pub mod metrics;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use sysinfo::System;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use taskfly_metadata::ConfigValue;
use taskfly_state::{LogEntry, LogStream};

/// Grace given to the entry script between SIGTERM and SIGKILL.
const SCRIPT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Timeout applied to every controller call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Agent configuration, usually filled from CLI flags.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// One-time provision token issued by the controller.
    pub provision_token: String,
    /// Base URL of the controller.
    pub daemon_url: String,
    /// Directory the bundle is extracted into and the script runs from.
    pub work_dir: PathBuf,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Log push cadence.
    pub log_push_interval: Duration,
}

impl AgentConfig {
    pub fn new(provision_token: String, daemon_url: String, work_dir: PathBuf) -> Self {
        Self {
            provision_token,
            daemon_url,
            work_dir,
            heartbeat_interval: Duration::from_secs(3),
            log_push_interval: Duration::from_secs(3),
        }
    }
}

/// What the controller hands back at registration.
#[derive(Debug, Clone, Deserialize)]
struct Session {
    node_id: String,
    auth_token: String,
    assets_url: String,
    heartbeat_url: String,
    status_url: String,
    logs_url: String,
    #[serde(default)]
    entry_script: String,
    #[serde(default)]
    config: BTreeMap<String, ConfigValue>,
}

enum ScriptOutcome {
    Exited(std::process::ExitStatus),
    Interrupted,
}

type LogBuffer = Arc<Mutex<Vec<LogEntry>>>;

/// The node agent.
pub struct Agent {
    config: AgentConfig,
    client: reqwest::Client,
    log_buffer: LogBuffer,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config,
            client,
            log_buffer: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Run the agent to completion: register, execute the workload, and
    /// stay alive (heartbeating) until the controller or the OS orders a
    /// shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.config.work_dir)
            .context("failed to create working directory")?;

        info!(daemon = %self.config.daemon_url, "registering with controller");
        let session = self.register().await?;
        info!(node_id = %session.node_id, "registered");

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.client.clone(),
            session.heartbeat_url.clone(),
            session.auth_token.clone(),
            self.config.heartbeat_interval,
            self.shutdown_tx.clone(),
            self.shutdown_rx.clone(),
        ));
        let log_push = tokio::spawn(log_push_loop(
            self.client.clone(),
            session.logs_url.clone(),
            session.auth_token.clone(),
            self.config.log_push_interval,
            self.log_buffer.clone(),
            self.shutdown_rx.clone(),
        ));

        let workload = self.run_workload(&session).await;

        if workload.is_ok() {
            info!("workload finished, waiting for shutdown order");
            if let Err(e) = self.wait_for_shutdown().await {
                warn!(error = %e, "signal handling unavailable, shutting down");
            }
        }

        // Stop the loops; the log loop flushes once more on its way out.
        let _ = self.shutdown_tx.send(true);
        let _ = heartbeat.await;
        let _ = log_push.await;

        workload
    }

    async fn wait_for_shutdown(&self) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown_rx.clone();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .context("failed to install SIGTERM handler")?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
                _ = term.recv() => info!("termination signal received, shutting down"),
                _ = shutdown.changed() => info!("shutdown ordered by controller"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
                _ = shutdown.changed() => info!("shutdown ordered by controller"),
            }
        }
        Ok(())
    }

    // ── Protocol calls ─────────────────────────────────────────────

    async fn register(&self) -> anyhow::Result<Session> {
        let url = format!(
            "{}/api/v1/nodes/register",
            self.config.daemon_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "provision_token": self.config.provision_token }))
            .send()
            .await
            .context("registration request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("registration failed with status {status}: {body}");
        }

        let session: Session = response
            .json()
            .await
            .context("failed to decode registration response")?;
        debug!(keys = session.config.len(), "received node configuration");
        Ok(session)
    }

    async fn update_status(&self, session: &Session, status: &str, message: &str) {
        let result = self
            .client
            .post(&session.status_url)
            .bearer_auth(&session.auth_token)
            .json(&serde_json::json!({ "status": status, "message": message }))
            .send()
            .await;
        match result {
            Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                warn!("status update rejected, deployment likely terminated");
                let _ = self.shutdown_tx.send(true);
            }
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "status update failed");
            }
            Ok(_) => debug!(%status, "status updated"),
            Err(e) => warn!(error = %e, "status update request failed"),
        }
    }

    async fn download_bundle(&self, session: &Session, dest: &Path) -> anyhow::Result<()> {
        let mut response = self
            .client
            .get(&session.assets_url)
            .bearer_auth(&session.auth_token)
            .send()
            .await
            .context("bundle download request failed")?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let _ = self.shutdown_tx.send(true);
            bail!("bundle download rejected, deployment likely terminated");
        }
        if !response.status().is_success() {
            bail!("bundle download failed with status {}", response.status());
        }

        let mut out = tokio::fs::File::create(dest)
            .await
            .context("failed to create bundle file")?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        info!(bytes = written, "bundle downloaded");
        Ok(())
    }

    // ── Workload ───────────────────────────────────────────────────

    async fn run_workload(&self, session: &Session) -> anyhow::Result<()> {
        self.update_status(session, "downloading_assets", "downloading deployment bundle")
            .await;

        let bundle_path = self.config.work_dir.join("bundle.tar.gz");
        if let Err(e) = self.download_bundle(session, &bundle_path).await {
            self.update_status(session, "failed", &format!("failed to download bundle: {e}"))
                .await;
            return Err(e);
        }

        if let Err(e) = taskfly_bundle::extract_archive(&bundle_path, &self.config.work_dir) {
            self.update_status(session, "failed", &format!("failed to extract bundle: {e}"))
                .await;
            return Err(e.into());
        }
        info!("bundle extracted");

        let script_path = self.config.work_dir.join(&session.entry_script);
        if session.entry_script.is_empty() || !script_path.is_file() {
            info!("no entry script in bundle, node ready");
            self.update_status(session, "completed", "no entry script found, node ready")
                .await;
            return Ok(());
        }

        self.update_status(session, "running", "executing entry script")
            .await;
        match self.execute_script(session, &script_path).await? {
            ScriptOutcome::Interrupted => {
                info!("entry script stopped by shutdown order");
                Ok(())
            }
            ScriptOutcome::Exited(status) if status.success() => {
                info!("entry script completed");
                self.update_status(session, "completed", "entry script completed successfully")
                    .await;
                Ok(())
            }
            ScriptOutcome::Exited(status) => {
                let description = format!("entry script exited with {status}");
                warn!(%description, "workload failed");
                self.update_status(session, "failed", &description).await;
                bail!(description);
            }
        }
    }

    async fn execute_script(
        &self,
        session: &Session,
        script_path: &Path,
    ) -> anyhow::Result<ScriptOutcome> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(script_path, std::fs::Permissions::from_mode(0o755))
                .context("failed to make entry script executable")?;
        }

        let mut command = tokio::process::Command::new(script_path);
        command
            .current_dir(&self.config.work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &session.config {
            command.env(key.to_uppercase(), value.render());
        }

        let mut child = command.spawn().context("failed to start entry script")?;
        info!(pid = child.id(), script = %script_path.display(), "entry script started");

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(
                self.log_buffer.clone(),
                session.node_id.clone(),
                LogStream::Stdout,
                stdout,
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(
                self.log_buffer.clone(),
                session.node_id.clone(),
                LogStream::Stderr,
                stderr,
            );
        }

        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            status = child.wait() => Ok(ScriptOutcome::Exited(status?)),
            _ = shutdown.changed() => {
                stop_child(&mut child).await;
                Ok(ScriptOutcome::Interrupted)
            }
        }
    }
}

/// SIGTERM the script, give it a grace period, then SIGKILL.
async fn stop_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        info!(pid, "sending SIGTERM to entry script");
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(SCRIPT_STOP_GRACE, child.wait())
        .await
        .is_err()
    {
        warn!("entry script ignored SIGTERM, killing");
        let _ = child.kill().await;
    }
}

fn spawn_line_reader<R>(buffer: LogBuffer, node_id: String, stream: LogStream, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(LogEntry {
                    timestamp: Utc::now(),
                    deployment_id: String::new(),
                    node_id: node_id.clone(),
                    stream,
                    message: line,
                });
        }
    });
}

// ── Background loops ───────────────────────────────────────────────

#[derive(Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    shutdown: bool,
}

enum HeartbeatOutcome {
    Alive,
    ShutdownOrdered,
    Unauthorized,
}

async fn heartbeat_loop(
    client: reqwest::Client,
    url: String,
    auth_token: String,
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut sys = System::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match send_heartbeat(&client, &url, &auth_token, &mut sys).await {
                    Ok(HeartbeatOutcome::Alive) => {}
                    Ok(HeartbeatOutcome::ShutdownOrdered) => {
                        info!("controller ordered shutdown");
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                    Ok(HeartbeatOutcome::Unauthorized) => {
                        warn!("heartbeat rejected, deployment likely terminated");
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                    // Transient failures retry on the next tick.
                    Err(e) => warn!(error = %e, "heartbeat failed"),
                }
            }
            _ = shutdown_rx.changed() => return,
        }
    }
}

async fn send_heartbeat(
    client: &reqwest::Client,
    url: &str,
    auth_token: &str,
    sys: &mut System,
) -> anyhow::Result<HeartbeatOutcome> {
    let metrics = metrics::collect(sys);
    let response = client
        .post(url)
        .bearer_auth(auth_token)
        .json(&serde_json::json!({ "metrics": metrics }))
        .send()
        .await?;

    if response.status() == StatusCode::UNAUTHORIZED {
        return Ok(HeartbeatOutcome::Unauthorized);
    }
    let body: HeartbeatResponse = response.error_for_status()?.json().await?;
    Ok(if body.shutdown {
        HeartbeatOutcome::ShutdownOrdered
    } else {
        HeartbeatOutcome::Alive
    })
}

async fn log_push_loop(
    client: reqwest::Client,
    url: String,
    auth_token: String,
    interval: Duration,
    buffer: LogBuffer,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => push_logs(&client, &url, &auth_token, &buffer).await,
            _ = shutdown_rx.changed() => {
                // One final flush on the way out.
                push_logs(&client, &url, &auth_token, &buffer).await;
                return;
            }
        }
    }
}

async fn push_logs(client: &reqwest::Client, url: &str, auth_token: &str, buffer: &LogBuffer) {
    let drained: Vec<LogEntry> = {
        let mut locked = buffer.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *locked)
    };
    if drained.is_empty() {
        return;
    }

    let count = drained.len();
    let result = client
        .post(url)
        .bearer_auth(auth_token)
        .json(&serde_json::json!({ "logs": drained }))
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {
            debug!(count, "pushed log entries");
        }
        Ok(response) => warn!(status = %response.status(), count, "log push failed"),
        Err(e) => warn!(error = %e, count, "log push request failed"),
    }
}
