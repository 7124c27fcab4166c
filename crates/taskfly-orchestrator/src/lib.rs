//! taskfly-orchestrator — the deployment controller.
//!
//! Owns the deployment lifecycle: a submitted bundle is processed into a
//! worker bundle and per-node configs, nodes are provisioned in parallel
//! through a pluggable [`ComputeBackend`], and completion, termination,
//! and cleanup are driven from node state changes recorded in the store.

mod backend;
mod error;

pub use backend::{BackendError, ComputeBackend, InstanceInfo, InstanceRequest, LocalBackend};
pub use error::{OrchestratorError, OrchestratorResult};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskfly_bundle::process_bundle;
use taskfly_state::{
    Deployment, DeploymentConfig, DeploymentStatus, Node, NodeStatus, Store,
};

/// Delay between terminating a deployment and deleting its files, so
/// in-flight asset downloads can finish.
const CLEANUP_GRACE: Duration = Duration::from_secs(2);

/// How often the background sweeper looks for retired deployments.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Age past `completed_at` after which the sweeper retires a terminal
/// deployment.
pub const SWEEP_MAX_AGE: chrono::Duration = chrono::Duration::hours(1);

/// Generate a random id of the form `<prefix>_<8 hex digits>`.
pub fn generate_id(prefix: &str) -> String {
    let bytes: [u8; 4] = rand::random();
    format!("{prefix}_{}", hex::encode(bytes))
}

/// The deployment controller. Cheap to clone; clones share the store,
/// the backend registry, and the in-flight provisioning table.
#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    deployment_dir: PathBuf,
    callback_url: String,
    backends: HashMap<String, Arc<dyn ComputeBackend>>,
    /// In-flight provisioning tasks per deployment; aborted on
    /// termination so cancellation reaches the backend calls.
    provisioning: Arc<Mutex<HashMap<String, Vec<JoinHandle<()>>>>>,
}

impl Orchestrator {
    pub fn new(store: Store, deployment_dir: PathBuf, callback_url: String) -> Self {
        Self {
            store,
            deployment_dir,
            callback_url,
            backends: HashMap::new(),
            provisioning: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a compute backend under its own name.
    pub fn with_backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn deployment_dir(&self) -> &Path {
        &self.deployment_dir
    }

    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    // ── Submission ─────────────────────────────────────────────────

    /// Process an uploaded client bundle into a new deployment and kick
    /// off provisioning in the background. On a processing or
    /// validation error the working directory is removed and nothing is
    /// persisted.
    pub async fn submit(&self, bundle_path: &Path) -> OrchestratorResult<Deployment> {
        let deployment_id = generate_id("dep");
        let work_dir = self.deployment_dir.join(&deployment_id);
        info!(%deployment_id, bundle = %bundle_path.display(), "processing deployment bundle");

        let processed = match process_bundle(bundle_path, &work_dir) {
            Ok(processed) => processed,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&work_dir);
                return Err(e.into());
            }
        };
        let descriptor = processed.descriptor;

        let node_configs = match taskfly_metadata::materialize(&descriptor.nodes, &deployment_id) {
            Ok(configs) => configs,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&work_dir);
                return Err(e.into());
            }
        };

        let deployment = Deployment::new(
            &deployment_id,
            &descriptor.cloud_provider,
            descriptor.nodes.count,
            processed.worker_bundle_path,
            DeploymentConfig {
                instance_config: descriptor.instance_config,
                remote_dest_dir: descriptor.remote_dest_dir,
                remote_script_to_run: descriptor.remote_script_to_run,
            },
        );
        self.store.create_deployment(deployment)?;

        for node_config in &node_configs {
            let node = Node::new(
                &deployment_id,
                &node_config.node_id,
                node_config.node_index,
                node_config.config.clone(),
                generate_id("pt"),
            );
            if let Err(e) = self.store.create_node(node) {
                let _ = self.store.update_deployment_status(
                    &deployment_id,
                    DeploymentStatus::Failed,
                    Some(e.to_string()),
                );
                return Err(e.into());
            }
        }

        info!(%deployment_id, nodes = node_configs.len(), "deployment created");

        let this = self.clone();
        let id = deployment_id.clone();
        tokio::spawn(async move {
            this.execute_deployment(id).await;
        });

        Ok(self.store.get_deployment(&deployment_id)?)
    }

    // ── Provisioning ───────────────────────────────────────────────

    async fn execute_deployment(&self, deployment_id: String) {
        info!(%deployment_id, "starting deployment execution");
        if let Err(e) =
            self.store
                .update_deployment_status(&deployment_id, DeploymentStatus::Provisioning, None)
        {
            error!(%deployment_id, error = %e, "failed to mark deployment provisioning");
            return;
        }

        let deployment = match self.store.get_deployment(&deployment_id) {
            Ok(deployment) => deployment,
            Err(e) => {
                error!(%deployment_id, error = %e, "deployment disappeared before execution");
                return;
            }
        };

        let Some(backend) = self.backends.get(&deployment.backend_name).cloned() else {
            let message = format!("unsupported compute backend: {}", deployment.backend_name);
            warn!(%deployment_id, backend = %deployment.backend_name, "no such backend registered");
            let _ = self.store.update_deployment_status(
                &deployment_id,
                DeploymentStatus::Failed,
                Some(message),
            );
            return;
        };

        let nodes = match self.store.get_nodes_by_deployment(&deployment_id) {
            Ok(nodes) => nodes,
            Err(e) => {
                let _ = self.store.update_deployment_status(
                    &deployment_id,
                    DeploymentStatus::Failed,
                    Some(e.to_string()),
                );
                return;
            }
        };

        let instance_config = deployment
            .config
            .instance_config
            .get(backend.name())
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let mut handles = Vec::with_capacity(nodes.len());
        for node in nodes {
            let this = self.clone();
            let backend = backend.clone();
            let instance_config = instance_config.clone();
            handles.push(tokio::spawn(async move {
                this.provision_node(backend, node, instance_config).await;
            }));
        }
        self.provisioning
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(deployment_id.clone(), handles);

        // Status refinement from here on is the completion summary's
        // job; a deployment that already went terminal stays put.
        let _ =
            self.store
                .update_deployment_status(&deployment_id, DeploymentStatus::Running, None);
        info!(%deployment_id, "provisioning started for all nodes");
    }

    /// Provision one node. A backend failure is fatal for this node
    /// only; its peers continue.
    async fn provision_node(
        &self,
        backend: Arc<dyn ComputeBackend>,
        node: Node,
        instance_config: serde_json::Value,
    ) {
        info!(node_id = %node.node_id, backend = backend.name(), "provisioning node");
        self.set_node_status(&node, NodeStatus::Provisioning, None);

        let request = InstanceRequest {
            node_index: node.node_index,
            provision_token: node.provision_token.clone(),
            callback_url: self.callback_url.clone(),
            node_config: node.config.clone(),
            instance_config,
        };

        match backend.provision(request).await {
            Err(e) => {
                warn!(node_id = %node.node_id, error = %e, "node provisioning failed");
                self.set_node_status(&node, NodeStatus::Failed, Some(e.to_string()));
            }
            Ok(info) => {
                if let Err(e) = self.store.update_node_instance_info(
                    &node.deployment_id,
                    &node.node_id,
                    &info.instance_id,
                    &info.ip_address,
                ) {
                    error!(node_id = %node.node_id, error = %e, "failed to record instance info");
                }
                self.set_node_status(&node, NodeStatus::Booting, None);
                info!(
                    node_id = %node.node_id,
                    instance_id = %info.instance_id,
                    ip = %info.ip_address,
                    "node provisioned"
                );
                // In-process backends have no boot phase to wait out.
                if backend.starts_agent_inline() {
                    self.set_node_status(&node, NodeStatus::Registering, None);
                }
            }
        }
    }

    fn set_node_status(&self, node: &Node, status: NodeStatus, message: Option<String>) {
        if let Err(e) =
            self.store
                .update_node_status(&node.deployment_id, &node.node_id, status, message)
        {
            error!(node_id = %node.node_id, %status, error = %e, "failed to update node status");
        }
    }

    // ── Termination and cleanup ────────────────────────────────────

    /// Terminate a deployment: flag every live node for shutdown (its
    /// next heartbeat carries the order), abort in-flight provisioning,
    /// and schedule file cleanup after a short grace.
    pub async fn terminate_deployment(&self, deployment_id: &str) -> OrchestratorResult<()> {
        self.store.get_deployment(deployment_id)?;
        info!(%deployment_id, "terminating deployment");

        self.store
            .update_deployment_status(deployment_id, DeploymentStatus::Terminating, None)?;

        if let Some(handles) = self
            .provisioning
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(deployment_id)
        {
            for handle in handles {
                handle.abort();
            }
        }

        for node in self.store.get_nodes_by_deployment(deployment_id)? {
            // Every agent gets the shutdown order through its next
            // heartbeat, even ones whose node already finished; only
            // live nodes transition to terminated.
            self.store
                .mark_node_for_shutdown(deployment_id, &node.node_id)?;
            if node.status.is_terminal() {
                continue;
            }
            self.store.update_node_status(
                deployment_id,
                &node.node_id,
                NodeStatus::Terminated,
                None,
            )?;
        }

        self.store
            .update_deployment_status(deployment_id, DeploymentStatus::Terminated, None)?;
        info!(%deployment_id, "deployment terminated");

        let this = self.clone();
        let id = deployment_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(CLEANUP_GRACE).await;
            this.cleanup_files(&id);
            debug!(deployment_id = %id, "deployment files cleaned up after termination");
        });

        Ok(())
    }

    /// Remove a deployment's on-disk artifacts (worker bundle + working
    /// directory), leaving the store record in place.
    fn cleanup_files(&self, deployment_id: &str) {
        if let Ok(deployment) = self.store.get_deployment(deployment_id) {
            if let Err(e) = std::fs::remove_file(&deployment.bundle_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(%deployment_id, error = %e, "failed to remove worker bundle");
                }
            }
        }
        let work_dir = self.deployment_dir.join(deployment_id);
        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(%deployment_id, error = %e, "failed to remove working directory");
            }
        }
    }

    /// Remove a terminal deployment entirely: files and store record.
    /// Rejected while the deployment is still live.
    pub fn cleanup_deployment(&self, deployment_id: &str) -> OrchestratorResult<()> {
        let deployment = self.store.get_deployment(deployment_id)?;
        if !deployment.status.is_terminal() {
            return Err(OrchestratorError::CleanupNotAllowed {
                id: deployment_id.to_string(),
                status: deployment.status,
            });
        }
        info!(%deployment_id, "cleaning up deployment");
        self.cleanup_files(deployment_id);
        self.store.delete_deployment(deployment_id)?;
        Ok(())
    }

    /// Clean up every deployment in a terminal state. Returns
    /// `(cleaned, failed)` counts.
    pub fn cleanup_all_completed(&self) -> (usize, usize) {
        let mut cleaned = 0;
        let mut failed = 0;
        for deployment in self.store.get_all_deployments() {
            if !deployment.status.is_terminal() {
                continue;
            }
            match self.cleanup_deployment(&deployment.id) {
                Ok(()) => cleaned += 1,
                Err(e) => {
                    error!(deployment_id = %deployment.id, error = %e, "cleanup failed");
                    failed += 1;
                }
            }
        }
        if cleaned > 0 || failed > 0 {
            info!(cleaned, failed, "cleanup sweep finished");
        }
        (cleaned, failed)
    }

    /// One sweeper pass: retire terminal deployments whose
    /// `completed_at` is older than `max_age`.
    pub fn sweep_once(&self, max_age: chrono::Duration) -> usize {
        let now = chrono::Utc::now();
        let mut retired = 0;
        for deployment in self.store.get_all_deployments() {
            if !deployment.status.is_terminal() {
                continue;
            }
            let Some(completed_at) = deployment.completed_at else {
                continue;
            };
            if now - completed_at < max_age {
                continue;
            }
            match self.cleanup_deployment(&deployment.id) {
                Ok(()) => {
                    info!(deployment_id = %deployment.id, "retired old deployment");
                    retired += 1;
                }
                Err(e) => {
                    error!(deployment_id = %deployment.id, error = %e, "failed to retire deployment")
                }
            }
        }
        retired
    }

    /// Background sweeper: every [`SWEEP_INTERVAL`], retire terminal
    /// deployments older than [`SWEEP_MAX_AGE`].
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    debug!("running periodic deployment sweep");
                    self.sweep_once(SWEEP_MAX_AGE);
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
