//! Store — the single shared mutable resource of the controller.
//!
//! One `RwLock` serialises all access: reads take the shared lock and
//! return deep copies, mutations take the exclusive lock and persist
//! deployments+nodes to `state.json` before returning. The
//! `nodes_by_deployment` index and the per-deployment log rings live
//! only in memory and are rebuilt (or dropped) on restart.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::*;

/// Default number of log entries retained per deployment.
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// Default cap applied when `get_logs` is called with `limit == 0`.
const DEFAULT_GET_LOGS_LIMIT: usize = 1000;

/// Aggregate counters reported by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_deployments: usize,
    pub total_nodes: usize,
    pub total_logs: usize,
    pub deployment_status: BTreeMap<DeploymentStatus, usize>,
}

#[derive(Serialize)]
struct PersistedStateRef<'a> {
    deployments: &'a BTreeMap<String, Deployment>,
    nodes: &'a BTreeMap<String, Node>,
}

#[derive(Default, Deserialize)]
struct PersistedState {
    #[serde(default)]
    deployments: BTreeMap<String, Deployment>,
    #[serde(default)]
    nodes: BTreeMap<String, Node>,
}

struct Inner {
    deployments: BTreeMap<String, Deployment>,
    nodes: BTreeMap<String, Node>,
    /// Node ids per deployment, in node-index order.
    nodes_by_dep: BTreeMap<String, Vec<String>>,
    /// Per-deployment bounded log rings; never persisted.
    logs: BTreeMap<String, VecDeque<LogEntry>>,
    log_capacity: usize,
    /// Path of `state.json`; `None` for in-memory stores.
    state_path: Option<PathBuf>,
}

/// Thread-safe state store for deployments, nodes, logs, and metrics.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

impl Store {
    /// Open (or create) a disk-backed store under `state_dir`, loading
    /// any previously persisted deployments and nodes.
    pub fn open(state_dir: &Path) -> StateResult<Self> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| StateError::Persist(format!("create {}: {e}", state_dir.display())))?;
        let state_path = state_dir.join("state.json");

        let mut inner = Inner {
            deployments: BTreeMap::new(),
            nodes: BTreeMap::new(),
            nodes_by_dep: BTreeMap::new(),
            logs: BTreeMap::new(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            state_path: Some(state_path.clone()),
        };

        if state_path.exists() {
            let data = std::fs::read(&state_path)
                .map_err(|e| StateError::Persist(format!("read {}: {e}", state_path.display())))?;
            let persisted: PersistedState = serde_json::from_slice(&data)
                .map_err(|e| StateError::Persist(format!("parse {}: {e}", state_path.display())))?;
            inner.deployments = persisted.deployments;
            inner.nodes = persisted.nodes;
            inner.rebuild_index();
            debug!(
                deployments = inner.deployments.len(),
                nodes = inner.nodes.len(),
                "state loaded from disk"
            );
        }

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                deployments: BTreeMap::new(),
                nodes: BTreeMap::new(),
                nodes_by_dep: BTreeMap::new(),
                logs: BTreeMap::new(),
                log_capacity: DEFAULT_LOG_CAPACITY,
                state_path: None,
            })),
        }
    }

    /// Override the per-deployment log ring capacity.
    pub fn with_log_capacity(self, capacity: usize) -> Self {
        self.write().log_capacity = capacity;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert a new deployment; stamps `created_at`/`updated_at`.
    pub fn create_deployment(&self, mut deployment: Deployment) -> StateResult<()> {
        let mut inner = self.write();
        if inner.deployments.contains_key(&deployment.id) {
            return Err(StateError::DuplicateDeployment(deployment.id.clone()));
        }
        let now = Utc::now();
        deployment.created_at = now;
        deployment.updated_at = now;
        let id = deployment.id.clone();
        inner.deployments.insert(id.clone(), deployment);
        inner.nodes_by_dep.insert(id.clone(), Vec::new());
        inner.save()?;
        debug!(deployment_id = %id, "deployment created");
        Ok(())
    }

    /// Snapshot of one deployment.
    pub fn get_deployment(&self, deployment_id: &str) -> StateResult<Deployment> {
        self.read()
            .deployments
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| StateError::DeploymentNotFound(deployment_id.to_string()))
    }

    /// Snapshots of every deployment; order is unspecified.
    pub fn get_all_deployments(&self) -> Vec<Deployment> {
        self.read().deployments.values().cloned().collect()
    }

    /// Set a deployment's status, stamping `updated_at` and (on the
    /// first transition into a terminal status) `completed_at`. A
    /// terminal deployment cannot be moved back to a pre-terminal
    /// status (such updates are no-ops); termination of an already
    /// finished deployment remains legal.
    pub fn update_deployment_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        error_message: Option<String>,
    ) -> StateResult<()> {
        let mut inner = self.write();
        let deployment = inner
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| StateError::DeploymentNotFound(deployment_id.to_string()))?;
        if deployment.status.is_terminal()
            && matches!(
                status,
                DeploymentStatus::Pending
                    | DeploymentStatus::Provisioning
                    | DeploymentStatus::Running
            )
        {
            debug!(%deployment_id, current = %deployment.status, requested = %status, "ignoring demotion of terminal deployment");
            return Ok(());
        }
        deployment.status = status;
        deployment.updated_at = Utc::now();
        if let Some(message) = error_message {
            deployment.error_message = Some(message);
        }
        if status.is_terminal() && deployment.completed_at.is_none() {
            deployment.completed_at = Some(Utc::now());
        }
        inner.save()
    }

    /// Remove a deployment together with its nodes and logs.
    pub fn delete_deployment(&self, deployment_id: &str) -> StateResult<()> {
        let mut inner = self.write();
        if inner.deployments.remove(deployment_id).is_none() {
            return Err(StateError::DeploymentNotFound(deployment_id.to_string()));
        }
        if let Some(node_ids) = inner.nodes_by_dep.remove(deployment_id) {
            for node_id in node_ids {
                inner.nodes.remove(&node_id);
            }
        }
        inner.logs.remove(deployment_id);
        inner.save()?;
        debug!(%deployment_id, "deployment deleted");
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert a new node under an existing deployment.
    pub fn create_node(&self, mut node: Node) -> StateResult<()> {
        let mut inner = self.write();
        if !inner.deployments.contains_key(&node.deployment_id) {
            return Err(StateError::DeploymentNotFound(node.deployment_id.clone()));
        }
        if inner.nodes.contains_key(&node.node_id) {
            return Err(StateError::DuplicateNode(node.node_id.clone()));
        }
        node.last_update = Utc::now();
        let node_id = node.node_id.clone();
        inner
            .nodes_by_dep
            .entry(node.deployment_id.clone())
            .or_default()
            .push(node_id.clone());
        inner.nodes.insert(node_id, node);
        inner.save()
    }

    /// Snapshot of one node.
    pub fn get_node(&self, node_id: &str) -> StateResult<Node> {
        self.read()
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| StateError::NodeNotFound(node_id.to_string()))
    }

    /// Snapshots of a deployment's nodes, in node-index order.
    pub fn get_nodes_by_deployment(&self, deployment_id: &str) -> StateResult<Vec<Node>> {
        let inner = self.read();
        let node_ids = inner
            .nodes_by_dep
            .get(deployment_id)
            .ok_or_else(|| StateError::DeploymentNotFound(deployment_id.to_string()))?;
        Ok(node_ids
            .iter()
            .filter_map(|id| inner.nodes.get(id).cloned())
            .collect())
    }

    /// Set a node's status and recompute the deployment completion
    /// summary. Terminal node statuses are sticky: updating a node that
    /// has already completed, failed, or terminated is a no-op.
    pub fn update_node_status(
        &self,
        deployment_id: &str,
        node_id: &str,
        status: NodeStatus,
        error_message: Option<String>,
    ) -> StateResult<()> {
        let mut inner = self.write();
        let node = inner.node_mut(deployment_id, node_id)?;
        if node.status.is_terminal() {
            debug!(%node_id, current = %node.status, requested = %status, "ignoring status update for terminal node");
            return Ok(());
        }
        node.status = status;
        node.last_update = Utc::now();
        if let Some(message) = error_message {
            node.error_message = Some(message);
        }
        inner.recompute_completion(deployment_id);
        inner.save()
    }

    /// Issue a node's auth token. The provision token is cleared in the
    /// same mutation so a replayed registration can no longer match.
    pub fn update_node_auth_token(
        &self,
        deployment_id: &str,
        node_id: &str,
        auth_token: &str,
    ) -> StateResult<()> {
        let mut inner = self.write();
        let node = inner.node_mut(deployment_id, node_id)?;
        node.auth_token = auth_token.to_string();
        node.provision_token.clear();
        node.last_update = Utc::now();
        inner.save()
    }

    /// Bump a node's `last_update` (heartbeat received).
    pub fn update_node_last_seen(&self, deployment_id: &str, node_id: &str) -> StateResult<()> {
        let mut inner = self.write();
        let node = inner.node_mut(deployment_id, node_id)?;
        node.last_update = Utc::now();
        inner.save()
    }

    /// Set a node's free-form status message.
    pub fn update_node_message(
        &self,
        deployment_id: &str,
        node_id: &str,
        message: &str,
    ) -> StateResult<()> {
        let mut inner = self.write();
        let node = inner.node_mut(deployment_id, node_id)?;
        node.error_message = Some(message.to_string());
        node.last_update = Utc::now();
        inner.save()
    }

    /// Record the backend-assigned instance id and address.
    pub fn update_node_instance_info(
        &self,
        deployment_id: &str,
        node_id: &str,
        instance_id: &str,
        ip_address: &str,
    ) -> StateResult<()> {
        let mut inner = self.write();
        let node = inner.node_mut(deployment_id, node_id)?;
        node.instance_id = Some(instance_id.to_string());
        node.ip_address = Some(ip_address.to_string());
        node.last_update = Utc::now();
        inner.save()
    }

    /// Flag a node so its next heartbeat response orders a shutdown.
    pub fn mark_node_for_shutdown(&self, deployment_id: &str, node_id: &str) -> StateResult<()> {
        let mut inner = self.write();
        let node = inner.node_mut(deployment_id, node_id)?;
        node.should_shutdown = true;
        node.last_update = Utc::now();
        inner.save()
    }

    /// Attach the latest heartbeat metrics to a node.
    pub fn update_node_metrics(
        &self,
        deployment_id: &str,
        node_id: &str,
        mut metrics: SystemMetrics,
    ) -> StateResult<()> {
        let mut inner = self.write();
        let node = inner.node_mut(deployment_id, node_id)?;
        metrics.timestamp = Utc::now();
        node.metrics = Some(metrics);
        node.last_update = Utc::now();
        inner.save()
    }

    /// Find the node (and its deployment) holding the given auth token.
    pub fn find_node_by_auth_token(&self, auth_token: &str) -> Option<(Node, Deployment)> {
        if auth_token.is_empty() {
            return None;
        }
        let inner = self.read();
        let node = inner
            .nodes
            .values()
            .find(|n| !n.auth_token.is_empty() && n.auth_token == auth_token)?;
        let deployment = inner.deployments.get(&node.deployment_id)?;
        Some((node.clone(), deployment.clone()))
    }

    /// Find the node (and its deployment) holding the given provision
    /// token. Consumed tokens no longer match.
    pub fn find_node_by_provision_token(&self, provision_token: &str) -> Option<(Node, Deployment)> {
        if provision_token.is_empty() {
            return None;
        }
        let inner = self.read();
        let node = inner
            .nodes
            .values()
            .find(|n| !n.provision_token.is_empty() && n.provision_token == provision_token)?;
        let deployment = inner.deployments.get(&node.deployment_id)?;
        Some((node.clone(), deployment.clone()))
    }

    // ── Logs ───────────────────────────────────────────────────────

    /// Append log entries to a deployment's ring, stamping each entry's
    /// `deployment_id` and `node_id` with the caller-resolved identity.
    /// The oldest entries are dropped once the ring is full.
    pub fn append_logs(
        &self,
        deployment_id: &str,
        node_id: &str,
        entries: Vec<LogEntry>,
    ) -> StateResult<()> {
        let mut inner = self.write();
        if !inner.deployments.contains_key(deployment_id) {
            return Err(StateError::DeploymentNotFound(deployment_id.to_string()));
        }
        let capacity = inner.log_capacity;
        let ring = inner.logs.entry(deployment_id.to_string()).or_default();
        for mut entry in entries {
            entry.deployment_id = deployment_id.to_string();
            entry.node_id = node_id.to_string();
            ring.push_back(entry);
        }
        while ring.len() > capacity {
            ring.pop_front();
        }
        Ok(())
    }

    /// Fetch logs for a deployment, optionally filtered by node and by
    /// `timestamp >= since`, keeping at most `limit` most recent entries
    /// (1000 when `limit` is zero).
    pub fn get_logs(
        &self,
        deployment_id: &str,
        node_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StateResult<Vec<LogEntry>> {
        let inner = self.read();
        if !inner.deployments.contains_key(deployment_id) {
            return Err(StateError::DeploymentNotFound(deployment_id.to_string()));
        }
        let limit = if limit == 0 { DEFAULT_GET_LOGS_LIMIT } else { limit };
        let filtered: Vec<LogEntry> = inner
            .logs
            .get(deployment_id)
            .map(|ring| {
                ring.iter()
                    .filter(|entry| node_id.is_none_or(|id| entry.node_id == id))
                    .filter(|entry| since.is_none_or(|s| entry.timestamp >= s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let skip = filtered.len().saturating_sub(limit);
        Ok(filtered.into_iter().skip(skip).collect())
    }

    // ── Stats ──────────────────────────────────────────────────────

    /// Aggregate counters across the whole store.
    pub fn get_stats(&self) -> StoreStats {
        let inner = self.read();
        let mut deployment_status: BTreeMap<DeploymentStatus, usize> = BTreeMap::new();
        for deployment in inner.deployments.values() {
            *deployment_status.entry(deployment.status).or_default() += 1;
        }
        StoreStats {
            total_deployments: inner.deployments.len(),
            total_nodes: inner.nodes.len(),
            total_logs: inner.logs.values().map(VecDeque::len).sum(),
            deployment_status,
        }
    }
}

impl Inner {
    fn rebuild_index(&mut self) {
        self.nodes_by_dep.clear();
        let mut by_dep: BTreeMap<String, Vec<&Node>> = BTreeMap::new();
        for node in self.nodes.values() {
            by_dep.entry(node.deployment_id.clone()).or_default().push(node);
        }
        for (deployment_id, mut nodes) in by_dep {
            nodes.sort_by_key(|n| n.node_index);
            self.nodes_by_dep.insert(
                deployment_id,
                nodes.into_iter().map(|n| n.node_id.clone()).collect(),
            );
        }
        // Deployments with no nodes still get an (empty) index entry.
        for id in self.deployments.keys() {
            self.nodes_by_dep.entry(id.clone()).or_default();
        }
    }

    fn node_mut(&mut self, deployment_id: &str, node_id: &str) -> StateResult<&mut Node> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StateError::NodeNotFound(node_id.to_string()))?;
        if node.deployment_id != deployment_id {
            return Err(StateError::CrossDeployment {
                node: node_id.to_string(),
                deployment: deployment_id.to_string(),
            });
        }
        Ok(node)
    }

    /// Recompute `nodes_completed`/`nodes_failed` and derive the
    /// deployment status from its nodes. Idempotent: only fields whose
    /// value actually changes are written, and `completed_at` is set at
    /// most once. A deployment already in a terminal status is never
    /// rewritten.
    fn recompute_completion(&mut self, deployment_id: &str) {
        let Some(node_ids) = self.nodes_by_dep.get(deployment_id) else {
            return;
        };
        let mut completed = 0u32;
        let mut failed = 0u32;
        let mut in_flight = 0u32;
        for node_id in node_ids {
            match self.nodes.get(node_id).map(|n| n.status) {
                Some(NodeStatus::Completed) => completed += 1,
                Some(NodeStatus::Failed) => failed += 1,
                Some(_) => in_flight += 1,
                None => {}
            }
        }

        let Some(deployment) = self.deployments.get_mut(deployment_id) else {
            return;
        };

        let mut changed = false;
        if deployment.nodes_completed != completed {
            deployment.nodes_completed = completed;
            changed = true;
        }
        if deployment.nodes_failed != failed {
            deployment.nodes_failed = failed;
            changed = true;
        }

        if !deployment.status.is_terminal() {
            if completed + failed == deployment.total_nodes {
                let status = if failed > 0 {
                    DeploymentStatus::Failed
                } else {
                    DeploymentStatus::Completed
                };
                if deployment.status != status {
                    deployment.status = status;
                    changed = true;
                }
                if deployment.completed_at.is_none() {
                    deployment.completed_at = Some(Utc::now());
                    changed = true;
                }
            } else if in_flight > 0 && deployment.status == DeploymentStatus::Provisioning {
                deployment.status = DeploymentStatus::Running;
                changed = true;
            }
        }

        if changed {
            deployment.updated_at = Utc::now();
        }
    }

    fn save(&self) -> StateResult<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let persisted = PersistedStateRef {
            deployments: &self.deployments,
            nodes: &self.nodes,
        };
        let data = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| StateError::Persist(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)
            .map_err(|e| StateError::Persist(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| StateError::Persist(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }
}
