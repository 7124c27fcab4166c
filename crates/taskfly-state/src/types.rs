//! Domain types for the TaskFly state store.
//!
//! These types represent the persisted state of deployments and nodes
//! plus the ephemeral log and metrics records. Everything serializes
//! to/from JSON, both for the persisted `state.json` and for the wire.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskfly_metadata::ConfigValue;

// ── Status enums ───────────────────────────────────────────────────

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Provisioning,
    Running,
    Completed,
    Failed,
    Terminating,
    Terminated,
}

impl DeploymentStatus {
    /// Terminal statuses are sticky: the completion summary never
    /// rewrites a deployment that has reached one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Completed | DeploymentStatus::Failed | DeploymentStatus::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Provisioning => "provisioning",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Terminating => "terminating",
            DeploymentStatus::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a node within a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Provisioning,
    Booting,
    Registering,
    DownloadingAssets,
    Running,
    Completed,
    Failed,
    Terminating,
    Terminated,
}

impl NodeStatus {
    /// Once a node reaches a terminal status no later update changes it.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Provisioning => "provisioning",
            NodeStatus::Booting => "booting",
            NodeStatus::Registering => "registering",
            NodeStatus::DownloadingAssets => "downloading_assets",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Terminating => "terminating",
            NodeStatus::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NodeStatus::Pending),
            "provisioning" => Ok(NodeStatus::Provisioning),
            "booting" => Ok(NodeStatus::Booting),
            "registering" => Ok(NodeStatus::Registering),
            "downloading_assets" => Ok(NodeStatus::DownloadingAssets),
            "running" => Ok(NodeStatus::Running),
            "completed" => Ok(NodeStatus::Completed),
            "failed" => Ok(NodeStatus::Failed),
            "terminating" => Ok(NodeStatus::Terminating),
            "terminated" => Ok(NodeStatus::Terminated),
            _ => Err(()),
        }
    }
}

// ── Metrics and logs ───────────────────────────────────────────────

/// System resource metrics reported by a node agent, overwritten on each
/// heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_cores: u32,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    /// Bytes.
    pub memory_total: u64,
    /// Bytes.
    pub memory_used: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Which output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A single log line pushed by a node agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default)]
    pub node_id: String,
    pub stream: LogStream,
    pub message: String,
}

// ── Node ───────────────────────────────────────────────────────────

/// A single worker within a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_index: u32,
    pub deployment_id: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Materialised per-node configuration.
    pub config: BTreeMap<String, ConfigValue>,
    /// One-time bearer consumed at registration; cleared once the auth
    /// token is issued.
    #[serde(default)]
    pub provision_token: String,
    /// Long-lived bearer issued at registration; empty until then.
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub should_shutdown: bool,
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SystemMetrics>,
}

impl Node {
    /// Create a node in `pending` for the given deployment slot.
    pub fn new(
        deployment_id: &str,
        node_id: &str,
        node_index: u32,
        config: BTreeMap<String, ConfigValue>,
        provision_token: String,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_index,
            deployment_id: deployment_id.to_string(),
            status: NodeStatus::Pending,
            instance_id: None,
            ip_address: None,
            config,
            provision_token,
            auth_token: String::new(),
            should_shutdown: false,
            last_update: Utc::now(),
            error_message: None,
            metrics: None,
        }
    }
}

// ── Deployment ─────────────────────────────────────────────────────

/// The descriptor fields the controller keeps with a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Backend-specific instance settings, keyed by backend name.
    #[serde(default)]
    pub instance_config: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub remote_dest_dir: String,
    #[serde(default)]
    pub remote_script_to_run: String,
}

/// A single submission: one bundle, one fleet of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    #[serde(rename = "deployment_id")]
    pub id: String,
    pub status: DeploymentStatus,
    pub backend_name: String,
    pub total_nodes: u32,
    #[serde(default)]
    pub nodes_completed: u32,
    #[serde(default)]
    pub nodes_failed: u32,
    /// Path to the worker bundle served to agents.
    pub bundle_path: PathBuf,
    pub config: DeploymentConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Deployment {
    /// Create a deployment in `pending`.
    pub fn new(
        id: &str,
        backend_name: &str,
        total_nodes: u32,
        bundle_path: PathBuf,
        config: DeploymentConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            status: DeploymentStatus::Pending,
            backend_name: backend_name.to_string(),
            total_nodes,
            nodes_completed: 0,
            nodes_failed: 0,
            bundle_path,
            config,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
        }
    }
}
