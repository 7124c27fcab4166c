//! Compute backend capability.
//!
//! A backend knows how to create, query, and destroy one compute
//! instance and how to get the agent running on it with the provision
//! token and callback URL it is handed. Adapters for real infrastructure
//! (cloud APIs, SSH fleets) live outside the core; the controller only
//! depends on this trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use taskfly_metadata::ConfigValue;
use thiserror::Error;

/// Errors a backend can report.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("status query failed: {0}")]
    Status(String),

    #[error("termination failed: {0}")]
    Terminate(String),
}

/// Everything a backend needs to stand up one worker.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub node_index: u32,
    /// One-time bearer the agent presents at registration.
    pub provision_token: String,
    /// Base URL the agent calls back to.
    pub callback_url: String,
    /// Materialised per-node configuration.
    pub node_config: BTreeMap<String, ConfigValue>,
    /// The backend's own section of the descriptor's `instance_config`.
    pub instance_config: serde_json::Value,
}

/// Identity of a provisioned instance.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub ip_address: String,
    pub status: String,
}

/// A pluggable compute backend. Implementations must be safe to call
/// concurrently; retries are the backend's own business.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Create an instance and start the agent on it.
    async fn provision(&self, request: InstanceRequest) -> Result<InstanceInfo, BackendError>;

    /// Current status of an instance ("running", "stopped", ...).
    async fn status(&self, instance_id: &str) -> Result<String, BackendError>;

    /// Destroy an instance.
    async fn terminate(&self, instance_id: &str) -> Result<(), BackendError>;

    /// Backend name as referenced by descriptors.
    fn name(&self) -> &str;

    /// Whether provisioning also starts the agent in-process. Nodes of
    /// such backends skip the boot wait and move straight to
    /// registration.
    fn starts_agent_inline(&self) -> bool {
        false
    }
}

/// In-process backend for development and tests. "Provisioning" only
/// fabricates an instance identity; the agent is expected to be run by
/// the harness (or not at all). Instances are considered running the
/// moment they exist.
#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }

    /// Pick the node's address from the backend config: `hosts[index]`
    /// if present, then `host`, falling back to loopback.
    fn address_for(&self, request: &InstanceRequest) -> String {
        let config = &request.instance_config;
        if let Some(host) = config
            .get("hosts")
            .and_then(|hosts| hosts.get(request.node_index as usize))
            .and_then(|h| h.as_str())
        {
            return host.to_string();
        }
        if let Some(host) = config.get("host").and_then(|h| h.as_str()) {
            return host.to_string();
        }
        "127.0.0.1".to_string()
    }
}

#[async_trait]
impl ComputeBackend for LocalBackend {
    async fn provision(&self, request: InstanceRequest) -> Result<InstanceInfo, BackendError> {
        let suffix: [u8; 4] = rand::random();
        Ok(InstanceInfo {
            instance_id: format!("local-{}-{}", request.node_index, hex::encode(suffix)),
            ip_address: self.address_for(&request),
            status: "running".to_string(),
        })
    }

    async fn status(&self, _instance_id: &str) -> Result<String, BackendError> {
        Ok("running".to_string())
    }

    async fn terminate(&self, _instance_id: &str) -> Result<(), BackendError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "local"
    }

    fn starts_agent_inline(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(index: u32, instance_config: serde_json::Value) -> InstanceRequest {
        InstanceRequest {
            node_index: index,
            provision_token: "pt_test".to_string(),
            callback_url: "http://localhost:8080".to_string(),
            node_config: BTreeMap::new(),
            instance_config,
        }
    }

    #[tokio::test]
    async fn local_backend_fabricates_instances() {
        let backend = LocalBackend::new();
        let info = backend.provision(request(2, serde_json::Value::Null)).await.unwrap();
        assert!(info.instance_id.starts_with("local-2-"));
        assert_eq!(info.ip_address, "127.0.0.1");
        assert_eq!(info.status, "running");
        assert_eq!(backend.status(&info.instance_id).await.unwrap(), "running");
    }

    #[tokio::test]
    async fn local_backend_uses_configured_hosts() {
        let backend = LocalBackend::new();
        let config = serde_json::json!({"hosts": ["10.0.0.1", "10.0.0.2"]});
        let info = backend.provision(request(1, config)).await.unwrap();
        assert_eq!(info.ip_address, "10.0.0.2");

        let single = serde_json::json!({"host": "192.168.1.9"});
        let info = backend.provision(request(5, single)).await.unwrap();
        assert_eq!(info.ip_address, "192.168.1.9");
    }
}
