//! The deployment descriptor (`taskfly.yml`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use taskfly_metadata::NodesBlock;

/// Parsed deployment descriptor.
///
/// `instance_config` stays backend-shaped: each backend interprets its
/// own section, the controller only routes it through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub cloud_provider: String,
    #[serde(default)]
    pub instance_config: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub application_files: Vec<String>,
    #[serde(default)]
    pub remote_dest_dir: String,
    #[serde(default)]
    pub remote_script_to_run: String,
    #[serde(default)]
    pub bundle_name: String,
    pub nodes: NodesBlock,
}
