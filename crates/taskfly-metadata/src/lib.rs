//! taskfly-metadata — per-node configuration materialisation.
//!
//! A deployment descriptor carries one `nodes` block; this crate expands
//! it into one [`NodeConfig`] per node: global metadata is copied to every
//! node, distributed lists are partitioned across nodes by stride, and
//! template values have their `{placeholder}` tokens substituted with
//! node-specific values.

mod value;

pub use value::ConfigValue;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for materialisation.
pub type MetadataResult<T> = Result<T, MetadataError>;

/// Errors raised while validating or expanding a nodes block.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("nodes count must be greater than zero")]
    InvalidCount,

    #[error("distributed list '{0}' cannot be empty")]
    EmptyList(String),

    #[error("distributed list '{list}' contains a non-primitive element")]
    UnsupportedListElementType { list: String },
}

/// The `nodes` block of a deployment descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodesBlock {
    pub count: u32,
    #[serde(default)]
    pub global_metadata: BTreeMap<String, ConfigValue>,
    #[serde(default)]
    pub distributed_lists: BTreeMap<String, Vec<ConfigValue>>,
    #[serde(default)]
    pub config_template: BTreeMap<String, ConfigValue>,
}

/// Materialised configuration for a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub node_index: u32,
    pub total_nodes: u32,
    pub deployment_id: String,
    pub config: BTreeMap<String, ConfigValue>,
}

/// Validate a nodes block without expanding it.
pub fn validate(block: &NodesBlock) -> MetadataResult<()> {
    if block.count == 0 {
        return Err(MetadataError::InvalidCount);
    }
    for (name, items) in &block.distributed_lists {
        if items.is_empty() {
            return Err(MetadataError::EmptyList(name.clone()));
        }
        if items.iter().any(|v| !v.is_primitive()) {
            return Err(MetadataError::UnsupportedListElementType { list: name.clone() });
        }
    }
    Ok(())
}

/// Expand a nodes block into exactly `count` node configurations.
///
/// Deterministic: the same block and deployment id always produce the
/// same configs. Template values are substituted against the config as it
/// stands after global metadata and distributed lists are applied, so one
/// template entry never observes another's output.
pub fn materialize(block: &NodesBlock, deployment_id: &str) -> MetadataResult<Vec<NodeConfig>> {
    validate(block)?;

    let count = block.count as usize;
    let mut configs = Vec::with_capacity(count);

    for index in 0..count {
        let node_id = format!("{deployment_id}_node_{index}");
        let mut config = block.global_metadata.clone();

        // Node `index` takes list positions index, index+count, index+2*count, ...
        for (name, items) in &block.distributed_lists {
            let picked: Vec<ConfigValue> =
                items.iter().skip(index).step_by(count).cloned().collect();
            if !picked.is_empty() {
                config.insert(name.clone(), ConfigValue::List(picked));
            }
        }

        let snapshot = config.clone();
        let ctx = TemplateContext {
            node_id: &node_id,
            node_index: index as u32,
            total_nodes: block.count,
            deployment_id,
            config: &snapshot,
        };
        for (key, value) in &block.config_template {
            config.insert(key.clone(), substitute(value, &ctx));
        }

        configs.push(NodeConfig {
            node_id,
            node_index: index as u32,
            total_nodes: block.count,
            deployment_id: deployment_id.to_string(),
            config,
        });
    }

    Ok(configs)
}

struct TemplateContext<'a> {
    node_id: &'a str,
    node_index: u32,
    total_nodes: u32,
    deployment_id: &'a str,
    config: &'a BTreeMap<String, ConfigValue>,
}

impl TemplateContext<'_> {
    /// Raw (typed) value for a placeholder name, if one exists.
    fn lookup(&self, key: &str) -> Option<ConfigValue> {
        match key {
            "node_id" => Some(ConfigValue::String(self.node_id.to_string())),
            "node_index" => Some(ConfigValue::Int(i64::from(self.node_index))),
            "total_nodes" => Some(ConfigValue::Int(i64::from(self.total_nodes))),
            "deployment_id" => Some(ConfigValue::String(self.deployment_id.to_string())),
            _ => self.config.get(key).cloned(),
        }
    }
}

/// Substitute placeholders in a template value, recursing into maps and
/// sequences. Non-string leaves are copied as-is.
fn substitute(value: &ConfigValue, ctx: &TemplateContext<'_>) -> ConfigValue {
    match value {
        ConfigValue::String(s) => substitute_string(s, ctx),
        ConfigValue::List(items) => {
            ConfigValue::List(items.iter().map(|v| substitute(v, ctx)).collect())
        }
        ConfigValue::Map(entries) => ConfigValue::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_string(template: &str, ctx: &TemplateContext<'_>) -> ConfigValue {
    // A template that is exactly one placeholder substitutes the raw
    // value, preserving its type.
    if let Some(key) = template
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
    {
        if !key.contains(['{', '}']) {
            if let Some(value) = ctx.lookup(key) {
                return value;
            }
        }
    }

    let mut result = template
        .replace("{node_id}", ctx.node_id)
        .replace("{node_index}", &ctx.node_index.to_string())
        .replace("{total_nodes}", &ctx.total_nodes.to_string())
        .replace("{deployment_id}", ctx.deployment_id);
    for (key, value) in ctx.config {
        result = result.replace(&format!("{{{key}}}"), &value.render());
    }
    ConfigValue::String(result)
}
