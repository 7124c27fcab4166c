//! Tagged value type for node configuration entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A dynamically typed configuration value.
///
/// Untagged, so descriptor YAML and wire JSON both deserialize into the
/// natural variant. Variant order matters: `Bool` and `Int` must be tried
/// before `Float` and `String` so scalars keep their narrowest type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    /// Whether this value is a scalar (legal as a distributed-list element).
    pub fn is_primitive(&self) -> bool {
        !matches!(self, ConfigValue::List(_) | ConfigValue::Map(_))
    }

    /// Textual form used when the value is spliced into a template string
    /// or exported as an environment variable. Lists and maps render as
    /// JSON.
    pub fn render(&self) -> String {
        match self {
            ConfigValue::Bool(b) => b.to_string(),
            ConfigValue::Int(i) => i.to_string(),
            ConfigValue::Float(f) => f.to_string(),
            ConfigValue::String(s) => s.clone(),
            ConfigValue::List(_) | ConfigValue::Map(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::String(s.to_string())
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        ConfigValue::Int(i)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_json_round_trip_keeps_types() {
        let json = r#"{"a": 1, "b": 1.5, "c": true, "d": "x", "e": [1, 2]}"#;
        let map: BTreeMap<String, ConfigValue> = serde_json::from_str(json).unwrap();
        assert_eq!(map["a"], ConfigValue::Int(1));
        assert_eq!(map["b"], ConfigValue::Float(1.5));
        assert_eq!(map["c"], ConfigValue::Bool(true));
        assert_eq!(map["d"], ConfigValue::String("x".to_string()));
        assert_eq!(
            map["e"],
            ConfigValue::List(vec![ConfigValue::Int(1), ConfigValue::Int(2)])
        );
    }

    #[test]
    fn render_scalars() {
        assert_eq!(ConfigValue::Int(42).render(), "42");
        assert_eq!(ConfigValue::Float(0.5).render(), "0.5");
        assert_eq!(ConfigValue::Bool(true).render(), "true");
        assert_eq!(ConfigValue::from("plain").render(), "plain");
    }

    #[test]
    fn render_list_as_json() {
        let v = ConfigValue::List(vec![ConfigValue::Int(1), ConfigValue::from("x")]);
        assert_eq!(v.render(), r#"[1,"x"]"#);
    }
}
