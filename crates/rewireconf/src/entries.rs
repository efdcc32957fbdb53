//! List entries: hosted clients and routing rules.
//!
//! Both are also accepted over the status server as JSON, so the serde
//! shape here is the wire shape there.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Why a single list entry was refused.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EntryError {
    #[error("malformed entry: {0}")]
    Malformed(String),

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("client {client}: instances must be at least 1")]
    NoInstances { client: String },

    #[error("client {client}: {field} is not a finite number")]
    NotFinite { client: String, field: String },

    #[error("client {client}: control \"{control}\" is set more than once")]
    DuplicateControl { client: String, control: String },
}

/// Which plugin a client hosts. Both parts must match a catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PluginRef {
    pub label: String,
    pub unique_id: u64,
}

/// One named control input and its value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlSetting {
    pub name: String,
    pub value: f64,
}

/// A hosted plugin client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub name: String,

    pub plugin: PluginRef,

    /// Number of plugin instances run side by side in one client.
    #[serde(default = "ClientConfig::default_instances")]
    pub instances: usize,

    /// Linear gain applied to every input before the plugin runs.
    #[serde(default = "ClientConfig::default_gain")]
    pub pregain: f64,

    /// Linear gain applied to every output after the plugin runs.
    #[serde(default = "ClientConfig::default_gain")]
    pub postgain: f64,

    #[serde(default)]
    pub controls: Vec<ControlSetting>,
}

impl ClientConfig {
    fn default_instances() -> usize {
        1
    }

    fn default_gain() -> f64 {
        1.0
    }

    /// Check everything that can be checked without the plugin catalog.
    pub fn validate(&self) -> Result<(), EntryError> {
        if self.name.is_empty() {
            return Err(EntryError::Empty { field: "name" });
        }
        if self.plugin.label.is_empty() {
            return Err(EntryError::Empty { field: "plugin.label" });
        }
        if self.instances == 0 {
            return Err(EntryError::NoInstances {
                client: self.name.clone(),
            });
        }

        for (field, value) in [("pregain", self.pregain), ("postgain", self.postgain)] {
            if !value.is_finite() {
                return Err(EntryError::NotFinite {
                    client: self.name.clone(),
                    field: field.to_string(),
                });
            }
        }

        let mut seen = HashSet::new();
        for control in &self.controls {
            if !seen.insert(control.name.as_str()) {
                return Err(EntryError::DuplicateControl {
                    client: self.name.clone(),
                    control: control.name.clone(),
                });
            }
            if !control.value.is_finite() {
                return Err(EntryError::NotFinite {
                    client: self.name.clone(),
                    field: control.name.clone(),
                });
            }
        }

        Ok(())
    }
}

/// A routing rule.
///
/// `out` and `in` are regular expressions matched against full port names
/// such as `system:capture_1`. The disconnect flags remove connections where
/// only that side matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnectionConfig {
    #[serde(rename = "out")]
    pub output: String,

    #[serde(rename = "in")]
    pub input: String,

    #[serde(default)]
    pub out_disconnect: bool,

    #[serde(default)]
    pub in_disconnect: bool,
}

impl ConnectionConfig {
    pub fn new(output: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            input: input.into(),
            out_disconnect: false,
            in_disconnect: false,
        }
    }

    pub fn validate(&self) -> Result<(), EntryError> {
        if self.output.is_empty() {
            return Err(EntryError::Empty { field: "out" });
        }
        if self.input.is_empty() {
            return Err(EntryError::Empty { field: "in" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str) -> ClientConfig {
        ClientConfig {
            name: name.to_string(),
            plugin: PluginRef {
                label: "amp".to_string(),
                unique_id: 1001,
            },
            instances: 1,
            pregain: 1.0,
            postgain: 1.0,
            controls: vec![],
        }
    }

    #[test]
    fn test_client_defaults() {
        let parsed: ClientConfig =
            toml::from_str("name = \"a\"\nplugin = { label = \"amp\", unique_id = 1001 }").unwrap();
        assert_eq!(parsed, client("a"));
    }

    #[test]
    fn test_zero_instances_rejected() {
        let mut config = client("a");
        config.instances = 0;
        assert_eq!(
            config.validate(),
            Err(EntryError::NoInstances { client: "a".into() })
        );
    }

    #[test]
    fn test_duplicate_control_rejected() {
        let mut config = client("a");
        config.controls = vec![
            ControlSetting { name: "Gain (dB)".into(), value: 1.0 },
            ControlSetting { name: "Gain (dB)".into(), value: 2.0 },
        ];
        assert!(matches!(
            config.validate(),
            Err(EntryError::DuplicateControl { .. })
        ));
    }

    #[test]
    fn test_nan_gain_rejected() {
        let mut config = client("a");
        config.postgain = f64::NAN;
        assert!(matches!(config.validate(), Err(EntryError::NotFinite { .. })));
    }

    #[test]
    fn test_connection_wire_names() {
        let parsed: ConnectionConfig =
            toml::from_str("out = \"a:x\"\nin = \"b:y\"\nin_disconnect = true").unwrap();
        assert_eq!(parsed.output, "a:x");
        assert_eq!(parsed.input, "b:y");
        assert!(parsed.in_disconnect);
        assert!(!parsed.out_disconnect);
    }
}
