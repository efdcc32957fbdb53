//! Minimal configuration loading for rewire.
//!
//! The daemon reads one merged view of every config file it can find. The
//! file has three parts:
//!
//! - **Daemon** (`DaemonConfig`): process settings such as the status port,
//!   log level, name prefixes and retry intervals.
//! - **Clients** (`ClientConfig`): the plugin hosts to run, one JACK client
//!   each.
//! - **Connections** (`ConnectionConfig`): routing rules as pairs of port
//!   name patterns.
//!
//! Entries in the `clients` and `connections` lists are validated one at a
//! time. A bad entry is recorded in [`ConfigSources::rejected`] and skipped,
//! so one typo never takes the whole routing table down.
//!
//! # Usage
//!
//! ```rust,no_run
//! use rewireconf::RewireConfig;
//!
//! let (config, sources) = RewireConfig::load_with_sources_from(None).expect("config");
//!
//! println!("status port: {}", config.daemon.http_port);
//! for client in &config.clients {
//!     println!("client {} runs plugin {}", client.name, client.plugin.label);
//! }
//! for rejected in &sources.rejected {
//!     eprintln!("skipped {rejected}");
//! }
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/rewire/config.toml` (system)
//! 2. `~/.config/rewire/config.toml` (user)
//! 3. `./rewire.toml` (local override) or the path given on the command line
//! 4. Environment variables (`REWIRE_*`)
//!
//! Daemon fields overlay one by one. A file that defines `clients` or
//! `connections` replaces the whole list.
//!
//! # Example Config
//!
//! ```toml
//! [daemon]
//! http_port = 8080
//! client_prefix = "rewire_"
//! reconnect_interval_ms = 10000
//!
//! [[clients]]
//! name = "delay"
//! plugin = { label = "delay", unique_id = 1002 }
//! instances = 2
//! controls = [{ name = "Delay (ms)", value = 12.5 }]
//!
//! [[connections]]
//! out = "system:capture_1"
//! in = "rewire_delay:Input_1"
//! in_disconnect = true
//! ```

pub mod daemon;
pub mod entries;
pub mod loader;

pub use daemon::DaemonConfig;
pub use entries::{ClientConfig, ConnectionConfig, ControlSetting, EntryError, PluginRef};
pub use loader::{discover_config_files_with_override, expand_path, ConfigSources, RejectedEntry};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete rewire configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RewireConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub clients: Vec<ClientConfig>,

    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl RewireConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, with `config_path` taking the place of `./rewire.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report where every value came from.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/rewire/config.toml`
    /// 3. `~/.config/rewire/config.toml`
    /// 4. `config_path`, or `./rewire.toml` when no path is given
    /// 5. Environment variables
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = RewireConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            loader::load_file_into(&mut config, &path, &mut sources)?;
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Parse a single TOML document on top of the defaults.
    ///
    /// No discovery and no environment overlay. Used by tests and by tools
    /// that validate a file before installing it.
    pub fn from_toml_str(contents: &str) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = RewireConfig::default();
        loader::parse_toml_into(&mut config, contents, Path::new("<inline>"), &mut sources)?;
        Ok((config, sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RewireConfig::default();
        assert_eq!(config.daemon.http_port, 8080);
        assert_eq!(config.daemon.reconnect_interval_ms, 10_000);
        assert!(config.clients.is_empty());
        assert!(config.connections.is_empty());
    }

    #[test]
    fn test_from_toml_str_reports_rejections() {
        let toml = r#"
[[connections]]
out = "system:capture_1"
in = "rewire_amp:Input"

[[connections]]
out = "system:capture_2"
"#;
        let (config, sources) = RewireConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.connections.len(), 1);
        assert_eq!(sources.rejected.len(), 1);
        assert_eq!(sources.rejected[0].section, "connections");
        assert_eq!(sources.rejected[0].index, Some(1));
    }

    #[test]
    fn test_load_from_missing_override() {
        // A missing override path falls back to discovery and must not fail
        let result = RewireConfig::load_from(Some(Path::new("/nonexistent/rewire.toml")));
        assert!(result.is_ok());
    }
}
