//! Daemon configuration - process settings fixed for the lifetime of a run.

use serde::{Deserialize, Serialize};

/// Settings for the rewire process itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Port for the JSON status server.
    /// Default: 8080
    #[serde(default = "DaemonConfig::default_http_port")]
    pub http_port: u16,

    /// Tracing filter directive (e.g. "info", "rewire=debug").
    /// Default: info
    #[serde(default = "DaemonConfig::default_log_level")]
    pub log_level: String,

    /// Prepended to every hosted client name before it is handed to JACK.
    /// Default: rewire_
    #[serde(default = "DaemonConfig::default_client_prefix")]
    pub client_prefix: String,

    /// Prepended to every registered port name.
    /// Default: empty
    #[serde(default)]
    pub port_prefix: String,

    /// How long to wait between attempts to reach an unreachable server,
    /// and the upper bound of the retry backoff.
    /// Default: 10000
    #[serde(default = "DaemonConfig::default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// First retry delay for unresolved port checks. Doubles per attempt.
    /// Default: 100
    #[serde(default = "DaemonConfig::default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Ramp gain and control changes instead of jumping.
    /// Default: true
    #[serde(default = "DaemonConfig::default_smoothing")]
    pub smoothing: bool,

    /// Lock all current and future pages into RAM at startup.
    /// Default: false
    #[serde(default)]
    pub lock_memory: bool,
}

impl DaemonConfig {
    fn default_http_port() -> u16 {
        8080
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_client_prefix() -> String {
        "rewire_".to_string()
    }

    fn default_reconnect_interval_ms() -> u64 {
        10_000
    }

    fn default_retry_interval_ms() -> u64 {
        100
    }

    fn default_smoothing() -> bool {
        true
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_port: Self::default_http_port(),
            log_level: Self::default_log_level(),
            client_prefix: Self::default_client_prefix(),
            port_prefix: String::new(),
            reconnect_interval_ms: Self::default_reconnect_interval_ms(),
            retry_interval_ms: Self::default_retry_interval_ms(),
            smoothing: Self::default_smoothing(),
            lock_memory: false,
        }
    }
}
