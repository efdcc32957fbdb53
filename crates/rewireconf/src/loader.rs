//! Config file discovery, loading, and environment variable overlay.

use crate::entries::EntryError;
use crate::{ClientConfig, ConfigError, ConnectionConfig, DaemonConfig, RewireConfig};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

/// A config entry that was skipped, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedEntry {
    pub path: PathBuf,
    /// `clients`, `connections`, or `daemon.<field>`
    pub section: String,
    /// Position in the list, for list sections
    pub index: Option<usize>,
    pub reason: String,
}

impl fmt::Display for RejectedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(
                f,
                "{}: {}[{}]: {}",
                self.path.display(),
                self.section,
                index,
                self.reason
            ),
            None => write!(f, "{}: {}: {}", self.path.display(), self.section, self.reason),
        }
    }
}

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
    /// Entries that failed validation and were left out
    pub rejected: Vec<RejectedEntry>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/rewire/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("rewire/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("rewire.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file and overlay it onto `config`.
pub fn load_file_into(
    config: &mut RewireConfig,
    path: &Path,
    sources: &mut ConfigSources,
) -> Result<(), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml_into(config, &contents, path, sources)
}

/// Parse a TOML document and overlay it onto `config`.
///
/// Only a document that is not valid TOML at all is an error. Anything
/// wrong inside a section is recorded in `sources.rejected` instead.
pub fn parse_toml_into(
    config: &mut RewireConfig,
    contents: &str,
    path: &Path,
    sources: &mut ConfigSources,
) -> Result<(), ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if let Some(daemon) = table.get("daemon") {
        match daemon.as_table() {
            Some(daemon) => apply_daemon_table(&mut config.daemon, daemon, path, sources),
            None => sources.rejected.push(RejectedEntry {
                path: path.to_path_buf(),
                section: "daemon".to_string(),
                index: None,
                reason: "expected a table".to_string(),
            }),
        }
    }

    if let Some(clients) = table.get("clients") {
        config.clients = parse_list(clients, "clients", path, sources, ClientConfig::validate);
    }

    if let Some(connections) = table.get("connections") {
        config.connections =
            parse_list(connections, "connections", path, sources, ConnectionConfig::validate);
    }

    Ok(())
}

/// Deserialize every element of a TOML array on its own, keeping the valid ones.
fn parse_list<T, F>(
    value: &toml::Value,
    section: &str,
    path: &Path,
    sources: &mut ConfigSources,
    validate: F,
) -> Vec<T>
where
    T: serde::de::DeserializeOwned,
    F: Fn(&T) -> Result<(), EntryError>,
{
    let Some(items) = value.as_array() else {
        sources.rejected.push(RejectedEntry {
            path: path.to_path_buf(),
            section: section.to_string(),
            index: None,
            reason: "expected an array of tables".to_string(),
        });
        return Vec::new();
    };

    let mut parsed = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let entry = T::deserialize(item.clone())
            .map_err(|e| EntryError::Malformed(e.to_string()))
            .and_then(|entry| validate(&entry).map(|()| entry));

        match entry {
            Ok(entry) => parsed.push(entry),
            Err(e) => sources.rejected.push(RejectedEntry {
                path: path.to_path_buf(),
                section: section.to_string(),
                index: Some(index),
                reason: e.to_string(),
            }),
        }
    }
    parsed
}

fn apply_daemon_table(
    daemon: &mut DaemonConfig,
    table: &toml::Table,
    path: &Path,
    sources: &mut ConfigSources,
) {
    let mut reject = |field: &str, reason: &str| {
        sources.rejected.push(RejectedEntry {
            path: path.to_path_buf(),
            section: format!("daemon.{field}"),
            index: None,
            reason: reason.to_string(),
        });
    };

    if let Some(v) = table.get("http_port") {
        match v.as_integer().and_then(|port| u16::try_from(port).ok()) {
            Some(port) => daemon.http_port = port,
            None => reject("http_port", "expected a port number"),
        }
    }
    if let Some(v) = table.get("log_level") {
        match v.as_str() {
            Some(level) => daemon.log_level = level.to_string(),
            None => reject("log_level", "expected a string"),
        }
    }
    if let Some(v) = table.get("client_prefix") {
        match v.as_str() {
            Some(prefix) => daemon.client_prefix = prefix.to_string(),
            None => reject("client_prefix", "expected a string"),
        }
    }
    if let Some(v) = table.get("port_prefix") {
        match v.as_str() {
            Some(prefix) => daemon.port_prefix = prefix.to_string(),
            None => reject("port_prefix", "expected a string"),
        }
    }
    if let Some(v) = table.get("reconnect_interval_ms") {
        match v.as_integer().and_then(|ms| u64::try_from(ms).ok()).filter(|ms| *ms > 0) {
            Some(ms) => daemon.reconnect_interval_ms = ms,
            None => reject("reconnect_interval_ms", "expected a positive integer"),
        }
    }
    if let Some(v) = table.get("retry_interval_ms") {
        match v.as_integer().and_then(|ms| u64::try_from(ms).ok()).filter(|ms| *ms > 0) {
            Some(ms) => daemon.retry_interval_ms = ms,
            None => reject("retry_interval_ms", "expected a positive integer"),
        }
    }
    if let Some(v) = table.get("smoothing") {
        match v.as_bool() {
            Some(smoothing) => daemon.smoothing = smoothing,
            None => reject("smoothing", "expected a boolean"),
        }
    }
    if let Some(v) = table.get("lock_memory") {
        match v.as_bool() {
            Some(lock) => daemon.lock_memory = lock,
            None => reject("lock_memory", "expected a boolean"),
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut RewireConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("REWIRE_HTTP_PORT") {
        if let Ok(port) = v.parse() {
            config.daemon.http_port = port;
            sources.env_overrides.push("REWIRE_HTTP_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("REWIRE_CLIENT_PREFIX") {
        config.daemon.client_prefix = v;
        sources.env_overrides.push("REWIRE_CLIENT_PREFIX".to_string());
    }
    if let Ok(v) = env::var("REWIRE_PORT_PREFIX") {
        config.daemon.port_prefix = v;
        sources.env_overrides.push("REWIRE_PORT_PREFIX".to_string());
    }
    if let Ok(v) = env::var("REWIRE_RECONNECT_INTERVAL_MS") {
        if let Ok(ms) = v.parse::<u64>() {
            if ms > 0 {
                config.daemon.reconnect_interval_ms = ms;
                sources.env_overrides.push("REWIRE_RECONNECT_INTERVAL_MS".to_string());
            }
        }
    }
    if let Ok(v) = env::var("REWIRE_LOG_LEVEL") {
        config.daemon.log_level = v;
        sources.env_overrides.push("REWIRE_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.daemon.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(toml: &str) -> (RewireConfig, ConfigSources) {
        let mut config = RewireConfig::default();
        let mut sources = ConfigSources::default();
        parse_toml_into(&mut config, toml, Path::new("test.toml"), &mut sources).unwrap();
        (config, sources)
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        let expanded = expand_path("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let (config, sources) = parse("[daemon]\nhttp_port = 9000\n");
        assert_eq!(config.daemon.http_port, 9000);
        assert_eq!(config.daemon.client_prefix, "rewire_");
        assert!(sources.rejected.is_empty());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[daemon]
http_port = 8123
log_level = "debug"
client_prefix = "fx_"
port_prefix = "p_"
reconnect_interval_ms = 5000
retry_interval_ms = 50
smoothing = false

[[clients]]
name = "delay"
plugin = { label = "delay", unique_id = 1002 }
instances = 2
pregain = 0.5
controls = [{ name = "Delay (ms)", value = 12.5 }]

[[clients]]
name = "amp"
plugin = { label = "amp", unique_id = 1001 }

[[connections]]
out = "^system:capture_1$"
in = "^fx_delay:p_Input_1$"
in_disconnect = true
"#;
        let (config, sources) = parse(toml);
        assert!(sources.rejected.is_empty(), "{:?}", sources.rejected);

        assert_eq!(config.daemon.http_port, 8123);
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.client_prefix, "fx_");
        assert_eq!(config.daemon.port_prefix, "p_");
        assert_eq!(config.daemon.reconnect_interval_ms, 5000);
        assert_eq!(config.daemon.retry_interval_ms, 50);
        assert!(!config.daemon.smoothing);

        assert_eq!(config.clients.len(), 2);
        assert_eq!(config.clients[0].instances, 2);
        assert_eq!(config.clients[0].pregain, 0.5);
        assert_eq!(config.clients[0].postgain, 1.0);
        assert_eq!(config.clients[0].controls[0].value, 12.5);
        assert_eq!(config.clients[1].plugin.unique_id, 1001);

        assert_eq!(config.connections.len(), 1);
        assert!(config.connections[0].in_disconnect);
    }

    #[test]
    fn test_malformed_entries_skipped_individually() {
        let toml = r#"
[[clients]]
name = "ok"
plugin = { label = "amp", unique_id = 1001 }

[[clients]]
name = "no_plugin"

[[clients]]
name = "zero"
plugin = { label = "amp", unique_id = 1001 }
instances = 0

[[clients]]
name = "also_ok"
plugin = { label = "delay", unique_id = 1002 }
"#;
        let (config, sources) = parse(toml);
        let names: Vec<_> = config.clients.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ok", "also_ok"]);
        let indexes: Vec<_> = sources.rejected.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_bad_daemon_field_keeps_previous_value() {
        let (config, sources) = parse("[daemon]\nhttp_port = 70000\nsmoothing = \"yes\"\n");
        assert_eq!(config.daemon.http_port, 8080);
        assert!(config.daemon.smoothing);
        let sections: Vec<_> = sources.rejected.iter().map(|r| r.section.as_str()).collect();
        assert_eq!(sections, vec!["daemon.http_port", "daemon.smoothing"]);
    }

    #[test]
    fn test_later_file_replaces_lists_and_overlays_fields() {
        let mut config = RewireConfig::default();
        let mut sources = ConfigSources::default();

        let mut first = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            first,
            "[daemon]\nhttp_port = 9001\n\n[[connections]]\nout = \"a:.*\"\nin = \"b:.*\""
        )
        .unwrap();
        let mut second = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            second,
            "[daemon]\nclient_prefix = \"x_\"\n\n[[connections]]\nout = \"c:.*\"\nin = \"d:.*\""
        )
        .unwrap();

        load_file_into(&mut config, first.path(), &mut sources).unwrap();
        load_file_into(&mut config, second.path(), &mut sources).unwrap();

        assert_eq!(config.daemon.http_port, 9001);
        assert_eq!(config.daemon.client_prefix, "x_");
        assert_eq!(config.connections, vec![ConnectionConfig::new("c:.*", "d:.*")]);
    }

    #[test]
    fn test_unparseable_file_is_an_error() {
        let mut config = RewireConfig::default();
        let mut sources = ConfigSources::default();
        let err = parse_toml_into(&mut config, "[daemon", Path::new("bad.toml"), &mut sources)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let mut config = RewireConfig::default();
        let mut sources = ConfigSources::default();
        let err = load_file_into(&mut config, Path::new("/nonexistent/rewire.toml"), &mut sources)
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }
}
