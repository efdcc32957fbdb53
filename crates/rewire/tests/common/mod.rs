//! Shared fixtures for rewire integration tests

#![allow(dead_code)]

use std::sync::Arc;

use rewire::{
    AudioClient, MemoryServer, PluginCatalog, PortDirection, RuntimeContext, Scheduler,
};
use rewireconf::{ClientConfig, PluginRef, RewireConfig};

pub const AMP_ID: u64 = rewire::builtin::AMP_ID;

/// An in-memory server with two capture and two playback ports.
pub fn server() -> MemoryServer {
    let server = MemoryServer::new(48_000, 64);
    server.add_port("system:capture_1", PortDirection::Output);
    server.add_port("system:capture_2", PortDirection::Output);
    server.add_port("system:playback_1", PortDirection::Input);
    server.add_port("system:playback_2", PortDirection::Input);
    server
}

pub fn amp(name: &str) -> ClientConfig {
    ClientConfig {
        name: name.to_string(),
        plugin: PluginRef {
            label: "amp".to_string(),
            unique_id: AMP_ID,
        },
        instances: 1,
        pregain: 1.0,
        postgain: 1.0,
        controls: Vec::new(),
    }
}

pub fn client(name: &str) -> AudioClient {
    AudioClient::new(amp(name), &PluginCatalog::builtin()).unwrap()
}

/// Parse a config document, failing the test on any rejected entry.
pub fn config(toml: &str) -> RewireConfig {
    let (config, sources) = RewireConfig::from_toml_str(toml).unwrap();
    assert!(sources.rejected.is_empty(), "rejected: {:?}", sources.rejected);
    config
}

pub fn context(config: &RewireConfig) -> Arc<RuntimeContext> {
    Arc::new(RuntimeContext::new(&config.daemon, false))
}

/// A scheduler over a clone of `server`, status server on an ephemeral port.
pub fn scheduler(server: &MemoryServer, config: &RewireConfig) -> Scheduler {
    Scheduler::new(
        context(config),
        Box::new(server.clone()),
        Arc::new(PluginCatalog::builtin()),
        config,
    )
}
