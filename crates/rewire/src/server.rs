//! The audio server as seen by the rest of the crate.
//!
//! Everything that talks to JACK goes through these traits, so the state
//! machines above them can run against [`memory::MemoryServer`] in tests.
//!
//! A [`Session`] is one open client connection. Ports are registered while it
//! is inactive. [`Session::activate`] hands a [`Process`] to the server's
//! realtime thread together with a [`Notifications`] table. The server calls
//! into that table from its own threads. Dropping the session closes it.

pub mod jack;
pub mod memory;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

/// Handle to a port registered by a session, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub usize);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("audio server unavailable: {0}")]
    Unavailable(String),

    #[error("cannot register port \"{port}\": {reason}")]
    Registration { port: String, reason: String },

    #[error("cannot activate \"{client}\": {reason}")]
    Activation { client: String, reason: String },

    #[error("\"{output}\" is already connected to \"{input}\"")]
    AlreadyConnected { output: String, input: String },

    #[error("cannot {action} \"{output}\" and \"{input}\": {reason}")]
    Connection {
        action: &'static str,
        output: String,
        input: String,
        reason: String,
    },

    #[error("session is active")]
    Active,

    #[error("session is closed")]
    Closed,
}

/// One port in a [`GraphSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub direction: PortDirection,
    /// Full names of the ports on the other end of every connection.
    #[serde(skip)]
    pub connections: Vec<String>,
}

/// Every port in the server at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphSnapshot {
    ports: Vec<PortInfo>,
}

impl GraphSnapshot {
    pub fn new(mut ports: Vec<PortInfo>) -> Self {
        ports.sort_by(|a, b| a.name.cmp(&b.name));
        Self { ports }
    }

    pub fn ports(&self) -> &[PortInfo] {
        &self.ports
    }

    pub fn inputs(&self) -> impl Iterator<Item = &PortInfo> {
        self.ports
            .iter()
            .filter(|p| p.direction == PortDirection::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &PortInfo> {
        self.ports
            .iter()
            .filter(|p| p.direction == PortDirection::Output)
    }

    /// All live `(output, input)` pairs, each once.
    pub fn connections(&self) -> Vec<(String, String)> {
        let mut pairs = BTreeSet::new();
        for port in &self.ports {
            for other in &port.connections {
                let pair = match port.direction {
                    PortDirection::Input => (other.clone(), port.name.clone()),
                    PortDirection::Output => (port.name.clone(), other.clone()),
                };
                pairs.insert(pair);
            }
        }
        pairs.into_iter().collect()
    }

    pub fn is_connected(&self, output: &str, input: &str) -> bool {
        self.ports.iter().any(|p| {
            (p.name == input && p.direction == PortDirection::Input && p.connections.iter().any(|c| c == output))
                || (p.name == output
                    && p.direction == PortDirection::Output
                    && p.connections.iter().any(|c| c == input))
        })
    }
}

/// Per-cycle access to a session's port buffers.
pub trait PortBuffers {
    fn frames(&self) -> usize;

    /// Samples of an input port. Empty for unknown or output ports.
    fn input(&self, port: PortId) -> &[f32];

    /// Samples of an output port. Empty for unknown or input ports.
    fn output(&mut self, port: PortId) -> &mut [f32];
}

/// Realtime processing callback. Must not block or allocate in `process`.
pub trait Process: Send {
    fn process(&mut self, buffers: &mut dyn PortBuffers);

    /// The server changed its period size. Not called concurrently with `process`.
    fn buffer_size(&mut self, _frames: usize) {}
}

/// Asynchronous events from the server. Called from server threads.
pub trait Notifications: Send + Sync {
    fn shutdown(&self, status: u32, reason: &str);
    fn sample_rate(&self, rate: u32);
    fn port_registration(&self, registered: bool);
    fn port_connection(&self, connected: bool);
}

pub trait AudioServer: Send + Sync {
    /// Open a client connection. Never starts a server.
    fn open(&self, name: &str) -> Result<Box<dyn Session>, ServerError>;

    /// Longest client name in bytes, including the terminator.
    fn client_name_size(&self) -> usize;

    /// Longest full port name (`client:port`) in bytes, including the terminator.
    fn port_name_size(&self) -> usize;
}

pub trait Session: Send {
    fn name(&self) -> &str;
    fn sample_rate(&self) -> u32;
    fn buffer_size(&self) -> usize;

    fn register_port(&mut self, name: &str, direction: PortDirection) -> Result<PortId, ServerError>;

    fn activate(
        &mut self,
        process: Box<dyn Process>,
        notifications: Arc<dyn Notifications>,
    ) -> Result<(), ServerError>;

    /// Stop the realtime callback and hand the processor back. `Ok(None)` if
    /// the session was not active.
    fn deactivate(&mut self) -> Result<Option<Box<dyn Process>>, ServerError>;

    fn unregister_ports(&mut self) -> Result<(), ServerError>;

    fn snapshot(&self) -> Result<GraphSnapshot, ServerError>;

    fn connect(&self, output: &str, input: &str) -> Result<(), ServerError>;

    fn disconnect(&self, output: &str, input: &str) -> Result<(), ServerError>;
}

/// Longest prefix of `name` that fits in `max_len` bytes without splitting a character.
pub fn truncate_name(name: &str, max_len: usize) -> &str {
    if name.len() <= max_len {
        return name;
    }
    let mut end = max_len;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, direction: PortDirection, connections: &[&str]) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            direction,
            connections: connections.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn test_truncate_name() {
        assert_eq!(truncate_name("delay", 10), "delay");
        assert_eq!(truncate_name("delay", 3), "del");
        // "é" is two bytes, never split it
        assert_eq!(truncate_name("aé", 2), "a");
        assert_eq!(truncate_name("", 0), "");
    }

    #[test]
    fn test_connections_deduplicated() {
        let snapshot = GraphSnapshot::new(vec![
            port("system:capture_1", PortDirection::Output, &["fx:in"]),
            port("fx:in", PortDirection::Input, &["system:capture_1"]),
            port("fx:out", PortDirection::Output, &[]),
        ]);
        assert_eq!(
            snapshot.connections(),
            vec![("system:capture_1".to_string(), "fx:in".to_string())]
        );
        assert!(snapshot.is_connected("system:capture_1", "fx:in"));
        assert!(!snapshot.is_connected("fx:out", "fx:in"));
    }

    #[test]
    fn test_snapshot_sorted() {
        let snapshot = GraphSnapshot::new(vec![
            port("b:x", PortDirection::Input, &[]),
            port("a:x", PortDirection::Output, &[]),
        ]);
        let names: Vec<_> = snapshot.ports().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a:x", "b:x"]);
        assert_eq!(snapshot.inputs().count(), 1);
        assert_eq!(snapshot.outputs().count(), 1);
    }
}
