//! An audio server that lives inside the process.
//!
//! `MemoryServer` keeps a port graph behind a mutex and drives registered
//! processors when asked to run a cycle. It delivers the same notifications
//! JACK would: sample rate on activation, port registration, connection
//! changes and shutdown. Tests use it to script server behavior. The
//! `--dry-run` flag uses it to exercise a config without a server.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    AudioServer, GraphSnapshot, Notifications, PortBuffers, PortDirection, PortId, PortInfo,
    Process, ServerError, Session,
};

const CLIENT_NAME_SIZE: usize = 64;
const PORT_NAME_SIZE: usize = 320;

/// Exit status reported to clients when the server stops.
pub const SHUTDOWN_STATUS: u32 = 1;

struct MemoryPort {
    direction: PortDirection,
    owner: Option<u64>,
    buffer: Vec<f32>,
}

struct SessionEntry {
    name: String,
    /// Full port names, indexed by `PortId`
    ports: Vec<String>,
    active: bool,
    processor: Option<Box<dyn Process>>,
    notifications: Option<Arc<dyn Notifications>>,
    /// Cut off by a server stop
    dead: bool,
}

struct Graph {
    running: bool,
    sample_rate: u32,
    buffer_size: usize,
    ports: BTreeMap<String, MemoryPort>,
    /// `(output, input)`
    connections: BTreeSet<(String, String)>,
    sessions: BTreeMap<u64, SessionEntry>,
    next_session: u64,
    sessions_opened: usize,
    connect_requests: Vec<(String, String)>,
    disconnect_requests: Vec<(String, String)>,
    dead_unregisters: usize,
}

impl Graph {
    /// Notification tables of every active, live session.
    fn listeners(&self) -> Vec<Arc<dyn Notifications>> {
        self.sessions
            .values()
            .filter(|s| s.active && !s.dead)
            .filter_map(|s| s.notifications.clone())
            .collect()
    }

    fn remove_port(&mut self, name: &str) -> bool {
        if self.ports.remove(name).is_none() {
            return false;
        }
        self.connections
            .retain(|(output, input)| output != name && input != name);
        true
    }
}

/// In-process audio server. Clones share one graph.
#[derive(Clone)]
pub struct MemoryServer {
    graph: Arc<Mutex<Graph>>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new(48_000, 256)
    }
}

impl MemoryServer {
    pub fn new(sample_rate: u32, buffer_size: usize) -> Self {
        Self {
            graph: Arc::new(Mutex::new(Graph {
                running: true,
                sample_rate,
                buffer_size,
                ports: BTreeMap::new(),
                connections: BTreeSet::new(),
                sessions: BTreeMap::new(),
                next_session: 0,
                sessions_opened: 0,
                connect_requests: Vec::new(),
                disconnect_requests: Vec::new(),
                dead_unregisters: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a port owned by no session, like a hardware port.
    pub fn add_port(&self, name: &str, direction: PortDirection) {
        let listeners = {
            let mut graph = self.lock();
            let buffer = vec![0.0; graph.buffer_size];
            graph.ports.insert(
                name.to_string(),
                MemoryPort {
                    direction,
                    owner: None,
                    buffer,
                },
            );
            graph.listeners()
        };
        for listener in listeners {
            listener.port_registration(true);
        }
    }

    pub fn remove_port(&self, name: &str) {
        let listeners = {
            let mut graph = self.lock();
            if !graph.remove_port(name) {
                return;
            }
            graph.listeners()
        };
        for listener in listeners {
            listener.port_registration(false);
        }
    }

    /// Patch two ports from outside, like a user with a patchbay.
    pub fn connect(&self, output: &str, input: &str) -> Result<(), ServerError> {
        self.connect_internal(output, input, false)
    }

    pub fn disconnect(&self, output: &str, input: &str) -> Result<(), ServerError> {
        self.disconnect_internal(output, input, false)
    }

    fn connect_internal(&self, output: &str, input: &str, record: bool) -> Result<(), ServerError> {
        let listeners = {
            let mut graph = self.lock();
            if record {
                graph
                    .connect_requests
                    .push((output.to_string(), input.to_string()));
            }
            let failure = |reason: &str| ServerError::Connection {
                action: "connect",
                output: output.to_string(),
                input: input.to_string(),
                reason: reason.to_string(),
            };
            match graph.ports.get(output) {
                Some(port) if port.direction == PortDirection::Output => {}
                Some(_) => return Err(failure("source is not an output")),
                None => return Err(failure("no such source port")),
            }
            match graph.ports.get(input) {
                Some(port) if port.direction == PortDirection::Input => {}
                Some(_) => return Err(failure("destination is not an input")),
                None => return Err(failure("no such destination port")),
            }
            if !graph
                .connections
                .insert((output.to_string(), input.to_string()))
            {
                return Err(ServerError::AlreadyConnected {
                    output: output.to_string(),
                    input: input.to_string(),
                });
            }
            graph.listeners()
        };
        for listener in listeners {
            listener.port_connection(true);
        }
        Ok(())
    }

    fn disconnect_internal(&self, output: &str, input: &str, record: bool) -> Result<(), ServerError> {
        let listeners = {
            let mut graph = self.lock();
            if record {
                graph
                    .disconnect_requests
                    .push((output.to_string(), input.to_string()));
            }
            if !graph
                .connections
                .remove(&(output.to_string(), input.to_string()))
            {
                return Err(ServerError::Connection {
                    action: "disconnect",
                    output: output.to_string(),
                    input: input.to_string(),
                    reason: "not connected".to_string(),
                });
            }
            graph.listeners()
        };
        for listener in listeners {
            listener.port_connection(false);
        }
        Ok(())
    }

    /// Change the rate and tell every active session.
    pub fn set_sample_rate(&self, rate: u32) {
        let listeners = {
            let mut graph = self.lock();
            graph.sample_rate = rate;
            graph.listeners()
        };
        for listener in listeners {
            listener.sample_rate(rate);
        }
    }

    /// Stop the server. Active sessions get a shutdown notification and
    /// every session owned port disappears.
    pub fn stop(&self, reason: &str) {
        let listeners = {
            let mut graph = self.lock();
            graph.running = false;
            let listeners = graph.listeners();
            for session in graph.sessions.values_mut() {
                session.dead = true;
            }
            graph.ports.retain(|_, port| port.owner.is_none());
            let ports: BTreeSet<String> = graph.ports.keys().cloned().collect();
            graph
                .connections
                .retain(|(output, input)| ports.contains(output) && ports.contains(input));
            listeners
        };
        for listener in listeners {
            listener.shutdown(SHUTDOWN_STATUS, reason);
        }
    }

    pub fn start(&self) {
        self.lock().running = true;
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Run every active processor once.
    ///
    /// Input buffers hold the sum of all connected outputs from the previous
    /// state of the graph. Output buffers are written back afterwards.
    pub fn run_cycle(&self) {
        let ids: Vec<u64> = self.lock().sessions.keys().copied().collect();
        for id in ids {
            let (mut processor, mut buffers) = {
                let mut graph = self.lock();
                let frames = graph.buffer_size;
                let Some(session) = graph.sessions.get(&id) else {
                    continue;
                };
                if !session.active || session.dead {
                    continue;
                }
                let port_names = session.ports.clone();

                let mut data = Vec::with_capacity(port_names.len());
                let mut directions = Vec::with_capacity(port_names.len());
                for name in &port_names {
                    let direction = graph
                        .ports
                        .get(name)
                        .map(|p| p.direction)
                        .unwrap_or(PortDirection::Output);
                    let mut buffer = vec![0.0; frames];
                    if direction == PortDirection::Input {
                        for (output, _) in graph.connections.iter().filter(|(_, input)| input == name) {
                            if let Some(source) = graph.ports.get(output) {
                                for (sample, value) in buffer.iter_mut().zip(&source.buffer) {
                                    *sample += value;
                                }
                            }
                        }
                    }
                    data.push(buffer);
                    directions.push(direction);
                }

                let Some(processor) = graph.sessions.get_mut(&id).and_then(|s| s.processor.take()) else {
                    continue;
                };
                (
                    processor,
                    MemoryBuffers {
                        frames,
                        names: port_names,
                        directions,
                        data,
                    },
                )
            };

            processor.process(&mut buffers);

            let mut graph = self.lock();
            for ((name, direction), data) in buffers
                .names
                .iter()
                .zip(&buffers.directions)
                .zip(buffers.data)
            {
                if *direction == PortDirection::Output {
                    if let Some(port) = graph.ports.get_mut(name) {
                        port.buffer = data;
                    }
                }
            }
            if let Some(session) = graph.sessions.get_mut(&id) {
                session.processor = Some(processor);
            }
        }
    }

    /// Fill a port's buffer, typically a hardware capture port.
    pub fn write_port(&self, name: &str, samples: &[f32]) {
        let mut graph = self.lock();
        let frames = graph.buffer_size;
        if let Some(port) = graph.ports.get_mut(name) {
            port.buffer = samples.iter().copied().chain(std::iter::repeat(0.0)).take(frames).collect();
        }
    }

    pub fn read_port(&self, name: &str) -> Option<Vec<f32>> {
        self.lock().ports.get(name).map(|p| p.buffer.clone())
    }

    pub fn port_names(&self) -> Vec<String> {
        self.lock().ports.keys().cloned().collect()
    }

    pub fn connections(&self) -> Vec<(String, String)> {
        self.lock().connections.iter().cloned().collect()
    }

    pub fn is_connected(&self, output: &str, input: &str) -> bool {
        self.lock()
            .connections
            .contains(&(output.to_string(), input.to_string()))
    }

    /// Names of currently open sessions.
    pub fn open_sessions(&self) -> Vec<String> {
        self.lock().sessions.values().map(|s| s.name.clone()).collect()
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    /// Connect calls made through sessions, including refused ones.
    pub fn connect_requests(&self) -> Vec<(String, String)> {
        self.lock().connect_requests.clone()
    }

    pub fn disconnect_requests(&self) -> Vec<(String, String)> {
        self.lock().disconnect_requests.clone()
    }

    /// Times a session tried to unregister ports after the server stopped.
    pub fn dead_unregisters(&self) -> usize {
        self.lock().dead_unregisters
    }
}

impl AudioServer for MemoryServer {
    fn open(&self, name: &str) -> Result<Box<dyn Session>, ServerError> {
        let mut graph = self.lock();
        if !graph.running {
            return Err(ServerError::Unavailable("server is not running".to_string()));
        }
        if name.is_empty() || name.len() >= CLIENT_NAME_SIZE {
            return Err(ServerError::Unavailable(format!("invalid client name \"{name}\"")));
        }
        if graph.sessions.values().any(|s| s.name == name && !s.dead) {
            return Err(ServerError::Unavailable(format!("client name \"{name}\" in use")));
        }

        let id = graph.next_session;
        graph.next_session += 1;
        graph.sessions_opened += 1;
        graph.sessions.insert(
            id,
            SessionEntry {
                name: name.to_string(),
                ports: Vec::new(),
                active: false,
                processor: None,
                notifications: None,
                dead: false,
            },
        );

        Ok(Box::new(MemorySession {
            server: self.clone(),
            id,
            name: name.to_string(),
            sample_rate: graph.sample_rate,
            buffer_size: graph.buffer_size,
        }))
    }

    fn client_name_size(&self) -> usize {
        CLIENT_NAME_SIZE
    }

    fn port_name_size(&self) -> usize {
        PORT_NAME_SIZE
    }
}

struct MemorySession {
    server: MemoryServer,
    id: u64,
    name: String,
    sample_rate: u32,
    buffer_size: usize,
}

impl MemorySession {
    fn is_dead(&self) -> bool {
        self.server
            .lock()
            .sessions
            .get(&self.id)
            .map(|s| s.dead)
            .unwrap_or(true)
    }
}

impl Session for MemorySession {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn register_port(&mut self, name: &str, direction: PortDirection) -> Result<PortId, ServerError> {
        let full_name = format!("{}:{}", self.name, name);
        let (id, listeners) = {
            let mut graph = self.server.lock();
            let failure = |reason: &str| ServerError::Registration {
                port: full_name.clone(),
                reason: reason.to_string(),
            };
            if full_name.len() >= PORT_NAME_SIZE {
                return Err(failure("name too long"));
            }
            if graph.ports.contains_key(&full_name) {
                return Err(failure("name in use"));
            }
            let buffer = vec![0.0; graph.buffer_size];
            let session = match graph.sessions.get_mut(&self.id) {
                Some(session) if !session.dead => session,
                _ => return Err(ServerError::Closed),
            };
            session.ports.push(full_name.clone());
            let id = PortId(session.ports.len() - 1);
            graph.ports.insert(
                full_name.clone(),
                MemoryPort {
                    direction,
                    owner: Some(self.id),
                    buffer,
                },
            );
            (id, graph.listeners())
        };
        for listener in listeners {
            listener.port_registration(true);
        }
        Ok(id)
    }

    fn activate(
        &mut self,
        process: Box<dyn Process>,
        notifications: Arc<dyn Notifications>,
    ) -> Result<(), ServerError> {
        let rate = {
            let mut graph = self.server.lock();
            let rate = graph.sample_rate;
            let session = match graph.sessions.get_mut(&self.id) {
                Some(session) if !session.dead => session,
                _ => return Err(ServerError::Closed),
            };
            if session.active {
                return Err(ServerError::Active);
            }
            session.active = true;
            session.processor = Some(process);
            session.notifications = Some(Arc::clone(&notifications));
            rate
        };
        // JACK reports the current rate once on activation
        notifications.sample_rate(rate);
        Ok(())
    }

    fn deactivate(&mut self) -> Result<Option<Box<dyn Process>>, ServerError> {
        let mut graph = self.server.lock();
        let Some(session) = graph.sessions.get_mut(&self.id) else {
            return Ok(None);
        };
        if !session.active {
            return Ok(None);
        }
        session.active = false;
        session.notifications = None;
        Ok(session.processor.take())
    }

    fn unregister_ports(&mut self) -> Result<(), ServerError> {
        if self.is_dead() {
            self.server.lock().dead_unregisters += 1;
            return Err(ServerError::Unavailable("server is gone".to_string()));
        }

        let names = {
            let mut graph = self.server.lock();
            match graph.sessions.get_mut(&self.id) {
                Some(session) => std::mem::take(&mut session.ports),
                None => return Ok(()),
            }
        };
        for name in names {
            self.server.remove_port(&name);
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<GraphSnapshot, ServerError> {
        if self.is_dead() {
            return Err(ServerError::Closed);
        }
        let graph = self.server.lock();
        let ports = graph
            .ports
            .iter()
            .map(|(name, port)| {
                let connections = graph
                    .connections
                    .iter()
                    .filter_map(|(output, input)| match port.direction {
                        PortDirection::Input if input == name => Some(output.clone()),
                        PortDirection::Output if output == name => Some(input.clone()),
                        _ => None,
                    })
                    .collect();
                PortInfo {
                    name: name.clone(),
                    direction: port.direction,
                    connections,
                }
            })
            .collect();
        Ok(GraphSnapshot::new(ports))
    }

    fn connect(&self, output: &str, input: &str) -> Result<(), ServerError> {
        if self.is_dead() {
            return Err(ServerError::Closed);
        }
        self.server.connect_internal(output, input, true)
    }

    fn disconnect(&self, output: &str, input: &str) -> Result<(), ServerError> {
        if self.is_dead() {
            return Err(ServerError::Closed);
        }
        self.server.disconnect_internal(output, input, true)
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let (ports, dead) = {
            let mut graph = self.server.lock();
            match graph.sessions.remove(&self.id) {
                Some(session) => (session.ports, session.dead),
                None => return,
            }
        };
        // Closing a live client removes whatever ports it still owns
        if !dead {
            for name in ports {
                self.server.remove_port(&name);
            }
        }
    }
}

struct MemoryBuffers {
    frames: usize,
    names: Vec<String>,
    directions: Vec<PortDirection>,
    data: Vec<Vec<f32>>,
}

impl PortBuffers for MemoryBuffers {
    fn frames(&self) -> usize {
        self.frames
    }

    fn input(&self, port: PortId) -> &[f32] {
        match (self.directions.get(port.0), self.data.get(port.0)) {
            (Some(PortDirection::Input), Some(data)) => data,
            _ => &[],
        }
    }

    fn output(&mut self, port: PortId) -> &mut [f32] {
        match (self.directions.get(port.0), self.data.get_mut(port.0)) {
            (Some(PortDirection::Output), Some(data)) => data,
            _ => &mut [],
        }
    }
}
