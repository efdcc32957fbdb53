//! Clients manager.
//!
//! Owns every [`AudioClient`], connects them with shared pacing, reacts to
//! exits and restarts, and fans client messages into the scheduler's check
//! flags. Other threads never touch clients directly. They queue
//! [`ClientUpdate`]s in the [`ClientRegistry`] and the control thread
//! applies them on its next pass.

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use rewireconf::{ClientConfig, ControlSetting, EntryError, PluginRef};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::client::AudioClient;
use crate::context::RuntimeContext;
use crate::message::{Message, MessagePump, MessageSource};
use crate::plugin::PluginCatalog;
use crate::scheduler::CheckFlags;
use crate::server::AudioServer;

/// Pause between the two drain passes, so stragglers of one server event
/// are picked up together.
const DRAIN_GRACE: Duration = Duration::from_millis(1);

/// A change to the set of hosted clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientUpdate {
    Add(ClientConfig),
    Update {
        name: String,
        #[serde(default)]
        plugin: Option<PluginRef>,
        #[serde(default)]
        instances: Option<usize>,
        #[serde(default)]
        pregain: Option<f64>,
        #[serde(default)]
        postgain: Option<f64>,
        #[serde(default)]
        controls: Vec<ControlSetting>,
    },
    Delete {
        name: String,
    },
}

impl ClientUpdate {
    /// An update that turns an existing client into `config`.
    pub fn replace(config: ClientConfig) -> Self {
        ClientUpdate::Update {
            name: config.name,
            plugin: Some(config.plugin),
            instances: Some(config.instances),
            pregain: Some(config.pregain),
            postgain: Some(config.postgain),
            controls: config.controls,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ClientUpdate::Add(config) => &config.name,
            ClientUpdate::Update { name, .. } | ClientUpdate::Delete { name } => name,
        }
    }

    pub fn validate(&self) -> Result<(), EntryError> {
        match self {
            ClientUpdate::Add(config) => config.validate(),
            ClientUpdate::Update {
                name,
                instances,
                pregain,
                postgain,
                ..
            } => {
                if name.is_empty() {
                    return Err(EntryError::Empty { field: "name" });
                }
                if *instances == Some(0) {
                    return Err(EntryError::NoInstances { client: name.clone() });
                }
                for (field, gain) in [("pregain", pregain), ("postgain", postgain)] {
                    if gain.is_some_and(|g| !g.is_finite()) {
                        return Err(EntryError::NotFinite {
                            client: name.clone(),
                            field: field.to_string(),
                        });
                    }
                }
                Ok(())
            }
            ClientUpdate::Delete { name } if name.is_empty() => Err(EntryError::Empty { field: "name" }),
            ClientUpdate::Delete { .. } => Ok(()),
        }
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The manager's face towards other threads.
pub struct ClientRegistry {
    inbox: Mutex<Vec<ClientUpdate>>,
    status: Mutex<Vec<Value>>,
    pump: MessagePump,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inbox: Mutex::new(Vec::new()),
            status: Mutex::new(Vec::new()),
            pump: MessagePump::new("clients manager"),
        }
    }

    /// Queue updates for the control thread and wake it.
    pub fn push(&self, updates: Vec<ClientUpdate>) -> usize {
        let count = updates.len();
        if count == 0 {
            return 0;
        }
        locked(&self.inbox).extend(updates);
        if self.pump.send(Message::CheckClients).is_err() {
            warn!("clients manager: message pipe full, updates wait for the next pass");
        }
        count
    }

    fn take(&self) -> Vec<ClientUpdate> {
        std::mem::take(&mut *locked(&self.inbox))
    }

    fn publish(&self, clients: Vec<Value>) {
        *locked(&self.status) = clients;
    }

    pub fn clients_json(&self) -> Value {
        json!({ "clients": *locked(&self.status) })
    }
}

impl MessageSource for ClientRegistry {
    fn pump(&self) -> &MessagePump {
        &self.pump
    }
}

/// Result of one manager pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub all_connected: bool,
    pub connected: usize,
}

pub struct ClientsManager {
    clients: Vec<AudioClient>,
    catalog: Arc<PluginCatalog>,
    registry: Arc<ClientRegistry>,
    last_connect: Option<Instant>,
    /// Clients whose last connect failed, so repeats log quietly
    failing: HashSet<String>,
}

impl ClientsManager {
    pub fn new(catalog: Arc<PluginCatalog>, registry: Arc<ClientRegistry>) -> Self {
        Self {
            clients: Vec::new(),
            catalog,
            registry,
            last_connect: None,
            failing: HashSet::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn clients(&self) -> impl Iterator<Item = &AudioClient> {
        self.clients.iter().filter(|c| !c.is_deleted())
    }

    pub fn client(&self, name: &str) -> Option<&AudioClient> {
        self.clients().find(|c| c.name() == name)
    }

    fn client_mut(&mut self, name: &str) -> Option<&mut AudioClient> {
        self.clients
            .iter_mut()
            .find(|c| !c.is_deleted() && c.name() == name)
    }

    /// Bring the client set in line with a full config list. Clients missing
    /// from the list are deleted, the rest are added or updated.
    pub fn apply_config(&mut self, configs: &[ClientConfig]) {
        let names: HashSet<&str> = configs.iter().map(|c| c.name.as_str()).collect();
        for client in self.clients.iter_mut().filter(|c| !names.contains(c.name())) {
            client.mark_deleted();
        }

        for config in configs {
            let update = if self.client(&config.name).is_some() {
                ClientUpdate::replace(config.clone())
            } else {
                ClientUpdate::Add(config.clone())
            };
            self.apply_update(update);
        }
    }

    /// Apply everything other threads queued.
    pub fn apply_updates(&mut self) {
        for update in self.registry.take() {
            self.apply_update(update);
        }
    }

    pub fn apply_update(&mut self, update: ClientUpdate) {
        if let Err(e) = update.validate() {
            error!("skipping client update: {}", e);
            return;
        }

        match update {
            ClientUpdate::Add(config) => self.add(config),
            ClientUpdate::Delete { name } => match self.client_mut(&name) {
                Some(client) => {
                    info!("deleting client \"{}\"", name);
                    client.mark_deleted();
                }
                None => warn!("cannot delete client \"{}\": no such client", name),
            },
            ClientUpdate::Update {
                name,
                plugin,
                instances,
                pregain,
                postgain,
                controls,
            } => {
                let Some(client) = self.client_mut(&name) else {
                    warn!("cannot update client \"{}\": no such client", name);
                    return;
                };

                if let Some(plugin) = plugin.filter(|p| p != client.plugin_ref()) {
                    // A different plugin means a different port layout
                    let mut config = client.config().clone();
                    client.mark_deleted();
                    config.plugin = plugin;
                    config.instances = instances.unwrap_or(config.instances);
                    config.pregain = pregain.unwrap_or(config.pregain);
                    config.postgain = postgain.unwrap_or(config.postgain);
                    config.controls = controls;
                    self.add(config);
                    return;
                }

                let current = client.config();
                let gains = (
                    pregain.unwrap_or(current.pregain),
                    postgain.unwrap_or(current.postgain),
                );
                if gains != (current.pregain, current.postgain) {
                    client.update_gain(gains.0, gains.1);
                }
                if !controls.is_empty() {
                    if let Err(e) = client.update_controls(&controls) {
                        error!("client \"{}\": {}", name, e);
                    }
                }
                if let Some(instances) = instances {
                    client.set_instances(instances);
                }
            }
        }
    }

    fn add(&mut self, config: ClientConfig) {
        if self.client(&config.name).is_some() {
            warn!("client \"{}\" already exists", config.name);
            return;
        }
        let name = config.name.clone();
        match AudioClient::new(config, &self.catalog) {
            Ok(client) => {
                info!("added client \"{}\"", name);
                self.clients.push(client);
                // New clients do not wait for the pacing
                self.last_connect = None;
            }
            Err(e) => error!("skipping client \"{}\": {}", name, e),
        }
    }

    /// Let the next pass retry disconnected clients without waiting out
    /// the reconnect interval.
    pub fn expedite(&mut self) {
        self.last_connect = None;
    }

    /// One pass over all clients. Called once per scheduler iteration.
    pub fn process(&mut self, server: &dyn AudioServer, ctx: &RuntimeContext) -> ProcessOutcome {
        self.clients.retain_mut(|client| {
            if client.is_deleted() {
                client.disconnect(true);
                info!("removed client \"{}\"", client.name());
            }
            !client.is_deleted()
        });

        for client in &mut self.clients {
            if let Some(exit) = client.exit() {
                error!(
                    "client \"{}\" exited with code {} reason: \"{}\"",
                    client.name(),
                    exit.status,
                    exit.reason
                );
                client.disconnect(false);
            }
        }

        for client in &mut self.clients {
            if !client.needs_restart() {
                continue;
            }
            if !client.is_connected() {
                client.clear_restart();
                continue;
            }
            info!("restarting client \"{}\"", client.name());
            client.disconnect(true);
            Self::connect_client(client, server, ctx, &self.catalog, &mut self.failing);
        }

        let due = self
            .last_connect
            .map_or(true, |last| last.elapsed() >= ctx.intervals().reconnect);
        if due && self.clients.iter().any(|c| !c.is_connected()) {
            self.last_connect = Some(Instant::now());
            for client in self.clients.iter_mut().filter(|c| !c.is_connected()) {
                Self::connect_client(client, server, ctx, &self.catalog, &mut self.failing);
            }
        }

        self.registry
            .publish(self.clients.iter().map(AudioClient::to_json).collect());

        let connected = self.clients.iter().filter(|c| c.is_connected()).count();
        ProcessOutcome {
            all_connected: connected == self.clients.len(),
            connected,
        }
    }

    fn connect_client(
        client: &mut AudioClient,
        server: &dyn AudioServer,
        ctx: &RuntimeContext,
        catalog: &PluginCatalog,
        failing: &mut HashSet<String>,
    ) {
        match client.connect(server, ctx) {
            Ok(()) => {
                failing.remove(client.name());
                catalog.set_sample_rate(client.sample_rate());
            }
            Err(e) => {
                if note_failure(failing, client.name(), ctx.debug()) {
                    error!("client \"{}\" error connecting: {}", client.name(), e);
                } else {
                    debug!("client \"{}\" error connecting: {}", client.name(), e);
                }
            }
        }
    }

    /// Descriptors of every client pump.
    pub fn fds(&self) -> Vec<RawFd> {
        self.clients.iter().filter_map(|c| c.pump().fd()).collect()
    }

    /// Drain every client pump into `flags`. One server event reaches all
    /// clients at about the same time, so after a short pause the pumps are
    /// drained again. Returns true if anything was read.
    pub fn drain_messages(&mut self, flags: &mut CheckFlags) -> bool {
        let mut any = self.drain_once(flags);
        if any {
            thread::sleep(DRAIN_GRACE);
            any |= self.drain_once(flags);
        }
        any
    }

    fn drain_once(&self, flags: &mut CheckFlags) -> bool {
        let mut any = false;
        for client in &self.clients {
            while let Some(msg) = client.get_message() {
                debug!("client \"{}\": got message {}", client.name(), msg);
                client.confirm_message(msg);
                flags.dispatch(msg);
                any = true;
            }
        }
        any
    }

    pub fn all_connected(&self) -> bool {
        self.clients.iter().all(|c| c.is_connected())
    }

    /// Disconnect and drop every client.
    pub fn stop(&mut self) {
        for client in &mut self.clients {
            client.disconnect(true);
        }
        self.clients.clear();
        self.registry.publish(Vec::new());
    }
}

/// Record a failed connect for `name`. Returns true when it deserves an
/// error line: the first of a run, or any in verbose mode.
fn note_failure(failing: &mut HashSet<String>, name: &str, verbose: bool) -> bool {
    failing.insert(name.to_string()) || verbose
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{AMP_ID, DELAY_ID};
    use crate::server::memory::MemoryServer;
    use rewireconf::DaemonConfig;

    fn config(name: &str) -> ClientConfig {
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

    fn manager() -> ClientsManager {
        ClientsManager::new(
            Arc::new(PluginCatalog::builtin()),
            Arc::new(ClientRegistry::new()),
        )
    }

    fn context(reconnect_interval_ms: u64) -> RuntimeContext {
        RuntimeContext::new(
            &DaemonConfig {
                reconnect_interval_ms,
                ..Default::default()
            },
            false,
        )
    }

    #[test]
    fn test_update_from_json() {
        let update: ClientUpdate = serde_json::from_value(json!({
            "action": "update",
            "name": "amp",
            "pregain": 0.5,
        }))
        .unwrap();
        assert_eq!(update.name(), "amp");
        assert!(update.validate().is_ok());

        let add: ClientUpdate = serde_json::from_value(json!({
            "action": "add",
            "name": "amp",
            "plugin": { "label": "amp", "unique_id": 1001 },
        }))
        .unwrap();
        assert_eq!(add, ClientUpdate::Add(config("amp")));

        let bad: ClientUpdate = serde_json::from_value(json!({
            "action": "update",
            "name": "amp",
            "instances": 0,
        }))
        .unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_connects_and_reports_sample_rate() {
        let server = MemoryServer::new(44_100, 64);
        let mut manager = manager();
        manager.apply_config(&[config("a"), config("b")]);

        let outcome = manager.process(&server, &context(10_000));
        assert_eq!(outcome, ProcessOutcome { all_connected: true, connected: 2 });
        assert_eq!(manager.catalog.sample_rate(), 44_100);

        let status = manager.registry().clients_json();
        assert_eq!(status["clients"][0]["name"], "a");
        assert_eq!(status["clients"][0]["connected"], true);
    }

    #[test]
    fn test_connect_attempts_are_paced() {
        let server = MemoryServer::default();
        server.stop("not yet");
        let mut manager = manager();
        manager.apply_config(&[config("a")]);
        let ctx = context(60_000);

        assert!(!manager.process(&server, &ctx).all_connected);
        server.start();
        // Within the interval, no new attempt
        assert!(!manager.process(&server, &ctx).all_connected);
        assert_eq!(server.sessions_opened(), 0);
    }

    #[test]
    fn test_exit_disconnects_without_unregistering() {
        let server = MemoryServer::default();
        let mut manager = manager();
        manager.apply_config(&[config("a")]);
        manager.process(&server, &context(60_000));

        server.stop("server quit");
        let mut flags = CheckFlags::default();
        assert!(manager.drain_messages(&mut flags));
        assert!(flags.clients);

        let outcome = manager.process(&server, &context(60_000));
        assert_eq!(outcome.connected, 0);
        assert_eq!(server.dead_unregisters(), 0);
    }

    #[test]
    fn test_sample_rate_change_restarts_immediately() {
        let server = MemoryServer::new(48_000, 64);
        let mut manager = manager();
        manager.apply_config(&[config("a")]);
        let ctx = context(60_000);
        manager.process(&server, &ctx);

        server.set_sample_rate(96_000);
        // Restarts despite the pacing interval
        let outcome = manager.process(&server, &ctx);
        assert!(outcome.all_connected);
        assert_eq!(manager.client("a").unwrap().sample_rate(), 96_000);
        assert_eq!(server.sessions_opened(), 2);
    }

    #[test]
    fn test_updates_through_registry() {
        let server = MemoryServer::default();
        let mut manager = manager();
        manager.apply_config(&[config("a")]);
        manager.process(&server, &context(60_000));

        let registry = Arc::clone(manager.registry());
        registry.push(vec![
            ClientUpdate::Update {
                name: "a".to_string(),
                plugin: None,
                instances: None,
                pregain: Some(0.25),
                postgain: None,
                controls: vec![ControlSetting {
                    name: "Gain (dB)".to_string(),
                    value: -6.0,
                }],
            },
            ClientUpdate::Add(config("b")),
        ]);
        assert_eq!(registry.get_message(), Some(Message::CheckClients));
        registry.confirm_message(Message::CheckClients);

        manager.apply_updates();
        manager.process(&server, &context(60_000));
        let a = manager.client("a").unwrap();
        assert_eq!(a.config().pregain, 0.25);
        assert_eq!(a.control_values()[0], ("Gain (dB)".to_string(), -6.0));
        assert!(manager.client("b").unwrap().is_connected());
    }

    #[test]
    fn test_plugin_change_replaces_client() {
        let server = MemoryServer::default();
        let mut manager = manager();
        manager.apply_config(&[config("fx")]);
        manager.process(&server, &context(60_000));
        assert!(server.port_names().contains(&"rewire_fx:Input".to_string()));

        let mut delay = config("fx");
        delay.plugin = PluginRef {
            label: "delay".to_string(),
            unique_id: DELAY_ID,
        };
        manager.apply_config(&[delay]);
        let outcome = manager.process(&server, &context(60_000));
        assert_eq!(outcome.connected, 1);
        assert_eq!(manager.clients().count(), 1);
        assert_eq!(manager.client("fx").unwrap().plugin_ref().label, "delay");
    }

    #[test]
    fn test_delete_unregisters_ports() {
        let server = MemoryServer::default();
        let mut manager = manager();
        manager.apply_config(&[config("a"), config("b")]);
        manager.process(&server, &context(60_000));

        manager.apply_config(&[config("b")]);
        manager.process(&server, &context(60_000));
        assert_eq!(manager.clients().count(), 1);
        assert!(!server.port_names().iter().any(|p| p.starts_with("rewire_a:")));
    }

    #[test]
    fn test_repeated_failures_log_once_unless_verbose() {
        let mut failing = HashSet::new();
        assert!(note_failure(&mut failing, "amp", false));
        assert!(!note_failure(&mut failing, "amp", false));
        assert!(note_failure(&mut failing, "delay", false));

        let mut failing = HashSet::new();
        assert!(note_failure(&mut failing, "amp", true));
        assert!(note_failure(&mut failing, "amp", true));
    }
}
