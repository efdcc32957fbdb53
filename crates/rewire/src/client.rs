//! Audio client connection state machine.
//!
//! An [`AudioClient`] hosts N instances of one plugin inside the audio
//! server. It connects, disconnects and restarts under the control of the
//! clients manager. Everything that happens on server threads (the
//! realtime callback and the asynchronous notifications) is reported back
//! through the client's [`MessagePump`], never acted on in place.
//!
//! ```text
//!  server threads                           control thread
//!  ──────────────                           ──────────────
//!  ClientNotifications ──┐
//!                        ├─ events bitmask ─► MessagePump ─► ClientsManager
//!  ClientProcessor ──────┘                                       │
//!        ▲                                                       │
//!        └──── try_lock ──── Mutex<ControlState> ◄───────────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rewireconf::{ClientConfig, ControlSetting, PluginRef};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::context::RuntimeContext;
use crate::control::{smoothing_block, smoothing_step, ControlState, LiveControls};
use crate::message::{Message, MessagePump, MessageSource};
use crate::plugin::{Plugin, PluginCatalog, PluginError, PluginInstance, RunBuffers};
use crate::server::{
    truncate_name, AudioServer, Notifications, PortBuffers, PortDirection, PortId, Process,
    ServerError, Session,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("plugin \"{label}\" with id {unique_id} is not in the catalog")]
    UnknownPlugin { label: String, unique_id: u64 },

    #[error("plugin \"{label}\" has no control input named \"{control}\"")]
    UnknownControl { label: String, control: String },

    #[error("control \"{control}\" is set more than once")]
    DuplicateControl { control: String },

    #[error("control \"{control}\" of plugin \"{label}\" has no default, a value is required")]
    MissingControl { label: String, control: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// The plugin's control inputs, in port order.
#[derive(Debug, Clone)]
struct ControlLayout {
    names: Vec<String>,
    /// Plugin port index of each slot
    ports: Vec<usize>,
    smooth: Vec<bool>,
    /// Set by the config; other slots follow the plugin default
    configured: Vec<bool>,
}

impl ControlLayout {
    fn slot(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// Bytes kept for the server's shutdown reason.
const EXIT_REASON_CAPACITY: usize = 256;

/// State shared with the server threads.
struct ClientShared {
    name: String,
    pump: MessagePump,
    /// One bit per message kind still waiting to be sent
    events: AtomicU32,
    exited: AtomicBool,
    exit_status: AtomicU32,
    exit_reason: Mutex<String>,
    restart: AtomicBool,
    sample_rate: AtomicU32,
    controls: Mutex<ControlState>,
}

impl ClientShared {
    fn raise(&self, msg: Message) {
        self.events.fetch_or(1 << msg.index(), Ordering::AcqRel);
        self.flush_events();
    }

    /// Try to send every pending event. Bits are cleared only for events the
    /// pump took, a full pipe leaves them for the next attempt.
    fn flush_events(&self) {
        let pending = self.events.load(Ordering::Acquire);
        if pending == 0 {
            return;
        }
        for msg in Message::ALL {
            let bit = 1 << msg.index();
            if pending & bit != 0 && self.pump.send(msg).is_ok() {
                self.events.fetch_and(!bit, Ordering::AcqRel);
            }
        }
    }

    fn controls(&self) -> MutexGuard<'_, ControlState> {
        self.controls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Asynchronous server callbacks. They only set bits and try a flush.
struct ClientNotifications {
    shared: Arc<ClientShared>,
}

impl Notifications for ClientNotifications {
    fn shutdown(&self, status: u32, reason: &str) {
        // Reason before status before flag, the manager reads them in reverse.
        // The buffer never grows here and a busy lock loses the reason.
        if let Ok(mut stored) = self.shared.exit_reason.try_lock() {
            stored.clear();
            let room = stored.capacity();
            stored.push_str(truncate_name(reason, room));
        }
        self.shared.exit_status.store(status, Ordering::Release);
        self.shared.exited.store(true, Ordering::Release);
        self.shared.raise(Message::Exited);
    }

    fn sample_rate(&self, rate: u32) {
        if rate != self.shared.sample_rate.load(Ordering::Acquire) {
            self.shared.restart.store(true, Ordering::Release);
            self.shared.raise(Message::SampleRateChanged);
        }
    }

    fn port_registration(&self, registered: bool) {
        self.shared.raise(if registered {
            Message::PortRegistered
        } else {
            Message::PortDeregistered
        });
    }

    fn port_connection(&self, connected: bool) {
        self.shared.raise(if connected {
            Message::PortConnected
        } else {
            Message::PortDisconnected
        });
    }
}

/// Server ports of one plugin instance.
struct InstancePorts {
    inputs: Vec<PortId>,
    outputs: Vec<PortId>,
}

/// The realtime side. Owns the plugin instances while the client is active.
struct ClientProcessor {
    shared: Arc<ClientShared>,
    instances: Vec<Box<dyn PluginInstance>>,
    ports: Vec<InstancePorts>,
    /// Plugin port indexes of the audio inputs and outputs
    audio_inputs: Vec<usize>,
    audio_outputs: Vec<usize>,
    control_ports: Vec<usize>,
    live: LiveControls,
    /// Control values by plugin port index
    controls: Vec<f32>,
    /// Scratch audio by plugin port index, empty for control ports
    audio: Vec<Vec<f32>>,
    capacity: usize,
    sample_rate: u32,
    block: usize,
}

impl ClientProcessor {
    fn resize(&mut self, frames: usize) {
        for &port in self.audio_inputs.iter().chain(&self.audio_outputs) {
            self.audio[port].resize(frames, 0.0);
        }
        self.capacity = frames;
    }

    /// Run every instance over `len` frames starting at `offset`.
    fn run_span(&mut self, buffers: &mut dyn PortBuffers, offset: usize, len: usize) {
        let Self {
            instances,
            ports,
            audio_inputs,
            audio_outputs,
            control_ports,
            live,
            controls,
            audio,
            ..
        } = self;

        let pregain = live.gain[0].value();
        let postgain = live.gain[1].value();
        for (value, &port) in live.controls.iter().zip(control_ports.iter()) {
            controls[port] = value.value();
        }

        for (instance, ports) in instances.iter_mut().zip(ports.iter()) {
            for (&plugin_port, &server_port) in audio_inputs.iter().zip(&ports.inputs) {
                let source = buffers.input(server_port);
                let scratch = &mut audio[plugin_port][..len];
                match source.get(offset..offset + len) {
                    Some(source) => {
                        for (sample, input) in scratch.iter_mut().zip(source) {
                            *sample = input * pregain;
                        }
                    }
                    None => scratch.fill(0.0),
                }
            }

            let mut run = RunBuffers {
                frames: len,
                controls: controls.as_slice(),
                audio: audio.as_mut_slice(),
            };
            instance.run(&mut run);

            for (&plugin_port, &server_port) in audio_outputs.iter().zip(&ports.outputs) {
                let scratch = &audio[plugin_port][..len];
                if let Some(target) = buffers.output(server_port).get_mut(offset..offset + len) {
                    for (sample, output) in target.iter_mut().zip(scratch) {
                        *sample = output * postgain;
                    }
                }
            }
        }
    }
}

impl Process for ClientProcessor {
    fn process(&mut self, buffers: &mut dyn PortBuffers) {
        // Never wait here, last cycle's values are fine
        if let Ok(state) = self.shared.controls.try_lock() {
            state.transfer(&mut self.live);
        }

        let frames = buffers.frames().min(self.capacity);
        let mut offset = 0;
        while offset < frames {
            if self.live.needs_ramp() {
                let len = self.block.min(frames - offset);
                self.run_span(buffers, offset, len);
                self.live.advance(smoothing_step(len, self.sample_rate));
                offset += len;
            } else {
                self.run_span(buffers, offset, frames - offset);
                offset = frames;
            }
        }

        self.shared.flush_events();
    }

    fn buffer_size(&mut self, frames: usize) {
        if frames > self.capacity {
            self.resize(frames);
        }
    }
}

impl Drop for ClientProcessor {
    fn drop(&mut self) {
        for instance in &mut self.instances {
            instance.deactivate();
        }
    }
}

/// Name of one server port: `<prefix><plugin port>[_N]`, shortened so the
/// full `client:port` name fits in `port_name_size`.
pub(crate) fn port_name(
    client: &str,
    prefix: &str,
    plugin_port: &str,
    instance: usize,
    instances: usize,
    port_name_size: usize,
) -> String {
    let suffix = if instances > 1 {
        format!("_{}", instance + 1)
    } else {
        String::new()
    };
    let budget = port_name_size
        .saturating_sub(1)
        .saturating_sub(client.len() + 1)
        .saturating_sub(suffix.len());
    let base = format!("{prefix}{plugin_port}");
    format!("{}{}", truncate_name(&base, budget), suffix)
}

/// Exit reported by the server's shutdown callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientExit {
    pub status: u32,
    pub reason: String,
}

/// One hosted plugin client.
pub struct AudioClient {
    config: ClientConfig,
    plugin: Arc<dyn Plugin>,
    layout: ControlLayout,
    shared: Arc<ClientShared>,
    state: ConnectionState,
    session: Option<Box<dyn Session>>,
    deleted: bool,
}

impl AudioClient {
    /// Build a client from its config entry. Fails on anything the catalog
    /// can refute: an unknown plugin or an unknown, duplicate or missing control.
    pub fn new(config: ClientConfig, catalog: &PluginCatalog) -> Result<Self, ClientError> {
        let plugin = catalog
            .get(config.plugin.unique_id, &config.plugin.label)
            .ok_or_else(|| ClientError::UnknownPlugin {
                label: config.plugin.label.clone(),
                unique_id: config.plugin.unique_id,
            })?;

        let descriptor = plugin.descriptor();
        let ports: Vec<usize> = descriptor.control_inputs().collect();
        let mut layout = ControlLayout {
            names: ports.iter().map(|&p| descriptor.ports[p].name.clone()).collect(),
            smooth: ports.iter().map(|&p| descriptor.ports[p].hint.smooths()).collect(),
            configured: vec![false; ports.len()],
            ports,
        };

        let rate = catalog.sample_rate();
        let mut values: Vec<Option<f64>> = layout
            .ports
            .iter()
            .map(|&p| descriptor.ports[p].hint.default_value(rate).map(f64::from))
            .collect();
        for setting in &config.controls {
            let slot = layout
                .slot(&setting.name)
                .ok_or_else(|| ClientError::UnknownControl {
                    label: descriptor.label.clone(),
                    control: setting.name.clone(),
                })?;
            if layout.configured[slot] {
                return Err(ClientError::DuplicateControl {
                    control: setting.name.clone(),
                });
            }
            layout.configured[slot] = true;
            values[slot] = Some(setting.value);
        }
        let values = values
            .into_iter()
            .zip(&layout.names)
            .map(|(value, name)| {
                value.ok_or_else(|| ClientError::MissingControl {
                    label: descriptor.label.clone(),
                    control: name.clone(),
                })
            })
            .collect::<Result<Vec<f64>, _>>()?;

        let shared = Arc::new(ClientShared {
            name: config.name.clone(),
            pump: MessagePump::new(format!("client \"{}\"", config.name)),
            events: AtomicU32::new(0),
            exited: AtomicBool::new(false),
            exit_status: AtomicU32::new(0),
            exit_reason: Mutex::new(String::with_capacity(EXIT_REASON_CAPACITY)),
            restart: AtomicBool::new(false),
            sample_rate: AtomicU32::new(0),
            controls: Mutex::new(ControlState::new(config.pregain, config.postgain, values)),
        });

        Ok(Self {
            config,
            plugin,
            layout,
            shared,
            state: ConnectionState::Disconnected,
            session: None,
            deleted: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn plugin_ref(&self) -> &PluginRef {
        &self.config.plugin
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Rate negotiated on the last successful connect.
    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate.load(Ordering::Acquire)
    }

    /// Name the server knows this client by, once connected.
    pub fn server_name(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.name())
    }

    pub fn connect(&mut self, server: &dyn AudioServer, ctx: &RuntimeContext) -> Result<(), ClientError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        debug!("connecting client \"{}\" to the audio server", self.config.name);
        self.state = ConnectionState::Connecting;
        self.shared.exited.store(false, Ordering::Release);
        self.shared.exit_status.store(0, Ordering::Release);
        self.shared.restart.store(false, Ordering::Release);

        let full_name = format!("{}{}", ctx.client_prefix(), self.config.name);
        let name = truncate_name(&full_name, server.client_name_size().saturating_sub(1));
        let mut session = match server.open(name) {
            Ok(session) => session,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };

        info!(
            "client \"{}\" connected, got name \"{}\", sample rate {}",
            self.config.name,
            session.name(),
            session.sample_rate()
        );

        match self.attach(session.as_mut(), server.port_name_size(), ctx) {
            Ok(()) => {
                self.session = Some(session);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                if let Err(unregister) = session.unregister_ports() {
                    debug!("client \"{}\": unregistering ports: {}", self.config.name, unregister);
                }
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Instantiate, register ports and activate on an open session.
    fn attach(&mut self, session: &mut dyn Session, port_name_size: usize, ctx: &RuntimeContext) -> Result<(), ClientError> {
        let rate = session.sample_rate();
        self.shared.sample_rate.store(rate, Ordering::Release);

        let descriptor = self.plugin.descriptor();
        let audio_inputs: Vec<usize> = descriptor.audio_ports(PortDirection::Input).collect();
        let audio_outputs: Vec<usize> = descriptor.audio_ports(PortDirection::Output).collect();
        let instances = self.config.instances.max(1);

        let live = {
            let mut state = self.shared.controls();
            for (slot, &port) in self.layout.ports.iter().enumerate() {
                if !self.layout.configured[slot] {
                    if let Some(default) = descriptor.ports[port].hint.default_value(rate) {
                        state.set_value(slot, f64::from(default));
                    }
                }
            }
            state.live(&self.layout.smooth, ctx.smoothing())
        };

        let mut plugin_instances: Vec<Box<dyn PluginInstance>> = Vec::with_capacity(instances);
        let mut ports = Vec::with_capacity(instances);
        for index in 0..instances {
            let step = self
                .plugin
                .instantiate(rate)
                .map_err(ClientError::from)
                .and_then(|mut instance| {
                    instance.activate();
                    plugin_instances.push(instance);

                    let mut register = |plugin_port: usize, direction: PortDirection| {
                        let name = port_name(
                            session.name(),
                            ctx.port_prefix(),
                            &descriptor.ports[plugin_port].name,
                            index,
                            instances,
                            port_name_size,
                        );
                        session.register_port(&name, direction)
                    };
                    let inputs = audio_inputs
                        .iter()
                        .map(|&p| register(p, PortDirection::Input))
                        .collect::<Result<Vec<_>, _>>()?;
                    let outputs = audio_outputs
                        .iter()
                        .map(|&p| register(p, PortDirection::Output))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(InstancePorts { inputs, outputs })
                });

            match step {
                Ok(instance_ports) => ports.push(instance_ports),
                Err(e) => {
                    for instance in &mut plugin_instances {
                        instance.deactivate();
                    }
                    return Err(e);
                }
            }
        }

        let mut controls = vec![0.0; descriptor.ports.len()];
        for (value, &port) in live.controls.iter().zip(&self.layout.ports) {
            controls[port] = value.value();
        }

        let mut processor = ClientProcessor {
            shared: Arc::clone(&self.shared),
            instances: plugin_instances,
            ports,
            audio_inputs,
            audio_outputs,
            control_ports: self.layout.ports.clone(),
            live,
            controls,
            audio: vec![Vec::new(); descriptor.ports.len()],
            capacity: 0,
            sample_rate: rate,
            block: smoothing_block(rate),
        };
        processor.resize(session.buffer_size());

        let notifications = Arc::new(ClientNotifications {
            shared: Arc::clone(&self.shared),
        });
        session.activate(Box::new(processor), notifications)?;
        Ok(())
    }

    /// Tear the connection down. Safe on a disconnected client.
    ///
    /// Port unregistration is skipped when the server already shut this
    /// client down, unregistering against a dead connection can hang.
    pub fn disconnect(&mut self, unregister_ports: bool) {
        if let Some(mut session) = self.session.take() {
            match session.deactivate() {
                Ok(processor) => drop(processor),
                Err(e) => error!("client \"{}\": deactivating: {}", self.config.name, e),
            }

            if unregister_ports && !self.shared.exited.load(Ordering::Acquire) {
                if let Err(e) = session.unregister_ports() {
                    error!("client \"{}\": unregistering ports: {}", self.config.name, e);
                }
            }

            drop(session);
            info!("client \"{}\" disconnected", self.config.name);
        }

        self.state = ConnectionState::Disconnected;
        self.shared.exited.store(false, Ordering::Release);
        self.shared.exit_status.store(0, Ordering::Release);
    }

    /// The server shut this client down, if it did.
    pub fn exit(&self) -> Option<ClientExit> {
        if !self.shared.exited.load(Ordering::Acquire) {
            return None;
        }
        let status = self.shared.exit_status.load(Ordering::Acquire);
        let reason = self
            .shared
            .exit_reason
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default();
        Some(ClientExit { status, reason })
    }

    pub fn mark_restart(&self) {
        self.shared.restart.store(true, Ordering::Release);
    }

    pub fn needs_restart(&self) -> bool {
        self.shared.restart.load(Ordering::Acquire)
    }

    pub fn clear_restart(&self) {
        self.shared.restart.store(false, Ordering::Release);
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn update_gain(&mut self, pregain: f64, postgain: f64) {
        self.config.pregain = pregain;
        self.config.postgain = postgain;
        self.shared.controls().set_gains(pregain, postgain);
    }

    /// Queue new control values. Nothing is applied unless every name is known.
    pub fn update_controls(&mut self, settings: &[ControlSetting]) -> Result<(), ClientError> {
        let mut slots = Vec::with_capacity(settings.len());
        for setting in settings {
            let slot = self
                .layout
                .slot(&setting.name)
                .ok_or_else(|| ClientError::UnknownControl {
                    label: self.config.plugin.label.clone(),
                    control: setting.name.clone(),
                })?;
            if slots.contains(&slot) {
                return Err(ClientError::DuplicateControl {
                    control: setting.name.clone(),
                });
            }
            slots.push(slot);
        }

        let mut state = self.shared.controls();
        for (setting, slot) in settings.iter().zip(slots) {
            state.set_value(slot, setting.value);
            self.layout.configured[slot] = true;
            match self.config.controls.iter_mut().find(|c| c.name == setting.name) {
                Some(existing) => existing.value = setting.value,
                None => self.config.controls.push(setting.clone()),
            }
        }
        Ok(())
    }

    /// A new instance count takes effect on the next connect.
    pub fn set_instances(&mut self, instances: usize) {
        if instances != self.config.instances {
            self.config.instances = instances;
            if self.is_connected() {
                self.mark_restart();
            }
        }
    }

    /// Current control values by name.
    pub fn control_values(&self) -> Vec<(String, f64)> {
        let state = self.shared.controls();
        self.layout
            .names
            .iter()
            .cloned()
            .zip(state.values().iter().copied())
            .collect()
    }

    pub fn to_json(&self) -> Value {
        let (pregain, postgain) = self.shared.controls().gains();
        let controls: Vec<Value> = self
            .control_values()
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        json!({
            "name": self.config.name,
            "plugin": {
                "label": self.config.plugin.label,
                "unique_id": self.config.plugin.unique_id,
            },
            "instances": self.config.instances,
            "pregain": pregain,
            "postgain": postgain,
            "connected": self.is_connected(),
            "sample_rate": self.sample_rate(),
            "controls": controls,
        })
    }
}

impl MessageSource for AudioClient {
    fn pump(&self) -> &MessagePump {
        &self.shared.pump
    }

    fn after_confirm(&self, msg: Message) {
        debug!("client \"{}\": confirmed {}", self.shared.name, msg);
    }
}

impl Drop for AudioClient {
    fn drop(&mut self) {
        self.disconnect(true);
    }
}
