//! JACK implementation of the audio server traits.

use std::mem;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use super::{
    AudioServer, GraphSnapshot, Notifications, PortBuffers, PortDirection, PortId, PortInfo,
    Process, ServerError, Session,
};

/// Client and port name sizes from `jack_client_name_size()` and
/// `jack_port_name_size()`, terminator included. `None` when libjack could
/// not be loaded, in which case every `open` fails anyway.
fn name_sizes() -> Option<(usize, usize)> {
    static SIZES: OnceLock<Option<(usize, usize)>> = OnceLock::new();
    *SIZES.get_or_init(|| match jack_sys::library() {
        Ok(_) => Some((*::jack::CLIENT_NAME_SIZE + 1, *::jack::PORT_NAME_SIZE + 1)),
        Err(e) => {
            debug!("cannot load libjack: {}", e);
            None
        }
    })
}

/// Sizes of a stock JACK build, used only when libjack is missing.
const FALLBACK_SIZES: (usize, usize) = (64, 320);

/// Connects to the running JACK server. Never starts one.
#[derive(Debug, Default, Clone, Copy)]
pub struct JackServer;

impl AudioServer for JackServer {
    fn open(&self, name: &str) -> Result<Box<dyn Session>, ServerError> {
        let (client, status) = ::jack::Client::new(name, ::jack::ClientOptions::NO_START_SERVER)
            .map_err(|e| ServerError::Unavailable(e.to_string()))?;
        debug!("opened jack client \"{}\" (status {:?})", client.name(), status);

        Ok(Box::new(JackSession {
            name: client.name().to_string(),
            state: State::Inactive(client),
            ports: Vec::new(),
        }))
    }

    fn client_name_size(&self) -> usize {
        name_sizes().unwrap_or(FALLBACK_SIZES).0
    }

    fn port_name_size(&self) -> usize {
        name_sizes().unwrap_or(FALLBACK_SIZES).1
    }
}

enum JackPort {
    Input(::jack::Port<::jack::AudioIn>),
    Output(::jack::Port<::jack::AudioOut>),
}

enum State {
    Inactive(::jack::Client),
    Active(::jack::AsyncClient<JackNotifications, JackProcess>),
    Closed,
}

/// Ports live here while inactive and move into [`JackProcess`] while active.
pub struct JackSession {
    name: String,
    state: State,
    ports: Vec<JackPort>,
}

impl JackSession {
    fn client(&self) -> Result<&::jack::Client, ServerError> {
        match &self.state {
            State::Inactive(client) => Ok(client),
            State::Active(active) => Ok(active.as_client()),
            State::Closed => Err(ServerError::Closed),
        }
    }
}

impl Session for JackSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.client().map(|c| c.sample_rate() as u32).unwrap_or(0)
    }

    fn buffer_size(&self) -> usize {
        self.client().map(|c| c.buffer_size() as usize).unwrap_or(0)
    }

    fn register_port(&mut self, name: &str, direction: PortDirection) -> Result<PortId, ServerError> {
        let State::Inactive(client) = &self.state else {
            return Err(ServerError::Active);
        };

        let registration = |e: ::jack::Error| ServerError::Registration {
            port: name.to_string(),
            reason: e.to_string(),
        };
        let port = match direction {
            PortDirection::Input => JackPort::Input(
                client
                    .register_port(name, ::jack::AudioIn::default())
                    .map_err(registration)?,
            ),
            PortDirection::Output => JackPort::Output(
                client
                    .register_port(name, ::jack::AudioOut::default())
                    .map_err(registration)?,
            ),
        };

        self.ports.push(port);
        Ok(PortId(self.ports.len() - 1))
    }

    fn activate(
        &mut self,
        process: Box<dyn Process>,
        notifications: Arc<dyn Notifications>,
    ) -> Result<(), ServerError> {
        let client = match mem::replace(&mut self.state, State::Closed) {
            State::Inactive(client) => client,
            other => {
                self.state = other;
                return Err(ServerError::Active);
            }
        };

        let handler = JackProcess {
            process,
            ports: mem::take(&mut self.ports),
        };
        let active = client
            .activate_async(JackNotifications { inner: notifications }, handler)
            .map_err(|e| ServerError::Activation {
                client: self.name.clone(),
                reason: e.to_string(),
            })?;

        self.state = State::Active(active);
        Ok(())
    }

    fn deactivate(&mut self) -> Result<Option<Box<dyn Process>>, ServerError> {
        match mem::replace(&mut self.state, State::Closed) {
            State::Active(active) => {
                let (client, _notifications, handler) = active
                    .deactivate()
                    .map_err(|e| ServerError::Unavailable(e.to_string()))?;
                self.ports = handler.ports;
                self.state = State::Inactive(client);
                Ok(Some(handler.process))
            }
            other => {
                self.state = other;
                Ok(None)
            }
        }
    }

    fn unregister_ports(&mut self) -> Result<(), ServerError> {
        let State::Inactive(client) = &self.state else {
            self.ports.clear();
            return Err(ServerError::Closed);
        };

        let mut result = Ok(());
        for port in self.ports.drain(..) {
            let unregistered = match port {
                JackPort::Input(port) => client.unregister_port(port),
                JackPort::Output(port) => client.unregister_port(port),
            };
            if let Err(e) = unregistered {
                result = Err(ServerError::Unavailable(e.to_string()));
            }
        }
        result
    }

    fn snapshot(&self) -> Result<GraphSnapshot, ServerError> {
        let client = self.client()?;

        let mut ports = Vec::new();
        for name in client.ports(None, None, ::jack::PortFlags::empty()) {
            // A port can vanish between listing and lookup
            let Some(port) = client.port_by_name(&name) else {
                debug!("port \"{}\" disappeared during snapshot", name);
                continue;
            };
            let direction = if port.flags().contains(::jack::PortFlags::IS_INPUT) {
                PortDirection::Input
            } else {
                PortDirection::Output
            };
            ports.push(PortInfo {
                connections: port.get_connections(),
                name,
                direction,
            });
        }

        Ok(GraphSnapshot::new(ports))
    }

    fn connect(&self, output: &str, input: &str) -> Result<(), ServerError> {
        self.client()?
            .connect_ports_by_name(output, input)
            .map_err(|e| match e {
                ::jack::Error::PortAlreadyConnected(..) => ServerError::AlreadyConnected {
                    output: output.to_string(),
                    input: input.to_string(),
                },
                e => ServerError::Connection {
                    action: "connect",
                    output: output.to_string(),
                    input: input.to_string(),
                    reason: e.to_string(),
                },
            })
    }

    fn disconnect(&self, output: &str, input: &str) -> Result<(), ServerError> {
        self.client()?
            .disconnect_ports_by_name(output, input)
            .map_err(|e| ServerError::Connection {
                action: "disconnect",
                output: output.to_string(),
                input: input.to_string(),
                reason: e.to_string(),
            })
    }
}

struct JackProcess {
    process: Box<dyn Process>,
    ports: Vec<JackPort>,
}

impl ::jack::ProcessHandler for JackProcess {
    fn process(&mut self, _: &::jack::Client, scope: &::jack::ProcessScope) -> ::jack::Control {
        let mut buffers = JackBuffers {
            ports: &mut self.ports,
            scope,
        };
        self.process.process(&mut buffers);
        ::jack::Control::Continue
    }

    fn buffer_size(&mut self, _: &::jack::Client, size: ::jack::Frames) -> ::jack::Control {
        self.process.buffer_size(size as usize);
        ::jack::Control::Continue
    }
}

struct JackBuffers<'a> {
    ports: &'a mut [JackPort],
    scope: &'a ::jack::ProcessScope,
}

impl PortBuffers for JackBuffers<'_> {
    fn frames(&self) -> usize {
        self.scope.n_frames() as usize
    }

    fn input(&self, port: PortId) -> &[f32] {
        match self.ports.get(port.0) {
            Some(JackPort::Input(port)) => port.as_slice(self.scope),
            _ => &[],
        }
    }

    fn output(&mut self, port: PortId) -> &mut [f32] {
        match self.ports.get_mut(port.0) {
            Some(JackPort::Output(port)) => port.as_mut_slice(self.scope),
            _ => &mut [],
        }
    }
}

struct JackNotifications {
    inner: Arc<dyn Notifications>,
}

impl ::jack::NotificationHandler for JackNotifications {
    unsafe fn shutdown(&mut self, status: ::jack::ClientStatus, reason: &str) {
        self.inner.shutdown(status.bits() as u32, reason);
    }

    fn sample_rate(&mut self, _: &::jack::Client, srate: ::jack::Frames) -> ::jack::Control {
        self.inner.sample_rate(srate as u32);
        ::jack::Control::Continue
    }

    fn port_registration(&mut self, _: &::jack::Client, _port_id: ::jack::PortId, is_registered: bool) {
        self.inner.port_registration(is_registered);
    }

    fn ports_connected(
        &mut self,
        _: &::jack::Client,
        _port_id_a: ::jack::PortId,
        _port_id_b: ::jack::PortId,
        are_connected: bool,
    ) {
        self.inner.port_connection(are_connected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_sizes_follow_the_library() {
        let server = JackServer;
        match name_sizes() {
            Some(_) => {
                assert_eq!(server.client_name_size(), *::jack::CLIENT_NAME_SIZE + 1);
                assert_eq!(server.port_name_size(), *::jack::PORT_NAME_SIZE + 1);
            }
            None => {
                assert_eq!(server.client_name_size(), FALLBACK_SIZES.0);
                assert_eq!(server.port_name_size(), FALLBACK_SIZES.1);
            }
        }
    }
}
