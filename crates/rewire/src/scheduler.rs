//! Top-level scheduler.
//!
//! One thread, one blocking call. Each iteration runs the clients manager
//! and the port connector, works out how long it may sleep, then polls
//! every descriptor it knows about: signals, the routing and registry
//! pumps and one pump per client.
//!
//! The sleep follows a small backoff machine:
//!
//! ```text
//!  checks pending        ──► retry, doubling every iteration, capped at reconnect
//!  idle, clients down    ──► reconnect
//!  idle, all connected   ──► forever
//! ```

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rewireconf::RewireConfig;
use tracing::{debug, error, info, warn};

use crate::connector::PortConnector;
use crate::context::{Intervals, RuntimeContext};
use crate::manager::{ClientRegistry, ClientsManager};
use crate::message::{Message, MessageSource};
use crate::plugin::PluginCatalog;
use crate::routing::RoutingState;
use crate::server::AudioServer;
use crate::signals::Signals;
use crate::status::{StatusServer, StatusState};

/// Work the scheduler still owes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckFlags {
    /// Run the connect pass
    pub connect: bool,
    /// Run the disconnect pass
    pub disconnect: bool,
    /// Refresh the published port list
    pub ports: bool,
    /// Retry disconnected clients without waiting for the reconnect interval
    pub clients: bool,
}

impl CheckFlags {
    /// Everything, used at startup and after a reload.
    pub fn all() -> Self {
        Self {
            connect: true,
            disconnect: true,
            ports: true,
            clients: true,
        }
    }

    pub fn dispatch(&mut self, msg: Message) {
        match msg {
            Message::ConnectionsUpdated => {
                self.connect = true;
                self.disconnect = true;
            }
            Message::PortRegistered => {
                self.ports = true;
                self.connect = true;
            }
            Message::PortDeregistered => self.ports = true,
            Message::PortConnected => self.disconnect = true,
            Message::PortDisconnected => self.connect = true,
            Message::Exited => {
                self.ports = true;
                self.clients = true;
            }
            Message::SampleRateChanged | Message::CheckClients => self.clients = true,
        }
    }

    /// Checks that keep the retry backoff going.
    pub fn pending(&self) -> bool {
        self.connect || self.disconnect || self.ports
    }
}

/// Retry timeout state.
#[derive(Debug, Clone)]
pub struct Backoff {
    retry: Duration,
    reconnect: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(intervals: Intervals) -> Self {
        Self {
            retry: intervals.retry,
            reconnect: intervals.reconnect,
            current: None,
        }
    }

    /// Next wait. `None` means wait until something happens.
    pub fn next(&mut self, pending: bool, settled: bool) -> Option<Duration> {
        if pending {
            let wait = match self.current {
                Some(current) => (current * 2).min(self.reconnect),
                None => self.retry,
            };
            self.current = Some(wait);
            return Some(wait);
        }

        self.current = None;
        if settled {
            None
        } else {
            Some(self.reconnect)
        }
    }
}

/// Which descriptor a poll slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Signals,
    Routing,
    Registry,
    Client,
}

pub struct Scheduler {
    ctx: Arc<RuntimeContext>,
    server: Box<dyn AudioServer>,
    manager: ClientsManager,
    connector: PortConnector,
    routing: Arc<RoutingState>,
    registry: Arc<ClientRegistry>,
    status: StatusServer,
    signals: Option<Signals>,
    config_path: Option<PathBuf>,
    flags: CheckFlags,
    backoff: Backoff,
}

impl Scheduler {
    pub fn new(
        ctx: Arc<RuntimeContext>,
        server: Box<dyn AudioServer>,
        catalog: Arc<PluginCatalog>,
        config: &RewireConfig,
    ) -> Self {
        let routing = Arc::new(RoutingState::new());
        let registry = Arc::new(ClientRegistry::new());
        let mut manager = ClientsManager::new(Arc::clone(&catalog), Arc::clone(&registry));
        manager.apply_config(&config.clients);
        routing.replace_rules(config.connections.clone());

        let status = StatusServer::new(
            config.daemon.http_port,
            StatusState {
                routing: Arc::clone(&routing),
                registry: Arc::clone(&registry),
                catalog,
            },
        );

        Self {
            connector: PortConnector::new(Arc::clone(&routing), &ctx),
            backoff: Backoff::new(ctx.intervals()),
            ctx,
            server,
            manager,
            routing,
            registry,
            status,
            signals: None,
            config_path: None,
            flags: CheckFlags::all(),
        }
    }

    /// Poll `signals` for stop and reload requests.
    pub fn with_signals(mut self, signals: Signals) -> Self {
        self.signals = Some(signals);
        self
    }

    /// File to reload on SIGHUP, next to the usual discovery paths.
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn manager(&self) -> &ClientsManager {
        &self.manager
    }

    pub fn routing(&self) -> &Arc<RoutingState> {
        &self.routing
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn status(&self) -> &StatusServer {
        &self.status
    }

    pub fn flags(&self) -> CheckFlags {
        self.flags
    }

    /// Run until a stop is requested.
    pub fn run(&mut self) {
        info!("scheduler running");
        while !self.ctx.should_stop() {
            self.iterate(None);
        }
        info!("scheduler stopping");
    }

    /// One iteration. `max_wait` caps the poll timeout. Returns the timeout
    /// the backoff asked for.
    pub fn iterate(&mut self, max_wait: Option<Duration>) -> Option<Duration> {
        let intervals = self.ctx.intervals();
        self.status.ensure_running(intervals.reconnect);

        self.manager.apply_updates();
        if self.flags.clients {
            self.manager.expedite();
            self.flags.clients = false;
        }
        let outcome = self.manager.process(self.server.as_ref(), &self.ctx);

        self.connector.process(self.server.as_ref(), &mut self.flags);

        let timeout = self
            .backoff
            .next(self.flags.pending(), outcome.all_connected && self.status.is_running());
        let wait = match (timeout, max_wait) {
            (Some(t), Some(m)) => Some(t.min(m)),
            (t, None) => t,
            (None, m) => m,
        };
        debug!("waiting {:?}", wait);

        self.wait(wait);
        timeout
    }

    fn wait(&mut self, timeout: Option<Duration>) {
        let mut sources = Vec::new();
        let mut fds = Vec::new();
        if let Some(signals) = &self.signals {
            for fd in signals.fds() {
                sources.push(Source::Signals);
                fds.push(fd);
            }
        }
        if let Some(fd) = self.routing.pump().fd() {
            sources.push(Source::Routing);
            fds.push(fd);
        }
        if let Some(fd) = self.registry.pump().fd() {
            sources.push(Source::Registry);
            fds.push(fd);
        }
        for fd in self.manager.fds() {
            sources.push(Source::Client);
            fds.push(fd);
        }

        let ready = match poll(&fds, timeout) {
            Ok(ready) => ready,
            Err(e) => {
                error!("poll failed: {}", e);
                return;
            }
        };
        let readable = |source: Source| {
            sources
                .iter()
                .zip(&ready)
                .any(|(s, r)| *s == source && *r)
        };

        if readable(Source::Signals) {
            if let Some(signals) = self.signals.as_mut() {
                let events = signals.drain();
                if events.stop {
                    self.ctx.request_stop();
                }
                if events.reload {
                    self.reload();
                }
            }
        }
        if readable(Source::Client) {
            self.manager.drain_messages(&mut self.flags);
        }
        if readable(Source::Routing) {
            drain_source(self.routing.as_ref(), &mut self.flags);
        }
        if readable(Source::Registry) {
            drain_source(self.registry.as_ref(), &mut self.flags);
        }
    }

    /// Load the configuration again and apply clients and rules.
    pub fn reload(&mut self) {
        match RewireConfig::load_with_sources_from(self.config_path.as_deref()) {
            Ok((config, sources)) => {
                for rejected in &sources.rejected {
                    warn!("{}", rejected);
                }
                self.manager.apply_config(&config.clients);
                self.routing.replace_rules(config.connections);
                self.flags = CheckFlags::all();
                info!("configuration reloaded from {} files", sources.files.len());
            }
            Err(e) => error!("reload failed, keeping the current configuration: {}", e),
        }
    }

    /// Ordered teardown: port connector, then clients, then status server.
    pub fn shutdown(&mut self) {
        info!("shutting down");
        self.connector.stop();
        self.manager.stop();
        self.status.stop();
    }
}

fn drain_source(source: &dyn MessageSource, flags: &mut CheckFlags) {
    while let Some(msg) = source.get_message() {
        debug!("{}: got message {}", source.pump().name(), msg);
        source.confirm_message(msg);
        flags.dispatch(msg);
    }
}

/// Wait for any of `fds` to become readable. Returns one flag per descriptor.
/// An interrupted wait counts as a wakeup with nothing ready.
fn poll(fds: &[RawFd], timeout: Option<Duration>) -> std::io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = match timeout {
        None => -1,
        Some(t) if t.is_zero() => 0,
        Some(t) => t.as_millis().clamp(1, i32::MAX as u128) as i32,
    };

    // SAFETY: pollfds is a valid, exclusively borrowed array of its length
    let result = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if result < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(err);
    }

    Ok(pollfds
        .iter()
        .map(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intervals() -> Intervals {
        Intervals {
            reconnect: Duration::from_millis(1000),
            retry: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_dispatch_table() {
        let mut flags = CheckFlags::default();
        flags.dispatch(Message::PortRegistered);
        assert_eq!(
            flags,
            CheckFlags {
                ports: true,
                connect: true,
                ..Default::default()
            }
        );

        let mut flags = CheckFlags::default();
        flags.dispatch(Message::PortConnected);
        assert!(flags.disconnect && !flags.connect);

        let mut flags = CheckFlags::default();
        flags.dispatch(Message::CheckClients);
        assert!(flags.clients && !flags.pending());
    }

    #[test]
    fn test_backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(intervals());
        let waits: Vec<u64> = (0..6)
            .map(|_| backoff.next(true, false).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(waits, vec![100, 200, 400, 800, 1000, 1000]);

        assert_eq!(backoff.next(false, true), None);
        assert_eq!(backoff.next(true, true), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_backoff_idle_but_disconnected() {
        let mut backoff = Backoff::new(intervals());
        assert_eq!(backoff.next(false, false), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_poll_sees_readable_pump() {
        let routing = RoutingState::new();
        let fd = routing.pump().fd().unwrap();
        assert_eq!(poll(&[fd], Some(Duration::ZERO)).unwrap(), vec![false]);

        routing.replace_rules(Vec::new());
        assert_eq!(poll(&[fd], Some(Duration::from_millis(100))).unwrap(), vec![true]);
    }
}
