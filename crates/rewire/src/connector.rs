//! Port auto-connector.
//!
//! Applies the routing rules to the live graph when the scheduler asks for
//! it. Each pass opens its own short-lived session, takes a snapshot, acts
//! on it and closes the session again. A session that stayed open would be
//! one more client the server has to notify on shutdown.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::context::RuntimeContext;
use crate::matcher::{connect_actions, disconnect_actions, ConnectionRule, PortAction};
use crate::routing::RoutingState;
use crate::scheduler::CheckFlags;
use crate::server::{truncate_name, AudioServer, GraphSnapshot, ServerError, Session};

pub struct PortConnector {
    routing: Arc<RoutingState>,
    name: String,
    /// The last attempt to reach the server failed
    failing: bool,
    /// Log every failed attempt as an error
    verbose: bool,
}

impl PortConnector {
    pub fn new(routing: Arc<RoutingState>, ctx: &RuntimeContext) -> Self {
        Self {
            routing,
            name: format!("{}portconnector", ctx.client_prefix()),
            failing: false,
            verbose: ctx.debug(),
        }
    }

    pub fn routing(&self) -> &Arc<RoutingState> {
        &self.routing
    }

    /// Run whichever passes `flags` asks for. A flag is cleared only when its
    /// pass fully succeeded, so failures are retried by the scheduler.
    pub fn process(&mut self, server: &dyn AudioServer, flags: &mut CheckFlags) {
        if !flags.pending() {
            return;
        }

        let name = truncate_name(&self.name, server.client_name_size().saturating_sub(1));
        let session = match server.open(name) {
            Ok(session) => {
                if self.failing {
                    info!("port connector connected to the audio server");
                    self.failing = false;
                }
                session
            }
            Err(e) => {
                if self.note_failure() {
                    error!("port connector: error connecting to the audio server: {}", e);
                } else {
                    debug!("port connector: error connecting to the audio server: {}", e);
                }
                self.routing.clear_ports();
                return;
            }
        };

        let snapshot = match session.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("port connector: cannot list ports: {}", e);
                return;
            }
        };

        if flags.ports {
            self.routing.publish_ports(snapshot.ports().to_vec());
            flags.ports = false;
        }

        let (rules, removed) = self.routing.rules();

        if flags.connect && connect_pass(session.as_ref(), &snapshot, &rules) {
            flags.connect = false;
        }

        if flags.disconnect {
            // The connect pass may have changed the graph
            let snapshot = match session.snapshot() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!("port connector: cannot list ports: {}", e);
                    return;
                }
            };
            if disconnect_pass(session.as_ref(), &snapshot, &rules, &removed) {
                flags.disconnect = false;
            }
            self.routing.clear_removed(&removed);
        }
    }

    /// Record a failed attempt to reach the server. Returns true when it
    /// deserves an error line: the first of a run, or any in verbose mode.
    fn note_failure(&mut self) -> bool {
        let first = !self.failing;
        self.failing = true;
        first || self.verbose
    }

    /// Wake anything waiting on the port list.
    pub fn stop(&mut self) {
        self.routing.stop();
    }
}

fn connect_pass(session: &dyn Session, snapshot: &GraphSnapshot, rules: &[ConnectionRule]) -> bool {
    let mut success = true;
    for action in connect_actions(snapshot, rules) {
        let PortAction::Connect { output, input } = action else {
            continue;
        };
        match session.connect(&output, &input) {
            Ok(()) => info!("connected port \"{}\" to port \"{}\"", output, input),
            Err(ServerError::AlreadyConnected { .. }) => {
                debug!("port \"{}\" already connected to \"{}\"", output, input)
            }
            Err(e) => {
                warn!("{}", e);
                success = false;
            }
        }
    }
    success
}

fn disconnect_pass(
    session: &dyn Session,
    snapshot: &GraphSnapshot,
    rules: &[ConnectionRule],
    removed: &[ConnectionRule],
) -> bool {
    let mut success = true;
    for action in disconnect_actions(snapshot, rules, removed) {
        let PortAction::Disconnect { output, input } = action else {
            continue;
        };
        match session.disconnect(&output, &input) {
            Ok(()) => info!("disconnected port \"{}\" from port \"{}\"", output, input),
            Err(e) => {
                error!("{}", e);
                success = false;
            }
        }
    }
    success
}
