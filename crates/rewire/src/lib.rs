//! Rewire: JACK plugin host with rule-based port routing
//!
//! Hosts audio plugins as JACK clients and keeps the graph patched according
//! to a list of regex rules, across server restarts and sample-rate changes.
//!
//! Two execution contexts meet here:
//!
//! - **Realtime**: the audio server's process callback, one per hosted client.
//!   It never blocks. Events leave it through a [`MessagePump`].
//! - **Control**: a single thread running the [`Scheduler`], which polls every
//!   pump, signal and client descriptor and reconciles state on wakeup.
//!
//! The status server runs on its own thread and talks to the control thread
//! only through queues and pumps.

pub mod builtin;
pub mod client;
pub mod connector;
pub mod context;
pub mod control;
pub mod manager;
pub mod matcher;
pub mod message;
pub mod plugin;
pub mod routing;
pub mod scheduler;
pub mod server;
pub mod signals;
pub mod status;

pub use client::{AudioClient, ClientError, ClientExit, ConnectionState};
pub use connector::PortConnector;
pub use context::{Intervals, RuntimeContext};
pub use control::{ControlState, LiveControls, SmoothedValue};
pub use manager::{ClientRegistry, ClientUpdate, ClientsManager, ProcessOutcome};
pub use matcher::{connect_actions, disconnect_actions, ConnectionRule, PortAction, RuleError};
pub use message::{Delivery, Message, MessagePump, MessageSource, PumpBusy};
pub use plugin::{Plugin, PluginCatalog, PluginDescriptor, PluginError, PluginInstance};
pub use routing::RoutingState;
pub use scheduler::{Backoff, CheckFlags, Scheduler};
pub use server::jack::JackServer;
pub use server::memory::MemoryServer;
pub use server::{AudioServer, GraphSnapshot, PortDirection, PortInfo, ServerError, Session};
pub use signals::{SignalEvents, Signals};
pub use status::{StatusServer, StatusState};
