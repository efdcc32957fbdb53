//! HTTP status interface.
//!
//! A small JSON API over the shared routing state, the client registry and
//! the plugin catalog. It runs on its own thread with a current-thread tokio
//! runtime and never touches clients or the audio server directly: changes
//! are queued for the control thread.
//!
//! | Route              | Method | Body                       |
//! |--------------------|--------|----------------------------|
//! | `/clients`         | GET    |                            |
//! | `/clients`         | POST   | `{"clients": [update...]}` |
//! | `/connections`     | GET    |                            |
//! | `/connections`     | POST   | `{"connections": [...]}`   |
//! | `/ports`           | GET    |                            |
//! | `/ports`           | POST   | `{"index": n, "timeout": ms}` |
//! | `/plugins`         | GET    |                            |

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rewireconf::ConnectionConfig;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::manager::{ClientRegistry, ClientUpdate};
use crate::plugin::PluginCatalog;
use crate::routing::RoutingState;

/// Shared state for status handlers
#[derive(Clone)]
pub struct StatusState {
    pub routing: Arc<RoutingState>,
    pub registry: Arc<ClientRegistry>,
    pub catalog: Arc<PluginCatalog>,
}

struct NotFound(String);

impl IntoResponse for NotFound {
    fn into_response(self) -> Response {
        (StatusCode::NOT_FOUND, Json(json!({ "error": self.0 }))).into_response()
    }
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route(
            "/clients",
            get(get_clients).post(post_clients).fallback(method_not_found),
        )
        .route(
            "/connections",
            get(get_connections)
                .post(post_connections)
                .fallback(method_not_found),
        )
        .route("/ports", get(get_ports).post(post_ports).fallback(method_not_found))
        .route("/plugins", get(get_plugins).fallback(method_not_found))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> NotFound {
    NotFound("no such resource".to_string())
}

async fn method_not_found() -> NotFound {
    NotFound("no such method for this resource".to_string())
}

/// Parse `{"<key>": [entry...]}`, dropping entries that fail to parse or validate.
fn parse_entries<T, F>(body: &[u8], key: &str, validate: F) -> Result<Vec<T>, NotFound>
where
    T: DeserializeOwned,
    F: Fn(&T) -> Result<(), rewireconf::EntryError>,
{
    let mut document: Value =
        serde_json::from_slice(body).map_err(|e| NotFound(format!("invalid JSON: {e}")))?;
    let Some(Value::Array(entries)) = document.get_mut(key).map(Value::take) else {
        return Err(NotFound(format!("expected a \"{key}\" array")));
    };

    let mut parsed = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<T>(entry) {
            Ok(item) => match validate(&item) {
                Ok(()) => parsed.push(item),
                Err(e) => warn!("skipping {} entry {}: {}", key, index, e),
            },
            Err(e) => warn!("skipping {} entry {}: {}", key, index, e),
        }
    }
    Ok(parsed)
}

async fn get_clients(State(state): State<StatusState>) -> Json<Value> {
    Json(state.registry.clients_json())
}

async fn post_clients(State(state): State<StatusState>, body: Bytes) -> Result<Json<Value>, NotFound> {
    let updates: Vec<ClientUpdate> = parse_entries(&body, "clients", ClientUpdate::validate)?;
    let queued = state.registry.push(updates);
    debug!("queued {} client updates", queued);
    Ok(Json(json!({ "queued": queued })))
}

async fn get_connections(State(state): State<StatusState>) -> Json<Value> {
    Json(state.routing.connections_json())
}

async fn post_connections(
    State(state): State<StatusState>,
    body: Bytes,
) -> Result<Json<Value>, NotFound> {
    let connections: Vec<ConnectionConfig> =
        parse_entries(&body, "connections", ConnectionConfig::validate)?;
    state.routing.replace_rules(connections);
    Ok(Json(state.routing.connections_json()))
}

async fn get_ports(State(state): State<StatusState>) -> Json<Value> {
    Json(state.routing.ports_json())
}

#[derive(Debug, Deserialize)]
struct PortWait {
    index: u64,
    #[serde(default)]
    timeout: u64,
}

async fn post_ports(State(state): State<StatusState>, body: Bytes) -> Result<Json<Value>, NotFound> {
    let wait: PortWait =
        serde_json::from_slice(&body).map_err(|e| NotFound(format!("invalid port request: {e}")))?;
    let reply = state
        .routing
        .wait_for_ports(wait.index, Duration::from_millis(wait.timeout))
        .await;
    Ok(Json(reply))
}

async fn get_plugins(State(state): State<StatusState>) -> Json<Value> {
    Json(state.catalog.to_json())
}

struct Running {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

/// The status server thread and its restart pacing.
pub struct StatusServer {
    port: u16,
    state: StatusState,
    running: Option<Running>,
    last_attempt: Option<Instant>,
}

impl StatusServer {
    pub fn new(port: u16, state: StatusState) -> Self {
        Self {
            port,
            state,
            running: None,
            last_attempt: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.thread.is_finished())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    /// Start the server unless it runs or the last attempt was less than
    /// `retry` ago.
    pub fn ensure_running(&mut self, retry: Duration) {
        if self.is_running() {
            return;
        }
        if self.last_attempt.is_some_and(|t| t.elapsed() < retry) {
            return;
        }
        self.last_attempt = Some(Instant::now());
        if let Some(stale) = self.running.take() {
            let _ = stale.thread.join();
        }

        match self.start() {
            Ok(running) => {
                info!("status server listening on {}", running.addr);
                self.running = Some(running);
            }
            Err(e) => error!("status server: cannot listen on port {}: {:#}", self.port, e),
        }
    }

    fn start(&self) -> anyhow::Result<Running> {
        use anyhow::Context;

        let listener = TcpListener::bind(("0.0.0.0", self.port)).context("bind")?;
        listener.set_nonblocking(true).context("set non-blocking")?;
        let addr = listener.local_addr().context("local address")?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let app = router(self.state.clone());
        let thread = thread::Builder::new()
            .name("status".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("status server: cannot build runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!("status server: {}", e);
                            return;
                        }
                    };
                    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                        let _ = shutdown_rx.await;
                        debug!("status server shutdown signal received");
                    });
                    if let Err(e) = server.await {
                        error!("status server stopped with error: {}", e);
                    }
                });
            })
            .context("spawn thread")?;

        Ok(Running {
            addr,
            shutdown,
            thread,
        })
    }

    /// Wake long-poll waiters, shut down gracefully and join the thread.
    pub fn stop(&mut self) {
        self.state.routing.stop();
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(());
            if running.thread.join().is_err() {
                error!("status server thread panicked");
            }
            info!("status server stopped");
        }
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        self.stop();
    }
}
