//! WebSocket relay between clients and the hub

pub mod clients;
pub mod dispatch;
pub mod messages;
pub mod safety;

pub use clients::{CallKey, CallStart, ClientId, ClientRegistry, Delivery};
pub use dispatch::{CallOutcome, Dispatcher};
pub use messages::{ClientMessage, ServerMessage, ToolResultFrame};
pub use safety::{ConfirmationRequest, SafetyGate};

use crate::cache::canonical_json;
use crate::config::RelayConfig;
use crate::core::protocol::RequestId;
use crate::utils::errors::{HubError, HubResult};
use crate::utils::shutdown::ShutdownCoordinator;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const GREETING: &str = "Connected to MCP Hub";

struct RelayState {
    dispatcher: Arc<Dispatcher>,
    clients: Arc<ClientRegistry>,
    started_at: Instant,
}

/// Accepts WebSocket clients and relays their tool calls to the hub
pub struct RelayServer {
    state: Arc<RelayState>,
    sweep_interval: Duration,
}

impl RelayServer {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &RelayConfig) -> Self {
        let clients = Arc::new(ClientRegistry::new(
            Duration::from_secs(config.dedup_window_secs),
            Duration::from_secs(config.caller_ttl_secs),
        ));
        Self {
            state: Arc::new(RelayState {
                dispatcher,
                clients,
                started_at: Instant::now(),
            }),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.state.clients
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Expire relay bookkeeping until shutdown
    pub fn spawn_sweeper(&self, shutdown: ShutdownCoordinator) -> JoinHandle<()> {
        let clients = self.state.clients.clone();
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = clients.sweep();
                        if removed > 0 {
                            debug!("Expired {} relay records", removed);
                        }
                    }
                    _ = shutdown.wait() => break,
                }
            }
        })
    }

    /// Forward confirmation requests from the safety gate to every client
    pub fn spawn_confirmations(&self, shutdown: ShutdownCoordinator) -> Option<JoinHandle<()>> {
        let safety = self.state.dispatcher.safety()?.clone();
        let clients = self.state.clients.clone();
        let mut requests = safety.subscribe();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = requests.recv() => match request {
                        Ok(request) => {
                            let frame = ServerMessage::ConfirmOperation {
                                id: request.id.clone(),
                                operation: request.operation,
                                params: request.params,
                            };
                            if clients.broadcast(&frame.to_text()) == 0 {
                                warn!(id = %request.id, "No client to confirm the operation");
                                safety.abandon(&request.id);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Dropped {} confirmation requests", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.wait() => break,
                }
            }
        }))
    }

    /// Serve on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener, shutdown: ShutdownCoordinator) -> HubResult<()> {
        let addr = listener.local_addr()?;
        info!("Relay listening on ws://{}", addr);

        let sweeper = self.spawn_sweeper(shutdown.clone());
        let confirmations = self.spawn_confirmations(shutdown.clone());
        let app = self.router();
        let signal = shutdown.clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.wait().await })
            .await;

        sweeper.abort();
        if let Some(confirmations) = confirmations {
            confirmations.abort();
        }
        result.map_err(HubError::Io)
    }

    pub async fn run(self, host: &str, port: u16, shutdown: ShutdownCoordinator) -> HubResult<()> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            HubError::Config(format!("Cannot bind {}:{}: {}", host, port, e))
        })?;
        self.serve(listener, shutdown).await
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health_handler(State(state): State<Arc<RelayState>>) -> Json<Value> {
    let hub = state.dispatcher.hub();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": hub.connection_names(),
        "tools": hub.tool_count(),
        "clients": state.clients.client_count(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (client, mut outbound) = state.clients.register();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    info!(client = %client, "Client connected ({} total)", state.clients.client_count());

    let hub = state.dispatcher.hub();
    let connected = ServerMessage::Connected {
        message: GREETING.to_string(),
        tools: hub.tools(),
        connections: hub.connection_names(),
    };
    state.clients.send_to(client, connected.to_text());

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => handle_text(&state, client, text.as_str()),
            Ok(Message::Binary(bytes)) => {
                handle_text(&state, client, &String::from_utf8_lossy(&bytes))
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(client = %client, "Receive error: {}", e);
                break;
            }
        }
    }

    state.clients.unregister(client);
    send_task.abort();
    info!(client = %client, "Client disconnected");
}

fn handle_text(state: &Arc<RelayState>, client: ClientId, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(client = %client, "Ignoring unrecognized frame: {}", e);
            return;
        }
    };

    match message {
        ClientMessage::ToolCall { id, tool, params } => {
            tokio::spawn(run_call(state.clone(), client, id, tool, params, false));
        }
        ClientMessage::Retry { id, tool, params } => {
            tokio::spawn(run_call(state.clone(), client, id, tool, params, true));
        }
        ClientMessage::ConfirmResult { id, approved } => {
            let resolved = state
                .dispatcher
                .safety()
                .is_some_and(|safety| safety.resolve(&id, approved));
            if !resolved {
                let frame = ServerMessage::Error {
                    message: format!("no pending confirmation with id {}", id),
                };
                state.clients.send_to(client, frame.to_text());
            }
        }
        ClientMessage::Ping => {
            state.clients.send_to(client, ServerMessage::Pong.to_text());
        }
        ClientMessage::ListTools => {
            let tools = state.dispatcher.hub().tools();
            state
                .clients
                .send_to(client, ServerMessage::ToolsList { tools }.to_text());
        }
        ClientMessage::ReloadTools => {
            let state = state.clone();
            tokio::spawn(async move {
                let hub = state.dispatcher.hub();
                hub.reload().await;
                state
                    .clients
                    .send_to(client, ServerMessage::ToolsList { tools: hub.tools() }.to_text());
            });
        }
        ClientMessage::CacheStats => {
            let cache = state.dispatcher.cache();
            let frame = ServerMessage::CacheStats {
                enabled: cache.is_some(),
                stats: cache.map(|cache| cache.stats()),
            };
            state.clients.send_to(client, frame.to_text());
        }
    }
}

async fn run_call(
    state: Arc<RelayState>,
    client: ClientId,
    id: RequestId,
    tool: String,
    params: Value,
    replay: bool,
) {
    let key = CallKey::new(client, &id, &tool);
    match state.clients.begin_call(&key, &canonical_json(&params)) {
        CallStart::New => {}
        CallStart::InFlight => {
            debug!(client = %client, id = %id, tool = %tool, "Call already in flight, ignoring");
            return;
        }
        CallStart::Delivered(frame) if replay => {
            debug!(client = %client, id = %id, tool = %tool, "Replaying delivered reply");
            state.clients.send_to(client, frame);
            return;
        }
        CallStart::Delivered(_) => {
            debug!(client = %client, id = %id, tool = %tool, "Already answered, ignoring");
            return;
        }
        CallStart::Conflict => {
            let error = state.dispatcher.classify(&format!(
                "invalid argument: duplicate correlation id {}, a call with other params is still running",
                id
            ));
            let frame = ToolResultFrame::failure(id, tool, &error);
            state.clients.send_to(client, ServerMessage::ToolResult(frame).to_text());
            return;
        }
    }

    info!(client = %client, id = %id, tool = %tool, "Tool call");
    let retry_key = format!("{}:{}", client, id);
    let outcome = state.dispatcher.execute(&retry_key, &tool, params).await;

    let frame = match outcome.result {
        Ok(result) => ToolResultFrame::success(id, tool, result, outcome.cached),
        Err(error) => ToolResultFrame::failure(id, tool, &error),
    };
    state
        .clients
        .complete(&key, ServerMessage::ToolResult(frame).to_text());
}
