//! Loopback push server using Axum.
//!
//! Speaks the backend's push protocol: `/ws?token=<token>` upgrades to a
//! receive-only WebSocket, and every pushed notification is broadcast to all
//! connected sockets. Besides pushing, it can drop every socket without a
//! close handshake or close them cleanly, which is what the channel's
//! reconnect logic reacts to. Used by `admin-notify serve` and the
//! integration tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use notify_protocol::{CloseCodes, PushMessage};
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),
    #[error("failed to bind push server: {0}")]
    Bind(#[from] std::io::Error),
}

/// Push server configuration.
#[derive(Debug, Clone)]
pub struct PushServerConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Token clients must present; `None` accepts any token
    pub token: Option<String>,
}

impl Default for PushServerConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            hostname: "127.0.0.1".into(),
            token: None,
        }
    }
}

/// What the server tells every connected socket to do.
#[derive(Debug, Clone)]
enum Control {
    Push(String),
    /// Drop the TCP connection without a close frame
    Drop,
    Close { code: u16, reason: String },
}

struct AppState {
    config: PushServerConfig,
    control_tx: broadcast::Sender<Control>,
    /// Currently connected sockets
    client_count: AtomicUsize,
    /// Sockets accepted since start
    connections_total: AtomicUsize,
    /// `token` query values in arrival order, accepted or not
    seen_tokens: Mutex<Vec<String>>,
    /// Close frames sent by clients, `None` when the frame had no status
    client_closes: Mutex<Vec<Option<(u16, String)>>>,
}

/// The push server. Stops when `stop` is called.
pub struct PushServer {
    state: Arc<AppState>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    port: u16,
}

impl PushServer {
    pub async fn start(config: PushServerConfig) -> Result<Self, ServerError> {
        let (control_tx, _) = broadcast::channel(1024);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let state = Arc::new(AppState {
            config: config.clone(),
            control_tx,
            client_count: AtomicUsize::new(0),
            connections_total: AtomicUsize::new(0),
            seen_tokens: Mutex::new(Vec::new()),
            client_closes: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/ws", get(ws_upgrade_handler))
            .route("/health", get(health_handler))
            .with_state(state.clone());

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        info!("Push server listening on ws://{}:{}/ws", config.hostname, actual_port);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// Broadcast a notification. Returns how many sockets will receive it.
    pub fn push(&self, message: &PushMessage) -> usize {
        match serde_json::to_string(message.value()) {
            Ok(text) => self.push_text(text),
            Err(e) => {
                error!("Failed to encode push message: {e}");
                0
            }
        }
    }

    /// Broadcast a raw text frame, JSON or not.
    pub fn push_text(&self, text: impl Into<String>) -> usize {
        self.control(Control::Push(text.into()))
    }

    /// Drop every socket without a close handshake (client sees 1006).
    pub fn drop_connections(&self) -> usize {
        self.control(Control::Drop)
    }

    /// Close every socket with a close frame.
    pub fn close_connections(&self, code: u16, reason: impl Into<String>) -> usize {
        self.control(Control::Close {
            code,
            reason: reason.into(),
        })
    }

    pub fn client_count(&self) -> usize {
        self.state.client_count.load(Ordering::Relaxed)
    }

    pub fn connections_total(&self) -> usize {
        self.state.connections_total.load(Ordering::Relaxed)
    }

    pub fn seen_tokens(&self) -> Vec<String> {
        self.state.seen_tokens.lock().clone()
    }

    pub fn client_closes(&self) -> Vec<Option<(u16, String)>> {
        self.state.client_closes.lock().clone()
    }

    /// `ws://<hostname>:<port>/ws`
    pub fn endpoint(&self) -> String {
        format!("ws://{}:{}/ws", self.state.config.hostname, self.port)
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close all sockets and stop accepting connections.
    pub async fn stop(&mut self) {
        self.close_connections(CloseCodes::GOING_AWAY, "Server shutting down");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Push server stopped");
    }

    fn control(&self, control: Control) -> usize {
        // No receivers just means nobody is connected.
        self.state.control_tx.send(control).unwrap_or(0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let token = params.get("token").cloned().unwrap_or_default();
    state.seen_tokens.lock().push(token.clone());

    if let Some(expected) = &state.config.token {
        if &token != expected {
            warn!("Connection rejected: invalid token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_push_socket(socket, state))
        .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.client_count.load(Ordering::Relaxed),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_push_socket(socket: WebSocket, state: Arc<AppState>) {
    // Subscribe before counting the client so a push sent as soon as the
    // count goes up is not missed.
    let mut control_rx = state.control_tx.subscribe();
    state.client_count.fetch_add(1, Ordering::Relaxed);
    state.connections_total.fetch_add(1, Ordering::Relaxed);

    let client_id = uuid::Uuid::new_v4().to_string();
    info!("Push client connected: {client_id}");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(frame))) => {
                    let frame = frame.map(|f| (f.code, f.reason.as_str().to_owned()));
                    debug!("Push client closed: {client_id} {frame:?}");
                    state.client_closes.lock().push(frame);
                    break;
                }
                None => {
                    debug!("Push client disconnected: {client_id}");
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket error for {client_id}: {e}");
                    break;
                }
                // Receive-only channel: anything the client sends is ignored.
                Some(Ok(_)) => {}
            },

            control = control_rx.recv() => match control {
                Ok(Control::Push(text)) => {
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        error!("Failed to push to {client_id}: {e}");
                        break;
                    }
                }
                Ok(Control::Drop) => {
                    debug!("Dropping {client_id} without a close handshake");
                    break;
                }
                Ok(Control::Close { code, reason }) => {
                    let frame = CloseFrame { code, reason: reason.into() };
                    if ws_tx.send(Message::Close(Some(frame))).await.is_ok() {
                        // Wait for the client's reply so the close is clean on both ends.
                        let _ = tokio::time::timeout(Duration::from_secs(2), async {
                            while let Some(Ok(msg)) = ws_rx.next().await {
                                if matches!(msg, Message::Close(_)) {
                                    break;
                                }
                            }
                        })
                        .await;
                    }
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{client_id} lagged behind by {n} pushes");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    state.client_count.fetch_sub(1, Ordering::Relaxed);
    info!("Push client disconnected: {client_id} (total: {})",
        state.client_count.load(Ordering::Relaxed));
}
