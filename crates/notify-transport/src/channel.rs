//! The notification channel: one authenticated push connection per session.
//!
//! All connection state lives in a single task. The [`NotificationChannel`]
//! handle only sends it commands, so `connect` and `disconnect` never block
//! and never fail from the caller's point of view.
//!
//! State machine:
//!   Disconnected --connect--> Connecting --open--> Open
//!   Connecting/Open --unclean close--> ReconnectPending (budget left, not logged out)
//!   Connecting/Open --unclean close--> Disconnected     (budget spent or logged out)
//!   Connecting/Open --clean close--> Disconnected
//!   ReconnectPending --timer--> Connecting
//!   any --disconnect--> Disconnected
//!
//! Each connect bumps a generation number. Events from a transport of an
//! older generation are dropped, and every pending retry carries its own
//! cancellation token that connect/disconnect cancel.

use std::sync::{Arc, Weak};

use notify_protocol::{BearerToken, ChannelError, PushMessage, endpoint_url};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ChannelConfig;
use crate::connector::{CloseRequest, Connector, Transport, WsConnector};
use crate::event::{CloseInfo, Payload, Signal, TransportEvent, TransportEvents};
use crate::sink::{NotificationSink, SinkSlot};
use crate::token::TokenProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    ReconnectPending,
}

/// Point-in-time view of the channel, published after every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    /// Set by `disconnect`, cleared by the next `connect`
    pub force_closed: bool,
}

impl Default for ChannelSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            force_closed: false,
        }
    }
}

enum Command {
    Connect(BearerToken),
    Disconnect,
}

/// Handle to the notification channel.
///
/// Create one per application in the composition root and pass it to
/// whatever drives login/logout. Dropping the handle stops the channel.
pub struct NotificationChannel {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ChannelSnapshot>,
    sink: SinkSlot,
    task: JoinHandle<()>,
}

impl NotificationChannel {
    /// Channel over tokio-tungstenite. Must be called inside a Tokio runtime.
    pub fn new(config: ChannelConfig) -> Self {
        let connector = WsConnector::new(config.connect_timeout);
        Self::with_connector(config, connector)
    }

    /// Channel over a custom [`Connector`]. Must be called inside a Tokio runtime.
    pub fn with_connector<C: Connector>(config: ChannelConfig, connector: C) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ChannelSnapshot::default());
        let sink = SinkSlot::default();

        let actor = ChannelActor {
            config,
            connector: Box::new(connector),
            sink: sink.clone(),
            signal_tx,
            status: status_tx,
            socket: None,
            token: None,
            open: false,
            connecting: false,
            force_closed: false,
            reconnect_attempts: 0,
            generation: 0,
            retry: None,
            retry_seq: 0,
        };
        let task = tokio::spawn(actor.run(command_rx, signal_rx));

        Self {
            commands,
            status,
            sink,
            task,
        }
    }

    /// Open the push connection with `token` (raw or `Bearer `-prefixed).
    ///
    /// No-op while an attempt is already in flight. Any existing connection
    /// is closed first. Failures are logged, never returned.
    pub fn connect(&self, token: &str) {
        match BearerToken::parse(token) {
            Ok(token) => self.send(Command::Connect(token)),
            Err(e) => warn!("connect ignored: {e}"),
        }
    }

    /// Connect with whatever token `provider` currently holds.
    pub fn connect_with(&self, provider: &dyn TokenProvider) {
        match provider.token() {
            Some(token) => self.send(Command::Connect(token)),
            None => warn!("connect ignored: no bearer token available"),
        }
    }

    /// Close the connection (1000, "User logout") and stop retrying.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().state == ConnectionState::Open
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        *self.status.borrow()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.status.borrow().reconnect_attempts
    }

    /// Watch state transitions (e.g. to show a connectivity indicator).
    pub fn subscribe(&self) -> watch::Receiver<ChannelSnapshot> {
        self.status.clone()
    }

    /// Register the notification consumer. Only a weak reference is kept;
    /// the caller owns the sink.
    pub fn set_notification_banner<S: NotificationSink + 'static>(&self, sink: &Arc<S>) {
        let weak: Weak<dyn NotificationSink> = Arc::downgrade(sink) as Weak<S>;
        self.sink.set(weak);
    }

    pub fn clear_notification_banner(&self) {
        self.sink.clear();
    }

    /// Stop the channel task, closing any open connection. Returns once
    /// every socket has finished its close handshake.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            error!("notification channel task failed: {e}");
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            error!("{}", ChannelError::Stopped);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Channel task
// ─────────────────────────────────────────────────────────────────────────────

struct PendingRetry {
    seq: u64,
    token: BearerToken,
    cancel: CancellationToken,
}

struct ChannelActor {
    config: ChannelConfig,
    connector: Box<dyn Connector>,
    sink: SinkSlot,
    /// Cloned into every transport and retry timer
    signal_tx: mpsc::UnboundedSender<Signal>,
    status: watch::Sender<ChannelSnapshot>,

    socket: Option<Box<dyn Transport>>,
    /// Token captured by the last connect; retries reuse it
    token: Option<BearerToken>,
    open: bool,
    connecting: bool,
    force_closed: bool,
    reconnect_attempts: u32,
    generation: u64,
    retry: Option<PendingRetry>,
    retry_seq: u64,
}

impl ChannelActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect(token)) => self.connect(token),
                    Some(Command::Disconnect) => self.disconnect(),
                    None => break,
                },
                Some(signal) = signals.recv() => self.handle_signal(signal),
            }
        }

        self.cancel_retry();
        if let Some(socket) = self.socket.take() {
            socket.close(Some(CloseRequest::logout()));
        }
        // Let close handshakes finish so the logout frame is not lost.
        self.connector.drain().await;
        debug!("notification channel stopped");
    }

    fn connect(&mut self, token: BearerToken) {
        if self.connecting {
            debug!("connect ignored: an attempt is already in flight");
            return;
        }

        self.cancel_retry();
        if let Some(socket) = self.socket.take() {
            debug!("closing previous push connection");
            socket.close(None);
        }

        self.open = false;
        self.force_closed = false;
        self.connecting = true;
        self.generation += 1;

        let result = endpoint_url(&self.config.endpoint, &token).and_then(|url| {
            info!(
                endpoint = %self.config.endpoint,
                token = %token.redacted(),
                generation = self.generation,
                "connecting to push endpoint"
            );
            let events = TransportEvents::new(self.generation, self.signal_tx.clone());
            self.connector.open(&url, events)
        });

        match result {
            Ok(socket) => self.socket = Some(socket),
            Err(e) => {
                self.connecting = false;
                error!("failed to create push connection: {e}");
            }
        }
        self.token = Some(token);
        self.publish();
    }

    fn disconnect(&mut self) {
        self.force_closed = true;
        self.cancel_retry();
        // Late events from the closing transport must not count.
        self.generation += 1;

        if let Some(socket) = self.socket.take() {
            info!("closing push connection (logout)");
            socket.close(Some(CloseRequest::logout()));
        }

        self.open = false;
        self.connecting = false;
        self.reconnect_attempts = 0;
        self.publish();
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::RetryDue { seq } => match self.retry.take() {
                Some(retry) if retry.seq == seq && !retry.cancel.is_cancelled() => {
                    self.reconnect_attempts += 1;
                    info!(
                        attempt = self.reconnect_attempts,
                        max = self.config.max_reconnect_attempts,
                        "reconnecting push channel"
                    );
                    self.connect(retry.token);
                }
                other => {
                    self.retry = other;
                    debug!(seq, "stale reconnect timer ignored");
                }
            },
            Signal::Transport { generation, event } if generation != self.generation => {
                debug!(
                    generation,
                    current = self.generation,
                    event = event.name(),
                    "ignoring event from a replaced connection"
                );
            }
            Signal::Transport { event, .. } => self.handle_event(event),
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                self.connecting = false;
                self.open = true;
                self.reconnect_attempts = 0;
                info!("push channel open");
            }
            TransportEvent::MessageReceived(payload) => {
                self.dispatch(payload);
                return;
            }
            TransportEvent::Errored(e) => {
                self.connecting = false;
                warn!("push channel error: {e}");
            }
            TransportEvent::Closed(info) => self.handle_close(info),
        }
        self.publish();
    }

    fn handle_close(&mut self, info: CloseInfo) {
        self.connecting = false;
        self.open = false;
        self.socket = None;

        info!(
            code = info.code,
            reason = %info.reason,
            clean = info.was_clean,
            "push channel closed"
        );

        if self.force_closed || info.was_clean {
            return;
        }
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            warn!(
                attempts = self.reconnect_attempts,
                "reconnect budget exhausted; waiting for an explicit connect"
            );
            return;
        }
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        let Some(token) = self.token.clone() else {
            return;
        };

        self.retry_seq += 1;
        let seq = self.retry_seq;
        let cancel = CancellationToken::new();
        let delay = self.config.reconnect_delay;

        let timer = cancel.clone();
        let tx = self.signal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Signal::RetryDue { seq });
                }
            }
        });

        info!(
            attempt = self.reconnect_attempts + 1,
            max = self.config.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling push channel reconnect"
        );
        self.retry = Some(PendingRetry { seq, token, cancel });
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.cancel.cancel();
            debug!(seq = retry.seq, "pending reconnect cancelled");
        }
    }

    fn dispatch(&self, payload: Payload) {
        let parsed = match &payload {
            Payload::Text(text) => PushMessage::parse(text),
            Payload::Binary(bytes) => PushMessage::from_slice(bytes),
        };

        match parsed {
            Ok(message) => {
                debug!(kind = message.kind().unwrap_or("-"), "push message received");
                match self.sink.get() {
                    Some(sink) => sink.show_notification(&message),
                    None => debug!("no notification sink registered"),
                }
            }
            Err(e) => warn!("dropping malformed push message: {e}"),
        }
    }

    fn state(&self) -> ConnectionState {
        if self.open {
            ConnectionState::Open
        } else if self.connecting {
            ConnectionState::Connecting
        } else if self.retry.is_some() {
            ConnectionState::ReconnectPending
        } else {
            ConnectionState::Disconnected
        }
    }

    fn publish(&self) {
        self.status.send_replace(ChannelSnapshot {
            state: self.state(),
            reconnect_attempts: self.reconnect_attempts,
            force_closed: self.force_closed,
        });
    }
}
