//! Socket layer behind the notification channel.
//!
//! The channel never touches a socket directly. It asks a [`Connector`] to
//! open one, keeps the returned [`Transport`] only so it can close it, and
//! learns everything else from the events the transport emits.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use notify_protocol::{ChannelError, CloseCodes, LOGOUT_REASON};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    handshake::client::Request,
    protocol::{CloseFrame, Message, frame::coding::CloseCode},
};
use tracing::{debug, warn};

use crate::config::CONNECT_TIMEOUT;
use crate::event::{CloseInfo, Payload, TransportEvents};

/// How long a locally initiated close waits for the server's reply.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Close frame sent by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

impl CloseRequest {
    /// 1000 / "User logout"
    pub fn logout() -> Self {
        Self {
            code: CloseCodes::NORMAL,
            reason: LOGOUT_REASON.into(),
        }
    }
}

/// Opens transports for the channel.
pub trait Connector: Send + Sync + 'static {
    /// Start connecting to `url` and return immediately.
    ///
    /// An `Err` means the transport could not even be constructed; no events
    /// will follow. Otherwise the outcome arrives through `events`: `Opened`,
    /// or `Errored` then an unclean `Closed`.
    fn open(&self, url: &str, events: TransportEvents) -> Result<Box<dyn Transport>, ChannelError>;

    /// Resolves once every transport this connector opened has finished,
    /// including any close handshake still in progress.
    fn drain(&self) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// An open (or opening) connection owned by the channel.
pub trait Transport: Send {
    /// Close the connection. `None` sends a close frame without a status code.
    fn close(self: Box<Self>, request: Option<CloseRequest>);
}

// ─────────────────────────────────────────────────────────────────────────────
// tokio-tungstenite
// ─────────────────────────────────────────────────────────────────────────────

/// [`Connector`] backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
    /// Socket tasks that may still be running
    sockets: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            sockets: Arc::default(),
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &str, events: TransportEvents) -> Result<Box<dyn Transport>, ChannelError> {
        let request = url
            .into_client_request()
            .map_err(|e| ChannelError::invalid_endpoint(url, e.to_string()))?;

        let (close_tx, close_rx) = oneshot::channel();
        let handle = tokio::spawn(run_socket(request, self.connect_timeout, events, close_rx));

        let mut sockets = self.sockets.lock();
        sockets.retain(|h| !h.is_finished());
        sockets.push(handle);

        Ok(Box::new(WsTransport {
            close_tx: Some(close_tx),
        }))
    }

    fn drain(&self) -> BoxFuture<'static, ()> {
        let handles = std::mem::take(&mut *self.sockets.lock());
        Box::pin(async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("socket task failed: {e}");
                }
            }
        })
    }
}

struct WsTransport {
    close_tx: Option<oneshot::Sender<Option<CloseRequest>>>,
}

impl Transport for WsTransport {
    fn close(mut self: Box<Self>, request: Option<CloseRequest>) {
        if let Some(tx) = self.close_tx.take() {
            // The socket task may already be gone.
            let _ = tx.send(request);
        }
    }
}

/// Drive one socket from handshake to close, reporting through `events`.
///
/// Dropping the `WsTransport` counts as a close request without a status.
async fn run_socket(
    request: Request,
    connect_timeout: Duration,
    events: TransportEvents,
    mut close_rx: oneshot::Receiver<Option<CloseRequest>>,
) {
    let generation = events.generation();

    let ws = tokio::select! {
        result = tokio::time::timeout(connect_timeout, connect_async(request)) => match result {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                events.errored(ChannelError::transport(&e).to_string());
                events.closed(CloseInfo::abnormal(format!("connect failed: {e}")));
                return;
            }
            Err(_) => {
                let err = ChannelError::ConnectTimeout(connect_timeout);
                events.errored(err.to_string());
                events.closed(CloseInfo::abnormal(err.to_string()));
                return;
            }
        },
        _ = &mut close_rx => {
            debug!(generation, "connect abandoned before the socket opened");
            return;
        }
    };

    events.opened();

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut received_close: Option<CloseInfo> = None;
    let mut local_close: Option<CloseInfo> = None;
    let mut close_deadline = tokio::time::Instant::now();

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    events.message(Payload::Text(text.to_string()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    events.message(Payload::Binary(bytes.to_vec()));
                }
                Some(Ok(Message::Close(frame))) => {
                    // tungstenite queues the reply; keep reading until the stream ends
                    received_close = Some(match frame {
                        Some(f) => CloseInfo::clean(u16::from(f.code), f.reason.to_string()),
                        None => CloseInfo::clean(CloseCodes::NO_STATUS, ""),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    match received_close.take().or_else(|| local_close.take()) {
                        Some(info) => {
                            events.closed(info);
                        }
                        None => {
                            events.errored(ChannelError::transport(&e).to_string());
                            events.closed(CloseInfo::abnormal(e.to_string()));
                        }
                    }
                    return;
                }
                None => {
                    let info = received_close
                        .take()
                        .or_else(|| local_close.take())
                        .unwrap_or_else(|| CloseInfo::abnormal("connection dropped"));
                    events.closed(info);
                    return;
                }
            },

            request = &mut close_rx, if local_close.is_none() => {
                let request = request.ok().flatten();
                let frame = request.as_ref().map(|r| CloseFrame {
                    code: CloseCode::from(r.code),
                    reason: r.reason.clone().into(),
                });
                local_close = Some(match &request {
                    Some(r) => CloseInfo::clean(r.code, r.reason.clone()),
                    None => CloseInfo::clean(CloseCodes::NO_STATUS, ""),
                });
                close_deadline = tokio::time::Instant::now() + CLOSE_HANDSHAKE_TIMEOUT;

                if let Err(e) = ws_tx.send(Message::Close(frame)).await {
                    debug!(generation, "close frame not sent: {e}");
                    if let Some(info) = local_close.take() {
                        events.closed(info);
                    }
                    return;
                }
            }

            _ = tokio::time::sleep_until(close_deadline), if local_close.is_some() => {
                warn!(generation, "server did not complete the close handshake");
                if let Some(info) = local_close.take() {
                    events.closed(info);
                }
                return;
            }
        }
    }
}
