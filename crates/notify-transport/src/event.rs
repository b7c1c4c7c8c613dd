//! Transport lifecycle events.
//!
//! A transport reports what happens to its socket as [`TransportEvent`]s
//! through the [`TransportEvents`] handle it was given at open time. Every
//! handle is stamped with the generation of the connect that created it, so
//! the channel can tell a live transport from one it already replaced.

use notify_protocol::CloseCodes;
use tokio::sync::mpsc;

/// Raw frame body, parsed by the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    /// A close handshake completed (either side initiated it)
    pub was_clean: bool,
}

impl CloseInfo {
    pub fn clean(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean: true,
        }
    }

    /// The socket went away without a close handshake (1006).
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: CloseCodes::ABNORMAL,
            reason: reason.into(),
            was_clean: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    MessageReceived(Payload),
    Closed(CloseInfo),
    Errored(String),
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::MessageReceived(_) => "message",
            Self::Closed(_) => "closed",
            Self::Errored(_) => "errored",
        }
    }
}

/// Everything the channel task reacts to besides commands.
#[derive(Debug)]
pub(crate) enum Signal {
    Transport { generation: u64, event: TransportEvent },
    RetryDue { seq: u64 },
}

/// Event sink handed to a transport when it is opened.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<Signal>,
}

impl TransportEvents {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Signal>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the channel has stopped listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Signal::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn opened(&self) -> bool {
        self.emit(TransportEvent::Opened)
    }

    pub fn message(&self, payload: Payload) -> bool {
        self.emit(TransportEvent::MessageReceived(payload))
    }

    pub fn closed(&self, info: CloseInfo) -> bool {
        self.emit(TransportEvent::Closed(info))
    }

    pub fn errored(&self, error: impl Into<String>) -> bool {
        self.emit(TransportEvent::Errored(error.into()))
    }
}
