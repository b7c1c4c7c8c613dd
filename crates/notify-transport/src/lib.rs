//! Admin push notifications - transport layer
//!
//! Client side:
//! - `NotificationChannel`: one authenticated WebSocket to the backend,
//!   dispatching pushes to a registered sink and reconnecting with a
//!   bounded retry budget until the user logs out
//! - `Connector` / `Transport`: the seam between the channel and the socket
//!   library (`WsConnector` is the tokio-tungstenite implementation)
//! - `TokenProvider`: where the bearer token comes from at connect time
//!
//! Server side:
//! - `PushServer`: a loopback push endpoint for local development and
//!   integration tests

pub mod channel;
pub mod config;
pub mod connector;
pub mod event;
pub mod server;
pub mod sink;
pub mod token;

pub use channel::{ChannelSnapshot, ConnectionState, NotificationChannel};
pub use config::ChannelConfig;
pub use connector::{CloseRequest, Connector, Transport, WsConnector};
pub use event::{CloseInfo, Payload, TransportEvent, TransportEvents};
pub use server::{PushServer, PushServerConfig, ServerError};
pub use sink::NotificationSink;
pub use token::{StaticToken, TokenFile, TokenProvider};
