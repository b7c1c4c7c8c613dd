//! Admin push notifications - protocol types
//!
//! Types shared by the notification channel and the loopback push server:
//! the notification payload and its envelope, bearer token handling,
//! WebSocket close codes, and the channel error type.
//! This crate performs no I/O.

pub mod auth;
pub mod close;
pub mod error;
pub mod notification;

pub use auth::{BearerToken, endpoint_url};
pub use close::{CloseCodes, LOGOUT_REASON};
pub use error::ChannelError;
pub use notification::{Notification, PushEnvelope, PushMessage};
