//! Bearer token handling for the push endpoint.
//!
//! The backend authenticates the socket with a single query parameter:
//!   ws://host:port/ws?token=<token without the "Bearer " prefix>
//!
//! Tokens come from the session store either raw or already prefixed
//! (the same value the REST client sends in `Authorization`).

use std::fmt;
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};

use crate::ChannelError;

/// A bearer credential with the `Bearer ` prefix removed.
///
/// Redacted in `Debug` output; the raw value is only exposed when the
/// endpoint URL is built.
pub struct BearerToken(SecretString);

impl BearerToken {
    pub const PREFIX: &'static str = "Bearer ";

    /// Strip an optional `Bearer ` prefix and surrounding whitespace.
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let start = raw.trim_start();
        let clean = start.strip_prefix(Self::PREFIX).unwrap_or(start).trim();
        if clean.is_empty() {
            return Err(ChannelError::EmptyToken);
        }
        Ok(Self(SecretString::from(clean.to_string())))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// First few characters followed by `...`, safe for logs.
    pub fn redacted(&self) -> String {
        let head: String = self.expose().chars().take(8).collect();
        format!("{head}...")
    }
}

impl Clone for BearerToken {
    fn clone(&self) -> Self {
        Self(SecretString::from(self.expose().to_string()))
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken([REDACTED])")
    }
}

impl FromStr for BearerToken {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Build the socket address: `<base>?token=<token>` (or `&token=` when the
/// base already has a query string). The token is percent-encoded.
pub fn endpoint_url(base: &str, token: &BearerToken) -> Result<String, ChannelError> {
    let base = base.trim();
    let lower = base.to_ascii_lowercase();
    if !(lower.starts_with("ws://") || lower.starts_with("wss://")) {
        return Err(ChannelError::invalid_endpoint(base, "scheme must be ws or wss"));
    }
    let authority = lower.split_once("://").map(|(_, rest)| rest).unwrap_or_default();
    if authority.is_empty() || authority.starts_with(['/', '?']) {
        return Err(ChannelError::invalid_endpoint(base, "missing host"));
    }

    let base = base.trim_end_matches(['?', '&']);
    let sep = if base.contains('?') { '&' } else { '?' };
    Ok(format!("{base}{sep}token={}", urlencoding::encode(token.expose())))
}
