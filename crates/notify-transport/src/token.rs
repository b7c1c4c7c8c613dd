//! Bearer token sources.
//!
//! The channel reads the token once per explicit connect; retries reuse the
//! token captured by that connect.

use std::path::{Path, PathBuf};

use notify_protocol::{BearerToken, ChannelError};
use tracing::{debug, warn};

/// Supplies the session's bearer token, or `None` when logged out.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<BearerToken>;
}

/// A fixed token (from a flag or environment variable).
#[derive(Debug, Clone)]
pub struct StaticToken(BearerToken);

impl StaticToken {
    pub fn new(raw: &str) -> Result<Self, ChannelError> {
        Ok(Self(BearerToken::parse(raw)?))
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<BearerToken> {
        Some(self.0.clone())
    }
}

/// A token persisted in a file, re-read on every call so a fresh login is
/// picked up by the next connect.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.admin-notify/token`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".admin-notify").join("token"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenProvider for TokenFile {
    fn token(&self) -> Option<BearerToken> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                debug!("no token at {}: {e}", self.path.display());
                return None;
            }
        };
        match BearerToken::parse(&contents) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("ignoring token file {}: {e}", self.path.display());
                None
            }
        }
    }
}
