//! WebSocket close codes used by the notification channel.

/// RFC 6455 close codes the channel sends or interprets.
pub struct CloseCodes;

impl CloseCodes {
    /// Sent on explicit disconnect (logout).
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    /// Reported when a close frame carried no status code.
    pub const NO_STATUS: u16 = 1005;
    /// Reported when the connection dropped without a close handshake.
    pub const ABNORMAL: u16 = 1006;
}

/// Close reason sent with [`CloseCodes::NORMAL`] on disconnect.
pub const LOGOUT_REASON: &str = "User logout";
