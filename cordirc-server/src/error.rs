//! Bridge error type.

use cordirc_platform::{PlatformError, Snowflake};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("upstream: {0}")]
    Upstream(#[from] PlatformError),

    #[error("message {message} not cached for channel {channel}")]
    MessageNotFound { channel: Snowflake, message: Snowflake },

    #[error("member list for {0} did not arrive in time")]
    RosterTimeout(Snowflake),

    #[error("invalid scope {0:?}: expected a guild id or \"dm\"")]
    InvalidScope(String),

    #[error("server password mismatch")]
    PasswordMismatch,
}
