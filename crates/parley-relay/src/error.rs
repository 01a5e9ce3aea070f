//! Relay runtime error types.

use thiserror::Error;

/// Errors from the relay runtime.
///
/// The sans-IO [`RelayDriver`](crate::RelayDriver) never fails; these
/// errors all come from configuration, transport, or framing at the I/O
/// boundary.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration error (invalid bind address, unreadable TLS files).
    ///
    /// Fatal at startup; fix configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport or network error (bind failure, connection failure, I/O).
    #[error("transport error: {0}")]
    Transport(String),

    /// A client sent data that does not frame or decode as an envelope.
    ///
    /// Fatal for that stream only; the relay keeps serving.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
