//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror`. Variants follow the
//! failure taxonomy the monitor reacts to: connection-level failures are
//! retried with backoff, operational failures are logged and skipped.

use thiserror::Error;

/// Application error type
///
/// Covers every failure the relay may encounter, from configuration load to
/// webhook delivery.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid configuration or input
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Authentication failure (bad credentials, account disabled)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Transport severed (EOF, reset by peer, broken pipe)
    #[error("connection lost: {0}")]
    Connection(String),
    /// IMAP server rejected a command or sent something unparseable
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A fetched message could not be normalized
    #[error("message parse failed: {0}")]
    Parse(String),
    /// Webhook transport failure
    #[error("delivery failed: {0}")]
    Delivery(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Wrap an IMAP failure, separating severed transports from protocol errors
    ///
    /// Only the log line differs between the two; the monitor reconnects in
    /// both cases.
    pub fn from_imap(context: &str, err: impl std::fmt::Display) -> Self {
        let msg = format!("{context}: {err}");
        if looks_like_connection_loss(&msg) {
            Self::Connection(msg)
        } else {
            Self::Protocol(msg)
        }
    }

    /// Whether this error means the socket is gone
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Heuristic match on error text for reset-style transport failures
fn looks_like_connection_loss(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    ["connection", "eof", "broken pipe", "reset by peer", "aborted"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn classifies_reset_style_failures_as_connection_loss() {
        for text in [
            "unexpected EOF",
            "Connection reset by peer (os error 104)",
            "Broken pipe (os error 32)",
            "software caused connection abort",
        ] {
            let err = AppError::from_imap("IDLE failed", text);
            assert!(err.is_connection_loss(), "{text} should be a connection loss");
        }
    }

    #[test]
    fn classifies_server_rejections_as_protocol_errors() {
        let err = AppError::from_imap("IDLE failed", "BAD command unknown");
        assert!(!err.is_connection_loss());
        assert!(err.to_string().starts_with("protocol error: IDLE failed"));
    }
}
