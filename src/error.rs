use thiserror::Error;

/// Errors surfaced to library callers.
///
/// Retries for lost datagrams happen inside the message handler; an error of
/// kind [`IpmiError::ResponseTimeout`] means the per-request retry budget is
/// already exhausted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpmiError {
    #[error("transport closed")]
    TransportClosed,

    #[error("no response within the retry budget")]
    ResponseTimeout,

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication failed: RAKP status 0x{0:02x}")]
    AuthenticationFailed(u8),

    #[error("integrity check failed")]
    IntegrityCheckFailed,

    #[error("session expired")]
    SessionExpired,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("configuration missing or malformed: {0}")]
    ConfigurationMissing(String),

    #[error("operation cancelled")]
    Cancelled,
}
