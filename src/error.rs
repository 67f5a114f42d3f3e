//! Error taxonomy for the session engine.
//!
//! Three recoverable families cross the dispatch boundary as values:
//! malformed input ([`ProtocolError`]), correlation failures
//! ([`CorrelateError`]) and transport/lifecycle failures
//! ([`ConnectError`] / [`DisconnectReason`]). None of them may terminate
//! the connection; the offending line is discarded and the session
//! continues. Invariant violations (duplicate handler registration,
//! connect-while-disconnecting) are programmer errors and panic instead.

use thiserror::Error;

/// Malformed-input and protocol-negotiation errors.
///
/// Returned by handlers when a single inbound line cannot be processed.
/// The dispatcher reports these and drops the line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    EmptyMessage,

    #[error("malformed line: {0:?}")]
    Malformed(String),

    #[error("line too long: {actual} bytes (limit {limit})")]
    LineTooLong { actual: usize, limit: usize },

    #[error("missing parameter {index} for {verb}")]
    MissingParam { verb: String, index: usize },

    #[error("unrecognized command: {0}")]
    UnrecognizedCommand(String),

    #[error("message references channel {0} we are not joined to")]
    NotJoined(String),

    #[error("unknown CAP subcommand: {0}")]
    UnknownCapSubcommand(String),

    /// Transport I/O failure surfaced through the codec. String-backed so
    /// the enum stays `Clone`/`PartialEq`.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> ProtocolError {
        ProtocolError::Io(err.to_string())
    }
}

/// Result type for command handlers.
pub type HandlerResult = Result<(), ProtocolError>;

/// Correlation failures, delivered to the waiting handler as values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelateError {
    #[error("a request for this key is already pending")]
    AlreadyPending,
}

/// Connect-phase failures, produced by the transport connector.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The local user rejected a presented credential (e.g. an untrusted
    /// certificate). Suppresses automatic reconnection.
    #[error("credential rejected by user")]
    CredentialRejected,

    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect failed: {0}")]
    Other(String),
}

/// Why the session ended, pushed to observers on full disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local user asked for the disconnect.
    Requested,
    /// The connect attempt never produced a transport.
    ConnectFailed(String),
    /// The user rejected a credential during connect; no retry follows.
    CredentialRejected,
    /// The established connection was severed.
    Severed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_render_context() {
        let err = ProtocolError::MissingParam {
            verb: "KICK".into(),
            index: 1,
        };
        assert_eq!(err.to_string(), "missing parameter 1 for KICK");

        let err = ProtocolError::NotJoined("#chat".into());
        assert!(err.to_string().contains("#chat"));
    }

    #[test]
    fn io_errors_convert_for_the_codec() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = ProtocolError::from(io);
        assert!(matches!(err, ProtocolError::Io(ref m) if m.contains("reset")));
    }
}
