//! Error taxonomy for the stream engine.
//!
//! Errors are `Clone` (I/O causes are wrapped in `Arc`) so a terminal error
//! observed by one `read_packet` call can be replayed to every later call.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A write was attempted after the connection was closed.
    #[error("wrote a packet while the connection was closed")]
    NotConnected,

    /// The attempt index ran past the end of the resolved candidate list.
    #[error("no more servers to attempt (tried all {0})")]
    RemoteServerNotFound(usize),

    /// SRV resolution failed outright (distinct from an empty result, which
    /// falls back to the service name itself).
    #[error("SRV lookup for {domain} failed: {reason}")]
    ResolutionFailed { domain: String, reason: String },

    /// The configuration requires a verified TLS connection and the server
    /// could not provide one.
    #[error("security required by connection configuration, but not available: {0}")]
    SecurityRequired(String),

    /// The server demands TLS but the configuration forbids it.
    #[error("TLS required by server but not allowed by connection configuration")]
    SecurityForbidden,

    /// `<failure/>` in the TLS namespace, or the handshake itself failed.
    #[error("TLS negotiation failed: {0}")]
    TlsHandshakeFailed(String),

    /// Deflate setup failed. Recoverable within the same `<features/>`.
    #[error("stream compression failed: {0}")]
    CompressionFailed(String),

    /// `<failure/>` in the SASL namespace.
    #[error("SASL authentication {mechanism} failed: {}", .condition.as_deref().unwrap_or("no condition given"))]
    AuthFailed {
        mechanism: String,
        condition: Option<String>,
    },

    /// The SASL exchange produced neither `<success/>` nor `<failure/>` in time.
    #[error("SASL authentication timed out")]
    AuthTimeout,

    /// No mechanism is shared between the preference list and the server,
    /// and no legacy authentication collaborator was provided.
    #[error("no SASL mechanism shared with the server")]
    NoSharedAuthMechanism,

    /// A mechanism is registered but cannot be initialized on this system.
    /// The authentication driver skips to the next preferred mechanism.
    #[error("SASL mechanism {0} is not supported on this system")]
    MechanismNotSupported(String),

    /// The post-authentication `<features/>` never advertised `<bind/>`.
    #[error("resource binding not offered by server")]
    BindNotOffered,

    /// The post-authentication `<features/>` never advertised `<session/>`.
    #[error("session establishment not offered by server")]
    SessionNotOffered,

    /// The server closed the stream: `</stream:stream>` or end of document.
    #[error("session terminated")]
    StreamTerminated,

    /// Malformed XML, an unexpected element at the stream root, or a bad
    /// version string.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The connection was torn down locally while an operation was blocked.
    #[error("disconnected by user")]
    Disconnected,

    /// The server answered an IQ with a `type="error"` reply.
    #[error("server returned an error: {0}")]
    IqError(String),

    /// No reply arrived within the configured reply timeout.
    #[error("no response from the server within {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failed_formats_condition() {
        let e = Error::AuthFailed {
            mechanism: "PLAIN".into(),
            condition: Some("not-authorized".into()),
        };
        assert_eq!(
            e.to_string(),
            "SASL authentication PLAIN failed: not-authorized"
        );

        let e = Error::AuthFailed {
            mechanism: "PLAIN".into(),
            condition: None,
        };
        assert_eq!(
            e.to_string(),
            "SASL authentication PLAIN failed: no condition given"
        );
    }

    #[test]
    fn io_errors_are_cloneable() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        let copy = e.clone();
        assert!(matches!(copy, Error::Io(_)));
        assert!(copy.to_string().contains("reset"));
    }
}
