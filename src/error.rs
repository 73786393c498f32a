/// Error kinds surfaced by the connection core.
///
/// Each variant maps to a distinct failure class so callers can decide
/// between retrying (network-shaped errors) and giving up (configuration,
/// authentication, protocol bugs).
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Invalid or missing options at connection build time.
    #[error("configuration error: {0}")]
    Config(String),

    /// DNS failure after fallbacks, TCP connect failure for all targets,
    /// or a read/write I/O failure on an established connection.
    #[error("network error: {0}")]
    Network(String),

    /// TLS handshake failure, trust failure, or hostname mismatch.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Malformed XML or an element the current state cannot accept.
    #[error("stream parse error: {0}")]
    Parse(String),

    /// SASL failure, SCRAM verification failure, or bind failure.
    #[error("authentication error: {0}")]
    Auth(String),

    /// An IQ deadline, connect timeout, or handshake timeout fired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The future was completed because `disconnect()` was called.
    #[error("cancelled: connection closed")]
    Cancelled,

    /// An illegal state transition was attempted. Indicates a bug.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether the reconnection supervisor may retry after this error.
    /// Configuration, authentication, TLS trust, and internal protocol
    /// errors would fail the same way on the next attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<native_tls::Error> for Error {
    fn from(e: native_tls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Parse(format!("invalid base64: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_retriable() {
        assert!(Error::Network("connection refused".into()).is_retriable());
        assert!(Error::Timeout("connect").is_retriable());
    }

    #[test]
    fn test_fatal_errors_are_not_retriable() {
        assert!(!Error::Config("missing domain".into()).is_retriable());
        assert!(!Error::Auth("not-authorized".into()).is_retriable());
        assert!(!Error::Tls("hostname mismatch".into()).is_retriable());
        assert!(!Error::Protocol("bad transition".into()).is_retriable());
        assert!(!Error::Cancelled.is_retriable());
    }

    #[test]
    fn test_io_error_maps_to_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(Error::from(io), Error::Network(_)));
    }
}
