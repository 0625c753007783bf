//! Error types for quicmux-core.

use thiserror::Error;

/// Main error type for quicmux operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant broken inside the engine.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Allocation or queue capacity exhausted.
    #[error("out of memory")]
    OutOfMemory,

    /// Uncategorised failure.
    #[error("{message}")]
    Generic { message: String },

    /// Value cannot be represented as a QUIC varint.
    #[error("value {value} out of range for a QUIC varint")]
    OutOfRange { value: u64 },

    /// Not enough bytes to decode a value.
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The peer's MAX_STREAMS limit does not allow opening another stream.
    #[error("stream ID blocked by peer stream limit")]
    StreamIdBlocked,

    /// The stream's flow-control window is exhausted.
    #[error("stream {0} data blocked")]
    StreamDataBlocked(u64),

    /// The stream is unknown or closed for sending.
    #[error("stream {0} closed")]
    StreamClosed(u64),

    /// The connection-level flow-control or congestion window is exhausted.
    #[error("connection data blocked")]
    ConnDataBlocked,

    /// Packet numbers are exhausted; the connection cannot continue.
    #[error("packet numbers exhausted")]
    PacketNumExhausted,

    /// The connection is closing or closed.
    #[error("connection closed")]
    ConnClosed,

    /// The peer does not support the requested extension.
    #[error("extension not supported by peer")]
    ExtensionNotSupported,

    /// Operation needs a completed handshake.
    #[error("handshake not complete")]
    HandshakeIncomplete,

    /// QUIC library error without a more specific mapping.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// TLS configuration or handshake failure.
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// Invalid configuration option or value.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Location could not be resolved to a socket address.
    #[error("failed to resolve location: {location}")]
    Resolve { location: String },

    /// A consumer asked for ALPNs the existing listener does not accept.
    #[error("ALPN mismatch: requested {requested:?}, listener accepts {accepted:?}")]
    AlpnMismatch {
        requested: Vec<String>,
        accepted: Vec<String>,
    },

    /// Multiplexer or demultiplexer channel failure.
    #[error("channel error: {message}")]
    Channel { message: String },

    /// Network is unreachable.
    #[error("network unreachable: {0}")]
    NetworkUnreachable(std::io::Error),

    /// Host is unreachable.
    #[error("host unreachable: {0}")]
    HostUnreachable(std::io::Error),

    /// Connection refused (ICMP port unreachable).
    #[error("connection refused")]
    ConnectionRefused,

    /// Socket operation not permitted.
    #[error("permission denied: {0}")]
    PermissionDenied(std::io::Error),
}

impl Error {
    /// Returns true for flow-control and credit signals.
    ///
    /// These never terminate the connection; the caller may retry once
    /// credit arrives.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StreamIdBlocked
                | Error::StreamDataBlocked(_)
                | Error::ConnDataBlocked
                | Error::HandshakeIncomplete
        )
    }

    /// Returns true if the connection cannot be used after this error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::PacketNumExhausted | Error::ConnClosed)
    }

    /// Returns true for errors scoped to a single stream.
    pub fn is_stream_level(&self) -> bool {
        matches!(
            self,
            Error::StreamIdBlocked
                | Error::StreamDataBlocked(_)
                | Error::StreamClosed(_)
                | Error::ConnDataBlocked
        )
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }
}

/// Convenience result type for quicmux operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_stream_closed() {
        assert_eq!(Error::StreamClosed(4).to_string(), "stream 4 closed");
    }

    #[test]
    fn error_display_out_of_range() {
        let err = Error::OutOfRange { value: 1 << 62 };
        assert_eq!(
            err.to_string(),
            format!("value {} out of range for a QUIC varint", 1u64 << 62)
        );
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn retryable_errors() {
        assert!(Error::StreamIdBlocked.is_retryable());
        assert!(Error::StreamDataBlocked(0).is_retryable());
        assert!(Error::ConnDataBlocked.is_retryable());
        assert!(Error::HandshakeIncomplete.is_retryable());

        assert!(!Error::ConnClosed.is_retryable());
        assert!(!Error::StreamClosed(0).is_retryable());
        assert!(!Error::ExtensionNotSupported.is_retryable());
    }

    #[test]
    fn terminal_errors() {
        assert!(Error::ConnClosed.is_terminal());
        assert!(Error::PacketNumExhausted.is_terminal());

        assert!(!Error::ConnDataBlocked.is_terminal());
        assert!(!Error::StreamClosed(8).is_terminal());
    }

    #[test]
    fn stream_level_errors_are_not_terminal() {
        let errors = [
            Error::StreamIdBlocked,
            Error::StreamDataBlocked(1),
            Error::StreamClosed(2),
            Error::ConnDataBlocked,
        ];
        for err in errors {
            assert!(err.is_stream_level());
            assert!(!err.is_terminal(), "{err} should not be terminal");
        }
    }
}
