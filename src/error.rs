//! Error types for the WebSocket server

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying socket
    Io(io::Error),
    /// Malformed frame header
    BadFrame(&'static str),
    /// Client frame arrived without a masking key
    UnmaskedFrame,
    /// Text/binary frame arrived while a fragmented message was in flight
    UnexpectedFrame,
    /// Continuation frame arrived with no message in flight
    UnexpectedContinuation,
    /// Frame with an opcode outside the RFC 6455 set
    UnknownOpcode,
    /// Message exceeds the configured size cap (across fragments)
    MessageTooLarge,
    /// Connection already closed (CLOSE sent or socket gone)
    ConnectionClosed,
    /// Streaming message writer already finished
    MessageClosed,
    /// Malformed HTTP upgrade request
    InvalidHttp(&'static str),
    /// Upgrade request was well-formed HTTP but not a valid WebSocket handshake
    Handshake(&'static str),
    /// TLS configuration failure
    Tls(String),
}

impl Error {
    /// True for protocol violations that should close the connection
    /// with a mapped status code rather than a bare socket close
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::BadFrame(_)
                | Error::UnmaskedFrame
                | Error::UnexpectedFrame
                | Error::UnexpectedContinuation
                | Error::UnknownOpcode
                | Error::MessageTooLarge
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::BadFrame(msg) => write!(f, "bad frame: {}", msg),
            Error::UnmaskedFrame => write!(f, "unmasked frame"),
            Error::UnexpectedFrame => write!(f, "unexpected text/binary frame in sequence"),
            Error::UnexpectedContinuation => write!(f, "unexpected continuation frame"),
            Error::UnknownOpcode => write!(f, "frame with unknown opcode"),
            Error::MessageTooLarge => write!(f, "message too large"),
            Error::ConnectionClosed => write!(f, "connection already closed"),
            Error::MessageClosed => write!(f, "message already closed"),
            Error::InvalidHttp(msg) => write!(f, "invalid http request: {}", msg),
            Error::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            Error::Tls(msg) => write!(f, "tls: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_eof_maps_to_connection_closed() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(Error::from(eof), Error::ConnectionClosed));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "no");
        assert!(matches!(Error::from(refused), Error::Io(_)));
    }

    #[test]
    fn protocol_classification() {
        assert!(Error::UnmaskedFrame.is_protocol());
        assert!(Error::MessageTooLarge.is_protocol());
        assert!(!Error::ConnectionClosed.is_protocol());
        assert!(!Error::Io(io::Error::other("x")).is_protocol());
    }
}
