//! WebSocket messages
//!
//! A [`Message`] is one complete unit of application data: a text or binary
//! body possibly assembled from several fragments, or a single control
//! frame. CLOSE messages carry their raw wire payload (an optional 2-byte
//! status code followed by a UTF-8 reason) so a received CLOSE can be
//! echoed back byte for byte.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::frame::OpCode;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Protocol error
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Data the endpoint cannot accept
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
/// No status code present in the CLOSE payload (never sent on the wire)
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close handshake (never sent on the wire)
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Payload inconsistent with the message type
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
/// Policy violation
pub const CLOSE_POLICY: u16 = 1008;
/// Message too big to process
pub const CLOSE_TOO_LARGE: u16 = 1009;
/// Client required an extension the server did not negotiate
pub const CLOSE_NEED_EXTENSION: u16 = 1010;
/// Internal server error
pub const CLOSE_INTERNAL: u16 = 1011;

/// A complete WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message (UTF-8 by convention; not validated)
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
    /// Ping control message
    Ping(Bytes),
    /// Pong control message
    Pong(Bytes),
    /// Close control message, carrying the raw close payload
    Close(Bytes),
}

impl Message {
    /// Create a text message
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Create a ping message
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Message::Ping(data.into())
    }

    /// Create a pong message
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Message::Pong(data.into())
    }

    /// Create a close message from a status code and reason
    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        Message::Close(build_close_body(code, reason))
    }

    /// Create the close message mapped from a handler outcome
    ///
    /// `None` (clean return) maps to 1000, protocol violations to their
    /// RFC 6455 codes, anything else to 1011 "internal".
    pub fn close_on_error(err: Option<&Error>) -> Self {
        let (code, reason) = close_code_for(err);
        Message::close(code, &reason)
    }

    /// Assemble a non-continuation message from a decoded frame
    pub(crate) fn from_frame(opcode: OpCode, body: Bytes) -> Self {
        match opcode {
            OpCode::Text => Message::Text(body),
            OpCode::Binary => Message::Binary(body),
            OpCode::Ping => Message::Ping(body),
            OpCode::Pong => Message::Pong(body),
            OpCode::Close => Message::Close(body),
            OpCode::Continuation => unreachable!("continuation is not a message opcode"),
        }
    }

    /// The wire opcode of this message
    #[inline]
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
            Message::Ping(_) => OpCode::Ping,
            Message::Pong(_) => OpCode::Pong,
            Message::Close(_) => OpCode::Close,
        }
    }

    /// Message payload; for CLOSE this is the raw close body
    #[inline]
    pub fn body(&self) -> &[u8] {
        match self {
            Message::Text(b)
            | Message::Binary(b)
            | Message::Ping(b)
            | Message::Pong(b)
            | Message::Close(b) => b,
        }
    }

    /// Consume the message, returning its payload
    #[inline]
    pub fn into_body(self) -> Bytes {
        match self {
            Message::Text(b)
            | Message::Binary(b)
            | Message::Ping(b)
            | Message::Pong(b)
            | Message::Close(b) => b,
        }
    }

    /// Text body as `&str`, if this is a text message with valid UTF-8
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Check if this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Check if this is a binary message
    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Check if this is a ping message
    #[inline]
    pub fn is_ping(&self) -> bool {
        matches!(self, Message::Ping(_))
    }

    /// Check if this is a pong message
    #[inline]
    pub fn is_pong(&self) -> bool {
        matches!(self, Message::Pong(_))
    }

    /// Check if this is a close message
    #[inline]
    pub fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }

    /// Check if this is a control message
    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode().is_control()
    }

    /// Status code and reason of a CLOSE message
    ///
    /// Returns `None` for non-close messages. An empty close body yields
    /// code 1005 (no status) with an empty reason.
    pub fn close_code(&self) -> Option<(u16, String)> {
        match self {
            Message::Close(b) => Some(parse_close_body(b)),
            _ => None,
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(Bytes::from(s))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Binary(b)
    }
}

/// Parse a CLOSE payload into `(code, reason)`
///
/// An empty body maps to code 1005; a reason that is not valid UTF-8 is
/// replaced lossily.
pub fn parse_close_body(body: &[u8]) -> (u16, String) {
    let code = if body.len() >= 2 {
        u16::from_be_bytes([body[0], body[1]])
    } else {
        CLOSE_NO_STATUS
    };
    let reason = if body.len() > 2 {
        String::from_utf8_lossy(&body[2..]).into_owned()
    } else {
        String::new()
    };
    (code, reason)
}

/// Build a CLOSE payload: big-endian code followed by the UTF-8 reason
pub fn build_close_body(code: u16, reason: &str) -> Bytes {
    let mut body = BytesMut::with_capacity(2 + reason.len());
    body.put_u16(code);
    body.put_slice(reason.as_bytes());
    body.freeze()
}

/// Map a terminating error onto a close code and reason
///
/// | error | code |
/// |---|---|
/// | `None` | 1000 |
/// | bad frame, unmasked, unexpected frame/continuation | 1002 |
/// | unknown opcode | 1003 |
/// | message too large | 1009 |
/// | anything else | 1011 `"internal"` |
pub fn close_code_for(err: Option<&Error>) -> (u16, String) {
    match err {
        None => (CLOSE_NORMAL, String::new()),
        Some(
            e @ (Error::BadFrame(_)
            | Error::UnmaskedFrame
            | Error::UnexpectedFrame
            | Error::UnexpectedContinuation),
        ) => (CLOSE_PROTOCOL_ERROR, e.to_string()),
        Some(e @ Error::UnknownOpcode) => (CLOSE_UNSUPPORTED_DATA, e.to_string()),
        Some(e @ Error::MessageTooLarge) => (CLOSE_TOO_LARGE, e.to_string()),
        Some(_) => (CLOSE_INTERNAL, "internal".to_string()),
    }
}

/// Accumulator for a fragmented data message
///
/// Exists only while a fragmented message is mid-flight; the buffers are
/// coalesced into a single allocation when the final fragment arrives.
#[derive(Debug)]
pub(crate) struct FragmentBuffer {
    opcode: OpCode,
    parts: Vec<Bytes>,
    total: usize,
}

impl FragmentBuffer {
    pub(crate) fn new(opcode: OpCode, first: Bytes) -> Self {
        let total = first.len();
        Self {
            opcode,
            parts: vec![first],
            total,
        }
    }

    /// Accumulated byte count across fragments
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.total
    }

    pub(crate) fn push(&mut self, part: Bytes) {
        self.total += part.len();
        self.parts.push(part);
    }

    /// Coalesce into one message with a single allocation
    pub(crate) fn into_message(self) -> Message {
        let mut body = BytesMut::with_capacity(self.total);
        for part in &self.parts {
            body.put_slice(part);
        }
        Message::from_frame(self.opcode, body.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn close_body_roundtrip() {
        for (code, reason) in [
            (CLOSE_NORMAL, ""),
            (CLOSE_PROTOCOL_ERROR, "bad frame"),
            (CLOSE_TOO_LARGE, "message too large"),
            (4000, "прощай"),
        ] {
            let body = build_close_body(code, reason);
            assert_eq!(parse_close_body(&body), (code, reason.to_string()));
        }
    }

    #[test]
    fn empty_close_body_has_no_status() {
        assert_eq!(parse_close_body(&[]), (CLOSE_NO_STATUS, String::new()));
        // A 1-byte body cannot carry a code either.
        assert_eq!(parse_close_body(&[0x03]), (CLOSE_NO_STATUS, String::new()));
    }

    #[test]
    fn error_to_close_mapping() {
        assert_eq!(close_code_for(None).0, CLOSE_NORMAL);
        assert_eq!(
            close_code_for(Some(&Error::UnmaskedFrame)).0,
            CLOSE_PROTOCOL_ERROR
        );
        assert_eq!(
            close_code_for(Some(&Error::UnexpectedContinuation)).0,
            CLOSE_PROTOCOL_ERROR
        );
        assert_eq!(
            close_code_for(Some(&Error::UnknownOpcode)).0,
            CLOSE_UNSUPPORTED_DATA
        );
        assert_eq!(
            close_code_for(Some(&Error::MessageTooLarge)).0,
            CLOSE_TOO_LARGE
        );

        let (code, reason) = close_code_for(Some(&Error::Io(io::Error::other("boom"))));
        assert_eq!((code, reason.as_str()), (CLOSE_INTERNAL, "internal"));
    }

    #[test]
    fn fragment_buffer_coalesces_in_order() {
        let mut frag = FragmentBuffer::new(OpCode::Text, Bytes::from_static(b"Hel"));
        frag.push(Bytes::from_static(b"lo"));
        frag.push(Bytes::from_static(b" world"));
        assert_eq!(frag.len(), 11);

        let msg = frag.into_message();
        assert_eq!(msg, Message::text("Hello world"));
    }

    #[test]
    fn close_message_echo_is_byte_exact() {
        let body = build_close_body(CLOSE_NORMAL, "done");
        let msg = Message::Close(body.clone());
        // Echo keeps the raw payload.
        assert_eq!(msg.body(), &body[..]);
        assert_eq!(msg.close_code(), Some((CLOSE_NORMAL, "done".to_string())));
    }
}
