//! HTTP upgrade handshake
//!
//! Parses and validates the client's upgrade request (RFC 6455 §4.2),
//! computes the `Sec-WebSocket-Accept` key and builds the `101 Switching
//! Protocols` response. Rejections produce a plain-text HTTP error naming
//! the offending header. `Sec-WebSocket-Extensions` tokens are recorded
//! but never negotiated.

use base64::Engine;
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::WS_GUID;

/// Maximum HTTP header block size accepted from a client
const MAX_HEADER_SIZE: usize = 8192;

/// Upper bound on parsed header count
const MAX_HEADERS: usize = 64;

/// A parsed WebSocket upgrade request
///
/// Owns its data so it outlives the connection's read buffer; header names
/// are stored lowercased.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// Request method, uppercased
    pub method: String,
    /// Request target (path and query, as sent)
    pub path: String,
    /// `Sec-WebSocket-Key` value (empty when the header is missing)
    pub key: String,
    /// `Sec-WebSocket-Version` value, if present
    pub version: Option<String>,
    /// `Sec-WebSocket-Extensions` tokens, split on `,` and `;`
    pub extensions: Vec<String>,
    /// All request headers, names lowercased, in arrival order
    pub headers: Vec<(String, String)>,
}

impl HandshakeRequest {
    /// First value of the named header (name compared case-insensitively)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of the named header, in arrival order
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An HTTP response under construction
///
/// Handed to the handshake callback so it can add application headers
/// before the 101 is emitted, or set a status and body when rejecting.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl HttpResponse {
    /// Create a response with the given status and no headers or body
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Current status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Set the status code
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Set a header, replacing any previous value
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            slot.1 = value;
        } else {
            self.headers.push((name, value));
        }
    }

    /// Set the response body
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// Response body
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Serialize the response head and body
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(b"HTTP/1.1 ");
        buf.put_slice(self.status.to_string().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(status_text(self.status).as_bytes());
        buf.put_slice(b"\r\n");
        if !self.body.is_empty() {
            buf.put_slice(b"Content-Length: ");
            buf.put_slice(self.body.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(self.body.as_bytes());
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        _ => "",
    }
}

/// Parse an upgrade request from the front of `buf`
///
/// Returns `Ok(None)` while the request is still incomplete, or the parsed
/// request plus the number of bytes it consumed.
pub fn parse_request(buf: &[u8]) -> Result<Option<(HandshakeRequest, usize)>> {
    if buf.len() > MAX_HEADER_SIZE {
        return Err(Error::InvalidHttp("request too large"));
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let consumed = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::InvalidHttp("failed to parse request")),
    };

    let method = req.method.unwrap_or("").to_ascii_uppercase();
    let path = req.path.unwrap_or("/").to_string();

    let mut key = String::new();
    let mut version = None;
    let mut extensions = Vec::new();
    let mut owned = Vec::with_capacity(req.headers.len());

    for header in req.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::InvalidHttp("invalid header value"))?
            .trim()
            .to_string();

        match name.as_str() {
            "sec-websocket-key" => key = value.clone(),
            "sec-websocket-version" => version = Some(value.clone()),
            "sec-websocket-extensions" => {
                for part in value.split(',') {
                    for token in part.split(';') {
                        let token = token.trim();
                        if !token.is_empty() {
                            extensions.push(token.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
        owned.push((name, value));
    }

    Ok(Some((
        HandshakeRequest {
            method,
            path,
            key,
            version,
            extensions,
            headers: owned,
        },
        consumed,
    )))
}

/// Validate the WebSocket upgrade requirements
///
/// On failure, fills `rsp` with the error status and a plain-text body
/// naming the missing or invalid header, and returns a handshake error.
pub fn validate_upgrade(req: &HandshakeRequest, rsp: &mut HttpResponse) -> Result<()> {
    if req.method != "GET" {
        rsp.set_status(405);
        return Err(Error::Handshake("method not allowed"));
    }

    let connection_upgrade = req.header_all("connection").any(|value| {
        value
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    });
    if !connection_upgrade {
        rsp.set_status(400);
        rsp.set_body("missing 'Connection: Upgrade' header");
        return Err(Error::Handshake("missing Connection: Upgrade"));
    }

    let upgrade_websocket = req
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrade_websocket {
        rsp.set_status(400);
        rsp.set_body("missing 'Upgrade: websocket' header");
        return Err(Error::Handshake("missing Upgrade: websocket"));
    }

    if req.key.is_empty() {
        rsp.set_status(400);
        rsp.set_body("missing 'Sec-WebSocket-Key' header");
        return Err(Error::Handshake("missing Sec-WebSocket-Key"));
    }

    match &req.version {
        Some(value) if matches!(value.trim().parse::<u32>(), Ok(13)) => {}
        Some(_) => {
            rsp.set_status(400);
            rsp.set_body("invalid 'Sec-WebSocket-Version' header value (13 expected)");
            return Err(Error::Handshake("unsupported WebSocket version"));
        }
        None => {
            rsp.set_status(400);
            rsp.set_body("missing 'Sec-WebSocket-Version' header");
            return Err(Error::Handshake("missing Sec-WebSocket-Version"));
        }
    }

    Ok(())
}

/// Compute `Sec-WebSocket-Accept`: Base64(SHA-1(key ‖ GUID))
#[inline]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Turn `rsp` into the 101 upgrade response for the given client key
///
/// Application headers set by the handshake callback are preserved.
pub fn accept(rsp: &mut HttpResponse, key: &str) {
    rsp.set_status(101);
    rsp.set_header("Upgrade", "websocket");
    rsp.set_header("Connection", "Upgrade");
    rsp.set_header("Sec-WebSocket-Accept", accept_key(key));
}
