//! # wslite: lightweight WebSocket server
//!
//! A server-side implementation of the WebSocket protocol (RFC 6455,
//! version 13) on top of Tokio, built for long-lived bidirectional
//! message streams over TCP or TLS.
//!
//! The crate is organized around a per-connection protocol engine:
//!
//! - **Frame codec**: header parse/encode with all three length forms and
//!   client-to-server masking ([`frame`], [`mask`])
//! - **Message assembly**: fragmented data messages are fused while control
//!   frames are surfaced out of band ([`Connection::recv`])
//! - **Send path**: whole-message writes with control-frame limits and
//!   explicit flushing ([`Connection::send`])
//! - **Close handshake**: ordered, timed, bidirectional shutdown
//!   ([`Connection::close_graceful`])
//! - **Channel adapter**: handlers see a pair of bounded message queues
//!   instead of the connection itself ([`channel`])
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wslite::{channel_handler, Config, Message, Server};
//!
//! async fn echo(
//!     mut inbound: tokio::sync::mpsc::Receiver<Message>,
//!     outbound: tokio::sync::mpsc::Sender<Message>,
//! ) -> wslite::Result<()> {
//!     while let Some(msg) = inbound.recv().await {
//!         let _ = outbound.send(msg).await;
//!     }
//!     Ok(())
//! }
//!
//! let config = Config::builder(
//!     "127.0.0.1:1234",
//!     Arc::new(|_req, _rsp| Some(channel_handler(echo, 4))),
//! )
//! .build();
//!
//! Server::new(config).serve().await?;
//! ```

use std::fmt;
use std::time::Duration;

pub mod channel;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod message;
pub mod server;
pub mod stats;

pub use channel::{channel_handler, run_channel_handler};
pub use connection::{
    ConnOptions, ConnReader, ConnWriter, Connection, MessageRead, MessageReader, MessageWriter,
};
pub use error::{Error, Result};
pub use frame::{FrameHeader, OpCode};
pub use handshake::{HandshakeRequest, HttpResponse};
pub use message::Message;
pub use server::{handler_fn, Handler, HandlerFuture, HandshakeFn, Server, TransportStream};
pub use stats::{RateCounter, StatsHandle, StatsSnapshot};

/// WebSocket GUID appended to the client key when computing the accept key
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum payload length of a control frame (close/ping/pong)
pub const MAX_CONTROL_FRAME_LEN: usize = 125;

/// Largest payload encodable in the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload encodable in the 16-bit extended length field
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Default per-message byte cap, enforced across fragments (1 MiB)
pub const DEFAULT_MAX_MSG_LEN: usize = 1024 * 1024;

/// Default buffered reader/writer sizes during the HTTP handshake
pub const DEFAULT_HTTP_BUFFER: usize = 2 * 1024;

/// Default buffered reader/writer sizes after the upgrade
pub const DEFAULT_WS_BUFFER: usize = 4 * 1024;

/// Default maximum wait for the peer's CLOSE after sending ours
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for reading the upgrade request
pub const DEFAULT_HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Default deadline for writing the upgrade response
pub const DEFAULT_HANDSHAKE_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Back-off after a failed accept before retrying
pub const ACCEPT_ERROR_TIMEOUT: Duration = Duration::from_secs(1);

/// Log level: errors only
pub const LOG_ERROR: u8 = 0;
/// Log level: errors and warnings
pub const LOG_WARN: u8 = 1;
/// Log level: informational
pub const LOG_INFO: u8 = 2;
/// Log level: full frame-by-frame debug output
pub const LOG_DEBUG: u8 = 3;

/// Server configuration
///
/// Built through [`Config::builder`]; the bind address and the handshake
/// callback are required, everything else has a default.
#[derive(Clone)]
pub struct Config {
    /// Handshake callback: inspects the upgrade request and either returns
    /// a per-connection handler or rejects by returning `None`
    pub handshake: HandshakeFn,
    /// Bind address, e.g. `"0.0.0.0:1234"`
    pub addr: String,
    /// TLS certificate file(s), comma-separated (TLS off when `None`)
    pub cert_file: Option<String>,
    /// TLS private key file(s), comma-separated
    pub key_file: Option<String>,
    /// Per-message byte cap, enforced across fragments
    pub max_msg_len: usize,
    /// SO_RCVBUF (0 = platform default)
    pub sock_read_buffer: usize,
    /// SO_SNDBUF (0 = platform default)
    pub sock_write_buffer: usize,
    /// Read buffer capacity during the HTTP handshake
    pub http_read_buffer: usize,
    /// Write buffer capacity during the HTTP handshake
    pub http_write_buffer: usize,
    /// Read buffer capacity after the upgrade
    pub ws_read_buffer: usize,
    /// Write buffer capacity after the upgrade; frames accumulate up to
    /// this size before an implicit flush
    pub ws_write_buffer: usize,
    /// Maximum wait for the peer's CLOSE during graceful shutdown
    pub close_timeout: Duration,
    /// Deadline for reading the upgrade request
    pub handshake_read_timeout: Duration,
    /// Deadline for writing the upgrade response
    pub handshake_write_timeout: Duration,
    /// TCP keepalive interval (`None` disables)
    pub tcp_keepalive: Option<Duration>,
    /// Emit socket read/write start/stop events to the stats task
    pub io_statistics: bool,
    /// Log verbosity, 0=error .. 3=debug; see [`Config::tracing_level`]
    pub log_level: u8,
}

impl Config {
    /// Start building a config from the two required options
    pub fn builder(addr: impl Into<String>, handshake: HandshakeFn) -> ConfigBuilder {
        ConfigBuilder::new(addr, handshake)
    }

    /// Map [`Config::log_level`] onto a `tracing` level filter
    ///
    /// Binaries use this when initializing their subscriber; the library
    /// itself emits events unconditionally and relies on the subscriber
    /// to filter.
    pub fn tracing_level(&self) -> tracing::level_filters::LevelFilter {
        use tracing::level_filters::LevelFilter;
        match self.log_level {
            LOG_ERROR => LevelFilter::ERROR,
            LOG_WARN => LevelFilter::WARN,
            LOG_INFO => LevelFilter::INFO,
            _ => LevelFilter::DEBUG,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("addr", &self.addr)
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("max_msg_len", &self.max_msg_len)
            .field("sock_read_buffer", &self.sock_read_buffer)
            .field("sock_write_buffer", &self.sock_write_buffer)
            .field("http_read_buffer", &self.http_read_buffer)
            .field("http_write_buffer", &self.http_write_buffer)
            .field("ws_read_buffer", &self.ws_read_buffer)
            .field("ws_write_buffer", &self.ws_write_buffer)
            .field("close_timeout", &self.close_timeout)
            .field("handshake_read_timeout", &self.handshake_read_timeout)
            .field("handshake_write_timeout", &self.handshake_write_timeout)
            .field("tcp_keepalive", &self.tcp_keepalive)
            .field("io_statistics", &self.io_statistics)
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Config`]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder with the required bind address and handshake callback
    pub fn new(addr: impl Into<String>, handshake: HandshakeFn) -> Self {
        Self {
            config: Config {
                handshake,
                addr: addr.into(),
                cert_file: None,
                key_file: None,
                max_msg_len: DEFAULT_MAX_MSG_LEN,
                sock_read_buffer: 0,
                sock_write_buffer: 0,
                http_read_buffer: DEFAULT_HTTP_BUFFER,
                http_write_buffer: DEFAULT_HTTP_BUFFER,
                ws_read_buffer: DEFAULT_WS_BUFFER,
                ws_write_buffer: DEFAULT_WS_BUFFER,
                close_timeout: DEFAULT_CLOSE_TIMEOUT,
                handshake_read_timeout: DEFAULT_HANDSHAKE_READ_TIMEOUT,
                handshake_write_timeout: DEFAULT_HANDSHAKE_WRITE_TIMEOUT,
                tcp_keepalive: None,
                io_statistics: false,
                log_level: LOG_ERROR,
            },
        }
    }

    /// TLS material; both files are required to enable TLS
    pub fn tls(mut self, cert_file: impl Into<String>, key_file: impl Into<String>) -> Self {
        self.config.cert_file = Some(cert_file.into());
        self.config.key_file = Some(key_file.into());
        self
    }

    /// Set the per-message byte cap
    pub fn max_msg_len(mut self, len: usize) -> Self {
        self.config.max_msg_len = len;
        self
    }

    /// Set SO_RCVBUF / SO_SNDBUF on accepted sockets (0 = platform default)
    pub fn sock_buffers(mut self, read: usize, write: usize) -> Self {
        self.config.sock_read_buffer = read;
        self.config.sock_write_buffer = write;
        self
    }

    /// Set buffered sizes during the HTTP handshake
    pub fn http_buffers(mut self, read: usize, write: usize) -> Self {
        self.config.http_read_buffer = read;
        self.config.http_write_buffer = write;
        self
    }

    /// Set buffered sizes after the upgrade
    pub fn ws_buffers(mut self, read: usize, write: usize) -> Self {
        self.config.ws_read_buffer = read;
        self.config.ws_write_buffer = write;
        self
    }

    /// Set the graceful-close wait
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Set the handshake read/write deadlines
    pub fn handshake_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.config.handshake_read_timeout = read;
        self.config.handshake_write_timeout = write;
        self
    }

    /// Enable TCP keepalive with the given interval (zero disables)
    pub fn tcp_keepalive(mut self, interval: Duration) -> Self {
        self.config.tcp_keepalive = if interval.is_zero() {
            None
        } else {
            Some(interval)
        };
        self
    }

    /// Emit socket read/write events to the stats task
    pub fn io_statistics(mut self, enabled: bool) -> Self {
        self.config.io_statistics = enabled;
        self
    }

    /// Set log verbosity (0=error .. 3=debug)
    pub fn log_level(mut self, level: u8) -> Self {
        self.config.log_level = level;
        self
    }

    /// Finish the builder
    pub fn build(self) -> Config {
        self.config
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::channel_handler;
    pub use crate::connection::Connection;
    pub use crate::error::{Error, Result};
    pub use crate::frame::OpCode;
    pub use crate::message::Message;
    pub use crate::server::Server;
    pub use crate::Config;
}
