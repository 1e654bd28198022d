//! WebSocket server
//!
//! Owns the TCP (or TLS) listener and drives one task per connection:
//! handshake under independent read/write deadlines, then the
//! application handler. A panicking connection task is isolated from the
//! accept loop, logged, and its socket closed.

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnOptions, Connection};
use crate::error::{Error, Result};
use crate::handshake::{self, HandshakeRequest, HttpResponse};
use crate::stats::{StatsEvent, StatsHandle};
use crate::{Config, ACCEPT_ERROR_TIMEOUT};

/// Future returned by a per-connection handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Per-connection handler; owns the connection until it returns
pub type Handler = Box<dyn FnOnce(Connection<TransportStream>) -> HandlerFuture + Send>;

/// Handshake callback
///
/// Receives the parsed upgrade request and the response under
/// construction; may set application headers before the 101 is emitted.
/// Returning `None` rejects the connection with whatever status and body
/// the callback set (403 when it set nothing).
pub type HandshakeFn = Arc<dyn Fn(&HandshakeRequest, &mut HttpResponse) -> Option<Handler> + Send + Sync>;

/// Adapt an async function into a boxed [`Handler`]
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: FnOnce(Connection<TransportStream>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |conn| Box::pin(f(conn)))
}

/// Accepted transport: plain TCP or server-side TLS
pub enum TransportStream {
    /// Plain TCP
    Plain(TcpStream),
    /// TLS over TCP
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TransportStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TransportStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_flush(cx),
            TransportStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TransportStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// The WebSocket server
pub struct Server {
    config: Config,
    stats: StatsHandle,
}

impl Server {
    /// Create a server from a finished [`Config`]
    ///
    /// Must be called within a Tokio runtime: the stats consumer task is
    /// spawned here.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            stats: StatsHandle::spawn(),
        }
    }

    /// Server configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle for querying server statistics
    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Bind the configured address and serve plain TCP connections
    pub async fn serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.addr)
            .await
            .map_err(Error::Io)?;
        info!(addr = %self.config.addr, "listening");
        self.serve_listener(listener).await
    }

    /// Bind the configured address and serve TLS connections
    ///
    /// Requires `cert_file` and `key_file`; comma-separated lists are
    /// accepted but only the first pair is loaded (a PEM file may carry a
    /// full chain).
    pub async fn serve_tls(&self) -> Result<()> {
        let (Some(cert_file), Some(key_file)) = (&self.config.cert_file, &self.config.key_file)
        else {
            return Err(Error::Tls("cert-file or key-file not specified".into()));
        };
        let tls_config = build_tls_config(cert_file, key_file)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let listener = TcpListener::bind(&self.config.addr)
            .await
            .map_err(Error::Io)?;
        info!(addr = %self.config.addr, "listening (tls)");
        self.accept_loop(listener, Some(acceptor)).await
    }

    /// Serve plain TCP connections from an already-bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        self.accept_loop(listener, None).await
    }

    async fn accept_loop(&self, listener: TcpListener, tls: Option<TlsAcceptor>) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_TIMEOUT).await;
                    continue;
                }
            };
            self.configure_socket(&stream);

            let config = self.config.clone();
            let stats = self.stats.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                stats.emit(StatsEvent::Connect).await;
                // The driver runs as its own task so a panic in it (or in
                // the handler) can be observed and logged here instead of
                // dying silently; the socket closes when the task's state
                // is dropped.
                let driver = tokio::spawn(drive_connection(stream, peer, tls, config, stats.clone()));
                if let Err(e) = driver.await {
                    if e.is_panic() {
                        let payload = e.into_panic();
                        error!(
                            peer = %peer,
                            panic = panic_message(payload.as_ref()),
                            "connection task panicked"
                        );
                    }
                }
                stats.emit(StatsEvent::Disconnect).await;
                debug!(peer = %peer, "connection closed");
            });
        }
    }

    fn configure_socket(&self, stream: &TcpStream) {
        let _ = stream.set_nodelay(true);
        let sock = SockRef::from(stream);
        if self.config.sock_read_buffer > 0 {
            if let Err(e) = sock.set_recv_buffer_size(self.config.sock_read_buffer) {
                warn!(error = %e, "failed to set SO_RCVBUF");
            }
        }
        if self.config.sock_write_buffer > 0 {
            if let Err(e) = sock.set_send_buffer_size(self.config.sock_write_buffer) {
                warn!(error = %e, "failed to set SO_SNDBUF");
            }
        }
        if let Some(interval) = self.config.tcp_keepalive {
            let keepalive = TcpKeepalive::new().with_time(interval).with_interval(interval);
            if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
                warn!(error = %e, "failed to set TCP keepalive");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// One connection from accept to close
async fn drive_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    config: Config,
    stats: StatsHandle,
) {
    let peer_label = peer.to_string();
    debug!(peer = %peer_label, "connection established");

    let mut io = match tls {
        Some(acceptor) => {
            let accepted =
                tokio::time::timeout(config.handshake_read_timeout, acceptor.accept(stream)).await;
            match accepted {
                Ok(Ok(tls_stream)) => TransportStream::Tls(tls_stream),
                Ok(Err(e)) => {
                    error!(peer = %peer_label, error = %e, "tls accept failed");
                    stats.emit(StatsEvent::HandshakeFailed).await;
                    return;
                }
                Err(_) => {
                    error!(peer = %peer_label, "tls accept timed out");
                    stats.emit(StatsEvent::HandshakeFailed).await;
                    return;
                }
            }
        }
        None => TransportStream::Plain(stream),
    };

    let Some((handler, extensions)) = handshake_phase(&mut io, &peer_label, &config, &stats).await
    else {
        // Handshake failed; dropping the stream closes the socket.
        return;
    };

    let conn = Connection::new(
        io,
        ConnOptions {
            max_msg_len: config.max_msg_len,
            read_buffer: config.ws_read_buffer,
            write_buffer: config.ws_write_buffer,
            close_timeout: config.close_timeout,
            io_statistics: config.io_statistics,
            peer: peer_label.clone(),
            extensions,
            stats: stats.clone(),
        },
    );

    match handler(conn).await {
        Ok(()) | Err(Error::ConnectionClosed) => {}
        Err(e) => error!(peer = %peer_label, error = %e, "handler failed"),
    }
}

/// Run the HTTP upgrade: read the request under the read deadline, emit
/// the response under the write deadline
///
/// Returns the accepted handler and the client's extension tokens, or
/// `None` after a rejection (the error response has already been written).
async fn handshake_phase<S>(
    io: &mut S,
    peer: &str,
    config: &Config,
    stats: &StatsHandle,
) -> Option<(Handler, Vec<String>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(config.http_read_buffer);

    let read_result = tokio::time::timeout(config.handshake_read_timeout, async {
        loop {
            if let Some(parsed) = handshake::parse_request(&buf)? {
                return Ok(parsed);
            }
            match io.read_buf(&mut buf).await {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(_) => {}
                Err(e) => return Err(Error::from(e)),
            }
        }
    })
    .await;

    let (request, consumed) = match read_result {
        Ok(Ok(parsed)) => parsed,
        Ok(Err(e)) => {
            error!(peer, error = %e, "http parse failed");
            let mut rsp = HttpResponse::new(400);
            rsp.set_body(e.to_string());
            write_error_page(io, config, &mut rsp).await;
            stats.emit(StatsEvent::HandshakeFailed).await;
            return None;
        }
        Err(_) => {
            error!(peer, "timed out reading handshake request");
            let mut rsp = HttpResponse::new(408);
            rsp.set_body("timed out reading handshake request");
            write_error_page(io, config, &mut rsp).await;
            stats.emit(StatsEvent::HandshakeFailed).await;
            return None;
        }
    };

    let mut rsp = HttpResponse::new(200);
    if let Err(e) = handshake::validate_upgrade(&request, &mut rsp) {
        error!(peer, error = %e, status = rsp.status(), "handshake failed");
        write_error_page(io, config, &mut rsp).await;
        stats.emit(StatsEvent::HandshakeFailed).await;
        return None;
    }

    let Some(handler) = (config.handshake)(&request, &mut rsp) else {
        if rsp.status() == 200 {
            rsp.set_status(403);
        }
        error!(peer, status = rsp.status(), body = rsp.body(), "handshake rejected");
        write_error_page(io, config, &mut rsp).await;
        stats.emit(StatsEvent::HandshakeFailed).await;
        return None;
    };

    handshake::accept(&mut rsp, &request.key);
    let mut out = BytesMut::with_capacity(config.http_write_buffer);
    rsp.write_to(&mut out);
    let write_result = tokio::time::timeout(config.handshake_write_timeout, async {
        io.write_all(&out).await?;
        io.flush().await
    })
    .await;
    match write_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(peer, error = %e, "failed to write upgrade response");
            stats.emit(StatsEvent::HandshakeFailed).await;
            return None;
        }
        Err(_) => {
            error!(peer, "timed out writing upgrade response");
            stats.emit(StatsEvent::HandshakeFailed).await;
            return None;
        }
    }
    stats.emit(StatsEvent::Handshake).await;

    buf.advance(consumed);
    if !buf.is_empty() {
        // Bytes beyond the request would belong to the WebSocket stream,
        // but nothing may arrive before our 101: the stream is corrupt.
        error!(peer, buffered = buf.len(), "unread data in buffer after http handshake");
        return None;
    }

    debug!(peer, path = %request.path, "handshake complete");
    Some((handler, request.extensions))
}

async fn write_error_page<S>(io: &mut S, config: &Config, rsp: &mut HttpResponse)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    rsp.set_header("Content-Type", "text/plain");
    rsp.set_header("Connection", "close");
    let mut out = BytesMut::with_capacity(config.http_write_buffer);
    rsp.write_to(&mut out);
    let _ = tokio::time::timeout(config.handshake_write_timeout, async {
        io.write_all(&out).await?;
        io.flush().await
    })
    .await;
}

fn build_tls_config(cert_files: &str, key_files: &str) -> Result<rustls::ServerConfig> {
    let certs: Vec<&str> = cert_files
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let keys: Vec<&str> = key_files
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let (Some(cert_file), Some(key_file)) = (certs.first(), keys.first()) else {
        return Err(Error::Tls("empty cert-file or key-file list".into()));
    };
    if certs.len() > 1 || keys.len() > 1 {
        warn!("multiple certificate/key pairs listed; only the first is used");
    }

    let chain = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(tls_config)
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).map_err(Error::Io)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(Error::Io)?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", path)));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).map_err(Error::Io)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(Error::Io)?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path)))
}
