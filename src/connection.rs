//! Per-connection protocol engine
//!
//! A [`Connection`] owns an upgraded transport and exposes the
//! message-level API: [`Connection::recv`] assembles fragmented data
//! messages while surfacing control frames out of band, and
//! [`Connection::send`] writes whole messages with an explicit flush.
//! The connection is split at construction into a receive half and a send
//! half so the channel adapter can drive them from two tasks; the halves
//! share only the close state (atomic flags plus a shutdown signal that
//! wakes a blocked reader when the writer closes the socket).
//!
//! [`MessageReader`] and [`MessageWriter`] provide the alternative
//! byte-stream view over single messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, Result};
use crate::frame::{FrameHeader, OpCode};
use crate::mask::{apply_mask, apply_mask_offset};
use crate::message::{FragmentBuffer, Message};
use crate::stats::{StatsEvent, StatsHandle};
use crate::{DEFAULT_CLOSE_TIMEOUT, DEFAULT_MAX_MSG_LEN, DEFAULT_WS_BUFFER, MAX_CONTROL_FRAME_LEN};

/// Close state shared between the two connection halves
#[derive(Debug)]
pub(crate) struct Shared {
    rcvd_close: AtomicBool,
    sent_close: AtomicBool,
    socket_closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    pub(crate) close_timeout: Duration,
}

impl Shared {
    fn new(close_timeout: Duration) -> (Arc<Self>, watch::Receiver<bool>) {
        let (shutdown, rx) = watch::channel(false);
        (
            Arc::new(Self {
                rcvd_close: AtomicBool::new(false),
                sent_close: AtomicBool::new(false),
                socket_closed: AtomicBool::new(false),
                shutdown,
                close_timeout,
            }),
            rx,
        )
    }

    #[inline]
    pub(crate) fn rcvd_close(&self) -> bool {
        self.rcvd_close.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn sent_close(&self) -> bool {
        self.sent_close.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn socket_closed(&self) -> bool {
        self.socket_closed.load(Ordering::Acquire)
    }
}

/// Options for building a [`Connection`] from an upgraded transport
#[derive(Debug, Clone)]
pub struct ConnOptions {
    /// Per-message byte cap, enforced across fragments
    pub max_msg_len: usize,
    /// Read buffer capacity
    pub read_buffer: usize,
    /// Write buffer capacity; frames accumulate up to this size before an
    /// implicit flush
    pub write_buffer: usize,
    /// Maximum wait for the peer's CLOSE during graceful shutdown
    pub close_timeout: Duration,
    /// Emit socket read/write events to the stats task
    pub io_statistics: bool,
    /// Peer label used in log events
    pub peer: String,
    /// Extension tokens offered by the client (recorded, never negotiated)
    pub extensions: Vec<String>,
    /// Stats sink
    pub stats: StatsHandle,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            max_msg_len: DEFAULT_MAX_MSG_LEN,
            read_buffer: DEFAULT_WS_BUFFER,
            write_buffer: DEFAULT_WS_BUFFER,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            io_statistics: false,
            peer: "-".to_string(),
            extensions: Vec::new(),
            stats: StatsHandle::disabled(),
        }
    }
}

/// Receive half of a connection: frame decoding and message assembly
pub struct ConnReader<S> {
    rd: ReadHalf<S>,
    buf: BytesMut,
    fragment: Option<FragmentBuffer>,
    rcvd_close: Option<Message>,
    failed: bool,
    max_msg_len: usize,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    stats: StatsHandle,
    io_stats: bool,
    peer: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ConnReader<S> {
    /// Refill the read buffer from the socket
    ///
    /// Wakes with `ConnectionClosed` when the send half closes the socket.
    async fn fill(&mut self) -> Result<()> {
        if self.shared.socket_closed() {
            return Err(Error::ConnectionClosed);
        }
        if self.io_stats {
            self.stats.emit(StatsEvent::ReadStart).await;
        }
        let Self {
            rd, buf, shutdown, ..
        } = self;
        let res = tokio::select! {
            res = rd.read_buf(buf) => Some(res),
            _ = shutdown.changed() => None,
        };
        if self.io_stats {
            self.stats.emit(StatsEvent::ReadStop).await;
        }
        match res {
            None => Err(Error::ConnectionClosed),
            Some(Ok(0)) => Err(Error::ConnectionClosed),
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(e.into()),
        }
    }

    /// Read the next frame header, tolerating short reads
    async fn next_header(&mut self) -> Result<FrameHeader> {
        loop {
            if let Some(header) = FrameHeader::parse(&mut self.buf, true)? {
                debug!(
                    peer = %self.peer,
                    opcode = header.opcode.name(),
                    fin = header.fin,
                    len = header.payload_len,
                    "frame header received"
                );
                self.stats.emit(StatsEvent::InFrame(header.opcode)).await;
                return Ok(header);
            }
            self.fill().await?;
        }
    }

    /// Read and unmask a whole frame body
    async fn read_body(&mut self, header: &FrameHeader) -> Result<Bytes> {
        let len = header.payload_len as usize;
        let mut body = BytesMut::with_capacity(len);
        while body.len() < len {
            if self.buf.is_empty() {
                self.fill().await?;
            }
            let take = (len - body.len()).min(self.buf.len());
            body.put_slice(&self.buf[..take]);
            self.buf.advance(take);
        }
        if let Some(key) = header.mask {
            apply_mask(&mut body, key);
        }
        debug!(peer = %self.peer, len, "frame body received");
        Ok(body.freeze())
    }

    /// Read up to `out.len()` payload bytes of the frame, unmasking in place
    ///
    /// `done` is the number of payload bytes already consumed; returns 0 at
    /// end of frame.
    async fn read_chunk(
        &mut self,
        header: &FrameHeader,
        done: usize,
        out: &mut [u8],
    ) -> Result<usize> {
        let len = header.payload_len as usize;
        if done >= len || out.is_empty() {
            return Ok(0);
        }
        if self.buf.is_empty() {
            self.fill().await?;
        }
        let n = out.len().min(len - done).min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        if let Some(key) = header.mask {
            apply_mask_offset(&mut out[..n], key, done);
        }
        Ok(n)
    }

    /// Receive the next complete message
    ///
    /// Fragmented data messages are assembled across frames; control frames
    /// are returned immediately, interleaved with any assembly in flight.
    /// After a CLOSE has been returned, or after any error, subsequent calls
    /// fail with [`Error::ConnectionClosed`].
    pub async fn recv(&mut self) -> Result<Message> {
        if self.rcvd_close.is_some() || self.failed || self.shared.socket_closed() {
            return Err(Error::ConnectionClosed);
        }
        match self.recv_inner().await {
            Ok(msg) => Ok(msg),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    async fn recv_inner(&mut self) -> Result<Message> {
        loop {
            let header = self.next_header().await?;

            let over_cap = header.payload_len > self.max_msg_len as u64
                || (header.opcode == OpCode::Continuation
                    && self.fragment.as_ref().is_some_and(|frag| {
                        frag.len() as u64 + header.payload_len > self.max_msg_len as u64
                    }));
            if over_cap {
                self.fragment = None;
                return Err(Error::MessageTooLarge);
            }

            let body = self.read_body(&header).await?;

            match header.opcode {
                OpCode::Text | OpCode::Binary => {
                    if self.fragment.is_some() {
                        return Err(Error::UnexpectedFrame);
                    }
                    if header.fin {
                        return Ok(Message::from_frame(header.opcode, body));
                    }
                    self.fragment = Some(FragmentBuffer::new(header.opcode, body));
                }
                OpCode::Continuation => {
                    let Some(mut fragment) = self.fragment.take() else {
                        return Err(Error::UnexpectedContinuation);
                    };
                    fragment.push(body);
                    if header.fin {
                        return Ok(fragment.into_message());
                    }
                    self.fragment = Some(fragment);
                }
                OpCode::Close => {
                    let msg = Message::Close(body);
                    self.rcvd_close = Some(msg.clone());
                    self.shared.rcvd_close.store(true, Ordering::Release);
                    return Ok(msg);
                }
                OpCode::Ping | OpCode::Pong => {
                    return Ok(Message::from_frame(header.opcode, body));
                }
            }
        }
    }

    /// CLOSE message received from the peer, if any
    pub fn rcvd_close(&self) -> Option<&Message> {
        self.rcvd_close.as_ref()
    }

    /// Start a streaming read of the next message
    pub fn message_reader(&mut self) -> MessageReader<'_, S> {
        MessageReader {
            reader: self,
            frame: None,
            opened: false,
            state: ReaderState::Running,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

/// Send half of a connection: frame encoding, buffering and flushing
pub struct ConnWriter<S> {
    wr: WriteHalf<S>,
    buf: BytesMut,
    buf_size: usize,
    sent_close: Option<Message>,
    shared: Arc<Shared>,
    stats: StatsHandle,
    io_stats: bool,
    peer: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ConnWriter<S> {
    /// Queue one frame into the write buffer, flushing when it fills up
    async fn write_frame(&mut self, opcode: OpCode, payload: &[u8], fin: bool) -> Result<()> {
        let header = FrameHeader::server(opcode, payload.len() as u64, fin);
        self.buf.reserve(14 + payload.len());
        header.encode(&mut self.buf);
        self.buf.put_slice(payload);
        self.stats.emit(StatsEvent::OutFrame(opcode)).await;
        debug!(
            peer = %self.peer,
            opcode = opcode.name(),
            fin,
            len = payload.len(),
            "frame queued"
        );
        if self.buf.len() >= self.buf_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write out everything buffered and flush the socket
    pub async fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if self.io_stats {
            self.stats.emit(StatsEvent::WriteStart).await;
        }
        let res = async {
            self.wr.write_all(&self.buf).await?;
            self.wr.flush().await
        }
        .await;
        if self.io_stats {
            self.stats.emit(StatsEvent::WriteStop).await;
        }
        res?;
        self.buf.clear();
        Ok(())
    }

    /// Send one complete message as a single frame and flush
    ///
    /// Fails with [`Error::ConnectionClosed`] once a CLOSE has been sent or
    /// the socket is closed.
    ///
    /// # Panics
    ///
    /// A control message with a payload over 125 bytes is a caller contract
    /// violation and panics.
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        if self.sent_close.is_some() || self.shared.socket_closed() {
            return Err(Error::ConnectionClosed);
        }
        let opcode = msg.opcode();
        if opcode.is_control() {
            assert!(
                msg.body().len() <= MAX_CONTROL_FRAME_LEN,
                "control frame payload exceeds {} bytes",
                MAX_CONTROL_FRAME_LEN
            );
        }
        self.write_frame(opcode, msg.body(), true).await?;
        self.flush().await?;
        if msg.is_close() {
            self.shared.sent_close.store(true, Ordering::Release);
            self.sent_close = Some(msg);
        }
        Ok(())
    }

    /// Send a text message
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text)).await
    }

    /// Send a binary message
    pub async fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::binary(data)).await
    }

    /// Send a ping
    pub async fn send_ping(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::ping(data)).await
    }

    /// Send a pong
    pub async fn send_pong(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::pong(data)).await
    }

    /// Send a CLOSE built from a status code and reason
    pub async fn send_close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.send(Message::close(code, reason)).await
    }

    /// Close the socket; idempotent
    ///
    /// Shuts the write direction down and signals the receive half so a
    /// blocked read wakes up.
    pub async fn close_socket(&mut self) {
        if !self.shared.socket_closed.swap(true, Ordering::AcqRel) {
            let _ = self.wr.shutdown().await;
            let _ = self.shared.shutdown.send(true);
            debug!(peer = %self.peer, "socket closed");
        }
    }

    /// CLOSE message this side has sent, if any
    pub fn sent_close(&self) -> Option<&Message> {
        self.sent_close.as_ref()
    }

    /// Start a streaming write of one text or binary message
    pub fn message_writer(&mut self, binary: bool) -> MessageWriter<'_, S> {
        MessageWriter {
            writer: self,
            opcode: if binary { OpCode::Binary } else { OpCode::Text },
            closed: false,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

/// An upgraded WebSocket connection
pub struct Connection<S> {
    reader: ConnReader<S>,
    writer: ConnWriter<S>,
    extensions: Vec<String>,
    peer: String,
    close_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Wrap an already-upgraded transport
    pub fn new(stream: S, options: ConnOptions) -> Self {
        let (rd, wr) = tokio::io::split(stream);
        let (shared, shutdown) = Shared::new(options.close_timeout);
        let reader = ConnReader {
            rd,
            buf: BytesMut::with_capacity(options.read_buffer),
            fragment: None,
            rcvd_close: None,
            failed: false,
            max_msg_len: options.max_msg_len,
            shared: shared.clone(),
            shutdown,
            stats: options.stats.clone(),
            io_stats: options.io_statistics,
            peer: options.peer.clone(),
        };
        let writer = ConnWriter {
            wr,
            buf: BytesMut::with_capacity(options.write_buffer),
            buf_size: options.write_buffer.max(1),
            sent_close: None,
            shared,
            stats: options.stats,
            io_stats: options.io_statistics,
            peer: options.peer.clone(),
        };
        Self {
            reader,
            writer,
            extensions: options.extensions,
            peer: options.peer,
            close_timeout: options.close_timeout,
        }
    }

    /// Extension tokens the client offered (recorded, never negotiated)
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Peer label (remote address when accepted by the server)
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Receive the next complete message; see [`ConnReader::recv`]
    pub async fn recv(&mut self) -> Result<Message> {
        self.reader.recv().await
    }

    /// Send one complete message; see [`ConnWriter::send`]
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        self.writer.send(msg).await
    }

    /// Send a text message
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.writer.send_text(text).await
    }

    /// Send a binary message
    pub async fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.writer.send_binary(data).await
    }

    /// Send a ping
    pub async fn send_ping(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.writer.send_ping(data).await
    }

    /// Send a pong
    pub async fn send_pong(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.writer.send_pong(data).await
    }

    /// Send a CLOSE built from a status code and reason
    pub async fn send_close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.writer.send_close(code, reason).await
    }

    /// CLOSE message received from the peer, if any
    pub fn rcvd_close(&self) -> Option<&Message> {
        self.reader.rcvd_close()
    }

    /// CLOSE message this side has sent, if any
    pub fn sent_close(&self) -> Option<&Message> {
        self.writer.sent_close()
    }

    /// Whether the socket has been closed
    pub fn is_closed(&self) -> bool {
        self.writer.shared.socket_closed()
    }

    /// Start a streaming read of the next message
    pub fn message_reader(&mut self) -> MessageReader<'_, S> {
        self.reader.message_reader()
    }

    /// Start a streaming write of one text or binary message
    pub fn message_writer(&mut self, binary: bool) -> MessageWriter<'_, S> {
        self.writer.message_writer(binary)
    }

    /// Close the socket without a close handshake; idempotent
    pub async fn close(&mut self) {
        self.writer.close_socket().await;
    }

    /// Run the graceful close handshake, then close the socket
    ///
    /// Sends a CLOSE if none has been sent (echoing the peer's CLOSE
    /// byte-for-byte when one was received, otherwise built from
    /// `(code, reason)`), then drains incoming frames until the peer's
    /// CLOSE, an error, or the close timeout.
    pub async fn close_graceful(&mut self, code: u16, reason: &str) -> Result<()> {
        if self.writer.sent_close.is_none() {
            let msg = match &self.reader.rcvd_close {
                Some(m) => m.clone(),
                None => Message::close(code, reason),
            };
            let _ = self.writer.send(msg).await;
        }
        if self.reader.rcvd_close.is_none() {
            let reader = &mut self.reader;
            let _ = tokio::time::timeout(self.close_timeout, async {
                loop {
                    match reader.recv().await {
                        Ok(msg) if msg.is_close() => break,
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            })
            .await;
        }
        self.writer.close_socket().await;
        Ok(())
    }

    /// Graceful close with the code and reason mapped from an error
    pub async fn close_graceful_on_error(&mut self, err: Option<&Error>) -> Result<()> {
        let (code, reason) = crate::message::close_code_for(err);
        self.close_graceful(code, &reason).await
    }

    /// Split into the receive and send halves for two-task operation
    pub fn split(self) -> (ConnReader<S>, ConnWriter<S>) {
        (self.reader, self.writer)
    }
}

/// Progress of a streaming message read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageRead {
    /// Bytes were copied into the caller's buffer
    Data(usize),
    /// The message is complete
    End,
    /// A control frame arrived mid-message
    Control(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Running,
    Done,
    Failed,
}

/// Byte-stream view over one incoming message
///
/// Yields payload bytes across the message's data frames until the final
/// fragment. Control frames encountered mid-message are surfaced as
/// [`MessageRead::Control`]; after a CLOSE the reader is terminal.
pub struct MessageReader<'a, S> {
    reader: &'a mut ConnReader<S>,
    frame: Option<(FrameHeader, usize)>,
    opened: bool,
    state: ReaderState,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MessageReader<'_, S> {
    /// Read the next chunk of the message into `out`
    pub async fn read(&mut self, out: &mut [u8]) -> Result<MessageRead> {
        match self.state {
            ReaderState::Done => return Ok(MessageRead::End),
            ReaderState::Failed => return Err(Error::ConnectionClosed),
            ReaderState::Running => {}
        }
        match self.read_inner(out).await {
            Ok(progress) => Ok(progress),
            Err(e) => {
                self.state = ReaderState::Failed;
                Err(e)
            }
        }
    }

    async fn read_inner(&mut self, out: &mut [u8]) -> Result<MessageRead> {
        loop {
            let Some((header, done)) = self.frame.as_mut() else {
                let header = self.reader.next_header().await?;
                match header.opcode {
                    OpCode::Ping | OpCode::Pong | OpCode::Close => {
                        let body = self.reader.read_body(&header).await?;
                        let msg = Message::from_frame(header.opcode, body);
                        if msg.is_close() {
                            self.reader.rcvd_close = Some(msg.clone());
                            self.reader.shared.rcvd_close.store(true, Ordering::Release);
                            self.state = ReaderState::Done;
                        }
                        return Ok(MessageRead::Control(msg));
                    }
                    OpCode::Text | OpCode::Binary => {
                        if self.opened {
                            return Err(Error::UnexpectedFrame);
                        }
                        self.opened = true;
                        self.frame = Some((header, 0));
                    }
                    OpCode::Continuation => {
                        if !self.opened {
                            return Err(Error::UnexpectedContinuation);
                        }
                        self.frame = Some((header, 0));
                    }
                }
                continue;
            };

            if *done >= header.payload_len as usize {
                let fin = header.fin;
                self.frame = None;
                if fin {
                    self.state = ReaderState::Done;
                    return Ok(MessageRead::End);
                }
                continue;
            }

            let n = self.reader.read_chunk(header, *done, out).await?;
            *done += n;
            if n > 0 {
                return Ok(MessageRead::Data(n));
            }
            // n == 0 only for an empty output buffer
            return Ok(MessageRead::Data(0));
        }
    }
}

/// Byte-stream view over one outgoing message
///
/// Each `write` emits one non-final frame (the declared opcode first,
/// continuations after); `finish` emits the empty terminating frame and
/// flushes.
pub struct MessageWriter<'a, S> {
    writer: &'a mut ConnWriter<S>,
    opcode: OpCode,
    closed: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> MessageWriter<'_, S> {
    /// Append a chunk of the message as one frame
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::MessageClosed);
        }
        if self.writer.sent_close.is_some() || self.writer.shared.socket_closed() {
            return Err(Error::ConnectionClosed);
        }
        let opcode = self.opcode;
        self.opcode = OpCode::Continuation;
        self.writer.write_frame(opcode, data, false).await
    }

    /// Terminate the message with an empty final frame and flush
    ///
    /// Further writes (and a second `finish`) fail with
    /// [`Error::MessageClosed`].
    pub async fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::MessageClosed);
        }
        self.closed = true;
        self.writer
            .write_frame(OpCode::Continuation, &[], true)
            .await?;
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{build_close_body, parse_close_body, CLOSE_NORMAL, CLOSE_TOO_LARGE};
    use tokio::io::DuplexStream;

    /// Encode a client-to-server frame with a fixed masking key
    fn client_frame(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut buf = BytesMut::new();
        FrameHeader {
            mask: Some(key),
            masked: true,
            ..FrameHeader::server(opcode, payload.len() as u64, fin)
        }
        .encode(&mut buf);
        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], key);
        buf.to_vec()
    }

    /// Read one server frame from the client side of a duplex pipe
    async fn read_server_frame(io: &mut DuplexStream, buf: &mut BytesMut) -> (FrameHeader, Bytes) {
        loop {
            if let Some(header) = FrameHeader::parse(buf, false).unwrap() {
                let len = header.payload_len as usize;
                while buf.len() < len {
                    io.read_buf(buf).await.unwrap();
                }
                let body = buf.split_to(len).freeze();
                return (header, body);
            }
            let n = io.read_buf(buf).await.unwrap();
            assert!(n > 0, "eof while waiting for server frame");
        }
    }

    fn pair() -> (Connection<DuplexStream>, DuplexStream) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        (Connection::new(server_io, ConnOptions::default()), client_io)
    }

    #[tokio::test]
    async fn single_frame_text_echo() {
        let (mut conn, mut client) = pair();

        client
            .write_all(&client_frame(OpCode::Text, b"Hello", true))
            .await
            .unwrap();

        let msg = conn.recv().await.unwrap();
        assert_eq!(msg, Message::text("Hello"));

        conn.send(msg).await.unwrap();
        let mut buf = BytesMut::new();
        let (header, body) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!(header.opcode, OpCode::Text);
        assert!(header.fin);
        assert!(!header.masked, "server frames must not be masked");
        assert_eq!(&body[..], b"Hello");
    }

    #[tokio::test]
    async fn fragmented_message_with_interleaved_ping() {
        let (mut conn, mut client) = pair();

        let mut wire = Vec::new();
        wire.extend(client_frame(OpCode::Text, b"Hel", false));
        wire.extend(client_frame(OpCode::Ping, b"p", true));
        wire.extend(client_frame(OpCode::Continuation, b"lo", true));
        client.write_all(&wire).await.unwrap();

        // The ping is yielded before assembly resumes.
        assert_eq!(conn.recv().await.unwrap(), Message::ping(&b"p"[..]));
        assert_eq!(conn.recv().await.unwrap(), Message::text("Hello"));
    }

    #[tokio::test]
    async fn text_frame_mid_fragment_is_unexpected() {
        let (mut conn, mut client) = pair();

        let mut wire = Vec::new();
        wire.extend(client_frame(OpCode::Text, b"He", false));
        wire.extend(client_frame(OpCode::Text, b"llo", true));
        client.write_all(&wire).await.unwrap();

        assert!(matches!(conn.recv().await, Err(Error::UnexpectedFrame)));
        // Errors are sticky: the stream has ended for the caller.
        assert!(matches!(conn.recv().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn continuation_without_opener_is_unexpected() {
        let (mut conn, mut client) = pair();
        client
            .write_all(&client_frame(OpCode::Continuation, b"lo", true))
            .await
            .unwrap();
        assert!(matches!(
            conn.recv().await,
            Err(Error::UnexpectedContinuation)
        ));
    }

    #[tokio::test]
    async fn oversize_message_is_rejected() {
        let (server_io, mut client) = tokio::io::duplex(64 * 1024);
        let mut conn = Connection::new(
            server_io,
            ConnOptions {
                max_msg_len: 8,
                ..ConnOptions::default()
            },
        );

        client
            .write_all(&client_frame(OpCode::Binary, &[0u8; 9], true))
            .await
            .unwrap();
        assert!(matches!(conn.recv().await, Err(Error::MessageTooLarge)));

        // The mapped close carries 1009.
        conn.close_graceful_on_error(Some(&Error::MessageTooLarge))
            .await
            .unwrap();
        let mut buf = BytesMut::new();
        let (header, body) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(parse_close_body(&body).0, CLOSE_TOO_LARGE);
    }

    #[tokio::test]
    async fn oversize_across_fragments_is_rejected() {
        let (server_io, mut client) = tokio::io::duplex(64 * 1024);
        let mut conn = Connection::new(
            server_io,
            ConnOptions {
                max_msg_len: 8,
                ..ConnOptions::default()
            },
        );

        let mut wire = Vec::new();
        wire.extend(client_frame(OpCode::Binary, &[0u8; 5], false));
        wire.extend(client_frame(OpCode::Continuation, &[0u8; 4], true));
        client.write_all(&wire).await.unwrap();

        assert!(matches!(conn.recv().await, Err(Error::MessageTooLarge)));
    }

    #[tokio::test]
    async fn exactly_max_len_is_accepted() {
        let (server_io, mut client) = tokio::io::duplex(64 * 1024);
        let mut conn = Connection::new(
            server_io,
            ConnOptions {
                max_msg_len: 8,
                ..ConnOptions::default()
            },
        );
        client
            .write_all(&client_frame(OpCode::Binary, &[7u8; 8], true))
            .await
            .unwrap();
        assert_eq!(
            conn.recv().await.unwrap(),
            Message::binary(vec![7u8; 8])
        );
    }

    #[tokio::test]
    async fn graceful_close_echoes_peer_close() {
        let (mut conn, mut client) = pair();

        let close_body = build_close_body(CLOSE_NORMAL, "bye");
        client
            .write_all(&client_frame(OpCode::Close, &close_body, true))
            .await
            .unwrap();

        let msg = conn.recv().await.unwrap();
        assert_eq!(msg.close_code(), Some((CLOSE_NORMAL, "bye".to_string())));
        // recv is end-of-stream after a CLOSE.
        assert!(matches!(conn.recv().await, Err(Error::ConnectionClosed)));

        conn.close_graceful(CLOSE_NORMAL, "").await.unwrap();

        // The echo is byte-for-byte.
        let mut buf = BytesMut::new();
        let (header, body) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(&body[..], &close_body[..]);

        // Socket is closed afterwards.
        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap(), 0);
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_close_times_out() {
        let (mut conn, mut client) = pair();

        // Peer never answers our CLOSE; the drain must give up after the
        // close timeout instead of hanging.
        conn.close_graceful(CLOSE_NORMAL, "going away").await.unwrap();
        assert!(conn.is_closed());

        let mut buf = BytesMut::new();
        let (header, body) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(
            parse_close_body(&body),
            (CLOSE_NORMAL, "going away".to_string())
        );
        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn no_data_frame_after_close_sent() {
        let (mut conn, _client) = pair();

        conn.send_close(CLOSE_NORMAL, "").await.unwrap();
        assert!(conn.sent_close().is_some());
        assert!(matches!(
            conn.send_text("late").await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    #[should_panic(expected = "control frame payload exceeds")]
    async fn oversized_control_frame_panics() {
        let (mut conn, _client) = pair();
        let _ = conn.send_ping(vec![0u8; 126]).await;
    }

    #[tokio::test]
    async fn streaming_reader_spans_fragments() {
        let (mut conn, mut client) = pair();

        let mut wire = Vec::new();
        wire.extend(client_frame(OpCode::Binary, b"abc", false));
        wire.extend(client_frame(OpCode::Ping, b"k", true));
        wire.extend(client_frame(OpCode::Continuation, b"defg", true));
        client.write_all(&wire).await.unwrap();

        let mut reader = conn.message_reader();
        let mut collected = Vec::new();
        let mut pings = 0;
        loop {
            let mut chunk = [0u8; 2];
            match reader.read(&mut chunk).await.unwrap() {
                MessageRead::Data(n) => collected.extend_from_slice(&chunk[..n]),
                MessageRead::Control(msg) => {
                    assert!(msg.is_ping());
                    pings += 1;
                }
                MessageRead::End => break,
            }
        }
        assert_eq!(collected, b"abcdefg");
        assert_eq!(pings, 1);
    }

    #[tokio::test]
    async fn streaming_reader_terminal_after_close() {
        let (mut conn, mut client) = pair();

        let close_body = build_close_body(CLOSE_NORMAL, "");
        client
            .write_all(&client_frame(OpCode::Close, &close_body, true))
            .await
            .unwrap();

        let mut reader = conn.message_reader();
        let mut chunk = [0u8; 8];
        match reader.read(&mut chunk).await.unwrap() {
            MessageRead::Control(msg) => assert!(msg.is_close()),
            other => panic!("expected close control, got {:?}", other),
        }
        assert_eq!(reader.read(&mut chunk).await.unwrap(), MessageRead::End);
        assert!(conn.rcvd_close().is_some());
    }

    #[tokio::test]
    async fn streaming_writer_emits_continuations_and_terminator() {
        let (mut conn, mut client) = pair();

        let mut writer = conn.message_writer(false);
        writer.write(b"Hel").await.unwrap();
        writer.write(b"lo").await.unwrap();
        writer.finish().await.unwrap();

        let mut buf = BytesMut::new();
        let (h1, b1) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!((h1.opcode, h1.fin), (OpCode::Text, false));
        assert_eq!(&b1[..], b"Hel");

        let (h2, b2) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!((h2.opcode, h2.fin), (OpCode::Continuation, false));
        assert_eq!(&b2[..], b"lo");

        let (h3, b3) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!((h3.opcode, h3.fin), (OpCode::Continuation, true));
        assert!(b3.is_empty());
    }

    #[tokio::test]
    async fn streaming_writer_is_closed_after_finish() {
        let (mut conn, _client) = pair();
        let mut writer = conn.message_writer(false);
        writer.write(b"one").await.unwrap();
        writer.finish().await.unwrap();
        assert!(matches!(
            writer.write(b"two").await,
            Err(Error::MessageClosed)
        ));
        assert!(matches!(writer.finish().await, Err(Error::MessageClosed)));
    }

    #[tokio::test]
    async fn streaming_writer_rejects_use_after_close_sent() {
        let (mut conn, _client) = pair();
        conn.send_close(CLOSE_NORMAL, "").await.unwrap();
        let mut writer = conn.message_writer(true);
        assert!(matches!(
            writer.write(b"data").await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn split_halves_cooperate() {
        let (server_io, mut client) = tokio::io::duplex(64 * 1024);
        let conn = Connection::new(server_io, ConnOptions::default());
        let (mut reader, mut writer) = conn.split();

        // Writer closing the socket wakes a blocked reader.
        let read_task = tokio::spawn(async move { reader.recv().await });
        tokio::task::yield_now().await;
        writer.close_socket().await;
        let res = read_task.await.unwrap();
        assert!(matches!(res, Err(Error::ConnectionClosed)));

        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_length_final_frame() {
        let (mut conn, mut client) = pair();
        client
            .write_all(&client_frame(OpCode::Text, b"", true))
            .await
            .unwrap();
        assert_eq!(conn.recv().await.unwrap(), Message::text(""));
    }
}
