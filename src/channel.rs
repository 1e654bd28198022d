//! Channel adapter
//!
//! Bridges a connection to an application handler of shape
//! `handler(inbound, outbound)`, where `inbound` is a receive-only stream
//! of data messages and `outbound` a send-only stream. Two cooperating
//! tasks share the connection through the bounded queues:
//!
//! - the **reader task** forwards data messages to `inbound`, answers
//!   PING with PONG, drops PONG, and on CLOSE (or any error) closes
//!   `inbound` and enqueues the terminating CLOSE onto `outbound`;
//! - the **writer task** sends everything from `outbound`; after a CLOSE
//!   goes out it drains until the close handshake completes or the close
//!   timeout elapses, then closes the socket.
//!
//! Handler code never sees a control frame.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::connection::{ConnReader, ConnWriter, Connection};
use crate::error::Result;
use crate::message::Message;
use crate::server::{Handler, HandlerFuture};

/// Run a channel handler over a connection
///
/// Both queues are bounded to `capacity`. The handler finishes by
/// returning (or by dropping `outbound`); its result is mapped onto the
/// final CLOSE (1000 on success, see
/// [`close_code_for`](crate::message::close_code_for) otherwise), and the
/// call returns once the writer has drained and closed the socket.
pub async fn run_channel_handler<S, H, Fut>(
    conn: Connection<S>,
    capacity: usize,
    handler: H,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: FnOnce(mpsc::Receiver<Message>, mpsc::Sender<Message>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let capacity = capacity.max(1);
    let (reader, writer) = conn.split();
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    let reader_task = tokio::spawn(read_loop(reader, inbound_tx, outbound_tx.clone()));
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx));

    let result = handler(inbound_rx, outbound_tx.clone()).await;

    // Exactly one terminating CLOSE reaches the writer on the local path;
    // the send fails harmlessly if the remote side already completed the
    // close handshake and the writer is gone.
    let _ = outbound_tx
        .send(Message::close_on_error(result.as_ref().err()))
        .await;
    drop(outbound_tx);

    let _ = writer_task.await;
    let _ = reader_task.await;
    result
}

/// Adapt a channel handler into a server [`Handler`]
///
/// `capacity` bounds both queues, as in [`run_channel_handler`].
pub fn channel_handler<H, Fut>(handler: H, capacity: usize) -> Handler
where
    H: FnOnce(mpsc::Receiver<Message>, mpsc::Sender<Message>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |conn| -> HandlerFuture {
        Box::pin(run_channel_handler(conn, capacity, handler))
    })
}

async fn read_loop<S>(
    mut reader: ConnReader<S>,
    inbound: mpsc::Sender<Message>,
    outbound: mpsc::Sender<Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match reader.recv().await {
            Ok(msg) => match msg {
                Message::Ping(body) => {
                    if outbound.send(Message::Pong(body)).await.is_err() {
                        return;
                    }
                }
                Message::Pong(_) => {}
                Message::Close(_) => {
                    // Close the handler-visible stream, then echo the CLOSE
                    // back through the writer.
                    drop(inbound);
                    let _ = outbound.send(msg).await;
                    return;
                }
                data => {
                    // A send error means the handler hung up on inbound;
                    // keep reading so control frames are still served.
                    let _ = inbound.send(data).await;
                }
            },
            Err(e) => {
                debug!(error = %e, "reader terminating");
                drop(inbound);
                let _ = outbound.send(Message::close_on_error(Some(&e))).await;
                return;
            }
        }
    }
}

async fn write_loop<S>(mut writer: ConnWriter<S>, mut outbound: mpsc::Receiver<Message>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let Some(msg) = outbound.recv().await else {
            // Every sender dropped without a terminating CLOSE.
            warn!("outbound queue closed without a close frame");
            writer.close_socket().await;
            return;
        };
        let is_close = msg.is_close();
        if let Err(e) = writer.send(msg).await {
            error!(error = %e, "send failed");
            writer.close_socket().await;
            return;
        }
        if is_close {
            break;
        }
    }

    // Drain mode. For a locally initiated close we wait for the remote
    // CLOSE (observed by the reader); for an echoed close we wait for the
    // handler's terminating CLOSE or queue shutdown.
    let local_initiated = !writer.shared().rcvd_close();
    let deadline = tokio::time::sleep(writer.shared().close_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                None => break,
                Some(msg) => {
                    if local_initiated {
                        if writer.shared().rcvd_close() {
                            break;
                        }
                    } else if msg.is_close() {
                        break;
                    }
                }
            },
            _ = &mut deadline => {
                warn!(local_initiated, "timeout while closing connection");
                break;
            }
        }
    }
    writer.close_socket().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnOptions;
    use crate::error::Error;
    use crate::frame::{FrameHeader, OpCode};
    use crate::mask::apply_mask;
    use crate::message::{build_close_body, parse_close_body, CLOSE_INTERNAL, CLOSE_NORMAL};
    use bytes::{BufMut, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn client_frame(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        let key = [0xde, 0xad, 0xbe, 0xef];
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

    async fn read_server_frame(
        io: &mut DuplexStream,
        buf: &mut BytesMut,
    ) -> (FrameHeader, BytesMut) {
        loop {
            if let Some(header) = FrameHeader::parse(buf, false).unwrap() {
                let len = header.payload_len as usize;
                while buf.len() < len {
                    io.read_buf(buf).await.unwrap();
                }
                let body = buf.split_to(len);
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

    async fn echo(
        mut inbound: mpsc::Receiver<Message>,
        outbound: mpsc::Sender<Message>,
    ) -> Result<()> {
        while let Some(msg) = inbound.recv().await {
            if outbound.send(msg).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn fragmented_message_with_ping_is_echoed() {
        let (conn, mut client) = pair();
        let adapter = tokio::spawn(run_channel_handler(conn, 1, echo));

        // TEXT(fin=0, "Hel"), PING("p"), CONT(fin=1, "lo")
        let mut wire = Vec::new();
        wire.extend(client_frame(OpCode::Text, b"Hel", false));
        wire.extend(client_frame(OpCode::Ping, b"p", true));
        wire.extend(client_frame(OpCode::Continuation, b"lo", true));
        client.write_all(&wire).await.unwrap();

        // PONG first (control path), then the assembled echo.
        let mut buf = BytesMut::new();
        let (header, body) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!(header.opcode, OpCode::Pong);
        assert_eq!(&body[..], b"p");

        let (header, body) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!(header.opcode, OpCode::Text);
        assert_eq!(&body[..], b"Hello");

        // Client closes; the adapter echoes and shuts the socket down.
        let close_body = build_close_body(CLOSE_NORMAL, "");
        client
            .write_all(&client_frame(OpCode::Close, &close_body, true))
            .await
            .unwrap();
        let (header, body) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(&body[..], &close_body[..]);

        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap(), 0);
        adapter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_error_maps_to_internal_close() {
        async fn failing(
            mut inbound: mpsc::Receiver<Message>,
            _outbound: mpsc::Sender<Message>,
        ) -> Result<()> {
            let _ = inbound.recv().await;
            Err(Error::Io(std::io::Error::other("boom")))
        }

        let (conn, mut client) = pair();
        let adapter = tokio::spawn(run_channel_handler(conn, 1, failing));

        client
            .write_all(&client_frame(OpCode::Text, b"hi", true))
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        let (header, body) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(
            parse_close_body(&body),
            (CLOSE_INTERNAL, "internal".to_string())
        );

        // Answer the close handshake so the drain finishes promptly.
        client
            .write_all(&client_frame(OpCode::Close, &body, true))
            .await
            .unwrap();
        assert!(adapter.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn handler_return_closes_with_1000() {
        async fn one_shot(
            mut inbound: mpsc::Receiver<Message>,
            outbound: mpsc::Sender<Message>,
        ) -> Result<()> {
            if let Some(msg) = inbound.recv().await {
                let _ = outbound.send(msg).await;
            }
            Ok(())
        }

        let (conn, mut client) = pair();
        let adapter = tokio::spawn(run_channel_handler(conn, 1, one_shot));

        client
            .write_all(&client_frame(OpCode::Text, b"once", true))
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        let (header, _) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!(header.opcode, OpCode::Text);

        let (header, body) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(parse_close_body(&body), (CLOSE_NORMAL, String::new()));

        // Complete the handshake from the client side.
        client
            .write_all(&client_frame(OpCode::Close, &body, true))
            .await
            .unwrap();
        adapter.await.unwrap().unwrap();

        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn local_close_times_out_when_peer_is_silent() {
        async fn quit_immediately(
            _inbound: mpsc::Receiver<Message>,
            _outbound: mpsc::Sender<Message>,
        ) -> Result<()> {
            Ok(())
        }

        let (conn, mut client) = pair();
        let adapter = tokio::spawn(run_channel_handler(conn, 1, quit_immediately));

        let mut buf = BytesMut::new();
        let (header, body) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(parse_close_body(&body).0, CLOSE_NORMAL);

        // Never answer: the writer gives up after the close timeout.
        adapter.await.unwrap().unwrap();
        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversize_message_closes_with_1009() {
        let (server_io, mut client) = tokio::io::duplex(64 * 1024);
        let conn = Connection::new(
            server_io,
            ConnOptions {
                max_msg_len: 8,
                ..ConnOptions::default()
            },
        );
        let adapter = tokio::spawn(run_channel_handler(conn, 1, echo));

        client
            .write_all(&client_frame(OpCode::Binary, &[0u8; 9], true))
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        let (header, body) = read_server_frame(&mut client, &mut buf).await;
        assert_eq!(header.opcode, OpCode::Close);
        assert_eq!(parse_close_body(&body).0, crate::message::CLOSE_TOO_LARGE);

        // The handler itself never saw a message and returns cleanly once
        // inbound closes.
        drop(client);
        adapter.await.unwrap().unwrap();
    }
}
