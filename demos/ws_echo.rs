//! Echo server: every data message is sent straight back.
//!
//! Run with `cargo run --example ws_echo`, then connect a client to
//! `ws://127.0.0.1:1234/`.

use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, Sender};
use wslite::{channel_handler, Config, HandshakeFn, Message, Result, Server};

async fn echo(mut inbound: Receiver<Message>, outbound: Sender<Message>) -> Result<()> {
    while let Some(msg) = inbound.recv().await {
        if outbound.send(msg).await.is_err() {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let handshake: HandshakeFn = Arc::new(|_req, _rsp| Some(channel_handler(echo, 1)));
    let config = Config::builder("0.0.0.0:1234", handshake)
        .max_msg_len(16 * 1024 * 1024)
        .sock_buffers(4 * 1024 * 1024, 4 * 1024 * 1024)
        .io_statistics(true)
        .log_level(wslite::LOG_INFO)
        .build();

    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .init();

    Server::new(config).serve().await
}
