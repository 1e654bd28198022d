//! Countdown server: send a number, get one tick per second and a final
//! "boom!"; send 0 to hang up.
//!
//! Run with `cargo run --example ws_countdown`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{Receiver, Sender};
use wslite::{channel_handler, Config, HandshakeFn, Message, Result, Server};

async fn countdown(mut inbound: Receiver<Message>, outbound: Sender<Message>) -> Result<()> {
    while let Some(msg) = inbound.recv().await {
        let text = msg.as_text().unwrap_or_default();
        let mut n: u32 = match text.trim().parse() {
            Ok(n) => n,
            Err(e) => {
                let _ = outbound.send(Message::text(e.to_string())).await;
                continue;
            }
        };
        if n == 0 {
            break;
        }
        while n > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if outbound
                .send(Message::text(format!("{}...", n)))
                .await
                .is_err()
            {
                return Ok(());
            }
            n -= 1;
        }
        let _ = outbound.send(Message::text("boom!")).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let handshake: HandshakeFn = Arc::new(|_req, _rsp| Some(channel_handler(countdown, 1)));
    let config = Config::builder("0.0.0.0:1234", handshake)
        .max_msg_len(16 * 1024 * 1024)
        .log_level(wslite::LOG_INFO)
        .build();

    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .init();

    Server::new(config).serve().await
}
