//! Loopback realtime feed helpers shared by the integration tests.

#![allow(dead_code)]

use futures_util::StreamExt;
use lib_sync::ChannelConfig;
use serde_json::Value;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

pub type FeedSocket = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

/// Binds a loopback listener and returns it with its `ws://` URL.
pub async fn bind_feed() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let url = format!("ws://{}/ws", listener.local_addr().expect("local addr"));
    (listener, url)
}

/// Accepts one client and completes the WebSocket handshake.
pub async fn accept_client(listener: &TcpListener) -> FeedSocket {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("client did not connect in time")
        .expect("accept");
    accept_async(stream).await.expect("server handshake")
}

/// Next text frame from the client, parsed as JSON.
pub async fn next_json(ws: &mut FeedSocket) -> Value {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next()).await.expect("no frame in time");
        match frame {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).expect("client sent JSON"),
            Some(Ok(_)) => continue,
            other => panic!("client stream ended: {:?}", other),
        }
    }
}

/// Short delays so reconnect tests finish quickly.
pub fn fast_config(url: &str) -> ChannelConfig {
    ChannelConfig {
        base_delay_ms: 20,
        cap_delay_ms: 200,
        stability_window_ms: 100,
        connect_timeout_ms: 2_000,
        idle_timeout_ms: 0,
        ..ChannelConfig::with_url(url)
    }
}

/// Polls `condition` every 10ms until it holds, panicking after a few seconds.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
