mod support;

use futures_util::{SinkExt, StreamExt};
use lib_sync::ingestors::{ConnectionStatus, ReconnectingChannel};
use lib_sync::model::{MessageKind, WireMessage};
use lib_sync::{ChannelConfig, SyncError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

use support::{accept_client, bind_feed, fast_config, next_json, wait_for};

/// Serves forever; while `healthy` is false every TCP connection is dropped
/// before the WebSocket handshake.
fn spawn_flaky_feed(listener: TcpListener, healthy: Arc<AtomicBool>, accepted: Arc<AtomicUsize>) {
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            if !healthy.load(Ordering::SeqCst) {
                drop(stream);
                continue;
            }
            tokio::spawn(async move {
                if let Ok(mut ws) = accept_async(stream).await {
                    while let Some(Ok(_)) = ws.next().await {}
                }
            });
        }
    });
}

fn record_statuses(channel: &ReconnectingChannel) -> Arc<Mutex<Vec<ConnectionStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _keep = channel.on_status_change(move |status| sink.lock().unwrap().push(*status));
    seen
}

#[test]
fn rejects_non_websocket_urls() {
    for url in ["http://127.0.0.1/ws", "not a url"] {
        let err = ReconnectingChannel::new(ChannelConfig::with_url(url)).err().expect("must reject");
        assert!(matches!(err, SyncError::InvalidUrl { .. }), "{url}: {err}");
    }
}

#[test]
fn send_without_a_link_fails_fast() {
    let channel = ReconnectingChannel::new(ChannelConfig::default()).unwrap();
    let err = channel.send(WireMessage::Subscribe(["AAPL".to_string()].into_iter().collect()));
    assert!(matches!(err, Err(SyncError::NotConnected)));
    assert_eq!(channel.status(), ConnectionStatus::Idle);
}

#[tokio::test]
async fn replays_before_queued_messages_on_every_open() {
    let (listener, url) = bind_feed().await;
    let channel = ReconnectingChannel::new(fast_config(&url)).unwrap();
    channel.set_replay(|| Some(WireMessage::Subscribe(["A".to_string(), "B".to_string()].into_iter().collect())));
    channel.connect();

    let mut first = accept_client(&listener).await;
    let replay = next_json(&mut first).await;
    assert_eq!(replay["type"], "SUBSCRIBE");
    assert_eq!(replay["data"]["symbols"], serde_json::json!(["A", "B"]));

    wait_for("OPEN", || channel.status() == ConnectionStatus::Open).await;
    channel
        .send(WireMessage::Unsubscribe(["A".to_string()].into_iter().collect()))
        .unwrap();
    assert_eq!(next_json(&mut first).await["type"], "UNSUBSCRIBE");

    // Server drops the link; the next link starts with the replay again.
    drop(first);
    let mut second = accept_client(&listener).await;
    let replay = next_json(&mut second).await;
    assert_eq!(replay["type"], "SUBSCRIBE");
    assert_eq!(replay["data"]["symbols"], serde_json::json!(["A", "B"]));

    channel.shutdown().await;
    assert_eq!(channel.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn close_cancels_the_scheduled_reconnect() {
    let (listener, url) = bind_feed().await;
    let config = ChannelConfig { base_delay_ms: 300, ..fast_config(&url) };
    let channel = ReconnectingChannel::new(config).unwrap();
    channel.connect();

    let ws = accept_client(&listener).await;
    drop(ws);
    wait_for("retry to be scheduled", || channel.reconnect_state().next_delay_ms == Some(300)).await;

    channel.close();
    assert_eq!(channel.status(), ConnectionStatus::Closed);
    assert!(!channel.is_running());

    let late = tokio::time::timeout(Duration::from_millis(600), listener.accept()).await;
    assert!(late.is_err(), "a reconnect fired after close()");
}

#[tokio::test]
async fn gives_up_after_max_attempts_until_connect_is_called() {
    let (listener, url) = bind_feed().await;
    let healthy = Arc::new(AtomicBool::new(false));
    let accepted = Arc::new(AtomicUsize::new(0));
    spawn_flaky_feed(listener, Arc::clone(&healthy), Arc::clone(&accepted));

    let config = ChannelConfig { max_attempts: 2, base_delay_ms: 10, ..fast_config(&url) };
    let channel = ReconnectingChannel::new(config).unwrap();
    let statuses = record_statuses(&channel);
    channel.connect();

    wait_for("FAILED", || channel.status() == ConnectionStatus::Failed).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 3, "initial try plus two retries");
    assert!(!channel.is_running());
    {
        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.first(), Some(&ConnectionStatus::Connecting));
        assert_eq!(statuses.last(), Some(&ConnectionStatus::Failed));
        assert!(statuses.contains(&ConnectionStatus::Closed));
    }

    healthy.store(true, Ordering::SeqCst);
    channel.connect();
    wait_for("OPEN after manual connect", || channel.status() == ConnectionStatus::Open).await;
    assert_eq!(channel.reconnect_state().attempt, 0);
    channel.shutdown().await;
}

#[tokio::test]
async fn attempt_counter_resets_only_after_stability_window() {
    let (listener, url) = bind_feed().await;
    let healthy = Arc::new(AtomicBool::new(false));
    let accepted = Arc::new(AtomicUsize::new(0));
    spawn_flaky_feed(listener, Arc::clone(&healthy), Arc::clone(&accepted));

    let config = ChannelConfig { stability_window_ms: 500, base_delay_ms: 50, ..fast_config(&url) };
    let channel = ReconnectingChannel::new(config).unwrap();
    channel.connect();

    wait_for("first failure", || accepted.load(Ordering::SeqCst) >= 1).await;
    healthy.store(true, Ordering::SeqCst);

    wait_for("OPEN", || channel.status() == ConnectionStatus::Open).await;
    assert_eq!(channel.reconnect_state().attempt, 1, "OPEN alone keeps the counter");
    wait_for("stability reset", || channel.reconnect_state().attempt == 0).await;
    channel.shutdown().await;
}

#[tokio::test]
async fn drops_malformed_frames_and_accepts_utf8_binary() {
    let (listener, url) = bind_feed().await;
    let channel = ReconnectingChannel::new(fast_config(&url)).unwrap();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let _h = {
        let kinds = Arc::clone(&kinds);
        channel.on_message(move |frame| kinds.lock().unwrap().push(frame.message.kind()))
    };
    channel.connect();

    let mut ws = accept_client(&listener).await;
    ws.send(Message::Text("{not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"PRICE_UPDATE","data":{"price":{}}}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Binary(
        br#"{"type":"PRICE_UPDATE","data":{"symbol":"AAPL","price":{"last":1.5}}}"#.to_vec().into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(r#"{"type":"ALERT","data":{"message":"halt"}}"#.into()))
        .await
        .unwrap();

    wait_for("two frames", || kinds.lock().unwrap().len() == 2).await;
    assert_eq!(*kinds.lock().unwrap(), vec![MessageKind::PriceUpdate, MessageKind::Alert]);
    assert_eq!(channel.status(), ConnectionStatus::Open);
    channel.shutdown().await;
}

#[tokio::test]
async fn unanswered_idle_ping_drops_the_link() {
    let (listener, url) = bind_feed().await;
    let config = ChannelConfig { idle_timeout_ms: 150, pong_timeout_ms: 100, ..fast_config(&url) };
    let channel = ReconnectingChannel::new(config).unwrap();
    channel.connect();

    // Never read, so the ping is never answered.
    let _silent = accept_client(&listener).await;
    let _second = accept_client(&listener).await;
    channel.shutdown().await;
}

#[tokio::test]
async fn quiet_but_responsive_feed_stays_open() {
    let (listener, url) = bind_feed().await;
    let healthy = Arc::new(AtomicBool::new(true));
    let accepted = Arc::new(AtomicUsize::new(0));
    spawn_flaky_feed(listener, healthy, Arc::clone(&accepted));

    let config = ChannelConfig { idle_timeout_ms: 150, pong_timeout_ms: 150, ..fast_config(&url) };
    let channel = ReconnectingChannel::new(config).unwrap();
    let statuses = record_statuses(&channel);
    channel.connect();

    wait_for("OPEN", || channel.status() == ConnectionStatus::Open).await;
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    assert_eq!(channel.status(), ConnectionStatus::Open);
    assert_eq!(accepted.load(Ordering::SeqCst), 1, "the link was never replaced");
    assert_eq!(*statuses.lock().unwrap(), vec![ConnectionStatus::Connecting, ConnectionStatus::Open]);
    channel.shutdown().await;
}

#[tokio::test]
async fn send_works_after_close_then_connect() {
    let (listener, url) = bind_feed().await;
    let channel = ReconnectingChannel::new(fast_config(&url)).unwrap();
    channel.connect();

    let _first = accept_client(&listener).await;
    wait_for("first OPEN", || channel.status() == ConnectionStatus::Open).await;

    channel.close();
    channel.connect();
    let mut second = accept_client(&listener).await;
    wait_for("second OPEN", || channel.status() == ConnectionStatus::Open).await;

    // Give the first session time to finish its exit path.
    tokio::time::sleep(Duration::from_millis(200)).await;
    channel
        .send(WireMessage::Subscribe(["AAPL".to_string()].into_iter().collect()))
        .unwrap();
    let request = next_json(&mut second).await;
    assert_eq!(request["type"], "SUBSCRIBE");
    assert_eq!(request["data"]["symbols"], serde_json::json!(["AAPL"]));
    channel.shutdown().await;
}

#[tokio::test]
async fn dropping_the_channel_cancels_the_scheduled_reconnect() {
    let (listener, url) = bind_feed().await;
    let config = ChannelConfig { base_delay_ms: 300, ..fast_config(&url) };
    let channel = ReconnectingChannel::new(config).unwrap();
    let statuses = record_statuses(&channel);
    channel.connect();

    let ws = accept_client(&listener).await;
    drop(ws);
    wait_for("retry to be scheduled", || {
        let seen = statuses.lock().unwrap();
        seen.len() == 4 && seen.last() == Some(&ConnectionStatus::Connecting)
    })
    .await;
    assert_eq!(channel.reconnect_state().next_delay_ms, Some(300));
    let seen_before = statuses.lock().unwrap().len();

    drop(channel);

    let late = tokio::time::timeout(Duration::from_millis(600), listener.accept()).await;
    assert!(late.is_err(), "a reconnect fired after the channel was dropped");
    assert_eq!(statuses.lock().unwrap().len(), seen_before, "no status reached the listener after drop");
}

#[tokio::test]
async fn sends_bearer_token_on_handshake() {
    let (listener, url) = bind_feed().await;
    let config = ChannelConfig { auth_token: Some("s3cret".to_string()), ..fast_config(&url) };
    let channel = ReconnectingChannel::new(config).unwrap();
    channel.connect();

    let (stream, _) = listener.accept().await.unwrap();
    let seen = Arc::new(Mutex::new(None));
    let header = Arc::clone(&seen);
    let _ws = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        *header.lock().unwrap() = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok::<Response, ErrorResponse>(resp)
    })
    .await
    .unwrap();

    assert_eq!(seen.lock().unwrap().as_deref(), Some("Bearer s3cret"));
    channel.shutdown().await;
}
