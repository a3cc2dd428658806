use crate::dummy_logic::config::Config;
use crate::dummy_logic::state::AppState;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::IntoResponse,
    routing::get,
};
use futures_util::StreamExt;
use lib_sync::model::{WireFrame, WireMessage};
use serde_json::{Map, json};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

pub async fn run(config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let app = router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Realtime feed listening on ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Realtime feed shutting down.");
        })
        .await?;
    Ok(())
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

/// Generates a round of updates every `tick_ms` until shutdown.
pub async fn run_ticker(config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms()));
    let alert_probability = config.alert_probability();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                for update in app_state.tick(alert_probability).await {
                    // No receivers just means no clients are connected.
                    let _ = app_state.data_tx.send(std::sync::Arc::new(update));
                }
            }
        }
    }
    log::info!("Ticker stopped.");
}

async fn ws_handler(ws: WebSocketUpgrade, headers: HeaderMap, State(state): State<AppState>) -> impl IntoResponse {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer "));
    ws.on_upgrade(move |socket| handle_socket(socket, state, bearer))
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

fn market_status() -> WireMessage {
    let mut status = Map::new();
    status.insert("session".to_string(), json!("regular"));
    status.insert("open".to_string(), json!(true));
    status.insert("asOf".to_string(), json!(chrono::Utc::now().to_rfc3339()));
    WireMessage::MarketStatus(status)
}

async fn send_message(socket: &mut WebSocket, message: WireMessage) -> bool {
    match message.into_frame().encode() {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            log::error!("Failed to encode frame: {}", e);
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, bearer: bool) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    state.add_client(client_id).await;
    log::info!("Client {} connected (bearer token: {})", client_id, if bearer { "yes" } else { "no" });

    let mut data_rx = state.data_tx.subscribe();

    if send_message(&mut socket, market_status()).await {
        loop {
            tokio::select! {
                incoming = socket.next() => {
                    let Some(Ok(msg)) = incoming else { break };
                    match msg {
                        Message::Text(text) => match WireFrame::decode(text.as_str()) {
                            Ok(frame) => {
                                if !handle_request(&mut socket, &state, client_id, frame.message).await {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Client {} sent a malformed frame: {}", client_id, e),
                        },
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                update = data_rx.recv() => {
                    let update = match update {
                        Ok(update) => update,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("Client {} lagged, skipped {} updates", client_id, skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    let wanted = match &update.key {
                        Some(key) => state.is_subscribed(client_id, key).await,
                        None => true,
                    };
                    if wanted && socket.send(Message::Text(update.text.clone().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.remove_client(client_id).await;
    log::info!("Client {} disconnected", client_id);
}

/// Returns `false` once the socket can no longer be written.
async fn handle_request(socket: &mut WebSocket, state: &AppState, client_id: usize, message: WireMessage) -> bool {
    match message {
        WireMessage::Subscribe(keys) => {
            let added = state.subscribe(client_id, keys).await;
            log::debug!("Client {} subscribed to {:?}", client_id, added);
            for key in added {
                if let Some(snapshot) = state.snapshot(&key).await {
                    if !send_message(socket, snapshot).await {
                        return false;
                    }
                }
            }
            true
        }
        WireMessage::Unsubscribe(keys) => {
            log::debug!("Client {} unsubscribed from {:?}", client_id, keys);
            state.unsubscribe(client_id, keys).await;
            true
        }
        other => {
            log::debug!("Client {} sent unexpected {:?}", client_id, other.kind());
            true
        }
    }
}
