//! # Realtime WSS Channel
//!
//! A duplex JSON message channel over a WebSocket that reconnects on its own.
//!
//! ## Lifecycle
//! `IDLE -> CONNECTING -> OPEN`, then on a remote close, a read error or an
//! unanswered idle ping `OPEN -> CLOSED -> CONNECTING` (after the backoff delay) and
//! eventually `OPEN` again or `FAILED`. `FAILED` is terminal until the
//! application calls [`ReconnectingChannel::connect`] again.
//!
//! Every fresh link first sends the replay message (the full subscription
//! set) before anything the application queued, so the server never has to
//! remember subscriptions from an earlier connection.
//!
//! A link that stays silent for `idle_timeout_ms` is pinged; it is only
//! treated as dead if nothing at all arrives within `pong_timeout_ms` after.
//!
//! `close()` cancels the run loop, including a pending reconnect timer.

use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::configs::config_sync::ChannelConfig;
use crate::core::listeners::{ListenerSet, Unsubscribe};
use crate::error::{Result, SyncError};
use crate::ingestors::backoff::{BackoffPolicy, ConnectionStatus, ReconnectState};
use crate::model::wire::{WireFrame, WireMessage};
use crate::utils::lock;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Produces the message sent first on every fresh link, typically a
/// `SUBSCRIBE` for everything currently tracked. `None` sends nothing.
pub type ReplaySource = Arc<dyn Fn() -> Option<WireMessage> + Send + Sync>;

/// Payload prefix kept when logging a malformed frame.
const LOGGED_PAYLOAD_CHARS: usize = 200;

struct Shared {
    config: ChannelConfig,
    policy: BackoffPolicy,
    state: Mutex<ReconnectState>,
    /// Present only while a link is up; dropping it discards anything queued.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    messages: ListenerSet<WireFrame>,
    statuses: ListenerSet<ConnectionStatus>,
    replay: Mutex<Option<ReplaySource>>,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// # Reconnecting Channel
pub struct ReconnectingChannel {
    shared: Arc<Shared>,
    run: Mutex<Option<RunHandle>>,
}

impl ReconnectingChannel {
    /// Validates the configuration. Nothing connects until [`connect`](Self::connect).
    pub fn new(config: ChannelConfig) -> Result<Self> {
        let parsed = url::Url::parse(&config.url).map_err(|e| SyncError::InvalidUrl {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidUrl {
                url: config.url.clone(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        Ok(Self {
            shared: Arc::new(Shared {
                policy: BackoffPolicy::from(&config),
                config,
                state: Mutex::new(ReconnectState::default()),
                outbound: Mutex::new(None),
                messages: ListenerSet::new(),
                statuses: ListenerSet::new(),
                replay: Mutex::new(None),
            }),
            run: Mutex::new(None),
        })
    }

    /// Starts (or, after `FAILED`/`close()`, restarts) the run loop with a
    /// fresh attempt counter. A no-op while the loop is already running.
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let mut run = lock(&self.run);
        if run.as_ref().is_some_and(|r| !r.cancel.is_cancelled() && !r.task.is_finished()) {
            log::debug!("Realtime channel already running");
            return;
        }

        lock(&self.shared.state).reset();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(Arc::clone(&self.shared), cancel.clone()));
        *run = Some(RunHandle { cancel, task });
    }

    /// Stops the channel: closes the link, cancels any scheduled retry and
    /// reports `CLOSED`. Returns without waiting for the loop to exit.
    pub fn close(&self) {
        if let Some(run) = lock(&self.run).as_ref() {
            run.cancel.cancel();
        }
        lock(&self.shared.outbound).take();
        self.shared.transition(None, ReconnectState::on_link_closed);
    }

    /// [`close`](Self::close), then waits for the run loop to finish.
    pub async fn shutdown(&self) {
        self.close();
        let run = lock(&self.run).take();
        if let Some(run) = run {
            if let Err(e) = run.task.await {
                log::warn!("Realtime channel task ended abnormally: {}", e);
            }
        }
    }

    /// Queues `message` on the open link.
    ///
    /// Fails with [`SyncError::NotConnected`] when no link is up; nothing is
    /// buffered across reconnects.
    pub fn send(&self, message: WireMessage) -> Result<()> {
        let text = message.into_frame().encode()?;
        let outbound = lock(&self.shared.outbound);
        let sender = outbound.as_ref().ok_or(SyncError::NotConnected)?;
        sender.send(text).map_err(|_| SyncError::NotConnected)
    }

    /// Registers a listener for every well-formed inbound frame.
    pub fn on_message<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&WireFrame) + Send + Sync + 'static,
    {
        self.shared.messages.add(listener)
    }

    /// Registers a listener for status transitions.
    pub fn on_status_change<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.shared.statuses.add(listener)
    }

    /// Installs the message replayed first on every fresh link.
    pub fn set_replay<F>(&self, source: F)
    where
        F: Fn() -> Option<WireMessage> + Send + Sync + 'static,
    {
        *lock(&self.shared.replay) = Some(Arc::new(source));
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.shared.state).status
    }

    /// Snapshot of the reconnect bookkeeping.
    pub fn reconnect_state(&self) -> ReconnectState {
        *lock(&self.shared.state)
    }

    /// `true` while the run loop is connecting, open or waiting to retry.
    pub fn is_running(&self) -> bool {
        lock(&self.run)
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled() && !r.task.is_finished())
    }

    /// The configuration in use.
    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }
}

impl Drop for ReconnectingChannel {
    fn drop(&mut self) {
        if let Some(run) = lock(&self.run).take() {
            run.cancel.cancel();
        }
    }
}

impl Shared {
    /// Applies `f` and emits the new status if it changed.
    ///
    /// With a token, nothing happens once it is cancelled, so a loop that lost
    /// the race against `close()` cannot resurrect the channel.
    fn transition<R>(&self, cancel: Option<&CancellationToken>, f: impl FnOnce(&mut ReconnectState) -> R) -> Option<R> {
        let (result, changed) = {
            let mut state = lock(&self.state);
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return None;
            }
            let before = state.status;
            let result = f(&mut state);
            (result, (state.status != before).then_some(state.status))
        };
        if let Some(status) = changed {
            log::debug!("Realtime channel status: {}", status);
            self.statuses.emit(&status);
        }
        Some(result)
    }

    fn replay_text(&self) -> Option<String> {
        let source = lock(&self.replay).clone()?;
        let message = source()?;
        match message.into_frame().encode() {
            Ok(text) => Some(text),
            Err(e) => {
                log::warn!("Could not encode replay message: {}", e);
                None
            }
        }
    }

    /// Clears the outbound slot if it still holds `own`; a newer session's
    /// sender is left alone.
    fn release_outbound(&self, own: &mpsc::UnboundedSender<String>) {
        let mut outbound = lock(&self.outbound);
        if outbound.as_ref().is_some_and(|current| current.same_channel(own)) {
            outbound.take();
        }
    }

    fn dispatch(&self, text: &str) {
        match WireFrame::decode(text) {
            Ok(frame) => self.messages.emit(&frame),
            Err(e) => {
                let preview: String = text.chars().take(LOGGED_PAYLOAD_CHARS).collect();
                log::warn!("Dropping realtime frame: {} (payload: {})", e, preview);
            }
        }
    }
}

async fn run_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        if shared.transition(Some(&cancel), ReconnectState::on_connecting).is_none() {
            return;
        }

        log::info!("Connecting to realtime feed: {}", shared.config.url);
        let link = tokio::select! {
            _ = cancel.cancelled() => return,
            link = open_link(&shared.config) => link,
        };
        match link {
            Ok(ws) => {
                log::info!("Realtime channel open: {}", shared.config.url);
                run_session(&shared, &cancel, ws).await;
            }
            Err(e) => log::warn!("Realtime connect failed: {}", e),
        }

        if shared.transition(Some(&cancel), ReconnectState::on_link_closed).is_none() {
            return;
        }
        let Some(retry) = shared.transition(Some(&cancel), |state| state.on_closed(&shared.policy)) else {
            return;
        };
        let Some(delay) = retry else {
            log::error!(
                "Realtime channel FAILED after {} consecutive attempts; call connect() to resume",
                shared.policy.max_attempts
            );
            return;
        };

        log::warn!(
            "Realtime channel down; retry {}/{} in {}ms",
            lock(&shared.state).attempt,
            shared.policy.max_attempts,
            delay.as_millis()
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn open_link(config: &ChannelConfig) -> Result<WsStream> {
    let mut request = config.url.as_str().into_client_request().map_err(|e| SyncError::InvalidUrl {
        url: config.url.clone(),
        reason: e.to_string(),
    })?;
    if let Some(token) = &config.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| SyncError::Handshake(format!("unusable auth token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (ws, _response) = tokio::time::timeout(config.connect_timeout(), connect_async(request))
        .await
        .map_err(|_| SyncError::Handshake(format!("timed out after {}ms", config.connect_timeout_ms)))?
        .map_err(|e| SyncError::Handshake(e.to_string()))?;
    Ok(ws)
}

/// Drives one link until it drops or the channel is closed.
async fn run_session(shared: &Shared, cancel: &CancellationToken, ws: WsStream) {
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let own = tx.clone();

    // Install the sender before computing the replay: anything queued from
    // here on is written after the replay, anything earlier is in it.
    *lock(&shared.outbound) = Some(tx);
    if let Some(text) = shared.replay_text() {
        if let Err(e) = write.send(Message::Text(text.into())).await {
            log::warn!("Replay send failed: {}", e);
            shared.release_outbound(&own);
            return;
        }
    }
    if shared.transition(Some(cancel), ReconnectState::on_open).is_none() {
        shared.release_outbound(&own);
        return;
    }

    let stability = tokio::time::sleep(shared.config.stability_window());
    tokio::pin!(stability);
    let mut stable = false;
    let idle = shared.config.idle_timeout();
    let mut last_inbound = Instant::now();
    let mut ping_sent: Option<Instant> = None;

    loop {
        let idle_deadline = match ping_sent {
            Some(sent) => Some(sent + shared.config.pong_timeout()),
            None => idle.map(|timeout| last_inbound + timeout),
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            _ = &mut stability, if !stable => {
                stable = true;
                shared.transition(Some(cancel), ReconnectState::on_stable);
                log::debug!("Realtime link stable; attempt counter reset");
            }
            Some(text) = rx.recv() => {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    log::warn!("Realtime write failed: {}", e);
                    break;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_inbound = Instant::now();
                    ping_sent = None;
                    shared.dispatch(text.as_str());
                }
                Some(Ok(Message::Binary(bytes))) => {
                    last_inbound = Instant::now();
                    ping_sent = None;
                    match std::str::from_utf8(&bytes) {
                        Ok(text) => shared.dispatch(text),
                        Err(_) => log::warn!("Dropping non-UTF-8 binary frame ({} bytes)", bytes.len()),
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    last_inbound = Instant::now();
                    ping_sent = None;
                }
                Some(Ok(Message::Close(frame))) => {
                    log::info!("Realtime feed closed the link: {:?}", frame);
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    log::warn!("Realtime read error: {}", e);
                    break;
                }
                None => {
                    log::warn!("Realtime stream ended by remote host");
                    break;
                }
            },
            _ = idle_expiry(idle_deadline) => {
                if ping_sent.is_some() {
                    log::warn!(
                        "Idle ping unanswered for {}ms; treating link as dead",
                        shared.config.pong_timeout_ms
                    );
                    break;
                }
                log::debug!("No realtime frame for {}ms; pinging", shared.config.idle_timeout_ms);
                if let Err(e) = write.send(Message::Ping(Default::default())).await {
                    log::warn!("Realtime ping failed: {}", e);
                    break;
                }
                ping_sent = Some(Instant::now());
            }
        }
    }

    shared.release_outbound(&own);
}

async fn idle_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ended_session_leaves_a_newer_sender_in_place() {
        let channel = ReconnectingChannel::new(ChannelConfig::default()).unwrap();
        let (old_tx, _old_rx) = mpsc::unbounded_channel::<String>();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel::<String>();
        *lock(&channel.shared.outbound) = Some(new_tx.clone());

        channel.shared.release_outbound(&old_tx);
        channel
            .send(WireMessage::Unsubscribe(["A".to_string()].into_iter().collect()))
            .unwrap();
        assert!(new_rx.try_recv().unwrap().contains("UNSUBSCRIBE"));

        channel.shared.release_outbound(&new_tx);
        assert!(lock(&channel.shared.outbound).is_none());
    }
}
