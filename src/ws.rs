//! Connection client: owns the WebSocket to the control plane, the
//! hello/auth handshake, reconnect with exponential backoff, the ping
//! keepalive, and the bounded outbound queue with overflow detection.
//!
//! A single supervising task owns both the socket and the outbound
//! receiver, so there is exactly one socket writer by construction. Every
//! other component enqueues through the non-blocking [`EventSink`] seam.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::config::{DEFAULT_PING_INTERVAL, DEFAULT_RECONNECT_DELAY};
use crate::error::{Result, WatcherError};
use crate::logging::LogForwarder;
use crate::protocol::{
    AuthData, Command, EventPayload, HelloData, Inbound, LogData, OutboundMessage,
    WatcherConfigData, REJECTED_TOKEN,
};

const OUTBOUND_QUEUE_CAPACITY: usize = 10_000;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const PING_WRITE_DEADLINE: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Non-blocking emission seam used by the watcher, scanner, and deleter.
/// The client implements it by enqueueing; tests substitute a collector.
pub trait EventSink: Send + Sync {
    fn emit(&self, payload: EventPayload);
}

/// Callbacks injected by the supervisor.
#[async_trait]
pub trait ClientHandler: Send + Sync {
    /// A `watcher.config` payload arrived (or the rejection sentinel).
    async fn on_config(&self, config: WatcherConfigData);
    /// A command frame arrived.
    async fn on_command(&self, command: Command);
    /// Reconnected after messages were dropped; full resync required.
    async fn on_reconnect(&self);
}

enum SessionEnd {
    Shutdown,
    ConnectionLost,
    /// First approval arrived mid-session; re-dial so the next session
    /// runs the authenticated handshake.
    Reauthenticate,
}

/// Where the client currently sits in the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Hello sent, nothing heard back yet.
    Introducing,
    PendingApproval,
    /// Auth sent in answer to a challenge.
    Authenticating,
    Ready,
    Rejected,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    url: String,
    watcher_id: String,
    state: RwLock<ConnectionState>,
    token: RwLock<Option<String>>,
    config_hash: RwLock<String>,
    reconnect_delay_ms: AtomicU64,
    ping_interval_ms: AtomicU64,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    /// Set when the queue overflows; cleared when the resync fires.
    overflowed: AtomicBool,
    was_connected: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Client {
    pub fn new(url: impl Into<String>, watcher_id: impl Into<String>) -> Self {
        Self::with_queue_capacity(url, watcher_id, OUTBOUND_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(
        url: impl Into<String>,
        watcher_id: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                url: url.into(),
                watcher_id: watcher_id.into(),
                state: RwLock::new(ConnectionState::Disconnected),
                token: RwLock::new(None),
                config_hash: RwLock::new(String::new()),
                reconnect_delay_ms: AtomicU64::new(DEFAULT_RECONNECT_DELAY.as_millis() as u64),
                ping_interval_ms: AtomicU64::new(DEFAULT_PING_INTERVAL.as_millis() as u64),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                overflowed: AtomicBool::new(false),
                was_connected: AtomicBool::new(false),
                shutdown_tx,
                shutdown_rx,
            }),
        }
    }

    pub fn watcher_id(&self) -> &str {
        &self.inner.watcher_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner
            .state
            .read()
            .map(|guard| *guard)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut guard) = self.inner.state.write() {
            *guard = state;
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.inner.token.write() {
            *guard = Some(token.into());
        }
    }

    pub fn clear_token(&self) {
        if let Ok(mut guard) = self.inner.token.write() {
            *guard = None;
        }
    }

    pub fn token(&self) -> Option<String> {
        self.inner.token.read().ok().and_then(|guard| guard.clone())
    }

    pub fn config_hash(&self) -> String {
        self.inner
            .config_hash
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn set_config_hash(&self, hash: String) {
        if let Ok(mut guard) = self.inner.config_hash.write() {
            *guard = hash;
        }
    }

    pub fn set_reconnect_delay(&self, delay: Duration) {
        self.inner
            .reconnect_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_ping_interval(&self, interval: Duration) {
        self.inner
            .ping_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.inner.reconnect_delay_ms.load(Ordering::Relaxed))
    }

    fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.inner.ping_interval_ms.load(Ordering::Relaxed))
    }

    /// True once the queue has overflowed and the resync has not yet run.
    pub fn has_dropped_messages(&self) -> bool {
        self.inner.overflowed.load(Ordering::SeqCst)
    }

    /// Enqueue a message without blocking. On a full queue the message is
    /// dropped and the overflow flag set; gap recovery is the resync scan,
    /// not retransmission.
    pub fn send(&self, payload: EventPayload) {
        let kind = payload.kind();
        match self.inner.outbound_tx.try_send(OutboundMessage::new(payload)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !self.inner.overflowed.swap(true, Ordering::SeqCst) {
                    warn!(
                        kind,
                        "outbound queue full, dropping events; a resync scan will run after reconnection"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Signal shutdown. Idempotent; the supervising task writes a close
    /// frame best-effort and exits.
    pub fn close(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    /// Drive the connection until shutdown: dial with backoff, send hello,
    /// then run the session loop. Call exactly once.
    pub async fn run(&self, handler: Arc<dyn ClientHandler>) -> Result<()> {
        let mut rx = self
            .inner
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| WatcherError::Internal("connection client already running".into()))?;

        let mut shutdown = self.inner.shutdown_rx.clone();
        let mut delay = self.reconnect_delay();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            let mut ws = match connect_async(self.inner.url.as_str()).await {
                Ok((ws, _response)) => ws,
                Err(err) => {
                    self.set_state(ConnectionState::Disconnected);
                    warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "connection failed, retrying"
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                    continue;
                }
            };

            let is_reconnect = self.inner.was_connected.swap(true, Ordering::SeqCst);
            delay = self.reconnect_delay();
            info!(url = %self.inner.url, reconnect = is_reconnect, "connected");

            if let Err(err) = self.send_hello(&mut ws).await {
                warn!(error = %err, "failed to send hello");
                self.set_state(ConnectionState::Disconnected);
                continue;
            }
            self.set_state(ConnectionState::Introducing);

            crate::logging::set_forwarder(Some(Arc::new(self.clone())));

            if is_reconnect && self.inner.overflowed.swap(false, Ordering::SeqCst) {
                warn!("events were dropped while disconnected, triggering resync scan");
                let resync_handler = Arc::clone(&handler);
                tokio::spawn(async move { resync_handler.on_reconnect().await });
            }

            let end = self.session(&mut ws, &mut rx, &handler, &mut shutdown).await;
            if self.state() != ConnectionState::Rejected {
                self.set_state(ConnectionState::Disconnected);
            }
            match end {
                SessionEnd::Shutdown => {
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(());
                }
                SessionEnd::Reauthenticate => {
                    let _ = ws.send(Message::Close(None)).await;
                }
                SessionEnd::ConnectionLost => {}
            }
        }
    }

    async fn send_hello(&self, ws: &mut WsStream) -> Result<()> {
        let hello = OutboundMessage::new(EventPayload::Hello(HelloData {
            watcher_id: self.inner.watcher_id.clone(),
            hostname: hostname(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }));
        ws.send(Message::Text(serde_json::to_string(&hello)?)).await?;
        Ok(())
    }

    async fn session(
        &self,
        ws: &mut WsStream,
        rx: &mut mpsc::Receiver<OutboundMessage>,
        handler: &Arc<dyn ClientHandler>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut ping = interval(self.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; consume that tick so the first real
        // ping lands one full interval in.
        ping.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return SessionEnd::Shutdown,

                frame = ws.next() => {
                    let frame = match frame {
                        None => {
                            warn!("connection closed by server");
                            return SessionEnd::ConnectionLost;
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "read error");
                            return SessionEnd::ConnectionLost;
                        }
                        Some(Ok(frame)) => frame,
                    };
                    match frame {
                        Message::Text(text) => {
                            if let Some(end) = self.dispatch(&text, ws, handler).await {
                                return end;
                            }
                        }
                        Message::Close(_) => {
                            info!("server closed the connection");
                            return SessionEnd::ConnectionLost;
                        }
                        // Pings are answered by the protocol layer; pongs
                        // and binary frames carry nothing for us.
                        _ => {}
                    }
                }

                out = rx.recv() => {
                    let Some(message) = out else { return SessionEnd::Shutdown };
                    match serde_json::to_string(&message) {
                        Ok(text) => {
                            if let Err(err) = ws.send(Message::Text(text)).await {
                                warn!(error = %err, kind = message.payload.kind(), "write error");
                                return SessionEnd::ConnectionLost;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, kind = message.payload.kind(), "failed to encode message");
                        }
                    }
                }

                _ = ping.tick() => {
                    match timeout(PING_WRITE_DEADLINE, ws.send(Message::Ping(Vec::new()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            warn!(error = %err, "ping failed");
                            return SessionEnd::ConnectionLost;
                        }
                        Err(_) => {
                            warn!("ping write deadline exceeded");
                            return SessionEnd::ConnectionLost;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        text: &str,
        ws: &mut WsStream,
        handler: &Arc<dyn ClientHandler>,
    ) -> Option<SessionEnd> {
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(error = %err, raw = text, "failed to parse inbound message");
                return None;
            }
        };

        match inbound {
            Inbound::AuthRequired => {
                let Some(token) = self.token() else {
                    warn!("auth required but no token available, waiting for approval");
                    return None;
                };
                info!("sending watcher.auth");
                let auth = OutboundMessage::new(EventPayload::Auth(AuthData { token }));
                match serde_json::to_string(&auth) {
                    Ok(text) => {
                        if let Err(err) = ws.send(Message::Text(text)).await {
                            warn!(error = %err, "failed to send watcher.auth");
                            return Some(SessionEnd::ConnectionLost);
                        }
                        self.set_state(ConnectionState::Authenticating);
                    }
                    Err(err) => warn!(error = %err, "failed to encode watcher.auth"),
                }
                None
            }

            Inbound::Pending => {
                info!(
                    watcher_id = %self.inner.watcher_id,
                    "pending approval by an operator"
                );
                self.set_state(ConnectionState::PendingApproval);
                None
            }

            Inbound::Config(cfg) => {
                let was_unauthenticated = self.token().is_none();
                let token_received =
                    !cfg.auth_token.is_empty() && cfg.auth_token != REJECTED_TOKEN;

                if token_received {
                    self.set_token(cfg.auth_token.clone());
                    info!("auth token received and stored");
                }
                if !cfg.config_hash.is_empty() {
                    self.set_config_hash(cfg.config_hash.clone());
                }
                info!(
                    config_hash = %cfg.config_hash,
                    watch_paths = cfg.watch_paths.len(),
                    log_level = %cfg.log_level,
                    "received config"
                );

                self.set_state(ConnectionState::Ready);
                handler.on_config(cfg).await;

                if was_unauthenticated && token_received {
                    info!("first approval received, reconnecting to authenticate");
                    return Some(SessionEnd::Reauthenticate);
                }
                None
            }

            Inbound::Rejected { reason } => {
                warn!(
                    reason = reason.as_deref().unwrap_or(""),
                    "rejected by server, clearing token"
                );
                self.clear_token();
                self.set_state(ConnectionState::Rejected);
                let sentinel = WatcherConfigData {
                    auth_token: REJECTED_TOKEN.to_string(),
                    ..Default::default()
                };
                handler.on_config(sentinel).await;
                None
            }

            Inbound::Command(command) => {
                handler.on_command(command).await;
                None
            }
        }
    }
}

impl EventSink for Client {
    fn emit(&self, payload: EventPayload) {
        self.send(payload);
    }
}

impl LogForwarder for Client {
    fn forward_log(
        &self,
        level: &str,
        message: &str,
        context: serde_json::Map<String, serde_json::Value>,
    ) {
        self.send(EventPayload::Log(LogData {
            level: level.to_string(),
            message: message.to_string(),
            context,
            timestamp: Utc::now().to_rfc3339(),
        }));
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FileDeletedData;

    fn deleted(path: &str) -> EventPayload {
        EventPayload::FileDeleted(FileDeletedData {
            path: path.into(),
            name: path.rsplit('/').next().unwrap_or(path).into(),
        })
    }

    #[tokio::test]
    async fn overflow_sets_flag_and_drops() {
        let client = Client::with_queue_capacity("ws://localhost:1/ws", "w1", 2);
        client.send(deleted("/a.mkv"));
        client.send(deleted("/b.mkv"));
        assert!(!client.has_dropped_messages());
        client.send(deleted("/c.mkv"));
        assert!(client.has_dropped_messages());
        // Further drops keep the flag set without panicking.
        client.send(deleted("/d.mkv"));
        assert!(client.has_dropped_messages());
    }

    #[test]
    fn token_cell_round_trips() {
        let client = Client::new("ws://localhost:1/ws", "w1");
        assert_eq!(client.token(), None);
        client.set_token("tok");
        assert_eq!(client.token().as_deref(), Some("tok"));
        client.clear_token();
        assert_eq!(client.token(), None);
    }

    #[test]
    fn close_is_idempotent() {
        let client = Client::new("ws://localhost:1/ws", "w1");
        client.close();
        client.close();
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        struct NoopHandler;
        #[async_trait]
        impl ClientHandler for NoopHandler {
            async fn on_config(&self, _config: WatcherConfigData) {}
            async fn on_command(&self, _command: Command) {}
            async fn on_reconnect(&self) {}
        }

        let client = Client::new("ws://localhost:1/ws", "w1");
        client.close();
        client.run(Arc::new(NoopHandler)).await.unwrap();
        assert!(client.run(Arc::new(NoopHandler)).await.is_err());
    }
}
