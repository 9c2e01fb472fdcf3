// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Push session: a long-lived WebSocket over which the cloud announces
// "printer X has queued jobs".
//
// Stanzas are JSON text frames tagged by `type`:
//
//   → {"type":"auth","token":"…","proxy":"…"}
//   ← {"type":"auth_result","success":true}
//   → {"type":"ping","id":"…"}          ← {"type":"pong","id":"…"}
//   ← {"type":"notify","printer_id":"…"}
//
// The session task owns a `KeepaliveMachine` and reconnects forever with
// backoff. Only a rejected robot credential stops it (`PushEvent::Fatal`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use cloudspool_core::error::{CloudspoolError, Result};
use cloudspool_core::types::Identity;

use crate::credentials::TokenSource;
use crate::session::{DisconnectReason, KeepaliveConfig, KeepaliveMachine, SessionState};

/// How long the server has to answer the auth stanza.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// One protocol message on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Stanza {
    Auth {
        token: String,
        proxy: String,
    },
    AuthResult {
        success: bool,
        #[serde(default)]
        detail: Option<String>,
    },
    Ping {
        id: String,
    },
    Pong {
        id: String,
    },
    Notify {
        printer_id: String,
    },
}

/// Opens push connections.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushConnection>>;
}

/// A single open push connection.
#[async_trait]
pub trait PushConnection: Send {
    async fn send(&mut self, stanza: Stanza) -> Result<()>;

    /// Next stanza from the server; `Ok(None)` once the peer has closed.
    async fn recv(&mut self) -> Result<Option<Stanza>>;

    async fn close(&mut self) {}
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// [`PushTransport`] over a (TLS) WebSocket.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn PushConnection>> {
        debug!(url = %self.url, "opening push socket");
        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(&self.url))
                .await
                .map_err(|_| CloudspoolError::Timeout(format!("push connect to {}", self.url)))?
                .map_err(|e| CloudspoolError::Push(format!("connect {}: {e}", self.url)))?;
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushConnection for WsConnection {
    async fn send(&mut self, stanza: Stanza) -> Result<()> {
        let json = serde_json::to_string(&stanza)?;
        self.stream
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| CloudspoolError::Push(format!("send: {e}")))
    }

    async fn recv(&mut self) -> Result<Option<Stanza>> {
        loop {
            let frame = match self.stream.next().await {
                None => return Ok(None),
                Some(frame) => frame.map_err(|e| CloudspoolError::Push(format!("recv: {e}")))?,
            };
            match frame {
                Message::Text(text) => match serde_json::from_str::<Stanza>(&text) {
                    Ok(stanza) => return Ok(Some(stanza)),
                    Err(e) => warn!(error = %e, "ignoring malformed push stanza"),
                },
                Message::Ping(data) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| CloudspoolError::Push(format!("pong: {e}")))?;
                }
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// What the push session reports to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// Authenticated. `reconnect` means notifications may have been missed
    /// and the consumer should poll every printer.
    Connected { reconnect: bool },
    Notification { printer_id: String },
    Disconnected,
    /// The robot credential was rejected; the session has stopped.
    Fatal { detail: String },
}

/// Configured but not yet running push session.
pub struct PushSession {
    transport: Arc<dyn PushTransport>,
    tokens: Arc<dyn TokenSource>,
    proxy: String,
    keepalive: KeepaliveConfig,
}

/// Control handle for a running push session.
pub struct PushSessionHandle {
    state: watch::Receiver<SessionState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PushSessionHandle {
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// A receiver that follows state changes, for diagnostics.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Stop the session and wait for its task to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "push session task ended abnormally");
        }
    }
}

/// Result of one connect-and-authenticate attempt.
enum Opened {
    Ready(Box<dyn PushConnection>),
    /// The server refused the robot token.
    Rejected(String),
}

enum Inbound {
    Shutdown,
    Tick,
    Frame(Result<Option<Stanza>>),
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl PushSession {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        tokens: Arc<dyn TokenSource>,
        proxy: impl Into<String>,
        keepalive: KeepaliveConfig,
    ) -> Self {
        Self {
            transport,
            tokens,
            proxy: proxy.into(),
            keepalive,
        }
    }

    /// Spawn the session task.
    pub fn start(self) -> (PushSessionHandle, mpsc::UnboundedReceiver<PushEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(self.run(events_tx, state_tx, shutdown_rx));

        (
            PushSessionHandle {
                state: state_rx,
                shutdown: shutdown_tx,
                task,
            },
            events_rx,
        )
    }

    async fn run(
        self,
        events: mpsc::UnboundedSender<PushEvent>,
        state: watch::Sender<SessionState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut machine = KeepaliveMachine::new(self.keepalive);
        // Set after a rejection, until a connect succeeds: the token in use
        // was refreshed since the server last refused one.
        let mut token_refreshed = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            machine.begin_connect();
            state.send_replace(machine.state().clone());

            match self.open().await {
                Ok(Opened::Ready(mut conn)) => {
                    token_refreshed = false;
                    let reconnect = machine.on_connected(now());
                    state.send_replace(machine.state().clone());
                    info!(reconnect, proxy = %self.proxy, "push session connected");
                    if events.send(PushEvent::Connected { reconnect }).is_err() {
                        conn.close().await;
                        break;
                    }

                    let reason = self
                        .drive(conn.as_mut(), &mut machine, &events, &state, &mut shutdown)
                        .await;
                    conn.close().await;
                    // `on_tick` has already recorded a missed pong.
                    if reason != DisconnectReason::MissedPong {
                        machine.disconnect(reason);
                    }
                    state.send_replace(machine.state().clone());
                    let _ = events.send(PushEvent::Disconnected);

                    if reason == DisconnectReason::Shutdown {
                        break;
                    }
                    warn!(?reason, "push session lost");
                }
                Ok(Opened::Rejected(detail)) if token_refreshed => {
                    let e = CloudspoolError::Authentication {
                        identity: Identity::Robot,
                        detail: format!("push auth rejected after token refresh: {detail}"),
                    };
                    stop_fatal(&e, &events, &state);
                    return;
                }
                Ok(Opened::Rejected(detail)) => {
                    warn!(%detail, "push auth rejected, refreshing robot token");
                    self.tokens.invalidate(Identity::Robot).await;
                    token_refreshed = true;
                    machine.disconnect(DisconnectReason::Transport);
                    state.send_replace(machine.state().clone());
                }
                Err(e) if e.is_fatal() => {
                    stop_fatal(&e, &events, &state);
                    return;
                }
                Err(e) => {
                    machine.disconnect(DisconnectReason::Transport);
                    state.send_replace(machine.state().clone());
                    warn!(error = %e, "push connect failed");
                }
            }

            let delay = machine.next_reconnect_delay();
            debug!(delay_ms = delay.as_millis() as u64, "push reconnect scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        state.send_replace(SessionState::Disconnected);
        info!("push session stopped");
    }

    /// Connect and authenticate with the robot identity.
    async fn open(&self) -> Result<Opened> {
        let token = self.tokens.access_token(Identity::Robot).await?;
        let mut conn = self.transport.connect().await?;
        conn.send(Stanza::Auth {
            token,
            proxy: self.proxy.clone(),
        })
        .await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.recv())
            .await
            .map_err(|_| CloudspoolError::Timeout("push auth reply".into()))??;

        match reply {
            Some(Stanza::AuthResult { success: true, .. }) => Ok(Opened::Ready(conn)),
            Some(Stanza::AuthResult {
                success: false,
                detail,
            }) => {
                conn.close().await;
                Ok(Opened::Rejected(detail.unwrap_or_else(|| "no detail".into())))
            }
            Some(other) => Err(CloudspoolError::Protocol(format!(
                "expected auth_result, got {other:?}"
            ))),
            None => Err(CloudspoolError::Push("closed during handshake".into())),
        }
    }

    /// Run one authenticated connection until it ends.
    async fn drive(
        &self,
        conn: &mut dyn PushConnection,
        machine: &mut KeepaliveMachine,
        events: &mpsc::UnboundedSender<PushEvent>,
        state: &watch::Sender<SessionState>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> DisconnectReason {
        loop {
            if machine.ping_due(now()) {
                let id = uuid::Uuid::new_v4().to_string();
                if let Err(e) = conn.send(Stanza::Ping { id: id.clone() }).await {
                    warn!(error = %e, "ping send failed");
                    return DisconnectReason::Transport;
                }
                machine.on_ping_sent(id, now());
                state.send_replace(machine.state().clone());
            }

            let wakeup = Instant::from_std(machine.next_wakeup(now()));
            let inbound = tokio::select! {
                _ = shutdown.changed() => Inbound::Shutdown,
                _ = tokio::time::sleep_until(wakeup) => Inbound::Tick,
                frame = conn.recv() => Inbound::Frame(frame),
            };

            match inbound {
                Inbound::Shutdown => return DisconnectReason::Shutdown,
                Inbound::Tick => {
                    if let Some(reason) = machine.on_tick(now()) {
                        return reason;
                    }
                }
                Inbound::Frame(Ok(Some(Stanza::Notify { printer_id }))) => {
                    debug!(%printer_id, "push notification");
                    if events.send(PushEvent::Notification { printer_id }).is_err() {
                        return DisconnectReason::Shutdown;
                    }
                }
                Inbound::Frame(Ok(Some(Stanza::Pong { id }))) => {
                    if machine.on_pong(&id, now()) {
                        state.send_replace(machine.state().clone());
                    }
                }
                Inbound::Frame(Ok(Some(Stanza::Ping { id }))) => {
                    if let Err(e) = conn.send(Stanza::Pong { id }).await {
                        warn!(error = %e, "pong send failed");
                        return DisconnectReason::Transport;
                    }
                }
                Inbound::Frame(Ok(Some(other))) => {
                    debug!(?other, "ignoring unexpected stanza");
                }
                Inbound::Frame(Ok(None)) => {
                    info!("push socket closed by server");
                    return DisconnectReason::Transport;
                }
                Inbound::Frame(Err(e)) => {
                    warn!(error = %e, "push socket error");
                    return DisconnectReason::Transport;
                }
            }
        }
    }
}

fn stop_fatal(
    err: &CloudspoolError,
    events: &mpsc::UnboundedSender<PushEvent>,
    state: &watch::Sender<SessionState>,
) {
    error!(error = %err, "push session cannot authenticate; stopping");
    state.send_replace(SessionState::Disconnected);
    let _ = events.send(PushEvent::Fatal {
        detail: err.to_string(),
    });
}
