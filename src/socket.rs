// ABOUTME: Persistent socket channel with heartbeat supervision and reconnect
// ABOUTME: Transport trait over tokio-tungstenite plus the connection state machine

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bus::BroadcastBus;
use crate::config::GatewayOptions;
use crate::error::GatewayError;
use crate::message::{BroadcastEvent, ReadyState, SocketStatus};

/// Outbound command queue depth per connection.
const COMMAND_CAPACITY: usize = 32;

/// Normal-closure code; closes with this code are never retried.
const NORMAL_CLOSE: u16 = 1000;

/// Socket-facing subset of the gateway options.
#[derive(Debug, Clone)]
pub struct SocketSettings {
    /// Interval between liveness probes on an open socket.
    pub heartbeat_interval: std::time::Duration,
    /// Force-close when no liveness ack arrives within this window.
    pub heartbeat_timeout: std::time::Duration,
    /// Fixed delay before a reconnect attempt after an abnormal close.
    pub reconnect_delay: std::time::Duration,
    /// Consecutive failed reconnects tolerated before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self::from(&GatewayOptions::default())
    }
}

impl From<&GatewayOptions> for SocketSettings {
    fn from(opts: &GatewayOptions) -> Self {
        Self {
            heartbeat_interval: opts.heartbeat_interval,
            heartbeat_timeout: opts.heartbeat_timeout,
            reconnect_delay: opts.reconnect_delay,
            max_reconnect_attempts: opts.max_reconnect_attempts,
        }
    }
}

/// Decoded inbound frame, transport-agnostic.
#[derive(Debug)]
pub enum SocketFrame {
    /// Ordinary message body.
    Text(String),
    /// Liveness ack. Intercepted by the manager, never forwarded.
    Pong,
    /// Peer closed the connection.
    Closed {
        /// Close code, when the peer supplied one.
        code: Option<u16>,
        /// Close reason, when non-empty.
        reason: Option<String>,
    },
}

/// One established socket connection.
pub trait SocketLink: Send {
    /// Send a text frame.
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<(), GatewayError>>;

    /// Send a liveness probe.
    fn send_ping(&mut self) -> BoxFuture<'_, Result<(), GatewayError>>;

    /// Close the connection. Best effort.
    fn close(&mut self) -> BoxFuture<'_, ()>;

    /// Next inbound frame, or `None` when the transport is gone.
    fn next(&mut self) -> BoxFuture<'_, Option<SocketFrame>>;
}

/// Establishes socket connections. Swappable for tests.
pub trait SocketConnector: Send + Sync {
    /// Open a connection to `url`.
    fn connect(&self, url: &str) -> BoxFuture<'_, Result<Box<dyn SocketLink>, GatewayError>>;
}

/// Derive the socket URL from an HTTP endpoint, optionally attaching the
/// session token as a query parameter.
pub fn derive_socket_url(endpoint: &str, token: Option<&str>) -> Result<String, GatewayError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| GatewayError::Socket(format!("invalid endpoint {endpoint}: {e}")))?;

    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => {
            return Err(GatewayError::Socket(format!(
                "unsupported endpoint scheme: {other}"
            )))
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|()| GatewayError::Socket(format!("cannot rewrite scheme of {endpoint}")))?;
    }
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url.into())
}

/// Production connector over tokio-tungstenite.
#[derive(Debug, Default)]
pub struct TungsteniteConnector;

impl SocketConnector for TungsteniteConnector {
    fn connect(&self, url: &str) -> BoxFuture<'_, Result<Box<dyn SocketLink>, GatewayError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (stream, _response) = connect_async(&url)
                .await
                .map_err(|e| GatewayError::Socket(e.to_string()))?;
            Ok(Box::new(TungsteniteLink { stream }) as Box<dyn SocketLink>)
        })
    }
}

struct TungsteniteLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SocketLink for TungsteniteLink {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<(), GatewayError>> {
        Box::pin(async move {
            self.stream
                .send(Message::Text(text))
                .await
                .map_err(|e| GatewayError::Socket(e.to_string()))
        })
    }

    fn send_ping(&mut self) -> BoxFuture<'_, Result<(), GatewayError>> {
        Box::pin(async move {
            self.stream
                .send(Message::Ping(Vec::new()))
                .await
                .map_err(|e| GatewayError::Socket(e.to_string()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.stream.close(None).await;
        })
    }

    fn next(&mut self) -> BoxFuture<'_, Option<SocketFrame>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => return Some(SocketFrame::Text(text)),
                    Some(Ok(Message::Binary(bytes))) => {
                        return Some(SocketFrame::Text(
                            String::from_utf8_lossy(&bytes).into_owned(),
                        ))
                    }
                    Some(Ok(Message::Pong(_))) => return Some(SocketFrame::Pong),
                    // Inbound pings are answered by the transport on flush.
                    Some(Ok(Message::Ping(_) | Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        let reason = frame.and_then(|f| {
                            let reason = f.reason.into_owned();
                            if reason.is_empty() {
                                None
                            } else {
                                Some(reason)
                            }
                        });
                        return Some(SocketFrame::Closed { code, reason });
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "Socket read error");
                        return None;
                    }
                    None => return None,
                }
            }
        })
    }
}

enum Cmd {
    Text(String),
    Close,
}

struct ManagerState {
    ready_state: ReadyState,
    reconnect_attempts: u32,
    close_code: Option<u16>,
    detail: Option<String>,
    manually_closed: bool,
    outgoing: Option<mpsc::Sender<Cmd>>,
}

struct ManagerInner {
    settings: SocketSettings,
    connector: Arc<dyn SocketConnector>,
    bus: BroadcastBus,
    state: Mutex<ManagerState>,
}

/// Supervisor for the persistent socket channel.
///
/// Owns exactly one connection at a time. An open socket is probed every
/// heartbeat interval and force-closed when no ack arrives within the
/// heartbeat window. Abnormal closes (anything but code 1000 or an explicit
/// disconnect) trigger a delayed reconnect, up to a bounded number of
/// consecutive attempts. Every lifecycle transition is published on the bus
/// as a socket-status event; ordinary inbound messages are published as
/// socket-message events, with liveness acks intercepted.
#[derive(Clone)]
pub struct SocketManager {
    inner: Arc<ManagerInner>,
}

impl SocketManager {
    /// Manager with no connection. Call [`SocketManager::connect`] to open one.
    #[must_use]
    pub fn new(
        settings: SocketSettings,
        connector: Arc<dyn SocketConnector>,
        bus: BroadcastBus,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                connector,
                bus,
                state: Mutex::new(ManagerState {
                    ready_state: ReadyState::Closed,
                    reconnect_attempts: 0,
                    close_code: None,
                    detail: None,
                    manually_closed: false,
                    outgoing: None,
                }),
            }),
        }
    }

    /// Open a connection to `url`. A connect while one is already connecting
    /// or open is a no-op.
    pub async fn connect(&self, url: String) -> Result<(), GatewayError> {
        let mut state = self.inner.state.lock().await;
        if state.ready_state != ReadyState::Closed {
            debug!("Socket already active, ignoring duplicate connect");
            return Ok(());
        }

        state.manually_closed = false;
        state.reconnect_attempts = 0;
        state.close_code = None;
        state.detail = None;
        state.ready_state = ReadyState::Connecting;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        state.outgoing = Some(cmd_tx);
        drop(state);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Self::run(&inner, url, cmd_rx).await;
            let mut state = inner.state.lock().await;
            // A fresh connect may already have replaced the channel.
            if state.ready_state == ReadyState::Closed {
                state.outgoing = None;
            }
        });
        Ok(())
    }

    /// Send a text frame over the open socket.
    pub async fn send(&self, text: String) -> Result<(), GatewayError> {
        let tx = {
            let state = self.inner.state.lock().await;
            if state.ready_state != ReadyState::Open {
                return Err(GatewayError::SocketNotConnected);
            }
            state
                .outgoing
                .clone()
                .ok_or(GatewayError::SocketNotConnected)?
        };
        tx.send(Cmd::Text(text))
            .await
            .map_err(|_| GatewayError::SocketNotConnected)
    }

    /// Close the connection with a normal-closure code. No reconnect follows.
    pub async fn disconnect(&self) {
        let tx = {
            let mut state = self.inner.state.lock().await;
            state.manually_closed = true;
            state.outgoing.clone()
        };
        if let Some(tx) = tx {
            let _ = tx.send(Cmd::Close).await;
        }
    }

    /// Current channel snapshot.
    pub async fn status(&self) -> SocketStatus {
        let state = self.inner.state.lock().await;
        SocketStatus {
            ready_state: state.ready_state,
            reconnect_attempts: state.reconnect_attempts,
            close_code: state.close_code,
            detail: state.detail.clone(),
        }
    }

    // === Connection loop ===

    async fn run(inner: &Arc<ManagerInner>, url: String, mut cmds: mpsc::Receiver<Cmd>) {
        loop {
            if inner.state.lock().await.manually_closed {
                return;
            }

            Self::publish(inner, ReadyState::Connecting, None, None).await;
            let mut link = match inner.connector.connect(&url).await {
                Ok(link) => link,
                Err(e) => {
                    warn!(error = %e, "Socket connect failed");
                    Self::publish(inner, ReadyState::Closed, None, Some(e.to_string())).await;
                    if Self::wait_for_reconnect(inner).await {
                        continue;
                    }
                    return;
                }
            };

            inner.state.lock().await.reconnect_attempts = 0;
            Self::publish(inner, ReadyState::Open, None, None).await;
            info!("Socket open");

            let mut heartbeat = tokio::time::interval(inner.settings.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            heartbeat.tick().await;

            let mut last_ack = Instant::now();
            let mut close_code: Option<u16> = None;
            let mut detail: Option<String> = None;

            loop {
                tokio::select! {
                    cmd = cmds.recv() => match cmd {
                        Some(Cmd::Text(text)) => {
                            if let Err(e) = link.send_text(text).await {
                                warn!(error = %e, "Socket send failed");
                                Self::publish(inner, ReadyState::Closing, None, None).await;
                                link.close().await;
                                detail = Some(e.to_string());
                                break;
                            }
                        }
                        Some(Cmd::Close) | None => {
                            Self::publish(inner, ReadyState::Closing, None, None).await;
                            link.close().await;
                            close_code = Some(NORMAL_CLOSE);
                            break;
                        }
                    },
                    _ = heartbeat.tick() => {
                        if last_ack.elapsed() >= inner.settings.heartbeat_timeout {
                            warn!("No heartbeat ack within window, force-closing socket");
                            Self::publish(inner, ReadyState::Closing, None, None).await;
                            link.close().await;
                            detail = Some("heartbeat timeout".to_string());
                            break;
                        }
                        if let Err(e) = link.send_ping().await {
                            Self::publish(inner, ReadyState::Closing, None, None).await;
                            link.close().await;
                            detail = Some(e.to_string());
                            break;
                        }
                    }
                    frame = link.next() => match frame {
                        Some(SocketFrame::Text(text)) => {
                            let data = serde_json::from_str(&text)
                                .unwrap_or(Value::String(text));
                            inner.bus.broadcast(BroadcastEvent::SocketMessage { data });
                        }
                        Some(SocketFrame::Pong) => {
                            last_ack = Instant::now();
                        }
                        Some(SocketFrame::Closed { code, reason }) => {
                            close_code = code;
                            detail = reason;
                            break;
                        }
                        None => break,
                    }
                }
            }

            Self::publish(inner, ReadyState::Closed, close_code, detail).await;

            let manual = inner.state.lock().await.manually_closed;
            if manual || close_code == Some(NORMAL_CLOSE) {
                info!("Socket closed normally");
                return;
            }
            if !Self::wait_for_reconnect(inner).await {
                return;
            }
        }
    }

    /// Count the attempt and wait out the reconnect delay. Returns false
    /// when the attempt budget is exhausted or the close was manual.
    async fn wait_for_reconnect(inner: &Arc<ManagerInner>) -> bool {
        let attempts = {
            let mut state = inner.state.lock().await;
            state.reconnect_attempts += 1;
            state.reconnect_attempts
        };
        if attempts > inner.settings.max_reconnect_attempts {
            error!(
                max = inner.settings.max_reconnect_attempts,
                "Reconnect attempts exhausted, giving up"
            );
            return false;
        }
        info!(
            attempt = attempts,
            max = inner.settings.max_reconnect_attempts,
            delay_ms = inner.settings.reconnect_delay.as_millis(),
            "Scheduling socket reconnect"
        );
        tokio::time::sleep(inner.settings.reconnect_delay).await;
        !inner.state.lock().await.manually_closed
    }

    async fn publish(
        inner: &Arc<ManagerInner>,
        ready_state: ReadyState,
        close_code: Option<u16>,
        detail: Option<String>,
    ) {
        let status = {
            let mut state = inner.state.lock().await;
            state.ready_state = ready_state;
            state.close_code = close_code;
            state.detail.clone_from(&detail);
            SocketStatus {
                ready_state,
                reconnect_attempts: state.reconnect_attempts,
                close_code,
                detail,
            }
        };
        debug!(state = ?ready_state, "Socket transition");
        inner
            .bus
            .broadcast(BroadcastEvent::SocketStatus { status });
    }
}
