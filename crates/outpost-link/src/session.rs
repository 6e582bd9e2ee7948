//! Connection manager: one correlated request/response session per server.
//!
//! Each live connection runs a handler task that owns the pending-request
//! map and the frame channels; callers talk to it through a command channel
//! and wait on a oneshot. When the remote side drops, the session walks
//! `Disconnected -> Connecting -> Connected` again with exponential backoff
//! until `max_attempts` is exhausted or [`Session::disconnect`] is called.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use outpost_core::link::{Broadcast, GameLink, LinkNotice, Request, Response};
use outpost_core::{ConnectionId, MonitorError};
use outpost_settings::LinkSettings;
use outpost_telemetry::MetricsRecorder;

use crate::backoff::ReconnectPolicy;
use crate::connector::{Connector, Frames};
use crate::wire::{self, Credentials, Inbound};

const COMMAND_BUFFER: usize = 64;

type PendingTx = oneshot::Sender<Result<Response, MonitorError>>;

/// Session lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    /// An explicit connect or a reconnect cycle (including its backoff) is in flight.
    Connecting,
    Connected,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub policy: ReconnectPolicy,
    pub broadcast_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            broadcast_capacity: 256,
        }
    }
}

impl From<&LinkSettings> for SessionConfig {
    fn from(s: &LinkSettings) -> Self {
        Self {
            policy: ReconnectPolicy::from(s),
            broadcast_capacity: s.broadcast_capacity.max(1),
        }
    }
}

struct Command {
    request: Request,
    response_tx: PendingTx,
}

#[derive(Clone)]
struct Target {
    endpoint: String,
    credentials: Credentials,
}

/// The connection that is currently up. Replaced wholesale on reconnect;
/// `epoch` lets a stale handler recognise it no longer owns the session.
struct LiveLink {
    epoch: u64,
    cmd_tx: mpsc::Sender<Command>,
}

struct SessionInner {
    connection_id: ConnectionId,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<LinkState>,
    target: Mutex<Option<Target>>,
    live: Mutex<Option<LiveLink>>,
    next_seq: AtomicU64,
    epoch: AtomicU64,
    attempts: AtomicU32,
    manual: AtomicBool,
    reconnect_cancel: Mutex<CancellationToken>,
    broadcasts: broadcast::Sender<Broadcast>,
    notices: broadcast::Sender<LinkNotice>,
    metrics: Option<Arc<MetricsRecorder>>,
}

/// A reconnecting session to one game server.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        connection_id: ConnectionId,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> Self {
        let capacity = config.broadcast_capacity.max(1);
        let (broadcasts, _) = broadcast::channel(capacity);
        let (notices, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(SessionInner {
                connection_id,
                config,
                connector,
                state: Mutex::new(LinkState::Disconnected),
                target: Mutex::new(None),
                live: Mutex::new(None),
                next_seq: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
                manual: AtomicBool::new(false),
                reconnect_cancel: Mutex::new(CancellationToken::new()),
                broadcasts,
                notices,
                metrics: None,
            }),
        }
    }

    /// Record request and reconnect counters. Must be called before the
    /// session is shared.
    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = Some(metrics);
        }
        self
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.connection_id
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.lock()
    }

    /// Consecutive failed reconnect attempts in the current cycle.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    /// Establish the session. Fails fast with `AlreadyConnecting` while another
    /// connect or reconnect cycle is in flight; a no-op when already connected.
    pub async fn connect(&self, endpoint: &str, credentials: Credentials) -> Result<(), MonitorError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                LinkState::Connecting => return Err(MonitorError::AlreadyConnecting),
                LinkState::Connected => return Ok(()),
                LinkState::Disconnected => *state = LinkState::Connecting,
            }
        }
        self.inner.manual.store(false, Ordering::Release);
        self.inner.attempts.store(0, Ordering::Release);
        *self.inner.target.lock() = Some(Target {
            endpoint: endpoint.to_string(),
            credentials,
        });

        match self.inner.establish().await {
            Ok(()) => {
                info!(connection_id = %self.inner.connection_id, endpoint, "connected");
                self.inner.notify(LinkNotice::Connected);
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = LinkState::Disconnected;
                warn!(
                    connection_id = %self.inner.connection_id,
                    endpoint,
                    error = %e,
                    "connect failed"
                );
                Err(e)
            }
        }
    }

    /// Manual disconnect. Cancels any pending reconnect and suppresses future
    /// ones until the next explicit [`connect`](Self::connect).
    pub fn disconnect(&self) {
        self.inner.shutdown();
    }

    pub async fn request(&self, request: Request, timeout: Duration) -> Result<Response, MonitorError> {
        let name = request.name();
        let result = self.inner.request(request, timeout).await;
        if let Some(metrics) = &self.inner.metrics {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.error_kind(),
            };
            metrics.counter_inc(
                "link_requests_total",
                &[
                    ("connection", self.inner.connection_id.as_str()),
                    ("request", name),
                    ("outcome", outcome),
                ],
                1,
            );
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[async_trait]
impl GameLink for Session {
    async fn request(&self, request: Request, timeout: Duration) -> Result<Response, MonitorError> {
        Session::request(self, request, timeout).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.inner.broadcasts.subscribe()
    }

    fn notices(&self) -> broadcast::Receiver<LinkNotice> {
        self.inner.notices.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }
}

impl SessionInner {
    fn notify(&self, notice: LinkNotice) {
        let _ = self.notices.send(notice);
    }

    fn set_connected_gauge(&self, up: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge_set(
                "link_connected",
                &[("connection", self.connection_id.as_str())],
                if up { 1.0 } else { 0.0 },
            );
        }
    }

    async fn request(&self, request: Request, timeout: Duration) -> Result<Response, MonitorError> {
        let cmd_tx = self
            .live
            .lock()
            .as_ref()
            .map(|live| live.cmd_tx.clone())
            .ok_or_else(|| MonitorError::Transport("no live session".into()))?;

        // One deadline covers queueing and the reply: a remote that stops
        // reading backs up the command channel.
        let exchange = async move {
            let (tx, rx) = oneshot::channel();
            let command = Command {
                request,
                response_tx: tx,
            };
            if cmd_tx.send(command).await.is_err() {
                return Err(MonitorError::Transport("link handler closed".into()));
            }
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(MonitorError::Transport("response dropped".into())),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(MonitorError::Timeout(timeout)),
            Ok(result) => result,
        }
    }

    /// Open a connection to the stored target and start its handler.
    async fn establish(self: &Arc<Self>) -> Result<(), MonitorError> {
        let target = self
            .target
            .lock()
            .clone()
            .ok_or_else(|| MonitorError::Config("no endpoint configured".into()))?;

        let frames = self.connector.connect(&target.endpoint).await?;
        if self.manual.load(Ordering::Acquire) {
            return Err(MonitorError::Transport("connect cancelled by disconnect".into()));
        }

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        *self.live.lock() = Some(LiveLink { epoch, cmd_tx });
        *self.state.lock() = LinkState::Connected;
        self.set_connected_gauge(true);

        let _handler = tokio::spawn(link_handler_loop(
            self.clone(),
            epoch,
            target.credentials,
            frames,
            cmd_rx,
        ));
        Ok(())
    }

    fn shutdown(&self) {
        self.manual.store(true, Ordering::Release);
        self.reconnect_cancel.lock().cancel();
        let live = self.live.lock().take();
        let previous = std::mem::replace(&mut *self.state.lock(), LinkState::Disconnected);
        if live.is_some() || previous != LinkState::Disconnected {
            info!(connection_id = %self.connection_id, "disconnected");
            self.set_connected_gauge(false);
            self.notify(LinkNotice::Disconnected { manual: true });
        }
    }

    /// Called by a handler whose remote side went away.
    fn on_remote_drop(self: &Arc<Self>, epoch: u64) {
        {
            let mut live = self.live.lock();
            match live.as_ref() {
                Some(current) if current.epoch == epoch => *live = None,
                _ => return,
            }
        }
        self.set_connected_gauge(false);
        if self.manual.load(Ordering::Acquire) {
            *self.state.lock() = LinkState::Disconnected;
            return;
        }

        warn!(connection_id = %self.connection_id, "connection lost");
        *self.state.lock() = LinkState::Connecting;
        self.notify(LinkNotice::Disconnected { manual: false });

        let token = CancellationToken::new();
        *self.reconnect_cancel.lock() = token.clone();
        let inner = self.clone();
        let _reconnect = tokio::spawn(async move { inner.reconnect_loop(token).await });
    }

    async fn reconnect_loop(self: Arc<Self>, token: CancellationToken) {
        let policy = &self.config.policy;
        loop {
            let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
            if !policy.allows(attempt) {
                let attempts = attempt - 1;
                self.attempts.store(attempts, Ordering::Release);
                *self.state.lock() = LinkState::Disconnected;
                error!(
                    connection_id = %self.connection_id,
                    attempts,
                    "reconnect attempts exhausted, giving up"
                );
                self.notify(LinkNotice::ReconnectExhausted { attempts });
                return;
            }

            let delay = policy.delay_for(attempt);
            let delay_ms = delay.as_millis() as u64;
            info!(connection_id = %self.connection_id, attempt, delay_ms, "reconnecting");
            self.notify(LinkNotice::Reconnecting { attempt, delay_ms });
            if let Some(metrics) = &self.metrics {
                metrics.counter_inc(
                    "link_reconnect_attempts_total",
                    &[("connection", self.connection_id.as_str())],
                    1,
                );
            }

            tokio::select! {
                () = token.cancelled() => {
                    debug!(connection_id = %self.connection_id, "reconnect cancelled");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
            if token.is_cancelled() || self.manual.load(Ordering::Acquire) {
                return;
            }

            match self.establish().await {
                Ok(()) => {
                    self.attempts.store(0, Ordering::Release);
                    info!(connection_id = %self.connection_id, attempts = attempt, "reconnected");
                    self.notify(LinkNotice::Reconnected { attempts: attempt });
                    return;
                }
                Err(e) => {
                    warn!(
                        connection_id = %self.connection_id,
                        attempt,
                        error = %e,
                        "reconnect attempt failed"
                    );
                }
            }
        }
    }
}

enum Closed {
    /// Command channel closed: the session let go of this connection.
    Local,
    /// Socket closed or write failed.
    Remote,
}

async fn link_handler_loop(
    inner: Arc<SessionInner>,
    epoch: u64,
    credentials: Credentials,
    mut frames: Frames,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    let mut pending: HashMap<u64, PendingTx> = HashMap::new();

    let closed = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break Closed::Local };
                let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
                let text = match wire::encode_request(seq, credentials, &cmd.request) {
                    Ok(text) => text,
                    Err(e) => {
                        let _ = cmd.response_tx.send(Err(e));
                        continue;
                    }
                };
                // Callers that timed out leave closed senders behind.
                pending.retain(|_, tx| !tx.is_closed());
                let _ = pending.insert(seq, cmd.response_tx);
                trace!(connection_id = %inner.connection_id, seq, request = cmd.request.name(), "request sent");
                if frames.tx.send(text).await.is_err() {
                    break Closed::Remote;
                }
            }
            text = frames.rx.recv() => {
                let Some(text) = text else { break Closed::Remote };
                match wire::decode(&text) {
                    Ok(Inbound::Response { seq, response }) => {
                        let Some(tx) = pending.remove(&seq) else {
                            debug!(connection_id = %inner.connection_id, seq, "response for unknown seq");
                            continue;
                        };
                        let result = match response {
                            Response::Error { code } => Err(MonitorError::from_code(&code)),
                            other => Ok(other),
                        };
                        let _ = tx.send(result);
                    }
                    Ok(Inbound::Broadcast(b)) => {
                        let _ = inner.broadcasts.send(b);
                    }
                    Err(e) => {
                        warn!(connection_id = %inner.connection_id, error = %e, "dropping malformed frame");
                    }
                }
            }
        }
    };

    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(MonitorError::Transport("connection closed".into())));
    }
    if let Closed::Remote = closed {
        inner.on_remote_drop(epoch);
    }
}
