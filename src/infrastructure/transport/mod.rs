//! Signaling transport connection management
//!
//! Owns the single WebSocket-like connection used for signaling:
//! connection timeout, keep-alive, and exponential-backoff reconnection
//! after unexpected closes.

pub mod socket;

use crate::config::TransportConfig;
use crate::domain::shared::error::ClientError;
use crate::domain::shared::events::{EventBus, SessionEvent};
use crate::domain::shared::result::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use socket::{SignalingSocket, SocketConnector, SocketEvent};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Backoff schedule for reconnection attempts, indexed by attempt count
/// and clamped at the last entry.
pub const RECONNECT_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
    Duration::from_secs(32),
];

const CRLF_PING: &[u8] = b"\r\n\r\n";

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    ConnectionFailed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
            ConnectionState::ConnectionFailed => "connection_failed",
        }
    }
}

/// How keep-alives are issued once connected: a bare CRLF frame on the
/// socket, or an OPTIONS ping signaled to the signaling engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepAliveKind {
    CrlfPing,
    Options,
}

/// Manages the signaling connection lifecycle.
pub struct TransportManager {
    config: TransportConfig,
    connector: Arc<dyn SocketConnector>,
    bus: Arc<EventBus>,
    state: RwLock<ConnectionState>,
    socket: AsyncMutex<Option<Box<dyn SignalingSocket>>>,
    /// Raw inbound frames are forwarded here (the signaling engine).
    frame_sink: RwLock<Option<mpsc::UnboundedSender<Bytes>>>,
    manual_close: AtomicBool,
    connect_in_flight: AtomicBool,
    reconnect_attempts: AtomicU32,
    /// Bumped for every new socket; stale reader callbacks are ignored.
    epoch: AtomicU64,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    weak_self: Weak<TransportManager>,
}

impl TransportManager {
    pub fn new(
        config: TransportConfig,
        connector: Arc<dyn SocketConnector>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            connector,
            bus,
            state: RwLock::new(ConnectionState::Disconnected),
            socket: AsyncMutex::new(None),
            frame_sink: RwLock::new(None),
            manual_close: AtomicBool::new(false),
            connect_in_flight: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            keepalive_task: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            reader_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Register the sink that receives raw inbound signaling frames.
    pub fn set_frame_sink(&self, sink: mpsc::UnboundedSender<Bytes>) {
        *self.frame_sink.write().unwrap() = Some(sink);
    }

    /// Establish the signaling connection.
    pub async fn connect(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::State("Transport has been disposed".to_string()));
        }
        if self.connect_in_flight.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Concurrency(
                "Connect already in progress".to_string(),
            ));
        }

        let result = self.connect_inner().await;
        self.connect_in_flight.store(false, Ordering::SeqCst);

        if result.is_err() {
            self.schedule_reconnect();
        }
        result
    }

    async fn connect_inner(&self) -> Result<()> {
        self.manual_close.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        let timeout = Duration::from_secs(self.config.connection_timeout_secs);
        let attempt = tokio::time::timeout(
            timeout,
            self.connector.connect(&self.config.server_url),
        )
        .await;

        let (socket, events) = match attempt {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("Connection to {} failed: {}", self.config.server_url, e);
                self.set_state(ConnectionState::Error);
                return Err(e);
            }
            // Dropping the in-flight connect future closes the
            // half-open socket.
            Err(_) => {
                warn!(
                    "Connection to {} not established within {:?}",
                    self.config.server_url, timeout
                );
                self.set_state(ConnectionState::ConnectionFailed);
                return Err(ClientError::Transport(format!(
                    "Connection not established within {:?}",
                    timeout
                )));
            }
        };

        *self.socket.lock().await = Some(socket);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        self.start_keepalive();
        self.start_reader(events, epoch);

        info!("Signaling transport connected to {}", self.config.server_url);
        Ok(())
    }

    /// Close the connection without triggering reconnection.
    pub async fn disconnect(&self) {
        self.manual_close.store(true, Ordering::SeqCst);
        self.cancel_reconnect();
        self.stop_keepalive();

        let socket = self.socket.lock().await.take();
        if let Some(mut socket) = socket {
            socket.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Drop the current connection (if any) and dial again immediately.
    pub async fn reconnect(&self) -> Result<()> {
        self.cancel_reconnect();
        self.stop_keepalive();
        // Invalidate the old reader so its close event cannot race the
        // new dial.
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let socket = self.socket.lock().await.take();
        if let Some(mut socket) = socket {
            socket.close().await;
        }
        self.connect().await
    }

    /// Send a raw signaling frame. Fails immediately when the socket is
    /// not open; nothing is queued.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::Transport(
                "Cannot send: socket is not open".to_string(),
            ));
        }

        let mut guard = self.socket.lock().await;
        match guard.as_mut() {
            Some(socket) => socket.send(frame).await,
            None => Err(ClientError::Transport(
                "Cannot send: socket is not open".to_string(),
            )),
        }
    }

    /// Idempotent teardown: cancels every owned timer and closes the
    /// socket.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manual_close.store(true, Ordering::SeqCst);
        self.cancel_reconnect();
        self.stop_keepalive();
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }

        let socket = self.socket.lock().await.take();
        if let Some(mut socket) = socket {
            socket.close().await;
        }
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.write().unwrap();
            if *state == next {
                return;
            }
            *state = next;
        }
        debug!("Connection state -> {}", next.as_str());
        self.bus
            .publish(&SessionEvent::ConnectionStateChanged { state: next });
    }

    fn start_reader(&self, mut events: mpsc::Receiver<SocketEvent>, epoch: u64) {
        let weak = self.weak_self.clone();
        let task = tokio::spawn(async move {
            let mut close_reason = None;
            loop {
                match events.recv().await {
                    Some(SocketEvent::Frame(frame)) => {
                        let Some(manager) = weak.upgrade() else { return };
                        trace!("Received {} byte signaling frame", frame.len());
                        let sink = manager.frame_sink.read().unwrap().clone();
                        if let Some(sink) = sink {
                            if sink.send(frame).is_err() {
                                debug!("Inbound frame sink dropped");
                            }
                        }
                    }
                    Some(SocketEvent::Closed { reason }) => {
                        close_reason = reason;
                        break;
                    }
                    None => break,
                }
            }

            if let Some(manager) = weak.upgrade() {
                manager.handle_close(close_reason, epoch).await;
            }
        });

        if let Some(old) = self.reader_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    async fn handle_close(&self, reason: Option<String>, epoch: u64) {
        // A newer connection owns the socket already.
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        self.stop_keepalive();
        *self.socket.lock().await = None;

        if self.manual_close.load(Ordering::SeqCst) || self.disposed.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        match &reason {
            Some(reason) => {
                warn!("Connection closed unexpectedly: {}", reason);
                self.set_state(ConnectionState::Error);
            }
            None => warn!("Connection closed unexpectedly"),
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        if !self.config.auto_reconnect
            || self.disposed.load(Ordering::SeqCst)
            || self.manual_close.load(Ordering::SeqCst)
        {
            return;
        }

        let attempt = self.reconnect_attempts.load(Ordering::SeqCst);
        if attempt >= self.config.max_reconnection_attempts {
            info!(
                "Giving up after {} reconnection attempts",
                self.config.max_reconnection_attempts
            );
            self.set_state(ConnectionState::ConnectionFailed);
            return;
        }
        self.reconnect_attempts.store(attempt + 1, Ordering::SeqCst);

        let delay = RECONNECT_SCHEDULE[(attempt as usize).min(RECONNECT_SCHEDULE.len() - 1)];
        self.set_state(ConnectionState::Reconnecting);
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay,
            attempt + 1,
            self.config.max_reconnection_attempts
        );

        let weak = self.weak_self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else { return };
            if manager.disposed.load(Ordering::SeqCst)
                || manager.manual_close.load(Ordering::SeqCst)
                || manager.state() == ConnectionState::Connected
            {
                return;
            }
            // Detach our own handle so a re-arm inside connect() cannot
            // abort the running task.
            drop(manager.reconnect_task.lock().unwrap().take());
            if let Err(e) = manager.connect().await {
                warn!("Reconnect attempt failed: {}", e);
            }
        });

        if let Some(old) = self.reconnect_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn start_keepalive(&self) {
        self.stop_keepalive();

        let weak = self.weak_self.clone();
        let interval = Duration::from_secs(self.config.keep_alive_interval_secs);
        let kind = self.config.keep_alive;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                if manager.state() != ConnectionState::Connected {
                    break;
                }

                match kind {
                    KeepAliveKind::CrlfPing => {
                        if let Err(e) = manager.send(Bytes::from_static(CRLF_PING)).await {
                            warn!("Keep-alive ping failed: {}", e);
                        }
                    }
                    KeepAliveKind::Options => {
                        manager.bus.publish(&SessionEvent::KeepAliveDue { kind });
                    }
                }
            }
        });

        if let Some(old) = self.keepalive_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    fn stop_keepalive(&self) {
        if let Some(task) = self.keepalive_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
