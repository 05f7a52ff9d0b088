use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::framing::Frame;
use crate::queue::{OfflineQueue, QueuedEvent};
use crate::transport::{
    TokioWebSocketTransportFactory, Transport, TransportEvent, TransportFactory,
};
use crate::types::events::{CONNECT, DISCONNECT, Subscriber, SubscriberRegistry};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

/// State of the logical connection to the realtime backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// What `emit` did with an event it accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Handed to the live connection.
    Delivered,
    /// Buffered in the offline queue until the next successful connect.
    /// Being offline is never an error for `emit`; it ends up here.
    Queued,
}

#[derive(Clone)]
struct ActiveConnection {
    transport: Arc<dyn Transport>,
    generation: u64,
}

struct PendingReconnect {
    handle: JoinHandle<()>,
    delay: Duration,
}

/// The process-wide realtime connection.
///
/// Owns the subscriber registry, the offline queue and the connection
/// state. Events emitted while offline are flushed in FIFO order, one send
/// at a time, on the next successful connect. Unexpected drops schedule a
/// single reconnect timer using the configured backoff policy.
pub struct RealtimeClient {
    this: Weak<Self>,
    config: ClientConfig,
    transport_factory: Arc<dyn TransportFactory>,
    token: RwLock<Option<String>>,
    state: watch::Sender<ConnectionState>,
    connection: Mutex<Option<ActiveConnection>>,
    /// Held across every send so queued and live events never overtake
    /// each other.
    queue: Mutex<OfflineQueue>,
    subscribers: SubscriberRegistry,
    reconnect_attempts: AtomicU32,
    pending_reconnect: std::sync::Mutex<Option<PendingReconnect>>,
    /// Bumped on every connect and disconnect. Read loops from an older
    /// generation are ignored.
    connection_generation: AtomicU64,
    expected_disconnect: AtomicBool,
    is_connecting: AtomicBool,
}

impl RealtimeClient {
    pub fn new(config: ClientConfig, transport_factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            transport_factory,
            token: RwLock::new(None),
            state: watch::channel(ConnectionState::Disconnected).0,
            connection: Mutex::new(None),
            queue: Mutex::new(OfflineQueue::new()),
            subscribers: SubscriberRegistry::new(),
            reconnect_attempts: AtomicU32::new(0),
            pending_reconnect: std::sync::Mutex::new(None),
            connection_generation: AtomicU64::new(0),
            expected_disconnect: AtomicBool::new(false),
            is_connecting: AtomicBool::new(false),
        })
    }

    /// Builds a client that dials `config.ws_url` over WebSocket.
    pub fn with_websocket(config: ClientConfig) -> Arc<Self> {
        let factory = Arc::new(TokioWebSocketTransportFactory::new(config.ws_url.clone()));
        Self::new(config, factory)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Stores the credential used by the next `connect`. Does not connect.
    pub fn set_identity_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn identity_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// A receiver that observes every connection state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Delay of the reconnect timer currently pending, if any.
    pub fn pending_reconnect_delay(&self) -> Option<Duration> {
        self.pending_reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|pending| pending.delay)
    }

    pub async fn queued_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn queued_events(&self) -> Vec<QueuedEvent> {
        self.queue.lock().await.iter().cloned().collect()
    }

    pub fn on(&self, event: &str, subscriber: Subscriber) {
        self.subscribers.subscribe(event, subscriber);
    }

    /// Removes a subscriber. Unknown subscribers are ignored.
    pub fn off(&self, event: &str, subscriber: &Subscriber) {
        self.subscribers.unsubscribe(event, subscriber);
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers.subscriber_count(event)
    }

    /// Synchronously invokes every local subscriber of `event`.
    ///
    /// Used for backend-delivered frames and for local echo. Returns how
    /// many subscribers ran.
    pub fn trigger(&self, event: &str, payload: &Value) -> usize {
        self.subscribers.dispatch(event, payload)
    }

    /// Opens the logical connection and flushes the offline queue.
    ///
    /// Without an identity token this logs and does nothing. A failed attempt
    /// schedules a reconnect (when enabled) and reports the failure.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let Some(token) = self.identity_token() else {
            warn!(target: "Realtime/Transport", "connect() called without an identity token, ignoring");
            return Ok(());
        };

        if self.is_connecting.swap(true, Ordering::SeqCst) {
            debug!(target: "Realtime/Transport", "Connect already in progress");
            return Ok(());
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::SeqCst);
        });

        if self.connection.lock().await.is_some() {
            debug!(target: "Realtime/Transport", "Already connected");
            return Ok(());
        }

        self.expected_disconnect.store(false, Ordering::SeqCst);
        self.cancel_reconnect();
        self.set_state(ConnectionState::Connecting);
        info!(target: "Realtime/Transport", "Connecting to {}", self.config.ws_url);

        let (transport, events) = match self.transport_factory.create_transport(&token).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(target: "Realtime/Transport", "Failed to connect: {e}");
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
                return Err(TransportError::failure(e.to_string()));
            }
        };

        if self.expected_disconnect.load(Ordering::SeqCst) {
            info!(target: "Realtime/Transport", "Disconnect requested while connecting, closing new transport");
            transport.disconnect().await;
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        }

        let generation = self.connection_generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.connection.lock().await = Some(ActiveConnection {
            transport,
            generation,
        });
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        info!(target: "Realtime/Transport", "Connected (generation {generation})");

        if let Some(this) = self.this.upgrade() {
            tokio::spawn(this.read_loop(events, generation));
        }

        self.subscribers.dispatch(CONNECT, &Value::Null);
        self.flush_queue().await;
        Ok(())
    }

    /// Closes the connection and cancels any pending reconnect. Idempotent;
    /// `connect` may be called again afterwards.
    pub async fn disconnect(&self) {
        info!(target: "Realtime/Transport", "Disconnecting client intentionally.");
        self.expected_disconnect.store(true, Ordering::SeqCst);
        self.cancel_reconnect();
        self.connection_generation.fetch_add(1, Ordering::SeqCst);

        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.transport.disconnect().await;
        }

        if self.set_state(ConnectionState::Disconnected) == ConnectionState::Connected {
            self.subscribers.dispatch(DISCONNECT, &Value::Null);
        }
    }

    /// Sends `payload` under `event`, or queues it while offline.
    ///
    /// While older events are still queued a live send would overtake them,
    /// so the event is queued behind them instead.
    pub async fn emit(&self, event: &str, payload: Value) -> Result<EmitOutcome, TransportError> {
        let mut queue = self.queue.lock().await;
        let connection = self.connection.lock().await.clone();

        match connection {
            Some(connection) if queue.is_empty() => {
                self.deliver(&connection, event, &payload).await?;
                Ok(EmitOutcome::Delivered)
            }
            _ => {
                let id = queue.push(event, payload);
                debug!(
                    target: "Realtime/Queue",
                    "Queued '{}' as {} ({} pending)",
                    event,
                    id,
                    queue.len()
                );
                Ok(EmitOutcome::Queued)
            }
        }
    }

    async fn deliver(
        &self,
        connection: &ActiveConnection,
        event: &str,
        payload: &Value,
    ) -> Result<(), TransportError> {
        let frame = Frame::new(event, payload.clone()).encode()?;
        if let Err(e) = connection.transport.send_frame(&frame).await {
            warn!(target: "Realtime/Transport", "Send of '{event}' failed: {e}");
            self.handle_connection_lost(connection.generation).await;
            return Err(TransportError::failure(e.to_string()));
        }
        debug!(target: "Realtime/Transport", "--> {event}");
        Ok(())
    }

    /// Sends queued events oldest first, awaiting each send before the next.
    /// Stops at the first failure, leaving the rest queued.
    async fn flush_queue(&self) -> usize {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return 0;
        }
        info!(target: "Realtime/Queue", "Flushing {} queued events", queue.len());

        let mut flushed = 0;
        while let Some(event) = queue.front().cloned() {
            let Some(connection) = self.connection.lock().await.clone() else {
                warn!(
                    target: "Realtime/Queue",
                    "Connection lost during flush, {} events remain queued",
                    queue.len()
                );
                break;
            };

            match self
                .deliver(&connection, &event.name, &event.payload)
                .await
            {
                Ok(()) => {
                    queue.pop_front();
                    flushed += 1;
                }
                Err(e) => {
                    warn!(
                        target: "Realtime/Queue",
                        "Flush stopped at {}: {}, {} events remain queued",
                        event.id,
                        e,
                        queue.len()
                    );
                    break;
                }
            }
        }
        flushed
    }

    async fn read_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        generation: u64,
    ) {
        while let Some(event) = events.recv().await {
            if self.connection_generation.load(Ordering::SeqCst) != generation {
                debug!(target: "Realtime/Transport", "Read loop for generation {generation} is stale, exiting");
                return;
            }
            match event {
                TransportEvent::Connected => {
                    debug!(target: "Realtime/Transport", "Transport connected event received");
                }
                TransportEvent::FrameReceived(text) => self.handle_frame(&text),
                TransportEvent::Disconnected => break,
            }
        }
        self.handle_connection_lost(generation).await;
    }

    fn handle_frame(&self, text: &str) {
        match Frame::decode(text) {
            Ok(frame) => {
                debug!(target: "Realtime/Transport", "<-- {}", frame.event);
                self.trigger(&frame.event, &frame.data);
            }
            Err(e) => {
                warn!(target: "Realtime/Transport", "Dropping malformed frame: {e}");
            }
        }
    }

    /// Tears down the connection of `generation` after a drop or a failed
    /// send, then schedules a reconnect. No-op for stale generations.
    async fn handle_connection_lost(&self, generation: u64) {
        let connection = {
            let mut guard = self.connection.lock().await;
            let is_current = guard
                .as_ref()
                .is_some_and(|current| current.generation == generation);
            if !is_current {
                return;
            }
            guard.take()
        };
        if let Some(connection) = connection {
            connection.transport.disconnect().await;
        }

        info!(target: "Realtime/Transport", "Transport disconnected unexpectedly.");
        self.set_state(ConnectionState::Disconnected);
        self.subscribers.dispatch(DISCONNECT, &Value::Null);
        self.schedule_reconnect();
    }

    /// Replaces any pending reconnect timer with one for the next attempt.
    fn schedule_reconnect(&self) -> Option<Duration> {
        if !self.config.auto_reconnect || self.expected_disconnect.load(Ordering::SeqCst) {
            return None;
        }
        let this = self.this.upgrade()?;

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.config.reconnect.delay(attempt);
        info!(
            target: "Realtime/Transport",
            "Will attempt to reconnect in {:?} (attempt {})",
            delay,
            attempt + 1
        );

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.pending_reconnect
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Err(e) = this.connect().await {
                warn!(target: "Realtime/Transport", "Reconnect attempt failed: {e}");
            }
        });

        let previous = self
            .pending_reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(PendingReconnect { handle, delay });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        Some(delay)
    }

    fn cancel_reconnect(&self) {
        let pending = self
            .pending_reconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pending) = pending {
            debug!(target: "Realtime/Transport", "Cancelling pending reconnect");
            pending.handle.abort();
        }
    }

    fn set_state(&self, state: ConnectionState) -> ConnectionState {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(target: "Realtime/Transport", "Connection state {previous:?} -> {state:?}");
        }
        previous
    }
}
