//! Connection lifecycle with bounded exponential backoff.
//!
//! ```text
//!  disconnected ──connect()──▶ connecting ──ok──▶ connected
//!        ▲                        │  ▲               │
//!        │                 error  │  │ backoff       │ link lost
//!        │                        ▼  │               ▼
//!        └──── disconnect() ─── (retry) ◀──────── disconnected
//!                                 │
//!                      attempts exhausted
//!                                 ▼
//!                               error
//! ```
//!
//! A supervisor task owns the link. It decodes inbound frames and
//! dispatches every lifecycle change and message through the [`EventBus`].
//! `emit` never queues: with no live link the message is dropped and logged.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::events::{ChannelEvent, EventBus, EventKind, Subscription};
use crate::protocol::WireMessage;
use crate::transport::{Connector, Link};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection attempts exhausted. Only `connect()` leaves this state.
    Error,
}

/// A failed connection attempt or a broken link.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    Refused(String),
    Handshake(String),
    Closed,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Refused(e) => write!(f, "Connection refused: {e}"),
            Self::Handshake(e) => write!(f, "Handshake failed: {e}"),
            Self::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Reconnection policy: `delay(n) = min(base · 2ⁿ, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

/// Result of [`ConnectionManager::emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Sent,
    /// Not connected, link buffer full, or the message failed to encode.
    Dropped,
}

type SharedOutgoing = Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>;

/// Owns one logical channel to the relay.
pub struct ConnectionManager<C> {
    connector: Arc<C>,
    backoff: Backoff,
    bus: Arc<EventBus>,
    state: Arc<watch::Sender<ConnectionState>>,
    outgoing: SharedOutgoing,
    supervisor: Option<JoinHandle<()>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, backoff: Backoff) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector: Arc::new(connector),
            backoff,
            bus: Arc::new(EventBus::new()),
            state: Arc::new(state),
            outgoing: Arc::new(Mutex::new(None)),
            supervisor: None,
        }
    }

    /// Start connecting in the background. No-op while a supervisor is
    /// already running; restarts it from `error` or `disconnected`.
    pub fn connect(&mut self) {
        if let Some(handle) = &self.supervisor {
            if !handle.is_finished() {
                return;
            }
        }

        log::info!("Connecting");
        let supervisor = Supervisor {
            connector: self.connector.clone(),
            backoff: self.backoff,
            bus: self.bus.clone(),
            state: self.state.clone(),
            outgoing: self.outgoing.clone(),
        };
        self.supervisor = Some(tokio::spawn(supervisor.run()));
    }

    /// Close the link and cancel any pending reconnection.
    pub fn disconnect(&mut self) {
        let was_running = match self.supervisor.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        };
        lock(&self.outgoing).take();

        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if was_running || previous != ConnectionState::Disconnected {
            log::info!("Disconnected by client");
            self.bus.dispatch(&ChannelEvent::Disconnect {
                reason: "client disconnect".into(),
            });
        }
    }

    /// Send a message if connected, otherwise drop it with a warning.
    pub fn emit(&self, message: &WireMessage) -> EmitOutcome {
        let guard = lock(&self.outgoing);
        let Some(tx) = guard.as_ref() else {
            log::warn!("Not connected; dropping {}", message.name());
            return EmitOutcome::Dropped;
        };

        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping {}: {e}", message.name());
                return EmitOutcome::Dropped;
            }
        };

        match tx.try_send(frame) {
            Ok(()) => {
                log::trace!("Sent {}", message.name());
                EmitOutcome::Sent
            }
            Err(e) => {
                log::warn!("Link unavailable; dropping {}: {e}", message.name());
                EmitOutcome::Dropped
            }
        }
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, handler)
    }

    pub fn off(&self, subscription: Subscription) {
        self.bus.off(subscription);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }
}

impl<C> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────────
// Supervisor task
// ───────────────────────────────────────────────────────────────────

struct Supervisor<C> {
    connector: Arc<C>,
    backoff: Backoff,
    bus: Arc<EventBus>,
    state: Arc<watch::Sender<ConnectionState>>,
    outgoing: SharedOutgoing,
}

impl<C: Connector> Supervisor<C> {
    async fn run(self) {
        let mut failures: u32 = 0;

        loop {
            self.state.send_replace(ConnectionState::Connecting);

            match self.connector.connect().await {
                Ok(link) => {
                    failures = 0;
                    self.serve(link).await;
                }
                Err(error) => {
                    failures += 1;
                    log::warn!(
                        "Connection attempt {failures}/{} failed: {error}",
                        self.backoff.max_attempts
                    );
                    self.bus.dispatch(&ChannelEvent::ConnectError {
                        attempt: failures,
                        error,
                    });

                    if failures >= self.backoff.max_attempts {
                        log::warn!("Giving up after {failures} attempts");
                        self.state.send_replace(ConnectionState::Error);
                        self.bus
                            .dispatch(&ChannelEvent::ReconnectFailed { attempts: failures });
                        return;
                    }
                }
            }

            let delay = self.backoff.delay_for(failures.saturating_sub(1));
            log::debug!("Reconnecting in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    /// Pump one live link until it closes.
    async fn serve(&self, link: Link) {
        let Link {
            outgoing,
            mut incoming,
        } = link;
        *lock(&self.outgoing) = Some(outgoing);
        self.state.send_replace(ConnectionState::Connected);
        log::info!("Connected");
        self.bus.dispatch(&ChannelEvent::Connect);

        while let Some(frame) = incoming.recv().await {
            match WireMessage::decode(&frame) {
                Ok(msg) => {
                    log::trace!("Received {}", msg.name());
                    self.bus.dispatch(&ChannelEvent::Message(msg));
                }
                Err(e) => log::warn!("Dropping malformed frame ({} bytes): {e}", frame.len()),
            }
        }

        lock(&self.outgoing).take();
        self.state.send_replace(ConnectionState::Disconnected);
        log::info!("Link lost");
        self.bus.dispatch(&ChannelEvent::Disconnect {
            reason: ConnectionError::Closed.to_string(),
        });
    }
}
