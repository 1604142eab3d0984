//! Connection management.
//!
//! [`PersistentConnection`] keeps one transport connection to the broker
//! alive. A background supervisor task owns the state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!       ^                           |
//!       +---- transport shutdown ---+
//! ```
//!
//! After a transport shutdown the supervisor immediately starts connecting
//! again, waiting between attempts according to the [`ReconnectPolicy`].
//! Listeners are awaited in registration order on every transition, before
//! the matching [`ConnectionEvent`] is broadcast.

pub mod backoff;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use backoff::ReconnectPolicy;

use crate::protocol::{Channel, Connection, ConnectionFactory};
use crate::utils::error::{BusError, Result};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connectivity notifications re-exposed by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Hooks run by the supervisor on every state transition.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// Runs once the new transport connection accepts channels.
    async fn on_connected(&self);

    /// Runs as soon as the transport connection is known to be gone.
    async fn on_disconnected(&self);
}

/// A self-healing connection to the broker.
pub struct PersistentConnection {
    factory: Arc<dyn ConnectionFactory>,
    policy: ReconnectPolicy,
    current: RwLock<Option<Arc<dyn Connection>>>,
    epoch: AtomicU64,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentConnection {
    pub fn new(factory: Arc<dyn ConnectionFactory>, policy: ReconnectPolicy) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            factory,
            policy,
            current: RwLock::new(None),
            epoch: AtomicU64::new(0),
            state,
            events,
            listeners: RwLock::new(Vec::new()),
            shutdown,
            supervisor: Mutex::new(None),
        })
    }

    /// Registers a listener. Listeners added before [`Self::start`] see the
    /// first `Connected` transition.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Spawns the supervisor task. Calling it again has no effect. Must be
    /// called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        if supervisor.is_none() && !*self.shutdown.borrow() {
            *supervisor = Some(tokio::spawn(self.clone().run()));
        }
    }

    /// Waits until connected. Returns immediately when already connected.
    pub async fn ensure_connected(&self, timeout: Duration) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(BusError::Shutdown);
        }
        let mut state = self.state.subscribe();
        match tokio::time::timeout(timeout, state.wait_for(|s| *s == ConnectionState::Connected))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BusError::Shutdown),
            Err(_) => Err(BusError::Connectivity(format!(
                "no connection to {} within {:?}",
                self.factory.describe(),
                timeout
            ))),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Number of transport connections established so far. Changes exactly
    /// when a new connection epoch starts.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Opens a channel on the live transport connection.
    pub async fn create_channel(&self) -> Result<Box<dyn Channel>> {
        let connection = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BusError::NotConnected)?;
        connection.create_channel().await.map_err(BusError::from)
    }

    /// Stops the supervisor and closes the transport connection.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        let connection = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.state.send_replace(ConnectionState::Disconnected);
        debug!("persistent connection shut down");
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.state.send_replace(ConnectionState::Connecting);

            let result = tokio::select! {
                _ = stopped(&mut shutdown) => break,
                result = self.factory.create_connection() => result,
            };
            let connection = match result {
                Ok(connection) => {
                    attempt = 0;
                    connection
                }
                Err(e) => {
                    let delay = self.policy.next(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        endpoint = %self.factory.describe(),
                        error = %e,
                        ?delay,
                        "connection attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = stopped(&mut shutdown) => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            self.established(connection.clone()).await;

            tokio::select! {
                _ = connection.closed() => self.lost().await,
                _ = stopped(&mut shutdown) => {
                    connection.close().await;
                    break;
                }
            }
        }

        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn established(&self, connection: Arc<dyn Connection>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(connection);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(ConnectionState::Connected);
        info!(endpoint = %self.factory.describe(), epoch, "connected to broker");

        for listener in self.listeners() {
            listener.on_connected().await;
        }
        let _ = self.events.send(ConnectionEvent::Connected);
    }

    async fn lost(&self) {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.state.send_replace(ConnectionState::Disconnected);
        warn!(endpoint = %self.factory.describe(), "connection to broker lost");

        for listener in self.listeners() {
            listener.on_disconnected().await;
        }
        let _ = self.events.send(ConnectionEvent::Disconnected);
    }
}

/// Resolves once shutdown is requested. The `watch::Ref` returned by
/// `wait_for` is dropped here so callers stay `Send` across the await.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|s| *s).await;
}

#[cfg(test)]
mod tests;
