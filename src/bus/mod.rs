//! The bus façade.
//!
//! [`Bus`] is what applications hold. It publishes and subscribes by message
//! type, runs request/response flows, and forwards scheduling requests to a
//! scheduler worker, all over one [`PersistentConnection`] that it keeps
//! alive. Subscriptions survive broker restarts: every subscription is
//! recorded in an ordered registry and replayed on each reconnect.
//!
//! Cloning a `Bus` is cheap and every clone drives the same connection.

pub mod builder;
pub mod pool;
pub mod publish;
pub mod rpc;
pub mod schedule;
pub mod subscribe;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

pub use builder::BusBuilder;
pub use publish::RawPublisher;

use crate::connection::{ConnectionEvent, ConnectionListener, PersistentConnection, ReconnectPolicy};
use crate::consumer::ConsumerFactory;
use crate::conventions::Conventions;
use crate::message::Message;
use crate::protocol::Delivery;
use crate::serializer::{JsonSerializer, Serializer};
use crate::topology::{SubscriptionRegistry, TopologyCache};
use crate::utils::error::{BusError, Result};
use pool::ChannelPool;
use rpc::ResponseSlots;

/// Settings the bus is built with. Immutable once the bus exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusConfig {
    /// Unacknowledged deliveries allowed per consumer channel.
    pub prefetch_count: u16,
    pub reconnect: ReconnectPolicy,
    /// How long operations that must wait for the broker are willing to.
    pub connect_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 1000,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub(crate) type CorrelationIdFn = Arc<dyn Fn() -> String + Send + Sync>;

pub(crate) struct BusInner<S: Serializer> {
    connection: Arc<PersistentConnection>,
    serializer: S,
    conventions: Conventions,
    config: BusConfig,
    topology: TopologyCache,
    subscriptions: SubscriptionRegistry,
    responses: ResponseSlots,
    pool: ChannelPool,
    consumers: Arc<dyn ConsumerFactory>,
    correlation_id: CorrelationIdFn,
    closed: AtomicBool,
}

impl<S: Serializer> BusInner<S> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn ensure_connected_now(&self) -> Result<()> {
        self.ensure_open()?;
        if self.connection.is_connected() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }

    /// Checks the delivered type id and decodes the body.
    fn decode<T: Message>(&self, delivery: &Delivery) -> Result<T> {
        let actual = delivery.properties.message_type.as_deref().unwrap_or_default();
        if actual != T::TYPE_NAME {
            error!(
                expected = T::TYPE_NAME,
                actual,
                "message type is incorrect"
            );
            return Err(BusError::MessageTypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(self.serializer.bytes_to_message::<T>(&delivery.body)?)
    }
}

/// Keeps the bus in step with the connection: caches are wiped when the
/// connection drops and subscriptions are replayed when it comes back.
struct BusListener<S: Serializer> {
    inner: Weak<BusInner<S>>,
}

#[async_trait]
impl<S: Serializer> ConnectionListener for BusListener<S> {
    async fn on_connected(&self) {
        if let Some(inner) = self.inner.upgrade() {
            if inner.ensure_open().is_ok() {
                inner.subscriptions.replay().await;
            }
        }
    }

    async fn on_disconnected(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.consumers.clear_consumers().await;
            inner.topology.clear().await;
            inner.responses.clear().await;
            inner.pool.clear();
            debug!("topology cache, response slots and publish channels cleared");
        }
    }
}

/// A resilient message bus.
pub struct Bus<S: Serializer = JsonSerializer> {
    inner: Arc<BusInner<S>>,
}

impl<S: Serializer> Clone for Bus<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Bus<JsonSerializer> {
    /// Starts configuring a bus over `factory`.
    pub fn builder<F>(factory: F) -> BusBuilder<JsonSerializer>
    where
        F: crate::protocol::ConnectionFactory + 'static,
    {
        BusBuilder::new(factory)
    }
}

impl<S: Serializer> Bus<S> {
    fn start(inner: BusInner<S>) -> Self {
        let inner = Arc::new(inner);
        inner.connection.add_listener(Arc::new(BusListener {
            inner: Arc::downgrade(&inner),
        }));
        inner.connection.start();
        Self { inner }
    }

    /// `Connected` / `Disconnected` notifications.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.events()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Waits up to `timeout` for the broker connection.
    pub async fn ensure_connected(&self, timeout: Duration) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.connection.ensure_connected(timeout).await
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn conventions(&self) -> &Conventions {
        &self.inner.conventions
    }

    /// Stops every consumer, closes the publish channels and the connection.
    /// Calling it again does nothing; any other operation afterwards fails
    /// with [`BusError::Shutdown`].
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.consumers.shutdown().await;
        self.inner.pool.close().await;
        self.inner.connection.shutdown().await;
        info!("bus shut down");
    }
}
