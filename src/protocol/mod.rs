//! The `protocol` module describes the broker wire-protocol client that the bus
//! is built on.
//!
//! The client itself is not part of this crate: any implementation of
//! [`ConnectionFactory`], [`Connection`] and [`Channel`] can carry the bus. The
//! in-process [`crate::broker`] is the implementation used by the tests and the
//! demo binary.

pub mod error;
pub mod properties;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use error::ProtocolError;
pub use properties::{BasicProperties, Delivery, HeaderValue};

/// Stream of deliveries produced by [`Channel::basic_consume`].
///
/// The stream ends when the consumer is cancelled, its channel closes or the
/// owning connection goes away.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes to queues whose binding key equals the routing key.
    Direct,
    /// Routes to every bound queue.
    Fanout,
}

/// Flags used when declaring a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// A queue that survives broker restarts and is shared between consumers.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// A queue private to the declaring connection, removed with it.
    pub fn transient_exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Creates transport connections to a broker.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Opens a new transport connection.
    async fn create_connection(&self) -> Result<Arc<dyn Connection>, ProtocolError>;

    /// Human readable description of the endpoint, used in log lines.
    fn describe(&self) -> String;
}

/// One transport connection. Channels are multiplexed over it.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a new channel on this connection.
    async fn create_channel(&self) -> Result<Box<dyn Channel>, ProtocolError>;

    fn is_open(&self) -> bool;

    /// Resolves once the connection has shut down, for whatever reason.
    async fn closed(&self);

    /// Closes the connection and every channel opened on it.
    async fn close(&self);
}

/// A single-task session on a connection.
///
/// Every operation takes `&mut self`: a channel is owned by exactly one task
/// and is never shared. Dropping a channel aborts it.
#[async_trait]
pub trait Channel: Send {
    fn is_open(&self) -> bool;

    async fn exchange_declare(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), ProtocolError>;

    /// Declares a queue and returns its name.
    async fn queue_declare(
        &mut self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<String, ProtocolError>;

    async fn queue_bind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ProtocolError>;

    /// Caps the number of unacknowledged deliveries per consumer. Zero means
    /// unlimited.
    async fn basic_qos(&mut self, prefetch_count: u16) -> Result<(), ProtocolError>;

    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), ProtocolError>;

    async fn basic_consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ProtocolError>;

    async fn basic_ack(&mut self, delivery_tag: u64) -> Result<(), ProtocolError>;

    async fn basic_nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), ProtocolError>;

    async fn close(&mut self) -> Result<(), ProtocolError>;
}
