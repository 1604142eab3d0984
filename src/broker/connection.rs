use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;

use crate::broker::engine::MemoryBroker;
use crate::broker::queue::{ChannelId, ConnectionId};
use crate::config::ConnectionConfiguration;
use crate::protocol::{
    BasicProperties, Channel, Connection, ConnectionFactory, DeliveryStream, ExchangeKind,
    ProtocolError, QueueOptions,
};

#[async_trait]
impl ConnectionFactory for MemoryBroker {
    async fn create_connection(&self) -> Result<Arc<dyn Connection>, ProtocolError> {
        let (id, closed) = self.lock().open_connection()?;
        Ok(MemoryConnection::attach(self.clone(), id, closed))
    }

    fn describe(&self) -> String {
        "memory://local".to_string()
    }
}

impl MemoryBroker {
    /// A connection factory that logs in with `configuration`'s username,
    /// password and virtual host.
    pub fn connector(&self, configuration: &ConnectionConfiguration) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            configuration: configuration.clone(),
        }
    }
}

/// Connects to a [`MemoryBroker`] the way a network client connects to a
/// broker: a wrong password or an unknown virtual host is refused.
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    configuration: ConnectionConfiguration,
}

impl MemoryConnector {
    pub fn configuration(&self) -> &ConnectionConfiguration {
        &self.configuration
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnector {
    async fn create_connection(&self) -> Result<Arc<dyn Connection>, ProtocolError> {
        let configuration = &self.configuration;
        let (id, closed) = self.broker.lock().login(
            &configuration.virtual_host,
            &configuration.username,
            &configuration.password,
        )?;
        Ok(MemoryConnection::attach(self.broker.clone(), id, closed))
    }

    fn describe(&self) -> String {
        format!(
            "memory://{}@{}",
            self.configuration.username,
            self.configuration.endpoint()
        )
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: ConnectionId,
    broker: MemoryBroker,
    closed: watch::Receiver<bool>,
}

impl MemoryConnection {
    fn attach(
        broker: MemoryBroker,
        id: ConnectionId,
        closed: watch::Receiver<bool>,
    ) -> Arc<dyn Connection> {
        Arc::new(Self { id, broker, closed })
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Box<dyn Channel>, ProtocolError> {
        let id = self.broker.lock().open_channel(self.id)?;
        Ok(Box::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
    }

    async fn close(&self) {
        self.broker.lock().close_connection(self.id);
    }
}

/// A channel on a [`MemoryConnection`]. Dropping it closes it.
pub struct MemoryChannel {
    id: ChannelId,
    broker: MemoryBroker,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.lock().is_channel_open(self.id)
    }

    async fn exchange_declare(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), ProtocolError> {
        self.broker
            .lock()
            .declare_exchange(self.id, exchange, kind, durable)
    }

    async fn queue_declare(
        &mut self,
        queue: &str,
        options: QueueOptions,
    ) -> Result<String, ProtocolError> {
        self.broker.lock().declare_queue(self.id, queue, options)
    }

    async fn queue_bind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ProtocolError> {
        self.broker
            .lock()
            .bind_queue(self.id, queue, exchange, routing_key)
    }

    async fn basic_qos(&mut self, prefetch_count: u16) -> Result<(), ProtocolError> {
        self.broker.lock().set_prefetch(self.id, prefetch_count)
    }

    /// Publishing to a missing exchange closes the channel, as a real broker
    /// does.
    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let mut state = self.broker.lock();
        if !state.is_channel_open(self.id) {
            return Err(ProtocolError::ChannelClosed);
        }
        let result = state.publish(exchange, routing_key, properties, body);
        if matches!(result, Err(ProtocolError::NotFound(_))) {
            state.close_channel(self.id);
        }
        result
    }

    async fn basic_consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, ProtocolError> {
        let receiver = self.broker.lock().consume(self.id, queue, consumer_tag)?;
        Ok(receiver.boxed())
    }

    async fn basic_ack(&mut self, delivery_tag: u64) -> Result<(), ProtocolError> {
        self.broker.lock().settle(self.id, delivery_tag, false)
    }

    async fn basic_nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), ProtocolError> {
        self.broker.lock().settle(self.id, delivery_tag, requeue)
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.broker.lock().close_channel(self.id);
    }
}
