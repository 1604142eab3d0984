use async_trait::async_trait;
use tracing::debug;

use super::{Bus, BusInner};
use crate::message::Message;
use crate::protocol::BasicProperties;
use crate::serializer::Serializer;
use crate::utils::error::{BusError, Result};

/// Publishing pre-serialized bodies by type id.
#[async_trait]
pub trait RawPublisher: Send + Sync + 'static {
    async fn raw_publish_type(&self, type_name: &str, body: Vec<u8>) -> Result<()>;
}

impl<S: Serializer> BusInner<S> {
    /// Declares `exchange` if this connection has not yet, then publishes on
    /// a pooled channel.
    pub(crate) async fn publish_envelope(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<()> {
        self.ensure_connected_now()?;
        let mut pooled = self.pool.acquire(&self.connection).await?;
        let channel = pooled.get()?;

        let correlation_id = properties.correlation_id.clone();
        let declared = self.topology.declare_exchange_once(channel, exchange).await;
        let published = match declared {
            Ok(()) => {
                channel
                    .basic_publish(exchange, routing_key, properties, body)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            pooled.discard();
            return Err(BusError::PublishFailed(e));
        }
        debug!(
            exchange,
            routing_key,
            correlation_id = correlation_id.as_deref().unwrap_or_default(),
            "published"
        );
        Ok(())
    }

    pub(crate) fn properties_for(&self, type_name: &str) -> BasicProperties {
        BasicProperties::new()
            .with_type(type_name)
            .with_correlation_id((self.correlation_id)())
            .with_persistent(false)
    }
}

impl<S: Serializer> Bus<S> {
    /// Publishes `message` to the exchange and topic the conventions derive
    /// from its type id.
    pub async fn publish<T: Message>(&self, message: &T) -> Result<()> {
        self.inner.ensure_open()?;
        let body = self.inner.serializer.message_to_bytes(message)?;
        let exchange = self.inner.conventions.exchange_name(T::TYPE_NAME);
        let topic = self.inner.conventions.topic_name(T::TYPE_NAME);
        self.raw_publish(&exchange, &topic, T::TYPE_NAME, body).await
    }

    /// Publishes an already serialized body.
    pub async fn raw_publish(
        &self,
        exchange: &str,
        topic: &str,
        type_name: &str,
        body: Vec<u8>,
    ) -> Result<()> {
        self.inner.ensure_open()?;
        let properties = self.inner.properties_for(type_name);
        self.inner
            .publish_envelope(exchange, topic, properties, body)
            .await
    }

    /// Publishes an already serialized body under the exchange and topic the
    /// conventions derive from `type_name`.
    pub async fn raw_publish_type(&self, type_name: &str, body: Vec<u8>) -> Result<()> {
        let exchange = self.inner.conventions.exchange_name(type_name);
        let topic = self.inner.conventions.topic_name(type_name);
        self.raw_publish(&exchange, &topic, type_name, body).await
    }
}

#[async_trait]
impl<S: Serializer> RawPublisher for Bus<S> {
    async fn raw_publish_type(&self, type_name: &str, body: Vec<u8>) -> Result<()> {
        Bus::raw_publish_type(self, type_name, body).await
    }
}
