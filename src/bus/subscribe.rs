use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use tracing::info;

use super::{Bus, BusInner};
use crate::consumer::OnMessage;
use crate::message::{HandleMessage, Message};
use crate::protocol::{Delivery, QueueOptions};
use crate::serializer::Serializer;
use crate::topology::SubscriptionAction;
use crate::utils::error::{BusError, HandlerError, Result};

impl<S: Serializer> BusInner<S> {
    /// Opens a channel, declares the subscriber topology and starts the
    /// consumer. Runs on every (re)connect.
    async fn start_subscription(
        &self,
        queue: &str,
        exchange: &str,
        topic: &str,
        on_message: OnMessage,
    ) -> Result<()> {
        let mut channel = self.connection.create_channel().await?;
        self.topology
            .declare_exchange_once(&mut *channel, exchange)
            .await?;
        channel.basic_qos(self.config.prefetch_count).await?;
        channel.queue_declare(queue, QueueOptions::durable()).await?;
        channel.queue_bind(queue, exchange, topic).await?;
        let consumer_tag = self
            .consumers
            .start_consumer(channel, queue, on_message)
            .await?;
        info!(queue, exchange, topic, consumer_tag = %consumer_tag, "subscribed");
        Ok(())
    }
}

impl<S: Serializer> Bus<S> {
    /// Subscribes `on_message` to messages of type `T`.
    ///
    /// The queue is named by the conventions from `T`'s type id and
    /// `subscription_id`, so subscribers sharing an id compete for messages
    /// and subscribers with different ids each get a copy. The subscription
    /// is re-established after every reconnect.
    pub async fn subscribe<T, F>(&self, subscription_id: &str, on_message: F) -> Result<()>
    where
        T: Message,
        F: Fn(T) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        let on_message = Arc::new(on_message);
        self.subscribe_async(subscription_id, move |message: T| {
            let on_message = on_message.clone();
            async move { on_message(message) }
        })
        .await
    }

    /// Like [`Bus::subscribe`] with an asynchronous handler.
    pub async fn subscribe_async<T, F, Fut>(&self, subscription_id: &str, on_message: F) -> Result<()>
    where
        T: Message,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.inner.ensure_open()?;
        let conventions = &self.inner.conventions;
        let queue = conventions.queue_name(T::TYPE_NAME, subscription_id);
        let exchange = conventions.exchange_name(T::TYPE_NAME);
        let topic = conventions.topic_name(T::TYPE_NAME);

        let on_delivery = self.typed_handler(on_message);
        let weak = Arc::downgrade(&self.inner);
        let action: SubscriptionAction = Arc::new(move || {
            let weak = weak.clone();
            let queue = queue.clone();
            let exchange = exchange.clone();
            let topic = topic.clone();
            let on_delivery = on_delivery.clone();
            async move {
                let inner = weak.upgrade().ok_or(BusError::Shutdown)?;
                inner.ensure_open()?;
                inner
                    .start_subscription(&queue, &exchange, &topic, on_delivery)
                    .await
            }
            .boxed()
        });
        self.inner.subscriptions.register(action).await;
        Ok(())
    }

    /// Registers `handler` for messages of type `T`. A handler implementing
    /// [`HandleMessage`] for several types is registered once per type.
    pub async fn subscribe_handler<T, H>(&self, subscription_id: &str, handler: Arc<H>) -> Result<()>
    where
        T: Message,
        H: HandleMessage<T>,
    {
        self.subscribe_async(subscription_id, move |message: T| {
            let handler = handler.clone();
            async move { handler.handle(message).await }
        })
        .await
    }

    /// Wraps a typed handler into a delivery callback that checks the type
    /// id and decodes the body first. A mismatch never reaches the handler.
    pub(crate) fn typed_handler<T, F, Fut>(&self, on_message: F) -> OnMessage
    where
        T: Message,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let on_message = Arc::new(on_message);
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |delivery: Delivery| {
            let on_message = on_message.clone();
            let weak = weak.clone();
            async move {
                let message = weak
                    .upgrade()
                    .ok_or(BusError::Shutdown)?
                    .decode::<T>(&delivery)?;
                on_message(message).await.map_err(BusError::Handler)
            }
            .boxed()
        })
    }
}
