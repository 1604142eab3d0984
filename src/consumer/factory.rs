use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ConsumerErrorStrategy, OnMessage};
use crate::protocol::{Channel, Delivery, DeliveryStream};
use crate::utils::error::{BusError, Result};

/// Starts and tracks consumer tasks.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    /// Starts consuming `queue` on `channel`. The consumer task takes
    /// ownership of the channel. Returns the consumer tag.
    async fn start_consumer(
        &self,
        channel: Box<dyn Channel>,
        queue: &str,
        on_message: OnMessage,
    ) -> Result<String>;

    /// Aborts every running consumer task. Their channels close and the
    /// broker requeues whatever they had not settled.
    async fn clear_consumers(&self);

    /// Aborts every consumer and shuts the error strategy down.
    async fn shutdown(&self);
}

/// Runs one task per consumer; handler futures of a consumer run
/// concurrently, bounded by the channel's prefetch window.
pub struct QueueingConsumerFactory {
    error_strategy: Arc<dyn ConsumerErrorStrategy>,
    consumers: Mutex<JoinSet<()>>,
}

impl QueueingConsumerFactory {
    pub fn new(error_strategy: Arc<dyn ConsumerErrorStrategy>) -> Self {
        Self {
            error_strategy,
            consumers: Mutex::new(JoinSet::new()),
        }
    }

    /// Number of consumer tasks still running.
    pub fn running(&self) -> usize {
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        while consumers.try_join_next().is_some() {}
        consumers.len()
    }

    fn take_consumers(&self) -> JoinSet<()> {
        std::mem::take(&mut *self.consumers.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl ConsumerFactory for QueueingConsumerFactory {
    async fn start_consumer(
        &self,
        mut channel: Box<dyn Channel>,
        queue: &str,
        on_message: OnMessage,
    ) -> Result<String> {
        let consumer_tag = Uuid::new_v4().to_string();
        let deliveries = channel.basic_consume(queue, &consumer_tag).await?;
        debug!(queue, consumer_tag = %consumer_tag, "consumer started");

        let task = run_consumer(
            channel,
            deliveries,
            on_message,
            self.error_strategy.clone(),
            queue.to_string(),
        );
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        while consumers.try_join_next().is_some() {}
        consumers.spawn(task);
        Ok(consumer_tag)
    }

    async fn clear_consumers(&self) {
        let mut consumers = self.take_consumers();
        let count = consumers.len();
        consumers.shutdown().await;
        debug!(count, "consumers cleared");
    }

    async fn shutdown(&self) {
        self.clear_consumers().await;
        self.error_strategy.shutdown().await;
    }
}

async fn run_consumer(
    mut channel: Box<dyn Channel>,
    mut deliveries: DeliveryStream,
    on_message: OnMessage,
    error_strategy: Arc<dyn ConsumerErrorStrategy>,
    queue: String,
) {
    let mut handlers: JoinSet<Result<()>> = JoinSet::new();
    let mut in_flight: HashMap<Id, Delivery> = HashMap::new();

    loop {
        tokio::select! {
            next = deliveries.next() => {
                let Some(delivery) = next else { break };
                let handle = handlers.spawn(on_message(delivery.clone()));
                in_flight.insert(handle.id(), delivery);
            }
            Some(joined) = handlers.join_next_with_id(), if !handlers.is_empty() => {
                let (id, outcome) = match joined {
                    Ok((id, outcome)) => (id, outcome),
                    Err(e) => (e.id(), Err(panicked(&e))),
                };
                if let Some(delivery) = in_flight.remove(&id) {
                    settle(&mut *channel, delivery, outcome, &*error_strategy).await;
                }
            }
        }
    }

    debug!(queue = %queue, in_flight = in_flight.len(), "consumer stopped");
    handlers.detach_all();
}

fn panicked(e: &JoinError) -> BusError {
    BusError::Handler(format!("message handler panicked: {e}").into())
}

async fn settle(
    channel: &mut dyn Channel,
    delivery: Delivery,
    outcome: Result<()>,
    error_strategy: &dyn ConsumerErrorStrategy,
) {
    match outcome {
        Ok(()) => {
            if let Err(e) = channel.basic_ack(delivery.delivery_tag).await {
                warn!(delivery_tag = delivery.delivery_tag, error = %e, "ack failed");
            }
        }
        Err(error) => {
            warn!(
                consumer_tag = %delivery.consumer_tag,
                routing_key = %delivery.routing_key,
                kind = error.as_label(),
                error = %error,
                "message handler failed"
            );
            if let Err(e) = channel.basic_nack(delivery.delivery_tag, false).await {
                warn!(delivery_tag = delivery.delivery_tag, error = %e, "nack failed");
            }
            error_strategy.handle_consumer_error(delivery, error);
        }
    }
}
