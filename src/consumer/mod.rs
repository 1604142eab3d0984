//! Consuming deliveries.
//!
//! A [`ConsumerFactory`] turns a channel plus a queue into a running consumer
//! task. The task owns its channel; handler futures run concurrently and each
//! delivery is settled on that channel once its handler resolves:
//!
//! - success: ack
//! - failure or panic: nack without requeue, then the
//!   [`ConsumerErrorStrategy`] decides what happens to the message

pub mod factory;
pub mod noop;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

pub use factory::{ConsumerFactory, QueueingConsumerFactory};
pub use noop::NoOpConsumerErrorStrategy;
pub use retry::{RetryConfig, RetryConsumerErrorStrategy};

use crate::protocol::Delivery;
use crate::utils::error::BusError;

/// Callback run for each delivery on a queue.
pub type OnMessage = Arc<dyn Fn(Delivery) -> BoxFuture<'static, Result<(), BusError>> + Send + Sync>;

/// What to do with a delivery whose handler failed.
#[async_trait]
pub trait ConsumerErrorStrategy: Send + Sync {
    /// Called from the consumer task after the delivery has been negatively
    /// settled. Must not block.
    fn handle_consumer_error(&self, delivery: Delivery, error: BusError);

    /// Cancels outstanding work and releases resources.
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests;
