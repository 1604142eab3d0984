//! Delayed redelivery of failed messages.
//!
//! When a handler fails, the strategy waits for `delay` and then republishes
//! the original message to its original exchange and routing key with the
//! `RetryCount` header incremented. Once a message has been retried
//! `max_retries` times it goes to the fallback strategy instead.
//!
//! Republishing uses a dedicated transport connection, created lazily from
//! the connection factory and re-created when it closes. Failures on this
//! path are logged and the message is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::{ConsumerErrorStrategy, NoOpConsumerErrorStrategy};
use crate::protocol::{BasicProperties, Channel, Connection, ConnectionFactory, Delivery};
use crate::utils::error::{BusError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Wait before a failed message is republished.
    pub delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_retries: 3,
        }
    }
}

struct Link {
    connection: Arc<dyn Connection>,
    channel: Option<Box<dyn Channel>>,
}

struct RetryInner {
    factory: Arc<dyn ConnectionFactory>,
    fallback: Arc<dyn ConsumerErrorStrategy>,
    config: RetryConfig,
    link: tokio::sync::Mutex<Option<Link>>,
}

pub struct RetryConsumerErrorStrategy {
    inner: Arc<RetryInner>,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl RetryConsumerErrorStrategy {
    /// Retries with the default delay and limit, falling back to
    /// [`NoOpConsumerErrorStrategy`].
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::with_fallback(factory, Arc::new(NoOpConsumerErrorStrategy), RetryConfig::default())
    }

    pub fn with_fallback(
        factory: Arc<dyn ConnectionFactory>,
        fallback: Arc<dyn ConsumerErrorStrategy>,
        config: RetryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RetryInner {
                factory,
                fallback,
                config,
                link: tokio::sync::Mutex::new(None),
            }),
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> RetryConfig {
        self.inner.config
    }

    /// Number of delayed retries not yet completed.
    pub fn pending(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }
}

impl RetryInner {
    async fn retry(&self, delivery: Delivery, error: BusError) {
        let previous = delivery.properties.retry_count();
        if previous >= self.config.max_retries {
            info!(
                routing_key = %delivery.routing_key,
                retries = previous,
                "retry limit reached, handing message to fallback strategy"
            );
            self.fallback.handle_consumer_error(delivery, error);
            return;
        }

        match self.republish(&delivery, previous + 1).await {
            Ok(()) => debug!(
                exchange = %delivery.exchange,
                routing_key = %delivery.routing_key,
                retry = previous + 1,
                "message republished for retry"
            ),
            Err(e) => error!(
                exchange = %delivery.exchange,
                routing_key = %delivery.routing_key,
                error = %e,
                "failed to republish message for retry"
            ),
        }
    }

    async fn republish(&self, delivery: &Delivery, retry_count: u32) -> Result<()> {
        let mut properties = BasicProperties::new().with_persistent(true);
        properties.message_type = delivery.properties.message_type.clone();
        properties.correlation_id = delivery.properties.correlation_id.clone();
        properties.set_retry_count(retry_count);

        let mut link = self.link.lock().await;
        let channel = self.channel(&mut *link).await?;
        let result = channel
            .basic_publish(
                &delivery.exchange,
                &delivery.routing_key,
                properties,
                delivery.body.clone(),
            )
            .await;
        if let Err(e) = result {
            if let Some(link) = link.as_mut() {
                link.channel = None;
            }
            return Err(BusError::PublishFailed(e));
        }
        Ok(())
    }

    async fn channel<'a>(&self, link: &'a mut Option<Link>) -> Result<&'a mut Box<dyn Channel>> {
        if link.as_ref().is_none_or(|l| !l.connection.is_open()) {
            let connection = self.factory.create_connection().await?;
            *link = Some(Link {
                connection,
                channel: None,
            });
        }
        let link = link.as_mut().ok_or(BusError::NotConnected)?;
        if link.channel.as_ref().is_none_or(|c| !c.is_open()) {
            link.channel = Some(link.connection.create_channel().await?);
        }
        link.channel.as_mut().ok_or(BusError::NotConnected)
    }
}

#[async_trait]
impl ConsumerErrorStrategy for RetryConsumerErrorStrategy {
    fn handle_consumer_error(&self, delivery: Delivery, error: BusError) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(routing_key = %delivery.routing_key, "retry strategy shut down, dropping message");
            return;
        }
        if !error.is_retryable() {
            self.inner.fallback.handle_consumer_error(delivery, error);
            return;
        }

        let inner = self.inner.clone();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            tokio::time::sleep(inner.config.delay).await;
            inner.retry(delivery, error).await;
        });
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        tasks.shutdown().await;

        let link = self.inner.link.lock().await.take();
        if let Some(mut link) = link {
            if let Some(mut channel) = link.channel.take() {
                let _ = channel.close().await;
            }
            link.connection.close().await;
        }
        self.inner.fallback.shutdown().await;
        debug!("retry consumer error strategy shut down");
    }
}
