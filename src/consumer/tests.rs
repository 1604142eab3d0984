use super::{
    ConsumerErrorStrategy, ConsumerFactory, OnMessage, QueueingConsumerFactory, RetryConfig,
    RetryConsumerErrorStrategy,
};
use crate::broker::MemoryBroker;
use crate::protocol::{
    BasicProperties, Channel, Connection, ConnectionFactory, Delivery, ExchangeKind, QueueOptions,
};
use crate::utils::error::BusError;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingStrategy {
    failures: Mutex<Vec<(String, &'static str)>>,
}

impl RecordingStrategy {
    fn failures(&self) -> Vec<(String, &'static str)> {
        self.failures.lock().unwrap().clone()
    }
}

impl ConsumerErrorStrategy for RecordingStrategy {
    fn handle_consumer_error(&self, delivery: Delivery, error: BusError) {
        self.failures
            .lock()
            .unwrap()
            .push((String::from_utf8_lossy(&delivery.body).into_owned(), error.as_label()));
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

fn delivery(retry_count: Option<u32>) -> Delivery {
    let mut properties = BasicProperties::new()
        .with_type("Orders.Placed:Orders")
        .with_correlation_id("corr-1");
    if let Some(count) = retry_count {
        properties.set_retry_count(count);
    }
    Delivery {
        consumer_tag: "tag".to_string(),
        delivery_tag: 1,
        redelivered: false,
        exchange: String::new(),
        routing_key: "orders".to_string(),
        properties,
        body: b"payload".to_vec(),
    }
}

fn fast_retry(
    broker: &MemoryBroker,
    fallback: Arc<RecordingStrategy>,
) -> RetryConsumerErrorStrategy {
    RetryConsumerErrorStrategy::with_fallback(
        Arc::new(broker.clone()),
        fallback,
        RetryConfig {
            delay: Duration::from_millis(10),
            max_retries: 3,
        },
    )
}

async fn bound_queue(broker: &MemoryBroker) -> (Arc<dyn Connection>, Box<dyn Channel>) {
    let conn = broker.create_connection().await.unwrap();
    let mut channel = conn.create_channel().await.unwrap();
    channel
        .exchange_declare("ex", ExchangeKind::Direct, true)
        .await
        .unwrap();
    channel
        .queue_declare("q", QueueOptions::durable())
        .await
        .unwrap();
    channel.queue_bind("q", "ex", "key").await.unwrap();
    (conn, channel)
}

fn handler(fail_on: &'static [u8]) -> OnMessage {
    Arc::new(move |delivery: Delivery| {
        async move {
            if delivery.body == fail_on {
                Err(BusError::Handler("boom".into()))
            } else {
                Ok(())
            }
        }
        .boxed()
    })
}

#[tokio::test]
async fn test_successful_handler_acks_and_failure_goes_to_strategy() {
    let broker = MemoryBroker::new();
    let (_conn, channel) = bound_queue(&broker).await;
    let strategy = Arc::new(RecordingStrategy::default());
    let factory = QueueingConsumerFactory::new(strategy.clone());
    factory.start_consumer(channel, "q", handler(b"bad")).await.unwrap();

    broker
        .inject("ex", "key", BasicProperties::new(), b"good".to_vec())
        .unwrap();
    broker
        .inject("ex", "key", BasicProperties::new(), b"bad".to_vec())
        .unwrap();

    eventually(|| strategy.failures().len() == 1).await;
    assert_eq!(strategy.failures(), vec![("bad".to_string(), "handler")]);
    assert_eq!(broker.queue_depth("q"), 0);
    assert_eq!(factory.running(), 1);

    factory.shutdown().await;
    assert_eq!(factory.running(), 0);
    assert_eq!(broker.consumer_count("q"), 0);
}

#[tokio::test]
async fn test_panicking_handler_is_reported_as_handler_failure() {
    let broker = MemoryBroker::new();
    let (_conn, channel) = bound_queue(&broker).await;
    let strategy = Arc::new(RecordingStrategy::default());
    let factory = QueueingConsumerFactory::new(strategy.clone());
    let on_message: OnMessage = Arc::new(|delivery: Delivery| {
        async move {
            assert!(delivery.body.is_empty(), "handler blew up");
            Ok(())
        }
        .boxed()
    });
    factory.start_consumer(channel, "q", on_message).await.unwrap();

    broker
        .inject("ex", "key", BasicProperties::new(), b"x".to_vec())
        .unwrap();
    eventually(|| strategy.failures().len() == 1).await;
    assert_eq!(strategy.failures()[0].1, "handler");
    assert_eq!(broker.queue_depth("q"), 0);
}

#[tokio::test]
async fn test_first_failure_is_republished_with_retry_count_one() {
    let broker = MemoryBroker::new();
    let fallback = Arc::new(RecordingStrategy::default());
    let retry = fast_retry(&broker, fallback.clone());

    retry.handle_consumer_error(delivery(None), BusError::Handler("boom".into()));
    eventually(|| broker.published().len() == 1).await;

    let republished = &broker.published()[0];
    assert_eq!(republished.routing_key, "orders");
    assert_eq!(republished.body, b"payload");
    assert_eq!(republished.properties.retry_count(), 1);
    assert!(republished.properties.persistent);
    assert_eq!(
        republished.properties.message_type.as_deref(),
        Some("Orders.Placed:Orders")
    );
    assert_eq!(republished.properties.correlation_id.as_deref(), Some("corr-1"));
    assert!(fallback.failures().is_empty());
    retry.shutdown().await;
}

#[tokio::test]
async fn test_retry_count_two_is_republished_with_three() {
    let broker = MemoryBroker::new();
    let fallback = Arc::new(RecordingStrategy::default());
    let retry = fast_retry(&broker, fallback.clone());

    retry.handle_consumer_error(delivery(Some(2)), BusError::Handler("boom".into()));
    eventually(|| broker.published().len() == 1).await;
    assert_eq!(broker.published()[0].properties.retry_count(), 3);
    assert!(fallback.failures().is_empty());
    retry.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_go_to_fallback_once() {
    let broker = MemoryBroker::new();
    let fallback = Arc::new(RecordingStrategy::default());
    let retry = fast_retry(&broker, fallback.clone());

    retry.handle_consumer_error(delivery(Some(3)), BusError::Handler("boom".into()));
    eventually(|| fallback.failures().len() == 1).await;
    eventually(|| retry.pending() == 0).await;
    assert!(broker.published().is_empty());
    assert_eq!(fallback.failures().len(), 1);
    retry.shutdown().await;
}

#[tokio::test]
async fn test_type_mismatch_skips_retries() {
    let broker = MemoryBroker::new();
    let fallback = Arc::new(RecordingStrategy::default());
    let retry = fast_retry(&broker, fallback.clone());

    retry.handle_consumer_error(
        delivery(None),
        BusError::MessageTypeMismatch {
            expected: "A".into(),
            actual: "B".into(),
        },
    );
    assert_eq!(
        fallback.failures(),
        vec![("payload".to_string(), "message_type_mismatch")]
    );
    assert_eq!(retry.pending(), 0);
    retry.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_broker_drops_retry_and_reconnects_later() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let fallback = Arc::new(RecordingStrategy::default());
    let retry = fast_retry(&broker, fallback.clone());

    retry.handle_consumer_error(delivery(None), BusError::Handler("boom".into()));
    eventually(|| retry.pending() == 0).await;
    assert!(broker.published().is_empty());
    assert!(fallback.failures().is_empty());

    broker.set_reachable(true);
    retry.handle_consumer_error(delivery(None), BusError::Handler("boom".into()));
    eventually(|| broker.published().len() == 1).await;

    broker.drop_connections();
    retry.handle_consumer_error(delivery(Some(1)), BusError::Handler("boom".into()));
    eventually(|| broker.published().len() == 2).await;
    assert_eq!(broker.published()[1].properties.retry_count(), 2);
    retry.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_pending_retries() {
    let broker = MemoryBroker::new();
    let fallback = Arc::new(RecordingStrategy::default());
    let retry = RetryConsumerErrorStrategy::with_fallback(
        Arc::new(broker.clone()),
        fallback,
        RetryConfig {
            delay: Duration::from_secs(60),
            max_retries: 3,
        },
    );
    retry.handle_consumer_error(delivery(None), BusError::Handler("boom".into()));
    assert_eq!(retry.pending(), 1);

    retry.shutdown().await;
    retry.shutdown().await;
    assert_eq!(retry.pending(), 0);
    retry.handle_consumer_error(delivery(None), BusError::Handler("boom".into()));
    assert_eq!(retry.pending(), 0);
    assert!(broker.published().is_empty());
}
