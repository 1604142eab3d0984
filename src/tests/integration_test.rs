use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::broker::MemoryBroker;
use crate::connection::ReconnectPolicy;
use crate::consumer::{ConsumerErrorStrategy, RetryConfig, RetryConsumerErrorStrategy};
use crate::protocol::{BasicProperties, ConnectionFactory, Delivery};
use crate::scheduler::{JobKey, SchedulerConfig, SchedulerWorker};
use crate::topology::RPC_EXCHANGE;
use crate::utils::error::{BusError, HandlerError};
use crate::{Bus, BusConfig, ConnectionEvent, HandleMessage, Message};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
}

impl Message for OrderPlaced {
    const TYPE_NAME: &'static str = "Shop.OrderPlaced:Shop";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderShipped {
    order_id: u64,
}

impl Message for OrderShipped {
    const TYPE_NAME: &'static str = "Shop.OrderShipped:Shop";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

impl Message for Add {
    const TYPE_NAME: &'static str = "Calc.Add:Calc";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Sum {
    value: i64,
}

impl Message for Sum {
    const TYPE_NAME: &'static str = "Calc.Sum:Calc";
}

#[derive(Default)]
struct RecordingStrategy {
    failures: Mutex<Vec<&'static str>>,
}

impl RecordingStrategy {
    fn failures(&self) -> Vec<&'static str> {
        self.failures.lock().unwrap().clone()
    }
}

impl ConsumerErrorStrategy for RecordingStrategy {
    fn handle_consumer_error(&self, _delivery: Delivery, error: BusError) {
        self.failures.lock().unwrap().push(error.as_label());
    }
}

fn test_config() -> BusConfig {
    BusConfig {
        prefetch_count: 10,
        reconnect: ReconnectPolicy::fixed(Duration::from_millis(10)),
        connect_timeout: Duration::from_secs(2),
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 3s");
}

async fn connected_bus(broker: &MemoryBroker, strategy: Arc<dyn ConsumerErrorStrategy>) -> Bus {
    let bus = Bus::builder(broker.clone())
        .config(test_config())
        .error_strategy(strategy)
        .build();
    bus.ensure_connected(Duration::from_secs(2)).await.unwrap();
    bus
}

fn recorder() -> Arc<Mutex<Vec<u64>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[tokio::test]
async fn integration_pubsub_end_to_end() {
    let broker = MemoryBroker::new();
    let bus = connected_bus(&broker, Arc::new(RecordingStrategy::default())).await;
    let received = recorder();

    let sink = received.clone();
    bus.subscribe("billing", move |order: OrderPlaced| {
        sink.lock().unwrap().push(order.order_id);
        Ok(())
    })
    .await
    .unwrap();
    assert!(broker.queue_exists("Shop.OrderPlaced:Shop_billing"));

    bus.publish(&OrderPlaced { order_id: 1 }).await.unwrap();
    bus.publish(&OrderPlaced { order_id: 2 }).await.unwrap();

    eventually(|| received.lock().unwrap().len() == 2).await;
    assert_eq!(*received.lock().unwrap(), vec![1, 2]);
    eventually(|| broker.queue_depth("Shop.OrderPlaced:Shop_billing") == 0).await;
    bus.shutdown().await;
}

#[tokio::test]
async fn integration_type_mismatch_never_reaches_handler() {
    let broker = MemoryBroker::new();
    let strategy = Arc::new(RecordingStrategy::default());
    let bus = connected_bus(&broker, strategy.clone()).await;
    let received = recorder();

    let sink = received.clone();
    bus.subscribe("billing", move |order: OrderPlaced| {
        sink.lock().unwrap().push(order.order_id);
        Ok(())
    })
    .await
    .unwrap();

    broker
        .inject(
            OrderPlaced::TYPE_NAME,
            OrderPlaced::TYPE_NAME,
            BasicProperties::new().with_type(OrderShipped::TYPE_NAME),
            serde_json::to_vec(&OrderShipped { order_id: 9 }).unwrap(),
        )
        .unwrap();

    eventually(|| strategy.failures() == vec!["message_type_mismatch"]).await;
    assert!(received.lock().unwrap().is_empty());
    bus.shutdown().await;
}

#[tokio::test]
async fn integration_subscriptions_are_rearmed_once_after_reconnect() {
    let broker = MemoryBroker::new();
    let bus = connected_bus(&broker, Arc::new(RecordingStrategy::default())).await;
    let placed = recorder();
    let shipped = recorder();

    let sink = placed.clone();
    bus.subscribe("billing", move |order: OrderPlaced| {
        sink.lock().unwrap().push(order.order_id);
        Ok(())
    })
    .await
    .unwrap();
    let sink = shipped.clone();
    bus.subscribe("billing", move |order: OrderShipped| {
        sink.lock().unwrap().push(order.order_id);
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(broker.exchange_declarations(OrderPlaced::TYPE_NAME), 1);

    let mut events = bus.events();
    broker.drop_connections();
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);

    assert_eq!(broker.consumer_count("Shop.OrderPlaced:Shop_billing"), 1);
    assert_eq!(broker.consumer_count("Shop.OrderShipped:Shop_billing"), 1);
    // The topology cache starts empty on the new connection.
    assert_eq!(broker.exchange_declarations(OrderPlaced::TYPE_NAME), 2);
    assert_eq!(broker.exchange_declarations(OrderShipped::TYPE_NAME), 2);

    bus.publish(&OrderPlaced { order_id: 5 }).await.unwrap();
    bus.publish(&OrderShipped { order_id: 6 }).await.unwrap();
    eventually(|| placed.lock().unwrap().len() == 1 && shipped.lock().unwrap().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*placed.lock().unwrap(), vec![5]);
    assert_eq!(*shipped.lock().unwrap(), vec![6]);
    bus.shutdown().await;
}

#[tokio::test]
async fn integration_request_response_round_trip() {
    let broker = MemoryBroker::new();
    let bus = connected_bus(&broker, Arc::new(RecordingStrategy::default())).await;

    bus.respond(|add: Add| Ok(Sum { value: add.a + add.b }))
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bus.request(&Add { a: 2, b: 40 }, move |sum: Sum| {
        tx.send(sum.value).map_err(|e| HandlerError::from(e.to_string()))
    })
    .await
    .unwrap();

    let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, 42);

    let request = broker.published_to(RPC_EXCHANGE);
    assert_eq!(request.len(), 1);
    assert_eq!(request[0].routing_key, Add::TYPE_NAME);
    let reply_to = request[0].properties.reply_to.clone().unwrap();
    assert!(reply_to.starts_with("warren_return_"));

    let response = broker.published_to("");
    assert_eq!(response.len(), 1);
    assert_eq!(response[0].routing_key, reply_to);
    assert_eq!(response[0].properties.message_type.as_deref(), Some(Sum::TYPE_NAME));
    assert_eq!(
        response[0].properties.correlation_id,
        request[0].properties.correlation_id
    );
    bus.shutdown().await;
}

fn sum_sink(
    tx: tokio::sync::mpsc::UnboundedSender<i64>,
) -> impl Fn(Sum) -> Result<(), HandlerError> + Send + Sync + 'static {
    move |sum: Sum| tx.send(sum.value).map_err(|e| HandlerError::from(e.to_string()))
}

fn reply_queues(broker: &MemoryBroker) -> Vec<String> {
    let mut queues: Vec<String> = broker
        .published_to(RPC_EXCHANGE)
        .into_iter()
        .filter_map(|request| request.properties.reply_to)
        .collect();
    queues.dedup();
    queues
}

#[tokio::test]
async fn integration_response_queue_is_reused_then_replaced_after_reconnect() {
    let broker = MemoryBroker::new();
    let bus = connected_bus(&broker, Arc::new(RecordingStrategy::default())).await;
    bus.respond(|add: Add| Ok(Sum { value: add.a + add.b }))
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for a in 1..=3 {
        bus.request(&Add { a, b: 10 }, sum_sink(tx.clone()))
            .await
            .unwrap();
    }
    let mut values = Vec::new();
    for _ in 0..3 {
        let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        values.push(value);
    }
    values.sort_unstable();
    assert_eq!(values, vec![11, 12, 13]);

    let before = reply_queues(&broker);
    assert_eq!(before.len(), 1, "one response queue per callback type");
    let old_queue = before[0].clone();

    let mut events = bus.events();
    broker.drop_connections();
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);
    assert!(!broker.queue_exists(&old_queue));
    assert_eq!(broker.consumer_count(Add::TYPE_NAME), 1);

    bus.request(&Add { a: 20, b: 22 }, sum_sink(tx.clone()))
        .await
        .unwrap();
    let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, 42);

    let after = reply_queues(&broker);
    assert_eq!(after.len(), 2);
    assert_eq!(after[0], old_queue);
    assert_ne!(after[1], old_queue);
    assert!(broker.queue_exists(&after[1]));
    bus.shutdown().await;
}

#[tokio::test]
async fn integration_failed_handler_is_retried_then_handed_to_fallback() {
    let broker = MemoryBroker::new();
    let fallback = Arc::new(RecordingStrategy::default());
    let factory: Arc<dyn ConnectionFactory> = Arc::new(broker.clone());
    let retry = Arc::new(RetryConsumerErrorStrategy::with_fallback(
        factory,
        fallback.clone(),
        RetryConfig {
            delay: Duration::from_millis(20),
            max_retries: 2,
        },
    ));
    let bus = connected_bus(&broker, retry).await;
    let attempts = recorder();

    let sink = attempts.clone();
    bus.subscribe("billing", move |order: OrderPlaced| {
        sink.lock().unwrap().push(order.order_id);
        Err(HandlerError::from("payment service unavailable"))
    })
    .await
    .unwrap();
    bus.publish(&OrderPlaced { order_id: 3 }).await.unwrap();

    eventually(|| fallback.failures() == vec!["handler"]).await;
    assert_eq!(*attempts.lock().unwrap(), vec![3, 3, 3]);

    let retry_counts: Vec<u32> = broker
        .published_to(OrderPlaced::TYPE_NAME)
        .iter()
        .map(|message| message.properties.retry_count())
        .collect();
    assert_eq!(retry_counts, vec![0, 1, 2]);
    bus.shutdown().await;
}

#[tokio::test]
async fn integration_schedule_publish_without_schedule_fails() {
    let broker = MemoryBroker::new();
    let bus = connected_bus(&broker, Arc::new(RecordingStrategy::default())).await;

    let err = bus
        .schedule_publish(|_| Ok(()), &OrderPlaced { order_id: 1 }, "nothing", None)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::SchedulingConfig { parameter: "at", .. }));
    assert!(broker.published().is_empty());
    bus.shutdown().await;
}

async fn bus_with_scheduler(broker: &MemoryBroker) -> (Bus, Arc<SchedulerWorker>) {
    let bus = connected_bus(broker, Arc::new(RecordingStrategy::default())).await;
    let config = SchedulerConfig::default();
    let worker = SchedulerWorker::for_bus(&bus, &config).unwrap();
    worker.start(&bus, &config.subscription_id).await.unwrap();
    (bus, worker)
}

#[tokio::test]
async fn integration_future_publish_is_delivered_by_the_worker() {
    let broker = MemoryBroker::new();
    let (bus, worker) = bus_with_scheduler(&broker).await;
    let received = recorder();

    let sink = received.clone();
    bus.subscribe("shipping", move |order: OrderPlaced| {
        sink.lock().unwrap().push(order.order_id);
        Ok(())
    })
    .await
    .unwrap();

    bus.future_publish(
        Utc::now() + chrono::Duration::milliseconds(200),
        &OrderPlaced { order_id: 77 },
    )
    .await
    .unwrap();
    assert!(received.lock().unwrap().is_empty());

    eventually(|| received.lock().unwrap().len() == 1).await;
    assert_eq!(*received.lock().unwrap(), vec![77]);
    worker.shutdown().await;
    bus.shutdown().await;
}

#[tokio::test]
async fn integration_cron_job_stops_after_unschedule() {
    let broker = MemoryBroker::new();
    let (bus, worker) = bus_with_scheduler(&broker).await;
    let received = recorder();

    let sink = received.clone();
    bus.subscribe("reports", move |order: OrderShipped| {
        sink.lock().unwrap().push(order.order_id);
        Ok(())
    })
    .await
    .unwrap();

    bus.schedule_publish(
        |schedule| schedule.with_cron("* * * * * *"),
        &OrderShipped { order_id: 1 },
        "every-second",
        Some("reports"),
    )
    .await
    .unwrap();
    let key = JobKey::new("every-second", Some("reports"));
    eventually(|| worker.jobs().is_scheduled(&key)).await;
    eventually(|| !received.lock().unwrap().is_empty()).await;

    bus.unschedule_published_message("every-second", Some("reports"))
        .await
        .unwrap();
    eventually(|| !worker.jobs().is_scheduled(&key)).await;
    let fired = received.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(received.lock().unwrap().len(), fired);

    // Unknown jobs are ignored.
    bus.unschedule_published_message("never-scheduled", None)
        .await
        .unwrap();
    worker.shutdown().await;
    bus.shutdown().await;
}

#[derive(Default)]
struct OrderLog {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl HandleMessage<OrderPlaced> for OrderLog {
    async fn handle(&self, message: OrderPlaced) -> Result<(), HandlerError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("placed {}", message.order_id));
        Ok(())
    }
}

#[async_trait]
impl HandleMessage<OrderShipped> for OrderLog {
    async fn handle(&self, message: OrderShipped) -> Result<(), HandlerError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("shipped {}", message.order_id));
        Ok(())
    }
}

#[tokio::test]
async fn integration_handler_object_registered_per_type() {
    let broker = MemoryBroker::new();
    let bus = connected_bus(&broker, Arc::new(RecordingStrategy::default())).await;
    let log = Arc::new(OrderLog::default());

    bus.subscribe_handler::<OrderPlaced, _>("audit", log.clone())
        .await
        .unwrap();
    bus.subscribe_handler::<OrderShipped, _>("audit", log.clone())
        .await
        .unwrap();

    bus.publish(&OrderPlaced { order_id: 4 }).await.unwrap();
    eventually(|| log.events.lock().unwrap().len() == 1).await;
    bus.publish(&OrderShipped { order_id: 4 }).await.unwrap();
    eventually(|| log.events.lock().unwrap().len() == 2).await;

    assert_eq!(
        *log.events.lock().unwrap(),
        vec!["placed 4".to_string(), "shipped 4".to_string()]
    );
    bus.shutdown().await;
}
