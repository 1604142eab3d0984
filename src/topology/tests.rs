use super::{RPC_EXCHANGE, SubscriptionAction, SubscriptionRegistry, TopologyCache};
use crate::broker::MemoryBroker;
use crate::protocol::{Channel, Connection, ConnectionFactory};
use crate::utils::error::BusError;
use futures::FutureExt;
use std::sync::{Arc, Mutex};

async fn open_channel(broker: &MemoryBroker) -> (Arc<dyn Connection>, Box<dyn Channel>) {
    let conn = broker.create_connection().await.unwrap();
    let channel = conn.create_channel().await.unwrap();
    (conn, channel)
}

fn recording_action(log: Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> SubscriptionAction {
    Arc::new(move || {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(label);
            Ok(())
        }
        .boxed()
    })
}

#[tokio::test]
async fn test_exchange_is_declared_once_per_epoch() {
    let broker = MemoryBroker::new();
    let (_conn, mut channel) = open_channel(&broker).await;
    let cache = TopologyCache::new();

    cache.declare_exchange_once(&mut *channel, "orders").await.unwrap();
    cache.declare_exchange_once(&mut *channel, "orders").await.unwrap();
    assert_eq!(broker.exchange_declarations("orders"), 1);
    assert!(cache.contains_exchange("orders").await);

    cache.clear().await;
    assert!(cache.is_empty().await);
    cache.declare_exchange_once(&mut *channel, "orders").await.unwrap();
    assert_eq!(broker.exchange_declarations("orders"), 2);
}

#[tokio::test]
async fn test_default_exchange_is_never_declared() {
    let broker = MemoryBroker::new();
    let (_conn, mut channel) = open_channel(&broker).await;
    let cache = TopologyCache::new();
    cache.declare_exchange_once(&mut *channel, "").await.unwrap();
    assert!(cache.is_empty().await);
    assert_eq!(broker.exchange_declarations(""), 0);
}

#[tokio::test]
async fn test_failed_declaration_is_not_recorded() {
    let broker = MemoryBroker::new();
    let (_conn, mut channel) = open_channel(&broker).await;
    channel.close().await.unwrap();
    let cache = TopologyCache::new();
    assert!(cache.declare_exchange_once(&mut *channel, "x").await.is_err());
    assert!(!cache.contains_exchange("x").await);
}

#[tokio::test]
async fn test_rpc_structure_binds_request_queue() {
    let broker = MemoryBroker::new();
    let (_conn, mut channel) = open_channel(&broker).await;
    let cache = TopologyCache::new();
    cache.declare_rpc_once(&mut *channel, "Req").await.unwrap();
    cache.declare_rpc_once(&mut *channel, "Req").await.unwrap();

    assert!(broker.queue_exists("Req"));
    assert_eq!(broker.exchange_declarations(RPC_EXCHANGE), 1);
    assert_eq!(
        broker.bindings(RPC_EXCHANGE),
        vec![("Req".to_string(), "Req".to_string())]
    );
}

#[tokio::test]
async fn test_register_runs_immediately_and_replays_in_order() {
    let registry = SubscriptionRegistry::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    registry.register(recording_action(log.clone(), "first")).await;
    registry.register(recording_action(log.clone(), "second")).await;
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);

    log.lock().unwrap().clear();
    registry.replay().await;
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(registry.len().await, 2);
}

#[tokio::test]
async fn test_failing_action_is_kept_and_does_not_stop_replay() {
    let registry = SubscriptionRegistry::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let failing: SubscriptionAction =
        Arc::new(|| async { Err(BusError::NotConnected) }.boxed());
    registry.register(failing).await;
    registry.register(recording_action(log.clone(), "after")).await;

    log.lock().unwrap().clear();
    registry.replay().await;
    assert_eq!(*log.lock().unwrap(), vec!["after"]);
    assert_eq!(registry.len().await, 2);
}
