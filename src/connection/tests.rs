use super::{ConnectionEvent, ConnectionListener, ConnectionState, PersistentConnection};
use crate::broker::MemoryBroker;
use crate::connection::backoff::ReconnectPolicy;
use crate::utils::error::BusError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Recorder {
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ConnectionListener for Recorder {
    async fn on_connected(&self) {
        self.log.lock().unwrap().push(format!("{}:up", self.label));
    }

    async fn on_disconnected(&self) {
        self.log.lock().unwrap().push(format!("{}:down", self.label));
    }
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy::fixed(Duration::from_millis(10))
}

#[tokio::test]
async fn test_create_channel_before_connect_is_not_connected() {
    let broker = MemoryBroker::new();
    let connection = PersistentConnection::new(Arc::new(broker), fast_policy());
    let err = connection.create_channel().await.err().unwrap();
    assert!(matches!(err, BusError::NotConnected));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_ensure_connected_and_open_channel() {
    let broker = MemoryBroker::new();
    let connection = PersistentConnection::new(Arc::new(broker.clone()), fast_policy());
    connection.start();
    connection
        .ensure_connected(Duration::from_secs(2))
        .await
        .unwrap();
    assert!(connection.is_connected());
    assert_eq!(connection.epoch(), 1);

    let channel = connection.create_channel().await.unwrap();
    assert!(channel.is_open());
    assert_eq!(broker.open_connections(), 1);

    connection.shutdown().await;
}

#[tokio::test]
async fn test_ensure_connected_times_out_when_unreachable() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let connection = PersistentConnection::new(Arc::new(broker.clone()), fast_policy());
    connection.start();

    let err = connection
        .ensure_connected(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Connectivity(_)));

    broker.set_reachable(true);
    connection
        .ensure_connected(Duration::from_secs(2))
        .await
        .unwrap();
    connection.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_after_broker_drop_and_notifies_in_order() {
    let broker = MemoryBroker::new();
    let connection = PersistentConnection::new(Arc::new(broker.clone()), fast_policy());
    let log = Arc::new(Mutex::new(Vec::new()));
    connection.add_listener(Arc::new(Recorder {
        label: "a",
        log: log.clone(),
    }));
    connection.add_listener(Arc::new(Recorder {
        label: "b",
        log: log.clone(),
    }));
    let mut events = connection.events();

    connection.start();
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);

    assert_eq!(broker.drop_connections(), 1);
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);
    assert_eq!(connection.epoch(), 2);
    assert_eq!(broker.open_connections(), 1);

    assert_eq!(
        *log.lock().unwrap(),
        vec!["a:up", "b:up", "a:down", "b:down", "a:up", "b:up"]
    );
    connection.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_transport_and_rejects_waiters() {
    let broker = MemoryBroker::new();
    let connection = PersistentConnection::new(Arc::new(broker.clone()), fast_policy());
    connection.start();
    connection
        .ensure_connected(Duration::from_secs(2))
        .await
        .unwrap();

    connection.shutdown().await;
    assert_eq!(broker.open_connections(), 0);
    assert!(!connection.is_connected());
    let err = connection
        .ensure_connected(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Shutdown));

    connection.start();
    assert!(!connection.is_connected());
}

fn assert_send<T: Send>(_: &T) {}

#[tokio::test]
async fn test_supervisor_runs_on_spawned_task_and_stops_on_shutdown() {
    let broker = MemoryBroker::new();
    let connection = PersistentConnection::new(Arc::new(broker.clone()), fast_policy());

    let supervisor = connection.clone().run();
    assert_send(&supervisor);
    let handle = tokio::spawn(supervisor);

    connection
        .ensure_connected(Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(broker.open_connections(), 1);

    connection.shutdown.send_replace(true);
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}
