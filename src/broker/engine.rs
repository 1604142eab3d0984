//! Broker engine
//!
//! This module contains the in-memory broker state responsible for:
//! - holding exchanges, queues and bindings
//! - routing published messages into queues
//! - delivering queued messages to consumers, round-robin, within each
//!   consumer's prefetch window
//! - tracking unacknowledged deliveries per channel and requeueing them when
//!   the channel goes away
//! - checking logins against its users and virtual hosts
//!
//! Concurrency and usage notes:
//! - The state is synchronous and held behind a `std::sync::Mutex` by
//!   [`MemoryBroker`]. No lock is held across an `.await`.
//! - Deliveries are pushed into unbounded per-consumer channels; the prefetch
//!   window is what bounds them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::mpsc;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::broker::message::{PublishedMessage, QueuedMessage};
use crate::broker::queue::{ChannelId, ConnectionId, Exchange, Queue};
use crate::protocol::{BasicProperties, Delivery, ExchangeKind, ProtocolError, QueueOptions};

struct ConnectionEntry {
    closed: watch::Sender<bool>,
    channels: HashSet<ChannelId>,
}

struct ChannelEntry {
    connection: ConnectionId,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<String>,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: QueuedMessage,
}

struct ConsumerEntry {
    queue: String,
    channel: ChannelId,
    sender: mpsc::UnboundedSender<Delivery>,
    in_flight: usize,
    prefetch: u16,
}

impl ConsumerEntry {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

/// Everything the in-memory broker knows.
pub struct BrokerState {
    reachable: bool,
    /// Password by username.
    users: HashMap<String, String>,
    virtual_hosts: HashSet<String>,
    next_id: u64,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    channels: HashMap<ChannelId, ChannelEntry>,
    consumers: HashMap<String, ConsumerEntry>,
    published: Vec<PublishedMessage>,
    declarations: HashMap<String, usize>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            users: HashMap::from([("guest".to_string(), "guest".to_string())]),
            virtual_hosts: HashSet::from(["/".to_string()]),
            next_id: 0,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            consumers: HashMap::new(),
            published: Vec::new(),
            declarations: HashMap::new(),
        }
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_reachable(&self) -> Result<(), ProtocolError> {
        if !self.reachable {
            return Err(ProtocolError::Unreachable(
                "in-memory broker is not accepting connections".to_string(),
            ));
        }
        Ok(())
    }

    /// Opens a connection after checking the credentials and the virtual
    /// host.
    pub(crate) fn login(
        &mut self,
        virtual_host: &str,
        username: &str,
        password: &str,
    ) -> Result<(ConnectionId, watch::Receiver<bool>), ProtocolError> {
        self.check_reachable()?;
        if self.users.get(username).is_none_or(|expected| expected != password) {
            return Err(ProtocolError::AccessRefused(format!(
                "login refused for user '{username}'"
            )));
        }
        if !self.virtual_hosts.contains(virtual_host) {
            return Err(ProtocolError::NotFound(format!(
                "virtual host '{virtual_host}'"
            )));
        }
        self.open_connection()
    }

    pub(crate) fn open_connection(
        &mut self,
    ) -> Result<(ConnectionId, watch::Receiver<bool>), ProtocolError> {
        self.check_reachable()?;
        let id = self.next_id();
        let (closed, rx) = watch::channel(false);
        self.connections.insert(
            id,
            ConnectionEntry {
                closed,
                channels: HashSet::new(),
            },
        );
        debug!(connection = id, "connection opened");
        Ok((id, rx))
    }

    pub(crate) fn close_connection(&mut self, id: ConnectionId) {
        let Some(entry) = self.connections.remove(&id) else {
            return;
        };
        for channel in &entry.channels {
            self.close_channel(*channel);
        }
        let owned: Vec<String> = self
            .queues
            .values()
            .filter(|q| q.owner == Some(id))
            .map(|q| q.name.clone())
            .collect();
        for queue in owned {
            self.delete_queue(&queue);
        }
        let _ = entry.closed.send(true);
        debug!(connection = id, "connection closed");
    }

    pub(crate) fn open_channel(&mut self, connection: ConnectionId) -> Result<ChannelId, ProtocolError> {
        if !self.connections.contains_key(&connection) {
            return Err(ProtocolError::ConnectionClosed);
        }
        let id = self.next_id();
        self.channels.insert(
            id,
            ChannelEntry {
                connection,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::new(),
                consumers: Vec::new(),
            },
        );
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.channels.insert(id);
        }
        Ok(id)
    }

    pub(crate) fn is_channel_open(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    /// Closes a channel: its consumers are cancelled and its unacknowledged
    /// deliveries go back to the front of their queues, marked redelivered.
    pub(crate) fn close_channel(&mut self, id: ChannelId) {
        let Some(entry) = self.channels.remove(&id) else {
            return;
        };
        if let Some(conn) = self.connections.get_mut(&entry.connection) {
            conn.channels.remove(&id);
        }

        let mut lost_consumers = HashSet::new();
        for tag in &entry.consumers {
            if let Some(consumer) = self.consumers.remove(tag) {
                if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                    queue.remove_consumer(tag);
                }
                lost_consumers.insert(consumer.queue);
            }
        }

        let mut unacked: Vec<(u64, Unacked)> = entry.unacked.into_iter().collect();
        unacked.sort_by(|a, b| b.0.cmp(&a.0));
        let mut touched: HashSet<String> = HashSet::new();
        for (_, pending) in unacked {
            if let Some(queue) = self.queues.get_mut(&pending.queue) {
                let mut message = pending.message;
                message.redelivered = true;
                queue.messages.push_front(message);
                touched.insert(pending.queue);
            }
        }

        for queue in &lost_consumers {
            let drop_it = self
                .queues
                .get(queue)
                .is_some_and(|q| q.options.auto_delete && q.consumers.is_empty());
            if drop_it {
                self.delete_queue(queue);
            }
        }
        for queue in lost_consumers.union(&touched) {
            self.dispatch(queue);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        let Some(queue) = self.queues.remove(name) else {
            return;
        };
        for tag in &queue.consumers {
            if let Some(consumer) = self.consumers.remove(tag) {
                if let Some(channel) = self.channels.get_mut(&consumer.channel) {
                    channel.consumers.retain(|c| c != tag);
                }
            }
        }
        for channel in self.channels.values_mut() {
            channel.unacked.retain(|_, u| u.queue != name);
        }
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != name);
        }
        debug!(queue = name, "queue deleted");
    }

    fn channel_connection(&self, channel: ChannelId) -> Result<ConnectionId, ProtocolError> {
        self.channels
            .get(&channel)
            .map(|c| c.connection)
            .ok_or(ProtocolError::ChannelClosed)
    }

    pub(crate) fn declare_exchange(
        &mut self,
        channel: ChannelId,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), ProtocolError> {
        self.channel_connection(channel)?;
        if name.is_empty() {
            return Err(ProtocolError::AccessRefused(
                "the default exchange cannot be declared".to_string(),
            ));
        }
        *self.declarations.entry(name.to_string()).or_insert(0) += 1;
        match self.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(ProtocolError::PreconditionFailed(
                format!("exchange '{name}' exists with a different type"),
            )),
            Some(_) => Ok(()),
            None => {
                self.exchanges
                    .insert(name.to_string(), Exchange::new(name, kind, durable));
                Ok(())
            }
        }
    }

    pub(crate) fn declare_queue(
        &mut self,
        channel: ChannelId,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, ProtocolError> {
        let connection = self.channel_connection(channel)?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };
        if let Some(existing) = self.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != connection) {
                return Err(ProtocolError::AccessRefused(format!(
                    "queue '{name}' is exclusive to another connection"
                )));
            }
            return Ok(name);
        }
        self.queues
            .insert(name.clone(), Queue::new(&name, options, connection));
        Ok(name)
    }

    pub(crate) fn bind_queue(
        &mut self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ProtocolError> {
        self.channel_connection(channel)?;
        if !self.queues.contains_key(queue) {
            return Err(ProtocolError::NotFound(format!("queue '{queue}'")));
        }
        let exchange = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| ProtocolError::NotFound(format!("exchange '{exchange}'")))?;
        exchange.bind(queue, routing_key);
        Ok(())
    }

    pub(crate) fn set_prefetch(&mut self, channel: ChannelId, prefetch: u16) -> Result<(), ProtocolError> {
        let entry = self
            .channels
            .get_mut(&channel)
            .ok_or(ProtocolError::ChannelClosed)?;
        entry.prefetch = prefetch;
        Ok(())
    }

    /// Routes a message. The default exchange (`""`) routes straight to the
    /// queue named by the routing key.
    pub(crate) fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let targets = if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            self.exchanges
                .get(exchange)
                .ok_or_else(|| ProtocolError::NotFound(format!("exchange '{exchange}'")))?
                .route(routing_key)
        };

        self.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            body: body.clone(),
        });

        if targets.is_empty() {
            debug!(exchange, routing_key, "message was not routed to any queue");
            return Ok(());
        }

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.messages.push_back(QueuedMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    properties: properties.clone(),
                    body: body.clone(),
                    redelivered: false,
                });
            }
            self.dispatch(&target);
        }
        Ok(())
    }

    pub(crate) fn consume(
        &mut self,
        channel: ChannelId,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, ProtocolError> {
        let connection = self.channel_connection(channel)?;
        let target = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| ProtocolError::NotFound(format!("queue '{queue}'")))?;
        if target.owner.is_some_and(|owner| owner != connection) {
            return Err(ProtocolError::AccessRefused(format!(
                "queue '{queue}' is exclusive to another connection"
            )));
        }
        if self.consumers.contains_key(consumer_tag) {
            return Err(ProtocolError::PreconditionFailed(format!(
                "consumer tag '{consumer_tag}' already in use"
            )));
        }
        target.add_consumer(consumer_tag);

        let (sender, receiver) = mpsc::unbounded();
        let prefetch = self.channels.get(&channel).map_or(0, |c| c.prefetch);
        self.consumers.insert(
            consumer_tag.to_string(),
            ConsumerEntry {
                queue: queue.to_string(),
                channel,
                sender,
                in_flight: 0,
                prefetch,
            },
        );
        if let Some(entry) = self.channels.get_mut(&channel) {
            entry.consumers.push(consumer_tag.to_string());
        }
        self.dispatch(queue);
        Ok(receiver)
    }

    pub(crate) fn settle(
        &mut self,
        channel: ChannelId,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), ProtocolError> {
        let entry = self
            .channels
            .get_mut(&channel)
            .ok_or(ProtocolError::ChannelClosed)?;
        let pending = entry.unacked.remove(&delivery_tag).ok_or_else(|| {
            ProtocolError::PreconditionFailed(format!("unknown delivery tag {delivery_tag}"))
        })?;
        if let Some(consumer) = self.consumers.get_mut(&pending.consumer_tag) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        if requeue {
            if let Some(queue) = self.queues.get_mut(&pending.queue) {
                let mut message = pending.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
        self.dispatch(&pending.queue);
        Ok(())
    }

    fn remove_consumer(&mut self, tag: &str) {
        if let Some(consumer) = self.consumers.remove(tag) {
            if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                queue.remove_consumer(tag);
            }
            if let Some(channel) = self.channels.get_mut(&consumer.channel) {
                channel.consumers.retain(|c| c != tag);
            }
        }
    }

    /// Hands queued messages to consumers with room in their prefetch window.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get(queue_name) else {
                return;
            };
            if queue.messages.is_empty() {
                return;
            }
            let chosen = queue
                .rotation()
                .into_iter()
                .find(|tag| self.consumers.get(tag).is_some_and(ConsumerEntry::has_capacity));
            let Some(tag) = chosen else {
                return;
            };

            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            queue.advance_past(&tag);

            let Some(consumer) = self.consumers.get_mut(&tag) else {
                queue.messages.push_front(message);
                return;
            };
            let Some(channel) = self.channels.get_mut(&consumer.channel) else {
                queue.messages.push_front(message);
                self.remove_consumer(&tag);
                continue;
            };

            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            let delivery = Delivery {
                consumer_tag: tag.clone(),
                delivery_tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if consumer.sender.unbounded_send(delivery).is_err() {
                queue.messages.push_front(message);
                self.remove_consumer(&tag);
                continue;
            }
            consumer.in_flight += 1;
            channel.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    consumer_tag: tag,
                    message,
                },
            );
        }
    }
}

/// Handle to an in-process broker. Cloning shares the same broker.
///
/// Implements [`crate::protocol::ConnectionFactory`], so it can be handed to
/// [`crate::BusBuilder`] directly; [`MemoryBroker::connector`] gives a factory
/// that logs in with a [`crate::config::ConnectionConfiguration`] instead.
/// The inspection methods exist for tests and demos.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// When unreachable, new connection attempts fail. Existing connections
    /// are left alone.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Adds or updates a user. The broker starts with `guest`/`guest`.
    pub fn add_user(&self, username: impl Into<String>, password: impl Into<String>) {
        self.lock().users.insert(username.into(), password.into());
    }

    /// The broker starts with the `/` virtual host.
    pub fn add_virtual_host(&self, name: impl Into<String>) {
        self.lock().virtual_hosts.insert(name.into());
    }

    /// Closes every open connection from the broker side, as a broker restart
    /// or network partition would. Returns how many were closed.
    pub fn drop_connections(&self) -> usize {
        let mut state = self.lock();
        let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
        for id in &ids {
            state.close_connection(*id);
        }
        ids.len()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.exchange == exchange)
            .cloned()
            .collect()
    }

    /// How many times `exchange` has been declared, across all connections.
    pub fn exchange_declarations(&self, exchange: &str) -> usize {
        self.lock().declarations.get(exchange).copied().unwrap_or(0)
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Messages waiting in `queue`, not counting unacknowledged deliveries.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Names of queues bound to `exchange`, in binding order.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    /// Publishes from outside any connection, like another process would.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        self.lock().publish(exchange, routing_key, properties, body)
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("state", &"in-memory")
            .finish()
    }
}
