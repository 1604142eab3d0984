use std::collections::VecDeque;

use crate::broker::message::QueuedMessage;
use crate::protocol::{ExchangeKind, QueueOptions};

pub type ConnectionId = u64;
pub type ChannelId = u64;

/// A queue held by the in-memory broker.
///
/// Messages are kept in FIFO order. Consumers are served round-robin; the
/// cursor survives consumers coming and going.
#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub options: QueueOptions,
    /// The declaring connection, for exclusive queues.
    pub owner: Option<ConnectionId>,
    pub messages: VecDeque<QueuedMessage>,
    pub consumers: Vec<String>,
    next_consumer: usize,
}

impl Queue {
    pub fn new(name: &str, options: QueueOptions, owner: ConnectionId) -> Self {
        Self {
            name: name.to_string(),
            options,
            owner: options.exclusive.then_some(owner),
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    pub fn add_consumer(&mut self, tag: &str) {
        self.consumers.push(tag.to_string());
    }

    pub fn remove_consumer(&mut self, tag: &str) {
        self.consumers.retain(|c| c != tag);
    }

    /// Consumer tags in the order they should be offered the next message.
    pub fn rotation(&self) -> Vec<String> {
        if self.consumers.is_empty() {
            return Vec::new();
        }
        let start = self.next_consumer % self.consumers.len();
        self.consumers[start..]
            .iter()
            .chain(self.consumers[..start].iter())
            .cloned()
            .collect()
    }

    /// Moves the round-robin cursor past `tag`.
    pub fn advance_past(&mut self, tag: &str) {
        if let Some(pos) = self.consumers.iter().position(|c| c == tag) {
            self.next_consumer = pos + 1;
        }
    }
}

/// An exchange and its bindings.
#[derive(Debug)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    /// `(queue, binding key)` pairs.
    pub bindings: Vec<(String, String)>,
}

impl Exchange {
    pub fn new(name: &str, kind: ExchangeKind, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            durable,
            bindings: Vec::new(),
        }
    }

    /// Binding the same queue with the same key twice has no effect.
    pub fn bind(&mut self, queue: &str, routing_key: &str) {
        let exists = self
            .bindings
            .iter()
            .any(|(q, k)| q == queue && k == routing_key);
        if !exists {
            self.bindings
                .push((queue.to_string(), routing_key.to_string()));
        }
    }

    /// Queues a message published with `routing_key` should land in.
    pub fn route(&self, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &self.bindings {
            let matches = match self.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Fanout => true,
            };
            if matches && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        targets
    }
}
