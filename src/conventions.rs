//! Naming conventions: how a message type id maps onto broker names.

use std::fmt;
use std::sync::Arc;

type NameFn = Arc<dyn Fn(&str) -> String + Send + Sync>;
type QueueNameFn = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Maps a message type id to exchange, topic and queue names.
///
/// The defaults use the type id for both exchange and routing key, and
/// `"{type id}_{subscription id}"` for subscriber queues, so a restarted
/// subscriber consumes the same durable queue again.
#[derive(Clone)]
pub struct Conventions {
    exchange: NameFn,
    topic: NameFn,
    queue: QueueNameFn,
}

impl Conventions {
    pub fn with_exchange_naming(
        mut self,
        f: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.exchange = Arc::new(f);
        self
    }

    pub fn with_topic_naming(mut self, f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.topic = Arc::new(f);
        self
    }

    pub fn with_queue_naming(
        mut self,
        f: impl Fn(&str, &str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.queue = Arc::new(f);
        self
    }

    pub fn exchange_name(&self, type_name: &str) -> String {
        (self.exchange)(type_name)
    }

    pub fn topic_name(&self, type_name: &str) -> String {
        (self.topic)(type_name)
    }

    pub fn queue_name(&self, type_name: &str, subscription_id: &str) -> String {
        (self.queue)(type_name, subscription_id)
    }
}

impl Default for Conventions {
    fn default() -> Self {
        Self {
            exchange: Arc::new(|type_name| type_name.to_string()),
            topic: Arc::new(|type_name| type_name.to_string()),
            queue: Arc::new(|type_name, subscription_id| format!("{type_name}_{subscription_id}")),
        }
    }
}

impl fmt::Debug for Conventions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conventions").finish_non_exhaustive()
    }
}
