use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use uuid::Uuid;

use super::pool::ChannelPool;
use super::rpc::ResponseSlots;
use super::{Bus, BusConfig, BusInner, CorrelationIdFn};
use crate::connection::PersistentConnection;
use crate::consumer::{
    ConsumerErrorStrategy, ConsumerFactory, NoOpConsumerErrorStrategy, QueueingConsumerFactory,
};
use crate::conventions::Conventions;
use crate::protocol::ConnectionFactory;
use crate::serializer::{JsonSerializer, Serializer};
use crate::topology::{SubscriptionRegistry, TopologyCache};

/// Assembles a [`Bus`].
///
/// ```rust,no_run
/// use warren::{Bus, BusConfig, MemoryBroker};
///
/// # async fn run() {
/// let bus = Bus::builder(MemoryBroker::new())
///     .config(BusConfig::default())
///     .build();
/// # }
/// ```
pub struct BusBuilder<S: Serializer = JsonSerializer> {
    factory: Arc<dyn ConnectionFactory>,
    serializer: S,
    conventions: Conventions,
    config: BusConfig,
    error_strategy: Option<Arc<dyn ConsumerErrorStrategy>>,
    consumer_factory: Option<Arc<dyn ConsumerFactory>>,
    correlation_id: Option<CorrelationIdFn>,
}

impl BusBuilder<JsonSerializer> {
    pub fn new<F: ConnectionFactory + 'static>(factory: F) -> Self {
        Self::from_shared(Arc::new(factory))
    }

    /// Same as [`BusBuilder::new`] for a factory that is already shared, for
    /// instance with a retry strategy.
    pub fn from_shared(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            serializer: JsonSerializer,
            conventions: Conventions::default(),
            config: BusConfig::default(),
            error_strategy: None,
            consumer_factory: None,
            correlation_id: None,
        }
    }
}

impl<S: Serializer> BusBuilder<S> {
    pub fn serializer<S2: Serializer>(self, serializer: S2) -> BusBuilder<S2> {
        BusBuilder {
            factory: self.factory,
            serializer,
            conventions: self.conventions,
            config: self.config,
            error_strategy: self.error_strategy,
            consumer_factory: self.consumer_factory,
            correlation_id: self.correlation_id,
        }
    }

    pub fn conventions(mut self, conventions: Conventions) -> Self {
        self.conventions = conventions;
        self
    }

    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Strategy for failed handlers. Ignored when a consumer factory is
    /// supplied. Defaults to [`NoOpConsumerErrorStrategy`].
    pub fn error_strategy(mut self, strategy: Arc<dyn ConsumerErrorStrategy>) -> Self {
        self.error_strategy = Some(strategy);
        self
    }

    pub fn consumer_factory(mut self, factory: Arc<dyn ConsumerFactory>) -> Self {
        self.consumer_factory = Some(factory);
        self
    }

    /// Generator for the correlation id stamped on every publish. Defaults
    /// to a random UUID.
    pub fn correlation_id(mut self, f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.correlation_id = Some(Arc::new(f));
        self
    }

    /// Builds the bus and starts connecting in the background. Must be
    /// called from within a tokio runtime.
    pub fn build(self) -> Bus<S> {
        let consumers = self.consumer_factory.unwrap_or_else(|| {
            let strategy = self
                .error_strategy
                .unwrap_or_else(|| Arc::new(NoOpConsumerErrorStrategy));
            Arc::new(QueueingConsumerFactory::new(strategy))
        });
        let correlation_id = self
            .correlation_id
            .unwrap_or_else(|| Arc::new(|| Uuid::new_v4().to_string()));

        Bus::start(BusInner {
            connection: PersistentConnection::new(self.factory, self.config.reconnect),
            serializer: self.serializer,
            conventions: self.conventions,
            config: self.config,
            topology: TopologyCache::new(),
            subscriptions: SubscriptionRegistry::new(),
            responses: ResponseSlots::new(),
            pool: ChannelPool::new(),
            consumers,
            correlation_id,
            closed: AtomicBool::new(false),
        })
    }
}
