//! # Warren
//!
//! `warren` is a typed messaging bus for AMQP-style brokers. Applications
//! publish and subscribe by message type, run request/response flows and
//! schedule messages for later, while the bus keeps its broker connection
//! alive and re-arms every subscription after a reconnect.
//!
//! ## Core Modules
//!
//! - `bus`: the [`Bus`] façade applications hold.
//! - `connection`: the persistent connection and its reconnect loop.
//! - `topology`: declare-once caching and the ordered subscription registry.
//! - `consumer`: consumer tasks and error strategies (including delayed retry).
//! - `scheduling`: the schedule builder and scheduling system messages.
//! - `scheduler`: the worker that fires scheduled messages.
//! - `protocol`: the broker client traits the bus is written against.
//! - `broker`: an in-process broker implementing those traits.
//! - `config`: file and environment configuration.
//! - `utils`: error types and logging setup.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use serde::{Deserialize, Serialize};
//! use warren::{Bus, MemoryBroker, Message};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: u64,
//! }
//!
//! impl Message for OrderPlaced {
//!     const TYPE_NAME: &'static str = "Shop.Messages.OrderPlaced:Shop";
//! }
//!
//! # async fn run() -> Result<(), warren::BusError> {
//! let bus = Bus::builder(MemoryBroker::new()).build();
//! bus.ensure_connected(Duration::from_secs(5)).await?;
//! bus.subscribe("billing", |order: OrderPlaced| {
//!     println!("order {} placed", order.order_id);
//!     Ok(())
//! })
//! .await?;
//! bus.publish(&OrderPlaced { order_id: 42 }).await?;
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod bus;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod conventions;
pub mod message;
pub mod protocol;
pub mod scheduler;
pub mod scheduling;
pub mod serializer;
pub mod topology;
pub mod utils;

pub use broker::{MemoryBroker, MemoryConnector};
pub use bus::{Bus, BusBuilder, BusConfig, RawPublisher};
pub use connection::{ConnectionEvent, ConnectionState, PersistentConnection, ReconnectPolicy};
pub use consumer::{ConsumerErrorStrategy, NoOpConsumerErrorStrategy, RetryConfig, RetryConsumerErrorStrategy};
pub use conventions::Conventions;
pub use message::{HandleMessage, Message};
pub use scheduler::{SchedulerConfig, SchedulerWorker};
pub use scheduling::ScheduleBuilder;
pub use serializer::{JsonSerializer, Serializer};
pub use utils::error::{BusError, HandlerError, Result};

#[cfg(test)]
mod tests;
