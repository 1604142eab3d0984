//! In-process broker.
//!
//! An implementation of the [`crate::protocol`] traits that keeps exchanges,
//! queues and bindings in memory. It is what the test-suite and the demo
//! binary run the bus against, and it can simulate broker-side connection
//! loss with [`MemoryBroker::drop_connections`].

pub mod connection;
pub mod engine;
pub mod message;
pub mod queue;

pub use connection::{MemoryChannel, MemoryConnection, MemoryConnector};
pub use engine::MemoryBroker;
pub use message::PublishedMessage;
