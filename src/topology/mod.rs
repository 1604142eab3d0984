//! Topology bookkeeping.
//!
//! - [`TopologyCache`]: exchanges and request/response structures already
//!   declared on the current connection.
//! - [`SubscriptionRegistry`]: the ordered list of subscriptions the bus
//!   re-establishes after every reconnect.

pub mod cache;
pub mod registry;

pub use cache::{RPC_EXCHANGE, TopologyCache};
pub use registry::{SubscriptionAction, SubscriptionRegistry};

#[cfg(test)]
mod tests;
