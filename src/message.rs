//! Message typing.
//!
//! Every type sent over the bus implements [`Message`] and declares its wire
//! type identifier at compile time. The identifier is written into the
//! envelope's `Type` property on publish and checked on delivery.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A type that can travel over the bus.
///
/// # Example
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use warren::Message;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct OrderPlaced {
///     order_id: u64,
/// }
///
/// impl Message for OrderPlaced {
///     const TYPE_NAME: &'static str = "Shop.Messages.OrderPlaced:Shop";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Wire type identifier. Must be unique per message type and stable across
    /// releases: queue and exchange names are derived from it.
    const TYPE_NAME: &'static str;
}

/// Explicit handler registration, see [`crate::Bus::subscribe_handler`].
///
/// A handler object may implement this trait for several message types and be
/// registered once per type.
#[async_trait::async_trait]
pub trait HandleMessage<T: Message>: Send + Sync + 'static {
    async fn handle(&self, message: T) -> Result<(), crate::HandlerError>;
}
