use crate::protocol::BasicProperties;

/// A message waiting in a queue, or delivered and not yet settled.
///
/// `redelivered` is set when the message comes back to the queue after a
/// nack with requeue or after its consumer's channel closed.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// One entry of the broker's publish log.
///
/// Every `basic_publish` the broker accepts is recorded, routed or not, so
/// callers can inspect exactly what went over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}
