use tracing::error;

use super::ConsumerErrorStrategy;
use crate::protocol::Delivery;
use crate::utils::error::BusError;

/// Logs the failed delivery and drops it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpConsumerErrorStrategy;

impl ConsumerErrorStrategy for NoOpConsumerErrorStrategy {
    fn handle_consumer_error(&self, delivery: Delivery, error: BusError) {
        error!(
            consumer_tag = %delivery.consumer_tag,
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            kind = error.as_label(),
            error = %error,
            "no further handling for failed message"
        );
    }
}
