//! Body encoding.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::message::Message;
use crate::utils::error::SerializationError;

/// Turns messages into body bytes and back.
///
/// Scheduling wire records go through the same serializer as ordinary
/// messages, so a publisher and a scheduler worker must agree on it.
pub trait Serializer: Send + Sync + 'static {
    fn message_to_bytes<T: Message + Serialize>(
        &self,
        message: &T,
    ) -> Result<Vec<u8>, SerializationError>;

    fn bytes_to_message<T: Message + DeserializeOwned>(
        &self,
        bytes: &[u8],
    ) -> Result<T, SerializationError>;
}

/// JSON bodies via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn message_to_bytes<T: Message + Serialize>(
        &self,
        message: &T,
    ) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(message).map_err(|e| SerializationError {
            operation: "serialize",
            type_name: T::TYPE_NAME.to_string(),
            reason: e.to_string(),
        })
    }

    fn bytes_to_message<T: Message + DeserializeOwned>(
        &self,
        bytes: &[u8],
    ) -> Result<T, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError {
            operation: "deserialize",
            type_name: T::TYPE_NAME.to_string(),
            reason: e.to_string(),
        })
    }
}
