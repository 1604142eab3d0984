use std::collections::HashMap;

/// Header carrying the number of times a delivery has been retried.
pub const RETRY_COUNT_HEADER: &str = "RetryCount";

/// A value in the message header table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

/// Envelope properties sent along with every message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicProperties {
    /// Logical type identifier of the body.
    pub message_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
    pub headers: HashMap<String, HeaderValue>,
}

impl BasicProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Reads the `RetryCount` header. A missing, negative or non-integer
    /// header counts as zero; values past `u32::MAX` saturate.
    pub fn retry_count(&self) -> u32 {
        match self.headers.get(RETRY_COUNT_HEADER) {
            Some(HeaderValue::Int(count)) if *count > 0 => {
                u32::try_from(*count).unwrap_or(u32::MAX)
            }
            _ => 0,
        }
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.headers.insert(
            RETRY_COUNT_HEADER.to_string(),
            HeaderValue::Int(i64::from(count)),
        );
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}
