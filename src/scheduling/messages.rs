//! Scheduling system messages.
//!
//! These records travel over the bus like any other message. Each carries
//! the serialized original message (`inner_message`) and the type id it must
//! be republished under (`binding_key`).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::scheduling::builder::{FOREVER, MIN_INTERVAL};
use crate::utils::error::{BusError, Result};

/// Publish `inner_message` once at `wake_time`. Has no identity and cannot
/// be cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScheduleMe {
    pub binding_key: String,
    pub inner_message: Vec<u8>,
    pub wake_time: DateTime<Utc>,
}

impl Message for ScheduleMe {
    const TYPE_NAME: &'static str = "Warren.SystemMessages.ScheduleMe:Warren";
}

/// Publish at `wake_time`, then `number_of_repetitions` more times every
/// `repetition_interval`. `-1` repetitions means forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScheduleMeRepetitive {
    pub binding_key: String,
    pub inner_message: Vec<u8>,
    pub wake_time: DateTime<Utc>,
    pub repetition_interval: Duration,
    pub number_of_repetitions: i32,
    pub name: String,
    pub group: Option<String>,
}

impl Message for ScheduleMeRepetitive {
    const TYPE_NAME: &'static str = "Warren.SystemMessages.ScheduleMeRepetitive:Warren";
}

impl ScheduleMeRepetitive {
    pub fn new(
        binding_key: impl Into<String>,
        inner_message: Vec<u8>,
        wake_time: DateTime<Utc>,
        repetition_interval: Duration,
        number_of_repetitions: i32,
        name: impl Into<String>,
        group: Option<String>,
    ) -> Result<Self> {
        let message = Self {
            binding_key: binding_key.into(),
            inner_message,
            wake_time,
            repetition_interval,
            number_of_repetitions,
            name: name.into(),
            group,
        };
        message.validate()?;
        Ok(message)
    }

    /// Checks the ranges a well-formed record must respect. Deserialized
    /// records are not checked until this is called.
    pub fn validate(&self) -> Result<()> {
        if self.repetition_interval < MIN_INTERVAL {
            return Err(BusError::scheduling(
                "repetition_interval",
                "invalid repetition interval, must be at least 1ms",
            ));
        }
        if self.number_of_repetitions < FOREVER {
            return Err(BusError::scheduling(
                "number_of_repetitions",
                format!("invalid number of repetitions {}", self.number_of_repetitions),
            ));
        }
        validate_name(&self.name)
    }

    pub fn repeats_forever(&self) -> bool {
        self.number_of_repetitions == FOREVER
    }
}

/// Publish on every instant matching `cron_expression` (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScheduleMeCron {
    pub binding_key: String,
    pub inner_message: Vec<u8>,
    pub cron_expression: String,
    pub name: String,
    pub group: Option<String>,
}

impl Message for ScheduleMeCron {
    const TYPE_NAME: &'static str = "Warren.SystemMessages.ScheduleMeCron:Warren";
}

impl ScheduleMeCron {
    pub fn new(
        binding_key: impl Into<String>,
        inner_message: Vec<u8>,
        cron_expression: impl Into<String>,
        name: impl Into<String>,
        group: Option<String>,
    ) -> Result<Self> {
        let message = Self {
            binding_key: binding_key.into(),
            inner_message,
            cron_expression: cron_expression.into(),
            name: name.into(),
            group,
        };
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cron_expression.trim().is_empty() {
            return Err(BusError::scheduling(
                "cron_expression",
                "a cron expression must not be blank",
            ));
        }
        validate_name(&self.name)
    }
}

/// Cancels the repeating or cron job registered under `name` and `group`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UnscheduleMe {
    pub name: String,
    pub group: Option<String>,
}

impl Message for UnscheduleMe {
    const TYPE_NAME: &'static str = "Warren.SystemMessages.UnscheduleMe:Warren";
}

impl UnscheduleMe {
    pub fn new(name: impl Into<String>, group: Option<String>) -> Result<Self> {
        let message = Self {
            name: name.into(),
            group,
        };
        validate_name(&message.name)?;
        Ok(message)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(BusError::scheduling(
            "name",
            "a name must not be empty or whitespace only",
        ));
    }
    Ok(())
}
