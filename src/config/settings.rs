use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::BusConfig;
use crate::config::connection::ConnectionConfiguration;
use crate::connection::ReconnectPolicy;
use crate::consumer::RetryConfig;
use crate::scheduler::SchedulerConfig;

/// Top-level configuration for a bus process.
///
/// Every section has defaults; files and environment variables only need to
/// name the values they change.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub bus: BusSettings,
    pub retry: RetrySettings,
    pub scheduler: SchedulerSettings,
}

/// Where the broker lives and how long to wait for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub configuration: ConnectionConfiguration,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusSettings {
    pub prefetch_count: u16,
    pub reconnect_first_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_factor: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub delay_ms: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub subscription_id: String,
    pub store_path: Option<PathBuf>,
}

/// Partial configuration loaded from files or the environment.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub connection: Option<PartialConnectionSettings>,
    pub bus: Option<PartialBusSettings>,
    pub retry: Option<PartialRetrySettings>,
    pub scheduler: Option<PartialSchedulerSettings>,
}

/// Partial connection settings. A `connection_string` is applied first and
/// the individual keys override it.
#[derive(Debug, Default, Deserialize)]
pub struct PartialConnectionSettings {
    pub connection_string: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub virtual_host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBusSettings {
    pub prefetch_count: Option<u16>,
    pub reconnect_first_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    pub reconnect_factor: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialRetrySettings {
    pub delay_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialSchedulerSettings {
    pub subscription_id: Option<String>,
    pub store_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let bus = BusConfig::default();
        let retry = RetryConfig::default();
        let scheduler = SchedulerConfig::default();
        Self {
            connection: ConnectionSettings {
                configuration: ConnectionConfiguration::default(),
                connect_timeout_secs: bus.connect_timeout.as_secs(),
            },
            bus: BusSettings {
                prefetch_count: bus.prefetch_count,
                reconnect_first_ms: duration_ms(bus.reconnect.first),
                reconnect_max_ms: duration_ms(bus.reconnect.max),
                reconnect_factor: bus.reconnect.factor,
            },
            retry: RetrySettings {
                delay_ms: duration_ms(retry.delay),
                max_retries: retry.max_retries,
            },
            scheduler: SchedulerSettings {
                subscription_id: scheduler.subscription_id,
                store_path: scheduler.store_path,
            },
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Settings {
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            prefetch_count: self.bus.prefetch_count,
            reconnect: ReconnectPolicy {
                first: Duration::from_millis(self.bus.reconnect_first_ms),
                max: Duration::from_millis(self.bus.reconnect_max_ms),
                factor: self.bus.reconnect_factor,
            },
            connect_timeout: Duration::from_secs(self.connection.connect_timeout_secs),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            delay: Duration::from_millis(self.retry.delay_ms),
            max_retries: self.retry.max_retries,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            subscription_id: self.scheduler.subscription_id.clone(),
            store_path: self.scheduler.store_path.clone(),
        }
    }
}
