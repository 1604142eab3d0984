pub mod connection;
mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use connection::{ConnectionConfiguration, ConnectionStringError};
pub use settings::{BusSettings, ConnectionSettings, RetrySettings, SchedulerSettings, Settings};

/// Loads the configuration from `config/default` and `WARREN_*` environment
/// variables, merged over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Like [`load_config`], reading the optional file `path` (any format the
/// `config` crate recognises by extension) instead of `config/default`.
///
/// Environment variables use `__` between section and key, for example
/// `WARREN_CONNECTION__HOST` or `WARREN_RETRY__MAX_RETRIES`.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("WARREN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    merge(partial)
}

fn merge(partial: PartialSettings) -> Result<Settings, ConfigError> {
    let default = Settings::default();
    let connection = partial.connection.unwrap_or_default();
    let bus = partial.bus.unwrap_or_default();
    let retry = partial.retry.unwrap_or_default();
    let scheduler = partial.scheduler.unwrap_or_default();

    let mut configuration = match connection.connection_string.as_deref() {
        Some(s) => s
            .parse::<ConnectionConfiguration>()
            .map_err(|e| ConfigError::Message(e.to_string()))?,
        None => default.connection.configuration,
    };
    if let Some(host) = connection.host {
        configuration.host = host;
    }
    if let Some(port) = connection.port {
        configuration.port = port;
    }
    if let Some(virtual_host) = connection.virtual_host {
        configuration.virtual_host = virtual_host;
    }
    if let Some(username) = connection.username {
        configuration.username = username;
    }
    if let Some(password) = connection.password {
        configuration.password = password;
    }

    Ok(Settings {
        connection: ConnectionSettings {
            configuration,
            connect_timeout_secs: connection
                .connect_timeout_secs
                .unwrap_or(default.connection.connect_timeout_secs),
        },
        bus: BusSettings {
            prefetch_count: bus.prefetch_count.unwrap_or(default.bus.prefetch_count),
            reconnect_first_ms: bus
                .reconnect_first_ms
                .unwrap_or(default.bus.reconnect_first_ms),
            reconnect_max_ms: bus.reconnect_max_ms.unwrap_or(default.bus.reconnect_max_ms),
            reconnect_factor: bus.reconnect_factor.unwrap_or(default.bus.reconnect_factor),
        },
        retry: RetrySettings {
            delay_ms: retry.delay_ms.unwrap_or(default.retry.delay_ms),
            max_retries: retry.max_retries.unwrap_or(default.retry.max_retries),
        },
        scheduler: SchedulerSettings {
            subscription_id: scheduler
                .subscription_id
                .unwrap_or(default.scheduler.subscription_id),
            store_path: scheduler.store_path.or(default.scheduler.store_path),
        },
    })
}
