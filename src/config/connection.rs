//! Broker connection parameters and the `key=value;key=value` connection
//! string they are usually written as.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConnectionStringError {
    #[error("connection string segment '{0}' is not of the form key=value")]
    Malformed(String),

    #[error("unknown connection string key '{0}'")]
    UnknownKey(String),

    #[error("invalid value '{value}' for '{key}'")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfiguration {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
}

impl Default for ConnectionConfiguration {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

impl ConnectionConfiguration {
    /// Broker address without credentials, suitable for logs.
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.virtual_host)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConnectionStringError> {
    value
        .parse()
        .map_err(|_| ConnectionStringError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

impl FromStr for ConnectionConfiguration {
    type Err = ConnectionStringError;

    /// Keys are case-insensitive; missing keys keep their defaults.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut configuration = ConnectionConfiguration::default();
        for segment in s.split(';').map(str::trim).filter(|seg| !seg.is_empty()) {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::Malformed(segment.to_string()))?;
            let (key, value) = (key.trim(), value.trim());
            match key.to_ascii_lowercase().as_str() {
                "host" => configuration.host = value.to_string(),
                "port" => configuration.port = parse_number(key, value)?,
                "virtualhost" => configuration.virtual_host = value.to_string(),
                "username" => configuration.username = value.to_string(),
                "password" => configuration.password = value.to_string(),
                _ => return Err(ConnectionStringError::UnknownKey(key.to_string())),
            }
        }
        Ok(configuration)
    }
}

impl fmt::Display for ConnectionConfiguration {
    /// Renders the connection string with the password masked.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host={};port={};virtualHost={};username={};password=****",
            self.host, self.port, self.virtual_host, self.username
        )
    }
}
