// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::ack::AckLimits;
use crate::errors::ConfigError;
use crate::sender::pool::SenderSettings;
use crate::sender::{Protocol, RetryPolicy};

const ENV_SYSLOG_SERVER_HOST: &str = "SYSLOG_SERVER_HOST";
const ENV_SYSLOG_SERVER_PORT: &str = "SYSLOG_SERVER_PORT";
const ENV_SYSLOG_SERVER_PROTOCOL: &str = "SYSLOG_SERVER_PROTOCOL";
const ENV_SYSLOG_SERVER_CONNECTIONS: &str = "SYSLOG_SERVER_CONNECTIONS";
const ENV_SYSLOG_HOSTNAME: &str = "SYSLOG_HOSTNAME";
const ENV_SYSLOG_APPNAME: &str = "SYSLOG_APPNAME";
const ENV_MAX_CHANNELS: &str = "MAX_CHANNELS";
const ENV_MAX_ACK_VALUE: &str = "MAX_ACK_VALUE";
const ENV_MAX_ACK_AGE: &str = "MAX_ACK_AGE";
const ENV_MAX_SESSION_AGE: &str = "MAX_SESSION_AGE";
const ENV_POLL_TIME: &str = "POLL_TIME";
const ENV_SERVER_LISTEN_ADDRESS: &str = "SERVER_LISTEN_ADDRESS";
const ENV_SERVER_PORT: &str = "SERVER_PORT";
const ENV_MAX_REQUEST_CONTENT_LENGTH: &str = "MAX_REQUEST_CONTENT_LENGTH";
const ENV_SENDER_RECONNECT_INTERVAL: &str = "SENDER_RECONNECT_INTERVAL";
const ENV_SENDER_MAX_ATTEMPTS: &str = "SENDER_MAX_ATTEMPTS";
const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Gateway configuration, read from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Collector address
    pub syslog_server_host: String,
    pub syslog_server_port: u16,
    /// Transport name, e.g. `RELP`
    pub syslog_server_protocol: String,
    /// Number of long-lived senders
    pub syslog_server_connections: usize,
    /// RFC5424 HOSTNAME field
    pub syslog_hostname: String,
    /// RFC5424 APP-NAME field
    pub syslog_appname: String,
    /// Global cap on live sessions
    pub max_channels: usize,
    /// Per-channel cap on live acks
    pub max_ack_value: usize,
    pub max_ack_age: Duration,
    pub max_session_age: Duration,
    /// Sweeper interval
    pub poll_time: Duration,
    pub server_listen_address: IpAddr,
    pub server_port: u16,
    pub max_request_content_length: usize,
    pub sender_reconnect_interval: Duration,
    /// `None` retries until success
    pub sender_max_attempts: Option<u32>,
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let limits = AckLimits::default();
        let retry = RetryPolicy::default();
        Self {
            syslog_server_host: "127.0.0.1".to_string(),
            syslog_server_port: 601,
            syslog_server_protocol: "RELP".to_string(),
            syslog_server_connections: 1,
            syslog_hostname: "localhost".to_string(),
            syslog_appname: "hec-gateway".to_string(),
            max_channels: limits.max_channels,
            max_ack_value: limits.max_ack_value,
            max_ack_age: limits.max_ack_age,
            max_session_age: limits.max_session_age,
            poll_time: Duration::from_millis(30_000),
            server_listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_port: 8080,
            max_request_content_length: 10 * 1024 * 1024,
            sender_reconnect_interval: retry.interval,
            sender_max_attempts: retry.max_attempts,
            log_level: "info".to_string(),
        }
    }
}

fn parse_or<T: FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn millis_or(map: &HashMap<String, String>, key: &str, default: Duration) -> Duration {
    map.get(key)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn text_or(map: &HashMap<String, String>, key: &str, default: &str) -> String {
    map.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
        .to_string()
}

impl GatewayConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_env_iter(env::vars());
        config.validate()?;
        Ok(config)
    }

    /// Builds the configuration from key/value pairs. Values that do not parse fall back to
    /// their default; call [`GatewayConfig::validate`] before use.
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let defaults = Self::default();

        let sender_max_attempts = map
            .get(ENV_SENDER_MAX_ATTEMPTS)
            .and_then(|value| value.trim().parse::<u32>().ok())
            .map_or(defaults.sender_max_attempts, |attempts| {
                (attempts > 0).then_some(attempts)
            });

        Self {
            syslog_server_host: text_or(&map, ENV_SYSLOG_SERVER_HOST, &defaults.syslog_server_host),
            syslog_server_port: parse_or(&map, ENV_SYSLOG_SERVER_PORT, defaults.syslog_server_port),
            syslog_server_protocol: text_or(
                &map,
                ENV_SYSLOG_SERVER_PROTOCOL,
                &defaults.syslog_server_protocol,
            ),
            syslog_server_connections: parse_or(
                &map,
                ENV_SYSLOG_SERVER_CONNECTIONS,
                defaults.syslog_server_connections,
            ),
            syslog_hostname: text_or(&map, ENV_SYSLOG_HOSTNAME, &defaults.syslog_hostname),
            syslog_appname: text_or(&map, ENV_SYSLOG_APPNAME, &defaults.syslog_appname),
            max_channels: parse_or(&map, ENV_MAX_CHANNELS, defaults.max_channels),
            max_ack_value: parse_or(&map, ENV_MAX_ACK_VALUE, defaults.max_ack_value),
            max_ack_age: millis_or(&map, ENV_MAX_ACK_AGE, defaults.max_ack_age),
            max_session_age: millis_or(&map, ENV_MAX_SESSION_AGE, defaults.max_session_age),
            poll_time: millis_or(&map, ENV_POLL_TIME, defaults.poll_time),
            server_listen_address: parse_or(
                &map,
                ENV_SERVER_LISTEN_ADDRESS,
                defaults.server_listen_address,
            ),
            server_port: parse_or(&map, ENV_SERVER_PORT, defaults.server_port),
            max_request_content_length: parse_or(
                &map,
                ENV_MAX_REQUEST_CONTENT_LENGTH,
                defaults.max_request_content_length,
            ),
            sender_reconnect_interval: millis_or(
                &map,
                ENV_SENDER_RECONNECT_INTERVAL,
                defaults.sender_reconnect_interval,
            ),
            sender_max_attempts,
            log_level: map
                .get(ENV_LOG_LEVEL)
                .map(|value| value.trim().to_lowercase())
                .unwrap_or(defaults.log_level),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.syslog_server_host.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "SYSLOG_SERVER_HOST cannot be empty".to_string(),
            ));
        }
        if self.syslog_server_port == 0 {
            return Err(ConfigError::Invalid(
                "Syslog server port must be greater than 0".to_string(),
            ));
        }
        if self.server_port == 0 {
            return Err(ConfigError::Invalid(
                "Server port must be greater than 0".to_string(),
            ));
        }
        let protocol = self
            .syslog_server_protocol
            .parse::<Protocol>()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        // The in-memory transport never reaches a collector but still reports events delivered.
        if protocol == Protocol::Memory {
            return Err(ConfigError::Invalid(format!(
                "Invalid connection type: {} cannot be used to run the gateway",
                self.syslog_server_protocol
            )));
        }

        let positive = [
            (ENV_SYSLOG_SERVER_CONNECTIONS, self.syslog_server_connections),
            (ENV_MAX_CHANNELS, self.max_channels),
            (ENV_MAX_ACK_VALUE, self.max_ack_value),
            (ENV_MAX_REQUEST_CONTENT_LENGTH, self.max_request_content_length),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        let durations = [
            (ENV_MAX_ACK_AGE, self.max_ack_age),
            (ENV_MAX_SESSION_AGE, self.max_session_age),
            (ENV_POLL_TIME, self.poll_time),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn ack_limits(&self) -> AckLimits {
        AckLimits {
            max_channels: self.max_channels,
            max_ack_value: self.max_ack_value,
            max_ack_age: self.max_ack_age,
            max_session_age: self.max_session_age,
        }
    }

    pub fn sender_settings(&self) -> SenderSettings {
        SenderSettings {
            protocol: self.syslog_server_protocol.clone(),
            host: self.syslog_server_host.clone(),
            port: self.syslog_server_port,
            connections: self.syslog_server_connections,
            retry: RetryPolicy {
                interval: self.sender_reconnect_interval,
                max_attempts: self.sender_max_attempts,
            },
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_listen_address, self.server_port)
    }
}
