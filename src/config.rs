// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Connection settings for the AMQP broker and tuning knobs for the trackers.
//! Both structs deserialize from JSON with every field optional, and both expose
//! builder-style setters for programmatic construction.

use crate::errors::TrackerError;
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

/// Upper bound for the drain polling interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connection parameters for a RabbitMQ broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        AmqpConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "%2f".to_owned(),
            connection_name: "rabbitmq-tracker".to_owned(),
        }
    }
}

impl AmqpConfig {
    /// Parses a JSON document, filling missing fields with defaults.
    pub fn from_json(raw: &str) -> Result<Self, TrackerError> {
        parse(raw)
    }

    /// Builds the `amqp://` URI used to open the connection.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_owned();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_owned();
        self.password = password.to_owned();
        self
    }

    pub fn vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_owned();
        self
    }

    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }
}

/// Timeouts and sizing used by the publisher and the RPC client.
///
/// Durations are expressed in milliseconds so the struct maps one to one onto
/// a flat JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Per-wait confirmation timeout for individual and batched publishing.
    pub confirm_timeout_ms: u64,
    /// Timeout used by `flush`.
    pub flush_timeout_ms: u64,
    /// Re-check interval while waiting for the pending set to drain.
    pub poll_interval_ms: u64,
    /// Default timeout for RPC calls.
    pub call_timeout_ms: u64,
    /// Number of publishes between two confirmation waits in batch mode.
    pub batch_size: usize,
    /// Capacity of the channels carrying inbound messages and confirmations.
    pub channel_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            confirm_timeout_ms: 5_000,
            flush_timeout_ms: 60_000,
            poll_interval_ms: 100,
            call_timeout_ms: 5_000,
            batch_size: 100,
            channel_capacity: 256,
        }
    }
}

impl TrackerConfig {
    /// Parses a JSON document, filling missing fields with defaults.
    pub fn from_json(raw: &str) -> Result<Self, TrackerError> {
        parse(raw)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Polling interval, never larger than [`MAX_POLL_INTERVAL`] and never zero.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1)).min(MAX_POLL_INTERVAL)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Batch size, at least one.
    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    /// Channel capacity, at least one.
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

fn parse<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, TrackerError> {
    serde_json::from_str(raw).map_err(|err| {
        error!(error = err.to_string(), "invalid configuration document");
        TrackerError::ConfigError(err.to_string())
    })
}
