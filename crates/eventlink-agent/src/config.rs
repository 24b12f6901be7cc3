// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use eventlink::constants::{DEFAULT_MONITOR_PORT, DEFAULT_SERVICE_NAME};
use eventlink::util::Endpoint;

use crate::error::AgentError;

const DEFAULT_METRICS_PORT: u16 = 6369;
const DEFAULT_TOPIC: &str = "docker-log";
const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the agent's listeners and publishers
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Service name used as the health gauge label
    pub service_name: String,
    /// Host the monitor UDP listener binds to
    pub monitor_host: String,
    /// Port the monitor UDP listener binds to
    pub monitor_port: u16,
    /// Port serving `/metrics` and `/health`
    pub metrics_port: u16,
    /// Broker endpoint for bulk log publishing
    pub publish_endpoint: Option<Endpoint>,
    /// Discovery URL consulted when no publish endpoint is set
    pub discovery_url: Option<String>,
    /// Endpoint receiving lifecycle events over request/reply
    pub event_endpoint: Option<Endpoint>,
    /// Number of bulk publishing workers
    pub workers: usize,
    /// Pause between publishing rounds
    pub send_interval: Duration,
    /// Topic prefixed to every published log line
    pub topic: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            monitor_host: "0.0.0.0".to_string(),
            monitor_port: DEFAULT_MONITOR_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            publish_endpoint: None,
            discovery_url: None,
            event_endpoint: None,
            workers: 1,
            send_interval: DEFAULT_SEND_INTERVAL,
            topic: DEFAULT_TOPIC.to_string(),
        }
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from any variable source. Unset and empty
    /// variables fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|val| !val.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            log_level: var("EVENTLINK_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            service_name: var("EVENTLINK_SERVICE_NAME").unwrap_or(defaults.service_name),
            monitor_host: var("EVENTLINK_MONITOR_HOST").unwrap_or(defaults.monitor_host),
            monitor_port: parse_port(var("EVENTLINK_MONITOR_PORT"), "EVENTLINK_MONITOR_PORT")?
                .unwrap_or(defaults.monitor_port),
            metrics_port: parse_port(var("EVENTLINK_METRICS_PORT"), "EVENTLINK_METRICS_PORT")?
                .unwrap_or(defaults.metrics_port),
            publish_endpoint: parse_endpoint(
                var("EVENTLINK_PUBLISH_ENDPOINT"),
                "EVENTLINK_PUBLISH_ENDPOINT",
            )?,
            discovery_url: var("EVENTLINK_DISCOVERY_URL"),
            event_endpoint: parse_endpoint(var("EVENTLINK_EVENT_ENDPOINT"), "EVENTLINK_EVENT_ENDPOINT")?,
            workers: match var("EVENTLINK_WORKERS") {
                Some(val) => val.trim().parse::<usize>().map_err(|_| {
                    AgentError::InvalidConfig(format!("EVENTLINK_WORKERS '{val}' is not a number"))
                })?,
                None => defaults.workers,
            },
            send_interval: match var("EVENTLINK_SEND_INTERVAL") {
                Some(val) => humantime::parse_duration(val.trim()).map_err(|e| {
                    AgentError::InvalidConfig(format!("EVENTLINK_SEND_INTERVAL '{val}': {e}"))
                })?,
                None => defaults.send_interval,
            },
            topic: var("EVENTLINK_TOPIC").unwrap_or(defaults.topic),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), AgentError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(AgentError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.service_name.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "EVENTLINK_SERVICE_NAME cannot be empty".to_string(),
            ));
        }

        if self.metrics_port == 0 {
            return Err(AgentError::InvalidConfig(
                "Metrics port must be greater than 0".to_string(),
            ));
        }

        if self.workers == 0 {
            return Err(AgentError::InvalidConfig(
                "EVENTLINK_WORKERS must be at least 1".to_string(),
            ));
        }

        if self.send_interval.is_zero() {
            return Err(AgentError::InvalidConfig(
                "EVENTLINK_SEND_INTERVAL must be greater than zero".to_string(),
            ));
        }

        if self.topic.is_empty() {
            return Err(AgentError::InvalidConfig(
                "EVENTLINK_TOPIC cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_port(val: Option<String>, key: &str) -> Result<Option<u16>, AgentError> {
    val.map(|val| {
        val.trim()
            .parse::<u16>()
            .map_err(|_| AgentError::InvalidConfig(format!("{key} '{val}' is not a valid port")))
    })
    .transpose()
}

fn parse_endpoint(val: Option<String>, key: &str) -> Result<Option<Endpoint>, AgentError> {
    val.map(|val| {
        val.parse::<Endpoint>()
            .map_err(|e| AgentError::InvalidConfig(format!("{key}: {e}")))
    })
    .transpose()
}
