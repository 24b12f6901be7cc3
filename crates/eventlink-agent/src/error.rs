// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use eventlink::errors::{DiscoveryError, HealthError, MonitorError};

/// Errors that stop the agent
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start monitor listener: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Failed to start health exporter: {0}")]
    Health(#[from] HealthError),

    #[error("Failed to resolve publish endpoint: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Failed to wait for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}
