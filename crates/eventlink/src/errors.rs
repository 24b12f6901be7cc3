// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every transport concern in the crate.

/// Outcome of a reliable delivery that did not get a reply.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("no reply from {endpoint} for event {event_id} after {attempts} attempts")]
    Timeout {
        endpoint: String,
        event_id: String,
        attempts: u32,
    },

    #[error("connection to {endpoint} failed for event {event_id} after {attempts} attempts: {source}")]
    Connection {
        endpoint: String,
        event_id: String,
        attempts: u32,
        #[source]
        source: WireError,
    },

    #[error("delivery of event {event_id} cancelled after {attempts} attempts")]
    Cancelled { event_id: String, attempts: u32 },

    #[error("event could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Framing and handshake failures on a multipart connection.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("invalid greeting: {0}")]
    Greeting(String),

    #[error("peer closed the connection")]
    Closed,
}

/// Reasons a bulk publish was dropped before reaching the socket.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("publish queue is full")]
    WouldBlock,

    #[error("publisher is closed")]
    Closed,
}

/// Errors from the monitoring ingestion server.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("couldn't bind monitor listener to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record: {0}")]
    MalformedRecord(#[from] serde_json::Error),
}

/// Conditions reported by [`crate::buffer::SharedBuffer`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("end of buffer")]
    Eof,

    #[error("length {requested} out of range for buffer of {len} bytes")]
    OutOfRange { requested: usize, len: usize },

    #[error("previous operation was not a successful read")]
    InvalidUnread,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint '{0}' must look like scheme://host:port")]
    Malformed(String),

    #[error("unsupported endpoint scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("invalid port in endpoint '{0}'")]
    InvalidPort(String),
}

/// Errors from resolving the broker endpoint at startup.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("discovery reported status '{0}'")]
    Unavailable(String),

    #[error("discovery returned an invalid endpoint: {0}")]
    Endpoint(#[from] EndpointError),
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("couldn't bind health exporter to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("health exporter I/O error: {0}")]
    Io(#[from] std::io::Error),
}
