// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Utility functions for endpoint and numeric handling.

use std::fmt;
use std::str::FromStr;

use crate::errors::EndpointError;

/// A broker endpoint of the form `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for socket connect calls.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// Parses an endpoint URI.
///
/// Only the `tcp` scheme is supported. Whitespace around the input is
/// trimmed.
///
/// # Examples
///
/// ```
/// use eventlink::util::Endpoint;
///
/// let endpoint: Endpoint = "tcp://127.0.0.1:6366".parse().unwrap();
/// assert_eq!(endpoint.socket_addr(), "127.0.0.1:6366");
/// assert!("127.0.0.1:6366".parse::<Endpoint>().is_err());
/// assert!("udp://127.0.0.1:6366".parse::<Endpoint>().is_err());
/// ```
impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| EndpointError::Malformed(trimmed.to_string()))?;
        if !scheme.eq_ignore_ascii_case("tcp") {
            return Err(EndpointError::UnsupportedScheme(scheme.to_string()));
        }
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::Malformed(trimmed.to_string()))?;
        if host.is_empty() {
            return Err(EndpointError::Malformed(trimmed.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(trimmed.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Rounds a non-negative value half up to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    ((value + 0.5 / factor) * factor).trunc() / factor
}
