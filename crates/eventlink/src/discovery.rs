// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error};

use crate::errors::DiscoveryError;
use crate::util::Endpoint;

const SUCCESS_STATUS: &str = "success";

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    status: String,
    #[serde(default)]
    host: String,
}

/// Asks the discovery service for the broker endpoint.
///
/// Any status other than `success` is returned as
/// [`DiscoveryError::Unavailable`]. A host without a scheme is taken as
/// `tcp://`.
pub async fn discover(url: &str, timeout: Duration) -> Result<Endpoint, DiscoveryError> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    debug!("Resolving broker endpoint from {}", url);
    let response: DiscoveryResponse = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if response.status != SUCCESS_STATUS {
        error!("Discovery at {} reported status {}", url, response.status);
        return Err(DiscoveryError::Unavailable(response.status));
    }
    let endpoint = if response.host.contains("://") {
        response.host.parse()?
    } else {
        format!("tcp://{}", response.host).parse()?
    };
    debug!("Discovered broker endpoint {}", endpoint);
    Ok(endpoint)
}
