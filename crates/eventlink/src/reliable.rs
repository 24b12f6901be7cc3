// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reliable event publisher.
//!
//! Each event is sent as one JSON message on a request/reply connection and
//! must be answered within the request timeout. Unanswered or failed attempts
//! are retried on a fresh connection up to the configured attempt count, after
//! which the failure is returned to the caller.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::constants::{MAX_RETRIES, RECONNECT_INTERVAL, REQUEST_TIMEOUT};
use crate::errors::{DeliveryError, WireError};
use crate::event::Event;
use crate::retry::{AttemptFailure, Retry, RetryFailure, RetryStrategy};
use crate::util::Endpoint;
use crate::wire::{self, Connection, SocketKind};

#[derive(Debug, Clone)]
pub struct ReliableConfig {
    pub endpoint: Endpoint,
    /// Deadline for one request/reply round trip, connect included.
    pub request_timeout: Duration,
    /// Total attempts per event.
    pub max_retries: u32,
    /// Delay between connect attempts while the endpoint refuses.
    pub reconnect_interval: Duration,
}

impl ReliableConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            request_timeout: REQUEST_TIMEOUT,
            max_retries: MAX_RETRIES,
            reconnect_interval: RECONNECT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Attempts made, the successful one included.
    pub attempts: u32,
}

type ConnectionSlot = Arc<Mutex<Option<Connection>>>;

/// Request/reply client for [`Event`]s.
///
/// One request is outstanding per client at a time; concurrent `send` calls
/// queue on the connection and that wait counts against their deadline.
pub struct EventClient {
    config: ReliableConfig,
    retry: Retry,
    connection: ConnectionSlot,
    cancel_token: CancellationToken,
}

impl EventClient {
    pub fn new(config: ReliableConfig, cancel_token: CancellationToken) -> Self {
        let retry = Retry::new(
            config.request_timeout,
            RetryStrategy::Immediate(config.max_retries),
        );
        Self {
            config,
            retry,
            connection: Arc::new(Mutex::new(None)),
            cancel_token,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.config.endpoint
    }

    /// Delivers `event` and returns the reply payload.
    pub async fn send(&self, event: &Event) -> Result<(Bytes, DeliveryReport), DeliveryError> {
        let payload = Bytes::from(event.to_json()?);
        let endpoint = self.config.endpoint.to_string();
        let addr = self.config.endpoint.socket_addr();
        let max_attempts = self.retry.strategy.max_attempts();

        let outcome = self
            .retry
            .run(&self.cancel_token, |attempt| {
                debug!(
                    "Sending event {} to {} (attempt {}/{})",
                    event.event_id(),
                    endpoint,
                    attempt,
                    max_attempts
                );
                request(
                    Arc::clone(&self.connection),
                    addr.clone(),
                    self.config.reconnect_interval,
                    payload.clone(),
                )
            })
            .await;

        match outcome {
            Ok((reply, attempts)) => {
                trace!(
                    "Event {} acknowledged by {} after {} attempts",
                    event.event_id(),
                    endpoint,
                    attempts
                );
                Ok((reply, DeliveryReport { attempts }))
            }
            Err(RetryFailure::Exhausted {
                attempts,
                last: AttemptFailure::TimedOut,
            }) => {
                error!(
                    "Event {} to {} timed out after {} attempts",
                    event.event_id(),
                    endpoint,
                    attempts
                );
                Err(DeliveryError::Timeout {
                    endpoint,
                    event_id: event.event_id().to_string(),
                    attempts,
                })
            }
            Err(RetryFailure::Exhausted {
                attempts,
                last: AttemptFailure::Failed(source),
            }) => {
                error!(
                    "Event {} to {} failed after {} attempts: {}",
                    event.event_id(),
                    endpoint,
                    attempts,
                    source
                );
                Err(DeliveryError::Connection {
                    endpoint,
                    event_id: event.event_id().to_string(),
                    attempts,
                    source,
                })
            }
            Err(RetryFailure::Cancelled { attempts }) => {
                warn!(
                    "Delivery of event {} to {} cancelled after {} attempts",
                    event.event_id(),
                    endpoint,
                    attempts
                );
                Err(DeliveryError::Cancelled {
                    event_id: event.event_id().to_string(),
                    attempts,
                })
            }
        }
    }
}

/// One round trip. The connection is taken out of the slot for the duration
/// of the attempt and only returned after a reply, so a dropped or failed
/// attempt never leaves a connection with a pending request behind.
async fn request(
    slot: ConnectionSlot,
    addr: String,
    reconnect_interval: Duration,
    payload: Bytes,
) -> Result<Bytes, WireError> {
    let mut slot = slot.lock().await;
    let mut connection = match slot.take() {
        Some(connection) => connection,
        None => connect_until_ready(&addr, reconnect_interval).await?,
    };

    connection.send(vec![payload]).await?;
    match connection.next().await {
        Some(Ok(frames)) => {
            *slot = Some(connection);
            Ok(frames.into_iter().next().unwrap_or_default())
        }
        Some(Err(e)) => Err(e),
        None => Err(WireError::Closed),
    }
}

async fn connect_until_ready(addr: &str, interval: Duration) -> Result<Connection, WireError> {
    loop {
        match wire::connect(addr, SocketKind::Req).await {
            Ok(connection) => {
                debug!("Connected to {}", addr);
                return Ok(connection);
            }
            Err(e @ WireError::Greeting(_)) => return Err(e),
            Err(e) => {
                trace!("Connect to {} failed: {}; retrying", addr, e);
                tokio::time::sleep(interval).await;
            }
        }
    }
}
