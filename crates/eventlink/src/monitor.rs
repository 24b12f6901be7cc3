// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Monitoring ingestion server.
//!
//! Receives datagrams of newline separated monitoring records, classifies each
//! record and forwards it to the monitor store. Receive errors are never
//! fatal: the server logs them, backs off and keeps listening.

#[cfg(test)]
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::constants::{DEFAULT_MONITOR_PORT, MAX_DATAGRAM_SIZE, RECEIVE_ERROR_BACKOFF};
use crate::errors::MonitorError;
use crate::sample::{parse_record, split_records, MonitorRecord};
use crate::store_service::MonitorStoreHandle;

/// Configuration for the monitoring ingestion server
pub struct MonitorServerConfig {
    /// Host to bind the UDP socket to (e.g., "0.0.0.0")
    pub host: String,
    /// Port to bind the UDP socket to; 0 picks a free port
    pub port: u16,
}

impl Default for MonitorServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_MONITOR_PORT,
        }
    }
}

// BufferReader abstracts where datagrams come from.
enum BufferReader {
    /// UDP socket reader with its reusable receive buffer
    UdpSocket {
        socket: UdpSocket,
        buf: Mutex<Vec<u8>>,
    },

    /// Mirror reader for testing - replays a fixed payload
    #[cfg(test)]
    MirrorTest(Vec<u8>, SocketAddr),

    /// Scripted reader for testing - yields queued results in order, then
    /// waits forever
    #[cfg(test)]
    ScriptedTest(Mutex<VecDeque<std::io::Result<(Vec<u8>, SocketAddr)>>>),
}

impl BufferReader {
    /// Blocks until one datagram is available.
    async fn read(&self) -> std::io::Result<(Vec<u8>, SocketAddr)> {
        match self {
            BufferReader::UdpSocket { socket, buf } => {
                let mut buf = buf.lock().await;
                let (amt, src) = socket.recv_from(&mut buf).await?;
                Ok((buf[..amt].to_vec(), src))
            }
            #[cfg(test)]
            BufferReader::MirrorTest(data, addr) => Ok((data.clone(), *addr)),
            #[cfg(test)]
            BufferReader::ScriptedTest(script) => {
                let next = script.lock().await.pop_front();
                match next {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            }
        }
    }
}

/// Monitoring server to receive, classify and forward records.
pub struct MonitorServer {
    cancel_token: CancellationToken,
    store_handle: MonitorStoreHandle,
    buffer_reader: BufferReader,
    local_addr: Option<SocketAddr>,
    dispatched: Arc<AtomicU64>,
}

impl MonitorServer {
    /// Binds the UDP socket. A bind failure is the only fatal error of the
    /// ingestion path.
    pub async fn new(
        config: &MonitorServerConfig,
        store_handle: MonitorStoreHandle,
        cancel_token: CancellationToken,
    ) -> Result<MonitorServer, MonitorError> {
        let addr = format!("{}:{}", config.host, config.port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| MonitorError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = socket.local_addr().ok();
        info!("Monitor server listening on {}", addr);

        Ok(MonitorServer {
            cancel_token,
            store_handle,
            buffer_reader: BufferReader::UdpSocket {
                socket,
                buf: Mutex::new(vec![0; MAX_DATAGRAM_SIZE]),
            },
            local_addr,
            dispatched: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Shared counter of records forwarded to the store.
    pub fn dispatch_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dispatched)
    }

    /// Main loop that receives and processes datagrams until cancelled.
    pub async fn spin(self) {
        while !self.cancel_token.is_cancelled() {
            let read = tokio::select! {
                read = self.buffer_reader.read() => read,
                _ = self.cancel_token.cancelled() => break,
            };
            match read {
                Ok((buf, src)) => {
                    trace!("Received {} bytes from {}", buf.len(), src);
                    self.consume_records(&buf);
                }
                Err(e) => {
                    error!(
                        "Monitor receive failed: {}; retrying in {:?}",
                        e, RECEIVE_ERROR_BACKOFF
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                        _ = self.cancel_token.cancelled() => break,
                    }
                }
            }
        }
        debug!("Monitor server stopped");
    }

    /// Receive one datagram from the transport and process it.
    #[cfg(test)]
    async fn consume_once(&self) -> std::io::Result<usize> {
        let (buf, _) = self.buffer_reader.read().await?;
        Ok(self.consume_records(&buf))
    }

    /// Dispatches every non-empty record of a datagram. Returns the number of
    /// records forwarded.
    fn consume_records(&self, payload: &[u8]) -> usize {
        let mut forwarded = 0;
        for record in split_records(payload) {
            match parse_record(record) {
                Ok(record) => {
                    if self.dispatch(record) {
                        forwarded += 1;
                    }
                }
                Err(e) => warn!(
                    "Dropping monitor record {}: {}",
                    String::from_utf8_lossy(record),
                    e
                ),
            }
        }
        self.dispatched.fetch_add(forwarded as u64, Ordering::Relaxed);
        forwarded
    }

    fn dispatch(&self, record: MonitorRecord) -> bool {
        let sent = match record {
            MonitorRecord::Batch(samples) => {
                debug!("Forwarding {} monitor samples to store", samples.len());
                self.store_handle.insert_batch(samples)
            }
            MonitorRecord::Tag(tag) => {
                trace!("Forwarding tag line from {}", tag.source);
                self.store_handle.insert_tag(tag)
            }
        };
        match sent {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to send record to monitor store: {}", e);
                false
            }
        }
    }
}
