// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fire-and-forget topic publisher for bulk log shipping.
//!
//! [`BulkPublisher::publish`] never waits: frames go into a bounded queue and a
//! background writer task owns the TCP connection. Frames that arrive while the
//! writer is disconnected are dropped and counted. Connection state changes are
//! reported on a side channel drained by a separate monitor task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::constants::{
    CONNECTION_EVENT_DEPTH, FLUSH_TIMEOUT, PUBLISH_QUEUE_DEPTH, RECONNECT_INTERVAL,
};
use crate::errors::PublishError;
use crate::util::Endpoint;
use crate::wire::{self, Connection, Multipart, MultipartCodec, SocketKind};

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum ConnectionEvent {
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
    #[display("handshake succeeded")]
    HandshakeSucceeded,
    #[display("disconnected")]
    Disconnected,
    #[display("error: {_0}")]
    Error(String),
}

#[derive(Debug, Clone)]
pub struct BulkConfig {
    pub endpoint: Endpoint,
    pub queue_depth: usize,
    pub reconnect_interval: Duration,
}

impl BulkConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            queue_depth: PUBLISH_QUEUE_DEPTH,
            reconnect_interval: RECONNECT_INTERVAL,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

pub struct BulkPublisher {
    endpoint: Endpoint,
    tx: mpsc::Sender<Multipart>,
    counters: Arc<Counters>,
    state: Arc<Mutex<Option<ConnectionEvent>>>,
    shutdown: CancellationToken,
    writer: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl BulkPublisher {
    /// Starts the writer and monitor tasks. Connecting happens in the
    /// background, so this never fails; an unreachable endpoint only shows up
    /// as connection events and dropped frames.
    pub fn open(config: BulkConfig, cancel_token: &CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let (events_tx, events_rx) = mpsc::channel(CONNECTION_EVENT_DEPTH);
        let counters = Arc::new(Counters::default());
        let state = Arc::new(Mutex::new(None));
        let shutdown = cancel_token.child_token();

        let writer = Writer {
            addr: config.endpoint.socket_addr(),
            reconnect_interval: config.reconnect_interval,
            rx,
            events: events_tx,
            counters: Arc::clone(&counters),
            shutdown: shutdown.clone(),
        };
        let writer = tokio::spawn(writer.run());
        let monitor = tokio::spawn(monitor_connection(
            config.endpoint.to_string(),
            events_rx,
            Arc::clone(&state),
        ));

        Self {
            endpoint: config.endpoint,
            tx,
            counters,
            state,
            shutdown,
            writer,
            monitor,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Queues a two-frame message, topic first. Never waits.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), PublishError> {
        let message = vec![Bytes::copy_from_slice(topic.as_bytes()), payload.into()];
        self.tx.try_send(message).map_err(|e| {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                TrySendError::Full(_) => PublishError::WouldBlock,
                TrySendError::Closed(_) => PublishError::Closed,
            }
        })
    }

    /// Messages written to a connection.
    pub fn sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    /// Messages rejected by [`publish`](Self::publish) or discarded while
    /// disconnected.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Last connection event seen by the monitor task.
    pub fn connection_state(&self) -> Option<ConnectionEvent> {
        self.state.lock().clone()
    }

    /// Writes whatever is still queued if connected, then stops both tasks.
    pub async fn close(self) {
        drop(self.tx);
        self.shutdown.cancel();
        if let Err(e) = self.writer.await {
            warn!("Bulk writer for {} ended abnormally: {}", self.endpoint, e);
        }
        if let Err(e) = self.monitor.await {
            warn!("Bulk monitor for {} ended abnormally: {}", self.endpoint, e);
        }
    }
}

struct Writer {
    addr: String,
    reconnect_interval: Duration,
    rx: mpsc::Receiver<Multipart>,
    events: mpsc::Sender<ConnectionEvent>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
}

impl Writer {
    async fn run(mut self) {
        loop {
            let Some(mut connection) = self.connect().await else {
                return;
            };
            if !self.pump(&mut connection).await {
                return;
            }
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    /// Returns `None` once the writer should stop.
    async fn connect(&mut self) -> Option<Connection> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            self.emit(ConnectionEvent::Connecting);
            let connected = tokio::select! {
                connected = TcpStream::connect(&self.addr) => connected,
                _ = self.shutdown.cancelled() => return None,
            };
            let failure = match connected {
                Ok(mut stream) => {
                    self.emit(ConnectionEvent::Connected);
                    let _ = stream.set_nodelay(true);
                    let greeted = tokio::select! {
                        greeted = wire::handshake(&mut stream, SocketKind::Pub) => greeted,
                        _ = self.shutdown.cancelled() => return None,
                    };
                    match greeted {
                        Ok(_) => {
                            self.emit(ConnectionEvent::HandshakeSucceeded);
                            return Some(Framed::new(stream, MultipartCodec::default()));
                        }
                        Err(e) => e.to_string(),
                    }
                }
                Err(e) => e.to_string(),
            };
            self.emit(ConnectionEvent::Error(failure));

            if !self.drop_queued() {
                return None;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_interval) => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Discards frames queued while disconnected. Returns `false` when the
    /// publisher side has gone away.
    fn drop_queued(&mut self) -> bool {
        let mut dropped = 0;
        let open = loop {
            match self.rx.try_recv() {
                Ok(_) => dropped += 1,
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Disconnected) => break false,
            }
        };
        if dropped > 0 {
            trace!("Dropped {} messages while disconnected from {}", dropped, self.addr);
            self.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        open
    }

    /// Writes queued messages until the connection fails (returns `true`) or
    /// the writer should stop (returns `false`).
    async fn pump(&mut self, connection: &mut Connection) -> bool {
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => {
                        let sent = tokio::select! {
                            sent = connection.send(message) => sent,
                            _ = self.shutdown.cancelled() => {
                                // a subscriber that stopped reading keeps the write pending
                                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                                self.flush_queued(connection).await;
                                return false;
                            }
                        };
                        if let Err(e) = sent {
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                            self.emit(ConnectionEvent::Error(e.to_string()));
                            return true;
                        }
                        self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        if timeout(FLUSH_TIMEOUT, connection.close()).await.is_err() {
                            debug!("Closing connection to {} timed out", self.addr);
                        }
                        return false;
                    }
                },
                incoming = connection.next() => match incoming {
                    Some(Ok(_)) => trace!("Ignoring message from subscriber at {}", self.addr),
                    Some(Err(e)) => {
                        self.emit(ConnectionEvent::Error(e.to_string()));
                        return true;
                    }
                    None => return true,
                },
                _ = self.shutdown.cancelled() => {
                    self.flush_queued(connection).await;
                    return false;
                }
            }
        }
    }

    /// Writes what is still queued, then closes the connection. Gives up
    /// after [`FLUSH_TIMEOUT`]; frames not confirmed written by then count as
    /// dropped.
    async fn flush_queued(&mut self, connection: &mut Connection) {
        let mut pending = 0u64;
        let flushed = timeout(FLUSH_TIMEOUT, async {
            while let Ok(message) = self.rx.try_recv() {
                pending += 1;
                connection.feed(message).await?;
            }
            connection.close().await
        })
        .await;

        match flushed {
            Ok(Ok(())) => {
                self.counters.sent.fetch_add(pending, Ordering::Relaxed);
                return;
            }
            Ok(Err(e)) => debug!("Flushing connection to {} failed: {}", self.addr, e),
            Err(_) => warn!("Flushing connection to {} timed out", self.addr),
        }
        self.counters.dropped.fetch_add(pending, Ordering::Relaxed);
        self.drop_queued();
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            trace!("Connection monitor lagging, dropped event: {}", event);
        }
    }
}

async fn monitor_connection(
    endpoint: String,
    mut events: mpsc::Receiver<ConnectionEvent>,
    state: Arc<Mutex<Option<ConnectionEvent>>>,
) {
    while let Some(event) = events.recv().await {
        match &event {
            ConnectionEvent::HandshakeSucceeded => info!("Publisher connected to {}", endpoint),
            ConnectionEvent::Error(e) => debug!("Publisher connection to {}: {}", endpoint, e),
            ConnectionEvent::Disconnected => warn!("Publisher disconnected from {}", endpoint),
            other => trace!("Publisher connection to {}: {}", endpoint, other),
        }
        *state.lock() = Some(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    fn config(endpoint: String) -> BulkConfig {
        BulkConfig {
            reconnect_interval: Duration::from_millis(20),
            ..BulkConfig::new(endpoint.parse().unwrap())
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        let publisher = BulkPublisher::open(config(endpoint), &CancellationToken::new());

        let (stream, _) = listener.accept().await.unwrap();
        let mut subscriber = wire::accept(stream, SocketKind::Sub).await.unwrap();
        wait_for(|| publisher.connection_state() == Some(ConnectionEvent::HandshakeSucceeded))
            .await;

        publisher.publish("docker-log", "line one").unwrap();
        let message = subscriber.next().await.unwrap().unwrap();
        assert_eq!(
            message,
            vec![Bytes::from("docker-log"), Bytes::from("line one")]
        );
        assert_eq!(publisher.sent(), 1);
        publisher.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_subscriber_never_blocks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        drop(listener);

        let publisher = BulkPublisher::open(
            BulkConfig {
                queue_depth: 4,
                ..config(endpoint)
            },
            &CancellationToken::new(),
        );
        let mut rejected = 0;
        for i in 0..100 {
            if let Err(e) = publisher.publish("docker-log", format!("line {i}")) {
                assert_eq!(e, PublishError::WouldBlock);
                rejected += 1;
            }
        }
        assert!(rejected >= 96);
        wait_for(|| matches!(publisher.connection_state(), Some(ConnectionEvent::Error(_))))
            .await;
        wait_for(|| publisher.dropped() == 100).await;
        assert_eq!(publisher.sent(), 0);
        publisher.close().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_subscriber_leaves() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        let publisher = BulkPublisher::open(config(endpoint), &CancellationToken::new());

        let (stream, _) = listener.accept().await.unwrap();
        let subscriber = wire::accept(stream, SocketKind::Sub).await.unwrap();
        drop(subscriber);

        let (stream, _) = listener.accept().await.unwrap();
        let mut subscriber = wire::accept(stream, SocketKind::Sub).await.unwrap();
        wait_for(|| publisher.connection_state() == Some(ConnectionEvent::HandshakeSucceeded))
            .await;
        publisher.publish("t", "after reconnect").unwrap();
        let message = subscriber.next().await.unwrap().unwrap();
        assert_eq!(message[1], Bytes::from("after reconnect"));
        publisher.close().await;
    }

    #[tokio::test]
    async fn test_close_returns_while_subscriber_stops_reading() {
        let cancel = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        let publisher = BulkPublisher::open(config(endpoint), &cancel);

        let (stream, _) = listener.accept().await.unwrap();
        let _stalled = wire::accept(stream, SocketKind::Sub).await.unwrap();
        wait_for(|| publisher.connection_state() == Some(ConnectionEvent::HandshakeSucceeded))
            .await;

        let payload = Bytes::from(vec![b'x'; 1024 * 1024]);
        for _ in 0..64 {
            publisher.publish("docker-log", payload.clone()).unwrap();
        }
        sleep(Duration::from_millis(200)).await;

        cancel.cancel();
        let closed = timeout(Duration::from_secs(5), publisher.close()).await;
        assert!(closed.is_ok(), "close blocked on a subscriber that never reads");
    }

    #[tokio::test]
    async fn test_dropped_counts_frames_left_behind_by_stalled_subscriber() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        let publisher = BulkPublisher::open(config(endpoint), &CancellationToken::new());

        let (stream, _) = listener.accept().await.unwrap();
        let _stalled = wire::accept(stream, SocketKind::Sub).await.unwrap();
        wait_for(|| publisher.connection_state() == Some(ConnectionEvent::HandshakeSucceeded))
            .await;

        let payload = Bytes::from(vec![b'x'; 1024 * 1024]);
        for _ in 0..32 {
            publisher.publish("docker-log", payload.clone()).unwrap();
        }
        sleep(Duration::from_millis(200)).await;

        let counters = Arc::clone(&publisher.counters);
        timeout(Duration::from_secs(5), publisher.close())
            .await
            .unwrap();
        let sent = counters.sent.load(Ordering::Relaxed);
        let dropped = counters.dropped.load(Ordering::Relaxed);
        assert!(dropped > 0);
        assert_eq!(sent + dropped, 32);
    }

    #[tokio::test]
    async fn test_publish_after_cancel_is_closed() {
        let cancel = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        drop(listener);
        let publisher = BulkPublisher::open(config(endpoint), &cancel);

        cancel.cancel();
        wait_for(|| publisher.publish("t", "x") == Err(PublishError::Closed)).await;
        publisher.close().await;
    }
}
