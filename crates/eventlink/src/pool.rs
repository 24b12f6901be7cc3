// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Supervised pool of bulk publishing workers.
//!
//! Each worker owns one [`BulkPublisher`] and, once per interval, ships every
//! complete line waiting in the shared hand-off buffer. Workers report to a
//! central collector. Shutdown cancels every worker and joins them all.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::SharedBuffer;
use crate::constants::MIN_SEND_INTERVAL;
use crate::bulk::{BulkConfig, BulkPublisher};
use crate::errors::PublishError;
use crate::util::Endpoint;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub endpoint: Endpoint,
    pub workers: usize,
    pub interval: Duration,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReport {
    Started {
        worker: usize,
    },
    PublishFailed {
        worker: usize,
        error: PublishError,
    },
    Stopped {
        worker: usize,
        ticks: u64,
        sent: u64,
        dropped: u64,
    },
}

/// Everything the collector saw, in arrival order.
#[derive(Debug, Default)]
pub struct PoolSummary {
    pub reports: Vec<WorkerReport>,
}

impl PoolSummary {
    pub fn stopped_workers(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r, WorkerReport::Stopped { .. }))
            .count()
    }

    pub fn publish_failures(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r, WorkerReport::PublishFailed { .. }))
            .count()
    }
}

pub struct PublisherPool {
    tasks: JoinSet<()>,
    cancel_token: CancellationToken,
    collector: JoinHandle<PoolSummary>,
}

impl PublisherPool {
    /// Spawns `config.workers` workers (at least one) draining `source`. A
    /// zero interval is raised to [`MIN_SEND_INTERVAL`].
    pub fn start(
        mut config: PoolConfig,
        source: Arc<SharedBuffer>,
        cancel_token: &CancellationToken,
    ) -> Self {
        if config.interval < MIN_SEND_INTERVAL {
            warn!(
                "Publishing interval {:?} too short, using {:?}",
                config.interval, MIN_SEND_INTERVAL
            );
            config.interval = MIN_SEND_INTERVAL;
        }
        let cancel_token = cancel_token.child_token();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let collector = tokio::spawn(collect(reports_rx));

        let mut tasks = JoinSet::new();
        for worker in 0..config.workers.max(1) {
            let publisher =
                BulkPublisher::open(BulkConfig::new(config.endpoint.clone()), &cancel_token);
            tasks.spawn(run_worker(
                worker,
                publisher,
                config.clone(),
                Arc::clone(&source),
                reports_tx.clone(),
                cancel_token.clone(),
            ));
        }
        info!(
            "Started {} publishing workers for {}",
            tasks.len(),
            config.endpoint
        );

        Self {
            tasks,
            cancel_token,
            collector,
        }
    }

    /// Stops every worker, waits for all of them and returns the collected
    /// reports.
    pub async fn shutdown(mut self) -> PoolSummary {
        self.cancel_token.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!("Publishing worker ended abnormally: {}", e);
            }
        }
        match self.collector.await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Worker report collector failed: {}", e);
                PoolSummary::default()
            }
        }
    }
}

async fn collect(mut rx: mpsc::UnboundedReceiver<WorkerReport>) -> PoolSummary {
    let mut summary = PoolSummary::default();
    while let Some(report) = rx.recv().await {
        match &report {
            WorkerReport::Started { worker } => debug!("Worker {} started", worker),
            WorkerReport::PublishFailed { worker, error } => {
                debug!("Worker {} dropped a message: {}", worker, error)
            }
            WorkerReport::Stopped {
                worker,
                ticks,
                sent,
                dropped,
            } => info!(
                "Worker {} stopped after {} ticks: {} sent, {} dropped",
                worker, ticks, sent, dropped
            ),
        }
        summary.reports.push(report);
    }
    summary
}

async fn run_worker(
    worker: usize,
    publisher: BulkPublisher,
    config: PoolConfig,
    source: Arc<SharedBuffer>,
    reports: mpsc::UnboundedSender<WorkerReport>,
    cancel_token: CancellationToken,
) {
    let report = |r: WorkerReport| {
        if reports.send(r).is_err() {
            warn!("Worker {} report collector is gone", worker);
        }
    };
    report(WorkerReport::Started { worker });

    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel_token.cancelled() => break,
        }
        ticks += 1;
        while let Some(line) = source.take_line() {
            if line.is_empty() {
                continue;
            }
            if let Err(error) = publisher.publish(&config.topic, line) {
                report(WorkerReport::PublishFailed { worker, error });
            }
        }
    }

    let (sent, dropped) = (publisher.sent(), publisher.dropped());
    publisher.close().await;
    report(WorkerReport::Stopped {
        worker,
        ticks,
        sent,
        dropped,
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::wire::{self, SocketKind};
    use bytes::Bytes;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_pool_keeps_looping_without_subscriber() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        drop(listener);

        let source = Arc::new(SharedBuffer::new());
        let pool = PublisherPool::start(
            PoolConfig {
                endpoint: endpoint.parse().unwrap(),
                workers: 2,
                interval: Duration::from_millis(20),
                topic: "docker-log".to_string(),
            },
            Arc::clone(&source),
            &CancellationToken::new(),
        );
        source.write_str("lost line\n");
        sleep(Duration::from_millis(300)).await;

        let summary = pool.shutdown().await;
        assert_eq!(summary.stopped_workers(), 2);
        for report in &summary.reports {
            if let WorkerReport::Stopped { ticks, sent, .. } = report {
                assert!(*ticks >= 5, "worker only ticked {ticks} times");
                assert_eq!(*sent, 0);
            }
        }
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn test_pool_zero_interval_still_ships() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        let source = Arc::new(SharedBuffer::new());
        let pool = PublisherPool::start(
            PoolConfig {
                endpoint: endpoint.parse().unwrap(),
                workers: 1,
                interval: Duration::ZERO,
                topic: "docker-log".to_string(),
            },
            Arc::clone(&source),
            &CancellationToken::new(),
        );

        let (stream, _) = listener.accept().await.unwrap();
        let mut subscriber = wire::accept(stream, SocketKind::Sub).await.unwrap();
        source.write_str("ticked\n");
        let message = timeout(Duration::from_secs(5), subscriber.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message[1], Bytes::from("ticked"));

        let summary = pool.shutdown().await;
        assert_eq!(summary.stopped_workers(), 1);
    }

    #[tokio::test]
    async fn test_pool_ships_complete_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        let source = Arc::new(SharedBuffer::new());
        let pool = PublisherPool::start(
            PoolConfig {
                endpoint: endpoint.parse().unwrap(),
                workers: 1,
                interval: Duration::from_millis(10),
                topic: "docker-log".to_string(),
            },
            Arc::clone(&source),
            &CancellationToken::new(),
        );

        let (stream, _) = listener.accept().await.unwrap();
        let mut subscriber = wire::accept(stream, SocketKind::Sub).await.unwrap();
        source.write_str("first\nsecond\npartial");

        let mut payloads = Vec::new();
        while payloads.len() < 2 {
            let message = timeout(Duration::from_secs(5), subscriber.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(message[0], Bytes::from("docker-log"));
            payloads.push(message[1].clone());
        }
        assert_eq!(payloads, vec![Bytes::from("first"), Bytes::from("second")]);
        assert_eq!(source.to_string_lossy(), "partial");

        let summary = pool.shutdown().await;
        assert_eq!(summary.stopped_workers(), 1);
        assert_eq!(summary.publish_failures(), 0);
    }
}
