// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::constants::STORE_GC_INTERVAL;
use crate::sample::{MonitorSample, SourceTag};
use crate::store::{MonitorStore, StoreStats};

#[derive(Debug)]
pub enum StoreCommand {
    InsertBatch(Vec<MonitorSample>),
    InsertTag(SourceTag),
    Snapshot {
        service_id: String,
        response_tx: oneshot::Sender<Option<Vec<MonitorSample>>>,
    },
    RecentTags(oneshot::Sender<Vec<SourceTag>>),
    Stats(oneshot::Sender<StoreStats>),
    Shutdown,
}

#[derive(Clone)]
pub struct MonitorStoreHandle {
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl MonitorStoreHandle {
    pub fn insert_batch(
        &self,
        samples: Vec<MonitorSample>,
    ) -> Result<(), mpsc::error::SendError<StoreCommand>> {
        self.tx.send(StoreCommand::InsertBatch(samples))
    }

    pub fn insert_tag(&self, tag: SourceTag) -> Result<(), mpsc::error::SendError<StoreCommand>> {
        self.tx.send(StoreCommand::InsertTag(tag))
    }

    pub async fn snapshot(&self, service_id: &str) -> Result<Option<Vec<MonitorSample>>, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Snapshot {
                service_id: service_id.to_string(),
                response_tx,
            })
            .map_err(|e| format!("Failed to send snapshot command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive snapshot response: {}", e))
    }

    pub async fn recent_tags(&self) -> Result<Vec<SourceTag>, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::RecentTags(response_tx))
            .map_err(|e| format!("Failed to send recent_tags command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive recent_tags response: {}", e))
    }

    pub async fn stats(&self) -> Result<StoreStats, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Stats(response_tx))
            .map_err(|e| format!("Failed to send stats command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive stats response: {}", e))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<StoreCommand>> {
        self.tx.send(StoreCommand::Shutdown)
    }
}

/// Owns the [`MonitorStore`] and applies commands from its handles in order.
pub struct MonitorStoreService {
    store: MonitorStore,
    rx: mpsc::UnboundedReceiver<StoreCommand>,
}

impl MonitorStoreService {
    pub fn new() -> (Self, MonitorStoreHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            store: MonitorStore::new(),
            rx,
        };
        (service, MonitorStoreHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Monitor store service started");

        let mut gc_tick = interval(STORE_GC_INTERVAL);
        gc_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        gc_tick.tick().await;

        loop {
            let command = tokio::select! {
                command = self.rx.recv() => command,
                _ = gc_tick.tick() => {
                    let removed = self.store.gc(Instant::now().into_std());
                    if !removed.is_empty() {
                        info!("Monitor store collected {} idle services", removed.len());
                    }
                    continue;
                }
            };
            let Some(command) = command else {
                break;
            };

            match command {
                StoreCommand::InsertBatch(samples) => {
                    let count = samples.len();
                    if !self.store.insert_batch(samples, Instant::now().into_std()) {
                        debug!("Ignored monitor batch of {} samples", count);
                    }
                }

                StoreCommand::InsertTag(tag) => self.store.insert_tag(tag),

                StoreCommand::Snapshot {
                    service_id,
                    response_tx,
                } => {
                    let snapshot = self.store.snapshot(&service_id, Instant::now().into_std());
                    if response_tx.send(snapshot).is_err() {
                        error!("Failed to send snapshot response - receiver dropped");
                    }
                }

                StoreCommand::RecentTags(response_tx) => {
                    if response_tx.send(self.store.recent_tags()).is_err() {
                        error!("Failed to send recent_tags response - receiver dropped");
                    }
                }

                StoreCommand::Stats(response_tx) => {
                    if response_tx.send(self.store.stats()).is_err() {
                        error!("Failed to send stats response - receiver dropped");
                    }
                }

                StoreCommand::Shutdown => {
                    debug!("Monitor store service shutting down");
                    break;
                }
            }
        }

        debug!("Monitor store service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SERVICE_IDLE_TTL;
    use std::time::Duration;

    fn sample(service: &str, key: &str) -> MonitorSample {
        MonitorSample {
            service_id: service.to_string(),
            port: "8080".to_string(),
            host_name: "node-a".to_string(),
            message_type: "http".to_string(),
            key: key.to_string(),
            cumulative_time: 1.5,
            average_time: 0.5,
            max_time: 0.9,
            count: 3,
            abnormal_count: 0,
        }
    }

    #[tokio::test]
    async fn test_store_service_basic_flow() {
        let (service, handle) = MonitorStoreService::new();
        let service_task = tokio::spawn(service.run());

        handle
            .insert_batch(vec![sample("svc", "/a"), sample("svc", "/b")])
            .expect("Failed to insert batch");
        handle
            .insert_tag(SourceTag::parse("1 nginx hello"))
            .expect("Failed to insert tag");

        let snapshot = handle
            .snapshot("svc")
            .await
            .expect("Failed to snapshot")
            .expect("service should exist");
        assert_eq!(snapshot.len(), 2);
        assert!(handle
            .snapshot("missing")
            .await
            .expect("Failed to snapshot")
            .is_none());

        let stats = handle.stats().await.expect("Failed to get stats");
        assert_eq!(stats.services, 1);
        assert_eq!(stats.samples_total, 2);
        assert_eq!(stats.tags_total, 1);
        let tags = handle.recent_tags().await.expect("Failed to get tags");
        assert_eq!(tags[0].source, "nginx");

        handle.shutdown().expect("Failed to shutdown");
        service_task.await.expect("Service task failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_service_collects_idle_services() {
        let (service, handle) = MonitorStoreService::new();
        let service_task = tokio::spawn(service.run());

        handle
            .insert_batch(vec![sample("svc", "/a")])
            .expect("Failed to insert batch");
        assert_eq!(handle.stats().await.expect("stats").services, 1);

        tokio::time::sleep(SERVICE_IDLE_TTL + STORE_GC_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(handle.stats().await.expect("stats").services, 0);

        handle.shutdown().expect("Failed to shutdown");
        service_task.await.expect("Service task failed");
    }

    #[tokio::test]
    async fn test_store_service_stops_when_handles_drop() {
        let (service, handle) = MonitorStoreService::new();
        let service_task = tokio::spawn(service.run());
        drop(handle);
        service_task.await.expect("Service task failed");
    }
}
