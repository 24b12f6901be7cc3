// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process store for ingested monitoring samples.
//!
//! Samples are grouped per service into a barrel. A barrel keeps the latest
//! batch reported by each host; host batches older than
//! [`HOST_CACHE_TTL`](crate::constants::HOST_CACHE_TTL) no longer contribute
//! to snapshots. A snapshot merges the live host batches by key and keeps the
//! most expensive entries.

use std::collections::VecDeque;
use std::time::Instant;

use hashbrown::HashMap;
use tracing::{debug, info};

use crate::constants::{HOST_CACHE_TTL, SERVICE_IDLE_TTL, SNAPSHOT_TOP_N, TAG_HISTORY};
use crate::sample::{MonitorSample, SourceTag};
use crate::util::round_to;

#[derive(Debug)]
struct HostBatch {
    host_name: String,
    updated: Instant,
    samples: Vec<MonitorSample>,
}

#[derive(Debug)]
struct Barrel {
    hosts: Vec<HostBatch>,
    updated: Instant,
}

impl Barrel {
    fn new(now: Instant) -> Self {
        Self {
            hosts: Vec::new(),
            updated: now,
        }
    }

    fn insert(&mut self, host_name: &str, samples: Vec<MonitorSample>, now: Instant) {
        self.updated = now;
        match self.hosts.iter_mut().find(|h| h.host_name == host_name) {
            Some(host) => {
                host.updated = now;
                host.samples = samples;
            }
            None => self.hosts.push(HostBatch {
                host_name: host_name.to_string(),
                updated: now,
                samples,
            }),
        }
        self.hosts
            .retain(|h| now.saturating_duration_since(h.updated) <= HOST_CACHE_TTL);
    }

    fn snapshot(&self, now: Instant) -> Vec<MonitorSample> {
        let mut live = self
            .hosts
            .iter()
            .filter(|h| now.saturating_duration_since(h.updated) <= HOST_CACHE_TTL);
        let Some(first) = live.next() else {
            return Vec::new();
        };
        let mut merged = first.samples.clone();
        for host in live {
            merged = merge(merged, &host.samples);
        }
        merged.sort_by(|a, b| b.cumulative_time.total_cmp(&a.cumulative_time));
        merged.truncate(SNAPSHOT_TOP_N);
        merged
    }
}

/// Combines two host batches entry by entry, matching on `key`.
fn merge(base: Vec<MonitorSample>, other: &[MonitorSample]) -> Vec<MonitorSample> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(base.len());
    let mut merged = Vec::with_capacity(base.len() + other.len());
    for sample in base {
        match index.get(&sample.key) {
            Some(&i) => merged[i] = sample,
            None => {
                index.insert(sample.key.clone(), merged.len());
                merged.push(sample);
            }
        }
    }
    for sample in other {
        match index.get(&sample.key) {
            Some(&i) => {
                let entry: &mut MonitorSample = &mut merged[i];
                entry.count += sample.count;
                entry.abnormal_count += sample.abnormal_count;
                entry.average_time = round_to((entry.average_time + sample.average_time) / 2.0, 2);
                entry.cumulative_time = round_to(entry.cumulative_time + sample.cumulative_time, 2);
                entry.max_time = entry.max_time.max(sample.max_time);
            }
            None => {
                index.insert(sample.key.clone(), merged.len());
                merged.push(sample.clone());
            }
        }
    }
    merged
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    /// Services currently tracked.
    pub services: usize,
    /// Samples accepted since the store was created.
    pub samples_total: u64,
    /// Tag lines accepted since the store was created.
    pub tags_total: u64,
}

#[derive(Debug, Default)]
pub struct MonitorStore {
    barrels: HashMap<String, Barrel>,
    tags: VecDeque<SourceTag>,
    samples_total: u64,
    tags_total: u64,
}

impl MonitorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a host's latest batch.
    ///
    /// A batch belongs to the service and host named by its first sample.
    /// Returns `false` when the batch was empty or had no service id.
    pub fn insert_batch(&mut self, samples: Vec<MonitorSample>, now: Instant) -> bool {
        let Some(first) = samples.first() else {
            return false;
        };
        if first.service_id.is_empty() {
            debug!("Dropping monitor batch without a service id");
            return false;
        }
        let service_id = first.service_id.clone();
        let host_name = first.host_name.clone();
        self.samples_total += samples.len() as u64;
        self.barrels
            .entry(service_id)
            .or_insert_with(|| Barrel::new(now))
            .insert(&host_name, samples, now);
        true
    }

    pub fn insert_tag(&mut self, tag: SourceTag) {
        if self.tags.len() == TAG_HISTORY {
            self.tags.pop_front();
        }
        self.tags.push_back(tag);
        self.tags_total += 1;
    }

    /// Merged view of a service, sorted by cumulative time, most expensive
    /// first. `None` when the service is unknown.
    pub fn snapshot(&self, service_id: &str, now: Instant) -> Option<Vec<MonitorSample>> {
        self.barrels.get(service_id).map(|b| b.snapshot(now))
    }

    pub fn recent_tags(&self) -> Vec<SourceTag> {
        self.tags.iter().cloned().collect()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            services: self.barrels.len(),
            samples_total: self.samples_total,
            tags_total: self.tags_total,
        }
    }

    /// Drops services that have not been updated within
    /// [`SERVICE_IDLE_TTL`]. Returns the ids that were removed.
    pub fn gc(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .barrels
            .iter()
            .filter(|(_, b)| now.saturating_duration_since(b.updated) > SERVICE_IDLE_TTL)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            info!("Monitor store dropping idle service {}", id);
            self.barrels.remove(id);
        }
        expired
    }
}
