// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Deadline for one request/reply round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);
/// Total attempts the reliable publisher makes before giving up.
pub const MAX_RETRIES: u32 = 3;
/// Delay between connection attempts while a peer is unreachable.
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// Largest datagram the monitoring listener accepts.
pub const MAX_DATAGRAM_SIZE: usize = 65535;
/// Pause after a failed receive before the listener tries again.
pub const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Frames buffered per bulk connection before publishes are dropped.
pub const PUBLISH_QUEUE_DEPTH: usize = 1024;
/// Shortest pause between publishing rounds of a pool worker.
pub const MIN_SEND_INTERVAL: Duration = Duration::from_millis(1);
/// Longest a closing bulk publisher spends writing out its queue.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
/// Connection events buffered for the monitor task.
pub const CONNECTION_EVENT_DEPTH: usize = 64;

/// A host's latest batch is discarded after this long without an update.
pub const HOST_CACHE_TTL: Duration = Duration::from_secs(30);
/// A service with no updates for this long is dropped from the store.
pub const SERVICE_IDLE_TTL: Duration = Duration::from_secs(180);
/// How often the store sweeps idle services.
pub const STORE_GC_INTERVAL: Duration = Duration::from_secs(30);
/// Entries kept per service snapshot, ordered by cumulative time.
pub const SNAPSHOT_TOP_N: usize = 20;
/// Tag lines retained by the store for inspection.
pub const TAG_HISTORY: usize = 256;

pub const DEFAULT_MONITOR_PORT: u16 = 6166;
pub const DEFAULT_SERVICE_NAME: &str = "eventlog";
