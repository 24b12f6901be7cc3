// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod error;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use std::{env, io};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use eventlink::{
    buffer::SharedBuffer,
    discovery::discover,
    event::Event,
    health::{self, HealthConfig, HealthExporter},
    monitor::{MonitorServer, MonitorServerConfig},
    pool::{PoolConfig, PublisherPool},
    reliable::{EventClient, ReliableConfig},
    store_service::MonitorStoreService,
    util::Endpoint,
};

use crate::config::AgentConfig;
use crate::error::AgentError;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const STDIN_CHUNK: usize = 64 * 1024;
const AGENT_HOST: &str = "0.0.0.0";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("EVENTLINK_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{}", log_level);

    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info"),
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        return;
    }

    debug!("Logging subsystem enabled");

    let config = match AgentConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on eventlink agent startup: {e}");
            return;
        }
    };

    if let Err(e) = run(config).await {
        error!("eventlink agent stopped: {e}");
    }
}

async fn run(config: AgentConfig) -> Result<(), AgentError> {
    let cancel_token = CancellationToken::new();

    // 1. Monitor store
    let (store, store_handle) = MonitorStoreService::new();
    let store_task = tokio::spawn(store.run());

    // 2. Health exporter, reporting unhealthy until everything is up
    let exporter = Arc::new(
        HealthExporter::new(config.service_name.clone()).with_store(store_handle.clone()),
    );
    let listener = health::bind(&HealthConfig {
        host: AGENT_HOST.to_string(),
        port: config.metrics_port,
    })
    .await?;
    let health_task = tokio::spawn(Arc::clone(&exporter).serve(listener, cancel_token.clone()));

    // 3. UDP listener feeding the store
    let monitor = MonitorServer::new(
        &MonitorServerConfig {
            host: config.monitor_host.clone(),
            port: config.monitor_port,
        },
        store_handle.clone(),
        cancel_token.clone(),
    )
    .await?;
    let monitor_task = tokio::spawn(monitor.spin());

    // 4. Bulk publishing of stdin lines, when a broker is known
    let pool = match resolve_publish_endpoint(&config).await? {
        Some(endpoint) => {
            let source = Arc::new(SharedBuffer::new());
            spawn_stdin_reader(Arc::clone(&source));
            Some(PublisherPool::start(
                PoolConfig {
                    endpoint,
                    workers: config.workers,
                    interval: config.send_interval,
                    topic: config.topic.clone(),
                },
                source,
                &cancel_token,
            ))
        }
        None => {
            info!("No publish endpoint configured, bulk publishing disabled");
            None
        }
    };

    exporter.set_health(1.0);
    info!(
        "eventlink agent running: monitor on {}:{}, metrics on port {}",
        config.monitor_host, config.monitor_port, config.metrics_port
    );

    let announce_task = config.event_endpoint.clone().map(|endpoint| {
        tokio::spawn(announce(
            endpoint,
            config.service_name.clone(),
            cancel_token.clone(),
        ))
    });

    let signal = tokio::signal::ctrl_c().await;
    info!("Shutting down eventlink agent");
    exporter.set_health(0.0);
    cancel_token.cancel();

    if let Some(task) = announce_task {
        if let Err(e) = task.await {
            warn!("Start event task ended abnormally: {e}");
        }
    }

    if let Some(pool) = pool {
        let summary = pool.shutdown().await;
        debug!(
            "Publishing pool stopped: {} workers, {} dropped publishes",
            summary.stopped_workers(),
            summary.publish_failures()
        );
    }
    if let Err(e) = monitor_task.await {
        warn!("Monitor listener ended abnormally: {e}");
    }
    if store_handle.shutdown().is_ok() {
        let _ = store_task.await;
    }
    match health_task.await {
        Ok(Err(e)) => warn!("Health exporter failed: {e}"),
        Err(e) => warn!("Health exporter ended abnormally: {e}"),
        Ok(Ok(())) => {}
    }

    signal.map_err(AgentError::Signal)
}

async fn resolve_publish_endpoint(config: &AgentConfig) -> Result<Option<Endpoint>, AgentError> {
    if let Some(endpoint) = &config.publish_endpoint {
        return Ok(Some(endpoint.clone()));
    }
    match &config.discovery_url {
        Some(url) => Ok(Some(discover(url, DISCOVERY_TIMEOUT).await?)),
        None => Ok(None),
    }
}

/// Reports the agent start on the request/reply channel. Failure is logged,
/// never fatal.
async fn announce(endpoint: Endpoint, service_name: String, cancel_token: CancellationToken) {
    let client = EventClient::new(ReliableConfig::new(endpoint), cancel_token);
    let event = Event::new(format!("{service_name} agent started"));
    match client.send(&event).await {
        Ok((_, report)) => debug!(
            "Start event {} acknowledged after {} attempts",
            event.event_id(),
            report.attempts
        ),
        Err(e) => warn!("Start event not delivered: {e}"),
    }
}

/// Copies stdin into the hand-off buffer the publishing workers drain. Runs
/// on a detached thread so a blocked read never holds up shutdown.
fn spawn_stdin_reader(source: Arc<SharedBuffer>) {
    let spawned = std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || match copy_lines(io::stdin().lock(), &source) {
            Ok(n) => debug!("stdin closed after {n} bytes"),
            Err(e) => error!("Failed to read stdin: {e}"),
        });
    if let Err(e) = spawned {
        error!("Failed to start stdin reader: {e}");
    }
}

/// Copies `reader` into `source` until end of stream. A final line without a
/// terminator gets one, so workers ship it too.
fn copy_lines<R: Read>(mut reader: R, source: &SharedBuffer) -> io::Result<usize> {
    let mut chunk = vec![0u8; STDIN_CHUNK];
    let mut total = 0;
    let mut last = None;
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => {
                if last.is_some_and(|b| b != b'\n') {
                    source.write_byte(b'\n');
                }
                return Ok(total);
            }
            Ok(n) => {
                source.write_bytes(&chunk[..n]);
                last = Some(chunk[n - 1]);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_lines_terminates_final_line() {
        let source = SharedBuffer::new();
        let copied = copy_lines(&b"first\nlast"[..], &source).unwrap();
        assert_eq!(copied, 10);
        assert_eq!(source.take_line(), Some(b"first".to_vec()));
        assert_eq!(source.take_line(), Some(b"last".to_vec()));
        assert!(source.is_empty());
    }

    #[test]
    fn test_copy_lines_keeps_terminated_input() {
        let source = SharedBuffer::new();
        copy_lines(&b"one\ntwo\n"[..], &source).unwrap();
        assert_eq!(source.to_string_lossy(), "one\ntwo\n");

        let empty = SharedBuffer::new();
        assert_eq!(copy_lines(&b""[..], &empty).unwrap(), 0);
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_announce_stops_when_cancelled() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint: Endpoint = format!("tcp://{}", listener.local_addr().unwrap())
            .parse()
            .unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(announce(endpoint, "eventlog".to_string(), cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(1500), task)
            .await
            .unwrap()
            .unwrap();
    }
}
