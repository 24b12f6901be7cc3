// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pull-based health exporter.
//!
//! Holds one process-wide health value and renders it, labeled with the
//! service name, in Prometheus text format on every scrape alongside a scrape
//! counter. When a monitor store is attached, its service and sample counts are
//! rendered too. The recorder belongs to the exporter and is never installed
//! globally.

use std::convert::Infallible;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::HealthError;
use crate::store_service::MonitorStoreHandle;

pub const HEALTH_METRIC: &str = "eventlink_service_health";
pub const SCRAPE_METRIC: &str = "eventlink_scrape_count";
pub const STORE_SERVICES_METRIC: &str = "eventlink_monitor_store_barrel_count";
pub const STORE_SAMPLES_METRIC: &str = "eventlink_monitor_store_log_count";

const METRICS_PATH: &str = "/metrics";
const HEALTH_PATH: &str = "/health";

pub struct HealthConfig {
    pub host: String,
    pub port: u16,
}

/// Shared cell holding the last health value set. Last writer wins.
#[derive(Clone, Debug, Default)]
pub struct HealthHandle {
    bits: Arc<AtomicU64>,
}

impl HealthHandle {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

pub struct HealthExporter {
    service_name: String,
    health: HealthHandle,
    store: Option<MonitorStoreHandle>,
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl HealthExporter {
    pub fn new(service_name: impl Into<String>) -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        Self {
            service_name: service_name.into(),
            health: HealthHandle::default(),
            store: None,
            recorder,
            handle,
        }
    }

    /// Reports the store's service and sample counts on every scrape.
    pub fn with_store(mut self, store: MonitorStoreHandle) -> Self {
        self.store = Some(store);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// A handle other components use to report health.
    pub fn health(&self) -> HealthHandle {
        self.health.clone()
    }

    pub fn set_health(&self, value: f64) {
        self.health.set(value);
    }

    /// Counts the scrape and renders the current values. Store gauges keep
    /// their last value when the store does not answer.
    pub async fn scrape(&self) -> String {
        let value = self.health.get();
        let stats = match &self.store {
            Some(store) => match store.stats().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!("Monitor store stats unavailable: {}", e);
                    None
                }
            },
            None => None,
        };
        metrics::with_local_recorder(&self.recorder, || {
            metrics::counter!(SCRAPE_METRIC).increment(1);
            metrics::gauge!(HEALTH_METRIC, "service" => self.service_name.clone()).set(value);
            if let Some(stats) = stats {
                metrics::gauge!(STORE_SERVICES_METRIC, "service" => self.service_name.clone())
                    .set(stats.services as f64);
                metrics::gauge!(STORE_SAMPLES_METRIC, "service" => self.service_name.clone())
                    .set(stats.samples_total as f64);
            }
        });
        self.handle.render()
    }

    /// Serves `GET /metrics` and `GET /health` until cancelled.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel_token: CancellationToken,
    ) -> Result<(), HealthError> {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();
        if let Ok(addr) = listener.local_addr() {
            info!("Health exporter listening on {}", addr);
        }

        let service = service_fn(move |req: Request<Incoming>| {
            let exporter = Arc::clone(&self);
            let method = req.method().clone();
            let path = req.uri().path().to_string();
            async move { Ok::<_, Infallible>(exporter.route(&method, &path).await) }
        });

        loop {
            let conn = tokio::select! {
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Health exporter accept failed: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Health connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
                _ = cancel_token.cancelled() => {
                    debug!("Health exporter stopping");
                    joinset.abort_all();
                    return Ok(());
                }
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Health connection error: {e}");
                }
            });
        }
    }

    async fn route(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        let (status, content_type, body) = match (method, path) {
            (&Method::GET, METRICS_PATH) => (
                StatusCode::OK,
                "text/plain; version=0.0.4",
                Bytes::from(self.scrape().await),
            ),
            (&Method::GET, HEALTH_PATH) => (StatusCode::OK, "text/plain", Bytes::from_static(b"ok\n")),
            _ => (
                StatusCode::NOT_FOUND,
                "text/plain",
                Bytes::from_static(b"not found\n"),
            ),
        };
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
        response
    }
}

/// Binds the exporter's TCP listener.
pub async fn bind(config: &HealthConfig) -> Result<TcpListener, HealthError> {
    let addr = format!("{}:{}", config.host, config.port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| HealthError::Bind { addr, source })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sample::MonitorSample;
    use crate::store_service::MonitorStoreService;

    #[test]
    fn test_health_handle_last_writer_wins() {
        let handle = HealthHandle::default();
        assert_eq!(handle.get(), 0.0);
        let other = handle.clone();
        handle.set(1.0);
        other.set(0.5);
        assert_eq!(handle.get(), 0.5);
    }

    #[tokio::test]
    async fn test_scrape_counts_and_labels() {
        let exporter = HealthExporter::new("eventlog");
        exporter.set_health(1.0);

        let first = exporter.scrape().await;
        assert!(first.contains("eventlink_service_health{service=\"eventlog\"} 1"));
        assert!(first.contains("eventlink_scrape_count 1"));

        exporter.set_health(0.0);
        let second = exporter.scrape().await;
        assert!(second.contains("eventlink_service_health{service=\"eventlog\"} 0"));
        assert!(second.contains("eventlink_scrape_count 2"));
    }

    #[tokio::test]
    async fn test_exporters_do_not_share_state() {
        let a = HealthExporter::new("a");
        let b = HealthExporter::new("b");
        a.scrape().await;
        a.scrape().await;
        let rendered = b.scrape().await;
        assert!(rendered.contains("eventlink_scrape_count 1"));
        assert!(!rendered.contains("service=\"a\""));
        assert!(!rendered.contains(STORE_SERVICES_METRIC));
    }

    #[tokio::test]
    async fn test_scrape_reports_store_counts() {
        let (service, store) = MonitorStoreService::new();
        let service_task = tokio::spawn(service.run());
        let exporter = HealthExporter::new("eventlog").with_store(store.clone());

        let batch: Vec<MonitorSample> = serde_json::from_str(
            r#"[{"ServiceID":"api","Port":"5000","MessageType":"http","Key":"/a","CumulativeTime":0.1,"AverageTime":0.1,"MaxTime":0.1,"Count":1,"AbnormalCount":0},
                {"ServiceID":"api","Port":"5000","MessageType":"http","Key":"/b","CumulativeTime":0.2,"AverageTime":0.2,"MaxTime":0.2,"Count":2,"AbnormalCount":0}]"#,
        )
        .unwrap();
        store.insert_batch(batch).unwrap();

        let rendered = exporter.scrape().await;
        assert!(rendered.contains("eventlink_monitor_store_barrel_count{service=\"eventlog\"} 1"));
        assert!(rendered.contains("eventlink_monitor_store_log_count{service=\"eventlog\"} 2"));

        store.shutdown().unwrap();
        service_task.await.unwrap();
        let after_shutdown = exporter.scrape().await;
        assert!(after_shutdown.contains("eventlink_scrape_count 2"));
    }

    #[tokio::test]
    async fn test_serve_metrics_and_health() {
        let exporter = Arc::new(HealthExporter::new("eventlog"));
        exporter.set_health(1.0);
        let listener = bind(&HealthConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        })
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(Arc::clone(&exporter).serve(listener, cancel.clone()));

        let client = reqwest::Client::new();
        let metrics = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .unwrap();
        assert_eq!(metrics.status(), reqwest::StatusCode::OK);
        let body = metrics.text().await.unwrap();
        assert!(body.contains("eventlink_service_health{service=\"eventlog\"} 1"));

        let health = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(health.text().await.unwrap(), "ok\n");

        let missing = client
            .get(format!("http://{addr}/nope"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = bind(&HealthConfig {
            host: "127.0.0.1".to_string(),
            port: taken.local_addr().unwrap().port(),
        })
        .await;
        assert!(matches!(result, Err(HealthError::Bind { .. })));
    }
}
