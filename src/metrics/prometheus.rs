//! # Prometheus Publisher
//!
//! Exposes the agent's liveness gauges on a dedicated HTTP endpoint. Each
//! publisher owns its own registry and server so a configuration reload can
//! shut the old publisher down and start a fresh one.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{error, info};
use validator::Validate;

use crate::errors::{AgentError, Result};
use crate::metrics::Publisher;

pub const DEFAULT_PROMETHEUS_PORT: u16 = 2112;

fn default_port() -> u16 {
    DEFAULT_PROMETHEUS_PORT
}

fn default_path() -> String {
    "/metrics".to_string()
}

/// Configuration of the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusPublisherConfig {
    #[serde(default = "default_port")]
    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    #[serde(default = "default_path")]
    #[validate(length(min = 1, message = "Path cannot be empty"))]
    pub path: String,
}

impl Default for PrometheusPublisherConfig {
    fn default() -> Self {
        Self { port: default_port(), path: default_path() }
    }
}

struct ServerHandle {
    shutdown: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

/// Publishes snapshot gauges from its own registry over HTTP.
pub struct PrometheusPublisher {
    config: PrometheusPublisherConfig,
    registry: Registry,
    last_snapshot_time: Gauge,
    last_successful_snapshot_time: Gauge,
    last_snapshot_success: Gauge,
    next_snapshot_time: Gauge,
    last_snapshot_size: Gauge,
    server: Option<ServerHandle>,
}

impl PrometheusPublisher {
    pub fn new(config: PrometheusPublisherConfig) -> Result<Self> {
        let registry = Registry::new();

        let gauge = |name: &str, help: &str| -> Result<Gauge> {
            let gauge = Gauge::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            last_snapshot_time: gauge(
                "vrsa_last_snapshot_time",
                "Unix timestamp of the last snapshot time",
            )?,
            last_successful_snapshot_time: gauge(
                "vrsa_last_successful_snapshot_time",
                "Unix timestamp of the last successful snapshot time",
            )?,
            last_snapshot_success: gauge(
                "vrsa_last_snapshot_success",
                "Returns 1 if the last snapshot was successful and 0 if not",
            )?,
            next_snapshot_time: gauge(
                "vrsa_next_snapshot_time",
                "Unix timestamp of the next scheduled snapshot time",
            )?,
            last_snapshot_size: gauge(
                "vrsa_last_snapshot_size",
                "Size of the last snapshot in bytes",
            )?,
            config,
            registry,
            server: None,
        })
    }
}

#[async_trait]
impl Publisher for PrometheusPublisher {
    fn publish_next_snapshot(&self, next: Option<DateTime<Utc>>) {
        self.next_snapshot_time.set(next.map_or(0.0, |next| next.timestamp() as f64));
    }

    fn publish_success(&self, timestamp: DateTime<Utc>, size: u64) {
        self.last_snapshot_time.set(timestamp.timestamp() as f64);
        self.last_successful_snapshot_time.set(timestamp.timestamp() as f64);
        self.last_snapshot_size.set(size as f64);
        self.last_snapshot_success.set(1.0);
    }

    fn publish_failure(&self, timestamp: DateTime<Utc>) {
        self.last_snapshot_time.set(timestamp.timestamp() as f64);
        self.last_snapshot_success.set(0.0);
    }

    async fn start(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }

        if !self.config.path.starts_with('/') {
            return Err(AgentError::metrics(format!(
                "metrics path '{}' must start with '/'",
                self.config.path
            )));
        }

        let router = Router::new()
            .route(&self.config.path, get(render_metrics))
            .with_state(self.registry.clone());

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(|err| {
                AgentError::Metrics {
                    message: format!("could not bind metrics endpoint on port {}", self.config.port),
                    source: Some(Box::new(err)),
                }
            })?;

        info!(
            port = self.config.port,
            path = %self.config.path,
            "Serving prometheus metrics"
        );

        let (shutdown, rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(err) = serve.await {
                error!(error = %err, "Failed to serve prometheus metrics");
            }
        });

        self.server = Some(ServerHandle { shutdown, join });
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(server) = self.server.take() {
            let _ = server.shutdown.send(());
            server.join.await.map_err(|err| AgentError::Metrics {
                message: "metrics endpoint did not shut down cleanly".to_string(),
                source: Some(Box::new(err)),
            })?;
        }
        Ok(())
    }
}

async fn render_metrics(State(registry): State<Registry>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timestamp(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_gauges_reflect_success() {
        let publisher = PrometheusPublisher::new(PrometheusPublisherConfig::default()).unwrap();

        publisher.publish_success(timestamp(1_700_000_000), 4096);
        publisher.publish_next_snapshot(Some(timestamp(1_700_003_600)));

        assert_eq!(publisher.last_snapshot_time.get(), 1_700_000_000.0);
        assert_eq!(publisher.last_successful_snapshot_time.get(), 1_700_000_000.0);
        assert_eq!(publisher.last_snapshot_success.get(), 1.0);
        assert_eq!(publisher.last_snapshot_size.get(), 4096.0);
        assert_eq!(publisher.next_snapshot_time.get(), 1_700_003_600.0);
    }

    #[test]
    fn test_gauges_reflect_failure() {
        let publisher = PrometheusPublisher::new(PrometheusPublisherConfig::default()).unwrap();

        publisher.publish_success(timestamp(1_700_000_000), 4096);
        publisher.publish_failure(timestamp(1_700_000_060));

        assert_eq!(publisher.last_snapshot_time.get(), 1_700_000_060.0);
        // the successful-snapshot gauge keeps its previous value
        assert_eq!(publisher.last_successful_snapshot_time.get(), 1_700_000_000.0);
        assert_eq!(publisher.last_snapshot_success.get(), 0.0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_gauges() {
        let config = PrometheusPublisherConfig { port: 0, ..Default::default() };
        let publisher = PrometheusPublisher::new(config).unwrap();
        publisher.publish_success(timestamp(1_700_000_000), 42);

        let rendered = {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            encoder.encode(&publisher.registry.gather(), &mut buffer).unwrap();
            String::from_utf8(buffer).unwrap()
        };

        assert!(rendered.contains("vrsa_last_snapshot_size 42"));
        assert!(rendered.contains("vrsa_last_snapshot_success 1"));
    }
}
