//! # Metrics Collection
//!
//! Records the outcome of every snapshot cycle for external observers. The
//! [`Collector`] fans outcomes out to its [`Publisher`]s; the only built-in
//! publisher exposes Prometheus gauges over HTTP.

pub mod prometheus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{AgentError, Result};

pub use self::prometheus::{PrometheusPublisher, PrometheusPublisherConfig};

/// The `metrics` configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CollectorConfig {
    #[validate(nested)]
    pub prometheus: Option<PrometheusPublisherConfig>,
}

/// Sink for snapshot-cycle outcomes.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn publish_next_snapshot(&self, next: Option<DateTime<Utc>>);
    fn publish_success(&self, timestamp: DateTime<Utc>, size: u64);
    fn publish_failure(&self, timestamp: DateTime<Utc>);

    async fn start(&mut self) -> Result<()>;
    async fn shutdown(&mut self) -> Result<()>;
}

/// Fans snapshot outcomes out to all configured publishers.
#[derive(Default)]
pub struct Collector {
    publishers: Vec<Box<dyn Publisher>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CollectorConfig) -> Result<Self> {
        let mut collector = Collector::new();

        if let Some(prometheus) = &config.prometheus {
            collector.add_publisher(Box::new(PrometheusPublisher::new(prometheus.clone())?));
        }

        Ok(collector)
    }

    /// Add a publisher. Public so tests can observe collected outcomes.
    pub fn add_publisher(&mut self, publisher: Box<dyn Publisher>) {
        self.publishers.push(publisher);
    }

    /// Record the outcome of one snapshot cycle. A non-positive size means
    /// the cycle failed.
    pub fn collect(&self, timestamp: DateTime<Utc>, size: i64, next: Option<DateTime<Utc>>) {
        for publisher in &self.publishers {
            if size > 0 {
                publisher.publish_success(timestamp, size as u64);
            } else {
                publisher.publish_failure(timestamp);
            }
            publisher.publish_next_snapshot(next);
        }
    }

    /// Start all publishers and publish the initial next-snapshot instant.
    pub async fn start(&mut self, next_snapshot: Option<DateTime<Utc>>) -> Result<()> {
        for publisher in &mut self.publishers {
            publisher.start().await?;
            publisher.publish_next_snapshot(next_snapshot);
        }
        Ok(())
    }

    /// Shut down all publishers, reporting the first failure after trying
    /// every one of them.
    pub async fn shutdown(&mut self) -> Result<()> {
        let mut first_error: Option<AgentError> = None;

        for publisher in &mut self.publishers {
            if let Err(err) = publisher.shutdown().await {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
