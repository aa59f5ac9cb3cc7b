//! # Snapshot Agent
//!
//! Owns the snapshot cycle: capture a snapshot from the vault leader into a
//! temp file, fan it out to the storage destinations, and derive the next
//! wake-up instant. One mutex serializes snapshot cycles and configuration
//! reloads; the wake-up deadline is published through a watch channel so
//! the run loop re-arms whenever a cycle or a reload moves it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::errors::Result;
use crate::metrics::Collector;
use crate::storage::{to_delta, Manager, Snapshot, StorageDefaults};
use crate::vault::VaultClient;

/// The agent's view of the vault client: something that can stream one
/// consistent snapshot into a writer.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn take_snapshot(
        &mut self,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()>;
}

#[async_trait]
impl SnapshotSource for VaultClient {
    async fn take_snapshot(
        &mut self,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        VaultClient::take_snapshot(self, writer).await
    }
}

struct AgentState {
    client: Box<dyn SnapshotSource>,
    manager: Manager,
    defaults: StorageDefaults,
    collector: Collector,
    temp_dir: Option<PathBuf>,
    last_snapshot_time: Option<DateTime<Utc>>,
}

/// Periodically takes snapshots of the vault cluster and uploads them to
/// the configured storages.
pub struct SnapshotAgent {
    state: Mutex<AgentState>,
    next_wake: watch::Sender<DateTime<Utc>>,
}

impl SnapshotAgent {
    /// Build the agent from a validated configuration, compute the initial
    /// schedule and start the metrics collector.
    pub async fn from_config(config: &AgentConfig) -> Result<Self> {
        let (client, manager, collector) = build_components(config).await?;

        let (next_wake, _) = watch::channel(Utc::now());
        let agent = Self {
            state: Mutex::new(AgentState {
                client,
                manager,
                defaults: config.snapshots.defaults.clone(),
                collector,
                temp_dir: config.snapshots.temp_dir.clone(),
                last_snapshot_time: None,
            }),
            next_wake,
        };

        {
            let mut state = agent.state.lock().await;
            let defaults = state.defaults.clone();
            let next = state.manager.schedule_snapshot(None, &defaults).await;
            if let Some(next) = next {
                agent.publish_next_wake(next);
            }
            state.collector.start(next).await?;
            debug!(next_snapshot = ?next, "Snapshot agent initialized");
        }

        Ok(agent)
    }

    /// Create an agent directly from its parts. Used by tests to drive the
    /// cycle with stub vault clients.
    pub fn new(
        client: Box<dyn SnapshotSource>,
        manager: Manager,
        defaults: StorageDefaults,
        collector: Collector,
        temp_dir: Option<PathBuf>,
    ) -> Self {
        let (next_wake, _) = watch::channel(Utc::now());
        Self {
            state: Mutex::new(AgentState {
                client,
                manager,
                defaults,
                collector,
                temp_dir,
                last_snapshot_time: None,
            }),
            next_wake,
        }
    }

    /// Subscribe to the wake-up deadline.
    pub fn next_wake(&self) -> watch::Receiver<DateTime<Utc>> {
        self.next_wake.subscribe()
    }

    fn publish_next_wake(&self, next: DateTime<Utc>) {
        if next > Utc::now() {
            self.next_wake.send_replace(next);
        }
    }

    /// Run one snapshot cycle and return the instant of the next one.
    ///
    /// Every failure path records its outcome to the collector and falls
    /// back to a pessimistic `now + frequency` wake-up, so a failing vault
    /// is retried on the regular cadence instead of a tight loop.
    pub async fn capture(&self) -> DateTime<Utc> {
        let mut state = self.state.lock().await;

        let now = Utc::now();
        state.last_snapshot_time = Some(now);

        let mut next = now + to_delta(state.defaults.frequency);
        self.publish_next_wake(next);

        let temp_file = match &state.temp_dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir),
            None => tempfile::NamedTempFile::new(),
        };
        // the temp file is removed when `temp_file` drops, on every path
        // out of this cycle
        let temp_file = match temp_file {
            Ok(temp_file) => temp_file,
            Err(err) => {
                warn!(error = %err, next_snapshot = %next, "Could not create snapshot-temp-file");
                state.collector.collect(now, -1, Some(next));
                return next;
            }
        };

        let mut file = match temp_file.reopen() {
            Ok(file) => tokio::fs::File::from_std(file),
            Err(err) => {
                warn!(error = %err, next_snapshot = %next, "Could not open snapshot-temp-file");
                state.collector.collect(now, -1, Some(next));
                return next;
            }
        };

        if let Err(err) = state.client.take_snapshot(&mut file).await {
            error!(error = %err, next_snapshot = %next, "Could not take snapshot of vault");
            state.collector.collect(now, -1, Some(next));
            return next;
        }

        let size = match temp_file.as_file().metadata() {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                error!(error = %err, next_snapshot = %next, "Could not stat snapshot-temp-file");
                state.collector.collect(now, -1, Some(next));
                return next;
            }
        };

        if size < 1 {
            warn!(next_snapshot = %next, "Ignoring empty snapshot");
            state.collector.collect(now, 0, Some(next));
            return next;
        }

        let mut snapshot = Snapshot::new(file, size);
        let defaults = state.defaults.clone();
        let candidate = state.manager.upload_snapshot(&mut snapshot, now, &defaults).await;

        if let Some(candidate) = candidate {
            if candidate > Utc::now() {
                next = candidate;
                self.publish_next_wake(next);
            }
        }

        state.collector.collect(now, size as i64, Some(next));
        next
    }

    /// Swap in freshly built components for a changed configuration.
    ///
    /// The new subtree is built before the agent lock is taken, so an
    /// in-flight snapshot cycle finishes undisturbed; the swap itself shuts
    /// the previous collector down, reschedules and starts the new one.
    pub async fn reconfigure(&self, config: &AgentConfig) -> Result<()> {
        let (client, manager, collector) = build_components(config).await?;

        let mut state = self.state.lock().await;

        if let Err(err) = state.collector.shutdown().await {
            warn!(error = %err, "Could not shut down previous metrics collector");
        }

        state.client = client;
        state.manager = manager;
        state.defaults = config.snapshots.defaults.clone();
        state.collector = collector;
        state.temp_dir = config.snapshots.temp_dir.clone();

        let last_snapshot_time = state.last_snapshot_time;
        let defaults = state.defaults.clone();
        let next = state.manager.schedule_snapshot(last_snapshot_time, &defaults).await;
        if let Some(next) = next {
            self.publish_next_wake(next);
        }
        state.collector.start(next).await?;

        debug!(next_snapshot = ?next, "Successfully updated configuration");
        Ok(())
    }

    /// Shut down the collector. Called once the run loop has exited.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Err(err) = state.collector.shutdown().await {
            warn!(error = %err, "Could not shut down metrics collector");
        }
    }

    /// The agent's main loop: capture, sleep until the published deadline,
    /// repeat. Reconfigurations move the deadline through the watch
    /// channel; cancellation exits the loop and aborts outstanding I/O.
    pub async fn run(self: &Arc<Self>, shutdown: CancellationToken) {
        let mut next_wake = self.next_wake();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.capture() => {}
            }

            loop {
                let deadline = *next_wake.borrow_and_update();

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = sleep_until(deadline) => break,
                    changed = next_wake.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        // deadline moved, re-arm
                    }
                }
            }
        }
    }
}

/// Build the client/manager/collector subtree for a configuration.
async fn build_components(
    config: &AgentConfig,
) -> Result<(Box<dyn SnapshotSource>, Manager, Collector)> {
    let client = VaultClient::from_config(&config.vault)?;
    let manager = Manager::from_config(&config.snapshots.storages).await?;
    let collector = Collector::from_config(&config.metrics)?;

    if manager.is_empty() {
        info!("No storages configured, snapshots will not be uploaded");
    }

    Ok((Box::new(client), manager, collector))
}

async fn sleep_until(deadline: DateTime<Utc>) {
    let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
    tokio::time::sleep(remaining).await;
}
