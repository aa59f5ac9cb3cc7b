//! # Storage Controller
//!
//! The per-destination policy engine. A controller ties one
//! [`SnapshotStorage`] to its configuration and tracks the time of the last
//! successful upload, from which it derives when the next snapshot is due.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::errors::{AgentError, Result};
use crate::storage::config::{StorageControllerConfig, StorageDefaults};
use crate::storage::{to_delta, Snapshot, SnapshotStorage};

/// Result of a single upload attempt. Every variant carries the time at
/// which the destination wants its next snapshot.
pub enum UploadOutcome {
    /// The snapshot was uploaded.
    Uploaded { next: Option<DateTime<Utc>> },
    /// The snapshot was skipped because the destination's cadence has not
    /// elapsed yet.
    Skipped { next: Option<DateTime<Utc>> },
    /// The upload failed; the destination retries at its next scheduled
    /// instant.
    Failed { next: Option<DateTime<Utc>>, error: AgentError },
}

impl UploadOutcome {
    /// The next-snapshot instant reported by this outcome.
    pub fn next(&self) -> Option<DateTime<Utc>> {
        match self {
            UploadOutcome::Uploaded { next }
            | UploadOutcome::Skipped { next }
            | UploadOutcome::Failed { next, .. } => *next,
        }
    }
}

/// The interface the [`Manager`](crate::storage::Manager) uses to drive a
/// destination, independent of the storage's object-handle type.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Human-readable label for the controlled destination.
    fn destination(&self) -> String;

    /// Compute when the next snapshot should be uploaded to this
    /// destination. `last_snapshot` serves as a hint when the time of the
    /// last upload cannot be determined from local state; otherwise the
    /// destination's own contents decide. Returns `None` when neither
    /// source yields a reference point.
    async fn schedule_snapshot(
        &mut self,
        last_snapshot: Option<DateTime<Utc>>,
        defaults: &StorageDefaults,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Upload the snapshot if the destination's cadence allows it.
    async fn upload_snapshot(
        &mut self,
        snapshot: &mut Snapshot,
        timestamp: DateTime<Utc>,
        defaults: &StorageDefaults,
    ) -> UploadOutcome;

    /// Prune snapshots exceeding the destination's retention, oldest first.
    /// Returns the number of snapshots actually deleted.
    async fn delete_obsolete_snapshots(&mut self, defaults: &StorageDefaults) -> Result<usize>;
}

/// Controller implementation generic over the storage's object-handle type.
pub struct StorageController<S: SnapshotStorage> {
    config: StorageControllerConfig,
    storage: S,
    last_upload: Option<DateTime<Utc>>,
}

impl<S: SnapshotStorage> StorageController<S> {
    pub fn new(config: StorageControllerConfig, storage: S) -> Self {
        Self { config, storage, last_upload: None }
    }

    /// List matching snapshots sorted by last-modification time, oldest
    /// first.
    async fn list_sorted(&self, defaults: &StorageDefaults) -> Result<Vec<S::Object>> {
        let mut snapshots = self
            .storage
            .list_snapshots(
                self.config.name_prefix_or(defaults),
                self.config.name_suffix_or(defaults),
            )
            .await?;

        snapshots.sort_by_key(|s| self.storage.last_modified(s));
        Ok(snapshots)
    }

    /// Initialize `last_upload` on first use: prefer the agent's hint, then
    /// the newest object at the destination. If the destination is empty,
    /// `last_upload` stays unset.
    async fn ensure_last_upload(
        &mut self,
        last_snapshot: Option<DateTime<Utc>>,
        defaults: &StorageDefaults,
    ) -> Result<()> {
        if self.last_upload.is_some() {
            return Ok(());
        }

        if last_snapshot.is_some() {
            self.last_upload = last_snapshot;
            return Ok(());
        }

        let timeout = self.config.timeout_or(defaults);
        let snapshots = tokio::time::timeout(timeout, self.list_sorted(defaults))
            .await
            .map_err(|_| {
                AgentError::timeout(format!("listing snapshots at {}", self.storage.destination()))
            })??;

        self.last_upload = snapshots.last().map(|s| self.storage.last_modified(s));
        Ok(())
    }
}

#[async_trait]
impl<S: SnapshotStorage> Controller for StorageController<S> {
    fn destination(&self) -> String {
        self.storage.destination()
    }

    async fn schedule_snapshot(
        &mut self,
        last_snapshot: Option<DateTime<Utc>>,
        defaults: &StorageDefaults,
    ) -> Result<Option<DateTime<Utc>>> {
        self.ensure_last_upload(last_snapshot, defaults).await?;

        Ok(self
            .last_upload
            .map(|last| last + to_delta(self.config.frequency_or(defaults))))
    }

    async fn upload_snapshot(
        &mut self,
        snapshot: &mut Snapshot,
        timestamp: DateTime<Utc>,
        defaults: &StorageDefaults,
    ) -> UploadOutcome {
        let frequency = to_delta(self.config.frequency_or(defaults));

        if let Some(last_upload) = self.last_upload {
            if timestamp < last_upload + frequency {
                return UploadOutcome::Skipped { next: Some(last_upload + frequency) };
            }
        }

        let next = Some(timestamp + frequency);

        let prefix = self.config.name_prefix_or(defaults);
        let suffix = self.config.name_suffix_or(defaults);
        let formatted = timestamp.format(self.config.timestamp_format_or(defaults));
        let name = format!("{}{}{}", prefix, formatted, suffix);

        let timeout = self.config.timeout_or(defaults);
        match tokio::time::timeout(timeout, self.storage.upload_snapshot(&name, snapshot)).await {
            Err(_) => UploadOutcome::Failed {
                next,
                error: AgentError::timeout(format!(
                    "uploading snapshot to {}",
                    self.storage.destination()
                )),
            },
            Ok(Err(error)) => UploadOutcome::Failed { next, error },
            Ok(Ok(())) => {
                self.last_upload = Some(timestamp);
                UploadOutcome::Uploaded { next }
            }
        }
    }

    async fn delete_obsolete_snapshots(&mut self, defaults: &StorageDefaults) -> Result<usize> {
        let retain = self.config.retain_or(defaults);
        if retain < 1 {
            return Ok(0);
        }
        let retain = retain as usize;

        let timeout = self.config.timeout_or(defaults);
        let prune = async {
            let snapshots = self.list_sorted(defaults).await?;
            if snapshots.len() <= retain {
                return Ok(0);
            }

            let obsolete = snapshots.len() - retain;
            let mut deleted = 0;
            for snapshot in &snapshots[..obsolete] {
                if let Err(error) = self.storage.delete_snapshot(snapshot).await {
                    warn!(
                        destination = %self.storage.destination(),
                        last_modified = %self.storage.last_modified(snapshot),
                        error = %error,
                        "Could not delete obsolete snapshot"
                    );
                } else {
                    deleted += 1;
                }
            }

            Ok(deleted)
        };

        tokio::time::timeout(timeout, prune).await.map_err(|_| {
            AgentError::timeout(format!(
                "pruning obsolete snapshots at {}",
                self.storage.destination()
            ))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory storage stub recording calls, in the spirit of the
    /// integration tests' local-directory destinations.
    #[derive(Default)]
    struct StorageStub {
        objects: Mutex<Vec<(String, DateTime<Utc>)>>,
        uploads: AtomicUsize,
        fail_uploads: bool,
        fail_deletes_for: Vec<String>,
    }

    impl StorageStub {
        fn with_objects(objects: Vec<(&str, DateTime<Utc>)>) -> Self {
            Self {
                objects: Mutex::new(
                    objects.into_iter().map(|(n, t)| (n.to_string(), t)).collect(),
                ),
                ..Default::default()
            }
        }

        fn names(&self) -> Vec<String> {
            self.objects.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
        }
    }

    #[async_trait]
    impl SnapshotStorage for StorageStub {
        type Object = (String, DateTime<Utc>);

        fn destination(&self) -> String {
            "stub".to_string()
        }

        async fn upload_snapshot(&self, name: &str, _snapshot: &mut Snapshot) -> Result<()> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            if self.fail_uploads {
                return Err(AgentError::storage("stub", "upload failed"));
            }
            self.objects.lock().unwrap().push((name.to_string(), Utc::now()));
            Ok(())
        }

        async fn delete_snapshot(&self, object: &Self::Object) -> Result<()> {
            if self.fail_deletes_for.contains(&object.0) {
                return Err(AgentError::storage("stub", "delete failed"));
            }
            self.objects.lock().unwrap().retain(|(n, _)| n != &object.0);
            Ok(())
        }

        async fn list_snapshots(&self, prefix: &str, suffix: &str) -> Result<Vec<Self::Object>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _)| n.starts_with(prefix) && n.ends_with(suffix))
                .cloned()
                .collect())
        }

        fn last_modified(&self, object: &Self::Object) -> DateTime<Utc> {
            object.1
        }
    }

    async fn snapshot_fixture() -> Snapshot {
        let file = tempfile::tempfile().unwrap();
        Snapshot::new(tokio::fs::File::from_std(file), 0)
    }

    fn timestamp(offset_secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_schedule_uses_agent_hint() {
        let mut controller =
            StorageController::new(StorageControllerConfig::default(), StorageStub::default());
        let defaults =
            StorageDefaults { frequency: Duration::from_secs(3600), ..Default::default() };

        let next =
            controller.schedule_snapshot(Some(timestamp(0)), &defaults).await.unwrap();
        assert_eq!(next, Some(timestamp(3600)));
    }

    #[tokio::test]
    async fn test_schedule_falls_back_to_newest_stored_snapshot() {
        let storage = StorageStub::with_objects(vec![
            ("raft-snapshot-b.snap", timestamp(100)),
            ("raft-snapshot-a.snap", timestamp(50)),
        ]);
        let mut controller = StorageController::new(StorageControllerConfig::default(), storage);
        let defaults =
            StorageDefaults { frequency: Duration::from_secs(3600), ..Default::default() };

        let next = controller.schedule_snapshot(None, &defaults).await.unwrap();
        assert_eq!(next, Some(timestamp(100 + 3600)));
    }

    #[tokio::test]
    async fn test_schedule_on_empty_destination_yields_none() {
        let mut controller =
            StorageController::new(StorageControllerConfig::default(), StorageStub::default());
        let defaults = StorageDefaults::default();

        let next = controller.schedule_snapshot(None, &defaults).await.unwrap();
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn test_upload_respects_cadence() {
        let mut controller =
            StorageController::new(StorageControllerConfig::default(), StorageStub::default());
        let defaults =
            StorageDefaults { frequency: Duration::from_secs(3600), ..Default::default() };

        let mut snapshot = snapshot_fixture().await;
        let outcome =
            controller.upload_snapshot(&mut snapshot, timestamp(0), &defaults).await;
        assert!(matches!(outcome, UploadOutcome::Uploaded { .. }));
        assert_eq!(outcome.next(), Some(timestamp(3600)));

        // A second upload before the cadence elapses is skipped without
        // touching the backend.
        let outcome =
            controller.upload_snapshot(&mut snapshot, timestamp(1800), &defaults).await;
        assert!(matches!(outcome, UploadOutcome::Skipped { .. }));
        assert_eq!(outcome.next(), Some(timestamp(3600)));
        assert_eq!(controller.storage.uploads.load(Ordering::SeqCst), 1);

        // Once the cadence has elapsed the upload goes through again.
        let outcome =
            controller.upload_snapshot(&mut snapshot, timestamp(3700), &defaults).await;
        assert!(matches!(outcome, UploadOutcome::Uploaded { .. }));
        assert_eq!(controller.storage.uploads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_upload_reports_next_and_keeps_last_upload() {
        let storage = StorageStub { fail_uploads: true, ..Default::default() };
        let mut controller = StorageController::new(StorageControllerConfig::default(), storage);
        let defaults =
            StorageDefaults { frequency: Duration::from_secs(3600), ..Default::default() };

        let mut snapshot = snapshot_fixture().await;
        let outcome =
            controller.upload_snapshot(&mut snapshot, timestamp(0), &defaults).await;
        assert!(matches!(outcome, UploadOutcome::Failed { .. }));
        assert_eq!(outcome.next(), Some(timestamp(3600)));
        assert_eq!(controller.last_upload, None);
    }

    #[tokio::test]
    async fn test_upload_uses_configured_naming() {
        let config = StorageControllerConfig {
            name_prefix: Some("vault-".to_string()),
            name_suffix: Some(".bin".to_string()),
            timestamp_format: Some("%Y%m%d%H%M%S".to_string()),
            ..Default::default()
        };
        let mut controller = StorageController::new(config, StorageStub::default());
        let defaults = StorageDefaults::default();

        let mut snapshot = snapshot_fixture().await;
        let ts = DateTime::parse_from_rfc3339("2024-02-01T10:30:00Z").unwrap().to_utc();
        controller.upload_snapshot(&mut snapshot, ts, &defaults).await;

        assert_eq!(controller.storage.names(), vec!["vault-20240201103000.bin"]);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let storage = StorageStub::with_objects(vec![
            ("raft-snapshot-0.snap", timestamp(0)),
            ("raft-snapshot-1.snap", timestamp(1)),
            ("raft-snapshot-2.snap", timestamp(2)),
            ("raft-snapshot-3.snap", timestamp(3)),
        ]);
        let config = StorageControllerConfig { retain: Some(2), ..Default::default() };
        let mut controller = StorageController::new(config, storage);

        let deleted =
            controller.delete_obsolete_snapshots(&StorageDefaults::default()).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(
            controller.storage.names(),
            vec!["raft-snapshot-2.snap", "raft-snapshot-3.snap"]
        );
    }

    #[tokio::test]
    async fn test_prune_continues_after_delete_failure() {
        let mut storage = StorageStub::with_objects(vec![
            ("raft-snapshot-0.snap", timestamp(0)),
            ("raft-snapshot-1.snap", timestamp(1)),
            ("raft-snapshot-2.snap", timestamp(2)),
        ]);
        storage.fail_deletes_for = vec!["raft-snapshot-0.snap".to_string()];
        let config = StorageControllerConfig { retain: Some(1), ..Default::default() };
        let mut controller = StorageController::new(config, storage);

        let deleted =
            controller.delete_obsolete_snapshots(&StorageDefaults::default()).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(
            controller.storage.names(),
            vec!["raft-snapshot-0.snap", "raft-snapshot-2.snap"]
        );
    }

    #[tokio::test]
    async fn test_prune_disabled_by_default() {
        let storage = StorageStub::with_objects(vec![
            ("raft-snapshot-0.snap", timestamp(0)),
            ("raft-snapshot-1.snap", timestamp(1)),
        ]);
        let mut controller = StorageController::new(StorageControllerConfig::default(), storage);

        let deleted =
            controller.delete_obsolete_snapshots(&StorageDefaults::default()).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(controller.storage.names().len(), 2);
    }

    #[tokio::test]
    async fn test_prune_ignores_foreign_objects() {
        let storage = StorageStub::with_objects(vec![
            ("raft-snapshot-0.snap", timestamp(0)),
            ("raft-snapshot-1.snap", timestamp(1)),
            ("unrelated.txt", timestamp(2)),
        ]);
        let config = StorageControllerConfig { retain: Some(1), ..Default::default() };
        let mut controller = StorageController::new(config, storage);

        let deleted =
            controller.delete_obsolete_snapshots(&StorageDefaults::default()).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(controller.storage.names().contains(&"unrelated.txt".to_string()));
    }
}
