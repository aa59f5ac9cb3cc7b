//! # Storage Manager
//!
//! Fans a single captured snapshot out to all configured destinations and
//! reduces the controllers' individual next-snapshot times into the single
//! instant at which the agent wakes up again.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::storage::config::{StorageDefaults, StoragesConfig};
use crate::storage::controller::{Controller, UploadOutcome};
use crate::storage::{to_delta, Snapshot};

/// Ordered collection of the controllers for all configured destinations.
///
/// The order does not affect correctness, only the order of log output.
#[derive(Default)]
pub struct Manager {
    controllers: Vec<Box<dyn Controller>>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager with one controller per configured destination.
    ///
    /// A destination whose controller cannot be constructed (unresolvable
    /// credentials, unreachable or missing bucket) fails the whole call; at
    /// startup this is fatal, during reconfiguration the update is rejected.
    pub async fn from_config(config: &StoragesConfig) -> Result<Self> {
        let mut manager = Manager::new();

        if let Some(aws) = &config.aws {
            manager.add_controller(aws.create_controller().await?);
        }
        if let Some(azure) = &config.azure {
            manager.add_controller(azure.create_controller().await?);
        }
        if let Some(gcp) = &config.gcp {
            manager.add_controller(gcp.create_controller().await?);
        }
        if let Some(local) = &config.local {
            manager.add_controller(local.create_controller().await?);
        }
        if let Some(swift) = &config.swift {
            manager.add_controller(swift.create_controller().await?);
        }
        if let Some(s3) = &config.s3 {
            manager.add_controller(s3.create_controller().await?);
        }

        Ok(manager)
    }

    /// Add a controller. Public so tests can drive the manager with stub
    /// destinations.
    pub fn add_controller(&mut self, controller: Box<dyn Controller>) {
        self.controllers.push(controller);
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Ask every destination when it wants its next snapshot and return the
    /// earliest instant. Destinations that cannot schedule are skipped;
    /// `None` means no destination could produce a schedule.
    pub async fn schedule_snapshot(
        &mut self,
        last_snapshot: Option<DateTime<Utc>>,
        defaults: &StorageDefaults,
    ) -> Option<DateTime<Utc>> {
        let mut next_snapshot: Option<DateTime<Utc>> = None;

        for controller in &mut self.controllers {
            match controller.schedule_snapshot(last_snapshot, defaults).await {
                Err(error) => {
                    warn!(
                        destination = %controller.destination(),
                        error = %error,
                        "Could not schedule snapshot"
                    );
                }
                Ok(Some(candidate)) => {
                    if next_snapshot.map_or(true, |next| candidate < next) {
                        next_snapshot = Some(candidate);
                    }
                }
                Ok(None) => {}
            }
        }

        next_snapshot
    }

    /// Upload the snapshot to every destination whose cadence is due and
    /// return the earliest next-snapshot instant across all destinations.
    ///
    /// Failures on one destination never abort the fan-out; after a
    /// successful upload the destination's retention is applied.
    pub async fn upload_snapshot(
        &mut self,
        snapshot: &mut Snapshot,
        timestamp: DateTime<Utc>,
        defaults: &StorageDefaults,
    ) -> Option<DateTime<Utc>> {
        let mut next_snapshot: Option<DateTime<Utc>> = None;
        let mut failures = false;

        for controller in &mut self.controllers {
            if let Err(err) = snapshot.rewind().await {
                error!(error = %err, "Could not reset snapshot before uploading");
                return Some(timestamp + to_delta(defaults.frequency));
            }

            let destination = controller.destination();
            let outcome = controller.upload_snapshot(snapshot, timestamp, defaults).await;

            if let Some(candidate) = outcome.next() {
                if next_snapshot.map_or(true, |next| candidate < next) {
                    next_snapshot = Some(candidate);
                }
            }

            match outcome {
                UploadOutcome::Failed { error, next } => {
                    failures = true;
                    warn!(
                        destination = %destination,
                        error = %error,
                        next_snapshot = ?next,
                        "Could not upload snapshot"
                    );
                }
                UploadOutcome::Skipped { next } => {
                    debug!(
                        destination = %destination,
                        next_snapshot = ?next,
                        "Skipped upload of snapshot"
                    );
                }
                UploadOutcome::Uploaded { next } => {
                    debug!(
                        destination = %destination,
                        next_snapshot = ?next,
                        "Successfully uploaded snapshot"
                    );

                    match controller.delete_obsolete_snapshots(defaults).await {
                        Err(error) => {
                            warn!(
                                destination = %destination,
                                error = %error,
                                "Could not delete obsolete snapshots"
                            );
                        }
                        Ok(deleted) if deleted > 0 => {
                            debug!(
                                destination = %destination,
                                deleted = deleted,
                                "Deleted obsolete snapshots"
                            );
                        }
                        Ok(_) => {}
                    }
                }
            }
        }

        if !failures {
            info!(next_snapshot = ?next_snapshot, "Successfully uploaded snapshot to all scheduled destinations");
        }

        next_snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AgentError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct ControllerStub {
        next: Option<DateTime<Utc>>,
        fail: bool,
        uploads: Arc<AtomicUsize>,
        prunes: Arc<AtomicUsize>,
    }

    impl ControllerStub {
        fn new(next: Option<DateTime<Utc>>) -> Self {
            Self {
                next,
                fail: false,
                uploads: Arc::new(AtomicUsize::new(0)),
                prunes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Controller for ControllerStub {
        fn destination(&self) -> String {
            "stub".to_string()
        }

        async fn schedule_snapshot(
            &mut self,
            _last_snapshot: Option<DateTime<Utc>>,
            _defaults: &StorageDefaults,
        ) -> Result<Option<DateTime<Utc>>> {
            Ok(self.next)
        }

        async fn upload_snapshot(
            &mut self,
            _snapshot: &mut Snapshot,
            _timestamp: DateTime<Utc>,
            _defaults: &StorageDefaults,
        ) -> UploadOutcome {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                UploadOutcome::Failed {
                    next: self.next,
                    error: AgentError::storage("stub", "upload failed"),
                }
            } else {
                UploadOutcome::Uploaded { next: self.next }
            }
        }

        async fn delete_obsolete_snapshots(
            &mut self,
            _defaults: &StorageDefaults,
        ) -> Result<usize> {
            self.prunes.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    fn timestamp(offset_secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap()
    }

    async fn snapshot_fixture() -> Snapshot {
        let file = tempfile::tempfile().unwrap();
        Snapshot::new(tokio::fs::File::from_std(file), 0)
    }

    #[tokio::test]
    async fn test_schedule_returns_earliest() {
        let mut manager = Manager::new();
        manager.add_controller(Box::new(ControllerStub::new(Some(timestamp(300)))));
        manager.add_controller(Box::new(ControllerStub::new(Some(timestamp(100)))));
        manager.add_controller(Box::new(ControllerStub::new(None)));

        let next = manager.schedule_snapshot(None, &StorageDefaults::default()).await;
        assert_eq!(next, Some(timestamp(100)));
    }

    #[tokio::test]
    async fn test_schedule_with_no_controllers_returns_none() {
        let mut manager = Manager::new();
        let next = manager.schedule_snapshot(None, &StorageDefaults::default()).await;
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn test_upload_reduces_next_across_controllers() {
        let mut manager = Manager::new();
        let slow = ControllerStub::new(Some(timestamp(7200)));
        let fast = ControllerStub::new(Some(timestamp(3600)));
        let uploads = [slow.uploads.clone(), fast.uploads.clone()];
        manager.add_controller(Box::new(slow));
        manager.add_controller(Box::new(fast));

        let mut snapshot = snapshot_fixture().await;
        let next = manager
            .upload_snapshot(&mut snapshot, timestamp(0), &StorageDefaults::default())
            .await;

        assert_eq!(next, Some(timestamp(3600)));
        assert_eq!(uploads[0].load(Ordering::SeqCst), 1);
        assert_eq!(uploads[1].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_does_not_abort_fan_out() {
        let mut manager = Manager::new();
        let mut failing = ControllerStub::new(Some(timestamp(60)));
        failing.fail = true;
        let healthy = ControllerStub::new(Some(timestamp(3600)));
        let healthy_uploads = healthy.uploads.clone();
        let healthy_prunes = healthy.prunes.clone();
        let failing_prunes = failing.prunes.clone();
        manager.add_controller(Box::new(failing));
        manager.add_controller(Box::new(healthy));

        let mut snapshot = snapshot_fixture().await;
        let next = manager
            .upload_snapshot(&mut snapshot, timestamp(0), &StorageDefaults::default())
            .await;

        // The failed controller's fallback next still takes part in the
        // reduction, and pruning only runs after successful uploads.
        assert_eq!(next, Some(timestamp(60)));
        assert_eq!(healthy_uploads.load(Ordering::SeqCst), 1);
        assert_eq!(healthy_prunes.load(Ordering::SeqCst), 1);
        assert_eq!(failing_prunes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_upload_with_differing_frequencies() {
        // Two destinations, one hourly and one two-hourly: after both upload
        // at t0, an upload at t0+1h10m is due only for the hourly one and the
        // reduced next instant is the two-hourly destination's t0+2h.
        let defaults =
            StorageDefaults { frequency: Duration::from_secs(3600), ..Default::default() };

        let mut manager = Manager::new();
        manager.add_controller(Box::new(crate::storage::StorageController::new(
            crate::storage::StorageControllerConfig::default(),
            MemoryStorage::default(),
        )));
        manager.add_controller(Box::new(crate::storage::StorageController::new(
            crate::storage::StorageControllerConfig {
                frequency: Some(Duration::from_secs(7200)),
                ..Default::default()
            },
            MemoryStorage::default(),
        )));

        let mut snapshot = snapshot_fixture().await;
        let t0 = timestamp(0);

        let next = manager.upload_snapshot(&mut snapshot, t0, &defaults).await;
        assert_eq!(next, Some(t0 + chrono::TimeDelta::seconds(3600)));

        let t1 = t0 + chrono::TimeDelta::seconds(4200);
        let next = manager.upload_snapshot(&mut snapshot, t1, &defaults).await;
        // hourly destination: t1 + 1h = t0 + 2h10m; two-hourly: t0 + 2h
        assert_eq!(next, Some(t0 + chrono::TimeDelta::seconds(7200)));
    }

    /// A minimal in-memory SnapshotStorage used by the frequency test.
    #[derive(Default)]
    struct MemoryStorage {
        objects: std::sync::Mutex<Vec<(String, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl crate::storage::SnapshotStorage for MemoryStorage {
        type Object = (String, DateTime<Utc>);

        fn destination(&self) -> String {
            "memory".to_string()
        }

        async fn upload_snapshot(&self, name: &str, _snapshot: &mut Snapshot) -> Result<()> {
            self.objects.lock().unwrap().push((name.to_string(), Utc::now()));
            Ok(())
        }

        async fn delete_snapshot(&self, object: &Self::Object) -> Result<()> {
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
}
