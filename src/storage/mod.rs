//! # Snapshot Storage
//!
//! Storage destinations for captured snapshots. Each destination is driven by
//! a [`StorageController`] that decides when to upload, how to name objects
//! and how many old snapshots to retain; the [`Manager`] fans a single
//! snapshot out over all configured destinations.
//!
//! Access to a concrete storage location goes through the [`SnapshotStorage`]
//! trait, implemented for the local filesystem, AWS S3, S3-compatible
//! endpoints (MinIO), Azure Blob, Google Cloud Storage and OpenStack Swift.

pub mod config;
pub mod controller;
pub mod local;
pub mod manager;
pub mod object;
pub mod swift;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::io::AsyncSeekExt;

use crate::errors::Result;

pub use config::{StorageControllerConfig, StorageDefaults, StoragesConfig};
pub use controller::{Controller, StorageController, UploadOutcome};
pub use local::{LocalStorage, LocalStorageConfig};
pub use manager::Manager;
pub use object::{AwsStorageConfig, AzureStorageConfig, GcpStorageConfig, S3StorageConfig};
pub use swift::{SwiftStorage, SwiftStorageConfig};

/// A captured snapshot, materialized into a temporary file so it can be
/// rewound and streamed once per destination.
pub struct Snapshot {
    file: tokio::fs::File,
    size: u64,
}

impl Snapshot {
    pub fn new(file: tokio::fs::File, size: u64) -> Self {
        Self { file, size }
    }

    /// Size of the snapshot in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reset the read position to the start of the snapshot.
    pub async fn rewind(&mut self) -> std::io::Result<()> {
        self.file.rewind().await?;
        Ok(())
    }

    /// The underlying file handle, positioned wherever the last read left it.
    pub fn file_mut(&mut self) -> &mut tokio::fs::File {
        &mut self.file
    }

    /// A second handle onto the same file, sharing the read position.
    ///
    /// Used by backends that hand the body to an HTTP client and therefore
    /// need an owned reader.
    pub async fn shared_handle(&self) -> std::io::Result<tokio::fs::File> {
        self.file.try_clone().await
    }
}

/// Access to a single storage location.
///
/// Implementations expose an opaque handle type for stored objects; the
/// controller only ever asks for a handle's last-modification time and hands
/// handles back for deletion. List results must be filtered to objects whose
/// name both starts with `prefix` and ends with `suffix`, so that pruning
/// never touches foreign objects; when the underlying API cannot filter,
/// the implementation does so itself.
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Opaque handle to an object stored at this location.
    type Object: Send + Sync;

    /// Human-readable label for this destination, used in logs and errors.
    fn destination(&self) -> String;

    /// Upload the snapshot under the given object name.
    async fn upload_snapshot(&self, name: &str, snapshot: &mut Snapshot) -> Result<()>;

    /// Delete a stored snapshot. Deleting an object that no longer exists
    /// is not an error.
    async fn delete_snapshot(&self, object: &Self::Object) -> Result<()>;

    /// List stored snapshots matching the name prefix and suffix, in no
    /// particular order.
    async fn list_snapshots(&self, prefix: &str, suffix: &str) -> Result<Vec<Self::Object>>;

    /// Last-modification time of a stored snapshot.
    fn last_modified(&self, object: &Self::Object) -> DateTime<Utc>;
}

/// Convert a configuration duration into a chrono delta for timestamp math.
pub(crate) fn to_delta(duration: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// True when `name` matches the configured snapshot naming scheme.
pub(crate) fn matches_name(name: &str, prefix: &str, suffix: &str) -> bool {
    name.starts_with(prefix) && name.ends_with(suffix)
}
