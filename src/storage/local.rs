//! # Local Filesystem Storage
//!
//! Stores snapshots as plain files under a single configured directory.
//! Object names are bare filenames; uploads are written to a temporary file
//! and renamed into place so a crashed upload never leaves a half-written
//! snapshot under the final name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

use crate::errors::{AgentError, Result};
use crate::storage::config::StorageControllerConfig;
use crate::storage::controller::{Controller, StorageController};
use crate::storage::{matches_name, Snapshot, SnapshotStorage};

/// Configuration of a local filesystem destination.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorageConfig {
    #[serde(flatten)]
    pub controller: StorageControllerConfig,

    /// Directory the snapshots are stored in. Must exist.
    #[validate(length(min = 1, message = "Path cannot be empty"))]
    pub path: String,
}

impl LocalStorageConfig {
    pub fn destination(&self) -> String {
        format!("local path {}", self.path)
    }

    pub async fn create_controller(&self) -> Result<Box<dyn Controller>> {
        let path = PathBuf::from(&self.path);
        let metadata = tokio::fs::metadata(&path).await.map_err(|err| {
            AgentError::storage_with_source(
                self.destination(),
                "path does not exist",
                Box::new(err),
            )
        })?;
        if !metadata.is_dir() {
            return Err(AgentError::storage(self.destination(), "path is not a directory"));
        }

        debug!(destination = %self.destination(), "Successfully connected");

        Ok(Box::new(StorageController::new(
            self.controller.clone(),
            LocalStorage::new(path),
        )))
    }
}

/// Local filesystem implementation of [`SnapshotStorage`].
pub struct LocalStorage {
    path: PathBuf,
}

/// Handle to a snapshot file under the storage directory.
pub struct LocalObject {
    name: String,
    modified: DateTime<Utc>,
}

impl LocalStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn storage_error(&self, message: &str, err: std::io::Error) -> AgentError {
        AgentError::storage_with_source(self.destination(), message, Box::new(err))
    }
}

#[async_trait]
impl SnapshotStorage for LocalStorage {
    type Object = LocalObject;

    fn destination(&self) -> String {
        format!("local path {}", self.path.display())
    }

    async fn upload_snapshot(&self, name: &str, snapshot: &mut Snapshot) -> Result<()> {
        if name.contains(['/', '\\']) {
            return Err(AgentError::storage(
                self.destination(),
                format!("invalid snapshot name '{}'", name),
            ));
        }

        let final_path = self.path.join(name);
        let partial_path = self.path.join(format!(".{}.partial", name));

        let result = async {
            let mut file = tokio::fs::File::create(&partial_path).await?;
            tokio::io::copy(snapshot.file_mut(), &mut file).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&partial_path, &final_path).await
        }
        .await;

        if let Err(err) = result {
            // leave no partial file behind
            let _ = tokio::fs::remove_file(&partial_path).await;
            return Err(self.storage_error("could not write snapshot", err));
        }

        Ok(())
    }

    async fn delete_snapshot(&self, object: &Self::Object) -> Result<()> {
        match tokio::fs::remove_file(self.path.join(&object.name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.storage_error("could not delete snapshot", err)),
        }
    }

    async fn list_snapshots(&self, prefix: &str, suffix: &str) -> Result<Vec<Self::Object>> {
        let mut snapshots = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.path)
            .await
            .map_err(|err| self.storage_error("could not read storage directory", err))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| self.storage_error("could not read storage directory", err))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !matches_name(&name, prefix, suffix) {
                continue;
            }

            let metadata = entry
                .metadata()
                .await
                .map_err(|err| self.storage_error("could not stat snapshot", err))?;
            let modified = metadata
                .modified()
                .map_err(|err| self.storage_error("could not stat snapshot", err))?;

            snapshots.push(LocalObject { name, modified: DateTime::<Utc>::from(modified) });
        }

        Ok(snapshots)
    }

    fn last_modified(&self, object: &Self::Object) -> DateTime<Utc> {
        object.modified
    }
}

impl crate::config::secret::RebaseSecrets for LocalStorageConfig {
    fn rebase_secrets(&mut self, _base_dir: &Path) {}
}
