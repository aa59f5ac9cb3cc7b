//! # Object Storage Backends
//!
//! Cloud destinations backed by the `object_store` crate: AWS S3,
//! S3-compatible endpoints (MinIO), Azure Blob and Google Cloud Storage all
//! share one [`SnapshotStorage`] implementation over `dyn ObjectStore`; the
//! per-provider configuration blocks only differ in how the store is built.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, WriteMultipart};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::debug;
use validator::Validate;

use crate::config::secret::{RebaseSecrets, Secret};
use crate::errors::{AgentError, Result};
use crate::storage::config::StorageControllerConfig;
use crate::storage::controller::{Controller, StorageController};
use crate::storage::{matches_name, Snapshot, SnapshotStorage};

const UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// [`SnapshotStorage`] over any `object_store` implementation.
pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
    base: Option<ObjectPath>,
    destination: String,
}

impl ObjectStoreStorage {
    /// Wrap a store and verify the destination is reachable. A destination
    /// that cannot be listed fails the controller's construction.
    pub async fn connect(
        store: Arc<dyn ObjectStore>,
        base: Option<ObjectPath>,
        destination: String,
    ) -> Result<Self> {
        store.list_with_delimiter(base.as_ref()).await.map_err(|err| {
            AgentError::storage_with_source(
                destination.clone(),
                "destination is not accessible",
                Box::new(err),
            )
        })?;

        debug!(destination = %destination, "Successfully connected");

        Ok(Self { store, base, destination })
    }

    fn object_path(&self, name: &str) -> ObjectPath {
        match &self.base {
            Some(base) => base.child(name),
            None => ObjectPath::from(name),
        }
    }

    fn storage_error(&self, message: &str, err: object_store::Error) -> AgentError {
        AgentError::storage_with_source(self.destination.clone(), message, Box::new(err))
    }
}

#[async_trait]
impl SnapshotStorage for ObjectStoreStorage {
    type Object = ObjectMeta;

    fn destination(&self) -> String {
        self.destination.clone()
    }

    async fn upload_snapshot(&self, name: &str, snapshot: &mut Snapshot) -> Result<()> {
        let path = self.object_path(name);

        let upload = self
            .store
            .put_multipart(&path)
            .await
            .map_err(|err| self.storage_error("could not start upload", err))?;
        let mut writer = WriteMultipart::new(upload);

        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
        loop {
            let read = snapshot
                .file_mut()
                .read(&mut buf)
                .await
                .map_err(|err| AgentError::io(err, "could not read snapshot"))?;
            if read == 0 {
                break;
            }
            writer.write(&buf[..read]);
        }

        writer
            .finish()
            .await
            .map_err(|err| self.storage_error("could not upload snapshot", err))?;

        Ok(())
    }

    async fn delete_snapshot(&self, object: &Self::Object) -> Result<()> {
        match self.store.delete(&object.location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(self.storage_error("could not delete snapshot", err)),
        }
    }

    async fn list_snapshots(&self, prefix: &str, suffix: &str) -> Result<Vec<Self::Object>> {
        let objects: Vec<ObjectMeta> = self
            .store
            .list(self.base.as_ref())
            .try_collect()
            .await
            .map_err(|err| self.storage_error("could not list snapshots", err))?;

        Ok(objects
            .into_iter()
            .filter(|meta| {
                meta.location
                    .filename()
                    .map(|name| matches_name(name, prefix, suffix))
                    .unwrap_or(false)
            })
            .collect())
    }

    fn last_modified(&self, object: &Self::Object) -> DateTime<Utc> {
        object.last_modified
    }
}

fn default_aws_access_key_id() -> Secret {
    Secret::from_env("AWS_ACCESS_KEY_ID")
}

fn default_aws_access_key() -> Secret {
    Secret::from_env("AWS_SECRET_ACCESS_KEY")
}

fn default_aws_session_token() -> Secret {
    Secret::from_env("AWS_SESSION_TOKEN")
}

fn default_aws_region() -> Secret {
    Secret::from_env("AWS_DEFAULT_REGION")
}

fn default_aws_endpoint() -> Secret {
    Secret::from_env("AWS_ENDPOINT_URL")
}

/// Configuration of an AWS S3 destination.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AwsStorageConfig {
    #[serde(flatten)]
    pub controller: StorageControllerConfig,

    #[serde(default = "default_aws_access_key_id", alias = "accesskeyid")]
    pub access_key_id: Secret,

    #[serde(default = "default_aws_access_key", alias = "accesskey")]
    pub access_key: Secret,

    #[serde(default = "default_aws_session_token", alias = "sessiontoken")]
    pub session_token: Secret,

    #[serde(default = "default_aws_region")]
    pub region: Secret,

    #[serde(default = "default_aws_endpoint")]
    pub endpoint: Secret,

    #[validate(length(min = 1, message = "Bucket cannot be empty"))]
    pub bucket: String,

    #[serde(default, alias = "keyprefix")]
    pub key_prefix: String,

    #[serde(default, alias = "forcepathstyle")]
    pub force_path_style: bool,
}

impl AwsStorageConfig {
    pub fn destination(&self) -> String {
        format!("aws s3 bucket {}", self.bucket)
    }

    pub async fn create_controller(&self) -> Result<Box<dyn Controller>> {
        let access_key_id = self.access_key_id.resolve(false)?;
        let access_key = self.access_key.resolve(!access_key_id.is_empty())?;
        let session_token = self.session_token.resolve(false)?;
        let region = self.region.resolve(false)?;
        let endpoint = self.endpoint.resolve(false)?;

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&self.bucket);
        if !region.is_empty() {
            builder = builder.with_region(region);
        }
        if !access_key_id.is_empty() {
            builder =
                builder.with_access_key_id(access_key_id).with_secret_access_key(access_key);
        }
        if !session_token.is_empty() {
            builder = builder.with_token(session_token);
        }
        if !endpoint.is_empty() {
            builder = builder.with_allow_http(endpoint.starts_with("http://"));
            builder = builder.with_endpoint(endpoint);
        }
        if self.force_path_style {
            builder = builder.with_virtual_hosted_style_request(false);
        }

        let store = builder.build().map_err(|err| {
            AgentError::storage_with_source(
                self.destination(),
                "invalid storage configuration",
                Box::new(err),
            )
        })?;

        let base =
            (!self.key_prefix.is_empty()).then(|| ObjectPath::from(self.key_prefix.as_str()));
        let storage =
            ObjectStoreStorage::connect(Arc::new(store), base, self.destination()).await?;

        Ok(Box::new(StorageController::new(self.controller.clone(), storage)))
    }
}

impl RebaseSecrets for AwsStorageConfig {
    fn rebase_secrets(&mut self, base_dir: &Path) {
        self.access_key_id.rebase_secrets(base_dir);
        self.access_key.rebase_secrets(base_dir);
        self.session_token.rebase_secrets(base_dir);
        self.region.rebase_secrets(base_dir);
        self.endpoint.rebase_secrets(base_dir);
    }
}

fn default_s3_access_key_id() -> Secret {
    Secret::from_env("S3_ACCESS_KEY_ID")
}

fn default_s3_access_key() -> Secret {
    Secret::from_env("S3_SECRET_ACCESS_KEY")
}

fn default_s3_session_token() -> Secret {
    Secret::from_env("S3_SESSION_TOKEN")
}

/// Configuration of a generic S3-compatible destination (MinIO etc.).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct S3StorageConfig {
    #[serde(flatten)]
    pub controller: StorageControllerConfig,

    #[validate(length(min = 1, message = "Endpoint cannot be empty"))]
    pub endpoint: String,

    #[validate(length(min = 1, message = "Bucket cannot be empty"))]
    pub bucket: String,

    #[serde(default = "default_s3_access_key_id", alias = "accesskeyid")]
    pub access_key_id: Secret,

    #[serde(default = "default_s3_access_key", alias = "accesskey")]
    pub access_key: Secret,

    #[serde(default = "default_s3_session_token", alias = "sessiontoken")]
    pub session_token: Secret,

    #[serde(default)]
    pub region: Secret,

    /// Allow plain-http endpoints.
    #[serde(default)]
    pub insecure: bool,
}

impl S3StorageConfig {
    pub fn destination(&self) -> String {
        format!("s3 bucket {} at {}", self.bucket, self.endpoint)
    }

    pub async fn create_controller(&self) -> Result<Box<dyn Controller>> {
        let access_key_id = self.access_key_id.resolve(false)?;
        let access_key = self.access_key.resolve(!access_key_id.is_empty())?;
        let session_token = self.session_token.resolve(false)?;
        let region = self.region.resolve(false)?;

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&self.bucket)
            .with_endpoint(&self.endpoint)
            .with_virtual_hosted_style_request(false)
            .with_allow_http(self.insecure || self.endpoint.starts_with("http://"));
        if !region.is_empty() {
            builder = builder.with_region(region);
        }
        if !access_key_id.is_empty() {
            builder =
                builder.with_access_key_id(access_key_id).with_secret_access_key(access_key);
        }
        if !session_token.is_empty() {
            builder = builder.with_token(session_token);
        }

        let store = builder.build().map_err(|err| {
            AgentError::storage_with_source(
                self.destination(),
                "invalid storage configuration",
                Box::new(err),
            )
        })?;

        let storage =
            ObjectStoreStorage::connect(Arc::new(store), None, self.destination()).await?;

        Ok(Box::new(StorageController::new(self.controller.clone(), storage)))
    }
}

impl RebaseSecrets for S3StorageConfig {
    fn rebase_secrets(&mut self, base_dir: &Path) {
        self.access_key_id.rebase_secrets(base_dir);
        self.access_key.rebase_secrets(base_dir);
        self.session_token.rebase_secrets(base_dir);
        self.region.rebase_secrets(base_dir);
    }
}

fn default_azure_account_name() -> Secret {
    Secret::from_env("AZURE_STORAGE_ACCOUNT")
}

fn default_azure_account_key() -> Secret {
    Secret::from_env("AZURE_STORAGE_KEY")
}

fn default_azure_cloud_domain() -> String {
    "blob.core.windows.net".to_string()
}

/// Configuration of an Azure Blob Storage destination.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AzureStorageConfig {
    #[serde(flatten)]
    pub controller: StorageControllerConfig,

    #[serde(default = "default_azure_account_name", alias = "accountname")]
    pub account_name: Secret,

    #[serde(default = "default_azure_account_key", alias = "accountkey")]
    pub account_key: Secret,

    #[validate(length(min = 1, message = "Container cannot be empty"))]
    pub container: String,

    #[serde(default = "default_azure_cloud_domain", alias = "clouddomain")]
    pub cloud_domain: String,
}

impl AzureStorageConfig {
    pub fn destination(&self) -> String {
        format!("azure container {} at {}", self.container, self.cloud_domain)
    }

    pub async fn create_controller(&self) -> Result<Box<dyn Controller>> {
        let account_name = self.account_name.resolve(true)?;
        let account_key = self.account_key.resolve(true)?;

        let mut builder = MicrosoftAzureBuilder::from_env()
            .with_account(&account_name)
            .with_access_key(&account_key)
            .with_container_name(&self.container);
        if self.cloud_domain != default_azure_cloud_domain() {
            builder = builder
                .with_endpoint(format!("https://{}.{}", account_name, self.cloud_domain));
        }

        let store = builder.build().map_err(|err| {
            AgentError::storage_with_source(
                self.destination(),
                "invalid storage configuration",
                Box::new(err),
            )
        })?;

        let storage =
            ObjectStoreStorage::connect(Arc::new(store), None, self.destination()).await?;

        Ok(Box::new(StorageController::new(self.controller.clone(), storage)))
    }
}

impl RebaseSecrets for AzureStorageConfig {
    fn rebase_secrets(&mut self, base_dir: &Path) {
        self.account_name.rebase_secrets(base_dir);
        self.account_key.rebase_secrets(base_dir);
    }
}

/// Configuration of a Google Cloud Storage destination. Credentials come
/// from the usual application-default mechanisms (`GOOGLE_SERVICE_ACCOUNT`,
/// `GOOGLE_APPLICATION_CREDENTIALS`).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GcpStorageConfig {
    #[serde(flatten)]
    pub controller: StorageControllerConfig,

    #[validate(length(min = 1, message = "Bucket cannot be empty"))]
    pub bucket: String,
}

impl GcpStorageConfig {
    pub fn destination(&self) -> String {
        format!("gcp bucket {}", self.bucket)
    }

    pub async fn create_controller(&self) -> Result<Box<dyn Controller>> {
        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(&self.bucket)
            .build()
            .map_err(|err| {
                AgentError::storage_with_source(
                    self.destination(),
                    "invalid storage configuration",
                    Box::new(err),
                )
            })?;

        let storage =
            ObjectStoreStorage::connect(Arc::new(store), None, self.destination()).await?;

        Ok(Box::new(StorageController::new(self.controller.clone(), storage)))
    }
}

impl RebaseSecrets for GcpStorageConfig {
    fn rebase_secrets(&mut self, _base_dir: &Path) {}
}
