//! # OpenStack Swift Storage
//!
//! Talks to Swift's object API directly over HTTP. Authentication supports
//! the legacy v1.0 scheme (auth URL + user + API key) and Keystone v2.0
//! password credentials when a tenant is configured. Expired tokens are
//! re-acquired transparently.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tracing::debug;
use validator::Validate;

use crate::config::secret::{RebaseSecrets, Secret};
use crate::errors::{AgentError, Result};
use crate::storage::config::StorageControllerConfig;
use crate::storage::controller::{Controller, StorageController};
use crate::storage::{matches_name, Snapshot, SnapshotStorage};

fn default_swift_username() -> Secret {
    Secret::from_env("SWIFT_USERNAME")
}

fn default_swift_api_key() -> Secret {
    Secret::from_env("SWIFT_API_KEY")
}

fn default_swift_region() -> Secret {
    Secret::from_env("SWIFT_REGION")
}

/// Configuration of an OpenStack Swift destination.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SwiftStorageConfig {
    #[serde(flatten)]
    pub controller: StorageControllerConfig,

    #[validate(length(min = 1, message = "Container cannot be empty"))]
    pub container: String,

    #[serde(default = "default_swift_username", alias = "username")]
    pub user_name: Secret,

    #[serde(default = "default_swift_api_key", alias = "apikey")]
    pub api_key: Secret,

    #[validate(url(message = "AuthUrl must be a valid url"))]
    pub auth_url: String,

    #[serde(default = "default_swift_region")]
    pub region: Secret,

    /// Keystone tenant; when set, v2.0 password authentication is used.
    #[serde(default, alias = "tenantid")]
    pub tenant_id: Option<String>,
}

impl SwiftStorageConfig {
    pub fn destination(&self) -> String {
        format!("swift container {}", self.container)
    }

    pub async fn create_controller(&self) -> Result<Box<dyn Controller>> {
        let storage = SwiftStorage::connect(self).await?;
        Ok(Box::new(StorageController::new(self.controller.clone(), storage)))
    }
}

impl RebaseSecrets for SwiftStorageConfig {
    fn rebase_secrets(&mut self, base_dir: &Path) {
        self.user_name.rebase_secrets(base_dir);
        self.api_key.rebase_secrets(base_dir);
        self.region.rebase_secrets(base_dir);
    }
}

#[derive(Clone)]
struct SwiftSession {
    storage_url: String,
    token: String,
}

/// Swift implementation of [`SnapshotStorage`].
pub struct SwiftStorage {
    http: reqwest::Client,
    config: SwiftStorageConfig,
    session: RwLock<SwiftSession>,
}

/// Entry of a Swift container listing.
#[derive(Debug, Clone, Deserialize)]
pub struct SwiftObject {
    name: String,
    last_modified: String,
    #[serde(skip)]
    modified: Option<DateTime<Utc>>,
}

impl SwiftObject {
    fn with_parsed_timestamp(mut self) -> Self {
        // Swift reports naive UTC timestamps like 2024-01-15T16:41:49.390270
        self.modified = NaiveDateTime::parse_from_str(&self.last_modified, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc());
        self
    }
}

impl SwiftStorage {
    /// Authenticate against the configured auth endpoint and verify the
    /// container is accessible.
    pub async fn connect(config: &SwiftStorageConfig) -> Result<Self> {
        let http = reqwest::Client::new();
        let session = authenticate(&http, config).await?;

        let storage = Self { http, config: config.clone(), session: RwLock::new(session) };

        let session = storage.session().await;
        let response = storage
            .http
            .get(storage.container_url(&session, Some("limit=1")))
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(|err| storage.storage_error("could not reach container", Box::new(err)))?;
        if !response.status().is_success() {
            return Err(AgentError::storage(
                storage.destination(),
                format!("invalid container {}: {}", config.container, response.status()),
            ));
        }

        debug!(destination = %storage.destination(), "Successfully connected");

        Ok(storage)
    }

    fn storage_error(
        &self,
        message: &str,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> AgentError {
        AgentError::storage_with_source(self.destination(), message, source)
    }

    fn container_url(&self, session: &SwiftSession, query: Option<&str>) -> String {
        let base = format!(
            "{}/{}",
            session.storage_url.trim_end_matches('/'),
            urlencoding::encode(&self.config.container)
        );
        match query {
            Some(query) => format!("{}?format=json&{}", base, query),
            None => format!("{}?format=json", base),
        }
    }

    fn object_url(&self, session: &SwiftSession, name: &str) -> String {
        format!(
            "{}/{}/{}",
            session.storage_url.trim_end_matches('/'),
            urlencoding::encode(&self.config.container),
            urlencoding::encode(name)
        )
    }

    async fn session(&self) -> SwiftSession {
        self.session.read().await.clone()
    }

    async fn reauthenticate(&self) -> Result<SwiftSession> {
        let session = authenticate(&self.http, &self.config).await?;
        *self.session.write().await = session.clone();
        Ok(session)
    }
}

#[async_trait]
impl SnapshotStorage for SwiftStorage {
    type Object = SwiftObject;

    fn destination(&self) -> String {
        format!("swift container {}", self.config.container)
    }

    async fn upload_snapshot(&self, name: &str, snapshot: &mut Snapshot) -> Result<()> {
        let mut session = self.session().await;
        let mut reauthenticated = false;

        loop {
            let body = reqwest::Body::wrap_stream(ReaderStream::new(
                snapshot
                    .shared_handle()
                    .await
                    .map_err(|err| AgentError::io(err, "could not reopen snapshot"))?,
            ));

            let response = self
                .http
                .put(self.object_url(&session, name))
                .header("X-Auth-Token", &session.token)
                .header(reqwest::header::CONTENT_LENGTH, snapshot.size())
                .body(body)
                .send()
                .await
                .map_err(|err| self.storage_error("could not upload snapshot", Box::new(err)))?;

            if response.status() == StatusCode::UNAUTHORIZED && !reauthenticated {
                reauthenticated = true;
                session = self.reauthenticate().await?;
                snapshot
                    .rewind()
                    .await
                    .map_err(|err| AgentError::io(err, "could not rewind snapshot"))?;
                continue;
            }

            return match response.error_for_status() {
                Ok(_) => Ok(()),
                Err(err) => {
                    Err(self.storage_error("could not upload snapshot", Box::new(err)))
                }
            };
        }
    }

    async fn delete_snapshot(&self, object: &Self::Object) -> Result<()> {
        let mut session = self.session().await;
        let mut reauthenticated = false;

        loop {
            let response = self
                .http
                .delete(self.object_url(&session, &object.name))
                .header("X-Auth-Token", &session.token)
                .send()
                .await
                .map_err(|err| self.storage_error("could not delete snapshot", Box::new(err)))?;

            if response.status() == StatusCode::UNAUTHORIZED && !reauthenticated {
                reauthenticated = true;
                session = self.reauthenticate().await?;
                continue;
            }
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(());
            }

            return match response.error_for_status() {
                Ok(_) => Ok(()),
                Err(err) => {
                    Err(self.storage_error("could not delete snapshot", Box::new(err)))
                }
            };
        }
    }

    async fn list_snapshots(&self, prefix: &str, suffix: &str) -> Result<Vec<Self::Object>> {
        let mut session = self.session().await;
        let mut reauthenticated = false;

        loop {
            let query = format!("prefix={}", urlencoding::encode(prefix));
            let response = self
                .http
                .get(self.container_url(&session, Some(&query)))
                .header("X-Auth-Token", &session.token)
                .send()
                .await
                .map_err(|err| self.storage_error("could not list snapshots", Box::new(err)))?;

            if response.status() == StatusCode::UNAUTHORIZED && !reauthenticated {
                reauthenticated = true;
                session = self.reauthenticate().await?;
                continue;
            }

            let response = response
                .error_for_status()
                .map_err(|err| self.storage_error("could not list snapshots", Box::new(err)))?;

            let objects: Vec<SwiftObject> = response
                .json()
                .await
                .map_err(|err| self.storage_error("could not parse listing", Box::new(err)))?;

            return Ok(objects
                .into_iter()
                .filter(|object| matches_name(&object.name, prefix, suffix))
                .map(SwiftObject::with_parsed_timestamp)
                .collect());
        }
    }

    fn last_modified(&self, object: &Self::Object) -> DateTime<Utc> {
        object.modified.unwrap_or_default()
    }
}

/// Acquire a storage URL and auth token, using Keystone v2.0 when a tenant
/// is configured and the legacy v1.0 handshake otherwise.
async fn authenticate(
    http: &reqwest::Client,
    config: &SwiftStorageConfig,
) -> Result<SwiftSession> {
    let user = config.user_name.resolve(true)?;
    let key = config.api_key.resolve(true)?;

    match &config.tenant_id {
        Some(tenant_id) => {
            keystone_v2_auth(http, config, &user, &key, tenant_id).await
        }
        None => v1_auth(http, config, &user, &key).await,
    }
}

async fn v1_auth(
    http: &reqwest::Client,
    config: &SwiftStorageConfig,
    user: &str,
    key: &str,
) -> Result<SwiftSession> {
    let destination = config.destination();

    let response = http
        .get(&config.auth_url)
        .header("X-Auth-User", user)
        .header("X-Auth-Key", key)
        .send()
        .await
        .map_err(|err| {
            AgentError::storage_with_source(&destination, "authentication failed", Box::new(err))
        })?
        .error_for_status()
        .map_err(|err| {
            AgentError::storage_with_source(&destination, "invalid credentials", Box::new(err))
        })?;

    let header = |name: &str| -> Result<String> {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                AgentError::storage(
                    &destination,
                    format!("auth response is missing the {} header", name),
                )
            })
    };

    Ok(SwiftSession { storage_url: header("X-Storage-Url")?, token: header("X-Auth-Token")? })
}

#[derive(Debug, Deserialize)]
struct KeystoneAuthResponse {
    access: KeystoneAccess,
}

#[derive(Debug, Deserialize)]
struct KeystoneAccess {
    token: KeystoneToken,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<KeystoneService>,
}

#[derive(Debug, Deserialize)]
struct KeystoneToken {
    id: String,
}

#[derive(Debug, Deserialize)]
struct KeystoneService {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<KeystoneEndpoint>,
}

#[derive(Debug, Deserialize)]
struct KeystoneEndpoint {
    #[serde(default)]
    region: String,
    #[serde(rename = "publicURL")]
    public_url: String,
}

async fn keystone_v2_auth(
    http: &reqwest::Client,
    config: &SwiftStorageConfig,
    user: &str,
    key: &str,
    tenant_id: &str,
) -> Result<SwiftSession> {
    let destination = config.destination();
    let region = config.region.resolve(false)?;

    let payload = serde_json::json!({
        "auth": {
            "passwordCredentials": { "username": user, "password": key },
            "tenantId": tenant_id,
        }
    });

    let response: KeystoneAuthResponse = http
        .post(format!("{}/tokens", config.auth_url.trim_end_matches('/')))
        .json(&payload)
        .send()
        .await
        .map_err(|err| {
            AgentError::storage_with_source(&destination, "authentication failed", Box::new(err))
        })?
        .error_for_status()
        .map_err(|err| {
            AgentError::storage_with_source(&destination, "invalid credentials", Box::new(err))
        })?
        .json()
        .await
        .map_err(|err| {
            AgentError::storage_with_source(
                &destination,
                "could not parse auth response",
                Box::new(err),
            )
        })?;

    let storage_url = response
        .access
        .service_catalog
        .iter()
        .filter(|service| service.service_type == "object-store")
        .flat_map(|service| service.endpoints.iter())
        .find(|endpoint| region.is_empty() || endpoint.region == region)
        .map(|endpoint| endpoint.public_url.clone())
        .ok_or_else(|| {
            AgentError::storage(&destination, "no object-store endpoint in service catalog")
        })?;

    Ok(SwiftSession { storage_url, token: response.access.token.id })
}
