//! # Vault Client
//!
//! A leader-aware client for the vault cluster. Raft snapshots can only be
//! taken from the current leader, so the client probes the configured nodes
//! until it finds one that reports itself as leader, optionally following
//! the cluster's own leader hint, and keeps that connection until it stops
//! being the leader. Auth tokens are refreshed proactively at half of their
//! lease.

pub mod auth;
mod sigv4;

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::config::secret::RebaseSecrets;
use crate::errors::{AgentError, Result};
use crate::storage::to_delta;
use auth::{AuthConfig, AuthMethod};

pub use auth::LoginLease;

fn default_vault_timeout() -> Duration {
    Duration::from_secs(60)
}

/// The `vault` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    /// Urls of the cluster's nodes, probed in order. May be left empty when
    /// the canonical VAULT_ADDR environment variable is set.
    #[serde(default)]
    #[validate(length(min = 1, message = "At least one vault node url is required"))]
    pub urls: Vec<String>,

    /// Trust the cluster's self-reported leader address and probe it first.
    #[serde(default, alias = "autodetectleader")]
    pub auto_detect_leader: bool,

    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,

    /// Overall timeout for requests against the vault api.
    #[serde(default = "default_vault_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[validate(nested)]
    pub auth: AuthConfig,
}

impl RebaseSecrets for VaultConfig {
    fn rebase_secrets(&mut self, base_dir: &Path) {
        self.auth.rebase_secrets(base_dir);
    }
}

/// An authenticated connection to a single vault node.
#[derive(Debug, Clone)]
struct VaultConnection {
    address: String,
    token: String,
}

/// Client for taking raft snapshots from the cluster leader.
pub struct VaultClient {
    http: reqwest::Client,
    nodes: Vec<String>,
    auto_detect_leader: bool,
    auth: AuthMethod,
    connection: Option<VaultConnection>,
    auth_expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct LeaderResponse {
    #[serde(default)]
    is_self: bool,
    #[serde(default)]
    leader_address: String,
}

impl VaultClient {
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let auth = AuthMethod::from_config(&config.auth)?;

        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(config.insecure);
        if !config.timeout.is_zero() {
            builder = builder.timeout(config.timeout);
        }
        let http = builder.build().map_err(|err| {
            AgentError::vault_with_source("could not create http client", Box::new(err))
        })?;

        Ok(Self::new(
            http,
            config.urls.iter().map(|url| normalize_address(url)).collect(),
            config.auto_detect_leader,
            auth,
        ))
    }

    pub fn new(
        http: reqwest::Client,
        nodes: Vec<String>,
        auto_detect_leader: bool,
        auth: AuthMethod,
    ) -> Self {
        Self { http, nodes, auto_detect_leader, auth, connection: None, auth_expires: None }
    }

    /// Stream a raft snapshot from the cluster leader into `writer`.
    pub async fn take_snapshot<W>(&mut self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.ensure_leader().await?;

        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| AgentError::vault("not connected to a leader"))?;

        let mut response = self
            .http
            .get(format!("{}/v1/sys/storage/raft/snapshot", connection.address))
            .header("X-Vault-Token", &connection.token)
            .send()
            .await
            .map_err(|err| {
                AgentError::vault_with_source("snapshot request failed", Box::new(err))
            })?
            .error_for_status()
            .map_err(|err| {
                AgentError::vault_with_source("snapshot request was rejected", Box::new(err))
            })?;

        while let Some(chunk) = response.chunk().await.map_err(|err| {
            AgentError::vault_with_source("snapshot transfer failed", Box::new(err))
        })? {
            writer
                .write_all(&chunk)
                .await
                .map_err(|err| AgentError::io(err, "could not write snapshot"))?;
        }

        writer
            .flush()
            .await
            .map_err(|err| AgentError::io(err, "could not flush snapshot"))?;

        Ok(())
    }

    /// Make sure the current connection points at the cluster leader,
    /// re-probing the configured nodes if necessary.
    ///
    /// Every node address is probed at most once per call, so the search
    /// terminates on any finite node list even when leader hints point at
    /// nodes that already failed.
    async fn ensure_leader(&mut self) -> Result<()> {
        let mut detected_leader = String::new();

        if let Some(mut connection) = self.connection.take() {
            let (leader, hint) = self.is_connected_to_leader(&mut connection).await;
            if leader {
                self.connection = Some(connection);
                return Ok(());
            }

            detected_leader = hint;
            // keep the stale connection's address around so it can be
            // skipped below
            self.connection = Some(connection);
        }

        let mut candidates: VecDeque<String> = self.nodes.clone().into();
        if !detected_leader.is_empty() {
            pin_candidate(&mut candidates, normalize_address(&detected_leader));
        }
        if let Some(current) = self.connection.take() {
            debug!(node = %current.address, "ignoring currently connected node");
            candidates.retain(|candidate| candidate != &current.address);
        }

        let mut probed: HashSet<String> = HashSet::new();

        while let Some(address) = candidates.pop_front() {
            if !probed.insert(address.clone()) {
                continue;
            }

            debug!(node = %address, "connecting...");
            let mut connection = VaultConnection { address: address.clone(), token: String::new() };

            if let Err(err) = self.refresh_auth(&mut connection, true).await {
                warn!(node = %address, error = %err, "could not authenticate against node");
                continue;
            }

            let (leader, hint) = self.probe_leader(&connection).await;
            debug!(node = %address, leader = leader, detected_leader = %hint, "connection established");

            if leader {
                info!(node = %address, "(re-)connected to leader");
                self.connection = Some(connection);
                return Ok(());
            }

            if self.auto_detect_leader && !hint.is_empty() {
                let hint = normalize_address(&hint);
                if !probed.contains(&hint) {
                    info!(node = %hint, "auto-detected leader-node");
                    pin_candidate(&mut candidates, hint);
                }
            }
        }

        self.connection = None;
        Err(AgentError::vault("could not connect to leader"))
    }

    /// Whether the given connection still authenticates and reports itself
    /// as the cluster leader. The returned hint is the cluster's leader
    /// address, cleared unless leader auto-detection is enabled.
    async fn is_connected_to_leader(&mut self, connection: &mut VaultConnection) -> (bool, String) {
        if let Err(err) = self.refresh_auth(connection, false).await {
            warn!(node = %connection.address, error = %err, "unable to refresh auth");
            return (false, String::new());
        }

        let (leader, detected_leader) = self.probe_leader(connection).await;
        if !self.auto_detect_leader {
            debug!(
                node = %connection.address,
                detected_leader = %detected_leader,
                "ignoring auto-detected leader due to configuration"
            );
            return (leader, String::new());
        }

        (leader, detected_leader)
    }

    /// Refresh the connection's auth token. Within the token's half-life
    /// this is a no-op unless `force` is set; switching connections always
    /// forces a fresh login.
    async fn refresh_auth(&mut self, connection: &mut VaultConnection, force: bool) -> Result<()> {
        let expired = self.auth_expires.map_or(true, |expires| Utc::now() >= expires);
        if !force && !expired && !connection.token.is_empty() {
            return Ok(());
        }

        let lease = self.auth.login(&self.http, &connection.address).await?;
        connection.token = lease.client_token;
        self.auth_expires = Some(Utc::now() + to_delta(lease.ttl) / 2);

        Ok(())
    }

    /// Ask a node whether it is the leader. Probe failures count as "not
    /// leader, no hint".
    async fn probe_leader(&self, connection: &VaultConnection) -> (bool, String) {
        let mut request = self.http.get(format!("{}/v1/sys/leader", connection.address));
        if !connection.token.is_empty() {
            request = request.header("X-Vault-Token", &connection.token);
        }

        let response = match request.send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => response,
            Err(err) => {
                warn!(node = %connection.address, error = %err, "could not determine leader-state of node");
                return (false, String::new());
            }
        };

        match response.json::<LeaderResponse>().await {
            Ok(leader) => (leader.is_self, leader.leader_address),
            Err(err) => {
                warn!(node = %connection.address, error = %err, "could not parse leader-state of node");
                (false, String::new())
            }
        }
    }
}

/// Move `address` to the front of the candidate list, dropping any other
/// occurrence of it.
fn pin_candidate(candidates: &mut VecDeque<String>, address: String) {
    candidates.retain(|candidate| candidate != &address);
    candidates.push_front(address);
}

fn normalize_address(address: &str) -> String {
    address.trim_end_matches('/').to_string()
}
