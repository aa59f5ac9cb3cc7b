//! # Configuration
//!
//! The agent reads one configuration document (YAML, JSON or TOML), layered
//! with `VRSA_*` environment variables. Relative `file://` secrets are
//! rebased against the document's directory exactly once at load time, and
//! the whole document is validated before it is handed to the agent. On
//! hot reloads an invalid document is rejected and the previous
//! configuration stays in effect.

pub mod secret;
pub mod watcher;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{AgentError, Result};
use crate::metrics::CollectorConfig;
use crate::storage::{StorageDefaults, StoragesConfig};
use crate::vault::auth::AuthMethod;
use crate::vault::VaultConfig;

pub use secret::{RebaseSecrets, Secret};
pub use watcher::watch_config;

/// Environment prefix for configuration overrides, e.g.
/// `VRSA_SNAPSHOTS_FREQUENCY=30m`.
pub const ENV_PREFIX: &str = "VRSA";

/// Name of the configuration file searched for when none is given.
const CONFIG_FILE_NAME: &str = "snapshots";
const CONFIG_FILE_SEARCH_PATHS: &[&str] = &["/etc/vault.d", "."];
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json", "toml"];

/// Root of the agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[validate(nested)]
    pub vault: VaultConfig,

    #[serde(default)]
    #[validate(nested)]
    pub snapshots: SnapshotsConfig,

    #[serde(default)]
    #[validate(nested)]
    pub metrics: CollectorConfig,
}

/// The `snapshots` section: global defaults plus the configured storages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotsConfig {
    #[serde(flatten)]
    pub defaults: StorageDefaults,

    /// Directory for the snapshot temp file; the system temp directory
    /// when unset.
    #[serde(default, alias = "tempdir")]
    pub temp_dir: Option<PathBuf>,

    #[serde(default)]
    #[validate(nested)]
    pub storages: StoragesConfig,
}

impl AgentConfig {
    /// Validate the whole document, including the cross-field rules the
    /// derive cannot express.
    pub fn validate_config(&self) -> Result<()> {
        Validate::validate(self).map_err(AgentError::from)?;

        // exactly one auth method must be selected
        AuthMethod::from_config(&self.vault.auth)?;

        if !self.snapshots.storages.has_storages() {
            return Err(AgentError::config("no storage configured for snapshots"));
        }

        Ok(())
    }
}

impl RebaseSecrets for AgentConfig {
    fn rebase_secrets(&mut self, base_dir: &Path) {
        self.vault.rebase_secrets(base_dir);
        self.snapshots.storages.rebase_secrets(base_dir);
    }
}

/// Load, rebase and validate the configuration document.
///
/// When `file` is `None` the usual locations are searched
/// (`/etc/vault.d/snapshots.*`, `./snapshots.*`). Returns the parsed
/// configuration together with the absolute path of the document it came
/// from, which the caller hands to the change watcher.
pub fn load_config(file: Option<&Path>) -> Result<(AgentConfig, PathBuf)> {
    let file = match file {
        Some(file) => file.to_path_buf(),
        None => find_config_file()?,
    };
    let file = file
        .canonicalize()
        .map_err(|err| {
            AgentError::config_with_source(
                format!("could not resolve config file '{}'", file.display()),
                Box::new(err),
            )
        })?;

    let parsed = config::Config::builder()
        .add_source(config::File::from(file.as_path()))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("_")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("vault.urls"),
        )
        .build()?;

    let mut agent_config: AgentConfig = parsed.try_deserialize()?;

    // the canonical VAULT_ADDR is accepted as an alias for the vault url
    if agent_config.vault.urls.is_empty() {
        if let Ok(addr) = std::env::var("VAULT_ADDR") {
            if !addr.is_empty() {
                agent_config.vault.urls.push(addr);
            }
        }
    }

    if let Some(base_dir) = file.parent() {
        agent_config.rebase_secrets(base_dir);
    }

    agent_config.validate_config()?;

    Ok((agent_config, file))
}

fn find_config_file() -> Result<PathBuf> {
    for dir in CONFIG_FILE_SEARCH_PATHS {
        for ext in CONFIG_FILE_EXTENSIONS {
            let candidate = Path::new(dir).join(format!("{}.{}", CONFIG_FILE_NAME, ext));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(AgentError::config(format!(
        "no configuration file '{}.[{}]' found in {}",
        CONFIG_FILE_NAME,
        CONFIG_FILE_EXTENSIONS.join("|"),
        CONFIG_FILE_SEARCH_PATHS.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn minimal_yaml(storage_path: &Path) -> String {
        format!(
            r#"
vault:
  urls: ["https://vault:8200"]
  auth:
    token: "s.testtoken"
snapshots:
  frequency: 30m
  storages:
    local:
      path: {}
"#,
            storage_path.display()
        )
    }

    #[test]
    fn test_loads_yaml_document() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_config(dir.path(), "snapshots.yaml", &minimal_yaml(dir.path()));

        let (config, path) = load_config(Some(&file)).unwrap();
        assert_eq!(config.vault.urls, vec!["https://vault:8200"]);
        assert_eq!(config.snapshots.defaults.frequency, std::time::Duration::from_secs(1800));
        assert!(config.snapshots.storages.local.is_some());
        assert!(path.is_absolute());
    }

    #[test]
    fn test_storage_overrides_inherit_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_config(
            dir.path(),
            "snapshots.yaml",
            &format!(
                r#"
vault:
  urls: ["https://vault:8200"]
  auth:
    token: "s.testtoken"
snapshots:
  frequency: 1h
  retain: 3
  storages:
    local:
      path: {}
      frequency: 2h
"#,
                dir.path().display()
            ),
        );

        let (config, _) = load_config(Some(&file)).unwrap();
        let local = config.snapshots.storages.local.unwrap();
        let defaults = &config.snapshots.defaults;

        assert_eq!(
            local.controller.frequency_or(defaults),
            std::time::Duration::from_secs(7200)
        );
        assert_eq!(local.controller.retain_or(defaults), 3);
        assert_eq!(local.controller.name_prefix_or(defaults), "raft-snapshot-");
    }

    #[test]
    fn test_rejects_config_without_auth() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_config(
            dir.path(),
            "snapshots.yaml",
            &format!(
                r#"
vault:
  urls: ["https://vault:8200"]
  auth: {{}}
snapshots:
  storages:
    local:
      path: {}
"#,
                dir.path().display()
            ),
        );

        assert!(load_config(Some(&file)).is_err());
    }

    #[test]
    fn test_rejects_config_without_storages() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_config(
            dir.path(),
            "snapshots.yaml",
            r#"
vault:
  urls: ["https://vault:8200"]
  auth:
    token: "s.testtoken"
"#,
        );

        assert!(load_config(Some(&file)).is_err());
    }

    #[test]
    fn test_rebases_relative_secret_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_config(
            dir.path(),
            "snapshots.yaml",
            &format!(
                r#"
vault:
  urls: ["https://vault:8200"]
  auth:
    kubernetes:
      role: "vrsa"
      jwtToken: "file://service-account.jwt"
snapshots:
  storages:
    local:
      path: {}
"#,
                dir.path().display()
            ),
        );

        let (config, _) = load_config(Some(&file)).unwrap();
        let kubernetes = config.vault.auth.kubernetes.unwrap();
        let expected = dir.path().canonicalize().unwrap().join("service-account.jwt");
        assert_eq!(
            kubernetes.jwt_token.reference(),
            format!("file://{}", expected.display())
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_config(Some(Path::new("/does/not/exist.yaml"))).is_err());
    }

    #[test]
    fn test_vault_addr_is_accepted_as_url_alias() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_config(
            dir.path(),
            "snapshots.yaml",
            &format!(
                r#"
vault:
  auth:
    token: "s.testtoken"
snapshots:
  storages:
    local:
      path: {}
"#,
                dir.path().display()
            ),
        );

        std::env::set_var("VAULT_ADDR", "https://alias:8200");
        let result = load_config(Some(&file));
        std::env::remove_var("VAULT_ADDR");

        let (config, _) = result.unwrap();
        assert_eq!(config.vault.urls, vec!["https://alias:8200"]);
    }
}
