//! # Storage Configuration
//!
//! Configuration for snapshot destinations. [`StorageDefaults`] supplies the
//! global fallbacks; every destination may override any field through its
//! [`StorageControllerConfig`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::config::secret::RebaseSecrets;
use crate::storage::local::LocalStorageConfig;
use crate::storage::object::{
    AwsStorageConfig, AzureStorageConfig, GcpStorageConfig, S3StorageConfig,
};
use crate::storage::swift::SwiftStorageConfig;

/// Global fallback values for all storage destinations.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StorageDefaults {
    /// Minimum interval between two uploads to the same destination.
    #[serde(default = "default_frequency", with = "humantime_serde")]
    pub frequency: Duration,

    /// Number of snapshots to keep per destination; 0 keeps all.
    #[serde(default)]
    pub retain: i64,

    /// Timeout applied to each storage operation.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Prefix of generated object names.
    #[serde(default = "default_name_prefix", alias = "nameprefix")]
    pub name_prefix: String,

    /// Suffix of generated object names.
    #[serde(default = "default_name_suffix", alias = "namesuffix")]
    pub name_suffix: String,

    /// strftime-style format for the timestamp between prefix and suffix.
    #[serde(default = "default_timestamp_format", alias = "timestampformat")]
    pub timestamp_format: String,
}

fn default_frequency() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_name_prefix() -> String {
    "raft-snapshot-".to_string()
}

fn default_name_suffix() -> String {
    ".snap".to_string()
}

fn default_timestamp_format() -> String {
    "%Y-%m-%dT%H-%M-%SZ%z".to_string()
}

impl Default for StorageDefaults {
    fn default() -> Self {
        Self {
            frequency: default_frequency(),
            retain: 0,
            timeout: default_timeout(),
            name_prefix: default_name_prefix(),
            name_suffix: default_name_suffix(),
            timestamp_format: default_timestamp_format(),
        }
    }
}

/// Per-destination overrides of [`StorageDefaults`].
///
/// Every field is optional; an unset field falls back to the corresponding
/// defaults field. A negative retain value counts as unset, a retain of 0
/// explicitly keeps all snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageControllerConfig {
    #[serde(default, with = "humantime_serde::option")]
    pub frequency: Option<Duration>,

    #[serde(default)]
    pub retain: Option<i64>,

    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,

    #[serde(default, alias = "nameprefix")]
    pub name_prefix: Option<String>,

    #[serde(default, alias = "namesuffix")]
    pub name_suffix: Option<String>,

    #[serde(default, alias = "timestampformat")]
    pub timestamp_format: Option<String>,
}

impl StorageControllerConfig {
    pub fn frequency_or(&self, defaults: &StorageDefaults) -> Duration {
        match self.frequency {
            Some(frequency) if !frequency.is_zero() => frequency,
            _ => defaults.frequency,
        }
    }

    pub fn retain_or(&self, defaults: &StorageDefaults) -> i64 {
        match self.retain {
            Some(retain) if retain >= 0 => retain,
            _ => defaults.retain,
        }
    }

    pub fn timeout_or(&self, defaults: &StorageDefaults) -> Duration {
        match self.timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => defaults.timeout,
        }
    }

    pub fn name_prefix_or<'a>(&'a self, defaults: &'a StorageDefaults) -> &'a str {
        match self.name_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => prefix,
            _ => &defaults.name_prefix,
        }
    }

    pub fn name_suffix_or<'a>(&'a self, defaults: &'a StorageDefaults) -> &'a str {
        match self.name_suffix.as_deref() {
            Some(suffix) if !suffix.is_empty() => suffix,
            _ => &defaults.name_suffix,
        }
    }

    pub fn timestamp_format_or<'a>(&'a self, defaults: &'a StorageDefaults) -> &'a str {
        match self.timestamp_format.as_deref() {
            Some(format) if !format.is_empty() => format,
            _ => &defaults.timestamp_format,
        }
    }
}

/// The set of configured snapshot destinations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StoragesConfig {
    #[validate(nested)]
    pub aws: Option<AwsStorageConfig>,

    #[validate(nested)]
    pub azure: Option<AzureStorageConfig>,

    #[validate(nested)]
    pub gcp: Option<GcpStorageConfig>,

    #[validate(nested)]
    pub local: Option<LocalStorageConfig>,

    #[validate(nested)]
    pub swift: Option<SwiftStorageConfig>,

    #[validate(nested)]
    pub s3: Option<S3StorageConfig>,
}

impl StoragesConfig {
    /// Whether at least one destination is configured.
    pub fn has_storages(&self) -> bool {
        self.aws.is_some()
            || self.azure.is_some()
            || self.gcp.is_some()
            || self.local.is_some()
            || self.swift.is_some()
            || self.s3.is_some()
    }
}

impl RebaseSecrets for StoragesConfig {
    fn rebase_secrets(&mut self, base_dir: &Path) {
        self.aws.rebase_secrets(base_dir);
        self.azure.rebase_secrets(base_dir);
        self.gcp.rebase_secrets(base_dir);
        self.local.rebase_secrets(base_dir);
        self.swift.rebase_secrets(base_dir);
        self.s3.rebase_secrets(base_dir);
    }
}
