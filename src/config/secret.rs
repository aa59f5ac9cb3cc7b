//! # Secret Indirection
//!
//! Configuration values that may reference their actual content indirectly:
//! `env://NAME` reads an environment variable, `file://PATH` reads a file,
//! anything else is taken literally. Resolution happens lazily at the point
//! of use, so rotated credentials take effect without a restart.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{AgentError, Result};

const ENV_PREFIX: &str = "env://";
const FILE_PREFIX: &str = "file://";

/// A lazily-resolved, possibly indirect configuration value.
///
/// `Debug` and `Serialize` never expose literal secret values; indirect
/// references (`env://`, `file://`) are shown as-is since they only name
/// the source of the value.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Create a secret holding a literal value.
    pub fn from_literal(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Create a secret referencing an environment variable.
    pub fn from_env(name: impl AsRef<str>) -> Self {
        Self(format!("{}{}", ENV_PREFIX, name.as_ref()))
    }

    /// Create a secret referencing a file.
    pub fn from_file(path: impl AsRef<str>) -> Self {
        Self(format!("{}{}", FILE_PREFIX, path.as_ref()))
    }

    /// Whether this secret holds no reference or value at all.
    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw reference, e.g. `env://VAULT_TOKEN` or a literal value.
    pub fn reference(&self) -> &str {
        &self.0
    }

    /// Resolve the secret to its actual value.
    ///
    /// When `required` is false, a missing environment variable or a
    /// non-existent file yields an empty string instead of an error.
    pub fn resolve(&self, required: bool) -> Result<String> {
        if let Some(name) = self.0.strip_prefix(ENV_PREFIX) {
            return match std::env::var(name) {
                Ok(value) => Ok(value),
                Err(_) if !required => Ok(String::new()),
                Err(_) => Err(AgentError::secret(
                    &self.0,
                    format!("environment variable {} is not present", name),
                )),
            };
        }

        if let Some(file) = self.0.strip_prefix(FILE_PREFIX) {
            return match std::fs::read_to_string(file) {
                Ok(value) => Ok(value),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound && !required => {
                    Ok(String::new())
                }
                Err(err) => {
                    Err(AgentError::secret(&self.0, format!("could not read file {}: {}", file, err)))
                }
            };
        }

        Ok(self.0.clone())
    }

    /// Rebase a relative `file://` reference against the given base directory.
    ///
    /// Non-file references and absolute paths are returned unchanged. This is
    /// applied exactly once, when the configuration document is loaded, so
    /// relative paths are interpreted relative to the document that declared
    /// them rather than the process working directory.
    pub fn rebase_file(&self, base_dir: &Path) -> Secret {
        let Some(file) = self.0.strip_prefix(FILE_PREFIX) else {
            return self.clone();
        };

        if Path::new(file).is_absolute() {
            return self.clone();
        }

        let rebased: PathBuf = base_dir.join(file);
        Secret::from_file(rebased.to_string_lossy())
    }

    fn is_indirect(&self) -> bool {
        self.0.starts_with(ENV_PREFIX) || self.0.starts_with(FILE_PREFIX)
    }
}

impl fmt::Display for Secret {
    /// Resolves in non-required mode; read errors yield an empty string.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resolve(false).unwrap_or_default())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            write!(f, "Secret()")
        } else if self.is_indirect() {
            write!(f, "Secret({})", self.0)
        } else {
            write!(f, "Secret([REDACTED])")
        }
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Serialize for Secret {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if self.is_indirect() || self.is_zero() {
            serializer.serialize_str(&self.0)
        } else {
            serializer.serialize_str("[REDACTED]")
        }
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Secret(value))
    }
}

/// Rebases every `Secret`-typed field of a configuration structure against
/// the directory of the configuration document it was loaded from.
///
/// Implementations descend recursively into nested configuration structures;
/// zero or non-file secrets are left untouched by [`Secret::rebase_file`].
pub trait RebaseSecrets {
    fn rebase_secrets(&mut self, base_dir: &Path);
}

impl RebaseSecrets for Secret {
    fn rebase_secrets(&mut self, base_dir: &Path) {
        *self = self.rebase_file(base_dir);
    }
}

impl<T: RebaseSecrets> RebaseSecrets for Option<T> {
    fn rebase_secrets(&mut self, base_dir: &Path) {
        if let Some(inner) = self {
            inner.rebase_secrets(base_dir);
        }
    }
}
