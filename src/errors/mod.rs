//! # Error Types
//!
//! Error types for the snapshot agent using `thiserror`.

/// Custom result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Main error type for the snapshot agent
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    /// Configuration errors (invalid document, unknown auth method, ...)
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A required secret could not be resolved
    #[error("Could not resolve secret '{reference}': {message}")]
    Secret { reference: String, message: String },

    /// Vault is unreachable or no node could be authenticated as leader
    #[error("Vault error: {message}")]
    Vault {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The captured snapshot contained no data
    #[error("Snapshot contains no data")]
    SnapshotEmpty,

    /// Storage backend errors, scoped to a single destination
    #[error("Storage error for {destination}: {message}")]
    Storage {
        destination: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// HTTP errors from the vault or metadata clients
    #[error("HTTP error: {context}")]
    Http {
        #[source]
        source: reqwest::Error,
        context: String,
    },

    /// Metrics publisher errors
    #[error("Metrics error: {message}")]
    Metrics {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },
}

impl AgentError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a secret-resolution error
    pub fn secret<R: Into<String>, M: Into<String>>(reference: R, message: M) -> Self {
        Self::Secret { reference: reference.into(), message: message.into() }
    }

    /// Create a vault error
    pub fn vault<S: Into<String>>(message: S) -> Self {
        Self::Vault { message: message.into(), source: None }
    }

    /// Create a vault error with source
    pub fn vault_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Vault { message: message.into(), source: Some(source) }
    }

    /// Create a storage error scoped to a destination
    pub fn storage<D: Into<String>, M: Into<String>>(destination: D, message: M) -> Self {
        Self::Storage { destination: destination.into(), message: message.into(), source: None }
    }

    /// Create a storage error with source
    pub fn storage_with_source<D: Into<String>, M: Into<String>>(
        destination: D,
        message: M,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Storage {
            destination: destination.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a metrics error
    pub fn metrics<S: Into<String>>(message: S) -> Self {
        Self::Metrics { message: message.into(), source: None }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout { operation: operation.into() }
    }

    /// Create an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }
}

// Error conversions for common external error types
impl From<std::io::Error> for AgentError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http { source: error, context: "HTTP request failed".to_string() }
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for AgentError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::config(format!("Validation failed: {}", message))
    }
}

impl From<prometheus::Error> for AgentError {
    fn from(error: prometheus::Error) -> Self {
        Self::Metrics {
            message: "Prometheus registry error".to_string(),
            source: Some(Box::new(error)),
        }
    }
}
