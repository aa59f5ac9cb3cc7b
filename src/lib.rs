//! # Vault Raft Snapshot Agent
//!
//! A long-running agent that periodically takes snapshots of a vault
//! cluster's raft database and uploads them to one or more storage
//! destinations (local filesystem, AWS S3, S3-compatible endpoints, Azure
//! Blob, Google Cloud Storage, OpenStack Swift).
//!
//! ## Architecture
//!
//! ```text
//! Agent loop ── VaultClient ──> leader node ──> snapshot temp file
//!     │
//!     └── Manager ──> StorageController per destination ──> backend
//!                       (cadence, naming, retention)
//! ```
//!
//! Snapshots can only be taken from the cluster leader, so the
//! [`vault::VaultClient`] discovers the leader across the configured nodes
//! and keeps its auth token fresh. Each destination decides on its own
//! cadence whether a captured snapshot is uploaded and prunes snapshots
//! exceeding its retention; the [`storage::Manager`] reduces all
//! destinations' next-upload times into the agent's single wake-up instant.
//! The agent is stateless across restarts and recovers its schedule from
//! the destinations' contents.

pub mod agent;
pub mod cli;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod observability;
pub mod storage;
pub mod vault;

// Re-export commonly used types
pub use agent::SnapshotAgent;
pub use config::AgentConfig;
pub use errors::{AgentError, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "vault-raft-snapshot-agent");
    }
}
