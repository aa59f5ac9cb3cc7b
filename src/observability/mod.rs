//! # Observability
//!
//! Process-wide logging setup. Metrics publishing lives in
//! [`crate::metrics`] since it is swapped on configuration reloads, while
//! the logging configuration is fixed at startup.

pub mod logging;
