#![deny(missing_docs)]

//! Shared configuration, error types, ids, and observability primitives for
//! arbor crates.
//!
//! Architecture role:
//! - defines the per-query configuration passed across layers
//! - provides the common [`ArborError`] / [`Result`] contracts
//! - hosts the process-wide metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

/// Per-query configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{CompressionKind, QueryConfig};
pub use error::{ArborError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
