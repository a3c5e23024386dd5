#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and observability primitives for Kite crates.
//!
//! Architecture role:
//! - defines process settings handed to each query coordinator
//! - provides common [`KiteError`] / [`Result`] contracts and the sticky
//!   [`ExecStatus`] wire status
//! - hosts the control-plane metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - [`status`]

/// Process-level coordinator settings.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier and endpoint wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;
/// Sticky execution status carried on the wire.
pub mod status;

pub use config::CoordinatorSettings;
pub use error::{KiteError, Result};
pub use ids::{HostPort, PlanNodeId, UniqueId};
pub use metrics::MetricsRegistry;
pub use status::{ExecStatus, StatusCode};
