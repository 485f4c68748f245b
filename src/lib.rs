//! TTL controller - cluster-wide garbage collection driven by a TTL label
//!
//! The controller discovers, at runtime, every resource kind in the cluster
//! that supports `list`, `watch` and `delete` and that the service identity
//! is allowed to manage. For each such kind it runs a metadata-only informer
//! filtered on the presence of the TTL label, and deletes each labeled
//! object once its TTL elapses. Kinds that appear, disappear, or lose
//! permissions are picked up by a periodic manager reconciliation pass.
//!
//! # Modules
//!
//! - [`ttl`] - TTL label value parsing (duration, instant, or date)
//! - [`auth`] - self-subject access review permission checks
//! - [`discovery`] - runtime enumeration of manageable resource kinds
//! - [`queue`] - deduplicating, rate-limited, delay-capable work queue
//! - [`informer`] - per-kind metadata informer and cache
//! - [`controller`] - per-kind reconcile workers
//! - [`manager`] - desired/observed reconciliation of per-kind controllers
//! - [`error`] - error types for the controller

#![deny(missing_docs)]

use std::time::Duration;

pub mod auth;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod informer;
pub mod manager;
pub mod queue;
pub mod ttl;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralized here so the manager defaults, the binary, and test fixtures
// agree on the same values.

/// Label whose presence marks an object as TTL-managed; its value encodes
/// the deadline.
pub const TTL_LABEL: &str = "kyverno.io/ttl";

/// Number of reconcile workers started per kind
pub const DEFAULT_WORKERS: usize = 3;

/// Cadence of the manager's desired-vs-observed reconciliation pass
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Interval at which every cached key is re-enqueued, recovering from
/// missed watch events
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// How long a starting informer may take to complete its initial list
/// before the start attempt is abandoned
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
