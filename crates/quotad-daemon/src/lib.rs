//! Node agent that keeps a pool of local volumes on an XFS filesystem and
//! enforces the size of each through project quotas.
//!
//! - [`reconciler`]: keeps the pool of free volumes at its target size,
//!   reclaims released volumes and corrects quota drift.
//! - [`watcher`] and [`handler`]: react to claim updates by recording and
//!   applying the claim's quota.
//! - [`collector`] and [`metrics`]: Prometheus metrics.
//! - [`kube`]: in-cluster Kubernetes client.
//! - [`disk`]: data disk capacity and I/O counters.

pub mod collector;
pub mod disk;
pub mod handler;
pub mod kube;
pub mod metrics;
pub mod reconciler;
pub mod watcher;

pub use handler::{ClaimUpdateHandler, QuotaSyncHandler};
pub use reconciler::{TickReport, VolumePoolReconciler};
pub use watcher::ClaimWatcher;
