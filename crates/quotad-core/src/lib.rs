//! Core library of quotad, the per-node local volume and quota agent.
//!
//! quotad keeps a pool of quota-tagged directories under one XFS mount and
//! advertises each of them to the orchestrator as a local persistent volume.
//! This crate holds everything that does not depend on a live cluster:
//!
//! - [`units`]: size quantities and the backend unit convention
//! - [`quota`]: the quota backend trait and its `xfs_quota` implementation
//! - [`allocator`]: the monotonic directory allocator
//! - [`sync`]: quota synchronization rules (drift correction, safety check)
//! - [`model`] and [`orchestrator`]: the orchestrator boundary
//! - [`config`]: agent configuration
//! - `testing`: in-memory fakes of the backend and the orchestrator, behind
//!   the `testing` feature

pub mod allocator;
pub mod config;
pub mod model;
pub mod orchestrator;
pub mod quota;
pub mod sync;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod units;

/// Quota project id of a managed directory; equal to its slot number.
pub type ProjectId = u32;

pub use allocator::{AllocatorError, DirectoryAllocator};
pub use config::{AgentConfig, ConfigError};
pub use model::{Claim, ClaimPatch, ClaimPhase, ClaimRef, Volume, VolumePatch, VolumePhase, VolumeSpec};
pub use orchestrator::{OrchestratorClient, OrchestratorError};
pub use quota::{ProjectReport, ProjectUsage, QuotaBackend, QuotaError, XfsQuota};
pub use sync::{DesiredQuota, Drift, SyncError};
