//! Quota synchronization rules shared by the drift check and the claim
//! handler.
//!
//! A claim's desired quota comes from its `quota` annotation, converted to
//! the backend convention. Two invariants hold for every mutation issued
//! from here:
//!
//! - the hard limit is only ever set to the desired quota, and
//! - the hard limit is never lowered below the bytes already used. Such a
//!   request surfaces as [`SyncError::SafetyViolation`] and nothing is
//!   written.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

use crate::ProjectId;
use crate::orchestrator::OrchestratorError;
use crate::quota::{ProjectUsage, QuotaBackend, QuotaError};
use crate::units::{UnitError, convert_unit, parse_backend_size, same_displayed_size};

/// Errors from quota synchronization.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// The desired quota is smaller than what is already stored.
    #[error(
        "refusing to set quota of project {project} to {desired_bytes} bytes: {used_bytes} bytes already used"
    )]
    SafetyViolation {
        /// Project whose limit was left in place.
        project: ProjectId,
        /// Desired hard limit.
        desired_bytes: u64,
        /// Bytes currently used.
        used_bytes: u64,
        /// How the live limit differed from the desired quota, if it did.
        drift: Option<Drift>,
    },

    /// The quota annotation is not a valid size.
    #[error("invalid quota annotation {annotation:?}: {source}")]
    InvalidQuota {
        /// The annotation value.
        annotation: String,
        /// Parse failure.
        source: UnitError,
    },

    /// The volume does not identify a quota project.
    #[error("volume {0} has no quota project id")]
    MissingProject(String),

    /// A bound volume has no claim reference.
    #[error("volume {0} is bound but has no claim reference")]
    MissingClaimRef(String),

    /// Quota backend failure.
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// Orchestrator failure.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Direction in which the live hard limit differs from the desired quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Drift {
    /// Live limit is below the desired quota.
    Low,
    /// Live limit is above the desired quota.
    High,
}

impl Drift {
    /// Label value used in metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A desired quota in both backend notation and bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredQuota {
    /// Value passed to the backend's `bhard=`.
    pub limit: String,
    /// The same value in bytes.
    pub bytes: u64,
}

impl DesiredQuota {
    /// Converts a claim's quota annotation.
    pub fn from_annotation(annotation: &str) -> Result<Self, SyncError> {
        let limit = convert_unit(annotation);
        let bytes = parse_backend_size(&limit).map_err(|source| SyncError::InvalidQuota {
            annotation: annotation.to_string(),
            source,
        })?;
        Ok(Self { limit, bytes })
    }
}

/// What the drift check should do for one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftPlan {
    /// Live limit equals the desired quota.
    InSync,
    /// Set the limit to the desired quota.
    Apply(Drift),
    /// The desired quota is below the bytes already used; the limit must
    /// not be written.
    Unsafe(Drift),
}

impl DriftPlan {
    /// The drift observed, if any.
    #[must_use]
    pub const fn drift(self) -> Option<Drift> {
        match self {
            Self::InSync => None,
            Self::Apply(drift) | Self::Unsafe(drift) => Some(drift),
        }
    }
}

/// Compares the desired quota against live usage.
///
/// Limits are compared at the precision the backend reports them in, so a
/// desired size the report can only show rounded is still in sync. A limit
/// of zero means unlimited and is always below the desired quota.
#[must_use]
pub fn plan_drift(desired_bytes: u64, usage: ProjectUsage) -> DriftPlan {
    if same_displayed_size(desired_bytes, usage.limit_bytes) {
        return DriftPlan::InSync;
    }
    let drift = if desired_bytes > usage.limit_bytes {
        Drift::Low
    } else {
        Drift::High
    };

    if desired_bytes < usage.used_bytes {
        DriftPlan::Unsafe(drift)
    } else {
        DriftPlan::Apply(drift)
    }
}

/// Brings the hard limit of `project` back to `desired` if it drifted.
///
/// Returns the drift that was corrected, or `None` if the limit already
/// matched. A [`SyncError::SafetyViolation`] carries the drift that was left
/// in place.
pub async fn correct_drift(
    backend: &dyn QuotaBackend,
    project: ProjectId,
    desired: &DesiredQuota,
) -> Result<Option<Drift>, SyncError> {
    let usage = backend.read_usage(project).await?;

    match plan_drift(desired.bytes, usage) {
        DriftPlan::InSync => {
            debug!(project, limit = %desired.limit, "quota in sync");
            Ok(None)
        },
        DriftPlan::Apply(drift) => {
            backend.set_limit(project, &desired.limit).await?;
            info!(
                project,
                %drift,
                from_bytes = usage.limit_bytes,
                limit = %desired.limit,
                "corrected quota drift"
            );
            Ok(Some(drift))
        },
        DriftPlan::Unsafe(drift) => Err(SyncError::SafetyViolation {
            project,
            desired_bytes: desired.bytes,
            used_bytes: usage.used_bytes,
            drift: Some(drift),
        }),
    }
}

/// Sets the hard limit of `project` to `desired` unless that would go below
/// the bytes already used.
pub async fn apply_quota(
    backend: &dyn QuotaBackend,
    project: ProjectId,
    desired: &DesiredQuota,
) -> Result<(), SyncError> {
    let usage = backend.read_usage(project).await?;
    if desired.bytes < usage.used_bytes {
        return Err(SyncError::SafetyViolation {
            project,
            desired_bytes: desired.bytes,
            used_bytes: usage.used_bytes,
            drift: plan_drift(desired.bytes, usage).drift(),
        });
    }

    backend.set_limit(project, &desired.limit).await?;
    info!(project, limit = %desired.limit, "applied quota");
    Ok(())
}
