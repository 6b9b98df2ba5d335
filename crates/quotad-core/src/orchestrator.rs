//! Collaborator boundary to the cluster orchestrator.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Claim, ClaimPatch, Volume, VolumePatch, VolumeSpec};

/// Errors returned by an [`OrchestratorClient`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// The object does not exist.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Object name (`namespace/name` for namespaced kinds).
        name: String,
    },

    /// An object with the same name already exists.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// The request could not be delivered.
    #[error("orchestrator transport error: {0}")]
    Transport(String),

    /// The API server rejected the request.
    #[error("orchestrator returned HTTP {status} for {operation}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Operation that failed.
        operation: String,
        /// Server message.
        message: String,
    },

    /// The response body could not be understood.
    #[error("invalid orchestrator response for {operation}: {message}")]
    Decode {
        /// Operation that failed.
        operation: String,
        /// Decoder message.
        message: String,
    },
}

/// Volume and claim operations the agent needs from the orchestrator.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Lists volumes whose label `label_key` equals `label_value`.
    async fn list_volumes(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<Volume>, OrchestratorError>;

    /// Fetches a volume by name.
    async fn get_volume(&self, name: &str) -> Result<Volume, OrchestratorError>;

    /// Publishes a new volume.
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume, OrchestratorError>;

    /// Applies `patch` to the named volume.
    async fn patch_volume(&self, name: &str, patch: &VolumePatch) -> Result<(), OrchestratorError>;

    /// Fetches a claim.
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Claim, OrchestratorError>;

    /// Lists claims in every namespace.
    async fn list_claims(&self) -> Result<Vec<Claim>, OrchestratorError>;

    /// Applies `patch` to a claim.
    async fn patch_claim(
        &self,
        namespace: &str,
        name: &str,
        patch: &ClaimPatch,
    ) -> Result<(), OrchestratorError>;
}
