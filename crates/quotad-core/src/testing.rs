//! In-memory fakes of the agent's collaborators.
//!
//! Used by the unit and integration test suites of every crate in the
//! workspace.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::ProjectId;
use crate::model::{
    Claim, ClaimPatch, ClaimPhase, QUOTA_ANNOTATION, Volume, VolumePatch, VolumePhase, VolumeSpec,
};
use crate::orchestrator::{OrchestratorClient, OrchestratorError};
use crate::quota::{ProjectReport, ProjectUsage, QuotaBackend, QuotaError};
use crate::units::parse_backend_size;

fn injected(command: &str) -> QuotaError {
    QuotaError::Backend {
        command: command.to_string(),
        message: "injected failure".to_string(),
    }
}

#[derive(Debug, Default)]
struct QuotaState {
    projects: BTreeMap<ProjectId, ProjectUsage>,
    tags: Vec<(PathBuf, ProjectId)>,
    limit_calls: Vec<(ProjectId, String)>,
    fail_tag: bool,
    fail_set_limit: bool,
    fail_reads: bool,
}

/// A [`QuotaBackend`] that keeps project usage in memory and records every
/// mutation.
#[derive(Debug, Default)]
pub struct FakeQuotaBackend {
    state: Mutex<QuotaState>,
}

impl FakeQuotaBackend {
    /// Creates a backend with no projects.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Sets the usage of `project`, creating it if needed.
    pub fn set_usage(&self, project: ProjectId, usage: ProjectUsage) {
        self.state().projects.insert(project, usage);
    }

    /// Current usage of `project`.
    #[must_use]
    pub fn usage(&self, project: ProjectId) -> Option<ProjectUsage> {
        self.state().projects.get(&project).copied()
    }

    /// Every successful tag call, in order.
    #[must_use]
    pub fn tags(&self) -> Vec<(PathBuf, ProjectId)> {
        self.state().tags.clone()
    }

    /// Every successful set-limit call, in order.
    #[must_use]
    pub fn limit_calls(&self) -> Vec<(ProjectId, String)> {
        self.state().limit_calls.clone()
    }

    /// Makes tag calls fail.
    pub fn fail_tag(&self, fail: bool) {
        self.state().fail_tag = fail;
    }

    /// Makes set-limit calls fail.
    pub fn fail_set_limit(&self, fail: bool) {
        self.state().fail_set_limit = fail;
    }

    /// Makes usage reads fail.
    pub fn fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }
}

#[async_trait]
impl QuotaBackend for FakeQuotaBackend {
    async fn tag(&self, path: &Path, project: ProjectId) -> Result<(), QuotaError> {
        let mut state = self.state();
        if state.fail_tag {
            return Err(injected("project"));
        }
        state.tags.push((path.to_path_buf(), project));
        state.projects.entry(project).or_insert(ProjectUsage {
            used_bytes: 0,
            limit_bytes: 0,
        });
        Ok(())
    }

    async fn set_limit(&self, project: ProjectId, limit: &str) -> Result<(), QuotaError> {
        let mut state = self.state();
        if state.fail_set_limit {
            return Err(injected("limit"));
        }
        let limit_bytes = parse_backend_size(limit)?;
        state.limit_calls.push((project, limit.to_string()));
        state
            .projects
            .entry(project)
            .or_insert(ProjectUsage {
                used_bytes: 0,
                limit_bytes: 0,
            })
            .limit_bytes = limit_bytes;
        Ok(())
    }

    async fn read_usage(&self, project: ProjectId) -> Result<ProjectUsage, QuotaError> {
        let state = self.state();
        if state.fail_reads {
            return Err(injected("report"));
        }
        state
            .projects
            .get(&project)
            .copied()
            .ok_or(QuotaError::NotFound(project))
    }

    async fn read_all_usage(&self) -> Result<Vec<ProjectReport>, QuotaError> {
        let state = self.state();
        if state.fail_reads {
            return Err(injected("report"));
        }
        Ok(state
            .projects
            .iter()
            .filter(|(id, _)| **id != 0)
            .map(|(id, usage)| ProjectReport {
                project_id: *id,
                used_blocks: usage.used_bytes / 1024,
                hard_limit_blocks: usage.limit_bytes / 1024,
            })
            .collect())
    }
}

/// Orchestrator operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    /// [`OrchestratorClient::list_volumes`].
    ListVolumes,
    /// [`OrchestratorClient::get_volume`].
    GetVolume,
    /// [`OrchestratorClient::create_volume`].
    CreateVolume,
    /// [`OrchestratorClient::patch_volume`].
    PatchVolume,
    /// [`OrchestratorClient::get_claim`].
    GetClaim,
    /// [`OrchestratorClient::list_claims`].
    ListClaims,
    /// [`OrchestratorClient::patch_claim`].
    PatchClaim,
}

#[derive(Debug, Default)]
struct OrchestratorState {
    volumes: BTreeMap<String, Volume>,
    claims: BTreeMap<(String, String), Claim>,
    failing: BTreeSet<Operation>,
    version: u64,
}

impl OrchestratorState {
    fn check(&self, op: Operation) -> Result<(), OrchestratorError> {
        if self.failing.contains(&op) {
            return Err(OrchestratorError::Transport(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// An [`OrchestratorClient`] over an in-memory object store.
///
/// Newly created volumes start out `Available`, and clearing the claim
/// reference of a volume makes it `Available` again, mirroring what the
/// orchestrator's own volume controller does.
#[derive(Debug, Default)]
pub struct InMemoryOrchestrator {
    state: Mutex<OrchestratorState>,
}

impl InMemoryOrchestrator {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Makes `op` fail (or succeed again).
    pub fn set_failing(&self, op: Operation, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    /// Inserts or replaces a volume.
    pub fn put_volume(&self, volume: Volume) {
        self.state().volumes.insert(volume.name.clone(), volume);
    }

    /// Returns a stored volume.
    #[must_use]
    pub fn volume(&self, name: &str) -> Option<Volume> {
        self.state().volumes.get(name).cloned()
    }

    /// Every stored volume, ordered by name.
    #[must_use]
    pub fn volumes(&self) -> Vec<Volume> {
        self.state().volumes.values().cloned().collect()
    }

    /// Sets the phase of a stored volume.
    pub fn set_volume_phase(&self, name: &str, phase: VolumePhase) {
        if let Some(volume) = self.state().volumes.get_mut(name) {
            volume.phase = phase;
        }
    }

    /// Inserts or replaces a claim, assigning it a fresh resource version.
    ///
    /// Returns the stored claim.
    pub fn put_claim(&self, mut claim: Claim) -> Claim {
        let mut state = self.state();
        claim.resource_version = state.next_version();
        state
            .claims
            .insert((claim.namespace.clone(), claim.name.clone()), claim.clone());
        claim
    }

    /// Returns a stored claim.
    #[must_use]
    pub fn claim(&self, namespace: &str, name: &str) -> Option<Claim> {
        self.state()
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Removes a claim.
    pub fn remove_claim(&self, namespace: &str, name: &str) -> Option<Claim> {
        self.state()
            .claims
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Binds `claim` to `volume`: both sides become `Bound`.
    pub fn bind(&self, namespace: &str, name: &str, volume: &str) {
        let mut state = self.state();
        let version = state.next_version();
        let key = (namespace.to_string(), name.to_string());
        let claim_ref = state.claims.get_mut(&key).map(|claim| {
            claim.phase = ClaimPhase::Bound;
            claim.volume_name = Some(volume.to_string());
            claim.resource_version = version;
            claim.claim_ref()
        });
        if let Some(v) = state.volumes.get_mut(volume) {
            v.phase = VolumePhase::Bound;
            v.claim_ref = claim_ref;
        }
    }
}

#[async_trait]
impl OrchestratorClient for InMemoryOrchestrator {
    async fn list_volumes(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<Volume>, OrchestratorError> {
        let state = self.state();
        state.check(Operation::ListVolumes)?;
        Ok(state
            .volumes
            .values()
            .filter(|v| v.labels.get(label_key).map(String::as_str) == Some(label_value))
            .cloned()
            .collect())
    }

    async fn get_volume(&self, name: &str) -> Result<Volume, OrchestratorError> {
        let state = self.state();
        state.check(Operation::GetVolume)?;
        state
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "PersistentVolume",
                name: name.to_string(),
            })
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume, OrchestratorError> {
        let mut state = self.state();
        state.check(Operation::CreateVolume)?;
        if state.volumes.contains_key(&spec.name) {
            return Err(OrchestratorError::AlreadyExists {
                kind: "PersistentVolume",
                name: spec.name.clone(),
            });
        }
        let volume = Volume {
            name: spec.name.clone(),
            labels: spec.labels.clone(),
            phase: VolumePhase::Available,
            capacity: spec.capacity.clone(),
            claim_ref: None,
            local_path: Some(spec.local_path.clone()),
            storage_class: Some(spec.storage_class.clone()),
        };
        state.volumes.insert(volume.name.clone(), volume.clone());
        Ok(volume)
    }

    async fn patch_volume(&self, name: &str, patch: &VolumePatch) -> Result<(), OrchestratorError> {
        let mut state = self.state();
        state.check(Operation::PatchVolume)?;
        let volume = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "PersistentVolume",
                name: name.to_string(),
            })?;
        match patch {
            VolumePatch::ClearClaimRef => {
                volume.claim_ref = None;
                if volume.phase == VolumePhase::Released {
                    volume.phase = VolumePhase::Available;
                }
            },
        }
        Ok(())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Claim, OrchestratorError> {
        let state = self.state();
        state.check(Operation::GetClaim)?;
        state
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "PersistentVolumeClaim",
                name: format!("{namespace}/{name}"),
            })
    }

    async fn list_claims(&self) -> Result<Vec<Claim>, OrchestratorError> {
        let state = self.state();
        state.check(Operation::ListClaims)?;
        Ok(state.claims.values().cloned().collect())
    }

    async fn patch_claim(
        &self,
        namespace: &str,
        name: &str,
        patch: &ClaimPatch,
    ) -> Result<(), OrchestratorError> {
        let mut state = self.state();
        state.check(Operation::PatchClaim)?;
        let version = state.next_version();
        let claim = state
            .claims
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| OrchestratorError::NotFound {
                kind: "PersistentVolumeClaim",
                name: format!("{namespace}/{name}"),
            })?;
        match patch {
            ClaimPatch::SetQuotaAnnotation(quota) => {
                claim
                    .annotations
                    .insert(QUOTA_ANNOTATION.to_string(), quota.clone());
            },
        }
        claim.resource_version = version;
        Ok(())
    }
}
