//! Quota sync handler: reacts to claim updates for this node's volumes.
//!
//! On the first bind the claim's requested size is recorded as its quota
//! annotation. Whenever the bound volume or the annotation changes
//! afterwards, the annotated size is pushed to the quota backend.

use std::sync::Arc;

use async_trait::async_trait;
use quotad_core::model::{Claim, ClaimPatch, ClaimPhase};
use quotad_core::orchestrator::OrchestratorClient;
use quotad_core::quota::QuotaBackend;
use quotad_core::sync::{DesiredQuota, SyncError, apply_quota};
use quotad_core::{AgentConfig, ProjectId};
use tracing::{debug, error, info, warn};

use crate::metrics::SharedMetricsRegistry;

/// Receives claim update notifications.
#[async_trait]
pub trait ClaimUpdateHandler: Send + Sync {
    /// Called with the previous and current state of a changed claim.
    async fn on_claim_update(&self, old: &Claim, new: &Claim);
}

/// What the handler did with one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The claim is not one of this node's bound claims.
    Ignored,
    /// The quota annotation was written on first bind.
    Annotated {
        /// Value written.
        quota: String,
    },
    /// The annotated quota was applied to the volume's project.
    QuotaApplied {
        /// Project of the bound volume.
        project: ProjectId,
    },
    /// Nothing relevant changed.
    Unchanged,
}

/// Keeps quota annotations and backend limits in step with claims.
pub struct QuotaSyncHandler {
    config: Arc<AgentConfig>,
    orchestrator: Arc<dyn OrchestratorClient>,
    backend: Arc<dyn QuotaBackend>,
    metrics: SharedMetricsRegistry,
}

impl QuotaSyncHandler {
    /// Creates a handler for the claims bound to this node's volumes.
    #[must_use]
    pub fn new(
        config: Arc<AgentConfig>,
        orchestrator: Arc<dyn OrchestratorClient>,
        backend: Arc<dyn QuotaBackend>,
        metrics: SharedMetricsRegistry,
    ) -> Self {
        Self {
            config,
            orchestrator,
            backend,
            metrics,
        }
    }

    fn is_managed(&self, claim: &Claim) -> bool {
        if claim.storage_class.as_deref() != Some(self.config.storage_class_name.as_str()) {
            return false;
        }
        if claim.phase != ClaimPhase::Bound {
            return false;
        }
        let prefix = format!("{}-", self.config.node_name);
        claim
            .volume_name
            .as_deref()
            .is_some_and(|volume| volume.starts_with(&prefix))
    }

    /// Handles one update and reports what was done.
    pub async fn handle(&self, old: &Claim, new: &Claim) -> Result<HandlerOutcome, SyncError> {
        if !self.is_managed(new) {
            return Ok(HandlerOutcome::Ignored);
        }

        if old.phase != ClaimPhase::Bound {
            return self.annotate(new).await;
        }

        let volume_changed = old.volume_name != new.volume_name;
        let quota_changed = old.quota_annotation() != new.quota_annotation();
        if !volume_changed && !quota_changed {
            return Ok(HandlerOutcome::Unchanged);
        }

        let Some(annotation) = new.quota_annotation() else {
            debug!(claim = %new.claim_ref(), "bound claim has no quota annotation");
            return Ok(HandlerOutcome::Unchanged);
        };
        let desired = DesiredQuota::from_annotation(annotation)?;

        let volume_name = new.volume_name.as_deref().unwrap_or_default();
        let volume = self.orchestrator.get_volume(volume_name).await?;
        let project = volume
            .project_id()
            .ok_or_else(|| SyncError::MissingProject(volume.name.clone()))?;

        match apply_quota(self.backend.as_ref(), project, &desired).await {
            Ok(()) => {
                info!(
                    claim = %new.claim_ref(),
                    volume = %volume.name,
                    project,
                    limit = %desired.limit,
                    "synced claim quota"
                );
                Ok(HandlerOutcome::QuotaApplied { project })
            },
            Err(e @ SyncError::SafetyViolation { .. }) => {
                self.metrics.agent_metrics().quota_safety_violation(project);
                Err(e)
            },
            Err(e) => Err(e),
        }
    }

    async fn annotate(&self, claim: &Claim) -> Result<HandlerOutcome, SyncError> {
        let Some(quota) = claim.requested_storage.clone() else {
            warn!(claim = %claim.claim_ref(), "bound claim requests no storage, not annotating");
            return Ok(HandlerOutcome::Unchanged);
        };

        self.orchestrator
            .patch_claim(
                &claim.namespace,
                &claim.name,
                &ClaimPatch::SetQuotaAnnotation(quota.clone()),
            )
            .await?;
        info!(claim = %claim.claim_ref(), %quota, "annotated claim quota on first bind");
        Ok(HandlerOutcome::Annotated { quota })
    }
}

#[async_trait]
impl ClaimUpdateHandler for QuotaSyncHandler {
    async fn on_claim_update(&self, old: &Claim, new: &Claim) {
        match self.handle(old, new).await {
            Ok(outcome) => debug!(claim = %new.claim_ref(), ?outcome, "handled claim update"),
            Err(e) => error!(claim = %new.claim_ref(), error = %e, "failed to sync claim quota"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use quotad_core::model::{QUOTA_ANNOTATION, Volume, VolumePhase};
    use quotad_core::quota::ProjectUsage;
    use quotad_core::testing::{FakeQuotaBackend, InMemoryOrchestrator};

    use super::*;
    use crate::metrics::new_shared_registry;

    const GIB: u64 = 1 << 30;

    fn usage(used_bytes: u64, limit_bytes: u64) -> ProjectUsage {
        ProjectUsage {
            used_bytes,
            limit_bytes,
        }
    }

    struct Harness {
        orchestrator: Arc<InMemoryOrchestrator>,
        backend: Arc<FakeQuotaBackend>,
        metrics: SharedMetricsRegistry,
        handler: QuotaSyncHandler,
    }

    fn harness() -> Harness {
        let config = Arc::new(AgentConfig {
            node_name: "node-a".to_string(),
            ..AgentConfig::default()
        });
        let orchestrator = Arc::new(InMemoryOrchestrator::new());
        let backend = Arc::new(FakeQuotaBackend::new());
        let metrics = new_shared_registry("node-a").unwrap();
        let handler = QuotaSyncHandler::new(
            config,
            orchestrator.clone(),
            backend.clone(),
            metrics.clone(),
        );
        orchestrator.put_volume(Volume {
            name: "node-a-3".to_string(),
            phase: VolumePhase::Bound,
            local_path: Some("/data/3".into()),
            ..Volume::default()
        });
        Harness {
            orchestrator,
            backend,
            metrics,
            handler,
        }
    }

    fn claim(phase: ClaimPhase, quota: Option<&str>) -> Claim {
        let mut annotations = BTreeMap::new();
        if let Some(quota) = quota {
            annotations.insert(QUOTA_ANNOTATION.to_string(), quota.to_string());
        }
        Claim {
            namespace: "default".to_string(),
            name: "data".to_string(),
            storage_class: Some("local-storage".to_string()),
            phase,
            volume_name: (phase == ClaimPhase::Bound).then(|| "node-a-3".to_string()),
            requested_storage: Some("10Gi".to_string()),
            annotations,
            resource_version: "1".to_string(),
        }
    }

    #[tokio::test]
    async fn first_bind_writes_requested_size() {
        let h = harness();
        h.orchestrator.put_claim(claim(ClaimPhase::Pending, None));

        let outcome = h
            .handler
            .handle(&claim(ClaimPhase::Pending, None), &claim(ClaimPhase::Bound, None))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            HandlerOutcome::Annotated {
                quota: "10Gi".to_string()
            }
        );
        let stored = h.orchestrator.claim("default", "data").unwrap();
        assert_eq!(stored.quota_annotation(), Some("10Gi"));
        assert!(h.backend.limit_calls().is_empty());
    }

    #[tokio::test]
    async fn annotation_change_applies_quota() {
        let h = harness();
        h.backend.set_usage(3, usage(GIB, 10 * GIB));

        let outcome = h
            .handler
            .handle(
                &claim(ClaimPhase::Bound, Some("10Gi")),
                &claim(ClaimPhase::Bound, Some("20Gi")),
            )
            .await
            .unwrap();

        assert_eq!(outcome, HandlerOutcome::QuotaApplied { project: 3 });
        assert_eq!(h.backend.limit_calls(), vec![(3, "20G".to_string())]);
    }

    #[tokio::test]
    async fn shrink_below_usage_is_refused() {
        let h = harness();
        h.backend.set_usage(3, usage(15 * GIB, 20 * GIB));

        let err = h
            .handler
            .handle(
                &claim(ClaimPhase::Bound, Some("20Gi")),
                &claim(ClaimPhase::Bound, Some("10Gi")),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::SafetyViolation { project: 3, .. }));
        assert!(h.backend.limit_calls().is_empty());
        assert_eq!(
            h.metrics.agent_metrics().quota_safety_violation_count(3),
            1.0
        );
    }

    #[tokio::test]
    async fn unrelated_claims_are_ignored() {
        let h = harness();
        let mut foreign_class = claim(ClaimPhase::Bound, Some("10Gi"));
        foreign_class.storage_class = Some("standard".to_string());
        let mut foreign_node = claim(ClaimPhase::Bound, Some("10Gi"));
        foreign_node.volume_name = Some("node-ab-3".to_string());

        let old = claim(ClaimPhase::Pending, None);
        assert_eq!(
            h.handler.handle(&old, &foreign_class).await.unwrap(),
            HandlerOutcome::Ignored
        );
        assert_eq!(
            h.handler.handle(&old, &foreign_node).await.unwrap(),
            HandlerOutcome::Ignored
        );
        assert_eq!(
            h.handler
                .handle(&old, &claim(ClaimPhase::Pending, None))
                .await
                .unwrap(),
            HandlerOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn unchanged_bound_claim_is_a_no_op() {
        let h = harness();
        let bound = claim(ClaimPhase::Bound, Some("10Gi"));

        let outcome = h.handler.handle(&bound, &bound).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Unchanged);
        assert!(h.backend.limit_calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_annotation_is_rejected() {
        let h = harness();
        h.backend.set_usage(3, usage(0, 10 * GIB));

        let err = h
            .handler
            .handle(
                &claim(ClaimPhase::Bound, Some("10Gi")),
                &claim(ClaimPhase::Bound, Some("lots")),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::InvalidQuota { .. }), "{err:?}");
    }
}
