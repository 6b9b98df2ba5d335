//! Volume pool reconciler.
//!
//! A level-triggered loop over the volumes labelled with this node's name.
//! Each tick it:
//!
//! 1. reclaims `Released` volumes (clean the directory, clear the claim
//!    reference),
//! 2. corrects quota drift of `Bound` volumes,
//! 3. tops the pool of free volumes back up to the configured target,
//!    withdrawing any directory whose volume could not be published.
//!
//! Every per-volume failure is logged and counted; nothing aborts a tick
//! except a failure to list the pool at all, which skips the tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use quotad_core::allocator::{AllocatorError, DirectoryAllocator};
use quotad_core::model::{NODE_LABEL_KEY, Volume, VolumePatch, VolumePhase, VolumeSpec};
use quotad_core::orchestrator::OrchestratorClient;
use quotad_core::quota::QuotaBackend;
use quotad_core::sync::{DesiredQuota, Drift, SyncError, correct_drift};
use quotad_core::units::Quantity;
use quotad_core::{AgentConfig, ProjectId};
use tracing::{debug, error, info, warn};

use crate::metrics::SharedMetricsRegistry;

/// What one reconciliation tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The volume listing failed and nothing was done.
    pub skipped: bool,
    /// Volumes listed.
    pub volumes: usize,
    /// Free volumes after reclamation, before new allocations.
    pub free: usize,
    /// Released volumes made available again.
    pub reclaimed: usize,
    /// Released volumes that could not be cleaned.
    pub clean_failures: usize,
    /// Bound volumes whose quota was corrected.
    pub drift_corrected: usize,
    /// Bound volumes whose drift check failed.
    pub drift_failures: usize,
    /// Slots of newly published volumes.
    pub created: Vec<ProjectId>,
    /// Volumes that could not be created.
    pub create_failures: usize,
}

impl TickReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Keeps this node's pool of managed volumes healthy.
pub struct VolumePoolReconciler {
    config: Arc<AgentConfig>,
    capacity: Quantity,
    allocator: DirectoryAllocator,
    orchestrator: Arc<dyn OrchestratorClient>,
    backend: Arc<dyn QuotaBackend>,
    metrics: SharedMetricsRegistry,
    shutdown: Arc<AtomicBool>,
}

impl VolumePoolReconciler {
    /// Creates a reconciler advertising `capacity` on every new volume.
    #[must_use]
    pub fn new(
        config: Arc<AgentConfig>,
        capacity: Quantity,
        allocator: DirectoryAllocator,
        orchestrator: Arc<dyn OrchestratorClient>,
        backend: Arc<dyn QuotaBackend>,
        metrics: SharedMetricsRegistry,
    ) -> Self {
        Self {
            config,
            capacity,
            allocator,
            orchestrator,
            backend,
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a handle for requesting shutdown.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// The allocator owned by this reconciler.
    #[must_use]
    pub const fn allocator(&self) -> &DirectoryAllocator {
        &self.allocator
    }

    /// Runs ticks every `list_interval` until shutdown is requested.
    pub async fn run(&mut self) {
        info!(
            node = %self.config.node_name,
            target = self.config.available_num,
            interval = %humantime::format_duration(self.config.list_interval),
            "volume pool reconciler starting"
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            let report = self.reconcile_once().await;
            debug!(?report, "reconcile tick finished");
            tokio::time::sleep(self.config.list_interval).await;
        }

        info!("volume pool reconciler shutting down");
    }

    /// Runs a single reconciliation tick.
    pub async fn reconcile_once(&mut self) -> TickReport {
        let node = self.config.node_name.clone();
        let volumes = match self.orchestrator.list_volumes(NODE_LABEL_KEY, &node).await {
            Ok(volumes) => volumes,
            Err(e) => {
                error!(error = %e, "failed to list volumes, skipping tick");
                return TickReport::skipped();
            },
        };

        let mut report = TickReport {
            volumes: volumes.len(),
            ..TickReport::default()
        };

        for volume in &volumes {
            match volume.phase {
                VolumePhase::Released => {
                    if self.reclaim(volume, &mut report).await {
                        report.free += 1;
                    }
                },
                VolumePhase::Available => report.free += 1,
                VolumePhase::Bound => match self.drift_check(volume).await {
                    Ok(Some(_)) => report.drift_corrected += 1,
                    Ok(None) => {},
                    Err(e) => {
                        report.drift_failures += 1;
                        if matches!(e, SyncError::SafetyViolation { .. }) {
                            error!(volume = %volume.name, error = %e, "quota drift left in place");
                        } else {
                            warn!(volume = %volume.name, error = %e, "quota drift check failed");
                        }
                    },
                },
                VolumePhase::Failed => {
                    warn!(volume = %volume.name, "volume is in Failed phase");
                },
                VolumePhase::Pending => {},
            }
        }

        let deficit = self.config.available_num.saturating_sub(report.free);
        for _ in 0..deficit {
            match self.provision().await {
                Some(slot) => report.created.push(slot),
                None => {
                    report.create_failures += 1;
                    self.metrics.agent_metrics().volume_create_failed();
                },
            }
        }

        report
    }

    /// Cleans a released volume and makes it bindable again. Returns `true`
    /// if the volume is free afterwards.
    async fn reclaim(&self, volume: &Volume, report: &mut TickReport) -> bool {
        let Some(slot) = volume.project_id() else {
            error!(volume = %volume.name, "released volume has no slot, cannot clean");
            return false;
        };

        if let Err(e) = self.allocator.clean(slot) {
            error!(volume = %volume.name, slot, error = %e, "failed to clean released volume");
            report.clean_failures += 1;
            self.metrics.agent_metrics().volume_clean_failed();
            return false;
        }

        if let Err(e) = self
            .orchestrator
            .patch_volume(&volume.name, &VolumePatch::ClearClaimRef)
            .await
        {
            error!(volume = %volume.name, error = %e, "failed to clear claim reference");
            return false;
        }

        info!(volume = %volume.name, slot, "reclaimed released volume");
        report.reclaimed += 1;
        true
    }

    /// Brings the quota of a bound volume back to its claim's annotation.
    ///
    /// Returns the drift corrected, if any. A correction that would cap the
    /// project below its used bytes is refused, recorded with the drift it
    /// left in place, and surfaced as [`SyncError::SafetyViolation`].
    pub async fn drift_check(&self, volume: &Volume) -> Result<Option<Drift>, SyncError> {
        let claim_ref = volume
            .claim_ref
            .as_ref()
            .ok_or_else(|| SyncError::MissingClaimRef(volume.name.clone()))?;
        let claim = self
            .orchestrator
            .get_claim(&claim_ref.namespace, &claim_ref.name)
            .await?;

        let Some(annotation) = claim.quota_annotation() else {
            return Ok(None);
        };
        let desired = DesiredQuota::from_annotation(annotation)?;
        let project = volume
            .project_id()
            .ok_or_else(|| SyncError::MissingProject(volume.name.clone()))?;

        let metrics = self.metrics.agent_metrics();
        match correct_drift(self.backend.as_ref(), project, &desired).await {
            Ok(drift) => {
                if let Some(drift) = drift {
                    metrics.quota_drift(project, drift);
                }
                Ok(drift)
            },
            Err(e @ SyncError::SafetyViolation { drift, .. }) => {
                if let Some(drift) = drift {
                    metrics.quota_drift(project, drift);
                }
                metrics.quota_safety_violation(project);
                Err(e)
            },
            Err(e) => Err(e),
        }
    }

    /// Allocates a directory and publishes its volume, rolling the
    /// allocation back if publishing fails.
    async fn provision(&mut self) -> Option<ProjectId> {
        let slot = match self.allocator.allocate(self.backend.as_ref()).await {
            Ok(slot) => slot,
            Err(AllocatorError::Tag { slot, source }) => {
                error!(slot, error = %source, "failed to tag new directory");
                self.withdraw(slot);
                return None;
            },
            Err(e) => {
                error!(error = %e, "failed to allocate directory");
                return None;
            },
        };

        let spec = VolumeSpec::for_slot(
            &self.config.node_name,
            slot,
            &self.allocator.slot_path(slot),
            self.capacity.as_str(),
            &self.config.storage_class_name,
        );

        match self.orchestrator.create_volume(&spec).await {
            Ok(_) => {
                info!(volume = %spec.name, slot, capacity = %self.capacity, "created volume");
                Some(slot)
            },
            Err(e) => {
                error!(volume = %spec.name, error = %e, "failed to create volume");
                self.withdraw(slot);
                None
            },
        }
    }

    fn withdraw(&mut self, slot: ProjectId) {
        if let Err(e) = self.allocator.withdraw(slot) {
            error!(slot, error = %e, "failed to withdraw directory");
        }
    }
}
