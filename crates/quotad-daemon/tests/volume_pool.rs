//! End-to-end behaviour of the pool reconciler and the claim path against
//! the in-memory orchestrator and quota backend.

#![allow(clippy::float_cmp)]

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use quotad_core::model::{Claim, ClaimPhase, QUOTA_ANNOTATION, VolumePhase};
use quotad_core::quota::ProjectUsage;
use quotad_core::testing::{FakeQuotaBackend, InMemoryOrchestrator, Operation};
use quotad_core::units::Quantity;
use quotad_core::{AgentConfig, DirectoryAllocator, Drift};
use quotad_daemon::metrics::{SharedMetricsRegistry, new_shared_registry};
use quotad_daemon::{ClaimWatcher, QuotaSyncHandler, VolumePoolReconciler};
use tempfile::TempDir;

const GIB: u64 = 1 << 30;

struct Cluster {
    base: TempDir,
    config: Arc<AgentConfig>,
    orchestrator: Arc<InMemoryOrchestrator>,
    backend: Arc<FakeQuotaBackend>,
    metrics: SharedMetricsRegistry,
    reconciler: VolumePoolReconciler,
}

impl Cluster {
    fn new(available_num: usize) -> Self {
        let base = TempDir::new().unwrap();
        let config = Arc::new(AgentConfig {
            node_name: "node-a".to_string(),
            base_dir: base.path().to_path_buf(),
            available_num,
            ..AgentConfig::default()
        });
        let orchestrator = Arc::new(InMemoryOrchestrator::new());
        let backend = Arc::new(FakeQuotaBackend::new());
        let metrics = new_shared_registry("node-a").unwrap();
        let reconciler = VolumePoolReconciler::new(
            Arc::clone(&config),
            Quantity::parse("100Gi").unwrap(),
            DirectoryAllocator::recover(base.path()).unwrap(),
            orchestrator.clone(),
            backend.clone(),
            Arc::clone(&metrics),
        );
        Self {
            base,
            config,
            orchestrator,
            backend,
            metrics,
            reconciler,
        }
    }

    fn slot_dirs(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.base.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn phase(&self, volume: &str) -> VolumePhase {
        self.orchestrator.volume(volume).unwrap().phase
    }

    /// Creates a claim annotated with `quota` and binds it to `volume`.
    fn bind_claim(&self, name: &str, volume: &str, quota: &str) {
        self.orchestrator.put_claim(Claim {
            namespace: "default".to_string(),
            name: name.to_string(),
            storage_class: Some(self.config.storage_class_name.clone()),
            requested_storage: Some(quota.to_string()),
            annotations: BTreeMap::from([(QUOTA_ANNOTATION.to_string(), quota.to_string())]),
            ..Claim::default()
        });
        self.orchestrator.bind("default", name, volume);
    }
}

fn usage(used_bytes: u64, limit_bytes: u64) -> ProjectUsage {
    ProjectUsage {
        used_bytes,
        limit_bytes,
    }
}

#[tokio::test]
async fn pool_converges_to_target() {
    let mut cluster = Cluster::new(2);

    let report = cluster.reconciler.reconcile_once().await;

    assert_eq!(report.created, vec![1, 2]);
    assert_eq!(cluster.slot_dirs(), vec!["1", "2"]);
    let volume = cluster.orchestrator.volume("node-a-1").unwrap();
    assert_eq!(volume.phase, VolumePhase::Available);
    assert_eq!(volume.capacity, "100Gi");
    assert_eq!(volume.local_path.as_deref(), Some(cluster.base.path().join("1").as_path()));
    assert_eq!(cluster.backend.tags().len(), 2);

    let report = cluster.reconciler.reconcile_once().await;
    assert!(report.created.is_empty());
    assert_eq!(report.free, 2);
    assert_eq!(cluster.orchestrator.volumes().len(), 2);
}

#[tokio::test]
async fn bound_volumes_do_not_count_as_free() {
    let mut cluster = Cluster::new(1);
    cluster.reconciler.reconcile_once().await;
    cluster.bind_claim("data", "node-a-1", "1Gi");
    cluster.backend.set_usage(1, usage(0, GIB));

    let report = cluster.reconciler.reconcile_once().await;

    assert_eq!(report.created, vec![2]);
    assert_eq!(cluster.phase("node-a-1"), VolumePhase::Bound);
    assert_eq!(cluster.phase("node-a-2"), VolumePhase::Available);
}

#[tokio::test]
async fn released_volume_is_cleaned_and_reused() {
    let mut cluster = Cluster::new(1);
    cluster.reconciler.reconcile_once().await;
    cluster.bind_claim("data", "node-a-1", "1Gi");
    let slot = cluster.base.path().join("1");
    fs::create_dir(slot.join("nested")).unwrap();
    fs::write(slot.join("nested/file"), b"payload").unwrap();
    fs::write(slot.join("top"), b"payload").unwrap();
    cluster.orchestrator.set_volume_phase("node-a-1", VolumePhase::Released);

    let report = cluster.reconciler.reconcile_once().await;

    assert_eq!(report.reclaimed, 1);
    assert!(report.created.is_empty());
    assert!(slot.is_dir());
    assert_eq!(fs::read_dir(&slot).unwrap().count(), 0);
    let volume = cluster.orchestrator.volume("node-a-1").unwrap();
    assert_eq!(volume.phase, VolumePhase::Available);
    assert!(volume.claim_ref.is_none());
}

#[tokio::test]
async fn unclean_released_volume_stays_released() {
    let mut cluster = Cluster::new(1);
    cluster.reconciler.reconcile_once().await;
    cluster.bind_claim("data", "node-a-1", "1Gi");
    let slot = cluster.base.path().join("1");
    fs::remove_dir(&slot).unwrap();
    fs::write(&slot, b"not a directory").unwrap();
    cluster.orchestrator.set_volume_phase("node-a-1", VolumePhase::Released);

    let report = cluster.reconciler.reconcile_once().await;

    assert_eq!(report.clean_failures, 1);
    assert_eq!(cluster.metrics.agent_metrics().clean_failed_count(), 1.0);
    let volume = cluster.orchestrator.volume("node-a-1").unwrap();
    assert_eq!(volume.phase, VolumePhase::Released);
    assert!(volume.claim_ref.is_some());
    assert_eq!(report.created, vec![2]);

    fs::remove_file(&slot).unwrap();
    fs::create_dir(&slot).unwrap();
    fs::write(slot.join("leftover"), b"data").unwrap();

    let report = cluster.reconciler.reconcile_once().await;

    assert_eq!(report.clean_failures, 0);
    assert_eq!(report.reclaimed, 1);
    let volume = cluster.orchestrator.volume("node-a-1").unwrap();
    assert_eq!(volume.phase, VolumePhase::Available);
    assert!(volume.claim_ref.is_none());
    assert_eq!(fs::read_dir(&slot).unwrap().count(), 0);
}

#[tokio::test]
async fn failed_publish_withdraws_directory() {
    let mut cluster = Cluster::new(1);
    cluster.orchestrator.set_failing(Operation::CreateVolume, true);

    let report = cluster.reconciler.reconcile_once().await;

    assert_eq!(report.create_failures, 1);
    assert!(cluster.slot_dirs().is_empty());
    assert_eq!(cluster.reconciler.allocator().latest(), 0);
    assert_eq!(cluster.metrics.agent_metrics().create_failed_count(), 1.0);

    cluster.orchestrator.set_failing(Operation::CreateVolume, false);
    let report = cluster.reconciler.reconcile_once().await;
    assert_eq!(report.created, vec![1]);
    assert_eq!(cluster.slot_dirs(), vec!["1"]);
}

#[tokio::test]
async fn failed_tag_withdraws_directory() {
    let mut cluster = Cluster::new(1);
    cluster.backend.fail_tag(true);

    let report = cluster.reconciler.reconcile_once().await;

    assert_eq!(report.create_failures, 1);
    assert!(cluster.slot_dirs().is_empty());
    assert!(cluster.orchestrator.volumes().is_empty());
    assert_eq!(cluster.reconciler.allocator().latest(), 0);
}

#[tokio::test]
async fn listing_failure_skips_tick() {
    let mut cluster = Cluster::new(1);
    cluster.orchestrator.set_failing(Operation::ListVolumes, true);

    let report = cluster.reconciler.reconcile_once().await;

    assert!(report.skipped);
    assert!(cluster.slot_dirs().is_empty());
    assert_eq!(cluster.metrics.agent_metrics().create_failed_count(), 0.0);
}

#[tokio::test]
async fn low_drift_is_corrected_once() {
    let mut cluster = Cluster::new(1);
    cluster.reconciler.reconcile_once().await;
    cluster.bind_claim("data", "node-a-1", "10Gi");
    cluster.backend.set_usage(1, usage(GIB, 5 * GIB));

    let report = cluster.reconciler.reconcile_once().await;
    assert_eq!(report.drift_corrected, 1);
    let report = cluster.reconciler.reconcile_once().await;
    assert_eq!(report.drift_corrected, 0);

    assert_eq!(cluster.backend.limit_calls(), vec![(1, "10G".to_string())]);
    assert_eq!(cluster.backend.usage(1).unwrap().limit_bytes, 10 * GIB);
    let metrics = cluster.metrics.agent_metrics();
    assert_eq!(metrics.quota_drift_count(1, Drift::Low), 1.0);
    assert_eq!(metrics.quota_drift_count(1, Drift::High), 0.0);
}

#[tokio::test]
async fn high_drift_is_lowered_when_usage_fits() {
    let mut cluster = Cluster::new(1);
    cluster.reconciler.reconcile_once().await;
    cluster.bind_claim("data", "node-a-1", "10Gi");
    cluster.backend.set_usage(1, usage(2 * GIB, 20 * GIB));

    cluster.reconciler.reconcile_once().await;

    assert_eq!(cluster.backend.usage(1).unwrap().limit_bytes, 10 * GIB);
    assert_eq!(cluster.metrics.agent_metrics().quota_drift_count(1, Drift::High), 1.0);
}

#[tokio::test]
async fn shrink_below_usage_is_never_applied() {
    let mut cluster = Cluster::new(1);
    cluster.reconciler.reconcile_once().await;
    cluster.bind_claim("data", "node-a-1", "10Gi");
    cluster.backend.set_usage(1, usage(15 * GIB, 20 * GIB));

    let report = cluster.reconciler.reconcile_once().await;

    assert_eq!(report.drift_failures, 1);
    assert!(cluster.backend.limit_calls().is_empty());
    assert_eq!(cluster.backend.usage(1).unwrap().limit_bytes, 20 * GIB);
    let metrics = cluster.metrics.agent_metrics();
    assert_eq!(metrics.quota_safety_violation_count(1), 1.0);
    assert_eq!(metrics.quota_drift_count(1, Drift::High), 1.0);
}

#[tokio::test]
async fn unlimited_project_is_not_capped_below_usage() {
    let mut cluster = Cluster::new(1);
    cluster.reconciler.reconcile_once().await;
    cluster.bind_claim("data", "node-a-1", "2Gi");
    cluster.backend.set_usage(1, usage(5 * GIB, 0));

    let report = cluster.reconciler.reconcile_once().await;

    assert_eq!(report.drift_failures, 1);
    assert!(cluster.backend.limit_calls().is_empty());
    assert_eq!(cluster.backend.usage(1).unwrap().limit_bytes, 0);
    let metrics = cluster.metrics.agent_metrics();
    assert_eq!(metrics.quota_safety_violation_count(1), 1.0);
    assert_eq!(metrics.quota_drift_count(1, Drift::Low), 1.0);
    assert_eq!(metrics.quota_drift_count(1, Drift::High), 0.0);
}

#[tokio::test]
async fn restart_recovers_latest_slot() {
    let mut cluster = Cluster::new(3);
    cluster.reconciler.reconcile_once().await;

    let recovered = DirectoryAllocator::recover(cluster.base.path()).unwrap();

    assert_eq!(recovered.latest(), 3);
}

#[tokio::test]
async fn claim_bind_annotates_and_applies_quota() {
    let mut cluster = Cluster::new(1);
    cluster.reconciler.reconcile_once().await;
    let handler = Arc::new(QuotaSyncHandler::new(
        Arc::clone(&cluster.config),
        cluster.orchestrator.clone(),
        cluster.backend.clone(),
        Arc::clone(&cluster.metrics),
    ));
    let mut watcher = ClaimWatcher::new(
        cluster.orchestrator.clone(),
        handler,
        cluster.config.resync_interval,
    );
    cluster.orchestrator.put_claim(Claim {
        namespace: "default".to_string(),
        name: "data".to_string(),
        storage_class: Some("local-storage".to_string()),
        phase: ClaimPhase::Pending,
        requested_storage: Some("8Gi".to_string()),
        ..Claim::default()
    });
    watcher.poll_once().await.unwrap();

    cluster.orchestrator.bind("default", "data", "node-a-1");
    assert_eq!(watcher.poll_once().await.unwrap(), 1);
    let claim = cluster.orchestrator.claim("default", "data").unwrap();
    assert_eq!(claim.quota_annotation(), Some("8Gi"));
    assert!(cluster.backend.limit_calls().is_empty());

    assert_eq!(watcher.poll_once().await.unwrap(), 1);
    assert_eq!(cluster.backend.limit_calls(), vec![(1, "8G".to_string())]);

    assert_eq!(watcher.poll_once().await.unwrap(), 0);
    let report = cluster.reconciler.reconcile_once().await;
    assert_eq!(report.drift_corrected, 0);
    assert_eq!(cluster.backend.limit_calls().len(), 1);
}
