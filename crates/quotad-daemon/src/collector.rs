//! Periodic collection of project usage and data disk counters.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use quotad_core::quota::QuotaBackend;
use tracing::{debug, info, warn};

use crate::disk::ProcFs;
use crate::metrics::SharedMetricsRegistry;

/// Refreshes the usage and disk gauges every interval.
pub struct MetricsCollector {
    backend: Arc<dyn QuotaBackend>,
    metrics: SharedMetricsRegistry,
    proc: ProcFs,
    base_dir: PathBuf,
    interval: Duration,
    device: Option<String>,
    shutdown: Arc<AtomicBool>,
}

impl MetricsCollector {
    /// Creates a collector for the filesystem mounted at `base_dir`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn QuotaBackend>,
        metrics: SharedMetricsRegistry,
        proc: ProcFs,
        base_dir: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            metrics,
            proc,
            base_dir: base_dir.into(),
            interval,
            device: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a handle for requesting shutdown.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Collects until shutdown is requested.
    pub async fn run(&mut self) {
        info!(
            interval = %humantime::format_duration(self.interval),
            "metrics collector starting"
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            self.collect_once().await;
            tokio::time::sleep(self.interval).await;
        }

        info!("metrics collector shutting down");
    }

    /// Refreshes every gauge once. Failures leave the previous values.
    pub async fn collect_once(&mut self) {
        match self.backend.read_all_usage().await {
            Ok(reports) => {
                debug!(projects = reports.len(), "collected project usage");
                self.metrics.agent_metrics().set_project_usage(&reports);
            },
            Err(e) => warn!(error = %e, "failed to read project usage"),
        }

        let Some(device) = self.device().await else {
            return;
        };
        match self.proc.disk_stats(&device).await {
            Ok(Some(stats)) => self.metrics.agent_metrics().set_disk_stats(&device, &stats),
            Ok(None) => warn!(%device, "device missing from disk statistics"),
            Err(e) => warn!(error = %e, "failed to read disk statistics"),
        }
    }

    async fn device(&mut self) -> Option<String> {
        if self.device.is_none() {
            match self.proc.mount_device(&self.base_dir).await {
                Ok(Some(device)) => {
                    info!(%device, base_dir = %self.base_dir.display(), "found data disk");
                    self.device = Some(device);
                },
                Ok(None) => {
                    warn!(base_dir = %self.base_dir.display(), "base directory is not a mount point");
                },
                Err(e) => warn!(error = %e, "failed to read mount table"),
            }
        }
        self.device.clone()
    }
}

#[cfg(test)]
mod tests {
    use quotad_core::quota::ProjectUsage;
    use quotad_core::testing::FakeQuotaBackend;

    use super::*;
    use crate::metrics::new_shared_registry;

    #[allow(clippy::float_cmp)]
    #[tokio::test]
    async fn collect_once_updates_gauges() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("mounts"),
            "/dev/sdb1 /data xfs rw,prjquota 0 0\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("diskstats"),
            "   8      17 sdb1 10 0 80 5 20 0 160 7 0 12 12 0 0 0 0\n",
        )
        .unwrap();

        let backend = Arc::new(FakeQuotaBackend::new());
        backend.set_usage(
            4,
            ProjectUsage {
                used_bytes: 2048,
                limit_bytes: 8192,
            },
        );
        let metrics = new_shared_registry("node-a").unwrap();
        let mut collector = MetricsCollector::new(
            backend,
            metrics.clone(),
            ProcFs::new(dir.path()),
            "/data",
            Duration::from_secs(30),
        );

        collector.collect_once().await;

        assert_eq!(metrics.agent_metrics().project_usage(4), (2.0, 8.0));
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("sdb1"), "{text}");
    }

    #[tokio::test]
    async fn collect_once_tolerates_missing_proc_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = Arc::new(FakeQuotaBackend::new());
        backend.fail_reads(true);
        let metrics = new_shared_registry("node-a").unwrap();
        let mut collector = MetricsCollector::new(
            backend,
            metrics,
            ProcFs::new(dir.path()),
            "/data",
            Duration::from_secs(30),
        );

        collector.collect_once().await;

        assert!(collector.device.is_none());
    }
}
