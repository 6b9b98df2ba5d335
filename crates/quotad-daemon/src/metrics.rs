//! Prometheus metrics of the node agent.
//!
//! # Metrics Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `quotad_persistentvolume_create_failed_total` | Counter | `node` |
//! | `quotad_persistentvolume_clean_failed_total` | Counter | `node` |
//! | `quotad_persistentvolume_quota_not_match_total` | Counter | `node`, `id`, `detail` |
//! | `quotad_persistentvolume_quota_safety_violation_total` | Counter | `node`, `id` |
//! | `quotad_persistentvolume_used_kbytes` | Gauge | `node`, `id` |
//! | `quotad_persistentvolume_quota_kbytes` | Gauge | `node`, `id` |
//! | `quotad_data_disk_{read,write}_count` | Gauge | `node`, `name` |
//! | `quotad_data_disk_{read,write}_bytes` | Gauge | `node`, `name` |
//! | `quotad_data_disk_{read,write}_time` | Gauge | `node`, `name` |
//!
//! `detail` is `low` or `high`, the direction of a quota drift. The usage
//! gauges are in 1 KiB blocks, straight from the quota report.

use std::sync::Arc;

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use quotad_core::quota::ProjectReport;
use quotad_core::{Drift, ProjectId};
use thiserror::Error;

use crate::disk::DiskStats;

/// Maximum length for label values.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> MetricsResult<CounterVec> {
    let metric = CounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> MetricsResult<GaugeVec> {
    let metric = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Metrics recorded by the reconciler, the claim handler and the collector.
///
/// Every series carries the `node` label of the agent that owns it.
#[derive(Clone)]
pub struct AgentMetrics {
    node: String,

    create_failed_total: CounterVec,
    clean_failed_total: CounterVec,
    quota_not_match_total: CounterVec,
    quota_safety_violation_total: CounterVec,

    used_kbytes: GaugeVec,
    quota_kbytes: GaugeVec,

    disk_read_count: GaugeVec,
    disk_write_count: GaugeVec,
    disk_read_bytes: GaugeVec,
    disk_write_bytes: GaugeVec,
    disk_read_time: GaugeVec,
    disk_write_time: GaugeVec,
}

impl AgentMetrics {
    /// Creates the metrics for `node` and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry, node: &str) -> MetricsResult<Self> {
        let node_only = &["node"];
        let per_project = &["node", "id"];
        let per_disk = &["node", "name"];

        Ok(Self {
            node: truncate_label(node).to_string(),
            create_failed_total: counter(
                registry,
                "quotad_persistentvolume_create_failed_total",
                "Volumes that could not be allocated or published",
                node_only,
            )?,
            clean_failed_total: counter(
                registry,
                "quotad_persistentvolume_clean_failed_total",
                "Released volumes whose directory could not be cleaned",
                node_only,
            )?,
            quota_not_match_total: counter(
                registry,
                "quotad_persistentvolume_quota_not_match_total",
                "Quota drift events by direction",
                &["node", "id", "detail"],
            )?,
            quota_safety_violation_total: counter(
                registry,
                "quotad_persistentvolume_quota_safety_violation_total",
                "Quota shrinks refused because usage exceeds the desired quota",
                per_project,
            )?,
            used_kbytes: gauge(
                registry,
                "quotad_persistentvolume_used_kbytes",
                "Blocks used per quota project",
                per_project,
            )?,
            quota_kbytes: gauge(
                registry,
                "quotad_persistentvolume_quota_kbytes",
                "Hard limit in blocks per quota project",
                per_project,
            )?,
            disk_read_count: gauge(
                registry,
                "quotad_data_disk_read_count",
                "Reads completed on the data disk",
                per_disk,
            )?,
            disk_write_count: gauge(
                registry,
                "quotad_data_disk_write_count",
                "Writes completed on the data disk",
                per_disk,
            )?,
            disk_read_bytes: gauge(
                registry,
                "quotad_data_disk_read_bytes",
                "Bytes read from the data disk",
                per_disk,
            )?,
            disk_write_bytes: gauge(
                registry,
                "quotad_data_disk_write_bytes",
                "Bytes written to the data disk",
                per_disk,
            )?,
            disk_read_time: gauge(
                registry,
                "quotad_data_disk_read_time",
                "Milliseconds spent reading from the data disk",
                per_disk,
            )?,
            disk_write_time: gauge(
                registry,
                "quotad_data_disk_write_time",
                "Milliseconds spent writing to the data disk",
                per_disk,
            )?,
        })
    }

    // ========================================================================
    // Volume Pool
    // ========================================================================

    /// Records a volume that could not be created.
    pub fn volume_create_failed(&self) {
        self.create_failed_total.with_label_values(&[&self.node]).inc();
    }

    /// Returns the number of failed creations.
    #[must_use]
    pub fn create_failed_count(&self) -> f64 {
        self.create_failed_total.with_label_values(&[&self.node]).get()
    }

    /// Records a released volume that could not be cleaned.
    pub fn volume_clean_failed(&self) {
        self.clean_failed_total.with_label_values(&[&self.node]).inc();
    }

    /// Returns the number of failed cleanings.
    #[must_use]
    pub fn clean_failed_count(&self) -> f64 {
        self.clean_failed_total.with_label_values(&[&self.node]).get()
    }

    // ========================================================================
    // Quota Sync
    // ========================================================================

    /// Records a quota drift of `project`.
    pub fn quota_drift(&self, project: ProjectId, drift: Drift) {
        let id = project.to_string();
        self.quota_not_match_total
            .with_label_values(&[&self.node, &id, drift.as_str()])
            .inc();
    }

    /// Returns the number of drift events of one direction for `project`.
    #[must_use]
    pub fn quota_drift_count(&self, project: ProjectId, drift: Drift) -> f64 {
        let id = project.to_string();
        self.quota_not_match_total
            .with_label_values(&[&self.node, &id, drift.as_str()])
            .get()
    }

    /// Records a refused quota shrink of `project`.
    pub fn quota_safety_violation(&self, project: ProjectId) {
        let id = project.to_string();
        self.quota_safety_violation_total
            .with_label_values(&[&self.node, &id])
            .inc();
    }

    /// Returns the number of refused shrinks for `project`.
    #[must_use]
    pub fn quota_safety_violation_count(&self, project: ProjectId) -> f64 {
        let id = project.to_string();
        self.quota_safety_violation_total
            .with_label_values(&[&self.node, &id])
            .get()
    }

    // ========================================================================
    // Collected Gauges
    // ========================================================================

    /// Replaces the per-project usage gauges with `reports`.
    ///
    /// Projects missing from `reports` are dropped from the output.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_project_usage(&self, reports: &[ProjectReport]) {
        self.used_kbytes.reset();
        self.quota_kbytes.reset();
        for report in reports {
            let id = report.project_id.to_string();
            self.used_kbytes
                .with_label_values(&[&self.node, &id])
                .set(report.used_blocks as f64);
            self.quota_kbytes
                .with_label_values(&[&self.node, &id])
                .set(report.hard_limit_blocks as f64);
        }
    }

    /// Returns `(used, hard limit)` in blocks as last collected for
    /// `project`.
    #[must_use]
    pub fn project_usage(&self, project: ProjectId) -> (f64, f64) {
        let id = project.to_string();
        (
            self.used_kbytes.with_label_values(&[&self.node, &id]).get(),
            self.quota_kbytes.with_label_values(&[&self.node, &id]).get(),
        )
    }

    /// Publishes I/O counters of the data disk `device`.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_disk_stats(&self, device: &str, stats: &DiskStats) {
        let labels = [self.node.as_str(), truncate_label(device)];
        self.disk_read_count
            .with_label_values(&labels)
            .set(stats.read_count as f64);
        self.disk_write_count
            .with_label_values(&labels)
            .set(stats.write_count as f64);
        self.disk_read_bytes
            .with_label_values(&labels)
            .set(stats.read_bytes as f64);
        self.disk_write_bytes
            .with_label_values(&labels)
            .set(stats.write_bytes as f64);
        self.disk_read_time
            .with_label_values(&labels)
            .set(stats.read_time_ms as f64);
        self.disk_write_time
            .with_label_values(&labels)
            .set(stats.write_time_ms as f64);
    }
}

/// Holds the Prometheus registry and the agent metrics registered in it.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    agent_metrics: AgentMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with every agent metric registered for `node`.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new(node: &str) -> MetricsResult<Self> {
        let registry = Registry::new();
        let agent_metrics = AgentMetrics::new(&registry, node)?;
        Ok(Self {
            registry,
            agent_metrics,
        })
    }

    /// Returns the agent metrics.
    #[must_use]
    pub const fn agent_metrics(&self) -> &AgentMetrics {
        &self.agent_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared metrics registry for use across the agent's tasks.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry for `node`.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry(node: &str) -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new(node)?))
}

/// Truncates a label value to at most [`MAX_LABEL_VALUE_LEN`] bytes on a
/// character boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        value
    } else {
        let end = value
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
            .last()
            .unwrap_or(0);
        &value[..end]
    }
}
