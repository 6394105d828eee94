//! Prometheus metrics for the scan controllers, registered under the
//! `clamav` prefix on the admin endpoint's registry.

use clamav_operator_k8s_api::{
    ClusterScan, ClusterScanPhase, NodeScan, NodeScanPhase, ScanStrategy,
};
use kube::ResourceExt;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::sync::atomic::AtomicU64;

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct NodeLabels {
    pub namespace: String,
    pub node: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct NodeStatusLabels {
    pub namespace: String,
    pub node: String,
    pub status: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct NamespaceLabels {
    pub namespace: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct ClusterScanLabels {
    pub namespace: String,
    pub clusterscan: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct StatusLabels {
    pub namespace: String,
    pub status: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct PolicyLabels {
    pub namespace: String,
    pub policy: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct ScheduleLabels {
    pub namespace: String,
    pub schedule: String,
    pub status: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
pub struct StrategyLabels {
    pub namespace: String,
    pub node: String,
    pub strategy: String,
}

const SCAN_DURATION_BUCKETS: [f64; 8] =
    [30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0];

#[derive(Debug)]
pub struct Metrics {
    nodescans: Family<NodeStatusLabels, Counter>,
    nodescans_running: Family<NamespaceLabels, Gauge>,
    files_scanned: Family<NodeLabels, Counter>,
    files_infected: Family<NodeLabels, Counter>,
    scan_duration: Family<NodeLabels, Histogram>,
    clusterscan_nodes_total: Family<ClusterScanLabels, Gauge>,
    clusterscan_nodes_completed: Family<ClusterScanLabels, Gauge>,
    clusterscan_nodes_failed: Family<ClusterScanLabels, Gauge>,
    clusterscans: Family<StatusLabels, Counter>,
    scanpolicy_usage: Family<PolicyLabels, Counter>,
    scanschedule_executions: Family<ScheduleLabels, Counter>,
    incremental_scans: Family<StrategyLabels, Counter>,
    files_skipped_incremental: Family<NodeLabels, Counter>,
    cache_hit_rate: Family<NodeLabels, Gauge<f64, AtomicU64>>,
    time_saved_incremental: Family<NodeLabels, Counter>,
    scan_cache_size: Family<NodeLabels, Gauge>,
    scan_cache_files: Family<NodeLabels, Gauge>,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let nodescans = Family::<NodeStatusLabels, Counter>::default();
        reg.register(
            "nodescans",
            "Total number of NodeScans by terminal status",
            nodescans.clone(),
        );

        let nodescans_running = Family::<NamespaceLabels, Gauge>::default();
        reg.register(
            "nodescans_running",
            "Number of currently running NodeScans",
            nodescans_running.clone(),
        );

        let files_scanned = Family::<NodeLabels, Counter>::default();
        reg.register(
            "files_scanned",
            "Total number of files scanned",
            files_scanned.clone(),
        );

        let files_infected = Family::<NodeLabels, Counter>::default();
        reg.register(
            "files_infected",
            "Total number of infected files found",
            files_infected.clone(),
        );

        let scan_duration = Family::<NodeLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(SCAN_DURATION_BUCKETS)
        });
        reg.register_with_unit(
            "scan_duration",
            "Duration of node scans",
            Unit::Seconds,
            scan_duration.clone(),
        );

        let clusterscan_nodes_total = Family::<ClusterScanLabels, Gauge>::default();
        reg.register(
            "clusterscan_nodes_total",
            "Total number of nodes in a ClusterScan",
            clusterscan_nodes_total.clone(),
        );

        let clusterscan_nodes_completed = Family::<ClusterScanLabels, Gauge>::default();
        reg.register(
            "clusterscan_nodes_completed",
            "Number of completed nodes in a ClusterScan",
            clusterscan_nodes_completed.clone(),
        );

        let clusterscan_nodes_failed = Family::<ClusterScanLabels, Gauge>::default();
        reg.register(
            "clusterscan_nodes_failed",
            "Number of failed nodes in a ClusterScan",
            clusterscan_nodes_failed.clone(),
        );

        let clusterscans = Family::<StatusLabels, Counter>::default();
        reg.register(
            "clusterscans",
            "Total number of ClusterScans by terminal status",
            clusterscans.clone(),
        );

        let scanpolicy_usage = Family::<PolicyLabels, Counter>::default();
        reg.register(
            "scanpolicy_usage",
            "Number of times a ScanPolicy has been used",
            scanpolicy_usage.clone(),
        );

        let scanschedule_executions = Family::<ScheduleLabels, Counter>::default();
        reg.register(
            "scanschedule_executions",
            "Total number of ScanSchedule firings",
            scanschedule_executions.clone(),
        );

        let incremental_scans = Family::<StrategyLabels, Counter>::default();
        reg.register(
            "incremental_scans",
            "Total number of non-full scans by strategy",
            incremental_scans.clone(),
        );

        let files_skipped_incremental = Family::<NodeLabels, Counter>::default();
        reg.register(
            "files_skipped_incremental",
            "Total number of files skipped by incremental scanning",
            files_skipped_incremental.clone(),
        );

        let cache_hit_rate = Family::<NodeLabels, Gauge<f64, AtomicU64>>::default();
        reg.register(
            "cache_hit_rate_percent",
            "Cache hit rate percentage for incremental scans",
            cache_hit_rate.clone(),
        );

        let time_saved_incremental = Family::<NodeLabels, Counter>::default();
        reg.register_with_unit(
            "time_saved_incremental",
            "Time saved by incremental scanning",
            Unit::Seconds,
            time_saved_incremental.clone(),
        );

        let scan_cache_size = Family::<NodeLabels, Gauge>::default();
        reg.register_with_unit(
            "scan_cache_size",
            "Serialized size of the per-node scan cache",
            Unit::Bytes,
            scan_cache_size.clone(),
        );

        let scan_cache_files = Family::<NodeLabels, Gauge>::default();
        reg.register(
            "scan_cache_files_total",
            "Number of files tracked in the per-node scan cache",
            scan_cache_files.clone(),
        );

        Self {
            nodescans,
            nodescans_running,
            files_scanned,
            files_infected,
            scan_duration,
            clusterscan_nodes_total,
            clusterscan_nodes_completed,
            clusterscan_nodes_failed,
            clusterscans,
            scanpolicy_usage,
            scanschedule_executions,
            incremental_scans,
            files_skipped_incremental,
            cache_hit_rate,
            time_saved_incremental,
            scan_cache_size,
            scan_cache_files,
        }
    }

    pub fn record_node_scan(&self, scan: &NodeScan, phase: NodeScanPhase) {
        let namespace = scan.namespace().unwrap_or_default();
        let node = scan.spec.node_name.clone();

        self.nodescans
            .get_or_create(&NodeStatusLabels {
                namespace: namespace.clone(),
                node: node.clone(),
                status: phase.to_string(),
            })
            .inc();

        if phase != NodeScanPhase::Completed {
            return;
        }

        let status = scan.status.clone().unwrap_or_default();
        let labels = NodeLabels { namespace, node };
        if status.files_scanned > 0 {
            self.files_scanned
                .get_or_create(&labels)
                .inc_by(status.files_scanned as u64);
        }
        if status.files_infected > 0 {
            self.files_infected
                .get_or_create(&labels)
                .inc_by(status.files_infected as u64);
        }
        if status.duration > 0 {
            self.scan_duration
                .get_or_create(&labels)
                .observe(status.duration as f64);
        }

        if let Some(strategy) = status.strategy_used.filter(|s| *s != ScanStrategy::Full) {
            self.incremental_scans
                .get_or_create(&StrategyLabels {
                    namespace: labels.namespace.clone(),
                    node: labels.node.clone(),
                    strategy: strategy.to_string(),
                })
                .inc();

            if status.files_skipped_incremental > 0 {
                self.files_skipped_incremental
                    .get_or_create(&labels)
                    .inc_by(status.files_skipped_incremental as u64);
                self.cache_hit_rate
                    .get_or_create(&labels)
                    .set(status.cache_hit_rate);
            }
            if status.time_saved > 0 {
                self.time_saved_incremental
                    .get_or_create(&labels)
                    .inc_by(status.time_saved as u64);
            }
        }
    }

    pub fn set_nodescans_running(&self, namespace: &str, count: i64) {
        self.nodescans_running
            .get_or_create(&NamespaceLabels {
                namespace: namespace.to_string(),
            })
            .set(count);
    }

    pub fn record_cluster_scan(&self, scan: &ClusterScan, phase: ClusterScanPhase) {
        let namespace = scan.namespace().unwrap_or_default();
        let name = scan.name_any();
        let status = scan.status.clone().unwrap_or_default();

        self.clusterscans
            .get_or_create(&StatusLabels {
                namespace: namespace.clone(),
                status: phase.to_string(),
            })
            .inc();

        let labels = ClusterScanLabels {
            namespace,
            clusterscan: name,
        };
        self.clusterscan_nodes_total
            .get_or_create(&labels)
            .set(status.total_nodes as i64);
        self.clusterscan_nodes_completed
            .get_or_create(&labels)
            .set(status.completed_nodes as i64);
        self.clusterscan_nodes_failed
            .get_or_create(&labels)
            .set(status.failed_nodes as i64);
    }

    pub fn record_policy_usage(&self, namespace: &str, policy: &str) {
        self.scanpolicy_usage
            .get_or_create(&PolicyLabels {
                namespace: namespace.to_string(),
                policy: policy.to_string(),
            })
            .inc();
    }

    pub fn record_schedule_execution(&self, namespace: &str, schedule: &str, status: &str) {
        self.scanschedule_executions
            .get_or_create(&ScheduleLabels {
                namespace: namespace.to_string(),
                schedule: schedule.to_string(),
                status: status.to_string(),
            })
            .inc();
    }

    pub fn record_scan_cache(&self, namespace: &str, node: &str, size_bytes: i64, files: i64) {
        let labels = NodeLabels {
            namespace: namespace.to_string(),
            node: node.to_string(),
        };
        self.scan_cache_size.get_or_create(&labels).set(size_bytes);
        self.scan_cache_files.get_or_create(&labels).set(files);
    }
}
