use crate::scancache::{IncrementalConfig, ScanStrategy};
use k8s_openapi::{
    api::core::v1::{ObjectReference, ResourceRequirements},
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired scan of a single node.
///
/// A NodeScan is driven to a terminal phase by materialising one batch Job
/// pinned to the target node and harvesting that Job's structured output.
#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "clamav.antivirus.io",
    version = "v1alpha1",
    kind = "NodeScan",
    namespaced,
    status = "NodeScanStatus",
    shortname = "nscan",
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Scanned","type":"integer","jsonPath":".status.filesScanned"}"#,
    printcolumn = r#"{"name":"Infected","type":"integer","jsonPath":".status.filesInfected"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeScanSpec {
    /// Name of the node to scan. Immutable after creation. Left empty in a
    /// ClusterScan template and filled in per fan-out child.
    #[serde(default)]
    pub node_name: String,

    /// Name of a ScanPolicy in the same namespace supplying defaults,
    /// notification channels and quarantine behaviour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_policy: Option<String>,

    /// Scheduling priority; selects the scanner's resource envelope when no
    /// explicit resources are given.
    #[serde(default)]
    pub priority: ScanPriority,

    /// Absolute host paths to scan. Falls back to the policy, then to the
    /// built-in defaults.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,

    /// Glob or regex patterns excluded from scanning.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_patterns: Vec<String>,

    /// Parallel file scans inside the scanner; 0 means unset.
    #[serde(default)]
    pub max_concurrent: i32,

    /// Per-file scan timeout in milliseconds; 0 means unset.
    #[serde(default)]
    pub file_timeout: i64,

    /// Files larger than this many bytes are skipped; 0 means unset.
    #[serde(default)]
    pub max_file_size: i64,

    /// Resource envelope for the scan Job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Seconds the finished Job is retained before garbage collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,

    /// Scan strategy handed to the scanner.
    #[serde(default)]
    pub strategy: ScanStrategy,

    /// Incremental-scan behaviour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_config: Option<IncrementalConfig>,

    /// Forces a full scan even when incremental scanning is enabled.
    #[serde(default)]
    pub force_full_scan: bool,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ScanPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl std::fmt::Display for ScanPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => "high".fmt(f),
            Self::Medium => "medium".fmt(f),
            Self::Low => "low".fmt(f),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum NodeScanPhase {
    Pending,
    Running,
    Completed,
    Failed,
}

impl NodeScanPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for NodeScanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A file the scanner reported as infected.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfectedFile {
    pub path: String,
    pub viruses: Vec<String>,
    #[serde(default)]
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<Time>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeScanStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<NodeScanPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    /// Wall-clock duration of the scan in seconds.
    #[serde(default)]
    pub duration: i64,

    #[serde(default)]
    pub files_scanned: i64,

    #[serde(default)]
    pub files_infected: i64,

    #[serde(default)]
    pub files_skipped: i64,

    #[serde(default)]
    pub error_count: i64,

    /// Capped at 100 entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub infected_files: Vec<InfectedFile>,

    /// The batch Job executing this scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_ref: Option<ObjectReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    /// Strategy the scan actually ran with, after the cache decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_used: Option<ScanStrategy>,

    /// Files skipped because the incremental cache marked them unchanged.
    #[serde(default)]
    pub files_skipped_incremental: i64,

    /// Percentage of checked files answered from the cache.
    #[serde(default)]
    pub cache_hit_rate: f64,

    /// Estimated seconds saved by incremental scanning.
    #[serde(default)]
    pub time_saved: i64,
}
