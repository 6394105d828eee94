use crate::{
    labels::Selector,
    nodescan::{NodeScanPhase, NodeScanSpec, ScanPriority},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired fan-out of NodeScans over a set of nodes.
#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "clamav.antivirus.io",
    version = "v1alpha1",
    kind = "ClusterScan",
    namespaced,
    status = "ClusterScanStatus",
    shortname = "cscan",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".status.totalNodes"}"#,
    printcolumn = r#"{"name":"Completed","type":"integer","jsonPath":".status.completedNodes"}"#,
    printcolumn = r#"{"name":"Running","type":"integer","jsonPath":".status.runningNodes"}"#,
    printcolumn = r#"{"name":"Failed","type":"integer","jsonPath":".status.failedNodes"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterScanSpec {
    /// Selects the nodes to scan; all nodes when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<Selector>,

    /// ScanPolicy applied to every child NodeScan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_policy: Option<String>,

    /// Maximum nodes scanned in parallel; 0 means the built-in default.
    #[serde(default)]
    pub concurrent: i32,

    #[serde(default)]
    pub priority: ScanPriority,

    /// Template merged into every created NodeScan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_scan_template: Option<NodeScanSpec>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ClusterScanPhase {
    Pending,
    Running,
    Completed,
    Failed,
    PartiallyCompleted,
}

impl ClusterScanPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::PartiallyCompleted
        )
    }
}

impl std::fmt::Display for ClusterScanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Snapshot of one child NodeScan, embedded in the parent's status.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeScanReference {
    pub name: String,
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<NodeScanPhase>,
    #[serde(default)]
    pub files_infected: i64,
    #[serde(default)]
    pub files_scanned: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterScanStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterScanPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    /// Size of the node set selected at the first reconcile; never grows.
    #[serde(default)]
    pub total_nodes: i32,

    #[serde(default)]
    pub completed_nodes: i32,

    #[serde(default)]
    pub running_nodes: i32,

    #[serde(default)]
    pub failed_nodes: i32,

    /// Nodes whose scan found at least one infected file.
    #[serde(default)]
    pub infected_nodes: i32,

    #[serde(default)]
    pub total_files_scanned: i64,

    #[serde(default)]
    pub total_files_infected: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_scans: Vec<NodeScanReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
