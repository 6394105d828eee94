use crate::clusterscan::ClusterScanSpec;
use k8s_openapi::{
    api::core::v1::ObjectReference,
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cron-driven trigger creating ClusterScans.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "clamav.antivirus.io",
    version = "v1alpha1",
    kind = "ScanSchedule",
    namespaced,
    status = "ScanScheduleStatus",
    shortname = "ssched",
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Suspend","type":"boolean","jsonPath":".spec.suspend"}"#,
    printcolumn = r#"{"name":"LastSchedule","type":"date","jsonPath":".status.lastScheduleTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScanScheduleSpec {
    /// Standard 5-field cron expression.
    pub schedule: String,

    /// Spec of the ClusterScan created at each firing.
    pub cluster_scan: ClusterScanSpec,

    /// Suspends subsequent firings; the next-run time keeps advancing.
    #[serde(default)]
    pub suspend: bool,

    /// Completed scans retained; older ones are deleted. Defaults to 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_scans_history_limit: Option<i32>,

    /// Failed or partially completed scans retained. Defaults to 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_scans_history_limit: Option<i32>,

    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,

    /// Seconds after the scheduled time during which a missed firing may
    /// still start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,
}

/// What to do when a firing comes due while previous scans are still active.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConcurrencyPolicy {
    /// Fire regardless of active scans.
    Allow,
    /// Skip the firing while scans are active.
    #[default]
    Forbid,
    /// Delete active scans, then fire.
    Replace,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScanScheduleStatus {
    /// ClusterScans created by this schedule that have not reached a
    /// terminal phase.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active: Vec<ObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_schedule_time: Option<Time>,

    /// Name of the most recently created ClusterScan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cluster_scan: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
