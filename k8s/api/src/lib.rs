#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod clusterscan;
pub mod conditions;
pub mod labels;
pub mod nodescan;
pub mod scancache;
pub mod scanpolicy;
pub mod scanschedule;
pub mod validation;

pub use self::{
    clusterscan::{
        ClusterScan, ClusterScanPhase, ClusterScanSpec, ClusterScanStatus, NodeScanReference,
    },
    labels::{Labels, Selector},
    nodescan::{InfectedFile, NodeScan, NodeScanPhase, NodeScanSpec, NodeScanStatus, ScanPriority},
    scancache::{
        FileEntry, IncrementalConfig, ScanCache, ScanCacheSpec, ScanCacheStatus, ScanResult,
        ScanStrategy,
    },
    scanpolicy::{
        EmailConfig, NotificationConfig, QuarantineAction, QuarantineConfig, ScanPolicy,
        ScanPolicySpec, ScanPolicyStatus, SlackConfig, SmtpTransportSecurity, WebhookConfig,
    },
    scanschedule::{ConcurrencyPolicy, ScanSchedule, ScanScheduleSpec, ScanScheduleStatus},
};

pub use k8s_openapi::{
    api::{
        self,
        batch::v1::{Job, JobSpec},
        core::v1::{
            ConfigMap, Container, EnvVar, Namespace, Node, ObjectReference, Pod, PodSpec,
            PodTemplateSpec, ResourceRequirements, Secret, Service, ServiceAccount,
        },
    },
    apimachinery::{
        self,
        pkg::apis::meta::v1::{Condition, Time},
    },
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource, ResourceExt},
    error::ErrorResponse,
    Client, Error,
};

/// API group shared by every scan resource.
pub const GROUP: &str = "clamav.antivirus.io";

/// Label carried by NodeScans created from a ClusterScan fan-out.
pub const CLUSTERSCAN_LABEL: &str = "clamav.antivirus.io/clusterscan";

/// Label carried by ClusterScans created from a ScanSchedule firing.
pub const SCHEDULE_LABEL: &str = "clamav.antivirus.io/schedule";

/// Label naming the node a scan resource targets.
pub const NODE_LABEL: &str = "clamav.antivirus.io/node";

/// Kubernetes object names are bounded to 63 characters.
pub fn truncate_name(name: &str) -> &str {
    if name.len() > 63 {
        &name[..63]
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::truncate_name;

    #[test]
    fn truncate_name_is_identity_for_short_names() {
        assert_eq!(truncate_name("nodescan-s1"), "nodescan-s1");
    }

    #[test]
    fn truncate_name_cuts_at_63() {
        let long = "x".repeat(100);
        assert_eq!(truncate_name(&long).len(), 63);
    }
}
