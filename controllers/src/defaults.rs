//! Built-in scan defaults and the effective-value cascade.
//!
//! Every tunable resolves through the same fallback order: explicit NodeScan
//! field, then the referenced ScanPolicy, then the priority band (resources
//! only), then the hardcoded default. The cascade is spelled out per field
//! rather than merged wholesale so precedence stays auditable.

use clamav_operator_k8s_api::{
    nodescan::{NodeScanSpec, ScanPriority},
    scanpolicy::ScanPolicySpec,
    ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

/// Default number of files scanned in parallel.
pub const DEFAULT_MAX_CONCURRENT: i32 = 5;

/// Default per-file timeout, milliseconds.
pub const DEFAULT_FILE_TIMEOUT_MS: i64 = 300_000;

/// Default maximum file size, bytes (100 MiB).
pub const DEFAULT_MAX_FILE_SIZE: i64 = 104_857_600;

/// Default ClamAV connect timeout, milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: i64 = 60_000;

/// Default TTL of a finished scan Job, seconds (24 hours).
pub const DEFAULT_TTL_SECONDS: i32 = 86_400;

/// Default number of nodes a ClusterScan drives in parallel.
pub const DEFAULT_CLUSTER_CONCURRENT: i32 = 3;

/// Paths scanned when neither the scan nor its policy names any.
pub const DEFAULT_SCAN_PATHS: &[&str] = &["/host/var/lib", "/host/opt"];

fn quantities(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

fn requirements(
    requests: &[(&str, &str)],
    limits: &[(&str, &str)],
) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(quantities(requests)),
        limits: Some(quantities(limits)),
        ..Default::default()
    }
}

/// Scanner resource envelope for a priority band. The medium band balances
/// scan throughput against node impact; high doubles it for scans that must
/// finish fast, low halves it for background sweeps.
pub fn resources_for_priority(priority: ScanPriority) -> ResourceRequirements {
    match priority {
        ScanPriority::High => requirements(
            &[("cpu", "500m"), ("memory", "512Mi")],
            &[("cpu", "2000m"), ("memory", "1Gi")],
        ),
        ScanPriority::Medium => requirements(
            &[("cpu", "100m"), ("memory", "256Mi")],
            &[("cpu", "1000m"), ("memory", "512Mi")],
        ),
        ScanPriority::Low => requirements(
            &[("cpu", "50m"), ("memory", "128Mi")],
            &[("cpu", "500m"), ("memory", "256Mi")],
        ),
    }
}

/// The settings a scan Job is actually built from, after resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanSettings {
    pub paths: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub max_concurrent: i32,
    pub file_timeout_ms: i64,
    pub connect_timeout_ms: i64,
    pub max_file_size: i64,
    pub resources: ResourceRequirements,
    pub ttl_seconds_after_finished: i32,
}

impl ScanSettings {
    pub fn resolve(scan: &NodeScanSpec, policy: Option<&ScanPolicySpec>) -> Self {
        let paths = if !scan.paths.is_empty() {
            scan.paths.clone()
        } else if let Some(paths) = policy.map(|p| &p.paths).filter(|p| !p.is_empty()) {
            paths.clone()
        } else {
            DEFAULT_SCAN_PATHS.iter().map(|p| p.to_string()).collect()
        };

        let exclude_patterns = if !scan.exclude_patterns.is_empty() {
            scan.exclude_patterns.clone()
        } else {
            policy
                .map(|p| p.exclude_patterns.clone())
                .unwrap_or_default()
        };

        let max_concurrent = first_nonzero_i32(
            scan.max_concurrent,
            policy.map(|p| p.max_concurrent).unwrap_or(0),
            DEFAULT_MAX_CONCURRENT,
        );

        let file_timeout_ms = first_nonzero_i64(
            scan.file_timeout,
            policy.map(|p| p.file_timeout).unwrap_or(0),
            DEFAULT_FILE_TIMEOUT_MS,
        );

        let max_file_size = first_nonzero_i64(
            scan.max_file_size,
            policy.map(|p| p.max_file_size).unwrap_or(0),
            DEFAULT_MAX_FILE_SIZE,
        );

        let connect_timeout_ms = first_nonzero_i64(
            policy.map(|p| p.connect_timeout).unwrap_or(0),
            0,
            DEFAULT_CONNECT_TIMEOUT_MS,
        );

        let resources = scan
            .resources
            .clone()
            .or_else(|| policy.and_then(|p| p.resources.clone()))
            .unwrap_or_else(|| resources_for_priority(scan.priority));

        let ttl_seconds_after_finished = scan
            .ttl_seconds_after_finished
            .unwrap_or(DEFAULT_TTL_SECONDS);

        Self {
            paths,
            exclude_patterns,
            max_concurrent,
            file_timeout_ms,
            connect_timeout_ms,
            max_file_size,
            resources,
            ttl_seconds_after_finished,
        }
    }
}

fn first_nonzero_i32(explicit: i32, from_policy: i32, fallback: i32) -> i32 {
    if explicit != 0 {
        explicit
    } else if from_policy != 0 {
        from_policy
    } else {
        fallback
    }
}

fn first_nonzero_i64(explicit: i64, from_policy: i64, fallback: i64) -> i64 {
    if explicit != 0 {
        explicit
    } else if from_policy != 0 {
        from_policy
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(node: &str) -> NodeScanSpec {
        NodeScanSpec {
            node_name: node.to_string(),
            scan_policy: None,
            priority: ScanPriority::Medium,
            paths: Vec::new(),
            exclude_patterns: Vec::new(),
            max_concurrent: 0,
            file_timeout: 0,
            max_file_size: 0,
            resources: None,
            ttl_seconds_after_finished: None,
            strategy: Default::default(),
            incremental_config: None,
            force_full_scan: false,
        }
    }

    fn policy() -> ScanPolicySpec {
        ScanPolicySpec {
            paths: vec!["/host/srv".to_string()],
            exclude_patterns: vec!["*.iso".to_string()],
            max_concurrent: 10,
            file_timeout: 120_000,
            max_file_size: 2_048,
            connect_timeout: 30_000,
            resources: None,
            notifications: None,
            quarantine: None,
        }
    }

    #[test]
    fn hardcoded_defaults_apply_without_policy() {
        let settings = ScanSettings::resolve(&scan("worker-1"), None);
        assert_eq!(settings.paths, vec!["/host/var/lib", "/host/opt"]);
        assert_eq!(settings.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert_eq!(settings.file_timeout_ms, DEFAULT_FILE_TIMEOUT_MS);
        assert_eq!(settings.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(settings.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(settings.ttl_seconds_after_finished, DEFAULT_TTL_SECONDS);
        assert_eq!(
            settings.resources,
            resources_for_priority(ScanPriority::Medium)
        );
    }

    #[test]
    fn policy_values_beat_defaults() {
        let settings = ScanSettings::resolve(&scan("worker-1"), Some(&policy()));
        assert_eq!(settings.paths, vec!["/host/srv"]);
        assert_eq!(settings.exclude_patterns, vec!["*.iso"]);
        assert_eq!(settings.max_concurrent, 10);
        assert_eq!(settings.file_timeout_ms, 120_000);
        assert_eq!(settings.max_file_size, 2_048);
        assert_eq!(settings.connect_timeout_ms, 30_000);
    }

    #[test]
    fn explicit_fields_beat_policy() {
        let mut spec = scan("worker-1");
        spec.paths = vec!["/host/data".to_string()];
        spec.max_concurrent = 2;
        spec.file_timeout = 5_000;
        spec.max_file_size = 4_096;
        let settings = ScanSettings::resolve(&spec, Some(&policy()));
        assert_eq!(settings.paths, vec!["/host/data"]);
        assert_eq!(settings.max_concurrent, 2);
        assert_eq!(settings.file_timeout_ms, 5_000);
        assert_eq!(settings.max_file_size, 4_096);
    }

    #[test]
    fn priority_selects_resource_band() {
        let mut spec = scan("worker-1");
        spec.priority = ScanPriority::High;
        let settings = ScanSettings::resolve(&spec, None);
        assert_eq!(settings.resources, resources_for_priority(ScanPriority::High));

        spec.priority = ScanPriority::Low;
        let settings = ScanSettings::resolve(&spec, None);
        assert_eq!(settings.resources, resources_for_priority(ScanPriority::Low));
    }

    #[test]
    fn explicit_resources_beat_priority_band() {
        let mut spec = scan("worker-1");
        spec.priority = ScanPriority::High;
        spec.resources = Some(resources_for_priority(ScanPriority::Low));
        let settings = ScanSettings::resolve(&spec, None);
        assert_eq!(settings.resources, resources_for_priority(ScanPriority::Low));
    }
}
