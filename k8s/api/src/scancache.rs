use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Upper bound on tracked file entries, keeping the resource well under the
/// etcd object size limit.
pub const MAX_CACHE_ENTRIES: usize = 10_000;

/// Current cache serialization format.
pub const CACHE_VERSION: &str = "v1";

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum ScanStrategy {
    /// Scan every file on every run.
    #[default]
    Full,
    /// Scan only files changed since the last successful scan.
    Incremental,
    /// Scan only files modified within the configured age window.
    ModifiedOnly,
    /// Incremental scanning with recent files prioritised.
    Smart,
}

impl std::fmt::Display for ScanStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => "full".fmt(f),
            Self::Incremental => "incremental".fmt(f),
            Self::ModifiedOnly => "modified-only".fmt(f),
            Self::Smart => "smart".fmt(f),
        }
    }
}

/// Tuning knobs for incremental scanning.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "IncrementalConfig::default_strategy")]
    pub strategy: ScanStrategy,

    /// Every N-th scan is promoted to a full scan.
    #[serde(default = "IncrementalConfig::default_baseline_interval")]
    pub baseline_interval: i32,

    /// Maximum file age in hours considered by modified-only and smart scans.
    #[serde(default = "IncrementalConfig::default_max_age")]
    pub max_age: i32,

    /// Minimum hours between two scans of the same node.
    #[serde(default = "IncrementalConfig::default_min_time_between_scans")]
    pub min_time_between_scans: i32,

    /// Hours after which the cache is considered stale and a full scan is
    /// forced.
    #[serde(default = "IncrementalConfig::default_cache_expiration")]
    pub cache_expiration: i32,

    #[serde(default = "IncrementalConfig::default_skip_unchanged")]
    pub skip_unchanged_files: bool,
}

impl IncrementalConfig {
    fn default_strategy() -> ScanStrategy {
        ScanStrategy::Incremental
    }

    fn default_baseline_interval() -> i32 {
        7
    }

    fn default_max_age() -> i32 {
        24
    }

    fn default_min_time_between_scans() -> i32 {
        6
    }

    fn default_cache_expiration() -> i32 {
        168
    }

    fn default_skip_unchanged() -> bool {
        true
    }
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: Self::default_strategy(),
            baseline_interval: Self::default_baseline_interval(),
            max_age: Self::default_max_age(),
            min_time_between_scans: Self::default_min_time_between_scans(),
            cache_expiration: Self::default_cache_expiration(),
            skip_unchanged_files: Self::default_skip_unchanged(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScanResult {
    #[default]
    Clean,
    Infected,
}

/// Metadata recorded for one scanned file.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: String,

    /// Modification time, seconds since the epoch.
    #[serde(default)]
    pub mod_time: i64,

    #[serde(default)]
    pub size: i64,

    /// SHA-256 content digest, when the scanner computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    /// Seconds since the epoch of the last scan touching this file.
    #[serde(default)]
    pub last_scanned: i64,

    #[serde(default)]
    pub scan_result: ScanResult,
}

/// Per-node incremental-scan state; one resource per node, named
/// `scancache-<node>`.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "clamav.antivirus.io",
    version = "v1alpha1",
    kind = "ScanCache",
    namespaced,
    status = "ScanCacheStatus",
    shortname = "scache"
)]
#[serde(rename_all = "camelCase")]
pub struct ScanCacheSpec {
    pub node_name: String,

    /// Seconds since the epoch of the last full scan; 0 when never scanned.
    #[serde(default)]
    pub last_full_scan: i64,

    #[serde(default)]
    pub last_incremental_scan: i64,

    /// Incremental scans since the last full scan.
    #[serde(default)]
    pub scan_count: i32,

    /// Unique by path; at most [`MAX_CACHE_ENTRIES`] entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileEntry>,

    #[serde(default)]
    pub total_files: i64,

    #[serde(default = "default_cache_version")]
    pub cache_version: String,
}

fn default_cache_version() -> String {
    CACHE_VERSION.to_string()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScanCacheStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Time>,

    /// Approximate serialized size of the file table, in bytes.
    #[serde(default)]
    pub size: i64,
}

/// Deterministic cache resource name for a node.
pub fn cache_name(node: &str) -> String {
    crate::truncate_name(&format!("scancache-{node}")).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_serializes_kebab_case() {
        for (strategy, expected) in [
            (ScanStrategy::Full, "\"full\""),
            (ScanStrategy::Incremental, "\"incremental\""),
            (ScanStrategy::ModifiedOnly, "\"modified-only\""),
            (ScanStrategy::Smart, "\"smart\""),
        ] {
            assert_eq!(serde_json::to_string(&strategy).unwrap(), expected);
        }
    }

    #[test]
    fn incremental_config_defaults() {
        let config: IncrementalConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.enabled);
        assert_eq!(config.strategy, ScanStrategy::Incremental);
        assert_eq!(config.baseline_interval, 7);
        assert_eq!(config.max_age, 24);
        assert_eq!(config.min_time_between_scans, 6);
        assert_eq!(config.cache_expiration, 168);
        assert!(config.skip_unchanged_files);
    }

    #[test]
    fn cache_name_is_node_scoped() {
        assert_eq!(cache_name("worker-1"), "scancache-worker-1");
    }
}
