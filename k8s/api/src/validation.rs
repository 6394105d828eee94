//! Admission-time validation of scan resources.
//!
//! These rules are pure functions over the declarative specs so they can be
//! exercised from the admission webhook, from a pre-create hook, or from
//! tests without a cluster. Reconcilers do not assume validation has run.

use crate::{
    clusterscan::ClusterScanSpec, nodescan::NodeScanSpec, scanpolicy::ScanPolicySpec,
    scanschedule::ScanScheduleSpec,
};
use k8s_openapi::{
    api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity,
};
use regex::Regex;
use std::str::FromStr;
use thiserror::Error;

pub const MAX_PATHS: usize = 100;
pub const MAX_PATH_LENGTH: usize = 4096;
pub const MAX_EXCLUDE_PATTERNS: usize = 200;
pub const MAX_EXCLUDE_PATTERN_LENGTH: usize = 1024;
pub const MIN_FILE_TIMEOUT_MS: i64 = 1_000;
pub const MAX_FILE_TIMEOUT_MS: i64 = 3_600_000;
pub const MIN_MAX_FILE_SIZE: i64 = 1_024;
pub const MAX_MAX_FILE_SIZE: i64 = 10_737_418_240;
pub const MIN_NODESCAN_CONCURRENT: i32 = 1;
pub const MAX_NODESCAN_CONCURRENT: i32 = 20;
pub const MIN_CLUSTERSCAN_CONCURRENT: i32 = 1;
pub const MAX_CLUSTERSCAN_CONCURRENT: i32 = 50;

/// Kernel trees the scanner must never be pointed at.
const PRIVILEGED_TREES: &[&str] = &["/proc", "/sys", "/dev"];

/// The scanner cannot function below this memory limit.
const MIN_MEMORY_LIMIT_BYTES: f64 = 64.0 * 1024.0 * 1024.0;

const DNS1123_SUBDOMAIN: &str =
    r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";

#[derive(Clone, Debug, PartialEq, Error)]
pub enum Invalid {
    #[error("nodeName is required")]
    NodeNameRequired,

    #[error("nodeName must be a valid DNS-1123 subdomain of at most 253 characters")]
    NodeNameInvalid,

    #[error("nodeName cannot be changed after creation")]
    NodeNameImmutable,

    #[error("at most {MAX_PATHS} paths may be specified")]
    TooManyPaths,

    #[error("path {0:?} cannot be empty")]
    EmptyPath(String),

    #[error("path {0:?} exceeds {MAX_PATH_LENGTH} characters")]
    PathTooLong(String),

    #[error("path {0:?} must be absolute")]
    PathNotAbsolute(String),

    #[error("path {0:?} cannot contain '..'")]
    PathTraversal(String),

    #[error("scanning {tree} is not allowed; path {path:?} targets a privileged kernel tree")]
    PrivilegedPath { path: String, tree: &'static str },

    #[error("at most {MAX_EXCLUDE_PATTERNS} exclude patterns may be specified")]
    TooManyPatterns,

    #[error("exclude pattern cannot be empty")]
    EmptyPattern,

    #[error("exclude pattern {0:?} exceeds {MAX_EXCLUDE_PATTERN_LENGTH} characters")]
    PatternTooLong(String),

    #[error("invalid regex pattern {pattern:?}: {reason}")]
    BadRegex { pattern: String, reason: String },

    #[error("invalid glob pattern {pattern:?}: {reason}")]
    BadGlob { pattern: String, reason: String },

    #[error("maxConcurrent must be between {MIN_NODESCAN_CONCURRENT} and {MAX_NODESCAN_CONCURRENT}")]
    NodeScanConcurrentOutOfRange,

    #[error("concurrent must be between {MIN_CLUSTERSCAN_CONCURRENT} and {MAX_CLUSTERSCAN_CONCURRENT}")]
    ClusterScanConcurrentOutOfRange,

    #[error("fileTimeout must be between {MIN_FILE_TIMEOUT_MS} and {MAX_FILE_TIMEOUT_MS} milliseconds")]
    FileTimeoutOutOfRange,

    #[error("maxFileSize must be between {MIN_MAX_FILE_SIZE} and {MAX_MAX_FILE_SIZE} bytes")]
    MaxFileSizeOutOfRange,

    #[error("{resource} limit must be greater than or equal to the {resource} request")]
    LimitBelowRequest { resource: &'static str },

    #[error("memory limit must be at least 64Mi for the scanner to function")]
    MemoryLimitTooSmall,

    #[error("at least one path is required")]
    PathsRequired,

    #[error("at least one recipient is required")]
    RecipientsRequired,

    #[error("historyLimit cannot be negative")]
    NegativeHistoryLimit,

    #[error("invalid cron schedule {schedule:?}: {reason}")]
    BadSchedule { schedule: String, reason: String },
}

/// Collected validation failures for one spec.
#[derive(Clone, Debug, PartialEq)]
pub struct Errors(pub Vec<Invalid>);

impl std::error::Error for Errors {}

impl std::fmt::Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for e in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{e}")?;
            first = false;
        }
        Ok(())
    }
}

fn finish(errors: Vec<Invalid>) -> Result<(), Errors> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Errors(errors))
    }
}

pub fn validate_node_scan(spec: &NodeScanSpec) -> Result<(), Errors> {
    let mut errors = Vec::new();
    validate_node_name(&spec.node_name, &mut errors);
    validate_paths(&spec.paths, false, &mut errors);
    validate_exclude_patterns(&spec.exclude_patterns, &mut errors);
    validate_node_scan_concurrent(spec.max_concurrent, &mut errors);
    validate_file_timeout(spec.file_timeout, &mut errors);
    validate_max_file_size(spec.max_file_size, &mut errors);
    validate_resources(spec.resources.as_ref(), &mut errors);
    finish(errors)
}

/// Update-time validation: the target node is immutable.
pub fn validate_node_scan_update(old: &NodeScanSpec, new: &NodeScanSpec) -> Result<(), Errors> {
    if old.node_name != new.node_name {
        return Err(Errors(vec![Invalid::NodeNameImmutable]));
    }
    validate_node_scan(new)
}

pub fn validate_cluster_scan(spec: &ClusterScanSpec) -> Result<(), Errors> {
    let mut errors = Vec::new();
    if spec.concurrent != 0
        && !(MIN_CLUSTERSCAN_CONCURRENT..=MAX_CLUSTERSCAN_CONCURRENT).contains(&spec.concurrent)
    {
        errors.push(Invalid::ClusterScanConcurrentOutOfRange);
    }
    if let Some(template) = &spec.node_scan_template {
        // The template's nodeName is filled in per fan-out child, so it is
        // exempt from the required-field rule.
        validate_paths(&template.paths, false, &mut errors);
        validate_exclude_patterns(&template.exclude_patterns, &mut errors);
        validate_node_scan_concurrent(template.max_concurrent, &mut errors);
        validate_file_timeout(template.file_timeout, &mut errors);
        validate_max_file_size(template.max_file_size, &mut errors);
        validate_resources(template.resources.as_ref(), &mut errors);
    }
    finish(errors)
}

pub fn validate_scan_policy(spec: &ScanPolicySpec) -> Result<(), Errors> {
    let mut errors = Vec::new();
    validate_paths(&spec.paths, true, &mut errors);
    validate_exclude_patterns(&spec.exclude_patterns, &mut errors);
    validate_node_scan_concurrent(spec.max_concurrent, &mut errors);
    validate_file_timeout(spec.file_timeout, &mut errors);
    validate_max_file_size(spec.max_file_size, &mut errors);
    validate_resources(spec.resources.as_ref(), &mut errors);
    if let Some(email) = spec.notifications.as_ref().and_then(|n| n.email.as_ref()) {
        if email.recipients.is_empty() {
            errors.push(Invalid::RecipientsRequired);
        }
    }
    finish(errors)
}

pub fn validate_scan_schedule(spec: &ScanScheduleSpec) -> Result<(), Errors> {
    let mut errors = Vec::new();
    if let Err(e) = parse_cron(&spec.schedule) {
        errors.push(e);
    }
    for limit in [
        spec.successful_scans_history_limit,
        spec.failed_scans_history_limit,
    ]
    .into_iter()
    .flatten()
    {
        if limit < 0 {
            errors.push(Invalid::NegativeHistoryLimit);
            break;
        }
    }
    if let Err(Errors(inner)) = validate_cluster_scan(&spec.cluster_scan) {
        errors.extend(inner);
    }
    finish(errors)
}

/// Parses a standard 5-field cron expression. The `cron` crate wants a
/// leading seconds field, so one is prepended.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, Invalid> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(Invalid::BadSchedule {
            schedule: expr.to_string(),
            reason: format!("expected 5 fields, found {fields}"),
        });
    }
    cron::Schedule::from_str(&format!("0 {expr}")).map_err(|e| Invalid::BadSchedule {
        schedule: expr.to_string(),
        reason: e.to_string(),
    })
}

fn validate_node_name(name: &str, errors: &mut Vec<Invalid>) {
    if name.is_empty() {
        errors.push(Invalid::NodeNameRequired);
        return;
    }
    let re = Regex::new(DNS1123_SUBDOMAIN).expect("regex must compile");
    if name.len() > 253 || !re.is_match(name) {
        errors.push(Invalid::NodeNameInvalid);
    }
}

fn validate_paths(paths: &[String], required: bool, errors: &mut Vec<Invalid>) {
    if required && paths.is_empty() {
        errors.push(Invalid::PathsRequired);
        return;
    }
    if paths.len() > MAX_PATHS {
        errors.push(Invalid::TooManyPaths);
    }
    for path in paths {
        if path.trim().is_empty() {
            errors.push(Invalid::EmptyPath(path.clone()));
            continue;
        }
        if path.len() > MAX_PATH_LENGTH {
            errors.push(Invalid::PathTooLong(path.clone()));
        }
        if !path.starts_with('/') {
            errors.push(Invalid::PathNotAbsolute(path.clone()));
        }
        if path.contains("..") {
            errors.push(Invalid::PathTraversal(path.clone()));
        }
        for tree in PRIVILEGED_TREES {
            if path == tree || path.starts_with(&format!("{tree}/")) {
                errors.push(Invalid::PrivilegedPath {
                    path: path.clone(),
                    tree,
                });
            }
        }
    }
}

fn validate_exclude_patterns(patterns: &[String], errors: &mut Vec<Invalid>) {
    if patterns.len() > MAX_EXCLUDE_PATTERNS {
        errors.push(Invalid::TooManyPatterns);
    }
    for pattern in patterns {
        if pattern.trim().is_empty() {
            errors.push(Invalid::EmptyPattern);
            continue;
        }
        if pattern.len() > MAX_EXCLUDE_PATTERN_LENGTH {
            errors.push(Invalid::PatternTooLong(pattern.clone()));
        }
        if is_regex_pattern(pattern) {
            if let Err(e) = Regex::new(pattern) {
                errors.push(Invalid::BadRegex {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        } else if let Err(e) = validate_glob(pattern) {
            errors.push(Invalid::BadGlob {
                pattern: pattern.clone(),
                reason: e,
            });
        }
    }
}

/// A pattern is treated as a regex only when it carries anchors or
/// regex-only constructs; plain globs like `*.tmp` stay globs.
fn is_regex_pattern(pattern: &str) -> bool {
    if pattern.starts_with('^') || pattern.ends_with('$') {
        return true;
    }
    if pattern.contains(['+', '|']) {
        return true;
    }
    pattern.contains(r"\d") || pattern.contains(r"\w") || pattern.contains(r"\s")
}

/// Structural validation of a glob: brackets must close.
fn validate_glob(pattern: &str) -> Result<(), String> {
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if chars.next().is_none() {
                    return Err("trailing backslash".to_string());
                }
            }
            '[' => loop {
                match chars.next() {
                    Some(']') => break,
                    Some('\\') => {
                        if chars.next().is_none() {
                            return Err("trailing backslash".to_string());
                        }
                    }
                    Some(_) => {}
                    None => return Err("unclosed character class".to_string()),
                }
            },
            _ => {}
        }
    }
    Ok(())
}

fn validate_node_scan_concurrent(concurrent: i32, errors: &mut Vec<Invalid>) {
    if concurrent != 0
        && !(MIN_NODESCAN_CONCURRENT..=MAX_NODESCAN_CONCURRENT).contains(&concurrent)
    {
        errors.push(Invalid::NodeScanConcurrentOutOfRange);
    }
}

fn validate_file_timeout(timeout: i64, errors: &mut Vec<Invalid>) {
    if timeout != 0 && !(MIN_FILE_TIMEOUT_MS..=MAX_FILE_TIMEOUT_MS).contains(&timeout) {
        errors.push(Invalid::FileTimeoutOutOfRange);
    }
}

fn validate_max_file_size(size: i64, errors: &mut Vec<Invalid>) {
    if size != 0 && !(MIN_MAX_FILE_SIZE..=MAX_MAX_FILE_SIZE).contains(&size) {
        errors.push(Invalid::MaxFileSizeOutOfRange);
    }
}

fn validate_resources(resources: Option<&ResourceRequirements>, errors: &mut Vec<Invalid>) {
    let Some(resources) = resources else {
        return;
    };

    for resource in ["cpu", "memory"] {
        let request = resources
            .requests
            .as_ref()
            .and_then(|r| r.get(resource))
            .and_then(parse_quantity);
        let limit = resources
            .limits
            .as_ref()
            .and_then(|l| l.get(resource))
            .and_then(parse_quantity);
        if let (Some(request), Some(limit)) = (request, limit) {
            if limit < request {
                errors.push(Invalid::LimitBelowRequest { resource });
            }
        }
    }

    if let Some(mem_limit) = resources
        .limits
        .as_ref()
        .and_then(|l| l.get("memory"))
        .and_then(parse_quantity)
    {
        if mem_limit < MIN_MEMORY_LIMIT_BYTES {
            errors.push(Invalid::MemoryLimitTooSmall);
        }
    }
}

/// Parses the quantity suffixes the scan resources actually use: plain
/// numbers, `m` (milli), and the binary and decimal byte suffixes.
fn parse_quantity(quantity: &Quantity) -> Option<f64> {
    let s = quantity.0.as_str();
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-');
    let (number, suffix) = match split {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let value: f64 = number.parse().ok()?;
    let scale: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0f64.powi(4),
        _ => return None,
    };
    Some(value * scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodescan::ScanPriority;
    use std::collections::BTreeMap;

    fn scan_spec(node: &str) -> NodeScanSpec {
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

    #[test]
    fn minimal_node_scan_is_valid() {
        assert!(validate_node_scan(&scan_spec("worker-1")).is_ok());
    }

    #[test]
    fn node_name_is_required() {
        let err = validate_node_scan(&scan_spec("")).unwrap_err();
        assert!(err.0.contains(&Invalid::NodeNameRequired));
    }

    #[test]
    fn node_name_must_be_dns1123() {
        for bad in ["Worker_1", "-leading", "trailing-", "UPPER"] {
            let err = validate_node_scan(&scan_spec(bad)).unwrap_err();
            assert!(err.0.contains(&Invalid::NodeNameInvalid), "{bad}");
        }
    }

    #[test]
    fn paths_must_be_absolute_and_traversal_free() {
        let mut spec = scan_spec("worker-1");
        spec.paths = vec!["var/lib".to_string(), "/host/../etc".to_string()];
        let err = validate_node_scan(&spec).unwrap_err();
        assert!(err
            .0
            .contains(&Invalid::PathNotAbsolute("var/lib".to_string())));
        assert!(err
            .0
            .contains(&Invalid::PathTraversal("/host/../etc".to_string())));
    }

    #[test]
    fn privileged_trees_are_rejected() {
        let mut spec = scan_spec("worker-1");
        spec.paths = vec!["/proc".to_string(), "/sys/kernel".to_string()];
        let err = validate_node_scan(&spec).unwrap_err();
        assert_eq!(
            err.0
                .iter()
                .filter(|e| matches!(e, Invalid::PrivilegedPath { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn host_prefixed_paths_are_allowed() {
        let mut spec = scan_spec("worker-1");
        spec.paths = vec!["/host/proc-dumps".to_string(), "/host/var/lib".to_string()];
        assert!(validate_node_scan(&spec).is_ok());
    }

    #[test]
    fn too_many_paths_rejected() {
        let mut spec = scan_spec("worker-1");
        spec.paths = (0..101).map(|i| format!("/data/{i}")).collect();
        let err = validate_node_scan(&spec).unwrap_err();
        assert!(err.0.contains(&Invalid::TooManyPaths));
    }

    #[test]
    fn glob_patterns_are_accepted() {
        let mut spec = scan_spec("worker-1");
        spec.exclude_patterns = vec!["*.tmp".to_string(), "/var/lib/docker/*".to_string()];
        assert!(validate_node_scan(&spec).is_ok());
    }

    #[test]
    fn anchored_patterns_are_validated_as_regex() {
        let mut spec = scan_spec("worker-1");
        spec.exclude_patterns = vec![r"^/tmp/.*\.log$".to_string()];
        assert!(validate_node_scan(&spec).is_ok());

        spec.exclude_patterns = vec!["^/tmp/(".to_string()];
        let err = validate_node_scan(&spec).unwrap_err();
        assert!(matches!(err.0[0], Invalid::BadRegex { .. }));
    }

    #[test]
    fn unclosed_character_class_is_a_bad_glob() {
        let mut spec = scan_spec("worker-1");
        spec.exclude_patterns = vec!["/var/[abc".to_string()];
        let err = validate_node_scan(&spec).unwrap_err();
        assert!(matches!(err.0[0], Invalid::BadGlob { .. }));
    }

    #[test]
    fn concurrent_ranges() {
        let mut spec = scan_spec("worker-1");
        spec.max_concurrent = 21;
        assert!(validate_node_scan(&spec).is_err());
        spec.max_concurrent = 20;
        assert!(validate_node_scan(&spec).is_ok());
        // 0 means unset and falls back to defaults.
        spec.max_concurrent = 0;
        assert!(validate_node_scan(&spec).is_ok());
    }

    #[test]
    fn timeout_and_size_ranges() {
        let mut spec = scan_spec("worker-1");
        spec.file_timeout = 999;
        spec.max_file_size = 1023;
        let err = validate_node_scan(&spec).unwrap_err();
        assert!(err.0.contains(&Invalid::FileTimeoutOutOfRange));
        assert!(err.0.contains(&Invalid::MaxFileSizeOutOfRange));
    }

    #[test]
    fn node_name_is_immutable() {
        let old = scan_spec("worker-1");
        let new = scan_spec("worker-2");
        let err = validate_node_scan_update(&old, &new).unwrap_err();
        assert_eq!(err.0, vec![Invalid::NodeNameImmutable]);
        assert!(validate_node_scan_update(&old, &old.clone()).is_ok());
    }

    fn quantity_map(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    #[test]
    fn limits_must_cover_requests() {
        let resources = ResourceRequirements {
            requests: Some(quantity_map(&[("cpu", "2"), ("memory", "512Mi")])),
            limits: Some(quantity_map(&[("cpu", "500m"), ("memory", "1Gi")])),
            ..Default::default()
        };
        let mut errors = Vec::new();
        validate_resources(Some(&resources), &mut errors);
        assert_eq!(errors, vec![Invalid::LimitBelowRequest { resource: "cpu" }]);
    }

    #[test]
    fn tiny_memory_limit_rejected() {
        let resources = ResourceRequirements {
            limits: Some(quantity_map(&[("memory", "16Mi")])),
            ..Default::default()
        };
        let mut errors = Vec::new();
        validate_resources(Some(&resources), &mut errors);
        assert_eq!(errors, vec![Invalid::MemoryLimitTooSmall]);
    }

    #[test]
    fn parse_quantity_suffixes() {
        for (raw, expected) in [
            ("500m", 0.5),
            ("2", 2.0),
            ("512Mi", 512.0 * 1024.0 * 1024.0),
            ("1Gi", 1024.0 * 1024.0 * 1024.0),
            ("100M", 1e8),
        ] {
            assert_eq!(parse_quantity(&Quantity(raw.to_string())), Some(expected));
        }
        assert_eq!(parse_quantity(&Quantity("bogus".to_string())), None);
    }

    #[test]
    fn five_field_cron_parses() {
        assert!(parse_cron("0 2 * * *").is_ok());
        assert!(parse_cron("*/15 * * * 1-5").is_ok());
    }

    #[test]
    fn six_field_cron_rejected() {
        assert!(matches!(
            parse_cron("0 0 2 * * *"),
            Err(Invalid::BadSchedule { .. })
        ));
        assert!(matches!(
            parse_cron("not a cron"),
            Err(Invalid::BadSchedule { .. })
        ));
    }
}
