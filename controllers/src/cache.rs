//! Per-node incremental-scan cache.
//!
//! The manager owns the lifecycle of one ScanCache resource per node:
//! get-or-create, the full-versus-incremental decision, the environment
//! overlay handed to the scanner, and merging scan observations back in.

use crate::{metrics::Metrics, Result};
use clamav_operator_k8s_api::{
    scancache::{cache_name, FileEntry, ScanCacheSpec, CACHE_VERSION, MAX_CACHE_ENTRIES},
    ConfigMap, EnvVar, NodeScan, NodeScanStatus, ObjectMeta, Patch, PatchParams, PostParams,
    ScanCache, ScanStrategy, Time,
};
use chrono::Utc;
use kube::{Api, Client, ResourceExt};
use std::{collections::HashMap, sync::Arc};

/// Caches small enough to ride in an environment variable are inlined;
/// anything bigger goes through a ConfigMap.
const MAX_INLINE_ENTRIES: usize = 1_000;
const MAX_INLINE_BYTES: usize = 100_000;

pub struct CacheManager {
    client: Client,
    metrics: Arc<Metrics>,
}

/// The environment overlay for one scan, plus the strategy it settled on.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanPlan {
    pub strategy: ScanStrategy,
    pub env: Vec<EnvVar>,
    /// Set when the cache must be published as a ConfigMap before the Job
    /// starts.
    pub needs_config_map: bool,
}

fn env(name: &str, value: impl ToString) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

// === impl CacheManager ===

impl CacheManager {
    pub fn new(client: Client, metrics: Arc<Metrics>) -> Self {
        Self { client, metrics }
    }

    /// Fetches the node's cache, creating an empty one on first access.
    pub async fn get_or_create(&self, namespace: &str, node: &str) -> Result<ScanCache> {
        let api: Api<ScanCache> = Api::namespaced(self.client.clone(), namespace);
        let name = cache_name(node);

        if let Some(cache) = api.get_opt(&name).await? {
            return Ok(cache);
        }

        let mut cache = ScanCache::new(
            &name,
            ScanCacheSpec {
                node_name: node.to_string(),
                last_full_scan: 0,
                last_incremental_scan: 0,
                scan_count: 0,
                files: Vec::new(),
                total_files: 0,
                cache_version: CACHE_VERSION.to_string(),
            },
        );
        cache.metadata.namespace = Some(namespace.to_string());
        cache.metadata.labels = Some(
            [
                ("app.kubernetes.io/name".to_string(), "clamav".to_string()),
                (
                    "app.kubernetes.io/component".to_string(),
                    "scan-cache".to_string(),
                ),
                (
                    clamav_operator_k8s_api::NODE_LABEL.to_string(),
                    node.to_string(),
                ),
            ]
            .into_iter()
            .collect(),
        );

        Ok(api.create(&PostParams::default(), &cache).await?)
    }

    /// Decides whether the upcoming scan must run as a full scan. Checked in
    /// order: explicit force flag, full strategy, incremental disabled,
    /// baseline cadence, cache staleness.
    pub fn should_force_full_scan(scan: &NodeScan, cache: &ScanCacheSpec, now_epoch: i64) -> bool {
        if scan.spec.force_full_scan {
            return true;
        }
        if scan.spec.strategy == ScanStrategy::Full {
            return true;
        }
        let Some(config) = scan.spec.incremental_config.as_ref().filter(|c| c.enabled) else {
            return true;
        };
        if cache.scan_count >= config.baseline_interval {
            tracing::info!(
                node = %cache.node_name,
                scan_count = cache.scan_count,
                baseline_interval = config.baseline_interval,
                "baseline interval reached, forcing full scan"
            );
            return true;
        }
        let cache_age = now_epoch - cache.last_full_scan;
        if cache_age > i64::from(config.cache_expiration) * 3600 {
            tracing::info!(
                node = %cache.node_name,
                cache_age,
                expiration_hours = config.cache_expiration,
                "cache expired, forcing full scan"
            );
            return true;
        }
        false
    }

    /// Builds the scanner environment overlay for this scan.
    pub fn plan(scan: &NodeScan, cache: &ScanCacheSpec, now_epoch: i64) -> ScanPlan {
        let forced = Self::should_force_full_scan(scan, cache, now_epoch);
        let strategy = if forced {
            ScanStrategy::Full
        } else {
            scan.spec.strategy
        };

        let mut envs = vec![env("SCAN_STRATEGY", strategy)];
        let mut needs_config_map = false;

        let config = scan.spec.incremental_config.as_ref();
        if let Some(config) = config.filter(|c| c.enabled && !forced) {
            envs.push(env("INCREMENTAL_ENABLED", "true"));
            envs.push(env("MAX_FILE_AGE_HOURS", config.max_age));
            envs.push(env("SKIP_UNCHANGED_FILES", config.skip_unchanged_files));

            if !cache.files.is_empty() {
                let serialized = serde_json::to_string(&cache.files).unwrap_or_default();
                if cache.files.len() <= MAX_INLINE_ENTRIES && serialized.len() <= MAX_INLINE_BYTES
                {
                    envs.push(env("SCAN_CACHE", serialized));
                } else {
                    envs.push(env("SCAN_CACHE_CONFIGMAP", cache_name(&cache.node_name)));
                    needs_config_map = true;
                }
            }
        }

        if cache.last_full_scan > 0 {
            envs.push(env("LAST_FULL_SCAN", cache.last_full_scan));
        }
        if cache.last_incremental_scan > 0 {
            envs.push(env("LAST_INCREMENTAL_SCAN", cache.last_incremental_scan));
        }

        ScanPlan {
            strategy,
            env: envs,
            needs_config_map,
        }
    }

    /// Publishes the cache file table as a ConfigMap for caches too large to
    /// inline.
    pub async fn publish_config_map(&self, namespace: &str, cache: &ScanCache) -> Result<()> {
        let serialized = serde_json::to_string(&cache.spec.files).unwrap_or_default();
        let name = cache_name(&cache.spec.node_name);
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    [
                        ("app.kubernetes.io/name".to_string(), "clamav".to_string()),
                        (
                            "app.kubernetes.io/component".to_string(),
                            "scan-cache".to_string(),
                        ),
                        (
                            clamav_operator_k8s_api::NODE_LABEL.to_string(),
                            cache.spec.node_name.clone(),
                        ),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            data: Some([("cache.json".to_string(), serialized)].into_iter().collect()),
            ..Default::default()
        };

        match api.get_opt(&name).await? {
            None => {
                api.create(&PostParams::default(), &config_map).await?;
            }
            Some(_) => {
                api.patch(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(serde_json::json!({ "data": config_map.data })),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Merges scan observations into the cache. A full scan replaces the
    /// file table and resets the baseline counter; an incremental scan
    /// merges by path and truncates to the most recently scanned entries.
    pub fn merge(cache: &mut ScanCacheSpec, observed: Vec<FileEntry>, full: bool, now_epoch: i64) {
        if full {
            cache.last_full_scan = now_epoch;
            cache.scan_count = 0;
            cache.files = observed;
        } else {
            cache.last_incremental_scan = now_epoch;
            cache.scan_count += 1;

            let mut by_path: HashMap<String, FileEntry> = cache
                .files
                .drain(..)
                .map(|f| (f.path.clone(), f))
                .collect();
            for entry in observed {
                by_path.insert(entry.path.clone(), entry);
            }

            let mut merged: Vec<FileEntry> = by_path.into_values().collect();
            if merged.len() > MAX_CACHE_ENTRIES {
                merged.sort_by(|a, b| b.last_scanned.cmp(&a.last_scanned));
                merged.truncate(MAX_CACHE_ENTRIES);
                tracing::info!(
                    node = %cache.node_name,
                    "cache truncated to {MAX_CACHE_ENTRIES} entries"
                );
            } else {
                merged.sort_by(|a, b| a.path.cmp(&b.path));
            }
            cache.files = merged;
        }

        cache.total_files = cache.files.len() as i64;
    }

    /// Persists the merged cache and refreshes its status and metrics.
    /// Failures here never fail the scan; the next scan retries the write.
    pub async fn commit(&self, namespace: &str, cache: &ScanCache) -> Result<()> {
        let api: Api<ScanCache> = Api::namespaced(self.client.clone(), namespace);
        let name = cache.name_any();
        let size = serde_json::to_vec(&cache.spec.files)
            .map(|b| b.len() as i64)
            .unwrap_or(0);

        api.patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "spec": cache.spec })),
        )
        .await?;

        crate::patch_status(
            &api,
            &name,
            &serde_json::json!({
                "lastUpdated": Time(Utc::now()),
                "size": size,
            }),
        )
        .await?;

        self.metrics.record_scan_cache(
            namespace,
            &cache.spec.node_name,
            size,
            cache.spec.total_files,
        );
        Ok(())
    }

    /// Derives the incremental statistics written into NodeScan status.
    pub fn apply_incremental_stats(status: &mut NodeScanStatus) {
        if status.files_skipped_incremental > 0 {
            let checked = status.files_scanned + status.files_skipped_incremental;
            if checked > 0 {
                status.cache_hit_rate =
                    status.files_skipped_incremental as f64 / checked as f64 * 100.0;
            }
            // Roughly 0.1s of scanner time per skipped file.
            status.time_saved = status.files_skipped_incremental / 10;
        }
    }
}
