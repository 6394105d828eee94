//! Reconciles NodeScans: one batch Job per scan, pinned to the target node,
//! with the scanner's structured stdout harvested into status on completion.

use crate::{
    backoff_key,
    cache::CacheManager,
    defaults::ScanSettings,
    error_policy,
    notifications::Notifier,
    patch_status, publish_event, Context, Error, Result, RUNNING_REQUEUE,
};
use chrono::Utc;
use clamav_operator_k8s_api::{
    conditions, scancache::FileEntry, truncate_name, InfectedFile, Job, Node, NodeScan,
    NodeScanPhase, NodeScanStatus, ObjectReference, Pod, ScanPolicy, ScanResult, ScanStrategy,
    Time, CLUSTERSCAN_LABEL, NODE_LABEL,
};
use futures::StreamExt;
use k8s_openapi::api::{
    batch::v1::JobSpec,
    core::v1::{
        Capabilities, Container, EnvVar, HostPathVolumeSource, LocalObjectReference,
        PodSecurityContext, PodSpec, PodTemplateSpec, SecurityContext, Toleration, Volume,
        VolumeMount,
    },
};
use kube::{
    api::{ListParams, LogParams, ObjectMeta, PostParams},
    runtime::{
        controller::{Action, Controller},
        events::{EventType, Recorder},
        finalizer::{finalizer, Event as Finalizer},
        watcher,
    },
    Api, Client, Resource, ResourceExt,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{info_span, Instrument};

pub const FINALIZER: &str = "clamav.antivirus.io/finalizer";
const CONTROLLER_NAME: &str = "nodescan-controller";
const SCANNER_CONTAINER: &str = "scanner";

/// The scanner signals completion with this exact log message.
const COMPLETION_MESSAGE: &str = "Scan terminé avec succès";
const INFECTED_ALERT: &str = "INFECTED_FILE";

/// At most this many infected-file records are kept in status.
const MAX_INFECTED_RECORDS: usize = 100;

pub fn job_name(scan_name: &str) -> String {
    truncate_name(&format!("nodescan-{scan_name}")).to_string()
}

/// Runs the NodeScan controller until shutdown.
pub async fn run(ctx: Arc<Context>, shutdown: drain::Watch) {
    let scans = Api::<NodeScan>::all(ctx.client.clone());
    let jobs = Api::<Job>::all(ctx.client.clone());

    Controller::new(scans, watcher::Config::default())
        .owns(jobs, watcher::Config::default())
        .graceful_shutdown_on(async move {
            let _ = shutdown.signaled().await;
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => tracing::debug!(name = %obj.name, "reconciled"),
                Err(error) => tracing::warn!(%error, "reconcile failed"),
            }
        })
        .instrument(info_span!("nodescan"))
        .await;
}

async fn reconcile(scan: Arc<NodeScan>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = scan.namespace().ok_or(Error::MissingNamespace)?;
    let key = backoff_key(scan.as_ref());
    let api: Api<NodeScan> = Api::namespaced(ctx.client.clone(), &namespace);

    let ctx2 = ctx.clone();
    let action = finalizer(&api, FINALIZER, scan, |event| async move {
        match event {
            Finalizer::Apply(scan) => apply(scan, &ctx2).await,
            Finalizer::Cleanup(scan) => cleanup(scan, &ctx2).await,
        }
    })
    .await?;

    ctx.clear_backoff(&key);
    Ok(action)
}

async fn apply(scan: Arc<NodeScan>, ctx: &Context) -> Result<Action> {
    let namespace = scan.namespace().ok_or(Error::MissingNamespace)?;
    let name = scan.name_any();
    let status = scan.status.clone().unwrap_or_default();

    // Terminal scans are never re-driven.
    if status.phase.is_some_and(|p| p.is_terminal()) {
        return Ok(Action::await_change());
    }

    let api: Api<NodeScan> = Api::namespaced(ctx.client.clone(), &namespace);
    let recorder = ctx.recorder(CONTROLLER_NAME, scan.as_ref());

    // The target node must exist before anything is scheduled.
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    if nodes.get_opt(&scan.spec.node_name).await?.is_none() {
        publish_event(
            &recorder,
            EventType::Warning,
            "NodeNotFound",
            format!("Node {} not found", scan.spec.node_name),
        )
        .await;
        return fail(&api, &scan, ctx, status, "NodeNotFound", "Node does not exist").await;
    }

    // Resolve the referenced policy, if any.
    let policy = match &scan.spec.scan_policy {
        Some(policy_name) => {
            let policies: Api<ScanPolicy> = Api::namespaced(ctx.client.clone(), &namespace);
            match policies.get_opt(policy_name).await? {
                Some(policy) => Some(policy),
                None => {
                    publish_event(
                        &recorder,
                        EventType::Warning,
                        "ScanPolicyNotFound",
                        format!("ScanPolicy {policy_name} not found"),
                    )
                    .await;
                    return fail(
                        &api,
                        &scan,
                        ctx,
                        status,
                        "ScanPolicyNotFound",
                        "ScanPolicy does not exist",
                    )
                    .await;
                }
            }
        }
        None => None,
    };

    let job_name = job_name(&name);
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    match jobs.get_opt(&job_name).await? {
        None => start_scan(&api, &scan, ctx, &recorder, policy.as_ref(), status).await,
        Some(job) => {
            let job_status = job.status.clone().unwrap_or_default();
            if job_status.succeeded.unwrap_or(0) > 0 {
                complete_scan(&api, &scan, ctx, &recorder, policy.as_ref(), status, &job_name)
                    .await
            } else if job_status.failed.unwrap_or(0) > 0 {
                publish_event(
                    &recorder,
                    EventType::Warning,
                    "ScanFailed",
                    "Scan job failed".to_string(),
                )
                .await;
                fail(&api, &scan, ctx, status, "ScanFailed", "Scan job failed").await
            } else {
                Ok(Action::requeue(RUNNING_REQUEUE))
            }
        }
    }
}

/// Best-effort removal of the owned Job when the NodeScan is deleted.
async fn cleanup(scan: Arc<NodeScan>, ctx: &Context) -> Result<Action> {
    let namespace = scan.namespace().ok_or(Error::MissingNamespace)?;
    if let Some(job_ref) = scan.status.as_ref().and_then(|s| s.job_ref.as_ref()) {
        if let Some(job_name) = &job_ref.name {
            let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
            let dp = kube::api::DeleteParams::background();
            match jobs.delete(job_name, &dp).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(error) => return Err(error.into()),
            }
        }
    }
    Ok(Action::await_change())
}

async fn start_scan(
    api: &Api<NodeScan>,
    scan: &NodeScan,
    ctx: &Context,
    recorder: &Recorder,
    policy: Option<&ScanPolicy>,
    mut status: NodeScanStatus,
) -> Result<Action> {
    let namespace = scan.namespace().ok_or(Error::MissingNamespace)?;
    let name = scan.name_any();

    if status.phase.is_none() {
        status.phase = Some(NodeScanPhase::Pending);
        status.start_time = Some(Time(Utc::now()));
        patch_status(api, &name, &status).await?;
    }

    // Ask the cache manager how this scan should run.
    let cache_manager = ctx.cache_manager();
    let cache = cache_manager
        .get_or_create(&namespace, &scan.spec.node_name)
        .await?;
    let plan = CacheManager::plan(scan, &cache.spec, Utc::now().timestamp());
    if plan.needs_config_map {
        cache_manager.publish_config_map(&namespace, &cache).await?;
    }

    let settings = ScanSettings::resolve(&scan.spec, policy.map(|p| &p.spec));
    let job = build_scan_job(scan, &settings, &plan.env, &ctx.scanner);

    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    let job_ref = match jobs.create(&PostParams::default(), &job).await {
        Ok(created) => job_reference(&created),
        // Another reconcile got there first; adopt its Job.
        Err(kube::Error::Api(e)) if e.code == 409 => job_reference(&job),
        Err(error) => {
            publish_event(
                recorder,
                EventType::Warning,
                "JobCreationFailed",
                format!("Failed to create Job: {error}"),
            )
            .await;
            return Err(error.into());
        }
    };

    status.phase = Some(NodeScanPhase::Running);
    status.job_ref = Some(job_ref);
    status.strategy_used = Some(plan.strategy);
    status.last_transition_time = Some(Time(Utc::now()));
    conditions::upsert(
        &mut status.conditions,
        conditions::new_condition("JobCreated", true, "Running", "Scan job has been created"),
    );
    patch_status(api, &name, &status).await?;

    publish_event(
        recorder,
        EventType::Normal,
        "JobCreated",
        format!("Scan job created for node {}", scan.spec.node_name),
    )
    .await;

    ctx.metrics
        .record_node_scan(&with_status(scan, status), NodeScanPhase::Running);
    refresh_running_gauge(ctx, &namespace).await;

    Ok(Action::requeue(RUNNING_REQUEUE))
}

async fn complete_scan(
    api: &Api<NodeScan>,
    scan: &NodeScan,
    ctx: &Context,
    recorder: &Recorder,
    policy: Option<&ScanPolicy>,
    mut status: NodeScanStatus,
    job_name: &str,
) -> Result<Action> {
    let namespace = scan.namespace().ok_or(Error::MissingNamespace)?;
    let name = scan.name_any();
    let now = Utc::now();

    status.phase = Some(NodeScanPhase::Completed);
    status.completion_time = Some(Time(now));
    status.last_transition_time = Some(Time(now));
    if let Some(start) = &status.start_time {
        status.duration = (now - start.0).num_seconds();
    }

    match fetch_scan_report(&ctx.client, &namespace, job_name).await {
        Ok(report) => report.apply_to(&mut status),
        Err(error) => tracing::error!(%error, job = job_name, "failed to parse scan results"),
    }
    CacheManager::apply_incremental_stats(&mut status);

    conditions::upsert(
        &mut status.conditions,
        conditions::new_condition(
            "ScanCompleted",
            true,
            "Completed",
            "Scan completed successfully",
        ),
    );
    patch_status(api, &name, &status).await?;

    publish_event(
        recorder,
        EventType::Normal,
        "ScanCompleted",
        format!(
            "Scan completed: {} files scanned, {} infected",
            status.files_scanned, status.files_infected
        ),
    )
    .await;

    let completed = with_status(scan, status.clone());
    ctx.metrics
        .record_node_scan(&completed, NodeScanPhase::Completed);
    refresh_running_gauge(ctx, &namespace).await;

    // Notifications fire exactly once, on this transition, and only when the
    // scan both found something and carries a policy to notify through.
    if status.files_infected > 0 {
        if let Some(policy) = policy {
            Notifier::new(ctx.client.clone())
                .send_all(&completed, policy, recorder)
                .await;
        }
    }

    if let Some(policy) = policy {
        bump_policy_usage(ctx, policy).await;
    }

    update_cache_after_scan(ctx, &completed, &namespace, now.timestamp()).await;

    Ok(Action::await_change())
}

async fn fail(
    api: &Api<NodeScan>,
    scan: &NodeScan,
    ctx: &Context,
    mut status: NodeScanStatus,
    condition_type: &str,
    message: &str,
) -> Result<Action> {
    status.phase = Some(NodeScanPhase::Failed);
    status.last_transition_time = Some(Time(Utc::now()));
    conditions::upsert(
        &mut status.conditions,
        conditions::new_condition(condition_type, false, "Failed", message),
    );
    patch_status(api, &scan.name_any(), &status).await?;

    let namespace = scan.namespace().unwrap_or_default();
    ctx.metrics
        .record_node_scan(&with_status(scan, status), NodeScanPhase::Failed);
    refresh_running_gauge(ctx, &namespace).await;

    Ok(Action::await_change())
}

/// Merges the scan's observations into the node's cache. Write failures are
/// logged only; the scan stays complete and the next scan retries.
async fn update_cache_after_scan(
    ctx: &Context,
    scan: &NodeScan,
    namespace: &str,
    now_epoch: i64,
) {
    let status = scan.status.clone().unwrap_or_default();
    let full = !matches!(
        status.strategy_used,
        Some(s) if s != ScanStrategy::Full
    );

    let manager = ctx.cache_manager();
    let mut cache = match manager.get_or_create(namespace, &scan.spec.node_name).await {
        Ok(cache) => cache,
        Err(error) => {
            tracing::warn!(%error, node = %scan.spec.node_name, "failed to load scan cache");
            return;
        }
    };

    let observed = status
        .infected_files
        .iter()
        .map(|f| FileEntry {
            path: f.path.clone(),
            mod_time: 0,
            size: f.size,
            hash: None,
            last_scanned: now_epoch,
            scan_result: ScanResult::Infected,
        })
        .collect();
    CacheManager::merge(&mut cache.spec, observed, full, now_epoch);

    if let Err(error) = manager.commit(namespace, &cache).await {
        tracing::warn!(%error, node = %scan.spec.node_name, "failed to update scan cache");
    }
}

async fn bump_policy_usage(ctx: &Context, policy: &ScanPolicy) {
    let Some(namespace) = policy.namespace() else {
        return;
    };
    let name = policy.name_any();
    let mut status = policy.status.clone().unwrap_or_default();
    status.last_used = Some(Time(Utc::now()));
    status.usage_count += 1;

    let api: Api<ScanPolicy> = Api::namespaced(ctx.client.clone(), &namespace);
    if let Err(error) = patch_status(&api, &name, &status).await {
        tracing::warn!(%error, policy = %name, "failed to update policy usage");
    }
    ctx.metrics.record_policy_usage(&namespace, &name);
}

async fn refresh_running_gauge(ctx: &Context, namespace: &str) {
    let api: Api<NodeScan> = Api::namespaced(ctx.client.clone(), namespace);
    match api.list(&ListParams::default()).await {
        Ok(scans) => {
            let running = scans
                .items
                .iter()
                .filter(|s| {
                    s.status.as_ref().and_then(|s| s.phase) == Some(NodeScanPhase::Running)
                })
                .count();
            ctx.metrics.set_nodescans_running(namespace, running as i64);
        }
        Err(error) => tracing::debug!(%error, "failed to refresh running gauge"),
    }
}

fn with_status(scan: &NodeScan, status: NodeScanStatus) -> NodeScan {
    let mut scan = scan.clone();
    scan.status = Some(status);
    scan
}

fn job_reference(job: &Job) -> ObjectReference {
    ObjectReference {
        api_version: Some("batch/v1".to_string()),
        kind: Some("Job".to_string()),
        name: job.metadata.name.clone(),
        namespace: job.metadata.namespace.clone(),
        uid: job.metadata.uid.clone(),
        ..Default::default()
    }
}

fn env(name: &str, value: impl ToString) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

/// Builds the scan Job: pinned to the target node, host filesystem mounted
/// read-only at /host, and privileged enough to traverse arbitrary trees.
fn build_scan_job(
    scan: &NodeScan,
    settings: &ScanSettings,
    strategy_env: &[EnvVar],
    scanner: &crate::ScannerSettings,
) -> Job {
    let name = job_name(&scan.name_any());
    let node = &scan.spec.node_name;

    let mut env_vars = vec![
        env("NODE_NAME", node),
        env("HOST_ROOT", "/host"),
        env("RESULTS_DIR", "/results"),
        env("CLAMAV_HOST", &scanner.clamav_host),
        env("CLAMAV_PORT", scanner.clamav_port),
        env("PATHS_TO_SCAN", settings.paths.join(",")),
        env("MAX_CONCURRENT", settings.max_concurrent),
        env("FILE_TIMEOUT", settings.file_timeout_ms),
        env("CONNECT_TIMEOUT", settings.connect_timeout_ms),
        env("MAX_FILE_SIZE", settings.max_file_size),
    ];
    if !settings.exclude_patterns.is_empty() {
        env_vars.push(env("EXCLUDE_PATTERNS", settings.exclude_patterns.join(",")));
    }
    env_vars.extend_from_slice(strategy_env);

    let mut job_labels = std::collections::BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "clamav".to_string()),
        (
            "app.kubernetes.io/component".to_string(),
            "scanner".to_string(),
        ),
        (
            "clamav.antivirus.io/nodescan".to_string(),
            scan.name_any(),
        ),
        (NODE_LABEL.to_string(), node.clone()),
        (
            "clamav.antivirus.io/scan-priority".to_string(),
            scan.spec.priority.to_string(),
        ),
    ]);
    if let Some(parent) = scan.labels().get(CLUSTERSCAN_LABEL) {
        job_labels.insert(CLUSTERSCAN_LABEL.to_string(), parent.clone());
    }

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: scan.namespace(),
            labels: Some(job_labels),
            owner_references: scan.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            ttl_seconds_after_finished: Some(settings.ttl_seconds_after_finished),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(
                        [
                            ("app".to_string(), "clamav-node-scanner".to_string()),
                            ("target-node".to_string(), node.clone()),
                            ("security".to_string(), "clamav".to_string()),
                        ]
                        .into_iter()
                        .collect(),
                    ),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(scanner.service_account.clone()),
                    node_name: Some(node.clone()),
                    host_pid: Some(true),
                    host_ipc: Some(true),
                    dns_policy: Some("ClusterFirst".to_string()),
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(false),
                        run_as_user: Some(0),
                        fs_group: Some(0),
                        ..Default::default()
                    }),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    image_pull_secrets: scanner.image_pull_secret.as_ref().map(|name| {
                        vec![LocalObjectReference {
                            name: Some(name.clone()),
                        }]
                    }),
                    containers: vec![Container {
                        name: SCANNER_CONTAINER.to_string(),
                        image: Some(scanner.image.clone()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        env: Some(env_vars),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "host-root".to_string(),
                                mount_path: "/host".to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "scan-results".to_string(),
                                mount_path: "/results".to_string(),
                                ..Default::default()
                            },
                        ]),
                        resources: Some(settings.resources.clone()),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            read_only_root_filesystem: Some(false),
                            capabilities: Some(Capabilities {
                                add: Some(vec![
                                    "SYS_ADMIN".to_string(),
                                    "DAC_READ_SEARCH".to_string(),
                                ]),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: "host-root".to_string(),
                            host_path: Some(HostPathVolumeSource {
                                path: "/".to_string(),
                                type_: Some("Directory".to_string()),
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "scan-results".to_string(),
                            host_path: Some(HostPathVolumeSource {
                                path: "/var/log/clamav-scans".to_string(),
                                type_: Some("DirectoryOrCreate".to_string()),
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

// === Scan log parsing ===

/// One line of scanner stdout. Every field is optional; the two line kinds
/// the operator consumes are distinguished by `message` and `alert`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogLine {
    message: String,
    files_scanned: i64,
    files_infected: i64,
    files_skipped: i64,
    errors_count: i64,
    file_path: String,
    virus_names: Vec<String>,
    file_size: i64,
    alert: String,
}

/// Aggregated scanner output for one Job.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ScanReport {
    pub files_scanned: i64,
    pub files_infected: i64,
    pub files_skipped: i64,
    pub error_count: i64,
    pub infected: Vec<InfectedFile>,
}

impl ScanReport {
    #[cfg(test)]
    fn parse<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut report = Self::default();
        for line in lines {
            report.ingest(line);
        }
        report
    }

    /// Non-JSON and unrecognized lines are dropped; line kinds may be
    /// arbitrarily interleaved.
    fn ingest(&mut self, line: &str) {
        let Ok(entry) = serde_json::from_str::<LogLine>(line) else {
            return;
        };

        if entry.message == COMPLETION_MESSAGE {
            self.files_scanned = entry.files_scanned;
            self.files_infected = entry.files_infected;
            self.files_skipped = entry.files_skipped;
            self.error_count = entry.errors_count;
        }

        if entry.alert == INFECTED_ALERT && !entry.file_path.is_empty() {
            if self.infected.len() < MAX_INFECTED_RECORDS {
                self.infected.push(InfectedFile {
                    path: entry.file_path,
                    viruses: entry.virus_names,
                    size: entry.file_size,
                    detected_at: None,
                });
            }
        }
    }

    fn apply_to(&self, status: &mut NodeScanStatus) {
        status.files_scanned = self.files_scanned;
        status.files_infected = self.files_infected;
        status.files_skipped = self.files_skipped;
        status.error_count = self.error_count;
        status.infected_files = self.infected.clone();

        // In incremental mode the scanner's skips are cache hits.
        if matches!(status.strategy_used, Some(s) if s != ScanStrategy::Full) {
            status.files_skipped_incremental = self.files_skipped;
        }
    }
}

/// Streams the scanner pod's stdout and folds it into a report.
async fn fetch_scan_report(
    client: &Client,
    namespace: &str,
    job_name: &str,
) -> Result<ScanReport> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod_list = pods
        .list(&ListParams::default().labels(&format!("job-name={job_name}")))
        .await?;
    let pod = pod_list
        .items
        .first()
        .ok_or_else(|| Error::NoScannerPod(job_name.to_string()))?;

    let params = LogParams {
        container: Some(SCANNER_CONTAINER.to_string()),
        ..Default::default()
    };
    let stream = pods.log_stream(&pod.name_any(), &params).await?;
    let mut lines = stream.lines();

    let mut report = ScanReport::default();
    while let Some(line) = lines.next_line().await? {
        report.ingest(&line);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clamav_operator_k8s_api::NodeScanSpec;

    fn node_scan(name: &str, node: &str) -> NodeScan {
        let mut scan = NodeScan::new(
            name,
            NodeScanSpec {
                node_name: node.to_string(),
                scan_policy: None,
                priority: Default::default(),
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
            },
        );
        scan.metadata.namespace = Some("default".to_string());
        scan.metadata.uid = Some("1234".to_string());
        scan
    }

    #[test]
    fn job_name_is_prefixed_and_bounded() {
        assert_eq!(job_name("s1"), "nodescan-s1");
        assert_eq!(job_name(&"x".repeat(100)).len(), 63);
    }

    #[test]
    fn parse_completion_line() {
        let report = ScanReport::parse([
            r#"{"level":"info","message":"Scan terminé avec succès","files_scanned":1000,"files_infected":2,"files_skipped":17,"errors_count":1}"#,
        ]);
        assert_eq!(report.files_scanned, 1000);
        assert_eq!(report.files_infected, 2);
        assert_eq!(report.files_skipped, 17);
        assert_eq!(report.error_count, 1);
    }

    #[test]
    fn parse_infected_lines_interleaved_with_noise() {
        let report = ScanReport::parse([
            "starting scan of /host/var/lib",
            r#"{"alert":"INFECTED_FILE","file_path":"/host/var/lib/a.bin","virus_names":["Eicar-Test-Signature"],"file_size":68}"#,
            r#"{"level":"debug","message":"heartbeat"}"#,
            r#"{"alert":"INFECTED_FILE","file_path":"/host/opt/b.so","virus_names":["Unix.Trojan.Generic"],"file_size":2048}"#,
            r#"{"message":"Scan terminé avec succès","files_scanned":10,"files_infected":2}"#,
            r#"{"truncated": "#,
        ]);
        assert_eq!(report.files_scanned, 10);
        assert_eq!(report.infected.len(), 2);
        assert_eq!(report.infected[0].path, "/host/var/lib/a.bin");
        assert_eq!(report.infected[0].viruses, vec!["Eicar-Test-Signature"]);
        assert_eq!(report.infected[1].size, 2048);
    }

    #[test]
    fn infected_lines_without_path_are_ignored() {
        let report =
            ScanReport::parse([r#"{"alert":"INFECTED_FILE","virus_names":["X"],"file_size":1}"#]);
        assert!(report.infected.is_empty());
    }

    #[test]
    fn infected_records_are_capped_at_100() {
        let lines: Vec<String> = (0..150)
            .map(|i| {
                format!(
                    r#"{{"alert":"INFECTED_FILE","file_path":"/f{i}","virus_names":["V"],"file_size":1}}"#
                )
            })
            .collect();
        let report = ScanReport::parse(lines.iter().map(|s| s.as_str()));
        assert_eq!(report.infected.len(), MAX_INFECTED_RECORDS);
    }

    #[test]
    fn report_marks_incremental_skips_only_for_incremental_scans() {
        let report = ScanReport {
            files_scanned: 100,
            files_skipped: 40,
            ..Default::default()
        };

        let mut status = NodeScanStatus {
            strategy_used: Some(ScanStrategy::Incremental),
            ..Default::default()
        };
        report.apply_to(&mut status);
        assert_eq!(status.files_skipped_incremental, 40);

        let mut status = NodeScanStatus {
            strategy_used: Some(ScanStrategy::Full),
            ..Default::default()
        };
        report.apply_to(&mut status);
        assert_eq!(status.files_skipped_incremental, 0);
    }

    fn test_settings() -> ScanSettings {
        ScanSettings::resolve(&node_scan("s1", "worker-1").spec, None)
    }

    fn test_context_settings() -> crate::ScannerSettings {
        crate::ScannerSettings {
            image: "registry.example.com/clamav-node-scanner:1.0.3".to_string(),
            clamav_host: "clamav.clamav.svc.cluster.local".to_string(),
            clamav_port: 3310,
            service_account: "clamav-scanner".to_string(),
            image_pull_secret: None,
        }
    }

    fn job_for(scan: &NodeScan) -> Job {
        build_scan_job(scan, &test_settings(), &[], &test_context_settings())
    }

    #[test]
    fn job_is_pinned_and_privileged() {
        let scan = node_scan("s1", "worker-1");
        let job = job_for(&scan);
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("nodescan-s1"));
        assert_eq!(pod.node_name.as_deref(), Some("worker-1"));
        assert_eq!(pod.host_pid, Some(true));
        assert_eq!(pod.host_ipc, Some(true));
        assert_eq!(job.spec.as_ref().unwrap().backoff_limit, Some(3));

        let container = &pod.containers[0];
        let sc = container.security_context.as_ref().unwrap();
        assert_eq!(sc.privileged, Some(true));
        assert!(sc
            .capabilities
            .as_ref()
            .unwrap()
            .add
            .as_ref()
            .unwrap()
            .contains(&"DAC_READ_SEARCH".to_string()));

        let mounts = container.volume_mounts.as_ref().unwrap();
        let host_mount = mounts.iter().find(|m| m.name == "host-root").unwrap();
        assert_eq!(host_mount.mount_path, "/host");
        assert_eq!(host_mount.read_only, Some(true));
    }

    #[test]
    fn job_env_covers_the_contract() {
        let scan = node_scan("s1", "worker-1");
        let job = job_for(&scan);
        let envs = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        let get = |name: &str| {
            envs.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
        };

        assert_eq!(get("NODE_NAME").as_deref(), Some("worker-1"));
        assert_eq!(get("HOST_ROOT").as_deref(), Some("/host"));
        assert_eq!(get("RESULTS_DIR").as_deref(), Some("/results"));
        assert_eq!(
            get("PATHS_TO_SCAN").as_deref(),
            Some("/host/var/lib,/host/opt")
        );
        assert_eq!(get("MAX_CONCURRENT").as_deref(), Some("5"));
        assert_eq!(get("FILE_TIMEOUT").as_deref(), Some("300000"));
        assert_eq!(get("CONNECT_TIMEOUT").as_deref(), Some("60000"));
        assert_eq!(get("MAX_FILE_SIZE").as_deref(), Some("104857600"));
        assert_eq!(get("CLAMAV_PORT").as_deref(), Some("3310"));
    }

    #[test]
    fn job_carries_owner_reference() {
        let scan = node_scan("s1", "worker-1");
        let job = job_for(&scan);
        let owners = job.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "NodeScan");
        assert_eq!(owners[0].name, "s1");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn job_ttl_defaults_to_a_day() {
        let scan = node_scan("s1", "worker-1");
        let job = job_for(&scan);
        assert_eq!(
            job.spec.as_ref().unwrap().ttl_seconds_after_finished,
            Some(86_400)
        );
    }
}
