//! Reconciles ClusterScans: fans NodeScans out over the selected node set
//! under a bounded concurrency window and folds child status back into the
//! parent.

use crate::{
    backoff_key, error_policy, patch_status, publish_event, Context, Error, Result,
    RUNNING_REQUEUE,
};
use chrono::Utc;
use clamav_operator_k8s_api::{
    labels::Labels, truncate_name, ClusterScan, ClusterScanPhase, ClusterScanStatus, Node,
    NodeScan, NodeScanPhase, NodeScanReference, NodeScanSpec, Time, CLUSTERSCAN_LABEL,
    NODE_LABEL,
};
use futures::StreamExt;
use kube::{
    api::{DeleteParams, ListParams, ObjectMeta, PostParams},
    runtime::{
        controller::{Action, Controller},
        events::EventType,
        finalizer::{finalizer, Event as Finalizer},
        watcher,
    },
    Api, Resource, ResourceExt,
};
use std::sync::Arc;
use tracing::{info_span, Instrument};

pub const FINALIZER: &str = "clamav.antivirus.io/clusterscan-finalizer";
const CONTROLLER_NAME: &str = "clusterscan-controller";

/// Runs the ClusterScan controller until shutdown.
pub async fn run(ctx: Arc<Context>, shutdown: drain::Watch) {
    let scans = Api::<ClusterScan>::all(ctx.client.clone());
    let children = Api::<NodeScan>::all(ctx.client.clone());

    Controller::new(scans, watcher::Config::default())
        .owns(children, watcher::Config::default())
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
        .instrument(info_span!("clusterscan"))
        .await;
}

async fn reconcile(scan: Arc<ClusterScan>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = scan.namespace().ok_or(Error::MissingNamespace)?;
    let key = backoff_key(scan.as_ref());
    let api: Api<ClusterScan> = Api::namespaced(ctx.client.clone(), &namespace);

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

async fn apply(scan: Arc<ClusterScan>, ctx: &Context) -> Result<Action> {
    let namespace = scan.namespace().ok_or(Error::MissingNamespace)?;
    let name = scan.name_any();
    let api: Api<ClusterScan> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut status = scan.status.clone().unwrap_or_default();

    if status.phase.is_some_and(|p| p.is_terminal()) {
        return Ok(Action::await_change());
    }

    if status.phase.is_none() {
        status.phase = Some(ClusterScanPhase::Pending);
        status.start_time = Some(Time(Utc::now()));
        patch_status(&api, &name, &status).await?;
    }

    let nodes = select_nodes(ctx, scan.spec.node_selector.as_ref()).await?;

    // The node set is snapshotted the first time through; later reconciles
    // keep the original total even if nodes join the cluster.
    if status.total_nodes == 0 {
        status.total_nodes = nodes.len() as i32;
    }

    let children_api: Api<NodeScan> = Api::namespaced(ctx.client.clone(), &namespace);
    let children = children_api
        .list(&ListParams::default().labels(&format!("{CLUSTERSCAN_LABEL}={name}")))
        .await?
        .items;

    let mut agg = Aggregation::over(&children);

    // Fill the concurrency window with scans for nodes not yet covered.
    let cap = if scan.spec.concurrent > 0 {
        scan.spec.concurrent
    } else {
        crate::defaults::DEFAULT_CLUSTER_CONCURRENT
    };
    if agg.running < cap {
        let mut total_children = children.len() as i32;
        for node in &nodes {
            if agg.running >= cap || total_children >= status.total_nodes {
                break;
            }
            if children.iter().any(|c| c.spec.node_name == *node) {
                continue;
            }
            let child = child_node_scan(&scan, node);
            match children_api.create(&PostParams::default(), &child).await {
                Ok(_) => {
                    agg.running += 1;
                    total_children += 1;
                }
                Err(kube::Error::Api(e)) if e.code == 409 => {}
                Err(error) => {
                    tracing::error!(%error, node = %node, "failed to create NodeScan");
                }
            }
        }
    }

    agg.write_to(&mut status);

    let phase = decide_phase(status.total_nodes, agg.completed, agg.failed);
    status.phase = Some(phase);
    if phase.is_terminal() && status.completion_time.is_none() {
        status.completion_time = Some(Time(Utc::now()));
    }
    patch_status(&api, &name, &status).await?;

    if phase.is_terminal() {
        let completed = {
            let mut scan = (*scan).clone();
            scan.status = Some(status);
            scan
        };
        ctx.metrics.record_cluster_scan(&completed, phase);
        let recorder = ctx.recorder(CONTROLLER_NAME, &completed);
        publish_event(
            &recorder,
            EventType::Normal,
            "ClusterScanFinished",
            format!(
                "Cluster scan finished as {phase}: {}/{} nodes completed",
                completed
                    .status
                    .as_ref()
                    .map(|s| s.completed_nodes)
                    .unwrap_or(0),
                completed
                    .status
                    .as_ref()
                    .map(|s| s.total_nodes)
                    .unwrap_or(0),
            ),
        )
        .await;
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(RUNNING_REQUEUE))
    }
}

/// Deletes every labelled child, best-effort, before the parent goes away.
async fn cleanup(scan: Arc<ClusterScan>, ctx: &Context) -> Result<Action> {
    let namespace = scan.namespace().ok_or(Error::MissingNamespace)?;
    let name = scan.name_any();
    let api: Api<NodeScan> = Api::namespaced(ctx.client.clone(), &namespace);
    let children = api
        .list(&ListParams::default().labels(&format!("{CLUSTERSCAN_LABEL}={name}")))
        .await?
        .items;

    for child in children {
        match api.delete(&child.name_any(), &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(error) => return Err(error.into()),
        }
    }
    Ok(Action::await_change())
}

/// Lists node names matching the selector; all nodes when none is given.
async fn select_nodes(
    ctx: &Context,
    selector: Option<&clamav_operator_k8s_api::Selector>,
) -> Result<Vec<String>> {
    let api: Api<Node> = Api::all(ctx.client.clone());
    let nodes = api.list(&ListParams::default()).await?.items;

    Ok(nodes
        .into_iter()
        .filter(|node| match selector {
            Some(selector) => {
                let labels: Labels = node.metadata.labels.clone().into();
                selector.matches(&labels)
            }
            None => true,
        })
        .map(|node| node.name_any())
        .collect())
}

/// Child counters folded out of one pass over the labelled NodeScans.
#[derive(Debug, Default, PartialEq)]
struct Aggregation {
    completed: i32,
    running: i32,
    failed: i32,
    infected: i32,
    total_files_scanned: i64,
    total_files_infected: i64,
    refs: Vec<NodeScanReference>,
}

impl Aggregation {
    fn over(children: &[NodeScan]) -> Self {
        let mut agg = Self::default();
        for child in children {
            let status = child.status.clone().unwrap_or_default();
            match status.phase {
                Some(NodeScanPhase::Completed) => {
                    agg.completed += 1;
                    agg.total_files_scanned += status.files_scanned;
                    agg.total_files_infected += status.files_infected;
                    if status.files_infected > 0 {
                        agg.infected += 1;
                    }
                }
                Some(NodeScanPhase::Running) => agg.running += 1,
                Some(NodeScanPhase::Failed) => agg.failed += 1,
                Some(NodeScanPhase::Pending) | None => {}
            }

            agg.refs.push(NodeScanReference {
                name: child.name_any(),
                node_name: child.spec.node_name.clone(),
                phase: status.phase,
                files_infected: status.files_infected,
                files_scanned: status.files_scanned,
                start_time: status.start_time,
                completion_time: status.completion_time,
            });
        }
        agg
    }

    fn write_to(&self, status: &mut ClusterScanStatus) {
        status.completed_nodes = self.completed;
        status.running_nodes = self.running;
        status.failed_nodes = self.failed;
        status.infected_nodes = self.infected;
        status.total_files_scanned = self.total_files_scanned;
        status.total_files_infected = self.total_files_infected;
        status.node_scans = self.refs.clone();
    }
}

fn decide_phase(total: i32, completed: i32, failed: i32) -> ClusterScanPhase {
    if completed + failed < total {
        return ClusterScanPhase::Running;
    }
    if failed == 0 {
        ClusterScanPhase::Completed
    } else if completed == 0 {
        ClusterScanPhase::Failed
    } else {
        ClusterScanPhase::PartiallyCompleted
    }
}

/// Builds one child NodeScan, propagating the parent's policy, priority and
/// non-empty template fields.
fn child_node_scan(parent: &ClusterScan, node: &str) -> NodeScan {
    let name = truncate_name(&format!("{}-{node}", parent.name_any())).to_string();

    let mut spec = NodeScanSpec {
        node_name: node.to_string(),
        scan_policy: parent.spec.scan_policy.clone(),
        priority: parent.spec.priority,
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
    };

    if let Some(template) = &parent.spec.node_scan_template {
        if !template.paths.is_empty() {
            spec.paths = template.paths.clone();
        }
        if !template.exclude_patterns.is_empty() {
            spec.exclude_patterns = template.exclude_patterns.clone();
        }
        if template.max_concurrent != 0 {
            spec.max_concurrent = template.max_concurrent;
        }
        if template.file_timeout != 0 {
            spec.file_timeout = template.file_timeout;
        }
        if template.max_file_size != 0 {
            spec.max_file_size = template.max_file_size;
        }
        if template.resources.is_some() {
            spec.resources = template.resources.clone();
        }
        spec.strategy = template.strategy;
        if template.incremental_config.is_some() {
            spec.incremental_config = template.incremental_config.clone();
        }
        if template.force_full_scan {
            spec.force_full_scan = true;
        }
    }

    let mut child = NodeScan::new(&name, spec);
    child.metadata = ObjectMeta {
        name: Some(name),
        namespace: parent.namespace(),
        labels: Some(
            [
                (CLUSTERSCAN_LABEL.to_string(), parent.name_any()),
                (NODE_LABEL.to_string(), node.to_string()),
            ]
            .into_iter()
            .collect(),
        ),
        owner_references: parent.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    };
    child
}

#[cfg(test)]
mod tests {
    use super::*;
    use clamav_operator_k8s_api::{
        scancache::IncrementalConfig, ClusterScanSpec, NodeScanStatus, ScanPriority,
        ScanStrategy,
    };

    fn cluster_scan(name: &str) -> ClusterScan {
        let mut scan = ClusterScan::new(
            name,
            ClusterScanSpec {
                node_selector: None,
                scan_policy: Some("default-policy".to_string()),
                concurrent: 2,
                priority: ScanPriority::High,
                node_scan_template: None,
            },
        );
        scan.metadata.namespace = Some("default".to_string());
        scan.metadata.uid = Some("abcd".to_string());
        scan
    }

    fn child(name: &str, node: &str, phase: Option<NodeScanPhase>, scanned: i64, infected: i64) -> NodeScan {
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
        scan.status = Some(NodeScanStatus {
            phase,
            files_scanned: scanned,
            files_infected: infected,
            ..Default::default()
        });
        scan
    }

    #[test]
    fn aggregation_counts_each_phase() {
        let children = vec![
            child("cs-node-1", "node-1", Some(NodeScanPhase::Completed), 1000, 0),
            child("cs-node-2", "node-2", Some(NodeScanPhase::Completed), 500, 3),
            child("cs-node-3", "node-3", Some(NodeScanPhase::Running), 0, 0),
            child("cs-node-4", "node-4", Some(NodeScanPhase::Failed), 0, 0),
            child("cs-node-5", "node-5", Some(NodeScanPhase::Pending), 0, 0),
        ];
        let agg = Aggregation::over(&children);

        assert_eq!(agg.completed, 2);
        assert_eq!(agg.running, 1);
        assert_eq!(agg.failed, 1);
        assert_eq!(agg.infected, 1);
        assert_eq!(agg.total_files_scanned, 1500);
        assert_eq!(agg.total_files_infected, 3);
        assert_eq!(agg.refs.len(), 5);
    }

    #[test]
    fn aggregation_only_sums_completed_children() {
        let children = vec![
            child("a", "node-1", Some(NodeScanPhase::Running), 999, 9),
            child("b", "node-2", Some(NodeScanPhase::Completed), 100, 1),
        ];
        let agg = Aggregation::over(&children);
        assert_eq!(agg.total_files_scanned, 100);
        assert_eq!(agg.total_files_infected, 1);
    }

    #[test]
    fn phase_rule() {
        assert_eq!(decide_phase(5, 2, 1), ClusterScanPhase::Running);
        assert_eq!(decide_phase(5, 5, 0), ClusterScanPhase::Completed);
        assert_eq!(decide_phase(5, 0, 5), ClusterScanPhase::Failed);
        assert_eq!(decide_phase(5, 3, 2), ClusterScanPhase::PartiallyCompleted);
        assert_eq!(decide_phase(0, 0, 0), ClusterScanPhase::Completed);
    }

    #[test]
    fn child_carries_label_owner_and_policy() {
        let parent = cluster_scan("nightly");
        let child = child_node_scan(&parent, "worker-1");

        assert_eq!(child.name_any(), "nightly-worker-1");
        assert_eq!(child.spec.node_name, "worker-1");
        assert_eq!(child.spec.scan_policy.as_deref(), Some("default-policy"));
        assert_eq!(child.spec.priority, ScanPriority::High);
        assert_eq!(
            child.labels().get(CLUSTERSCAN_LABEL).map(String::as_str),
            Some("nightly")
        );
        let owners = child.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].kind, "ClusterScan");
        assert_eq!(owners[0].name, "nightly");
    }

    #[test]
    fn child_name_is_bounded() {
        let mut parent = cluster_scan("nightly");
        parent.metadata.name = Some("n".repeat(80));
        let child = child_node_scan(&parent, "worker-1");
        assert!(child.name_any().len() <= 63);
    }

    #[test]
    fn template_fields_propagate_when_set() {
        let mut parent = cluster_scan("nightly");
        parent.spec.node_scan_template = Some(NodeScanSpec {
            node_name: String::new(),
            scan_policy: None,
            priority: Default::default(),
            paths: vec!["/host/srv".to_string()],
            exclude_patterns: vec!["*.tmp".to_string()],
            max_concurrent: 8,
            file_timeout: 0,
            max_file_size: 0,
            resources: None,
            ttl_seconds_after_finished: None,
            strategy: ScanStrategy::Incremental,
            incremental_config: Some(IncrementalConfig {
                enabled: true,
                ..Default::default()
            }),
            force_full_scan: false,
        });

        let child = child_node_scan(&parent, "worker-1");
        assert_eq!(child.spec.paths, vec!["/host/srv"]);
        assert_eq!(child.spec.exclude_patterns, vec!["*.tmp"]);
        assert_eq!(child.spec.max_concurrent, 8);
        assert_eq!(child.spec.strategy, ScanStrategy::Incremental);
        assert!(child.spec.incremental_config.as_ref().unwrap().enabled);
        // Unset template fields stay unset on the child.
        assert_eq!(child.spec.file_timeout, 0);
        assert!(child.spec.resources.is_none());
    }
}
