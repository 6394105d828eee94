//! Reconciles ScanSchedules: fires ClusterScans on a cron cadence, honours
//! the concurrency policy, and trims terminal scans down to the history
//! limits.

use crate::{backoff_key, error_policy, patch_status, publish_event, Context, Error, Result};
use chrono::{DateTime, Utc};
use clamav_operator_k8s_api::{
    truncate_name, validation::parse_cron, ClusterScan, ClusterScanPhase, ConcurrencyPolicy,
    ObjectReference, ScanSchedule, ScanScheduleStatus, Time, SCHEDULE_LABEL,
};
use cron::Schedule;
use futures::StreamExt;
use kube::{
    api::{DeleteParams, ListParams, ObjectMeta, PostParams},
    runtime::{
        controller::{Action, Controller},
        events::EventType,
        watcher,
    },
    Api, Resource, ResourceExt,
};
use std::{sync::Arc, time::Duration};
use tracing::{info_span, Instrument};

const CONTROLLER_NAME: &str = "scanschedule-controller";
const DEFAULT_SUCCESS_HISTORY: i32 = 10;
const DEFAULT_FAILED_HISTORY: i32 = 3;

/// Runs the ScanSchedule controller until shutdown.
pub async fn run(ctx: Arc<Context>, shutdown: drain::Watch) {
    let schedules = Api::<ScanSchedule>::all(ctx.client.clone());
    let scans = Api::<ClusterScan>::all(ctx.client.clone());

    Controller::new(schedules, watcher::Config::default())
        .owns(scans, watcher::Config::default())
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
        .instrument(info_span!("scanschedule"))
        .await;
}

async fn reconcile(schedule: Arc<ScanSchedule>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = schedule.namespace().ok_or(Error::MissingNamespace)?;
    let name = schedule.name_any();
    let key = backoff_key(schedule.as_ref());
    let api: Api<ScanSchedule> = Api::namespaced(ctx.client.clone(), &namespace);

    let cron = parse_cron(&schedule.spec.schedule).map_err(Error::Validation)?;
    let now = Utc::now();
    let next_run = cron.after(&now).next();

    let mut status = schedule.status.clone().unwrap_or_default();
    status.next_schedule_time = next_run.map(Time);

    if schedule.spec.suspend {
        tracing::info!(schedule = %name, "scan schedule is suspended");
        patch_status(&api, &name, &status).await?;
        return Ok(requeue_until(next_run, now));
    }

    let firing = match firing_decision(
        &cron,
        status.last_schedule_time.as_ref().map(|t| t.0),
        now,
        schedule.spec.starting_deadline_seconds,
    ) {
        FiringDecision::Fire => true,
        FiringDecision::NotDue => false,
        FiringDecision::DeadlineExceeded => {
            tracing::warn!(schedule = %name, "missed firing window, skipping");
            publish_event(
                &ctx.recorder(CONTROLLER_NAME, schedule.as_ref()),
                EventType::Warning,
                "MissedSchedule",
                "Missed the starting deadline for a scheduled scan".to_string(),
            )
            .await;
            // Move the needle so the miss is not retried forever.
            status.last_schedule_time = Some(Time(now));
            false
        }
    };

    let firing = if firing {
        apply_concurrency_policy(ctx.as_ref(), &schedule, &mut status).await?
    } else {
        false
    };

    if firing {
        fire(ctx.as_ref(), &schedule, &mut status, now).await?;
    }

    if let Err(error) = cleanup_history(ctx.as_ref(), &schedule, &mut status).await {
        tracing::error!(%error, schedule = %name, "failed to cleanup history");
    }

    patch_status(&api, &name, &status).await?;
    ctx.clear_backoff(&key);
    Ok(requeue_until(next_run, now))
}

fn requeue_until(next_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Action {
    match next_run {
        Some(next) => {
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            Action::requeue(delay)
        }
        // A schedule with no future firings (e.g. a fixed date in the past)
        // has nothing to wake up for.
        None => Action::await_change(),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FiringDecision {
    Fire,
    NotDue,
    DeadlineExceeded,
}

/// A schedule is due when it has never fired, or when the firing after the
/// last one has come to pass.
fn firing_decision(
    cron: &Schedule,
    last_schedule: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    starting_deadline_seconds: Option<i64>,
) -> FiringDecision {
    let Some(last) = last_schedule else {
        return FiringDecision::Fire;
    };
    let Some(missed) = cron.after(&last).next() else {
        return FiringDecision::NotDue;
    };
    if missed > now {
        return FiringDecision::NotDue;
    }
    if let Some(deadline) = starting_deadline_seconds {
        if (now - missed).num_seconds() > deadline {
            return FiringDecision::DeadlineExceeded;
        }
    }
    FiringDecision::Fire
}

/// Applies Allow/Forbid/Replace to a due firing. Returns whether the firing
/// proceeds.
async fn apply_concurrency_policy(
    ctx: &Context,
    schedule: &ScanSchedule,
    status: &mut ScanScheduleStatus,
) -> Result<bool> {
    if status.active.is_empty() {
        return Ok(true);
    }
    match schedule.spec.concurrency_policy {
        ConcurrencyPolicy::Allow => Ok(true),
        ConcurrencyPolicy::Forbid => {
            tracing::info!(
                schedule = %schedule.name_any(),
                "skipping firing: active scans and concurrency policy Forbid"
            );
            Ok(false)
        }
        ConcurrencyPolicy::Replace => {
            let namespace = schedule.namespace().ok_or(Error::MissingNamespace)?;
            let api: Api<ClusterScan> = Api::namespaced(ctx.client.clone(), &namespace);
            for active in &status.active {
                if let Some(name) = &active.name {
                    match api.delete(name, &DeleteParams::default()).await {
                        Ok(_) => {}
                        Err(kube::Error::Api(e)) if e.code == 404 => {}
                        Err(error) => return Err(error.into()),
                    }
                }
            }
            status.active.clear();
            Ok(true)
        }
    }
}

/// Creates the ClusterScan for this firing and records it in status.
async fn fire(
    ctx: &Context,
    schedule: &ScanSchedule,
    status: &mut ScanScheduleStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let namespace = schedule.namespace().ok_or(Error::MissingNamespace)?;
    let name = schedule.name_any();
    let scan = fired_cluster_scan(schedule, now);
    let scan_name = scan.name_any();
    let api: Api<ClusterScan> = Api::namespaced(ctx.client.clone(), &namespace);
    let recorder = ctx.recorder(CONTROLLER_NAME);

    match api.create(&PostParams::default(), &scan).await {
        Ok(created) => {
            status.last_schedule_time = Some(Time(now));
            status.last_cluster_scan = Some(scan_name.clone());
            status.active.push(ObjectReference {
                api_version: Some("clamav.antivirus.io/v1alpha1".to_string()),
                kind: Some("ClusterScan".to_string()),
                name: created.metadata.name.clone(),
                namespace: created.metadata.namespace.clone(),
                uid: created.metadata.uid.clone(),
                ..Default::default()
            });
            publish_event(
                &recorder,
                EventType::Normal,
                "ScanCreated",
                format!("Created ClusterScan {scan_name}"),
            )
            .await;
            ctx.metrics
                .record_schedule_execution(&namespace, &name, "success");
            Ok(())
        }
        // The epoch suffix makes duplicate firings collide by name; treat a
        // collision as this firing having already happened.
        Err(kube::Error::Api(e)) if e.code == 409 => {
            status.last_schedule_time = Some(Time(now));
            Ok(())
        }
        Err(error) => {
            tracing::error!(%error, schedule = %name, "failed to create cluster scan");
            ctx.metrics
                .record_schedule_execution(&namespace, &name, "failed");
            Err(error.into())
        }
    }
}

fn fired_cluster_scan(schedule: &ScanSchedule, now: DateTime<Utc>) -> ClusterScan {
    let name = truncate_name(&format!("{}-{}", schedule.name_any(), now.timestamp())).to_string();
    let mut scan = ClusterScan::new(&name, schedule.spec.cluster_scan.clone());
    scan.metadata = ObjectMeta {
        name: Some(name),
        namespace: schedule.namespace(),
        labels: Some(
            [(SCHEDULE_LABEL.to_string(), schedule.name_any())]
                .into_iter()
                .collect(),
        ),
        owner_references: schedule.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    };
    scan
}

/// Buckets this schedule's scans by terminal phase, rebuilds the active
/// list, and deletes the oldest scans beyond the retention limits.
async fn cleanup_history(
    ctx: &Context,
    schedule: &ScanSchedule,
    status: &mut ScanScheduleStatus,
) -> Result<()> {
    let namespace = schedule.namespace().ok_or(Error::MissingNamespace)?;
    let name = schedule.name_any();
    let api: Api<ClusterScan> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut scans = api
        .list(&ListParams::default().labels(&format!("{SCHEDULE_LABEL}={name}")))
        .await?
        .items;
    scans.sort_by_key(|s| s.metadata.creation_timestamp.clone().map(|t| t.0));

    let mut successful = Vec::new();
    let mut failed = Vec::new();
    let mut active = Vec::new();

    for scan in &scans {
        match scan.status.as_ref().and_then(|s| s.phase) {
            Some(ClusterScanPhase::Completed) => successful.push(scan),
            Some(ClusterScanPhase::Failed) | Some(ClusterScanPhase::PartiallyCompleted) => {
                failed.push(scan)
            }
            _ => active.push(ObjectReference {
                api_version: Some("clamav.antivirus.io/v1alpha1".to_string()),
                kind: Some("ClusterScan".to_string()),
                name: scan.metadata.name.clone(),
                namespace: scan.metadata.namespace.clone(),
                uid: scan.metadata.uid.clone(),
                ..Default::default()
            }),
        }
    }
    status.active = active;

    let success_limit = schedule
        .spec
        .successful_scans_history_limit
        .unwrap_or(DEFAULT_SUCCESS_HISTORY);
    let failed_limit = schedule
        .spec
        .failed_scans_history_limit
        .unwrap_or(DEFAULT_FAILED_HISTORY);

    for victim in history_victims(successful.len(), success_limit)
        .map(|i| &successful[i])
        .chain(history_victims(failed.len(), failed_limit).map(|i| &failed[i]))
    {
        match api
            .delete(&victim.name_any(), &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(error) => return Err(error.into()),
        }
    }

    if let Some(last) = successful.last() {
        if let Some(completion) = last.status.as_ref().and_then(|s| s.completion_time.clone()) {
            status.last_successful_time = Some(completion);
        }
    }

    Ok(())
}

/// Indices of the oldest entries beyond the retention limit, assuming the
/// input is sorted oldest-first.
fn history_victims(len: usize, limit: i32) -> impl Iterator<Item = usize> {
    let keep = limit.max(0) as usize;
    0..len.saturating_sub(keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, m, 0).unwrap()
    }

    fn daily_at_2() -> Schedule {
        parse_cron("0 2 * * *").unwrap()
    }

    #[test]
    fn never_fired_schedules_are_due() {
        assert_eq!(
            firing_decision(&daily_at_2(), None, at(1, 0), None),
            FiringDecision::Fire
        );
    }

    #[test]
    fn not_due_before_next_tick() {
        let last = at(2, 0);
        assert_eq!(
            firing_decision(&daily_at_2(), Some(last), at(14, 0), None),
            FiringDecision::NotDue
        );
    }

    #[test]
    fn due_after_next_tick_passes() {
        let last = Utc.with_ymd_and_hms(2025, 5, 31, 2, 0, 0).unwrap();
        assert_eq!(
            firing_decision(&daily_at_2(), Some(last), at(2, 30), None),
            FiringDecision::Fire
        );
    }

    #[test]
    fn deadline_bounds_late_firings() {
        let last = Utc.with_ymd_and_hms(2025, 5, 31, 2, 0, 0).unwrap();
        // 2:30 is 1800s past the 2:00 tick.
        assert_eq!(
            firing_decision(&daily_at_2(), Some(last), at(2, 30), Some(600)),
            FiringDecision::DeadlineExceeded
        );
        assert_eq!(
            firing_decision(&daily_at_2(), Some(last), at(2, 30), Some(3600)),
            FiringDecision::Fire
        );
    }

    #[test]
    fn fired_scan_is_labelled_and_owned() {
        let mut schedule = ScanSchedule::new(
            "nightly",
            clamav_operator_k8s_api::ScanScheduleSpec {
                schedule: "0 2 * * *".to_string(),
                cluster_scan: Default::default(),
                suspend: false,
                successful_scans_history_limit: None,
                failed_scans_history_limit: None,
                concurrency_policy: Default::default(),
                starting_deadline_seconds: None,
            },
        );
        schedule.metadata.namespace = Some("default".to_string());
        schedule.metadata.uid = Some("u1".to_string());

        let now = at(2, 0);
        let scan = fired_cluster_scan(&schedule, now);
        assert_eq!(
            scan.name_any(),
            format!("nightly-{}", now.timestamp())
        );
        assert_eq!(
            scan.labels().get(SCHEDULE_LABEL).map(String::as_str),
            Some("nightly")
        );
        assert_eq!(
            scan.metadata.owner_references.as_ref().unwrap()[0].kind,
            "ScanSchedule"
        );
    }

    #[test]
    fn history_victims_keep_the_most_recent() {
        // 12 successful scans, limit 10: the 2 oldest go.
        assert_eq!(history_victims(12, 10).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(history_victims(3, 10).count(), 0);
        assert_eq!(history_victims(5, 0).count(), 5);
    }

    #[test]
    fn requeue_targets_next_run() {
        let action = requeue_until(Some(at(2, 0)), at(1, 0));
        let expected = Action::requeue(Duration::from_secs(3600));
        assert_eq!(format!("{action:?}"), format!("{expected:?}"));
    }
}
