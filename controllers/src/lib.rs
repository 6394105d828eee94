#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod clusterscan;
pub mod defaults;
pub mod metrics;
pub mod nodescan;
pub mod notifications;
pub mod scanschedule;
pub mod startup;

pub use self::{cache::CacheManager, metrics::Metrics, startup::StartupChecker};

use clamav_operator_k8s_api as api;
use kube::{
    api::{Patch, PatchParams, Resource, ResourceExt},
    runtime::{
        controller::Action,
        events::{Event, EventType, Recorder, Reporter},
    },
    Api, Client,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// How often a reconciler re-checks a scan that is still executing.
pub(crate) const RUNNING_REQUEUE: Duration = Duration::from_secs(30);

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("resource has no namespace")]
    MissingNamespace,

    #[error("resource has no owner reference")]
    MissingOwnerRef,

    #[error("no pods found for job {0}")]
    NoScannerPod(String),

    #[error("failed to read scanner logs: {0}")]
    LogStream(#[from] std::io::Error),

    #[error("{0}")]
    Validation(#[from] api::validation::Invalid),

    #[error("{0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(error: kube::runtime::finalizer::Error<Error>) -> Self {
        Self::Finalizer(Box::new(error))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Knobs the scan Jobs are built from, fixed at process start.
#[derive(Clone, Debug)]
pub struct ScannerSettings {
    /// Container image running the scanner.
    pub image: String,
    /// ClamAV service host handed to the scanner.
    pub clamav_host: String,
    /// ClamAV service port.
    pub clamav_port: u16,
    /// ServiceAccount the scanner pods run as.
    pub service_account: String,
    /// Pull secret for the scanner image, when the registry needs one.
    pub image_pull_secret: Option<String>,
}

/// State shared by every reconciler in the process.
pub struct Context {
    pub client: Client,
    pub metrics: Arc<Metrics>,
    pub scanner: ScannerSettings,
    backoffs: Backoff,
}

/// Per-resource exponential backoff for transient reconcile failures.
#[derive(Default)]
pub(crate) struct Backoff(Mutex<HashMap<String, u32>>);

impl Backoff {
    fn next(&self, key: &str) -> Duration {
        let mut attempts = self.0.lock();
        let attempt = attempts.entry(key.to_string()).or_insert(0);
        let delay = BACKOFF_BASE * 2u32.saturating_pow(*attempt);
        *attempt = attempt.saturating_add(1);
        delay.min(BACKOFF_MAX)
    }

    fn clear(&self, key: &str) {
        self.0.lock().remove(key);
    }
}

// === impl Context ===

impl Context {
    pub fn new(client: Client, metrics: Arc<Metrics>, scanner: ScannerSettings) -> Arc<Self> {
        Arc::new(Self {
            client,
            metrics,
            scanner,
            backoffs: Backoff::default(),
        })
    }

    pub fn cache_manager(&self) -> CacheManager {
        CacheManager::new(self.client.clone(), self.metrics.clone())
    }

    pub(crate) fn recorder<K>(&self, controller: &str, obj: &K) -> Recorder
    where
        K: Resource<DynamicType = ()>,
    {
        Recorder::new(
            self.client.clone(),
            Reporter {
                controller: controller.to_string(),
                instance: None,
            },
            obj.object_ref(&()),
        )
    }

    /// Transient errors requeue with exponential backoff, reset on the next
    /// clean reconcile.
    pub(crate) fn next_backoff(&self, key: &str) -> Duration {
        self.backoffs.next(key)
    }

    pub(crate) fn clear_backoff(&self, key: &str) {
        self.backoffs.clear(key);
    }
}

pub(crate) fn backoff_key<K: ResourceExt>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

pub(crate) fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.next_backoff(&backoff_key(obj.as_ref()));
    tracing::warn!(%error, ?delay, "reconcile failed, requeueing");
    Action::requeue(delay)
}

/// Merge-patches the status subresource.
pub(crate) async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<()>
where
    K: Resource + Clone + std::fmt::Debug + DeserializeOwned,
    S: Serialize,
{
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/// Publishes an event, logging failures rather than surfacing them: event
/// delivery must never change the outcome of a reconcile.
pub(crate) async fn publish_event(
    recorder: &Recorder,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: reason.to_string(),
        secondary: None,
    };
    if let Err(error) = recorder.publish(event).await {
        tracing::warn!(%error, reason, "failed to publish event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        let delays: Vec<_> = (0..8).map(|_| backoff.next("default/scan")).collect();
        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(delays[1], Duration::from_secs(10));
        assert_eq!(delays[2], Duration::from_secs(20));
        assert_eq!(*delays.last().unwrap(), BACKOFF_MAX);
    }

    #[test]
    fn backoff_resets_after_clean_reconcile() {
        let backoff = Backoff::default();
        backoff.next("default/scan");
        backoff.next("default/scan");
        backoff.clear("default/scan");
        assert_eq!(backoff.next("default/scan"), BACKOFF_BASE);
    }

    #[test]
    fn backoff_is_per_resource() {
        let backoff = Backoff::default();
        backoff.next("default/a");
        assert_eq!(backoff.next("default/b"), BACKOFF_BASE);
    }
}
