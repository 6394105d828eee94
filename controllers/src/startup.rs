//! Pre-flight validation run before any reconciler starts. Fatal checks
//! abort the process; the ClamAV service check is advisory only, since the
//! scanner deployment may land after the operator.

use clamav_operator_k8s_api::{Namespace, Service, ServiceAccount};
use k8s_openapi::api::{
    authorization::v1::{ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec},
    discovery::v1::EndpointSlice,
};
use kube::{
    api::{ListParams, PostParams},
    Api, Client,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckError {
    #[error(
        "scanner ServiceAccount {name:?} not found in namespace {namespace:?}; \
         create it or ensure the Helm chart is correctly installed"
    )]
    ServiceAccountMissing { name: String, namespace: String },

    #[error("operator is missing required RBAC permissions: {0:?}; \
             ensure the ClusterRole and ClusterRoleBinding are correctly configured")]
    MissingPermissions(Vec<String>),

    #[error("cannot connect to the Kubernetes API server: {0}")]
    ApiServerUnreachable(#[source] kube::Error),

    #[error("API error: {0}")]
    Kube(#[from] kube::Error),
}

/// One RBAC permission the operator needs.
struct RbacRule {
    group: &'static str,
    resource: &'static str,
    verbs: &'static [&'static str],
    namespaced: bool,
}

const REQUIRED_RBAC_RULES: &[RbacRule] = &[
    RbacRule {
        group: "",
        resource: "pods",
        verbs: &["get", "list"],
        namespaced: true,
    },
    RbacRule {
        group: "",
        resource: "pods/log",
        verbs: &["get"],
        namespaced: true,
    },
    RbacRule {
        group: "batch",
        resource: "jobs",
        verbs: &["create", "get", "list", "watch", "delete"],
        namespaced: true,
    },
    RbacRule {
        group: "",
        resource: "nodes",
        verbs: &["get", "list", "watch"],
        namespaced: false,
    },
    RbacRule {
        group: "clamav.antivirus.io",
        resource: "nodescans",
        verbs: &["get", "list", "watch", "create", "update", "patch", "delete"],
        namespaced: true,
    },
    RbacRule {
        group: "clamav.antivirus.io",
        resource: "nodescans/status",
        verbs: &["get", "update", "patch"],
        namespaced: true,
    },
];

pub struct StartupChecker {
    client: Client,
    namespace: String,
    scanner_service_account: String,
}

/// Outcome of one named check, for human-readable reporting.
#[derive(Debug)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
}

// === impl StartupChecker ===

impl StartupChecker {
    pub fn new(client: Client, namespace: &str, scanner_service_account: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            scanner_service_account: scanner_service_account.to_string(),
        }
    }

    /// Runs every fatal check, stopping at the first failure.
    pub async fn run_all(&self) -> Result<(), CheckError> {
        tracing::info!("running startup validation checks");

        self.check_scanner_service_account().await?;
        tracing::info!(
            service_account = %self.scanner_service_account,
            "scanner ServiceAccount check passed"
        );

        self.check_rbac_permissions().await?;
        tracing::info!("RBAC permissions check passed");

        self.check_api_server().await?;
        tracing::info!("API server connectivity check passed");

        tracing::info!("all startup validation checks passed");
        Ok(())
    }

    /// Runs every fatal check and reports each outcome instead of stopping
    /// at the first failure.
    pub async fn run_with_results(&self) -> Vec<CheckResult> {
        let mut results = Vec::new();

        results.push(match self.check_scanner_service_account().await {
            Ok(()) => CheckResult {
                name: "ScannerServiceAccount",
                passed: true,
                message: format!(
                    "ServiceAccount {:?} exists in namespace {:?}",
                    self.scanner_service_account, self.namespace
                ),
            },
            Err(error) => CheckResult {
                name: "ScannerServiceAccount",
                passed: false,
                message: error.to_string(),
            },
        });

        results.push(match self.check_rbac_permissions().await {
            Ok(()) => CheckResult {
                name: "RBACPermissions",
                passed: true,
                message: "all required RBAC permissions are granted".to_string(),
            },
            Err(error) => CheckResult {
                name: "RBACPermissions",
                passed: false,
                message: error.to_string(),
            },
        });

        results.push(match self.check_api_server().await {
            Ok(()) => CheckResult {
                name: "APIServerConnectivity",
                passed: true,
                message: "successfully connected to the Kubernetes API server".to_string(),
            },
            Err(error) => CheckResult {
                name: "APIServerConnectivity",
                passed: false,
                message: error.to_string(),
            },
        });

        results
    }

    async fn check_scanner_service_account(&self) -> Result<(), CheckError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get_opt(&self.scanner_service_account).await? {
            Some(_) => Ok(()),
            None => Err(CheckError::ServiceAccountMissing {
                name: self.scanner_service_account.clone(),
                namespace: self.namespace.clone(),
            }),
        }
    }

    async fn check_rbac_permissions(&self) -> Result<(), CheckError> {
        let mut missing = Vec::new();

        for rule in REQUIRED_RBAC_RULES {
            for verb in rule.verbs {
                match self.can_i(rule, verb).await {
                    Ok(true) => {}
                    Ok(false) => {
                        let mut permission = format!("{}/{}:{verb}", rule.group, rule.resource);
                        if rule.namespaced {
                            permission.push_str(&format!(" (namespace: {})", self.namespace));
                        }
                        missing.push(permission);
                    }
                    Err(error) => {
                        tracing::error!(
                            %error,
                            resource = rule.resource,
                            verb,
                            "failed to check permission"
                        );
                    }
                }
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CheckError::MissingPermissions(missing))
        }
    }

    async fn can_i(&self, rule: &RbacRule, verb: &str) -> Result<bool, kube::Error> {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    namespace: rule.namespaced.then(|| self.namespace.clone()),
                    group: Some(rule.group.to_string()),
                    resource: Some(rule.resource.to_string()),
                    verb: Some(verb.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let response = api.create(&PostParams::default(), &review).await?;
        Ok(response.status.map(|s| s.allowed).unwrap_or(false))
    }

    async fn check_api_server(&self) -> Result<(), CheckError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.list(&ListParams::default().limit(1))
            .await
            .map_err(CheckError::ApiServerUnreachable)?;
        Ok(())
    }
}

/// Advisory check that the ClamAV service exists and has ready endpoints.
/// Never blocks startup: the scanner deployment may be managed separately.
pub async fn check_clamav_service(client: &Client, namespace: &str, service: &str) {
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    let svc = match services.get_opt(service).await {
        Ok(Some(svc)) => svc,
        Ok(None) => {
            tracing::warn!(
                service,
                namespace,
                "ClamAV service not found; scans will fail until it is available"
            );
            return;
        }
        Err(error) => {
            tracing::warn!(%error, service, "could not check ClamAV service");
            return;
        }
    };

    let slices: Api<EndpointSlice> = Api::namespaced(client.clone(), namespace);
    let ready = match slices
        .list(&ListParams::default().labels(&format!("kubernetes.io/service-name={service}")))
        .await
    {
        Ok(list) => list.items.iter().any(|slice| {
            slice.endpoints.iter().any(|ep| {
                ep.conditions
                    .as_ref()
                    .and_then(|c| c.ready)
                    .unwrap_or(false)
            })
        }),
        Err(error) => {
            tracing::warn!(%error, service, "could not check ClamAV endpoints");
            return;
        }
    };

    if ready {
        tracing::info!(
            service,
            cluster_ip = ?svc.spec.as_ref().and_then(|s| s.cluster_ip.as_ref()),
            "ClamAV service is available"
        );
    } else {
        tracing::warn!(
            service,
            "ClamAV service has no ready endpoints; scans will fail until it does"
        );
    }
}

/// The namespace this operator runs in: POD_NAMESPACE, then the mounted
/// service-account namespace file, then the conventional default.
pub fn operator_namespace() -> String {
    if let Ok(ns) = std::env::var("POD_NAMESPACE") {
        if !ns.is_empty() {
            return ns;
        }
    }
    if let Ok(ns) =
        std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
    {
        let ns = ns.trim();
        if !ns.is_empty() {
            return ns.to_string();
        }
    }
    "clamav-system".to_string()
}
