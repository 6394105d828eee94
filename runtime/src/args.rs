use crate::admission::Admission;
use anyhow::{bail, Result};
use clamav_operator_controllers::{
    clusterscan, nodescan, scanschedule, startup, Context, Metrics, ScannerSettings,
    StartupChecker,
};
use clamav_operator_k8s_api as k8s;
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::{Patch, PatchParams};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::watch, time::Duration};
use tracing::{info, instrument};

const LEASE_DURATION: Duration = Duration::from_secs(30);
const LEASE_NAME: &str = "clamav-operator-lock";
const RENEW_GRACE_PERIOD: Duration = Duration::from_secs(1);
const FIELD_MANAGER: &str = "clamav-operator";

#[derive(Debug, clap::Parser)]
#[clap(name = "clamav-operator", about = "Cluster-wide ClamAV scan orchestrator")]
pub struct Args {
    #[clap(
        long,
        default_value = "clamav_operator=info,warn",
        env = "CLAMAV_OPERATOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission webhook server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Ensures only one replica runs the reconcilers at a time.
    #[clap(long)]
    leader_elect: bool,

    /// Container image for the node scanner.
    #[clap(long, default_value = "ghcr.io/clamav-operator/clamav-node-scanner:1.0.3")]
    scanner_image: String,

    /// Pull secret for the scanner image, when the registry needs one.
    #[clap(long)]
    scanner_image_pull_secret: Option<String>,

    /// ClamAV daemon host the scanners connect to.
    #[clap(long, default_value = "clamav.clamav.svc.cluster.local")]
    clamav_host: String,

    /// ClamAV daemon port.
    #[clap(long, default_value = "3310")]
    clamav_port: u16,

    /// ClamAV Service name checked (advisorily) at startup.
    #[clap(long, default_value = "clamav")]
    clamav_service: String,

    /// ServiceAccount the scanner pods run as.
    #[clap(long, default_value = "clamav-scanner")]
    scanner_service_account: String,

    /// Skips the pre-flight permission and ServiceAccount checks.
    #[clap(long)]
    skip_startup_checks: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        <Self as clap::Parser>::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            leader_elect,
            scanner_image,
            scanner_image_pull_secret,
            clamav_host,
            clamav_port,
            clamav_service,
            scanner_service_account,
            skip_startup_checks,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let metrics = Arc::new(Metrics::register(prom.sub_registry_with_prefix("clamav")));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let namespace = startup::operator_namespace();

        // Pre-flight checks run before anything is watched or reconciled.
        if skip_startup_checks {
            tracing::warn!("startup validation checks skipped by flag");
        } else {
            let checker =
                StartupChecker::new(runtime.client(), &namespace, &scanner_service_account);
            checker.run_all().await?;
        }
        startup::check_clamav_service(&runtime.client(), &namespace, &clamav_service).await;

        // With leader election on, reconcilers start only once this replica
        // holds the lease.
        if leader_elect {
            let hostname = std::env::var("HOSTNAME")
                .expect("Failed to fetch `HOSTNAME` environment variable");
            let claims = init_lease(&runtime, &namespace, &hostname).await?;
            wait_for_claim(claims, &hostname).await?;
            info!(%hostname, "lease acquired, starting reconcilers");
        }

        let ctx = Context::new(
            runtime.client(),
            metrics,
            ScannerSettings {
                image: scanner_image,
                clamav_host,
                clamav_port,
                service_account: scanner_service_account,
                image_pull_secret: scanner_image_pull_secret,
            },
        );

        let shutdown = runtime.shutdown_handle();
        tokio::spawn(nodescan::run(ctx.clone(), shutdown.clone()));
        tokio::spawn(clusterscan::run(ctx.clone(), shutdown.clone()));
        tokio::spawn(scanschedule::run(ctx.clone(), shutdown));

        let runtime = runtime.spawn_server(Admission::new);

        // Block on the shutdown signal, then wait for the background tasks
        // to wind down.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[instrument(skip_all)]
async fn init_lease<T>(
    runtime: &kubert::Runtime<T>,
    namespace: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    let params = kubert::LeaseParams {
        name: LEASE_NAME.to_string(),
        namespace: namespace.to_string(),
        claimant: hostname.to_string(),
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
        field_manager: Some(FIELD_MANAGER.into()),
    };

    let lease = coordv1::Lease {
        metadata: k8s::ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            // A resource version of "0" creates the Lease only when it does
            // not already exist.
            resource_version: Some("0".to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/name".to_string(),
                    "clamav-operator".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let patch_params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), namespace);
    match api.patch(LEASE_NAME, &patch_params, &Patch::Apply(lease)).await {
        Ok(lease) => tracing::info!(?lease, "created Lease"),
        Err(kube::Error::Api(_)) => tracing::debug!("Lease already exists"),
        Err(error) => return Err(error.into()),
    }

    let (claims, _task) = runtime.spawn_lease(params).await?;
    Ok(claims)
}

async fn wait_for_claim(
    mut claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    hostname: &str,
) -> Result<()> {
    loop {
        if claims.borrow_and_update().is_current_for(hostname) {
            return Ok(());
        }
        claims.changed().await?;
    }
}
