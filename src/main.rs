use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vm_export_controller::controller::{
    self, certs::DEFAULT_CA_CERT_FILE, certs::DEFAULT_CA_KEY_FILE, CaManager, ControllerConfig,
    DefaultExporterTemplate,
};
use vm_export_controller::rest_api::{self, ServerState};
use vm_export_controller::Error;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the export controller
    Run(RunArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace holding the export CA bundle, ingress TLS secrets and route CA
    #[arg(long, env = "KUBEVIRT_NAMESPACE", default_value = "kubevirt")]
    kubevirt_namespace: String,

    /// Image of the exporter pod
    #[arg(
        long,
        env = "EXPORTER_IMAGE",
        default_value = "quay.io/kubevirt/virt-exportserver:latest"
    )]
    exporter_image: String,

    /// Pull policy of the exporter image
    #[arg(long, env = "EXPORTER_PULL_POLICY", default_value = "IfNotPresent")]
    exporter_pull_policy: String,

    /// Number of exports reconciled concurrently
    #[arg(long, env = "THREADINESS", default_value_t = 3)]
    threadiness: u16,

    /// PEM file of the CA signing exporter certificates
    #[arg(long, env = "CA_CERT_FILE", default_value = DEFAULT_CA_CERT_FILE)]
    ca_cert_file: String,

    /// PEM file of the CA private key
    #[arg(long, env = "CA_KEY_FILE", default_value = DEFAULT_CA_KEY_FILE)]
    ca_key_file: String,

    /// How often the CA files are re-read
    #[arg(long, env = "CA_RELOAD_INTERVAL_SECS", default_value_t = 300)]
    ca_reload_interval_secs: u64,

    /// Upper bound on the initial cache sync
    #[arg(long, env = "CACHE_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    cache_sync_timeout_secs: u64,

    /// Service external Ingresses or Routes must target
    #[arg(long, env = "EXPORT_PROXY_SERVICE", default_value = "virt-exportproxy")]
    export_proxy_service: String,

    /// Port of the health, readiness and metrics endpoint
    #[arg(long, env = "HEALTH_PORT", default_value_t = rest_api::DEFAULT_PORT)]
    health_port: u16,

    /// Hold a Lease before reconciling so only one replica is active
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("VM Export Controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run(run_args).await,
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = fmt::layer().with_target(true);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Only enable OTEL if an endpoint is provided
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        match vm_export_controller::telemetry::init_telemetry(&registry) {
            Ok(otel_layer) => {
                registry.with(otel_layer).init();
                info!("OpenTelemetry tracing initialized");
            }
            Err(e) => {
                registry.init();
                warn!("OpenTelemetry tracing disabled: {}", e);
            }
        }
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
}

async fn run(args: RunArgs) -> Result<(), Error> {
    init_tracing();

    info!(
        "Starting VM Export Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let ready = Arc::new(Mutex::new(false));
    {
        let state = Arc::new(ServerState::new(ready.clone()));
        let port = args.health_port;
        tokio::spawn(async move {
            if let Err(e) = rest_api::run_server(state, port).await {
                error!("Health endpoint error: {:?}", e);
            }
        });
    }

    let ca = Arc::new(CaManager::new(&args.ca_cert_file, &args.ca_key_file));
    if let Err(e) = ca.reload() {
        warn!("Export CA not loaded yet, exporter certificates cannot be issued: {}", e);
    }
    {
        let ca = ca.clone();
        let interval_secs = args.ca_reload_interval_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await; // first tick completes immediately
            loop {
                interval.tick().await;
                if let Err(e) = ca.reload() {
                    warn!("Failed to reload export CA: {}", e);
                }
            }
        });
    }

    if args.leader_elect {
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        let lease_namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.kubevirt_namespace.clone());
        info!("Leader election using holder ID: {}", holder_identity);

        let leases: Api<Lease> = Api::namespaced(client.clone(), &lease_namespace);
        wait_for_leadership(&leases, &holder_identity).await;

        tokio::spawn(async move {
            run_leader_election(leases, holder_identity).await;
        });
    }

    let config = ControllerConfig {
        kubevirt_namespace: args.kubevirt_namespace.clone(),
        export_proxy_service: args.export_proxy_service.clone(),
        threadiness: args.threadiness.max(1),
        cache_sync_timeout: Duration::from_secs(args.cache_sync_timeout_secs),
    };
    let template = Arc::new(DefaultExporterTemplate::new(
        args.exporter_image.clone(),
        args.exporter_pull_policy.clone(),
    ));

    let result = controller::run_controller(client, config, template, ca, ready).await;

    // Flush any remaining traces
    vm_export_controller::telemetry::shutdown_telemetry();

    result
}

const LEASE_NAME: &str = "virt-export-controller-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Block until this replica holds the lease
async fn wait_for_leadership(leases: &Api<Lease>, identity: &str) {
    loop {
        match try_acquire_or_renew(leases, identity).await {
            Ok(true) => {
                info!("Acquired leadership for lease {}", LEASE_NAME);
                return;
            }
            Ok(false) => {}
            Err(e) => warn!("Leader election error: {:?}", e),
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

/// Keep renewing the lease. Losing it stops the process so another replica
/// can take over with a clean state.
async fn run_leader_election(leases: Api<Lease>, identity: String) {
    loop {
        tokio::time::sleep(RENEW_INTERVAL).await;
        match try_acquire_or_renew(&leases, &identity).await {
            Ok(true) => {}
            Ok(false) => {
                error!("Lost leadership for lease {}, exiting", LEASE_NAME);
                std::process::exit(1);
            }
            Err(e) => warn!("Leader election error: {:?}", e),
        }
    }
}

async fn try_acquire_or_renew(leases: &Api<Lease>, identity: &str) -> Result<bool, kube::Error> {
    let now = Utc::now();

    let result = match leases.get(LEASE_NAME).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());
            let resource_version = existing.metadata.resource_version.as_deref();

            if current_holder == Some(identity) {
                let patch = renew_patch(resource_version, now);
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map(|_| true)
            } else if lease_expired(spec, now) {
                info!(
                    "Lease held by {:?} has expired, taking over",
                    current_holder
                );
                let patch = takeover_patch(resource_version, identity, now);
                leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map(|_| true)
            } else {
                Ok(false)
            }
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await.map(|_| {
                info!("Created lease {} with holder {}", LEASE_NAME, identity);
                true
            })
        }
        Err(e) => Err(e),
    };

    match result {
        // Another replica wrote the lease between our read and write
        Err(kube::Error::Api(err)) if err.code == 409 => {
            info!("Lease {} changed concurrently, not leading", LEASE_NAME);
            Ok(false)
        }
        other => other,
    }
}

fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    spec.and_then(|s| s.renew_time.as_ref())
        .map(|renew| {
            let duration = spec
                .and_then(|s| s.lease_duration_seconds)
                .unwrap_or(LEASE_DURATION_SECS);
            now > renew.0 + chrono::Duration::seconds(duration as i64)
        })
        .unwrap_or(true)
}

/// Merge patch extending our own lease. The resourceVersion makes the API
/// server reject it with 409 if the lease changed since it was read.
fn renew_patch(resource_version: Option<&str>, now: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "spec": {
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    })
}

fn takeover_patch(
    resource_version: Option<&str>,
    identity: &str,
    now: DateTime<Utc>,
) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "spec": {
            "holderIdentity": identity,
            "acquireTime": MicroTime(now),
            "renewTime": MicroTime(now),
            "leaseDurationSeconds": LEASE_DURATION_SECS,
        }
    })
}
