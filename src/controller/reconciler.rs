//! Main reconciler for VirtualMachineExport resources
//!
//! Implements the controller pattern using kube-rs runtime. Dependent kinds
//! are watched by their own reflectors; their changes are mapped to export
//! keys through the [`DependencyIndex`] and fed to the controller queue.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        reflector::{self, store::Writer, Store},
        watcher, WatchStreamExt,
    },
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use super::cache::{ExportCaches, MemoryCache, ObjectCache};
use super::certs::CertIssuer;
use super::client::{Clock, ExportKubeClient, ExportKubeClientImpl, SystemClock};
use super::index::{DependencyIndex, ExportKey};
use super::resources::ExporterTemplate;
use super::source::classify_source;
use crate::crd::{
    DataVolume, Route, VirtualMachine, VirtualMachineExport, VirtualMachineInstance,
    VirtualMachineSnapshot, VirtualMachineSnapshotContent,
};
use crate::error::{Error, Result};

#[cfg(feature = "metrics")]
use super::metrics;

pub const CONTROLLER_NAME: &str = "vmexport";

/// Delay before re-checking snapshot restore claims that do not exist yet
pub const RESTORE_REQUEUE: Duration = Duration::from_secs(3);

const ROUTE_API_GROUP: &str = "route.openshift.io";

/// Runtime settings of the export controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace holding the CA bundle, ingress TLS secrets and route CA
    pub kubevirt_namespace: String,
    /// Service the external Ingress or Route must target
    pub export_proxy_service: String,
    /// Number of exports reconciled concurrently
    pub threadiness: u16,
    /// Upper bound on the initial cache sync
    pub cache_sync_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kubevirt_namespace: "kubevirt".to_string(),
            export_proxy_service: super::external_access::DEFAULT_EXPORT_PROXY_SERVICE.to_string(),
            threadiness: 3,
            cache_sync_timeout: Duration::from_secs(60),
        }
    }
}

/// Shared state of the export controller.
///
/// Every collaborator is injected so reconciliation runs unchanged against
/// in-memory caches and a fake client.
pub struct ExportController {
    pub(crate) client: Arc<dyn ExportKubeClient>,
    pub(crate) caches: ExportCaches,
    pub(crate) template: Arc<dyn ExporterTemplate>,
    pub(crate) issuer: Arc<dyn CertIssuer>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: ControllerConfig,
    failures: Mutex<HashMap<String, u32>>,
}

impl ExportController {
    pub fn new(
        client: Arc<dyn ExportKubeClient>,
        caches: ExportCaches,
        template: Arc<dyn ExporterTemplate>,
        issuer: Arc<dyn CertIssuer>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            caches,
            template,
            issuer,
            clock,
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Converge one export. Returns the delay before the export should be
    /// looked at again; zero means "only on the next change".
    #[instrument(skip(self, export), fields(name = %export.name_any(), namespace = export.namespace()))]
    pub async fn reconcile_export(&self, export: &VirtualMachineExport) -> Result<Duration> {
        if export.metadata.deletion_timestamp.is_some() {
            return Ok(Duration::ZERO);
        }

        let Some(source) = classify_source(&export.spec.source) else {
            debug!(
                "Ignoring unsupported source {}/{:?}",
                export.spec.source.kind, export.spec.source.api_group
            );
            return Ok(Duration::ZERO);
        };

        let service = self.get_or_create_export_service(export).await?;
        let volumes = self.resolve_source(export, &source).await?;
        let pod = self.manage_exporter_pod(export, &volumes).await?;

        let status = self.compute_status(export, pod.as_ref(), &service, &volumes);
        self.write_status_if_changed(export, status).await?;

        match volumes.restore {
            Some(progress) if !progress.is_complete() => Ok(RESTORE_REQUEUE),
            _ => Ok(Duration::ZERO),
        }
    }

    fn record_failure(&self, key: &str) -> u32 {
        match self.failures.lock() {
            Ok(mut failures) => {
                let attempt = failures.entry(key.to_string()).or_insert(0);
                let current = *attempt;
                *attempt = attempt.saturating_add(1);
                current
            }
            Err(_) => 0,
        }
    }

    fn reset_failures(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }

    /// Drop counters of exports that are no longer in the cache. Deleted
    /// exports never reach a successful reconcile that would reset them.
    fn prune_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.retain(|key, _| {
                key.split_once('/')
                    .map(|(namespace, name)| {
                        self.caches.exports.get_by_key(namespace, name).is_some()
                    })
                    .unwrap_or(false)
            });
        }
    }
}

fn failure_key(export: &VirtualMachineExport) -> String {
    format!("{}/{}", export.namespace_or_default(), export.name_any())
}

/// Exponential backoff: base * 2^attempt, capped at max
pub fn calculate_backoff(
    attempt: u32,
    base_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
) -> Duration {
    let base = base_delay_secs.unwrap_or(1);
    let max = max_delay_secs.unwrap_or(300);

    let delay_secs = base.saturating_mul(2_u64.saturating_pow(attempt.min(5)));
    Duration::from_secs(delay_secs.min(max))
}

/// Reconcile entry point handed to the kube-runtime controller
pub(crate) async fn reconcile(
    export: Arc<VirtualMachineExport>,
    ctx: Arc<ExportController>,
) -> Result<Action> {
    let start = Instant::now();
    ctx.prune_failures();
    let result = ctx.reconcile_export(&export).await;

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(CONTROLLER_NAME, start.elapsed().as_secs_f64());
    #[cfg(not(feature = "metrics"))]
    let _ = start;

    let delay = result?;
    ctx.reset_failures(&failure_key(&export));

    if delay.is_zero() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(delay))
    }
}

/// Requeue failed exports with exponential backoff per export
pub(crate) fn error_policy(
    export: Arc<VirtualMachineExport>,
    error: &Error,
    ctx: Arc<ExportController>,
) -> Action {
    if error.is_retriable() {
        warn!(
            "Reconciliation error for {}/{}: {:?}",
            export.namespace_or_default(),
            export.name_any(),
            error
        );
    } else {
        error!(
            "Reconciliation error for {}/{}: {:?}",
            export.namespace_or_default(),
            export.name_any(),
            error
        );
    }

    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(CONTROLLER_NAME, error.metric_label());

    let attempt = ctx.record_failure(&failure_key(&export));
    Action::requeue(calculate_backoff(attempt, Some(1), Some(300)))
}

/// Watch `api` into `writer`, mapping every touched object to the exports
/// that depend on it.
fn spawn_watch<K, F>(
    api: Api<K>,
    writer: Writer<K>,
    queue: UnboundedSender<ExportKey>,
    map: F,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: Fn(&K) -> Vec<ExportKey> + Send + 'static,
{
    let mut stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .touched_objects()
        .boxed();

    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            match event {
                Ok(obj) => {
                    for key in map(&obj) {
                        debug!("Enqueuing export {} due to {}", key, obj.name_any());
                        if queue.unbounded_send(key).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("Watch error for {}: {}", K::kind(&()), e),
            }
        }
    });
}

/// Whether the cluster serves the OpenShift Route API
async fn route_api_available(client: &Client) -> bool {
    match client.list_api_groups().await {
        Ok(groups) => groups.groups.iter().any(|g| g.name == ROUTE_API_GROUP),
        Err(e) => {
            warn!("Failed to discover API groups: {}", e);
            false
        }
    }
}

async fn wait_for_caches(stores: Vec<(&'static str, Box<dyn ReadyWait>)>) -> Result<()> {
    for (kind, store) in stores {
        store.wait().await.map_err(|e| {
            Error::ConfigError(format!("{} cache stopped before syncing: {}", kind, e))
        })?;
        debug!("{} cache synced", kind);
    }
    Ok(())
}

/// Type-erased `Store::wait_until_ready`
trait ReadyWait: Send {
    fn wait(
        &self,
    ) -> futures::future::BoxFuture<'_, std::result::Result<(), reflector::store::WriterDropped>>;
}

impl<K> ReadyWait for Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn wait(
        &self,
    ) -> futures::future::BoxFuture<'_, std::result::Result<(), reflector::store::WriterDropped>>
    {
        Box::pin(self.wait_until_ready())
    }
}

/// Main entry point to start the controller
pub async fn run_controller(
    client: Client,
    config: ControllerConfig,
    template: Arc<dyn ExporterTemplate>,
    issuer: Arc<dyn CertIssuer>,
    ready: Arc<Mutex<bool>>,
) -> Result<()> {
    let exports: Api<VirtualMachineExport> = Api::all(client.clone());

    info!("Starting VirtualMachineExport controller");

    match exports.list(&Default::default()).await {
        Ok(_) => info!("VirtualMachineExport CRD is available"),
        Err(e) => {
            error!(
                "VirtualMachineExport CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "VirtualMachineExport CRD not installed".to_string(),
            ));
        }
    }

    let namespace = config.kubevirt_namespace.clone();
    let (export_reader, export_writer) = reflector::store::<VirtualMachineExport>();
    let (pod_reader, pod_writer) = reflector::store::<Pod>();
    let (service_reader, service_writer) = reflector::store::<Service>();
    let (pvc_reader, pvc_writer) = reflector::store::<PersistentVolumeClaim>();
    let (dv_reader, dv_writer) = reflector::store::<DataVolume>();
    let (vm_reader, vm_writer) = reflector::store::<VirtualMachine>();
    let (vmi_reader, vmi_writer) = reflector::store::<VirtualMachineInstance>();
    let (snapshot_reader, snapshot_writer) = reflector::store::<VirtualMachineSnapshot>();
    let (content_reader, content_writer) = reflector::store::<VirtualMachineSnapshotContent>();
    let (cm_reader, cm_writer) = reflector::store::<ConfigMap>();
    let (secret_reader, secret_writer) = reflector::store::<Secret>();
    let (ingress_reader, ingress_writer) = reflector::store::<Ingress>();

    let routes_served = route_api_available(&client).await;
    let (route_cache, route_reader) = if routes_served {
        let (reader, writer) = reflector::store::<Route>();
        let cache: Arc<dyn ObjectCache<Route>> = Arc::new(reader.clone());
        (cache, Some((reader, writer)))
    } else {
        info!("Route API not served, external access uses Ingresses only");
        let cache: Arc<dyn ObjectCache<Route>> = Arc::new(MemoryCache::<Route>::new());
        (cache, None)
    };

    let caches = ExportCaches {
        exports: Arc::new(export_reader.clone()),
        pods: Arc::new(pod_reader.clone()),
        services: Arc::new(service_reader.clone()),
        pvcs: Arc::new(pvc_reader.clone()),
        data_volumes: Arc::new(dv_reader.clone()),
        vms: Arc::new(vm_reader.clone()),
        vmis: Arc::new(vmi_reader.clone()),
        snapshots: Arc::new(snapshot_reader.clone()),
        snapshot_contents: Arc::new(content_reader.clone()),
        config_maps: Arc::new(cm_reader.clone()),
        secrets: Arc::new(secret_reader.clone()),
        ingresses: Arc::new(ingress_reader.clone()),
        routes: route_cache,
    };
    let index = DependencyIndex::new(caches.clone());
    let (queue, triggers) = mpsc::unbounded::<ExportKey>();

    spawn_watch(exports.clone(), export_writer, queue.clone(), |_| Vec::new());
    {
        let index = index.clone();
        spawn_watch(Api::all(client.clone()), pod_writer, queue.clone(), move |pod: &Pod| {
            index.exports_for_owned(pod)
        });
    }
    {
        let index = index.clone();
        spawn_watch(
            Api::all(client.clone()),
            service_writer,
            queue.clone(),
            move |service: &Service| index.exports_for_owned(service),
        );
    }
    {
        let index = index.clone();
        spawn_watch(
            Api::all(client.clone()),
            pvc_writer,
            queue.clone(),
            move |pvc: &PersistentVolumeClaim| index.exports_for_pvc(pvc),
        );
    }
    {
        let index = index.clone();
        spawn_watch(
            Api::all(client.clone()),
            snapshot_writer,
            queue.clone(),
            move |snapshot: &VirtualMachineSnapshot| index.exports_for_snapshot(snapshot),
        );
    }
    {
        let index = index.clone();
        spawn_watch(
            Api::all(client.clone()),
            vm_writer,
            queue.clone(),
            move |vm: &VirtualMachine| index.exports_for_vm(vm),
        );
    }
    {
        let index = index.clone();
        spawn_watch(
            Api::all(client.clone()),
            vmi_writer,
            queue.clone(),
            move |vmi: &VirtualMachineInstance| index.exports_for_vmi(vmi),
        );
    }
    spawn_watch(Api::all(client.clone()), dv_writer, queue.clone(), |_| Vec::new());
    spawn_watch(Api::all(client.clone()), content_writer, queue.clone(), |_| Vec::new());
    spawn_watch(Api::all(client.clone()), ingress_writer, queue.clone(), |_| Vec::new());
    spawn_watch(
        Api::namespaced(client.clone(), &namespace),
        cm_writer,
        queue.clone(),
        |_| Vec::new(),
    );
    spawn_watch(
        Api::namespaced(client.clone(), &namespace),
        secret_writer,
        queue.clone(),
        |_| Vec::new(),
    );

    let mut stores: Vec<(&'static str, Box<dyn ReadyWait>)> = vec![
        ("VirtualMachineExport", Box::new(export_reader)),
        ("Pod", Box::new(pod_reader)),
        ("Service", Box::new(service_reader)),
        ("PersistentVolumeClaim", Box::new(pvc_reader)),
        ("DataVolume", Box::new(dv_reader)),
        ("VirtualMachine", Box::new(vm_reader)),
        ("VirtualMachineInstance", Box::new(vmi_reader)),
        ("VirtualMachineSnapshot", Box::new(snapshot_reader)),
        ("VirtualMachineSnapshotContent", Box::new(content_reader)),
        ("ConfigMap", Box::new(cm_reader)),
        ("Secret", Box::new(secret_reader)),
        ("Ingress", Box::new(ingress_reader)),
    ];
    if let Some((reader, writer)) = route_reader {
        spawn_watch(Api::all(client.clone()), writer, queue.clone(), |_| Vec::new());
        stores.push(("Route", Box::new(reader)));
    }

    info!("Waiting for caches to sync");
    tokio::time::timeout(config.cache_sync_timeout, wait_for_caches(stores))
        .await
        .map_err(|_| {
            Error::ConfigError(format!(
                "caches did not sync within {}s",
                config.cache_sync_timeout.as_secs()
            ))
        })??;
    info!("Caches synced");

    if let Ok(mut flag) = ready.lock() {
        *flag = true;
    }

    let threadiness = config.threadiness;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let kube_client: Arc<dyn ExportKubeClient> =
        Arc::new(ExportKubeClientImpl::new(client.clone(), clock.clone()));
    let ctx = Arc::new(ExportController::new(
        kube_client,
        caches,
        template,
        issuer,
        clock,
        config,
    ));

    Controller::new(exports, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(threadiness))
        .reconcile_on(triggers)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled: {}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    info!("VirtualMachineExport controller stopped");
    Ok(())
}
