//! Shared fixtures for controller unit tests

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimStatus, Pod, Secret, Service,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
};

use crate::controller::cache::{ExportCaches, MemoryCache};
use crate::controller::certs::{CertIssuer, IssuedCert};
use crate::controller::client::{Clock, ExportKubeClient};
use crate::controller::reconciler::{ControllerConfig, ExportController};
use crate::controller::resources::DefaultExporterTemplate;
use crate::crd::kubevirt::{
    DataVolumeSource, DataVolumeSpec, DataVolumeStatus, PersistentVolumeClaimVolumeSource, RouteIngress, RouteSpec, RouteStatus,
    RouteTargetReference, VirtualMachineInstanceSpec, VirtualMachineInstanceSpecView,
    VirtualMachineInstanceTemplateSpec, VirtualMachineSpec, Volume,
};
use crate::crd::{
    DataVolume, Route, SourceReference, VirtualMachine, VirtualMachineExport,
    VirtualMachineExportSpec, VirtualMachineInstance, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent,
};
use crate::error::{Error, Result};

pub const TEST_NAMESPACE: &str = "default";
pub const TEST_IMAGE: &str = "quay.io/kubevirt/virt-exportserver:test";

pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("fake {}", reason),
        reason: reason.to_string(),
        code,
    }))
}

// ============================================================================
// Fake client
// ============================================================================

/// One write issued through the fake client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    CreatePod(String),
    DeletePod(String),
    CreateService(String),
    CreateSecret(String),
    CreatePvc(String),
    UpdateStatus(String),
    Event { type_: String, reason: String },
}

/// Records every write. Kinds listed in `already_exists` answer creates with
/// a 409; `delete_not_found` makes deletes answer 404.
#[derive(Default)]
pub struct FakeClient {
    calls: Mutex<Vec<Call>>,
    pods: Mutex<Vec<Pod>>,
    secrets: Mutex<Vec<Secret>>,
    pvcs: Mutex<Vec<PersistentVolumeClaim>>,
    statuses: Mutex<Vec<VirtualMachineExport>>,
    event_messages: Mutex<Vec<String>>,
    already_exists: Mutex<HashSet<&'static str>>,
    delete_not_found: Mutex<bool>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make creates of `kind` ("pod", "service", "secret", "pvc") fail with
    /// AlreadyExists
    pub fn fail_create_with_already_exists(&self, kind: &'static str) {
        self.already_exists.lock().unwrap().insert(kind);
    }

    pub fn fail_delete_with_not_found(&self) {
        *self.delete_not_found.lock().unwrap() = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Writes other than events
    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Event { .. }))
            .collect()
    }

    pub fn created_pods(&self) -> Vec<Pod> {
        self.pods.lock().unwrap().clone()
    }

    pub fn created_secrets(&self) -> Vec<Secret> {
        self.secrets.lock().unwrap().clone()
    }

    pub fn created_pvcs(&self) -> Vec<PersistentVolumeClaim> {
        self.pvcs.lock().unwrap().clone()
    }

    /// Exports passed to status updates, in order
    pub fn status_updates(&self) -> Vec<VirtualMachineExport> {
        self.statuses.lock().unwrap().clone()
    }

    /// (type, reason) of every recorded event
    pub fn events(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Event { type_, reason } => Some((type_, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn event_messages(&self) -> Vec<String> {
        self.event_messages.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn create_result(&self, kind: &'static str) -> Result<()> {
        if self.already_exists.lock().unwrap().contains(kind) {
            Err(api_error(409, "AlreadyExists"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ExportKubeClient for FakeClient {
    async fn create_pod(&self, _namespace: &str, pod: &Pod) -> Result<Pod> {
        self.record(Call::CreatePod(pod.name_any()));
        self.create_result("pod")?;
        self.pods.lock().unwrap().push(pod.clone());
        Ok(pod.clone())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<()> {
        self.record(Call::DeletePod(name.to_string()));
        if *self.delete_not_found.lock().unwrap() {
            return Err(api_error(404, "NotFound"));
        }
        Ok(())
    }

    async fn create_service(&self, _namespace: &str, service: &Service) -> Result<Service> {
        self.record(Call::CreateService(service.name_any()));
        self.create_result("service")?;
        Ok(service.clone())
    }

    async fn create_secret(&self, _namespace: &str, secret: &Secret) -> Result<Secret> {
        self.record(Call::CreateSecret(secret.name_any()));
        self.create_result("secret")?;
        self.secrets.lock().unwrap().push(secret.clone());
        Ok(secret.clone())
    }

    async fn create_pvc(
        &self,
        _namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        self.record(Call::CreatePvc(pvc.name_any()));
        self.create_result("pvc")?;
        self.pvcs.lock().unwrap().push(pvc.clone());
        Ok(pvc.clone())
    }

    async fn update_export_status(&self, export: &VirtualMachineExport) -> Result<()> {
        self.record(Call::UpdateStatus(export.name_any()));
        self.statuses.lock().unwrap().push(export.clone());
        Ok(())
    }

    async fn record_event(
        &self,
        _export: &VirtualMachineExport,
        event_type: &str,
        reason: &str,
        message: &str,
    ) {
        self.record(Call::Event {
            type_: event_type.to_string(),
            reason: reason.to_string(),
        });
        self.event_messages.lock().unwrap().push(message.to_string());
    }
}

/// Issuer handing out fixed PEM strings
#[derive(Default)]
pub struct FakeIssuer {
    pub issued: Mutex<Vec<(String, Vec<String>)>>,
}

impl CertIssuer for FakeIssuer {
    fn issue_server_cert(
        &self,
        common_name: &str,
        dns_names: &[String],
        _not_before: DateTime<Utc>,
        _validity: Duration,
    ) -> Result<IssuedCert> {
        self.issued
            .lock()
            .unwrap()
            .push((common_name.to_string(), dns_names.to_vec()));
        Ok(IssuedCert {
            cert_pem: "fake-cert".to_string(),
            key_pem: "fake-key".to_string(),
        })
    }
}

// ============================================================================
// Controller harness
// ============================================================================

/// Typed handles on the in-memory caches a test controller reads from
pub struct TestCaches {
    pub exports: Arc<MemoryCache<VirtualMachineExport>>,
    pub pods: Arc<MemoryCache<Pod>>,
    pub services: Arc<MemoryCache<Service>>,
    pub pvcs: Arc<MemoryCache<PersistentVolumeClaim>>,
    pub data_volumes: Arc<MemoryCache<DataVolume>>,
    pub vms: Arc<MemoryCache<VirtualMachine>>,
    pub vmis: Arc<MemoryCache<VirtualMachineInstance>>,
    pub snapshots: Arc<MemoryCache<VirtualMachineSnapshot>>,
    pub snapshot_contents: Arc<MemoryCache<VirtualMachineSnapshotContent>>,
    pub config_maps: Arc<MemoryCache<ConfigMap>>,
    pub secrets: Arc<MemoryCache<Secret>>,
    pub ingresses: Arc<MemoryCache<Ingress>>,
    pub routes: Arc<MemoryCache<Route>>,
}

impl TestCaches {
    fn new() -> Self {
        Self {
            exports: Arc::new(MemoryCache::new()),
            pods: Arc::new(MemoryCache::new()),
            services: Arc::new(MemoryCache::new()),
            pvcs: Arc::new(MemoryCache::new()),
            data_volumes: Arc::new(MemoryCache::new()),
            vms: Arc::new(MemoryCache::new()),
            vmis: Arc::new(MemoryCache::new()),
            snapshots: Arc::new(MemoryCache::new()),
            snapshot_contents: Arc::new(MemoryCache::new()),
            config_maps: Arc::new(MemoryCache::new()),
            secrets: Arc::new(MemoryCache::new()),
            ingresses: Arc::new(MemoryCache::new()),
            routes: Arc::new(MemoryCache::new()),
        }
    }

    fn export_caches(&self) -> ExportCaches {
        ExportCaches {
            exports: self.exports.clone(),
            pods: self.pods.clone(),
            services: self.services.clone(),
            pvcs: self.pvcs.clone(),
            data_volumes: self.data_volumes.clone(),
            vms: self.vms.clone(),
            vmis: self.vmis.clone(),
            snapshots: self.snapshots.clone(),
            snapshot_contents: self.snapshot_contents.clone(),
            config_maps: self.config_maps.clone(),
            secrets: self.secrets.clone(),
            ingresses: self.ingresses.clone(),
            routes: self.routes.clone(),
        }
    }
}

/// Export controller wired to in-memory caches, a fake client, a fake
/// issuer and a fixed clock
pub struct TestHarness {
    pub caches: TestCaches,
    pub client: Arc<FakeClient>,
    pub issuer: Arc<FakeIssuer>,
    pub controller: ExportController,
}

impl TestHarness {
    pub fn new() -> Self {
        let caches = TestCaches::new();
        let client = Arc::new(FakeClient::new());
        let issuer = Arc::new(FakeIssuer::default());
        let controller = ExportController::new(
            client.clone(),
            caches.export_caches(),
            Arc::new(DefaultExporterTemplate::new(TEST_IMAGE, "IfNotPresent")),
            issuer.clone(),
            Arc::new(FixedClock(fixed_time())),
            ControllerConfig::default(),
        );
        Self {
            caches,
            client,
            issuer,
            controller,
        }
    }
}

// ============================================================================
// Certificates
// ============================================================================

/// Self-signed CA named "export-ca", as (cert PEM, key PEM)
pub fn generate_test_ca() -> (String, String) {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, "export-ca");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// Self-signed certificate PEM with the given common name and DNS SANs
pub fn generate_cert_pem(common_name: &str, dns_names: &[&str]) -> String {
    let sans: Vec<String> = dns_names.iter().map(|s| s.to_string()).collect();
    let mut params = CertificateParams::new(sans).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let key = KeyPair::generate().unwrap();
    params.self_signed(&key).unwrap().pem()
}

// ============================================================================
// Object builders
// ============================================================================

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(TEST_NAMESPACE.to_string()),
        uid: Some(format!("uid-{}", name)),
        ..Default::default()
    }
}

pub fn export_for(name: &str, source: SourceReference) -> VirtualMachineExport {
    let mut export = VirtualMachineExport::new(
        name,
        VirtualMachineExportSpec {
            source,
            token_secret_ref: "token".to_string(),
        },
    );
    export.metadata = meta(name);
    export
}

pub fn pvc_export(name: &str, pvc: &str) -> VirtualMachineExport {
    export_for(
        name,
        SourceReference {
            api_group: Some(String::new()),
            kind: "PersistentVolumeClaim".to_string(),
            name: pvc.to_string(),
        },
    )
}

pub fn vm_export(name: &str, vm: &str) -> VirtualMachineExport {
    export_for(
        name,
        SourceReference {
            api_group: Some("kubevirt.io".to_string()),
            kind: "VirtualMachine".to_string(),
            name: vm.to_string(),
        },
    )
}

pub fn snapshot_export(name: &str, snapshot: &str) -> VirtualMachineExport {
    export_for(
        name,
        SourceReference {
            api_group: Some("snapshot.kubevirt.io".to_string()),
            kind: "VirtualMachineSnapshot".to_string(),
            name: snapshot.to_string(),
        },
    )
}

pub fn pvc(name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: meta(name),
        ..Default::default()
    }
}

pub fn pvc_with_phase(name: &str, phase: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        status: Some(PersistentVolumeClaimStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..pvc(name)
    }
}

/// Claim controlled by the CDI DataVolume of the same name
pub fn dv_owned_pvc(name: &str) -> PersistentVolumeClaim {
    let mut claim = pvc_with_phase(name, "Bound");
    claim.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "cdi.kubevirt.io/v1beta1".to_string(),
        kind: "DataVolume".to_string(),
        name: name.to_string(),
        uid: format!("uid-dv-{}", name),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    claim
}

/// CDI DataVolume reporting `phase`
pub fn data_volume(name: &str, phase: &str) -> DataVolume {
    let mut dv = DataVolume::new(name, DataVolumeSpec { content_type: None });
    dv.metadata = meta(name);
    dv.status = Some(DataVolumeStatus {
        phase: Some(phase.to_string()),
    });
    dv
}

fn claim_volumes(claims: &[&str]) -> Vec<Volume> {
    claims
        .iter()
        .enumerate()
        .map(|(i, claim)| {
            if i % 2 == 0 {
                Volume {
                    name: format!("volume{}", i),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.to_string(),
                    }),
                    data_volume: None,
                }
            } else {
                Volume {
                    name: format!("volume{}", i),
                    persistent_volume_claim: None,
                    data_volume: Some(DataVolumeSource {
                        name: claim.to_string(),
                    }),
                }
            }
        })
        .collect()
}

/// VM whose template mounts `claims`, alternating claim and DataVolume
/// volumes
pub fn vm(name: &str, claims: &[&str]) -> VirtualMachine {
    let mut vm = VirtualMachine::new(
        name,
        VirtualMachineSpec {
            template: Some(VirtualMachineInstanceTemplateSpec {
                spec: Some(VirtualMachineInstanceSpecView {
                    volumes: claim_volumes(claims),
                }),
            }),
        },
    );
    vm.metadata = meta(name);
    vm
}

pub fn vmi(name: &str, owner_vm: Option<&str>, claims: &[&str]) -> VirtualMachineInstance {
    let mut vmi = VirtualMachineInstance::new(
        name,
        VirtualMachineInstanceSpec {
            volumes: claim_volumes(claims),
        },
    );
    vmi.metadata = meta(name);
    if let Some(owner) = owner_vm {
        vmi.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "kubevirt.io/v1".to_string(),
            kind: "VirtualMachine".to_string(),
            name: owner.to_string(),
            uid: format!("uid-{}", owner),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]);
    }
    vmi
}

fn service_backend(service: &str) -> IngressBackend {
    IngressBackend {
        service: Some(IngressServiceBackend {
            name: service.to_string(),
            port: None,
        }),
        resource: None,
    }
}

/// Ingress whose default backend targets `service`, with one rule for
/// `host` when given
pub fn ingress_default_backend(service: &str, host: Option<&str>) -> Ingress {
    let rules = host.map(|h| {
        vec![IngressRule {
            host: Some(h.to_string()),
            http: None,
        }]
    });
    Ingress {
        metadata: meta("default-backend-ingress"),
        spec: Some(IngressSpec {
            default_backend: Some(service_backend(service)),
            rules,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ingress with a single rule routing `host` to `service`
pub fn ingress_rules(service: &str, host: &str) -> Ingress {
    Ingress {
        metadata: meta("rules-ingress"),
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        backend: service_backend(service),
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `ingress` with one TLS entry per name in `secret_names`
pub fn with_tls(mut ingress: Ingress, secret_names: &[&str]) -> Ingress {
    let tls = secret_names
        .iter()
        .map(|name| IngressTLS {
            hosts: None,
            secret_name: Some(name.to_string()),
        })
        .collect();
    if let Some(spec) = ingress.spec.as_mut() {
        spec.tls = Some(tls);
    }
    ingress
}

/// TLS secret in `namespace` whose `tls.crt` holds `cert_pem`
pub fn tls_secret(namespace: &str, name: &str, cert_pem: &str) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(
        "tls.crt".to_string(),
        ByteString(cert_pem.as_bytes().to_vec()),
    );
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Route targeting `service`, admitted under `host` when given
pub fn route_to(service: &str, host: Option<&str>) -> Route {
    let mut route = Route::new(
        "export-route",
        RouteSpec {
            host: host.map(str::to_string),
            to: RouteTargetReference {
                kind: "Service".to_string(),
                name: service.to_string(),
            },
        },
    );
    route.metadata = meta("export-route");
    route.status = Some(RouteStatus {
        ingress: host
            .map(|h| {
                vec![RouteIngress {
                    host: h.to_string(),
                }]
            })
            .unwrap_or_default(),
    });
    route
}

pub fn config_map(name: &str, key: &str, value: &str) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(key.to_string(), value.to_string());
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ControllerConfig::default().kubevirt_namespace),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}
