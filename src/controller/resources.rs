//! Kubernetes resource builders for VirtualMachineExport
//!
//! Deterministic naming, download URIs, volume classification and the
//! manifests of the objects the controller creates (exporter Pod, Service,
//! certificate Secret and snapshot restore claims).

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext,
    PodSpec, Probe, Secret, SecretVolumeSource, Service, ServicePort, ServiceSpec,
    TypedLocalObjectReference, Volume, VolumeDevice, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::controller::cache::ObjectCache;
use crate::controller::certs::IssuedCert;
use crate::crd::kubevirt::{VolumeBackup, CDI_API_VERSION, VOLUME_SNAPSHOT_API_GROUP};
use crate::crd::{DataVolume, VirtualMachineExport};

pub const EXPORT_PREFIX: &str = "virt-export";
pub const EXPORT_SERVICE_LABEL: &str = "kubevirt.io.virt-export-service";
pub const APP_LABEL: &str = "kubevirt.io";
pub const APP_LABEL_VALUE: &str = "virt-exporter";

pub const BLOCK_VOLUME_MOUNT_PATH: &str = "/dev/export-volumes";
pub const FILE_SYSTEM_MOUNT_PATH: &str = "/export-volumes";
pub const URL_BASE_PATH: &str = "/volumes";

/// Annotation CDI sets on a claim to describe its content
pub const ANN_CONTENT_TYPE: &str = "cdi.kubevirt.io/storage.contentType";
pub const CONTENT_TYPE_KUBEVIRT: &str = "kubevirt";

/// Name of the certificate secret volume in the exporter pod
pub const CERTIFICATES_VOLUME: &str = "certificates";
pub const CERT_MOUNT_PATH: &str = "/cert";
pub const TOKEN_MOUNT_PATH: &str = "/token";

pub const EXPORTER_CONTAINER_NAME: &str = "exporter";
pub const EXPORTER_PORT: i32 = 8443;
pub const SERVICE_PORT: i32 = 443;

/// Group of the kvm user the exporter runs as
const KVM_GROUP: i64 = 107;

/// How long an exporter serves before shutting itself down
const EXPORT_DEADLINE_HOURS: i64 = 24;

const DNS1035_LABEL_MAX_LENGTH: usize = 63;
const NAME_HASH_LENGTH: usize = 8;

const SECRET_NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const SECRET_NAME_RANDOM_LENGTH: usize = 10;

// ============================================================================
// Naming
// ============================================================================

/// Deterministic name shared by the exporter pod and service of an export.
///
/// Names that would exceed a DNS-1035 label are cut and suffixed with a
/// hash of the full name so distinct exports never collide.
pub fn export_resource_name(export_name: &str) -> String {
    let name = format!("{}-{}", EXPORT_PREFIX, export_name);
    if name.len() <= DNS1035_LABEL_MAX_LENGTH {
        return name;
    }

    let digest = Sha256::digest(name.as_bytes());
    let hash: String = digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
        .chars()
        .take(NAME_HASH_LENGTH)
        .collect();

    let keep = DNS1035_LABEL_MAX_LENGTH - NAME_HASH_LENGTH - 1;
    let prefix: String = name.chars().take(keep).collect();
    format!("{}-{}", prefix.trim_end_matches('-'), hash)
}

pub fn export_pod_name(export: &VirtualMachineExport) -> String {
    export_resource_name(&export.name_any())
}

pub fn export_service_name(export: &VirtualMachineExport) -> String {
    export_resource_name(&export.name_any())
}

/// In-cluster DNS name of a service
pub fn service_host(service_name: &str, namespace: &str) -> String {
    format!("{}.{}.svc", service_name, namespace)
}

/// Fresh name for an exporter certificate secret
pub fn random_secret_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SECRET_NAME_RANDOM_LENGTH)
        .map(|_| SECRET_NAME_ALPHABET[rng.gen_range(0..SECRET_NAME_ALPHABET.len())] as char)
        .collect();
    format!("secret-{}", suffix)
}

/// Name of the claim a snapshot volume backup is restored into
pub fn restore_pvc_name(export: &VirtualMachineExport, backup_claim_name: &str) -> String {
    format!("{}-{}", export.name_any(), backup_claim_name)
}

// ============================================================================
// Owner references
// ============================================================================

/// Create an OwnerReference pointing at the export for garbage collection
pub fn owner_reference(export: &VirtualMachineExport) -> OwnerReference {
    OwnerReference {
        api_version: VirtualMachineExport::api_version(&()).to_string(),
        kind: VirtualMachineExport::kind(&()).to_string(),
        name: export.name_any(),
        uid: export.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// OwnerReference tying a certificate secret to its exporter pod
pub fn pod_owner_reference(pod: &Pod) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        name: pod.name_any(),
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// The owner reference marked as controller, if any
pub fn controller_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

// ============================================================================
// Volume URIs and classification
// ============================================================================

pub fn raw_uri(volume: &str) -> String {
    format!("{}/{}/disk.img", URL_BASE_PATH, volume)
}

pub fn raw_gzip_uri(volume: &str) -> String {
    format!("{}/{}/disk.img.gz", URL_BASE_PATH, volume)
}

pub fn archive_uri(volume: &str) -> String {
    format!("{}/{}/disk.tar.gz", URL_BASE_PATH, volume)
}

pub fn dir_uri(volume: &str) -> String {
    format!("{}/{}/dir/", URL_BASE_PATH, volume)
}

pub fn is_block(pvc: &PersistentVolumeClaim) -> bool {
    pvc.spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        == Some("Block")
}

fn is_kubevirt_content(content_type: Option<&str>) -> bool {
    matches!(content_type, None | Some("") | Some(CONTENT_TYPE_KUBEVIRT))
}

/// Whether a claim holds a disk image (served raw/gzip) rather than a
/// filesystem (served as a directory and a tarball).
///
/// Block claims are always disks. A filesystem claim annotated as kubevirt
/// content is a disk; otherwise the content type of a controlling
/// DataVolume decides. Claims with neither an annotation nor a resolvable
/// DataVolume default to disk.
pub fn is_kubevirt_content_type(
    pvc: &PersistentVolumeClaim,
    data_volumes: &dyn ObjectCache<DataVolume>,
) -> bool {
    if is_block(pvc) {
        return true;
    }

    let annotation = pvc.annotations().get(ANN_CONTENT_TYPE).map(String::as_str);
    if matches!(annotation, Some("") | Some(CONTENT_TYPE_KUBEVIRT)) {
        return true;
    }

    match controller_owner(&pvc.metadata) {
        Some(owner) if owner.kind == "DataVolume" && owner.api_version == CDI_API_VERSION => {
            let namespace = pvc.namespace().unwrap_or_default();
            match data_volumes.get_by_key(&namespace, &owner.name) {
                Some(dv) => is_kubevirt_content(dv.spec.content_type.as_deref()),
                None => true,
            }
        }
        _ => annotation.is_none(),
    }
}

// ============================================================================
// Service
// ============================================================================

/// Service fronting the exporter pod of an export
pub fn build_service(export: &VirtualMachineExport) -> Service {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), APP_LABEL_VALUE.to_string());

    let mut selector = BTreeMap::new();
    selector.insert(EXPORT_SERVICE_LABEL.to_string(), export.name_any());

    Service {
        metadata: ObjectMeta {
            name: Some(export_service_name(export)),
            namespace: Some(export.namespace_or_default()),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(export)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                protocol: Some("TCP".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(EXPORTER_PORT)),
                ..Default::default()
            }]),
            selector: Some(selector),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ============================================================================
// Exporter pod
// ============================================================================

/// Renders the base shape of the exporter pod
pub trait ExporterTemplate: Send + Sync {
    fn render_exporter_manifest(&self, export: &VirtualMachineExport, name: &str) -> Pod;
}

/// Single container pod running the exporter image
#[derive(Clone, Debug)]
pub struct DefaultExporterTemplate {
    pub image: String,
    pub pull_policy: String,
}

impl DefaultExporterTemplate {
    pub fn new(image: impl Into<String>, pull_policy: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            pull_policy: pull_policy.into(),
        }
    }
}

impl ExporterTemplate for DefaultExporterTemplate {
    fn render_exporter_manifest(&self, export: &VirtualMachineExport, name: &str) -> Pod {
        let container = Container {
            name: EXPORTER_CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            image_pull_policy: Some(self.pull_policy.clone()),
            ports: Some(vec![ContainerPort {
                name: Some("export".to_string()),
                container_port: EXPORTER_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/readyz".to_string()),
                    port: IntOrString::Int(EXPORTER_PORT),
                    scheme: Some("HTTPS".to_string()),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(5),
                period_seconds: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(export.namespace_or_default()),
                owner_references: Some(vec![owner_reference(export)]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![container],
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn env(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Environment describing where one volume is mounted and which URIs serve it
fn volume_env(index: usize, volume: &str, mount_point: &str, is_disk: bool) -> Vec<EnvVar> {
    let mut vars = vec![env(format!("VOLUME{}_EXPORT_PATH", index), mount_point)];
    if is_disk {
        vars.push(env(format!("VOLUME{}_EXPORT_RAW_URI", index), raw_uri(volume)));
        vars.push(env(
            format!("VOLUME{}_EXPORT_RAW_GZIP_URI", index),
            raw_gzip_uri(volume),
        ));
    } else {
        vars.push(env(
            format!("VOLUME{}_EXPORT_ARCHIVE_URI", index),
            archive_uri(volume),
        ));
        vars.push(env(format!("VOLUME{}_EXPORT_DIR_URI", index), dir_uri(volume)));
    }
    vars
}

/// Complete exporter pod for `pvcs`.
///
/// `is_disk` classifies each claim, `secret_name` names the certificate
/// secret the pod will mount and `now` anchors the exporter deadline.
pub fn build_exporter_pod(
    template: &dyn ExporterTemplate,
    export: &VirtualMachineExport,
    pvcs: &[PersistentVolumeClaim],
    is_disk: impl Fn(&PersistentVolumeClaim) -> bool,
    secret_name: &str,
    now: DateTime<Utc>,
) -> Pod {
    let mut pod = template.render_exporter_manifest(export, &export_pod_name(export));

    let mut labels = BTreeMap::new();
    labels.insert(EXPORT_SERVICE_LABEL.to_string(), export.name_any());
    pod.metadata.labels = Some(labels);

    let spec = pod.spec.get_or_insert_with(PodSpec::default);
    spec.security_context = Some(PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_group: Some(KVM_GROUP),
        fs_group: Some(KVM_GROUP),
        ..Default::default()
    });
    if spec.containers.is_empty() {
        spec.containers.push(Container {
            name: EXPORTER_CONTAINER_NAME.to_string(),
            ..Default::default()
        });
    }

    let mut volumes = spec.volumes.take().unwrap_or_default();
    let container = &mut spec.containers[0];
    let mut mounts = container.volume_mounts.take().unwrap_or_default();
    let mut devices = container.volume_devices.take().unwrap_or_default();
    let mut env_vars = container.env.take().unwrap_or_default();

    for (index, pvc) in pvcs.iter().enumerate() {
        let claim = pvc.name_any();
        let mount_point = if is_block(pvc) {
            let path = format!("{}/{}", BLOCK_VOLUME_MOUNT_PATH, claim);
            devices.push(VolumeDevice {
                name: claim.clone(),
                device_path: path.clone(),
            });
            path
        } else {
            let path = format!("{}/{}", FILE_SYSTEM_MOUNT_PATH, claim);
            mounts.push(VolumeMount {
                name: claim.clone(),
                mount_path: path.clone(),
                read_only: Some(true),
                ..Default::default()
            });
            path
        };

        volumes.push(Volume {
            name: claim.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.clone(),
                read_only: None,
            }),
            ..Default::default()
        });
        env_vars.extend(volume_env(index, &claim, &mount_point, is_disk(pvc)));
    }

    let deadline = now + chrono::Duration::hours(EXPORT_DEADLINE_HOURS);
    env_vars.push(env("CERT_FILE", "/cert/tls.crt"));
    env_vars.push(env("KEY_FILE", "/cert/tls.key"));
    env_vars.push(env("TOKEN_FILE", "/token/token"));
    env_vars.push(env(
        "DEADLINE",
        deadline.to_rfc3339_opts(SecondsFormat::Secs, true),
    ));

    let token_secret = export.spec.token_secret_ref.as_str();
    volumes.push(secret_volume(CERTIFICATES_VOLUME, secret_name));
    volumes.push(secret_volume(token_secret, token_secret));
    mounts.push(VolumeMount {
        name: CERTIFICATES_VOLUME.to_string(),
        mount_path: CERT_MOUNT_PATH.to_string(),
        ..Default::default()
    });
    mounts.push(VolumeMount {
        name: token_secret.to_string(),
        mount_path: TOKEN_MOUNT_PATH.to_string(),
        ..Default::default()
    });

    container.env = Some(env_vars);
    container.volume_mounts = Some(mounts);
    if !devices.is_empty() {
        container.volume_devices = Some(devices);
    }
    spec.volumes = Some(volumes);

    pod
}

/// Name of the certificate secret an exporter pod expects to mount
pub fn cert_secret_name(pod: &Pod) -> Option<String> {
    pod.spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .find(|v| v.name == CERTIFICATES_VOLUME)
        .and_then(|v| v.secret.as_ref())
        .and_then(|s| s.secret_name.clone())
}

/// Phase reported by a pod; a pod without one is treated as Pending
pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending")
}

// ============================================================================
// Certificate secret
// ============================================================================

/// TLS secret holding an exporter pod's server certificate
pub fn build_cert_secret(
    export: &VirtualMachineExport,
    owner_pod: &Pod,
    secret_name: &str,
    issued: &IssuedCert,
) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(
        "tls.crt".to_string(),
        ByteString(issued.cert_pem.clone().into_bytes()),
    );
    data.insert(
        "tls.key".to_string(),
        ByteString(issued.key_pem.clone().into_bytes()),
    );

    Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: Some(export.namespace_or_default()),
            owner_references: Some(vec![pod_owner_reference(owner_pod)]),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

// ============================================================================
// Snapshot restore claims
// ============================================================================

/// Claim restoring one snapshot volume backup, owned by the export
pub fn build_restore_pvc(
    export: &VirtualMachineExport,
    backup: &VolumeBackup,
    volume_snapshot_name: &str,
) -> PersistentVolumeClaim {
    let source = &backup.persistent_volume_claim;
    let backup_name = source.metadata.name.clone().unwrap_or_default();

    let mut spec: PersistentVolumeClaimSpec = source.spec.clone();
    spec.volume_name = None;
    spec.data_source = Some(TypedLocalObjectReference {
        api_group: Some(VOLUME_SNAPSHOT_API_GROUP.to_string()),
        kind: "VolumeSnapshot".to_string(),
        name: volume_snapshot_name.to_string(),
    });
    spec.data_source_ref = None;

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(restore_pvc_name(export, &backup_name)),
            namespace: Some(export.namespace_or_default()),
            annotations: source.metadata.annotations.clone(),
            labels: source.metadata.labels.clone(),
            owner_references: Some(vec![owner_reference(export)]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}
