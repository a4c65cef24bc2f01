//! Read-only views of the foreign kinds the export controller watches
//!
//! Only the fields the controller inspects are modelled; everything else in
//! the upstream objects is ignored on deserialization. Schemas are disabled
//! because these CRDs are installed and owned by other components.

use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

pub const KUBEVIRT_API_GROUP: &str = "kubevirt.io";
pub const SNAPSHOT_API_GROUP: &str = "snapshot.kubevirt.io";
pub const CDI_API_GROUP: &str = "cdi.kubevirt.io";
pub const CDI_API_VERSION: &str = "cdi.kubevirt.io/v1beta1";
pub const VOLUME_SNAPSHOT_API_GROUP: &str = "snapshot.storage.k8s.io";

/// Volume entry of a VM template or a VMI spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeSource>,
}

impl Volume {
    /// Name of the claim backing this volume, if it is claim backed
    pub fn claim_name(&self) -> Option<&str> {
        if let Some(pvc) = &self.persistent_volume_claim {
            return Some(pvc.claim_name.as_str());
        }
        self.data_volume.as_ref().map(|dv| dv.name.as_str())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimVolumeSource {
    pub claim_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct DataVolumeSource {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct VirtualMachineInstanceSpecView {
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct VirtualMachineInstanceTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<VirtualMachineInstanceSpecView>,
}

// ============================================================================
// VirtualMachine
// ============================================================================

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    namespaced,
    schema = "disabled"
)]
pub struct VirtualMachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<VirtualMachineInstanceTemplateSpec>,
}

impl VirtualMachine {
    /// Volumes declared in the VM template
    pub fn template_volumes(&self) -> &[Volume] {
        self.spec
            .template
            .as_ref()
            .and_then(|t| t.spec.as_ref())
            .map(|s| s.volumes.as_slice())
            .unwrap_or_default()
    }
}

// ============================================================================
// VirtualMachineInstance
// ============================================================================

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    namespaced,
    status = "VirtualMachineInstanceStatus",
    schema = "disabled"
)]
pub struct VirtualMachineInstanceSpec {
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct VirtualMachineInstanceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl VirtualMachineInstance {
    /// Succeeded and Failed instances no longer hold their volumes
    pub fn is_final(&self) -> bool {
        matches!(
            self.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("Succeeded") | Some("Failed")
        )
    }

    /// Claim names referenced by the instance's volumes
    pub fn claim_names(&self) -> impl Iterator<Item = &str> {
        self.spec.volumes.iter().filter_map(Volume::claim_name)
    }
}

// ============================================================================
// VirtualMachineSnapshot / VirtualMachineSnapshotContent
// ============================================================================

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "snapshot.kubevirt.io",
    version = "v1alpha1",
    kind = "VirtualMachineSnapshot",
    namespaced,
    status = "VirtualMachineSnapshotStatus",
    schema = "disabled"
)]
pub struct VirtualMachineSnapshotSpec {
    #[serde(default)]
    pub source: super::SourceReference,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_content_name: Option<String>,
}

impl VirtualMachineSnapshot {
    pub fn is_ready_to_use(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "snapshot.kubevirt.io",
    version = "v1alpha1",
    kind = "VirtualMachineSnapshotContent",
    namespaced,
    status = "VirtualMachineSnapshotContentStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_name: Option<String>,
    #[serde(default)]
    pub volume_backups: Vec<VolumeBackup>,
}

/// Backed-up claim and the VolumeSnapshot holding its data
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackup {
    pub volume_name: String,
    pub persistent_volume_claim: PersistentVolumeClaimTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PersistentVolumeClaimTemplate {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
}

// ============================================================================
// DataVolume
// ============================================================================

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "cdi.kubevirt.io",
    version = "v1beta1",
    kind = "DataVolume",
    namespaced,
    status = "DataVolumeStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    /// "kubevirt" (or empty) for disk images, "archive" for filesystem content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DataVolumeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl DataVolume {
    pub fn is_succeeded(&self) -> bool {
        self.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Succeeded")
    }
}

// ============================================================================
// OpenShift Route
// ============================================================================

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "route.openshift.io",
    version = "v1",
    kind = "Route",
    namespaced,
    status = "RouteStatus",
    schema = "disabled"
)]
pub struct RouteSpec {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub to: RouteTargetReference,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RouteTargetReference {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RouteStatus {
    #[serde(default)]
    pub ingress: Vec<RouteIngress>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RouteIngress {
    #[serde(default)]
    pub host: String,
}
