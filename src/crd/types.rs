//! Shared types for the VirtualMachineExport CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to the object whose volumes are exported
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceReference {
    /// API group of the referenced kind; empty or absent means the core group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

/// Lifecycle phase of an export
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExportPhase {
    #[default]
    Pending,
    Ready,
    Terminated,
}

impl std::fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportPhase::Pending => write!(f, "Pending"),
            ExportPhase::Ready => write!(f, "Ready"),
            ExportPhase::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Kubernetes-style status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition: "Ready", "PVCReady" or "VolumesCreated"
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

/// Download format offered for a volume
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExportVolumeFormat {
    /// Raw disk image
    #[serde(rename = "kubevirt")]
    KubeVirtRaw,
    /// Gzip compressed raw disk image
    #[serde(rename = "gzip")]
    KubeVirtGz,
    /// Directory listing of a filesystem volume
    #[serde(rename = "dir")]
    Dir,
    /// Gzip compressed tarball of a filesystem volume
    #[serde(rename = "tar.gz")]
    ArchiveGz,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VolumeFormat {
    pub format: ExportVolumeFormat,
    pub url: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ExportVolume {
    pub name: String,
    #[serde(default)]
    pub formats: Vec<VolumeFormat>,
}

/// Download links reachable through one access path
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ExportLink {
    /// PEM certificate a client should trust for this access path
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub volumes: Vec<ExportVolume>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ExportLinks {
    /// Links usable from inside the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<ExportLink>,
    /// Links usable through the cluster ingress or route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExportLink>,
}
