//! VirtualMachineExport Custom Resource Definition
//!
//! A VirtualMachineExport asks for the volumes of a PersistentVolumeClaim,
//! a VirtualMachineSnapshot or a VirtualMachine to be served for download.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ExportLinks, ExportPhase, SourceReference};

pub const EXPORT_API_GROUP: &str = "export.kubevirt.io";
pub const EXPORT_API_VERSION: &str = "v1alpha1";
pub const EXPORT_RESOURCE_NAME: &str = "virtualmachineexports";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "export.kubevirt.io",
    version = "v1alpha1",
    kind = "VirtualMachineExport",
    namespaced,
    status = "VirtualMachineExportStatus",
    shortname = "vmexport",
    printcolumn = r#"{"name":"SourceKind","type":"string","jsonPath":".spec.source.kind"}"#,
    printcolumn = r#"{"name":"SourceName","type":"string","jsonPath":".spec.source.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineExportSpec {
    /// Object whose volumes are exported
    pub source: SourceReference,

    /// Name of the secret holding the token clients must present
    pub token_secret_ref: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineExportStatus {
    #[serde(default)]
    pub phase: ExportPhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<ExportLinks>,
}

impl VirtualMachineExport {
    /// Namespace the export lives in
    pub fn namespace_or_default(&self) -> String {
        self.metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }
}
