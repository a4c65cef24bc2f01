//! Custom Resource Definitions for the VM export controller
//!
//! The VirtualMachineExport CRD is owned by this controller; the KubeVirt,
//! CDI and OpenShift kinds are read-only views of foreign resources.

pub mod kubevirt;
pub mod types;
mod virtual_machine_export;


pub use kubevirt::{
    DataVolume, Route, VirtualMachine, VirtualMachineInstance, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent,
};
pub use types::*;
pub use virtual_machine_export::{
    VirtualMachineExport, VirtualMachineExportSpec, VirtualMachineExportStatus, EXPORT_API_GROUP,
    EXPORT_API_VERSION, EXPORT_RESOURCE_NAME,
};
