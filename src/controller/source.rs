//! Source resolution
//!
//! Turns the source reference of an export into the concrete claims to
//! serve, together with whether they can be served right now.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::cache::list_namespaced;
use crate::controller::reconciler::ExportController;
use crate::controller::resources::{
    build_restore_pvc, controller_owner, restore_pvc_name, EXPORT_SERVICE_LABEL,
};
use crate::crd::kubevirt::{CDI_API_VERSION, KUBEVIRT_API_GROUP, SNAPSHOT_API_GROUP};
use crate::crd::{SourceReference, VirtualMachineExport};
use crate::error::{Error, Result};

pub const PVC_KIND: &str = "PersistentVolumeClaim";
pub const VM_SNAPSHOT_KIND: &str = "VirtualMachineSnapshot";
pub const VM_KIND: &str = "VirtualMachine";

/// Supported export sources
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportSource {
    Pvc { name: String },
    VmSnapshot { name: String },
    Vm { name: String },
}

/// Map a source reference onto a supported source, or `None` when the
/// kind/group pair is not one the controller exports.
pub fn classify_source(source: &SourceReference) -> Option<ExportSource> {
    let group = source.api_group.as_deref().unwrap_or("");
    let name = source.name.clone();
    match (source.kind.as_str(), group) {
        (PVC_KIND, "") => Some(ExportSource::Pvc { name }),
        (VM_SNAPSHOT_KIND, SNAPSHOT_API_GROUP) => Some(ExportSource::VmSnapshot { name }),
        (VM_KIND, KUBEVIRT_API_GROUP) => Some(ExportSource::Vm { name }),
        _ => None,
    }
}

/// Progress of restoring snapshot volumes into claims
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreProgress {
    pub expected: usize,
    pub present: usize,
}

impl RestoreProgress {
    pub fn is_complete(&self) -> bool {
        self.present >= self.expected
    }
}

/// Claims backing an export and their availability, recomputed each reconcile
#[derive(Clone, Debug, Default)]
pub struct SourceVolumes {
    pub volumes: Vec<PersistentVolumeClaim>,
    pub in_use: bool,
    pub is_populated: bool,
    pub availability_message: String,
    /// Only set for snapshot sources
    pub restore: Option<RestoreProgress>,
}

impl SourceVolumes {
    pub fn is_source_available(&self) -> bool {
        !self.in_use && self.is_populated
    }

    fn unavailable(message: String) -> Self {
        Self {
            availability_message: message,
            ..Default::default()
        }
    }
}

fn is_terminal_pod_phase(phase: Option<&str>) -> bool {
    matches!(phase, Some("Succeeded") | Some("Failed"))
}

impl ExportController {
    /// Resolve the volumes of a classified source
    pub(crate) async fn resolve_source(
        &self,
        export: &VirtualMachineExport,
        source: &ExportSource,
    ) -> Result<SourceVolumes> {
        let namespace = export.namespace_or_default();
        let volumes = match source {
            ExportSource::Pvc { name } => self.pvc_source_volumes(&namespace, name)?,
            ExportSource::Vm { name } => self.vm_source_volumes(&namespace, name)?,
            ExportSource::VmSnapshot { name } => {
                self.snapshot_source_volumes(export, &namespace, name)
                    .await?
            }
        };
        debug!(
            "Source volumes for {}/{}: {} claim(s), in_use={}, populated={}",
            namespace,
            export.name_any(),
            volumes.volumes.len(),
            volumes.in_use,
            volumes.is_populated
        );
        Ok(volumes)
    }

    fn pvc_source_volumes(&self, namespace: &str, name: &str) -> Result<SourceVolumes> {
        let Some(pvc) = self.caches.pvcs.get_by_key(namespace, name) else {
            return Ok(SourceVolumes::unavailable(format!(
                "pvc {}/{} not found",
                namespace, name
            )));
        };

        let in_use = self.is_pvc_in_use(namespace, name);
        let is_populated = self.is_pvc_populated(&pvc)?;
        let availability_message = if in_use {
            format!("pvc {}/{} is in use", namespace, name)
        } else if !is_populated {
            format!("pvc {}/{} is not populated", namespace, name)
        } else {
            String::new()
        };

        Ok(SourceVolumes {
            volumes: vec![(*pvc).clone()],
            in_use,
            is_populated,
            availability_message,
            restore: None,
        })
    }

    fn vm_source_volumes(&self, namespace: &str, name: &str) -> Result<SourceVolumes> {
        let Some(vm) = self.caches.vms.get_by_key(namespace, name) else {
            return Ok(SourceVolumes::unavailable(format!(
                "Virtual Machine {}/{} not found",
                namespace, name
            )));
        };

        let in_use = self
            .caches
            .vmis
            .get_by_key(namespace, name)
            .map(|vmi| !vmi.is_final())
            .unwrap_or(false);

        let mut volumes = Vec::new();
        let mut is_populated = true;
        for claim in vm.template_volumes().iter().filter_map(|v| v.claim_name()) {
            match self.caches.pvcs.get_by_key(namespace, claim) {
                Some(pvc) => {
                    if !self.is_pvc_populated(&pvc)? {
                        is_populated = false;
                    }
                    volumes.push((*pvc).clone());
                }
                None => is_populated = false,
            }
        }

        let availability_message = if in_use {
            format!("Virtual Machine {}/{} is running", namespace, name)
        } else if !is_populated {
            format!(
                "Not all volumes in the Virtual Machine {}/{} are populated",
                namespace, name
            )
        } else {
            String::new()
        };

        Ok(SourceVolumes {
            volumes,
            in_use,
            is_populated,
            availability_message,
            restore: None,
        })
    }

    async fn snapshot_source_volumes(
        &self,
        export: &VirtualMachineExport,
        namespace: &str,
        name: &str,
    ) -> Result<SourceVolumes> {
        let Some(snapshot) = self.caches.snapshots.get_by_key(namespace, name) else {
            return Ok(SourceVolumes::unavailable(format!(
                "VirtualMachineSnapshot {}/{} not found",
                namespace, name
            )));
        };
        if !snapshot.is_ready_to_use() {
            return Ok(SourceVolumes::unavailable(format!(
                "VirtualMachineSnapshot {}/{} is not ready to use",
                namespace, name
            )));
        }

        let content = snapshot
            .status
            .as_ref()
            .and_then(|s| s.virtual_machine_snapshot_content_name.as_deref())
            .and_then(|content_name| {
                self.caches
                    .snapshot_contents
                    .get_by_key(namespace, content_name)
            });
        let Some(content) = content else {
            return Ok(SourceVolumes::unavailable(format!(
                "VirtualMachineSnapshotContent for {}/{} not found",
                namespace, name
            )));
        };

        let mut progress = RestoreProgress::default();
        let mut volumes = Vec::new();
        for backup in &content.spec.volume_backups {
            let Some(volume_snapshot) = backup.volume_snapshot_name.as_deref() else {
                continue;
            };
            progress.expected += 1;

            let backup_claim = backup
                .persistent_volume_claim
                .metadata
                .name
                .clone()
                .unwrap_or_default();
            let restore_name = restore_pvc_name(export, &backup_claim);
            if let Some(pvc) = self.caches.pvcs.get_by_key(namespace, &restore_name) {
                progress.present += 1;
                volumes.push((*pvc).clone());
                continue;
            }

            let manifest = build_restore_pvc(export, backup, volume_snapshot);
            match self.client.create_pvc(namespace, &manifest).await {
                Ok(_) => info!("Created restore claim {}/{}", namespace, restore_name),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }

        let is_populated = progress.is_complete();
        let availability_message = if is_populated {
            String::new()
        } else {
            format!(
                "Not all volumes of VirtualMachineSnapshot {}/{} have been restored",
                namespace, name
            )
        };

        Ok(SourceVolumes {
            volumes,
            in_use: false,
            is_populated,
            availability_message,
            restore: Some(progress),
        })
    }

    /// Whether a consumer other than an exporter currently holds the claim
    pub(crate) fn is_pvc_in_use(&self, namespace: &str, claim: &str) -> bool {
        let pod_holds_claim = list_namespaced(self.caches.pods.as_ref(), namespace)
            .iter()
            .filter(|pod| !pod.labels().contains_key(EXPORT_SERVICE_LABEL))
            .filter(|pod| {
                !is_terminal_pod_phase(pod.status.as_ref().and_then(|s| s.phase.as_deref()))
            })
            .any(|pod| {
                pod.spec
                    .as_ref()
                    .and_then(|s| s.volumes.as_ref())
                    .map(|volumes| {
                        volumes.iter().any(|v| {
                            v.persistent_volume_claim
                                .as_ref()
                                .map(|p| p.claim_name == claim)
                                .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false)
            });
        if pod_holds_claim {
            return true;
        }

        list_namespaced(self.caches.vmis.as_ref(), namespace)
            .iter()
            .filter(|vmi| !vmi.is_final())
            .any(|vmi| vmi.claim_names().any(|c| c == claim))
    }

    /// Whether data transfer into the claim has completed.
    ///
    /// Claims controlled by a DataVolume are populated once it succeeded;
    /// all other claims are considered populated.
    pub(crate) fn is_pvc_populated(&self, pvc: &PersistentVolumeClaim) -> Result<bool> {
        let Some(owner) = controller_owner(&pvc.metadata) else {
            return Ok(true);
        };
        if owner.kind != "DataVolume" || owner.api_version != CDI_API_VERSION {
            return Ok(true);
        }

        let namespace = pvc.namespace().unwrap_or_default();
        let dv = self
            .caches
            .data_volumes
            .get_by_key(&namespace, &owner.name)
            .ok_or_else(|| {
                Error::SourceError(format!("datavolume {}/{} not found", namespace, owner.name))
            })?;
        Ok(dv.is_succeeded())
    }
}
