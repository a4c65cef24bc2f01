//! Status synthesis and write-back

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::controller::conditions::{
    new_condition, update_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE,
    CONDITION_TYPE_PVC_READY, CONDITION_TYPE_READY, CONDITION_TYPE_VOLUMES_CREATED,
    REASON_ALL_PVCS_READY, REASON_INITIALIZING, REASON_IN_USE, REASON_NOT_ALL_PVCS_CREATED,
    REASON_POD_COMPLETED, REASON_POD_PENDING, REASON_POD_READY, REASON_PVC_BOUND,
    REASON_PVC_NOT_FOUND, REASON_PVC_PENDING, REASON_UNKNOWN,
};
use crate::controller::links::{build_links, external_link_base};
use crate::controller::reconciler::ExportController;
use crate::controller::resources::{is_kubevirt_content_type, pod_phase, service_host};
use crate::controller::source::{RestoreProgress, SourceVolumes};
use crate::crd::{
    Condition, ExportLinks, ExportPhase, VirtualMachineExport, VirtualMachineExportStatus,
};
use crate::error::Result;

#[cfg(feature = "metrics")]
use crate::controller::{metrics, reconciler::CONTROLLER_NAME};

/// Config map in the controller namespace holding the internal CA bundle
pub const INTERNAL_CA_CONFIG_MAP_NAME: &str = "kubevirt-export-ca";
pub const CA_BUNDLE_KEY: &str = "ca-bundle";

/// Status of an export nothing has been observed for yet
pub fn initial_status(now: DateTime<Utc>) -> VirtualMachineExportStatus {
    VirtualMachineExportStatus {
        phase: ExportPhase::Pending,
        conditions: vec![
            new_condition(
                CONDITION_TYPE_READY,
                CONDITION_STATUS_FALSE,
                REASON_INITIALIZING,
                "",
                now,
            ),
            new_condition(
                CONDITION_TYPE_PVC_READY,
                CONDITION_STATUS_FALSE,
                REASON_UNKNOWN,
                "",
                now,
            ),
        ],
        service_name: None,
        links: None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ClaimSeverity {
    Bound,
    Pending,
    Lost,
}

/// PVCReady condition summarizing the most severe claim phase.
///
/// Bound is the least severe, then Pending, then Lost.
pub fn pvc_condition_from_pvcs(pvcs: &[PersistentVolumeClaim], now: DateTime<Utc>) -> Condition {
    let severity = pvcs
        .iter()
        .map(|pvc| match pvc.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Pending") => ClaimSeverity::Pending,
            Some("Lost") => ClaimSeverity::Lost,
            _ => ClaimSeverity::Bound,
        })
        .max()
        .unwrap_or(ClaimSeverity::Bound);

    let (status, reason) = match severity {
        ClaimSeverity::Bound => (CONDITION_STATUS_TRUE, REASON_PVC_BOUND),
        ClaimSeverity::Pending => (CONDITION_STATUS_FALSE, REASON_PVC_PENDING),
        ClaimSeverity::Lost => (CONDITION_STATUS_FALSE, REASON_UNKNOWN),
    };
    new_condition(CONDITION_TYPE_PVC_READY, status, reason, "", now)
}

fn volumes_created_condition(progress: &RestoreProgress, now: DateTime<Utc>) -> Condition {
    if progress.is_complete() {
        new_condition(
            CONDITION_TYPE_VOLUMES_CREATED,
            CONDITION_STATUS_TRUE,
            REASON_ALL_PVCS_READY,
            "",
            now,
        )
    } else {
        new_condition(
            CONDITION_TYPE_VOLUMES_CREATED,
            CONDITION_STATUS_FALSE,
            REASON_NOT_ALL_PVCS_CREATED,
            &format!(
                "{} of {} volumes restored",
                progress.present, progress.expected
            ),
            now,
        )
    }
}

impl ExportController {
    /// CA bundle clients use to trust the exporter inside the cluster
    fn internal_export_ca(&self) -> String {
        self.caches
            .config_maps
            .get_by_key(&self.config.kubevirt_namespace, INTERNAL_CA_CONFIG_MAP_NAME)
            .and_then(|cm| cm.data.as_ref().and_then(|d| d.get(CA_BUNDLE_KEY)).cloned())
            .map(|bundle| bundle.trim().to_string())
            .unwrap_or_default()
    }

    /// Status implied by the observed service, pod and source volumes
    pub(crate) fn compute_status(
        &self,
        export: &VirtualMachineExport,
        pod: Option<&Pod>,
        service: &Service,
        source: &SourceVolumes,
    ) -> VirtualMachineExportStatus {
        let now = self.clock.now();
        let namespace = export.namespace_or_default();
        let mut status = export
            .status
            .clone()
            .unwrap_or_else(|| initial_status(now));

        status.service_name = Some(service.name_any());
        let mut links = ExportLinks::default();

        let (ready_status, reason, message, phase) = match pod.map(pod_phase) {
            None => (
                CONDITION_STATUS_FALSE,
                REASON_IN_USE,
                source.availability_message.as_str(),
                ExportPhase::Pending,
            ),
            Some("Running") => {
                let data_volumes = self.caches.data_volumes.as_ref();
                let is_disk =
                    |pvc: &PersistentVolumeClaim| is_kubevirt_content_type(pvc, data_volumes);

                let host = service_host(&service.name_any(), &namespace);
                links.internal = Some(build_links(
                    &source.volumes,
                    &host,
                    &self.internal_export_ca(),
                    is_disk,
                ));

                let external = self.external_link_host_and_cert();
                if !external.host.is_empty() {
                    debug!(
                        "External host {} resolved, certificate found: {}",
                        external.host,
                        !external.cert.is_empty()
                    );
                    let base = external_link_base(&external.host, &namespace, &export.name_any());
                    links.external = Some(build_links(&source.volumes, &base, "", is_disk));
                }

                (
                    CONDITION_STATUS_TRUE,
                    REASON_POD_READY,
                    "",
                    ExportPhase::Ready,
                )
            }
            Some("Succeeded") => (
                CONDITION_STATUS_FALSE,
                REASON_POD_COMPLETED,
                "",
                ExportPhase::Terminated,
            ),
            Some("Pending") => (
                CONDITION_STATUS_FALSE,
                REASON_POD_PENDING,
                "",
                ExportPhase::Pending,
            ),
            Some(_) => (
                CONDITION_STATUS_FALSE,
                REASON_UNKNOWN,
                "",
                ExportPhase::Pending,
            ),
        };

        update_condition(
            &mut status.conditions,
            new_condition(CONDITION_TYPE_READY, ready_status, reason, message, now),
        );
        status.phase = phase;
        status.links = Some(links);

        let pvc_condition = if source.volumes.is_empty() {
            new_condition(
                CONDITION_TYPE_PVC_READY,
                CONDITION_STATUS_FALSE,
                REASON_PVC_NOT_FOUND,
                &source.availability_message,
                now,
            )
        } else {
            pvc_condition_from_pvcs(&source.volumes, now)
        };
        update_condition(&mut status.conditions, pvc_condition);

        if let Some(progress) = &source.restore {
            update_condition(
                &mut status.conditions,
                volumes_created_condition(progress, now),
            );
        }

        status
    }

    /// Persist `status` when it differs from what the export carries.
    /// Returns whether a write was issued.
    #[instrument(skip(self, export, status), fields(name = %export.name_any(), namespace = export.namespace()))]
    pub(crate) async fn write_status_if_changed(
        &self,
        export: &VirtualMachineExport,
        status: VirtualMachineExportStatus,
    ) -> Result<bool> {
        if export.status.as_ref() == Some(&status) {
            debug!("Status unchanged");
            return Ok(false);
        }

        let mut updated = export.clone();
        let phase = status.phase.to_string();
        info!("Updating status, phase {}", phase);
        updated.status = Some(status);
        self.client.update_export_status(&updated).await?;

        #[cfg(feature = "metrics")]
        metrics::inc_status_update(CONTROLLER_NAME, &phase);

        Ok(true)
    }
}
