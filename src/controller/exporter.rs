//! Exporter pod lifecycle
//!
//! One exporter pod per export. It is created once the source is available,
//! gets its certificate while Pending, and is deleted when it finishes or
//! when the source stops being available.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use crate::controller::client::{EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::controller::reconciler::ExportController;
use crate::controller::resources::{
    build_exporter_pod, export_pod_name, is_kubevirt_content_type, pod_phase, random_secret_name,
};
use crate::controller::source::SourceVolumes;
use crate::crd::VirtualMachineExport;
use crate::error::Result;

#[cfg(feature = "metrics")]
use crate::controller::metrics;

pub const EXPORTER_POD_CREATED_EVENT: &str = "ExporterPodCreated";
pub const EXPORT_PAUSED_EVENT: &str = "ExportPaused";
pub const EXPORTER_POD_FAILED_OR_COMPLETED_EVENT: &str = "ExporterPodFailedOrCompleted";

fn record_transition(_action: &str) {
    #[cfg(feature = "metrics")]
    metrics::inc_exporter_pod_transition(_action);
}

impl ExportController {
    /// Drive the exporter pod towards the state implied by `source`.
    ///
    /// Returns the pod status should be computed from, or `None` when no
    /// pod exists (or one was just torn down because the source went away).
    #[instrument(skip(self, export, source), fields(name = %export.name_any(), namespace = export.namespace()))]
    pub(crate) async fn manage_exporter_pod(
        &self,
        export: &VirtualMachineExport,
        source: &SourceVolumes,
    ) -> Result<Option<Pod>> {
        let namespace = export.namespace_or_default();
        let pod_name = export_pod_name(export);

        let mut pod = self
            .caches
            .pods
            .get_by_key(&namespace, &pod_name)
            .map(|p| (*p).clone());

        if pod.is_none() && source.is_source_available() && !source.volumes.is_empty() {
            pod = self.create_exporter_pod(export, source).await?;
        }

        let Some(pod) = pod else {
            return Ok(None);
        };

        if pod_phase(&pod) == "Pending" {
            self.get_or_create_cert_secret(export, &pod).await?;
        }

        if !source.is_source_available() {
            self.delete_exporter_pod(
                export,
                &pod,
                EXPORT_PAUSED_EVENT,
                &source.availability_message,
            )
            .await?;
            record_transition("paused");
            return Ok(None);
        }

        let phase = pod_phase(&pod);
        if phase == "Succeeded" || phase == "Failed" {
            let message = format!(
                "Exporter pod {}/{} is in phase {}",
                namespace,
                pod.name_any(),
                phase
            );
            self.delete_exporter_pod(
                export,
                &pod,
                EXPORTER_POD_FAILED_OR_COMPLETED_EVENT,
                &message,
            )
            .await?;
            record_transition("completed");
        }

        Ok(Some(pod))
    }

    /// Create the exporter pod. Losing a creation race yields `None`; the
    /// pod shows up in the cache and triggers another reconcile.
    async fn create_exporter_pod(
        &self,
        export: &VirtualMachineExport,
        source: &SourceVolumes,
    ) -> Result<Option<Pod>> {
        let namespace = export.namespace_or_default();
        let data_volumes = self.caches.data_volumes.as_ref();
        let manifest = build_exporter_pod(
            self.template.as_ref(),
            export,
            &source.volumes,
            |pvc| is_kubevirt_content_type(pvc, data_volumes),
            &random_secret_name(),
            self.clock.now(),
        );

        info!(
            "Creating exporter pod {}/{}",
            namespace,
            manifest.name_any()
        );
        match self.client.create_pod(&namespace, &manifest).await {
            Ok(pod) => {
                self.client
                    .record_event(
                        export,
                        EVENT_TYPE_NORMAL,
                        EXPORTER_POD_CREATED_EVENT,
                        &format!("Created exporter pod {}/{}", namespace, manifest.name_any()),
                    )
                    .await;
                record_transition("created");
                Ok(Some(pod))
            }
            Err(e) if e.is_already_exists() => {
                info!(
                    "Exporter pod {}/{} already exists, waiting for cache",
                    namespace,
                    manifest.name_any()
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_exporter_pod(
        &self,
        export: &VirtualMachineExport,
        pod: &Pod,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let namespace = export.namespace_or_default();
        warn!(
            "Deleting exporter pod {}/{}: {}",
            namespace,
            pod.name_any(),
            message
        );
        self.client
            .record_event(export, EVENT_TYPE_WARNING, reason, message)
            .await;

        match self.client.delete_pod(&namespace, &pod.name_any()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
