//! Export service and exporter certificate provisioning

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::controller::certs::server_cert_validity;
use crate::controller::client::EVENT_TYPE_NORMAL;
use crate::controller::reconciler::ExportController;
use crate::controller::resources::{
    build_cert_secret, build_service, cert_secret_name, export_service_name, service_host,
};
use crate::crd::VirtualMachineExport;
use crate::error::{Error, Result};

pub const SERVICE_CREATED_EVENT: &str = "ServiceCreated";
pub const SECRET_CREATED_EVENT: &str = "SecretCreated";

/// DNS names the exporter certificate is valid for
pub fn service_dns_names(service_name: &str, namespace: &str) -> Vec<String> {
    vec![
        service_host(service_name, namespace),
        service_name.to_string(),
        format!("{}.{}", service_name, namespace),
        format!("{}.{}.svc.cluster.local", service_name, namespace),
    ]
}

impl ExportController {
    /// Return the export service, creating it when the cache has none
    #[instrument(skip(self, export), fields(name = %export.name_any(), namespace = export.namespace()))]
    pub(crate) async fn get_or_create_export_service(
        &self,
        export: &VirtualMachineExport,
    ) -> Result<Service> {
        let namespace = export.namespace_or_default();
        let name = export_service_name(export);

        if let Some(service) = self.caches.services.get_by_key(&namespace, &name) {
            return Ok((*service).clone());
        }

        let manifest = build_service(export);
        info!("Creating exporter service {}/{}", namespace, name);
        match self.client.create_service(&namespace, &manifest).await {
            Ok(service) => {
                self.client
                    .record_event(
                        export,
                        EVENT_TYPE_NORMAL,
                        SERVICE_CREATED_EVENT,
                        &format!("Created service {}/{}", namespace, name),
                    )
                    .await;
                Ok(service)
            }
            Err(e) if e.is_already_exists() => {
                debug!("Service {}/{} already exists", namespace, name);
                Ok(self
                    .caches
                    .services
                    .get_by_key(&namespace, &name)
                    .map(|s| (*s).clone())
                    .unwrap_or(manifest))
            }
            Err(e) => Err(e),
        }
    }

    /// Create the certificate secret the exporter pod mounts.
    ///
    /// An existing secret of the same name is left untouched and assumed
    /// valid.
    #[instrument(skip(self, export, pod), fields(name = %export.name_any(), pod = %pod.name_any()))]
    pub(crate) async fn get_or_create_cert_secret(
        &self,
        export: &VirtualMachineExport,
        pod: &Pod,
    ) -> Result<()> {
        let namespace = export.namespace_or_default();
        let secret_name = cert_secret_name(pod).ok_or_else(|| {
            Error::ExporterPodError(format!(
                "exporter pod {}/{} has no certificate volume",
                namespace,
                pod.name_any()
            ))
        })?;

        let service_name = export_service_name(export);
        let common_name = service_host(&service_name, &namespace);
        let issued = self.issuer.issue_server_cert(
            &common_name,
            &service_dns_names(&service_name, &namespace),
            self.clock.now(),
            server_cert_validity(),
        )?;
        let secret = build_cert_secret(export, pod, &secret_name, &issued);

        match self.client.create_secret(&namespace, &secret).await {
            Ok(_) => {
                info!("Created exporter secret {}/{}", namespace, secret_name);
                self.client
                    .record_event(
                        export,
                        EVENT_TYPE_NORMAL,
                        SECRET_CREATED_EVENT,
                        "Created exporter pod secret",
                    )
                    .await;
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!("Exporter secret {}/{} already exists", namespace, secret_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
