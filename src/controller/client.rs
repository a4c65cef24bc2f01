//! Mutation seam between the reconciler and the Kubernetes API
//!
//! All creates, deletes, status writes and events go through
//! [`ExportKubeClient`] so reconciliation can run against a fake in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

use crate::crd::VirtualMachineExport;
use crate::error::{Error, Result};

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// Writes performed by the export controller
#[async_trait]
pub trait ExportKubeClient: Send + Sync {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret>;

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    /// Replace the status subresource of an export
    async fn update_export_status(&self, export: &VirtualMachineExport) -> Result<()>;

    /// Record an event against an export; failures are logged, not returned
    async fn record_event(
        &self,
        export: &VirtualMachineExport,
        event_type: &str,
        reason: &str,
        message: &str,
    );
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// [`ExportKubeClient`] backed by a live `kube::Client`
#[derive(Clone)]
pub struct ExportKubeClientImpl {
    client: Client,
    clock: std::sync::Arc<dyn Clock>,
}

impl ExportKubeClientImpl {
    pub fn new(client: Client, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self { client, clock }
    }
}

#[async_trait]
impl ExportKubeClient for ExportKubeClientImpl {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), service).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), secret).await?)
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pvc).await?)
    }

    async fn update_export_status(&self, export: &VirtualMachineExport) -> Result<()> {
        let namespace = export.namespace_or_default();
        let api: Api<VirtualMachineExport> = Api::namespaced(self.client.clone(), &namespace);
        let data = serde_json::to_vec(export)?;
        api.replace_status(&export.name_any(), &PostParams::default(), data)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn record_event(
        &self,
        export: &VirtualMachineExport,
        event_type: &str,
        reason: &str,
        message: &str,
    ) {
        let namespace = export.namespace_or_default();
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = self.clock.now();
        let event = Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!("{}-", export.name_any())),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: export.object_ref(&()),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            source: Some(k8s_openapi::api::core::v1::EventSource {
                component: Some("virt-export-controller".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        if let Err(e) = events.create(&PostParams::default(), &event).await {
            warn!(
                "Failed to record {} event for {}/{}: {:?}",
                reason,
                namespace,
                export.name_any(),
                e
            );
        }
    }
}
