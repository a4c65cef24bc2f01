//! Controller module for VirtualMachineExport reconciliation
//! This module contains the main controller loop, reconciliation logic,
//! and resource management for exporter pods, services and certificates.

pub mod cache;
pub mod certs;
pub mod client;
pub mod conditions;
mod exporter;
pub mod external_access;
pub mod index;
pub mod links;
#[cfg(feature = "metrics")]
pub mod metrics;
mod provision;
mod reconciler;
pub mod resources;
#[cfg(test)]
mod resources_test;
pub mod source;
mod status;
#[cfg(test)]
mod testutil;

pub use certs::{CaManager, CertIssuer, IssuedCert};
pub use client::{Clock, ExportKubeClient, ExportKubeClientImpl, SystemClock};
pub use reconciler::{
    calculate_backoff, run_controller, ControllerConfig, ExportController, CONTROLLER_NAME,
};
pub use resources::{DefaultExporterTemplate, ExporterTemplate};
