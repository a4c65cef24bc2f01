//! VM Export Controller: exposes virtual machine volumes for download
//!
//! This crate reconciles `VirtualMachineExport` resources into an exporter
//! pod, a stable service, a per-pod TLS identity and a set of download links.

pub mod controller;
pub mod crd;
pub mod error;
pub mod rest_api;
pub mod telemetry;

pub use crate::error::{Error, Result};
