//! Error types for the VM export controller

use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by reconciliation and startup
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Exporter pod error: {0}")]
    ExporterPodError(String),

    #[error("Source lookup error: {0}")]
    SourceError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    fn api_code(&self) -> Option<(u16, &str)> {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => Some((resp.code, resp.reason.as_str())),
            _ => None,
        }
    }

    /// The object addressed by a mutating call does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self.api_code(), Some((404, _)))
    }

    /// A create call lost the race against an existing object
    pub fn is_already_exists(&self) -> bool {
        matches!(self.api_code(), Some((409, reason)) if reason == "AlreadyExists")
    }

    /// Whether the error is likely transient
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) | Error::SourceError(_) | Error::ExporterPodError(_) => true,
            Error::ConfigError(_) | Error::CertificateError(_) | Error::SerializationError(_) => {
                false
            }
        }
    }

    /// Short label used for the reconcile error metric
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ConfigError(_) => "config",
            Error::CertificateError(_) => "certificate",
            Error::ExporterPodError(_) => "exporter_pod",
            Error::SourceError(_) => "source",
            Error::SerializationError(_) => "serialization",
        }
    }
}
