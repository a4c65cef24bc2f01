//! Certificate issuance for exporter pods
//!
//! The controller holds a CA key pair loaded from disk and signs a short-lived
//! server certificate for every exporter pod it creates.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const DEFAULT_CA_CERT_FILE: &str = "/etc/virt-controller/exportca/tls.crt";
pub const DEFAULT_CA_KEY_FILE: &str = "/etc/virt-controller/exportca/tls.key";

/// Lifetime of an exporter server certificate
pub fn server_cert_validity() -> Duration {
    Duration::hours(30)
}

/// PEM encoded certificate and private key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Signs server certificates off the controller CA
pub trait CertIssuer: Send + Sync {
    fn issue_server_cert(
        &self,
        common_name: &str,
        dns_names: &[String],
        not_before: DateTime<Utc>,
        validity: Duration,
    ) -> Result<IssuedCert>;
}

#[derive(Clone)]
struct CaPair {
    cert_pem: String,
    key_pem: String,
}

/// File backed CA, reloaded periodically by the operator
pub struct CaManager {
    cert_file: PathBuf,
    key_file: PathBuf,
    current: RwLock<Option<CaPair>>,
}

impl CaManager {
    /// Create a manager reading the CA from `cert_file` and `key_file`.
    /// Nothing is read until [`CaManager::reload`] is called.
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            current: RwLock::new(None),
        }
    }

    /// Create a manager from an in-memory CA pair
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        validate_ca(cert_pem, key_pem)?;
        let manager = Self::new(PathBuf::new(), PathBuf::new());
        manager.store(CaPair {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })?;
        Ok(manager)
    }

    /// Re-read the CA files. On failure the previously loaded CA stays active.
    pub fn reload(&self) -> Result<()> {
        let cert_pem = read_pem(&self.cert_file)?;
        let key_pem = read_pem(&self.key_file)?;
        validate_ca(&cert_pem, &key_pem)?;

        let changed = self
            .current
            .read()
            .map_err(|_| lock_poisoned())?
            .as_ref()
            .map(|ca| ca.cert_pem != cert_pem || ca.key_pem != key_pem)
            .unwrap_or(true);

        if changed {
            info!("Loaded export CA from {}", self.cert_file.display());
            self.store(CaPair { cert_pem, key_pem })?;
        } else {
            debug!("Export CA unchanged");
        }
        Ok(())
    }

    /// PEM of the active CA certificate, if one is loaded
    pub fn ca_cert_pem(&self) -> Option<String> {
        self.current
            .read()
            .ok()
            .and_then(|ca| ca.as_ref().map(|ca| ca.cert_pem.clone()))
    }

    fn store(&self, pair: CaPair) -> Result<()> {
        *self.current.write().map_err(|_| lock_poisoned())? = Some(pair);
        Ok(())
    }

    fn active(&self) -> Result<CaPair> {
        self.current
            .read()
            .map_err(|_| lock_poisoned())?
            .clone()
            .ok_or_else(|| Error::CertificateError("export CA is not loaded".to_string()))
    }
}

impl CertIssuer for CaManager {
    fn issue_server_cert(
        &self,
        common_name: &str,
        dns_names: &[String],
        not_before: DateTime<Utc>,
        validity: Duration,
    ) -> Result<IssuedCert> {
        let ca = self.active()?;

        let ca_key = KeyPair::from_pem(&ca.key_pem).map_err(cert_error)?;
        let ca_params = CertificateParams::from_ca_cert_pem(&ca.cert_pem).map_err(cert_error)?;
        let ca_cert = ca_params.self_signed(&ca_key).map_err(cert_error)?;

        let mut params = CertificateParams::new(dns_names.to_vec()).map_err(cert_error)?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_before + validity)?;

        let key = KeyPair::generate().map_err(cert_error)?;
        let cert = params
            .signed_by(&key, &ca_cert, &ca_key)
            .map_err(cert_error)?;

        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

fn read_pem(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::CertificateError(format!("failed to read {}: {}", path.display(), e)))
}

fn validate_ca(cert_pem: &str, key_pem: &str) -> Result<()> {
    KeyPair::from_pem(key_pem).map_err(cert_error)?;
    CertificateParams::from_ca_cert_pem(cert_pem).map_err(cert_error)?;
    Ok(())
}

fn to_offset(t: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(t.timestamp())
        .map_err(|e| Error::CertificateError(e.to_string()))
}

fn cert_error(e: rcgen::Error) -> Error {
    Error::CertificateError(e.to_string())
}

fn lock_poisoned() -> Error {
    Error::CertificateError("export CA lock poisoned".to_string())
}
