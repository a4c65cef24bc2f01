//! External access discovery
//!
//! Finds the hostname under which the export proxy is reachable from outside
//! the cluster, first through Ingresses and then through OpenShift Routes,
//! and the certificate presented for that hostname.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::networking::v1::Ingress;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::parse_x509_certificate;
use x509_parser::pem::Pem;

use crate::controller::reconciler::ExportController;
use crate::crd::Route;

pub const ROUTE_CA_CONFIG_MAP_NAME: &str = "kube-root-ca.crt";
pub const ROUTE_CA_KEY: &str = "ca.crt";
pub const SUBJECT_ALT_NAME_OID: &str = "2.5.29.17";
pub const DEFAULT_EXPORT_PROXY_SERVICE: &str = "virt-exportproxy";

const PEM_LINE_LENGTH: usize = 64;

/// Hostname and matching certificate of the external access path
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalAccess {
    pub host: String,
    pub cert: String,
}

/// Host served by an Ingress for `service`, or an empty string.
///
/// A default backend decides on its own: it either targets the service and
/// the host of the first rule is used, or it targets something else and the
/// Ingress does not match at all.
pub fn host_from_ingress(ingress: &Ingress, service: &str) -> String {
    let Some(spec) = ingress.spec.as_ref() else {
        return String::new();
    };
    let rules = spec.rules.as_deref().unwrap_or_default();

    if let Some(backend) = spec
        .default_backend
        .as_ref()
        .and_then(|b| b.service.as_ref())
    {
        if backend.name != service {
            return String::new();
        }
        return rules
            .first()
            .and_then(|r| r.host.clone())
            .unwrap_or_default();
    }

    for rule in rules {
        let Some(http) = rule.http.as_ref() else {
            continue;
        };
        let targets_service = http.paths.iter().any(|path| {
            path.backend
                .service
                .as_ref()
                .map(|s| s.name == service)
                .unwrap_or(false)
        });
        if targets_service {
            if let Some(host) = rule.host.as_deref().filter(|h| !h.is_empty()) {
                return host.to_string();
            }
        }
    }
    String::new()
}

/// Host admitted for a Route targeting `service`, or an empty string
pub fn host_from_route(route: &Route, service: &str) -> String {
    if route.spec.to.name != service {
        return String::new();
    }
    route
        .status
        .as_ref()
        .and_then(|s| s.ingress.first())
        .map(|i| i.host.clone())
        .unwrap_or_default()
}

/// Everything after the first `.` of a host
fn domain_from_host(host: &str) -> &str {
    match host.find('.') {
        Some(index) => &host[index + 1..],
        None => host,
    }
}

/// Exact match, or match of the one-level wildcard covering `host`
pub fn matches_or_wildcard(host: &str, candidate: &str) -> bool {
    let wildcard = format!("*.{}", domain_from_host(host));
    host == candidate || wildcard == candidate
}

/// Names recovered from a raw subjectAltName extension value
fn san_candidates(raw: &[u8]) -> Vec<String> {
    let printable: String = raw
        .iter()
        .map(|&b| {
            if (0x20..=0x7e).contains(&b) {
                b as char
            } else {
                ' '
            }
        })
        .collect();
    printable.split(' ').map(str::to_string).collect()
}

fn cert_matches_host(cert: &X509Certificate<'_>, host: &str) -> bool {
    let cn_matches = cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .any(|cn| matches_or_wildcard(host, cn));
    if cn_matches {
        return true;
    }

    cert.extensions()
        .iter()
        .filter(|ext| ext.oid.to_id_string() == SUBJECT_ALT_NAME_OID)
        .any(|ext| {
            san_candidates(ext.value)
                .iter()
                .any(|name| matches_or_wildcard(host, name))
        })
}

/// PEM encoding of a DER certificate, without trailing whitespace
fn encode_pem(der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in body.as_bytes().chunks(PEM_LINE_LENGTH) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----");
    out.trim().to_string()
}

/// First certificate of a PEM chain that is valid for `host`.
///
/// Returns an empty string when nothing matches or the chain does not parse.
pub fn find_cert_by_host_name(host: &str, pem_chain: &[u8]) -> String {
    for pem in Pem::iter_from_buffer(pem_chain) {
        let pem = match pem {
            Ok(pem) => pem,
            Err(e) => {
                debug!("Failed to read PEM block: {}", e);
                return String::new();
            }
        };
        if pem.label != "CERTIFICATE" {
            continue;
        }
        let cert = match parse_x509_certificate(&pem.contents) {
            Ok((_, cert)) => cert,
            Err(e) => {
                debug!("Failed to parse certificate: {}", e);
                return String::new();
            }
        };
        if cert_matches_host(&cert, host) {
            return encode_pem(&pem.contents);
        }
    }
    String::new()
}

impl ExportController {
    /// Resolve the external host and certificate of the export proxy.
    ///
    /// Ingresses win over Routes. No match yields empty host and cert.
    pub(crate) fn external_link_host_and_cert(&self) -> ExternalAccess {
        let service = self.config.export_proxy_service.as_str();

        for ingress in self.caches.ingresses.list() {
            let host = host_from_ingress(&ingress, service);
            if !host.is_empty() {
                let cert = self.ingress_cert(&host, &ingress);
                return ExternalAccess { host, cert };
            }
        }

        for route in self.caches.routes.list() {
            let host = host_from_route(&route, service);
            if !host.is_empty() {
                let cert = self.route_cert(&host);
                return ExternalAccess { host, cert };
            }
        }

        ExternalAccess::default()
    }

    fn ingress_cert(&self, host: &str, ingress: &Ingress) -> String {
        let secret_name = ingress
            .spec
            .as_ref()
            .and_then(|s| s.tls.as_ref())
            .and_then(|tls| {
                tls.iter()
                    .filter_map(|t| t.secret_name.as_deref())
                    .find(|name| !name.is_empty())
            })
            .unwrap_or_default();

        let Some(secret) = self
            .caches
            .secrets
            .get_by_key(&self.config.kubevirt_namespace, secret_name)
        else {
            return String::new();
        };
        secret
            .data
            .as_ref()
            .and_then(|d| d.get("tls.crt"))
            .map(|crt| find_cert_by_host_name(host, &crt.0))
            .unwrap_or_default()
    }

    fn route_cert(&self, host: &str) -> String {
        self.caches
            .config_maps
            .get_by_key(&self.config.kubevirt_namespace, ROUTE_CA_CONFIG_MAP_NAME)
            .and_then(|cm| {
                cm.data
                    .as_ref()
                    .and_then(|d| d.get(ROUTE_CA_KEY))
                    .map(|bundle| find_cert_by_host_name(host, bundle.as_bytes()))
            })
            .unwrap_or_default()
    }
}
