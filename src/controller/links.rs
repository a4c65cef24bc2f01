//! Download link construction

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;

use crate::controller::resources::{archive_uri, dir_uri, raw_gzip_uri, raw_uri};
use crate::crd::{
    ExportLink, ExportVolume, ExportVolumeFormat, VolumeFormat, EXPORT_API_GROUP,
    EXPORT_API_VERSION, EXPORT_RESOURCE_NAME,
};

/// Base of every external download URL for one export
pub fn external_link_base(host: &str, namespace: &str, export_name: &str) -> String {
    format!(
        "{}/api/{}/{}/namespaces/{}/{}/{}",
        host, EXPORT_API_GROUP, EXPORT_API_VERSION, namespace, EXPORT_RESOURCE_NAME, export_name
    )
}

fn url(host_and_base: &str, uri: &str) -> String {
    format!("https://{}{}", host_and_base, uri)
}

/// Links for `pvcs` served under `host_and_base`.
///
/// Disk volumes are offered as raw and gzip images, filesystem volumes as a
/// directory listing and a tarball.
pub fn build_links(
    pvcs: &[PersistentVolumeClaim],
    host_and_base: &str,
    cert: &str,
    is_disk: impl Fn(&PersistentVolumeClaim) -> bool,
) -> ExportLink {
    let volumes = pvcs
        .iter()
        .map(|pvc| {
            let name = pvc.name_any();
            let formats = if is_disk(pvc) {
                vec![
                    VolumeFormat {
                        format: ExportVolumeFormat::KubeVirtRaw,
                        url: url(host_and_base, &raw_uri(&name)),
                    },
                    VolumeFormat {
                        format: ExportVolumeFormat::KubeVirtGz,
                        url: url(host_and_base, &raw_gzip_uri(&name)),
                    },
                ]
            } else {
                vec![
                    VolumeFormat {
                        format: ExportVolumeFormat::Dir,
                        url: url(host_and_base, &dir_uri(&name)),
                    },
                    VolumeFormat {
                        format: ExportVolumeFormat::ArchiveGz,
                        url: url(host_and_base, &archive_uri(&name)),
                    },
                ]
            };
            ExportVolume { name, formats }
        })
        .collect();

    ExportLink {
        cert: cert.to_string(),
        volumes,
    }
}
