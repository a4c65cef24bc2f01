//! Tests for resource builders
//!
//! Naming, volume classification and the exporter pod, service, secret and
//! restore claim manifests.

#[cfg(test)]
mod tests {
    use super::super::cache::MemoryCache;
    use super::super::certs::IssuedCert;
    use super::super::resources::*;
    use super::super::testutil::{dv_owned_pvc, fixed_time, pvc, pvc_export, TEST_IMAGE};
    use crate::crd::kubevirt::{PersistentVolumeClaimTemplate, VolumeBackup};
    use crate::crd::kubevirt::DataVolumeSpec;
    use crate::crd::DataVolume;
    use k8s_openapi::api::core::v1::{
        EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod,
    };
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn block_pvc(name: &str) -> PersistentVolumeClaim {
        let mut claim = pvc(name);
        claim.spec = Some(PersistentVolumeClaimSpec {
            volume_mode: Some("Block".to_string()),
            ..Default::default()
        });
        claim
    }

    fn annotated_pvc(name: &str, content_type: &str) -> PersistentVolumeClaim {
        let mut claim = pvc(name);
        let mut annotations = BTreeMap::new();
        annotations.insert(ANN_CONTENT_TYPE.to_string(), content_type.to_string());
        claim.metadata.annotations = Some(annotations);
        claim
    }

    fn data_volume(name: &str, content_type: Option<&str>) -> DataVolume {
        let mut dv = DataVolume::new(
            name,
            DataVolumeSpec {
                content_type: content_type.map(str::to_string),
            },
        );
        dv.metadata.namespace = Some("default".to_string());
        dv
    }

    fn env_map(pod: &Pod) -> BTreeMap<String, String> {
        pod.spec.as_ref().unwrap().containers[0]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|EnvVar { name, value, .. }| (name.clone(), value.clone().unwrap_or_default()))
            .collect()
    }

    // ========================================================================
    // Naming
    // ========================================================================

    #[test]
    fn test_short_names_are_prefixed() {
        assert_eq!(export_resource_name("test"), "virt-export-test");
        let export = pvc_export("test", "disk");
        assert_eq!(export_pod_name(&export), export_service_name(&export));
        assert_eq!(
            service_host("virt-export-test", "default"),
            "virt-export-test.default.svc"
        );
    }

    #[test]
    fn test_long_names_are_truncated_with_stable_hash() {
        let long = "a".repeat(80);
        let name = export_resource_name(&long);

        assert_eq!(name.len(), 63);
        assert!(name.starts_with("virt-export-aaa"));
        assert_eq!(name, export_resource_name(&long));

        let other = export_resource_name(&format!("{}b", "a".repeat(79)));
        assert_ne!(name, other);
        assert_eq!(name[..54], other[..54]);
    }

    #[test]
    fn test_random_secret_names() {
        let name = random_secret_name();
        assert!(name.starts_with("secret-"));
        assert_eq!(name.len(), "secret-".len() + 10);
        assert_ne!(name, random_secret_name());
    }

    #[test]
    fn test_uris() {
        assert_eq!(raw_uri("disk"), "/volumes/disk/disk.img");
        assert_eq!(raw_gzip_uri("disk"), "/volumes/disk/disk.img.gz");
        assert_eq!(archive_uri("disk"), "/volumes/disk/disk.tar.gz");
        assert_eq!(dir_uri("disk"), "/volumes/disk/dir/");
    }

    // ========================================================================
    // Classification
    // ========================================================================

    #[test]
    fn test_block_is_always_disk() {
        let dvs = MemoryCache::<DataVolume>::new();
        assert!(is_kubevirt_content_type(&block_pvc("b"), &dvs));

        let mut annotated = annotated_pvc("b", "archive");
        annotated.spec = block_pvc("b").spec;
        assert!(is_kubevirt_content_type(&annotated, &dvs));
    }

    #[test]
    fn test_filesystem_without_annotation_or_owner_defaults_to_disk() {
        let dvs = MemoryCache::<DataVolume>::new();
        assert!(is_kubevirt_content_type(&pvc("fs"), &dvs));
    }

    #[test]
    fn test_annotation_decides_for_unowned_claims() {
        let dvs = MemoryCache::<DataVolume>::new();
        assert!(is_kubevirt_content_type(&annotated_pvc("fs", "kubevirt"), &dvs));
        assert!(is_kubevirt_content_type(&annotated_pvc("fs", ""), &dvs));
        assert!(!is_kubevirt_content_type(&annotated_pvc("fs", "archive"), &dvs));
    }

    #[test]
    fn test_owning_datavolume_content_type() {
        let claim = dv_owned_pvc("dv");

        let archive = MemoryCache::from_objects(vec![data_volume("dv", Some("archive"))]);
        assert!(!is_kubevirt_content_type(&claim, &archive));

        let kubevirt = MemoryCache::from_objects(vec![data_volume("dv", Some("kubevirt"))]);
        assert!(is_kubevirt_content_type(&claim, &kubevirt));

        let unset = MemoryCache::from_objects(vec![data_volume("dv", None)]);
        assert!(is_kubevirt_content_type(&claim, &unset));

        let missing = MemoryCache::<DataVolume>::new();
        assert!(is_kubevirt_content_type(&claim, &missing));
    }

    // ========================================================================
    // Service
    // ========================================================================

    #[test]
    fn test_service_manifest() {
        let export = pvc_export("test", "disk");
        let service = build_service(&export);

        assert_eq!(service.metadata.name.as_deref(), Some("virt-export-test"));
        let owners = service.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].kind, "VirtualMachineExport");
        assert_eq!(owners[0].name, "test");
        assert_eq!(owners[0].controller, Some(true));

        let spec = service.spec.as_ref().unwrap();
        let port = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 443);
        assert_eq!(port.target_port, Some(IntOrString::Int(8443)));
        assert_eq!(
            spec.selector.as_ref().unwrap().get(EXPORT_SERVICE_LABEL),
            Some(&"test".to_string())
        );
    }

    // ========================================================================
    // Exporter pod
    // ========================================================================

    #[test]
    fn test_exporter_pod_env_contract() {
        let export = pvc_export("test", "disk");
        let template = DefaultExporterTemplate::new(TEST_IMAGE, "IfNotPresent");
        let pvcs = vec![block_pvc("disk"), pvc("data")];

        let pod = build_exporter_pod(
            &template,
            &export,
            &pvcs,
            |claim| claim.metadata.name.as_deref() == Some("disk"),
            "secret-abc",
            fixed_time(),
        );
        let env = env_map(&pod);

        assert_eq!(env["VOLUME0_EXPORT_PATH"], "/dev/export-volumes/disk");
        assert_eq!(env["VOLUME0_EXPORT_RAW_URI"], "/volumes/disk/disk.img");
        assert_eq!(env["VOLUME0_EXPORT_RAW_GZIP_URI"], "/volumes/disk/disk.img.gz");
        assert_eq!(env["VOLUME1_EXPORT_PATH"], "/export-volumes/data");
        assert_eq!(env["VOLUME1_EXPORT_ARCHIVE_URI"], "/volumes/data/disk.tar.gz");
        assert_eq!(env["VOLUME1_EXPORT_DIR_URI"], "/volumes/data/dir/");
        assert!(!env.contains_key("VOLUME1_EXPORT_RAW_URI"));
        assert_eq!(env["CERT_FILE"], "/cert/tls.crt");
        assert_eq!(env["KEY_FILE"], "/cert/tls.key");
        assert_eq!(env["TOKEN_FILE"], "/token/token");
        assert_eq!(env["DEADLINE"], "2024-01-02T12:00:00Z");
    }

    #[test]
    fn test_exporter_pod_manifest() {
        let export = pvc_export("test", "disk");
        let template = DefaultExporterTemplate::new(TEST_IMAGE, "IfNotPresent");
        let pvcs = vec![block_pvc("disk"), pvc("data")];

        let pod = build_exporter_pod(&template, &export, &pvcs, |_| true, "secret-abc", fixed_time());

        assert_eq!(pod.metadata.name.as_deref(), Some("virt-export-test"));
        assert_eq!(
            pod.metadata.labels.as_ref().unwrap().get(EXPORT_SERVICE_LABEL),
            Some(&"test".to_string())
        );
        assert_eq!(
            pod.metadata.owner_references.as_ref().unwrap()[0].uid,
            "uid-test"
        );

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let security = spec.security_context.as_ref().unwrap();
        assert_eq!(security.run_as_non_root, Some(true));
        assert_eq!(security.fs_group, Some(107));

        let container = &spec.containers[0];
        assert_eq!(container.name, EXPORTER_CONTAINER_NAME);
        assert_eq!(container.image.as_deref(), Some(TEST_IMAGE));

        let devices = container.volume_devices.as_ref().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_path, "/dev/export-volumes/disk");

        let mounts = container.volume_mounts.as_ref().unwrap();
        let data = mounts.iter().find(|m| m.name == "data").unwrap();
        assert_eq!(data.mount_path, "/export-volumes/data");
        assert_eq!(data.read_only, Some(true));
        assert!(mounts.iter().any(|m| m.mount_path == CERT_MOUNT_PATH));
        assert!(mounts
            .iter()
            .any(|m| m.name == "token" && m.mount_path == TOKEN_MOUNT_PATH));

        assert_eq!(cert_secret_name(&pod).as_deref(), Some("secret-abc"));
        assert_eq!(pod_phase(&pod), "Pending");
    }

    // ========================================================================
    // Secret and restore claims
    // ========================================================================

    #[test]
    fn test_cert_secret_owned_by_pod() {
        let export = pvc_export("test", "disk");
        let mut pod = Pod::default();
        pod.metadata = ObjectMeta {
            name: Some("virt-export-test".to_string()),
            uid: Some("pod-uid".to_string()),
            ..Default::default()
        };
        let issued = IssuedCert {
            cert_pem: "cert".to_string(),
            key_pem: "key".to_string(),
        };

        let secret = build_cert_secret(&export, &pod, "secret-abc", &issued);

        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
        let owner = &secret.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Pod");
        assert_eq!(owner.uid, "pod-uid");
        let data = secret.data.as_ref().unwrap();
        assert_eq!(data["tls.crt"].0, b"cert".to_vec());
        assert_eq!(data["tls.key"].0, b"key".to_vec());
    }

    #[test]
    fn test_restore_pvc_from_backup() {
        let export = pvc_export("test", "disk");
        let mut annotations = BTreeMap::new();
        annotations.insert(ANN_CONTENT_TYPE.to_string(), "kubevirt".to_string());
        let backup = VolumeBackup {
            volume_name: "root".to_string(),
            persistent_volume_claim: PersistentVolumeClaimTemplate {
                metadata: ObjectMeta {
                    name: Some("root-disk".to_string()),
                    annotations: Some(annotations),
                    ..Default::default()
                },
                spec: PersistentVolumeClaimSpec {
                    volume_name: Some("pv-1".to_string()),
                    volume_mode: Some("Block".to_string()),
                    ..Default::default()
                },
            },
            volume_snapshot_name: Some("vs-root".to_string()),
        };

        let claim = build_restore_pvc(&export, &backup, "vs-root");

        assert_eq!(claim.metadata.name.as_deref(), Some("test-root-disk"));
        assert_eq!(
            claim.metadata.annotations.as_ref().unwrap()[ANN_CONTENT_TYPE],
            "kubevirt"
        );
        assert_eq!(
            claim.metadata.owner_references.as_ref().unwrap()[0].name,
            "test"
        );
        let spec = claim.spec.as_ref().unwrap();
        assert!(spec.volume_name.is_none());
        assert_eq!(spec.volume_mode.as_deref(), Some("Block"));
        let source = spec.data_source.as_ref().unwrap();
        assert_eq!(source.api_group.as_deref(), Some("snapshot.storage.k8s.io"));
        assert_eq!(source.name, "vs-root");
    }
}
