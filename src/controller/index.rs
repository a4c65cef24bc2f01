//! Dependency index
//!
//! Maps a change on a watched object back to the exports that depend on it.
//! Mapping only reads caches; the results are fed to the controller queue.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};

use crate::controller::cache::{list_namespaced, ExportCaches};
use crate::controller::resources::controller_owner;
use crate::controller::source::{classify_source, ExportSource};
use crate::crd::{
    VirtualMachine, VirtualMachineExport, VirtualMachineInstance, VirtualMachineSnapshot,
};

pub type ExportKey = ObjectRef<VirtualMachineExport>;

fn export_key(namespace: &str, name: &str) -> ExportKey {
    ObjectRef::new(name).within(namespace)
}

fn extend_unique(keys: &mut Vec<ExportKey>, more: Vec<ExportKey>) {
    for key in more {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
}

/// Resolves dependent object changes to export keys
#[derive(Clone)]
pub struct DependencyIndex {
    caches: ExportCaches,
}

impl DependencyIndex {
    pub fn new(caches: ExportCaches) -> Self {
        Self { caches }
    }

    /// Export owning `obj`, if that export still exists. Used for exporter
    /// pods, services and restore claims.
    pub fn exports_for_owned<K: Resource>(&self, obj: &K) -> Vec<ExportKey> {
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        obj.meta()
            .owner_references
            .iter()
            .flatten()
            .filter(|owner| owner.kind == "VirtualMachineExport")
            .filter(|owner| self.caches.exports.get_by_key(&namespace, &owner.name).is_some())
            .map(|owner| export_key(&namespace, &owner.name))
            .collect()
    }

    /// Exports in `namespace` whose classified source satisfies `pred`
    fn exports_with_source(
        &self,
        namespace: &str,
        pred: impl Fn(&ExportSource) -> bool,
    ) -> Vec<ExportKey> {
        list_namespaced(self.caches.exports.as_ref(), namespace)
            .iter()
            .filter(|export| {
                classify_source(&export.spec.source)
                    .map(|source| pred(&source))
                    .unwrap_or(false)
            })
            .map(|export| export_key(namespace, &export.name_any()))
            .collect()
    }

    fn pvc_exports(&self, namespace: &str, claim: &str) -> Vec<ExportKey> {
        self.exports_with_source(
            namespace,
            |source| matches!(source, ExportSource::Pvc { name } if name == claim),
        )
    }

    fn vm_exports(&self, namespace: &str, vm_name: &str) -> Vec<ExportKey> {
        self.exports_with_source(
            namespace,
            |source| matches!(source, ExportSource::Vm { name } if name == vm_name),
        )
    }

    pub fn exports_for_pvc(&self, pvc: &PersistentVolumeClaim) -> Vec<ExportKey> {
        let namespace = pvc.namespace().unwrap_or_default();
        let claim = pvc.name_any();
        let mut keys = self.pvc_exports(&namespace, &claim);

        for vm in list_namespaced(self.caches.vms.as_ref(), &namespace) {
            let references_claim = vm
                .template_volumes()
                .iter()
                .any(|v| v.claim_name() == Some(claim.as_str()));
            if references_claim {
                extend_unique(&mut keys, self.vm_exports(&namespace, &vm.name_any()));
            }
        }

        extend_unique(&mut keys, self.exports_for_owned(pvc));
        keys
    }

    pub fn exports_for_snapshot(&self, snapshot: &VirtualMachineSnapshot) -> Vec<ExportKey> {
        let namespace = snapshot.namespace().unwrap_or_default();
        let snapshot_name = snapshot.name_any();
        self.exports_with_source(
            &namespace,
            |source| matches!(source, ExportSource::VmSnapshot { name } if *name == snapshot_name),
        )
    }

    pub fn exports_for_vm(&self, vm: &VirtualMachine) -> Vec<ExportKey> {
        self.vm_exports(&vm.namespace().unwrap_or_default(), &vm.name_any())
    }

    /// Exports of the VM controlling the instance, plus exports of claims
    /// the instance mounts
    pub fn exports_for_vmi(&self, vmi: &VirtualMachineInstance) -> Vec<ExportKey> {
        let namespace = vmi.namespace().unwrap_or_default();
        let mut keys = Vec::new();

        if let Some(owner) = controller_owner(&vmi.metadata) {
            if owner.kind == "VirtualMachine"
                && self.caches.vms.get_by_key(&namespace, &owner.name).is_some()
            {
                extend_unique(&mut keys, self.vm_exports(&namespace, &owner.name));
            }
        }

        for claim in vmi.claim_names() {
            if self.caches.pvcs.get_by_key(&namespace, claim).is_some() {
                extend_unique(&mut keys, self.pvc_exports(&namespace, claim));
            }
        }

        keys
    }
}
