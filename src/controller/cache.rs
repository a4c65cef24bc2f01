//! Read-only object caches
//!
//! Reconciliation reads dependent objects through [`ObjectCache`], a
//! snapshot fed asynchronously by a watch. Writes made by the controller are
//! not visible here until the watch delivers them.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Resource, ResourceExt};

use crate::crd::{
    DataVolume, Route, VirtualMachine, VirtualMachineExport, VirtualMachineInstance,
    VirtualMachineSnapshot, VirtualMachineSnapshotContent,
};

/// Key/value snapshot of one resource kind
pub trait ObjectCache<K>: Send + Sync {
    /// Look an object up by namespace and name
    fn get_by_key(&self, namespace: &str, name: &str) -> Option<Arc<K>>;

    /// All cached objects, in no particular order
    fn list(&self) -> Vec<Arc<K>>;
}

impl<K> ObjectCache<K> for Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get_by_key(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.state()
    }
}

/// In-memory cache, used where no watch backs a kind
pub struct MemoryCache<K> {
    objects: RwLock<BTreeMap<(String, String), Arc<K>>>,
}

impl<K> Default for MemoryCache<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K: Resource> MemoryCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache pre-populated with `objects`
    pub fn from_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let cache = Self::new();
        for obj in objects {
            cache.insert(obj);
        }
        cache
    }

    /// Insert or replace an object
    pub fn insert(&self, obj: K) {
        let key = (obj.namespace().unwrap_or_default(), obj.name_any());
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(key, Arc::new(obj));
        }
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        if let Ok(mut objects) = self.objects.write() {
            objects.remove(&(namespace.to_string(), name.to_string()));
        }
    }
}

impl<K: Send + Sync> ObjectCache<K> for MemoryCache<K> {
    fn get_by_key(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.objects
            .read()
            .ok()?
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.objects
            .read()
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Every snapshot the export controller reads from.
///
/// `config_maps` and `secrets` only hold objects of the controller's own
/// namespace; everything else is cluster wide.
#[derive(Clone)]
pub struct ExportCaches {
    pub exports: Arc<dyn ObjectCache<VirtualMachineExport>>,
    pub pods: Arc<dyn ObjectCache<Pod>>,
    pub services: Arc<dyn ObjectCache<Service>>,
    pub pvcs: Arc<dyn ObjectCache<PersistentVolumeClaim>>,
    pub data_volumes: Arc<dyn ObjectCache<DataVolume>>,
    pub vms: Arc<dyn ObjectCache<VirtualMachine>>,
    pub vmis: Arc<dyn ObjectCache<VirtualMachineInstance>>,
    pub snapshots: Arc<dyn ObjectCache<VirtualMachineSnapshot>>,
    pub snapshot_contents: Arc<dyn ObjectCache<VirtualMachineSnapshotContent>>,
    pub config_maps: Arc<dyn ObjectCache<ConfigMap>>,
    pub secrets: Arc<dyn ObjectCache<Secret>>,
    pub ingresses: Arc<dyn ObjectCache<Ingress>>,
    pub routes: Arc<dyn ObjectCache<Route>>,
}

impl ExportCaches {
    /// Caches with nothing in them
    pub fn empty() -> Self {
        Self {
            exports: Arc::new(MemoryCache::<VirtualMachineExport>::new()),
            pods: Arc::new(MemoryCache::<Pod>::new()),
            services: Arc::new(MemoryCache::<Service>::new()),
            pvcs: Arc::new(MemoryCache::<PersistentVolumeClaim>::new()),
            data_volumes: Arc::new(MemoryCache::<DataVolume>::new()),
            vms: Arc::new(MemoryCache::<VirtualMachine>::new()),
            vmis: Arc::new(MemoryCache::<VirtualMachineInstance>::new()),
            snapshots: Arc::new(MemoryCache::<VirtualMachineSnapshot>::new()),
            snapshot_contents: Arc::new(MemoryCache::<VirtualMachineSnapshotContent>::new()),
            config_maps: Arc::new(MemoryCache::<ConfigMap>::new()),
            secrets: Arc::new(MemoryCache::<Secret>::new()),
            ingresses: Arc::new(MemoryCache::<Ingress>::new()),
            routes: Arc::new(MemoryCache::<Route>::new()),
        }
    }
}

/// Objects of `cache` living in `namespace`
pub fn list_namespaced<K: Resource>(cache: &dyn ObjectCache<K>, namespace: &str) -> Vec<Arc<K>> {
    cache
        .list()
        .into_iter()
        .filter(|obj| obj.meta().namespace.as_deref() == Some(namespace))
        .collect()
}
