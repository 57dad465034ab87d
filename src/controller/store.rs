//! Keys the kube-runtime controller may reconcile
//!
//! The controller only runs passes for objects present in its reflector
//! store, so the store here tracks requests rather than mirroring the
//! remote cluster exactly. Watch events upsert objects, a matched deletion
//! stays behind as a tombstone, and a trigger for an unknown key inserts a
//! key-only stub. An entry is evicted once a pass finds its source gone.

use kube::api::{ApiResource, DynamicObject};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use parking_lot::Mutex;

use crate::crd::GroupVersionKind;
use crate::sync::ReconcileRequest;
use crate::Error;

/// Reflector store of schedulable keys for one kind
pub struct RequestStore {
    gvk: GroupVersionKind,
    resource: ApiResource,
    writer: Mutex<Writer<DynamicObject>>,
    reader: Store<DynamicObject>,
}

impl RequestStore {
    /// Empty store for objects of `gvk`
    pub fn new(gvk: GroupVersionKind) -> Self {
        // The plural is a guess; the resource only keys the store and never
        // reaches the API server.
        let resource = ApiResource::from_gvk(&gvk);
        let mut writer = Writer::new(resource.clone());
        // Filled incrementally rather than by a list, so it is ready at once
        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitDone);
        let reader = writer.as_reader();
        Self {
            gvk,
            resource,
            writer: Mutex::new(writer),
            reader,
        }
    }

    /// Kind of every object in the store
    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    /// Dynamic type the controller keys objects by
    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    /// Read handle for the controller
    pub fn reader(&self) -> Store<DynamicObject> {
        self.reader.clone()
    }

    /// Reference to the object `namespace/name`
    pub fn object_ref(&self, namespace: Option<&str>, name: &str) -> ObjectRef<DynamicObject> {
        let obj_ref = ObjectRef::new_with(name, self.resource.clone());
        match namespace {
            Some(ns) => obj_ref.within(ns),
            None => obj_ref,
        }
    }

    /// Stored entry for `namespace/name`
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        self.reader
            .get(&self.object_ref(namespace, name))
            .map(|obj| obj.as_ref().clone())
    }

    /// Record the latest known state of an object
    pub fn upsert(&self, obj: &DynamicObject) {
        self.writer
            .lock()
            .apply_watcher_event(&watcher::Event::Apply(obj.clone()));
    }

    /// Forget an object outright
    pub fn remove(&self, obj: &DynamicObject) {
        self.writer
            .lock()
            .apply_watcher_event(&watcher::Event::Delete(obj.clone()));
    }

    /// Resolve a request to the reference the controller schedules.
    ///
    /// Inserts a stub when the key is unknown. `Ok(None)` for requests about
    /// another kind, which this store's controller cannot run.
    pub fn admit(
        &self,
        request: &ReconcileRequest,
    ) -> Result<Option<ObjectRef<DynamicObject>>, Error> {
        let key = request.object_key()?;
        if key.gvk != self.gvk {
            return Ok(None);
        }
        let obj_ref = self.object_ref(key.namespace.as_deref(), &key.name);

        let mut writer = self.writer.lock();
        if self.reader.get(&obj_ref).is_none() {
            let mut stub = DynamicObject::new(&key.name, &self.resource);
            stub.metadata.namespace = key.namespace;
            writer.apply_watcher_event(&watcher::Event::Apply(stub));
        }
        Ok(Some(obj_ref))
    }

    /// Drop `obj` after a pass found its source gone.
    ///
    /// Kept when the entry has since been replaced by a newer object.
    pub fn evict(&self, obj: &DynamicObject) {
        let obj_ref = ObjectRef::from_obj_with(obj, self.resource.clone());
        let mut writer = self.writer.lock();
        let unchanged = self.reader.get(&obj_ref).is_some_and(|current| {
            current.metadata.uid == obj.metadata.uid
                && current.metadata.resource_version == obj.metadata.resource_version
        });
        if unchanged {
            writer.apply_watcher_event(&watcher::Event::Delete(obj.clone()));
        }
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.reader.state().len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
