//! In-memory resource store standing in for the orchestrator's API server.
//!
//! The store implements the API-server semantics the reconcilers depend on:
//! optimistic concurrency via resource versions, generation bumping on spec
//! change, admission validation on writes, deletion-timestamp + finalizer
//! handling, owner-reference cascading, and per-kind watch broadcasts.
//! Reconcilers only ever see [`super::api::Api`] handles; nothing in the
//! control plane assumes this particular store.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use virtrigaud_api::meta::Resource;

/// Watch channel capacity per kind. Laggy consumers re-list.
const WATCH_CAPACITY: usize = 1024;

/// Failures surfaced by the store, mirroring API-server status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// Optimistic-concurrency loss; callers re-fetch and retry on the next
    /// reconcile.
    #[error("conflict writing {kind} {key}: stale resource version")]
    Conflict { kind: &'static str, key: String },

    #[error("{kind} {key} denied by admission: {reasons}")]
    Admission {
        kind: &'static str,
        key: String,
        reasons: String,
    },
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict { .. })
    }
}

/// A watch delta for one kind.
#[derive(Debug, Clone)]
pub enum WatchEvent<R> {
    /// Object created or updated (spec, status or metadata)
    Applied(R),
    /// Object fully removed
    Deleted(R),
}

impl<R: Resource> WatchEvent<R> {
    pub fn object(&self) -> &R {
        match self {
            WatchEvent::Applied(r) => r,
            WatchEvent::Deleted(r) => r,
        }
    }
}

/// Type-erased bucket surface used for owner-reference cascading.
trait AnyBucket: Send + Sync {
    /// (namespace, name) of every live object owned by the given uid.
    fn owned_by(&self, owner_uid: &str) -> Vec<(String, String)>;

    /// Finalizer-aware delete; returns the uid when the object was fully
    /// removed (not merely marked).
    fn cascade_delete(&self, namespace: &str, name: &str) -> Option<String>;
}

pub(crate) struct Bucket<R: Resource> {
    objects: RwLock<HashMap<String, R>>,
    watch: broadcast::Sender<WatchEvent<R>>,
}

/// Result of a write: the stored object plus the uid of anything fully
/// removed (feeds the owner-reference cascade).
struct WriteOutcome<R> {
    stored: R,
    removed_uid: Option<String>,
}

impl<R: Resource> Bucket<R> {
    fn new() -> Self {
        let (watch, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            watch,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<WatchEvent<R>> {
        self.watch.subscribe()
    }

    fn key(namespace: &str, name: &str) -> String {
        format!("{}/{}", namespace, name)
    }

    pub(crate) fn get(&self, namespace: &str, name: &str) -> Option<R> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&Self::key(namespace, name))
            .cloned()
    }

    pub(crate) fn list(&self, namespace: Option<&str>) -> Vec<R> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        let mut items: Vec<R> = objects
            .values()
            .filter(|o| namespace.map_or(true, |ns| o.meta().namespace == ns))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.meta().key().cmp(&b.meta().key()));
        items
    }

    fn create(&self, mut obj: R) -> Result<R, ApiError> {
        let reasons = obj.validate(None);
        if !reasons.is_empty() {
            return Err(ApiError::Admission {
                kind: R::KIND,
                key: obj.meta().key(),
                reasons: reasons.join("; "),
            });
        }

        let key = obj.meta().key();
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        if objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists { kind: R::KIND, key });
        }

        let meta = obj.meta_mut();
        meta.uid = uuid::Uuid::new_v4().to_string();
        meta.generation = 1;
        meta.resource_version = 1;
        meta.creation_timestamp = Some(chrono::Utc::now());
        meta.deletion_timestamp = None;

        objects.insert(key, obj.clone());
        drop(objects);

        let _ = self.watch.send(WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    fn update(&self, mut obj: R) -> Result<WriteOutcome<R>, ApiError> {
        let key = obj.meta().key();
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let stored = objects
            .get(&key)
            .ok_or(ApiError::NotFound { kind: R::KIND, key: key.clone() })?
            .clone();

        if obj.meta().resource_version != stored.meta().resource_version {
            return Err(ApiError::Conflict { kind: R::KIND, key });
        }

        let reasons = obj.validate(Some(&stored));
        if !reasons.is_empty() {
            return Err(ApiError::Admission {
                kind: R::KIND,
                key,
                reasons: reasons.join("; "),
            });
        }

        // Server-owned fields are never client-writable.
        {
            let stored_meta = stored.meta();
            let meta = obj.meta_mut();
            meta.uid = stored_meta.uid.clone();
            meta.creation_timestamp = stored_meta.creation_timestamp;
            meta.deletion_timestamp = stored_meta.deletion_timestamp;
            meta.generation = stored_meta.generation;
        }

        if obj.spec_json() != stored.spec_json() {
            obj.meta_mut().generation += 1;
        }
        obj.meta_mut().resource_version += 1;

        // A deleting object whose finalizers have drained is removed now.
        if obj.meta().is_deleting() && obj.meta().finalizers.is_empty() {
            let removed_uid = obj.meta().uid.clone();
            objects.remove(&key);
            drop(objects);
            debug!(kind = R::KIND, key = %obj.meta().key(), "Object removed after finalizers drained");
            let _ = self.watch.send(WatchEvent::Deleted(obj.clone()));
            return Ok(WriteOutcome {
                stored: obj,
                removed_uid: Some(removed_uid),
            });
        }

        objects.insert(key, obj.clone());
        drop(objects);

        let _ = self.watch.send(WatchEvent::Applied(obj.clone()));
        Ok(WriteOutcome {
            stored: obj,
            removed_uid: None,
        })
    }

    /// Status writes bump the resource version but never the generation and
    /// never touch metadata.
    fn update_status(&self, obj: R) -> Result<R, ApiError> {
        let key = obj.meta().key();
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let stored = objects
            .get(&key)
            .ok_or(ApiError::NotFound { kind: R::KIND, key: key.clone() })?
            .clone();

        if obj.meta().resource_version != stored.meta().resource_version {
            return Err(ApiError::Conflict { kind: R::KIND, key });
        }

        let mut next = obj;
        *next.meta_mut() = stored.meta().clone();
        next.meta_mut().resource_version += 1;

        objects.insert(key, next.clone());
        drop(objects);

        let _ = self.watch.send(WatchEvent::Applied(next.clone()));
        Ok(next)
    }

    fn delete(&self, namespace: &str, name: &str) -> Result<Option<String>, ApiError> {
        let key = Self::key(namespace, name);
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let stored = objects.get_mut(&key).ok_or(ApiError::NotFound {
            kind: R::KIND,
            key: key.clone(),
        })?;

        if stored.meta().finalizers.is_empty() {
            let removed = stored.clone();
            let removed_uid = removed.meta().uid.clone();
            objects.remove(&key);
            drop(objects);
            let _ = self.watch.send(WatchEvent::Deleted(removed));
            return Ok(Some(removed_uid));
        }

        // Finalizers present: mark and let the owning reconciler clean up.
        if !stored.meta().is_deleting() {
            stored.meta_mut().deletion_timestamp = Some(chrono::Utc::now());
            stored.meta_mut().resource_version += 1;
            let updated = stored.clone();
            drop(objects);
            let _ = self.watch.send(WatchEvent::Applied(updated));
        }
        Ok(None)
    }
}

impl<R: Resource> AnyBucket for Bucket<R> {
    fn owned_by(&self, owner_uid: &str) -> Vec<(String, String)> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|o| o.meta().owned_by(owner_uid))
            .map(|o| (o.meta().namespace.clone(), o.meta().name.clone()))
            .collect()
    }

    fn cascade_delete(&self, namespace: &str, name: &str) -> Option<String> {
        match self.delete(namespace, name) {
            Ok(removed) => removed,
            Err(_) => None,
        }
    }
}

#[derive(Clone)]
struct BucketHandle {
    any: Arc<dyn AnyBucket>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// The in-memory cluster. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

pub(crate) struct ClusterInner {
    buckets: Mutex<HashMap<&'static str, BucketHandle>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                buckets: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Typed API handle for one kind.
    pub fn api<R: Resource>(&self) -> super::api::Api<R> {
        super::api::Api::new(self.clone(), self.bucket::<R>())
    }

    pub(crate) fn bucket<R: Resource>(&self) -> Arc<Bucket<R>> {
        let mut buckets = self.inner.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let handle = buckets.entry(R::KIND).or_insert_with(|| {
            let bucket = Arc::new(Bucket::<R>::new());
            BucketHandle {
                any: bucket.clone(),
                typed: bucket,
            }
        });
        handle
            .typed
            .clone()
            .downcast::<Bucket<R>>()
            .expect("bucket type mismatch")
    }

    /// Remove everything transitively owned by the given uids.
    ///
    /// Owned objects carrying finalizers are only marked for deletion here;
    /// their reconcilers finish the job, and the resulting removal re-enters
    /// the cascade through [`super::api::Api::update`].
    pub(crate) fn cascade(&self, removed_uids: Vec<String>) {
        let mut queue = removed_uids;
        while let Some(uid) = queue.pop() {
            let handles: Vec<BucketHandle> = {
                let buckets = self.inner.buckets.lock().unwrap_or_else(|e| e.into_inner());
                buckets.values().cloned().collect()
            };
            for handle in handles {
                for (namespace, name) in handle.any.owned_by(&uid) {
                    debug!(owner_uid = %uid, namespace = %namespace, name = %name, "Cascading delete to owned object");
                    if let Some(removed) = handle.any.cascade_delete(&namespace, &name) {
                        queue.push(removed);
                    }
                }
            }
        }
    }

    pub(crate) fn create<R: Resource>(&self, obj: R) -> Result<R, ApiError> {
        self.bucket::<R>().create(obj)
    }

    pub(crate) fn update<R: Resource>(&self, obj: R) -> Result<R, ApiError> {
        let outcome = self.bucket::<R>().update(obj)?;
        if let Some(uid) = outcome.removed_uid {
            self.cascade(vec![uid]);
        }
        Ok(outcome.stored)
    }

    pub(crate) fn update_status<R: Resource>(&self, obj: R) -> Result<R, ApiError> {
        self.bucket::<R>().update_status(obj)
    }

    pub(crate) fn delete<R: Resource>(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        if let Some(uid) = self.bucket::<R>().delete(namespace, name)? {
            self.cascade(vec![uid]);
        }
        Ok(())
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtrigaud_api::meta::{owner_reference_to, ObjectMeta, ObjectRef};
    use virtrigaud_api::vm::VM_FINALIZER;
    use virtrigaud_api::workload::Pvc;
    use virtrigaud_api::{VirtualMachine, VmMigration};

    fn vm(name: &str) -> VirtualMachine {
        VirtualMachine {
            meta: ObjectMeta::new("default", name),
            spec: virtrigaud_api::VirtualMachineSpec {
                provider_ref: ObjectRef::new("prov"),
                class_ref: ObjectRef::new("small"),
                image_ref: Some(ObjectRef::new("img")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_create_assigns_identity() {
        let cluster = Cluster::new();
        let created = cluster.create(vm("web-1")).unwrap();
        assert!(!created.meta.uid.is_empty());
        assert_eq!(created.meta.generation, 1);
        assert_eq!(created.meta.resource_version, 1);
        assert!(created.meta.creation_timestamp.is_some());

        // Duplicate names are rejected.
        assert!(matches!(
            cluster.create(vm("web-1")),
            Err(ApiError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_update_bumps_generation_only_on_spec_change() {
        let cluster = Cluster::new();
        let created = cluster.create(vm("web-1")).unwrap();

        // Status-only write: generation unchanged.
        let mut status_update = created.clone();
        status_update.status.id = "mock-1".to_string();
        let stored = cluster.update_status(status_update).unwrap();
        assert_eq!(stored.meta.generation, 1);
        assert_eq!(stored.meta.resource_version, 2);

        // Spec change: generation bumps.
        let mut spec_update = stored.clone();
        spec_update.spec.power_state = virtrigaud_api::PowerState::Off;
        let stored = cluster.update(spec_update).unwrap();
        assert_eq!(stored.meta.generation, 2);

        // Metadata-only change: no generation bump.
        let mut meta_update = stored.clone();
        meta_update.meta.labels.insert("team".to_string(), "db".to_string());
        let stored = cluster.update(meta_update).unwrap();
        assert_eq!(stored.meta.generation, 2);
    }

    #[test]
    fn test_stale_resource_version_conflicts() {
        let cluster = Cluster::new();
        let created = cluster.create(vm("web-1")).unwrap();

        let mut first = created.clone();
        first.spec.power_state = virtrigaud_api::PowerState::Off;
        cluster.update(first).unwrap();

        // Second writer still holds the old resource version.
        let mut second = created;
        second.spec.power_state = virtrigaud_api::PowerState::On;
        assert!(matches!(
            cluster.update(second),
            Err(ApiError::Conflict { .. })
        ));
    }

    #[test]
    fn test_admission_rejects_invalid_objects() {
        let cluster = Cluster::new();
        let mut bad = vm("web-1");
        bad.spec.imported_disk_ref = Some(virtrigaud_api::ImportedDiskRef {
            disk_id: "d".to_string(),
            path: "/p".to_string(),
            ..Default::default()
        });
        // Both image and imported disk populated.
        assert!(matches!(
            cluster.create(bad),
            Err(ApiError::Admission { .. })
        ));
    }

    #[test]
    fn test_finalizer_defers_removal() {
        let cluster = Cluster::new();
        let mut obj = vm("web-1");
        obj.meta.finalizers.push(VM_FINALIZER.to_string());
        let created = cluster.create(obj).unwrap();

        cluster.delete::<VirtualMachine>("default", "web-1").unwrap();
        let marked = cluster.bucket::<VirtualMachine>().get("default", "web-1").unwrap();
        assert!(marked.meta.is_deleting());

        // Dropping the finalizer removes the object.
        let mut done = marked;
        done.meta.finalizers.clear();
        cluster.update(done).unwrap();
        assert!(cluster
            .bucket::<VirtualMachine>()
            .get("default", "web-1")
            .is_none());

        drop(created);
    }

    #[test]
    fn test_owner_cascade() {
        let cluster = Cluster::new();
        let migration = cluster
            .create(VmMigration {
                meta: ObjectMeta::new("default", "mig-1"),
                spec: virtrigaud_api::VmMigrationSpec {
                    source: virtrigaud_api::migration::MigrationSource {
                        vm_ref: ObjectRef::new("db-1"),
                        provider_ref: Some(ObjectRef::new("src")),
                    },
                    target: virtrigaud_api::migration::MigrationTarget {
                        name: "db-1-new".to_string(),
                        provider_ref: ObjectRef::new("dst"),
                        class_ref: ObjectRef::new("small"),
                        ..Default::default()
                    },
                    storage: virtrigaud_api::migration::MigrationStorage {
                        size_gib: Some(10),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();

        let mut pvc = Pvc {
            meta: ObjectMeta::new("default", "mig-1-storage"),
            ..Default::default()
        };
        pvc.meta
            .owner_references
            .push(owner_reference_to(&migration, true));
        cluster.create(pvc).unwrap();

        cluster.delete::<VmMigration>("default", "mig-1").unwrap();
        assert!(cluster.bucket::<Pvc>().get("default", "mig-1-storage").is_none());
    }

    #[test]
    fn test_watch_delivers_applied_and_deleted() {
        let cluster = Cluster::new();
        let bucket = cluster.bucket::<VirtualMachine>();
        let mut rx = bucket.subscribe();

        cluster.create(vm("web-1")).unwrap();
        match rx.try_recv().unwrap() {
            WatchEvent::Applied(o) => assert_eq!(o.meta.name, "web-1"),
            other => panic!("unexpected event: {:?}", other.object().meta.name),
        }

        cluster.delete::<VirtualMachine>("default", "web-1").unwrap();
        match rx.try_recv().unwrap() {
            WatchEvent::Deleted(o) => assert_eq!(o.meta.name, "web-1"),
            other => panic!("unexpected event: {:?}", other.object().meta.name),
        }
    }
}
