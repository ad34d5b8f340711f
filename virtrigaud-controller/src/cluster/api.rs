//! Typed API handles: the only surface reconcilers use to read and write
//! resources. Reads come from the store's watch-backed state; writes go
//! through admission and optimistic concurrency.

use std::sync::Arc;

use tokio::sync::broadcast;

use virtrigaud_api::meta::Resource;

use super::store::{ApiError, Bucket, Cluster, WatchEvent};

/// Typed handle over one resource kind.
pub struct Api<R: Resource> {
    cluster: Cluster,
    bucket: Arc<Bucket<R>>,
}

impl<R: Resource> Clone for Api<R> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            bucket: self.bucket.clone(),
        }
    }
}

impl<R: Resource> Api<R> {
    pub(crate) fn new(cluster: Cluster, bucket: Arc<Bucket<R>>) -> Self {
        Self { cluster, bucket }
    }

    /// Fetch an object; NotFound is an error.
    pub async fn get(&self, namespace: &str, name: &str) -> Result<R, ApiError> {
        self.bucket.get(namespace, name).ok_or(ApiError::NotFound {
            kind: R::KIND,
            key: format!("{}/{}", namespace, name),
        })
    }

    /// Fetch an object; absence is None.
    pub async fn get_opt(&self, namespace: &str, name: &str) -> Option<R> {
        self.bucket.get(namespace, name)
    }

    /// List objects, optionally restricted to one namespace.
    pub async fn list(&self, namespace: Option<&str>) -> Vec<R> {
        self.bucket.list(namespace)
    }

    pub async fn create(&self, obj: R) -> Result<R, ApiError> {
        self.cluster.create(obj)
    }

    /// Write spec/metadata. Bumps the generation when the spec changed and
    /// finishes deletion when the last finalizer is dropped.
    pub async fn update(&self, obj: R) -> Result<R, ApiError> {
        self.cluster.update(obj)
    }

    /// Write status only; never bumps the generation.
    pub async fn update_status(&self, obj: R) -> Result<R, ApiError> {
        self.cluster.update_status(obj)
    }

    /// Request deletion. Objects with finalizers are marked and removed
    /// once the finalizers drain.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        self.cluster.delete::<R>(namespace, name)
    }

    /// Subscribe to this kind's watch stream.
    pub fn watch(&self) -> broadcast::Receiver<WatchEvent<R>> {
        self.bucket.subscribe()
    }
}

/// Ensure the finalizer is present, writing through the API when missing.
/// Returns the (possibly updated) object and whether a write happened.
pub async fn ensure_finalizer<R: Resource>(
    api: &Api<R>,
    mut obj: R,
    finalizer: &str,
) -> Result<(R, bool), ApiError> {
    if !obj.meta_mut().add_finalizer(finalizer) {
        return Ok((obj, false));
    }
    let updated = api.update(obj).await?;
    Ok((updated, true))
}

/// Drop the finalizer, allowing deletion to complete. No-op when absent.
pub async fn remove_finalizer<R: Resource>(
    api: &Api<R>,
    mut obj: R,
    finalizer: &str,
) -> Result<R, ApiError> {
    if !obj.meta_mut().remove_finalizer(finalizer) {
        return Ok(obj);
    }
    api.update(obj).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtrigaud_api::meta::{ObjectMeta, ObjectRef};
    use virtrigaud_api::vm::VM_FINALIZER;
    use virtrigaud_api::VirtualMachine;

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

    #[tokio::test]
    async fn test_finalizer_helpers_round_trip() {
        let cluster = Cluster::new();
        let api = cluster.api::<VirtualMachine>();
        let created = api.create(vm("web-1")).await.unwrap();

        let (with_finalizer, added) = ensure_finalizer(&api, created, VM_FINALIZER).await.unwrap();
        assert!(added);
        assert!(with_finalizer.meta.has_finalizer(VM_FINALIZER));

        // Idempotent.
        let (same, added) = ensure_finalizer(&api, with_finalizer, VM_FINALIZER)
            .await
            .unwrap();
        assert!(!added);

        let without = remove_finalizer(&api, same, VM_FINALIZER).await.unwrap();
        assert!(!without.meta.has_finalizer(VM_FINALIZER));
    }
}
