//! The per-kind reconcilers: VirtualMachine, VMSnapshot, VMMigration and
//! the Provider lifecycle manager.

pub mod cron;
pub mod migration;
pub mod provider;
pub mod snapshot;
pub mod vm;

pub use migration::MigrationReconciler;
pub use provider::ProviderReconciler;
pub use snapshot::SnapshotReconciler;
pub use vm::VmReconciler;

use crate::rpc::{ProviderError, SharedProvider};

/// Outcome of polling an async provider task.
#[derive(Debug)]
pub(crate) enum TaskPoll {
    Done,
    Pending,
    Failed(String),
    /// The provider restarted and no longer knows the task; the underlying
    /// operation is idempotent, so callers re-drive it.
    Lost,
}

pub(crate) async fn poll_task(
    api: &SharedProvider,
    task_ref: &str,
) -> Result<TaskPoll, ProviderError> {
    match api.task_status(task_ref).await {
        Ok(status) if status.done && status.error.is_empty() => Ok(TaskPoll::Done),
        Ok(status) if status.done => Ok(TaskPoll::Failed(status.error)),
        Ok(_) => Ok(TaskPoll::Pending),
        Err(e) if e.is_not_found() => Ok(TaskPoll::Lost),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Arc;
    use std::time::Duration;

    use virtrigaud_api::condition::{types, Condition, ConditionStatus};
    use virtrigaud_api::image::LibvirtImage;
    use virtrigaud_api::meta::{ObjectMeta, ObjectRef};
    use virtrigaud_api::provider::Provider as ProviderResource;
    use virtrigaud_api::{
        is_condition_true, set_condition, ProviderPhase, ProviderSpec, ProviderType,
        VirtualMachine, VirtualMachineSpec, VmClass, VmClassSpec, VmImage, VmImageSpec,
    };
    use virtrigaud_provider_mock::{MockOptions, MockProvider};

    use crate::cluster::{Api, Cluster, EventRecorder};
    use crate::framework::{Action, Reconciler, ResourceKey};
    use crate::rpc::InProcessConnector;
    use crate::storage::Transport;

    use super::{MigrationReconciler, ProviderReconciler, SnapshotReconciler, VmReconciler};

    /// In-memory cluster + in-process mock providers + all reconcilers.
    pub(crate) struct TestEnv {
        pub cluster: Cluster,
        pub connector: Arc<InProcessConnector>,
        pub vm_reconciler: VmReconciler,
        pub snapshot_reconciler: SnapshotReconciler,
        pub migration_reconciler: MigrationReconciler,
        pub provider_reconciler: ProviderReconciler,
        _tempdir: tempfile::TempDir,
    }

    impl TestEnv {
        pub fn new() -> Self {
            let tempdir = tempfile::tempdir().expect("tempdir");
            let cluster = Cluster::new();
            let connector = Arc::new(InProcessConnector::new(MockOptions {
                synchronous: true,
                task_latency: Duration::ZERO,
                mount_root: tempdir.path().join("mounts"),
                pool_root: tempdir.path().join("pools"),
            }));
            let recorder = EventRecorder::new(cluster.api(), "test-controller");
            let transport = Transport::new(tempdir.path().join("mounts"));

            Self {
                vm_reconciler: VmReconciler::new(&cluster, connector.clone(), recorder.clone()),
                snapshot_reconciler: SnapshotReconciler::new(
                    &cluster,
                    connector.clone(),
                    recorder.clone(),
                ),
                migration_reconciler: MigrationReconciler::new(
                    &cluster,
                    connector.clone(),
                    recorder.clone(),
                    transport,
                ),
                provider_reconciler: ProviderReconciler::new(
                    &cluster,
                    connector.clone(),
                    recorder,
                ),
                cluster,
                connector,
                _tempdir: tempdir,
            }
        }

        pub fn vms(&self) -> Api<VirtualMachine> {
            self.cluster.api()
        }

        /// The mock hypervisor behind a seeded provider.
        pub async fn mock(&self, provider: &str) -> Arc<MockProvider> {
            let provider = self
                .cluster
                .api::<ProviderResource>()
                .get("default", provider)
                .await
                .expect("provider seeded");
            self.connector.mock_for(&provider)
        }
    }

    /// Create a mock-typed Provider already marked Available, the way the
    /// lifecycle manager leaves it after a successful Validate.
    pub(crate) async fn seed_provider(env: &TestEnv, name: &str) -> ProviderResource {
        let api = env.cluster.api::<ProviderResource>();
        let mut provider = api
            .create(ProviderResource {
                meta: ObjectMeta::new("default", name),
                spec: ProviderSpec {
                    r#type: ProviderType::Mock,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .expect("create provider");

        provider.status.phase = ProviderPhase::Available;
        provider.status.endpoint =
            Some(format!("http://virtrigaud-provider-{}.default.svc:9443", name));
        provider.status.observed_generation = provider.meta.generation;
        set_condition(
            &mut provider.status.conditions,
            Condition::new(
                types::AVAILABLE,
                ConditionStatus::True,
                "Validated",
                "",
                provider.meta.generation,
            ),
        );
        api.update_status(provider).await.expect("provider status")
    }

    pub(crate) async fn seed_class(env: &TestEnv, name: &str, cpu: u32, memory_mib: u64) {
        env.cluster
            .api::<VmClass>()
            .create(VmClass {
                meta: ObjectMeta::new("default", name),
                spec: VmClassSpec {
                    cpu,
                    memory_mib,
                    ..Default::default()
                },
            })
            .await
            .expect("create class");
    }

    pub(crate) async fn seed_image(env: &TestEnv, name: &str) {
        env.cluster
            .api::<VmImage>()
            .create(VmImage {
                meta: ObjectMeta::new("default", name),
                spec: VmImageSpec {
                    provider_type: ProviderType::Libvirt,
                    libvirt: Some(LibvirtImage {
                        path: Some(format!("/var/lib/images/{}.qcow2", name)),
                        url: None,
                    }),
                    ..Default::default()
                },
            })
            .await
            .expect("create image");
    }

    pub(crate) async fn seed_vm(
        env: &TestEnv,
        name: &str,
        provider: &str,
        class: &str,
        image: &str,
    ) -> VirtualMachine {
        env.vms()
            .create(VirtualMachine {
                meta: ObjectMeta::new("default", name),
                spec: VirtualMachineSpec {
                    provider_ref: ObjectRef::new(provider),
                    class_ref: ObjectRef::new(class),
                    image_ref: Some(ObjectRef::new(image)),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .expect("create vm")
    }

    /// Drive the VM reconciler until Ready for the current generation.
    pub(crate) async fn converge_vm(env: &TestEnv, key: &ResourceKey) {
        for _ in 0..25 {
            let action = env
                .vm_reconciler
                .reconcile(key)
                .await
                .expect("vm reconcile");
            if action == Action::await_change() {
                if let Some(vm) = env.vms().get_opt(&key.namespace, &key.name).await {
                    if is_condition_true(&vm.status.conditions, types::READY) {
                        return;
                    }
                } else {
                    return;
                }
            }
        }
        panic!("vm {} did not converge", key);
    }
}
