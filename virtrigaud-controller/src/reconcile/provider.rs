//! Provider lifecycle manager.
//!
//! Reconciles Provider resources into running provider workloads: service
//! account and role binding for credential access, a deployment pinned to
//! the provider image with the credential secret mounted at the fixed
//! path, probes driven by the Validate RPC, a service exposing the RPC
//! port, and a volume set carrying every live migration PVC at
//! `/mnt/migration-storage/<pvc>`. All mount changes land in a single
//! deployment write so one rolling restart batches them.
//!
//! The reconcile-trigger annotation needs no special handling: any
//! metadata write produces a watch event, which is exactly the forced
//! re-reconcile the migration reconciler wants.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use virtrigaud_api::condition::{reasons, types, Condition, ConditionStatus};
use virtrigaud_api::meta::{owner_reference_to, ObjectMeta};
use virtrigaud_api::provider::{Provider as ProviderResource, ProviderPhase, ProviderType};
use virtrigaud_api::set_condition;
use virtrigaud_api::workload::{
    Container, Deployment, DeploymentSpec, EnvVar, Lifecycle, PodTemplateSpec, Probe,
    ProbeAction, Pvc, ResourceRequirements, RoleBinding, RoleBindingSpec, SecurityContext,
    Service, ServiceAccount, ServiceSpec, Volume, VolumeMount, MIGRATION_PVC_LABEL,
};

use crate::cluster::{Api, Cluster, EventRecorder};
use crate::errors::ReconcileError;
use crate::framework::{Action, Reconciler, ResourceKey};
use crate::rpc::ProviderConnector;
use crate::storage::PROVIDER_MOUNT_ROOT;

/// Fixed RPC port inside the provider pod.
pub const PROVIDER_PORT: u16 = 9443;
/// Fixed credential mount path inside the provider pod.
pub const CREDENTIALS_PATH: &str = "/etc/virtrigaud/credentials";
/// preStop sleep so in-flight RPCs drain before shutdown.
const PRE_STOP_SECONDS: u32 = 15;
/// Periodic revalidation interval.
pub const VALIDATE_RESYNC: Duration = Duration::from_secs(60);

pub struct ProviderReconciler {
    providers: Api<ProviderResource>,
    deployments: Api<Deployment>,
    services: Api<Service>,
    service_accounts: Api<ServiceAccount>,
    role_bindings: Api<RoleBinding>,
    pvcs: Api<Pvc>,
    connector: Arc<dyn ProviderConnector>,
    recorder: EventRecorder,
}

impl ProviderReconciler {
    pub fn new(
        cluster: &Cluster,
        connector: Arc<dyn ProviderConnector>,
        recorder: EventRecorder,
    ) -> Self {
        Self {
            providers: cluster.api(),
            deployments: cluster.api(),
            services: cluster.api(),
            service_accounts: cluster.api(),
            role_bindings: cluster.api(),
            pvcs: cluster.api(),
            connector,
            recorder,
        }
    }

    fn workload_name(provider: &ProviderResource) -> String {
        format!("virtrigaud-provider-{}", provider.meta.name)
    }

    fn default_image(provider_type: ProviderType) -> String {
        format!(
            "ghcr.io/virtrigaud/provider-{}:v{}",
            provider_type.as_str(),
            env!("CARGO_PKG_VERSION")
        )
    }

    fn selector(provider: &ProviderResource) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), "virtrigaud-provider".to_string()),
            (
                "virtrigaud.io/provider".to_string(),
                provider.meta.name.clone(),
            ),
        ])
    }

    /// Render the desired deployment. The PVC list is complete on every
    /// render, so all pending mount changes collapse into one write.
    fn render_deployment(
        provider: &ProviderResource,
        workload_name: &str,
        migration_pvcs: &[String],
    ) -> Deployment {
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();

        if !provider.spec.credential_secret_ref.name.is_empty() {
            volumes.push(Volume::Secret {
                name: "credentials".to_string(),
                secret_name: provider.spec.credential_secret_ref.name.clone(),
            });
            mounts.push(VolumeMount {
                name: "credentials".to_string(),
                mount_path: CREDENTIALS_PATH.to_string(),
                read_only: true,
            });
        }

        for pvc in migration_pvcs {
            volumes.push(Volume::Pvc {
                name: pvc.clone(),
                claim_name: pvc.clone(),
            });
            mounts.push(VolumeMount {
                name: pvc.clone(),
                mount_path: format!("{}/{}", PROVIDER_MOUNT_ROOT, pvc),
                read_only: false,
            });
        }

        let mut env = vec![
            EnvVar {
                name: "VIRTRIGAUD_PROVIDER_TYPE".to_string(),
                value: provider.spec.r#type.as_str().to_string(),
            },
            EnvVar {
                name: "VIRTRIGAUD_HYPERVISOR_ENDPOINT".to_string(),
                value: provider.spec.endpoint.clone(),
            },
        ];
        if let Some(tls) = &provider.spec.tls {
            env.push(EnvVar {
                name: "VIRTRIGAUD_TLS_INSECURE_SKIP_VERIFY".to_string(),
                value: tls.insecure_skip_verify.to_string(),
            });
        }

        let image = if provider.spec.runtime.image.is_empty() {
            Self::default_image(provider.spec.r#type)
        } else {
            provider.spec.runtime.image.clone()
        };

        let probe = Probe {
            action: ProbeAction::Grpc {
                port: PROVIDER_PORT,
            },
            period_seconds: 10,
            timeout_seconds: 5,
            failure_threshold: 3,
        };

        Deployment {
            meta: ObjectMeta {
                labels: Self::selector(provider),
                owner_references: vec![owner_reference_to(provider, true)],
                ..ObjectMeta::new(&provider.meta.namespace, workload_name)
            },
            spec: DeploymentSpec {
                replicas: provider.spec.runtime.replicas,
                selector: Self::selector(provider),
                template: PodTemplateSpec {
                    labels: Self::selector(provider),
                    service_account: workload_name.to_string(),
                    containers: vec![Container {
                        name: "provider".to_string(),
                        image,
                        env,
                        ports: vec![PROVIDER_PORT],
                        volume_mounts: mounts,
                        // Both probes exercise Validate: liveness keeps a
                        // wedged session from lingering, readiness gates
                        // traffic on a working hypervisor connection.
                        liveness_probe: Some(probe.clone()),
                        readiness_probe: Some(probe),
                        lifecycle: Some(Lifecycle {
                            pre_stop_sleep_seconds: PRE_STOP_SECONDS,
                        }),
                        security_context: Some(SecurityContext::default()),
                        resources: Some(ResourceRequirements {
                            cpu_limit: provider.spec.runtime.cpu_limit.clone(),
                            memory_limit: provider.spec.runtime.memory_limit.clone(),
                        }),
                    }],
                    volumes,
                    termination_grace_period_seconds: PRE_STOP_SECONDS + 15,
                },
            },
            status: Default::default(),
        }
    }

    /// Live migration PVCs in the provider's namespace, sorted for a
    /// deterministic volume set.
    async fn live_migration_pvcs(&self, namespace: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .pvcs
            .list(Some(namespace))
            .await
            .into_iter()
            .filter(|p| {
                !p.meta.is_deleting() && p.meta.labels.contains_key(MIGRATION_PVC_LABEL)
            })
            .map(|p| p.meta.name)
            .collect();
        names.sort_unstable();
        names
    }

    async fn ensure_rbac(
        &self,
        provider: &ProviderResource,
        workload_name: &str,
    ) -> Result<(), ReconcileError> {
        if self
            .service_accounts
            .get_opt(&provider.meta.namespace, workload_name)
            .await
            .is_none()
        {
            self.service_accounts
                .create(ServiceAccount {
                    meta: ObjectMeta {
                        owner_references: vec![owner_reference_to(provider, true)],
                        ..ObjectMeta::new(&provider.meta.namespace, workload_name)
                    },
                    spec: (),
                })
                .await?;
        }

        if self
            .role_bindings
            .get_opt(&provider.meta.namespace, workload_name)
            .await
            .is_none()
        {
            self.role_bindings
                .create(RoleBinding {
                    meta: ObjectMeta {
                        owner_references: vec![owner_reference_to(provider, true)],
                        ..ObjectMeta::new(&provider.meta.namespace, workload_name)
                    },
                    spec: RoleBindingSpec {
                        service_account: workload_name.to_string(),
                        role: "virtrigaud:credential-reader".to_string(),
                    },
                })
                .await?;
        }
        Ok(())
    }

    async fn ensure_deployment(
        &self,
        provider: &ProviderResource,
        workload_name: &str,
        migration_pvcs: &[String],
    ) -> Result<bool, ReconcileError> {
        let desired = Self::render_deployment(provider, workload_name, migration_pvcs);
        match self
            .deployments
            .get_opt(&provider.meta.namespace, workload_name)
            .await
        {
            None => {
                info!(provider = %provider.meta.key(), deployment = %workload_name, "Creating provider deployment");
                self.deployments.create(desired).await?;
                Ok(true)
            }
            Some(existing) if existing.spec != desired.spec => {
                // One write carrying the full desired spec: mount changes
                // batch into a single rolling restart.
                info!(
                    provider = %provider.meta.key(),
                    deployment = %workload_name,
                    pvcs = migration_pvcs.len(),
                    "Updating provider deployment"
                );
                let mut next = existing;
                next.spec = desired.spec;
                next.meta.labels = desired.meta.labels;
                self.deployments.update(next).await?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn ensure_service(
        &self,
        provider: &ProviderResource,
        workload_name: &str,
    ) -> Result<(), ReconcileError> {
        if self
            .services
            .get_opt(&provider.meta.namespace, workload_name)
            .await
            .is_none()
        {
            self.services
                .create(Service {
                    meta: ObjectMeta {
                        owner_references: vec![owner_reference_to(provider, true)],
                        ..ObjectMeta::new(&provider.meta.namespace, workload_name)
                    },
                    spec: ServiceSpec {
                        selector: Self::selector(provider),
                        port: PROVIDER_PORT,
                        service_type: provider.spec.runtime.service_type,
                    },
                })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ProviderReconciler {
    type Object = ProviderResource;

    fn name(&self) -> &'static str {
        "provider"
    }

    #[instrument(skip(self), fields(provider = %key))]
    async fn reconcile(&self, key: &ResourceKey) -> Result<Action, ReconcileError> {
        let Some(provider) = self.providers.get_opt(&key.namespace, &key.name).await else {
            return Ok(Action::await_change());
        };
        if provider.meta.is_deleting() {
            // The owned workload cascades with the Provider.
            return Ok(Action::await_change());
        }

        let workload_name = Self::workload_name(&provider);

        self.ensure_rbac(&provider, &workload_name).await?;

        let migration_pvcs = self.live_migration_pvcs(&provider.meta.namespace).await;
        let restarted = self
            .ensure_deployment(&provider, &workload_name, &migration_pvcs)
            .await?;
        if restarted {
            self.recorder
                .normal(
                    &provider,
                    "WorkloadUpdated",
                    format!(
                        "provider workload rendered with {} migration volume(s)",
                        migration_pvcs.len()
                    ),
                )
                .await;
        }

        self.ensure_service(&provider, &workload_name).await?;

        let endpoint = format!(
            "http://{}.{}.svc:{}",
            workload_name, provider.meta.namespace, PROVIDER_PORT
        );

        // Validate through the same path the reconcilers use. The probe on
        // the pod covers liveness; this covers the control plane's view.
        let mut probe_target = provider.clone();
        probe_target.status.endpoint = Some(endpoint.clone());
        let validated = match self.connector.connect(&probe_target).await {
            Ok(api) => api.validate().await,
            Err(e) => Err(e),
        };

        let mut provider = provider;
        let before = provider.status.clone();
        provider.status.endpoint = Some(endpoint);
        provider.status.mounted_migration_pvcs = migration_pvcs;
        provider.status.observed_generation = provider.meta.generation;

        let action = match validated {
            Ok(()) => {
                // Available only once the latest generation is materialized
                // and the most recent Validate succeeded.
                provider.status.phase = ProviderPhase::Available;
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
                Ok(Action::requeue_after(VALIDATE_RESYNC))
            }
            Err(e) => {
                debug!(provider = %provider.meta.key(), error = %e, "Provider validation failed");
                provider.status.phase = if e.is_terminal() {
                    ProviderPhase::Failed
                } else {
                    ProviderPhase::Pending
                };
                set_condition(
                    &mut provider.status.conditions,
                    Condition::new(
                        types::AVAILABLE,
                        ConditionStatus::False,
                        reasons::VALIDATE_FAILED,
                        e.to_string(),
                        provider.meta.generation,
                    ),
                );
                self.recorder
                    .warning(&provider, reasons::VALIDATE_FAILED, e.to_string())
                    .await;
                if e.is_terminal() {
                    Ok(Action::await_change())
                } else {
                    Err(e.into())
                }
            }
        };

        if provider.status != before {
            self.providers.update_status(provider).await?;
        }
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::testutil::*;
    use virtrigaud_api::is_condition_true;
    use virtrigaud_api::provider::ProviderSpec;
    use virtrigaud_api::workload::PvcSpec;

    async fn create_provider(env: &TestEnv, name: &str) {
        env.cluster
            .api::<ProviderResource>()
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
    }

    #[tokio::test]
    async fn test_provider_materializes_workload_and_becomes_available() {
        let env = TestEnv::new();
        create_provider(&env, "lab").await;
        let key = ResourceKey::new("default", "lab");

        env.provider_reconciler.reconcile(&key).await.unwrap();

        let provider = env
            .cluster
            .api::<ProviderResource>()
            .get("default", "lab")
            .await
            .unwrap();
        assert_eq!(provider.status.phase, ProviderPhase::Available);
        assert!(is_condition_true(&provider.status.conditions, types::AVAILABLE));
        assert_eq!(
            provider.status.endpoint.as_deref(),
            Some("http://virtrigaud-provider-lab.default.svc:9443")
        );
        assert_eq!(provider.status.observed_generation, provider.meta.generation);

        let deployment = env
            .cluster
            .api::<Deployment>()
            .get("default", "virtrigaud-provider-lab")
            .await
            .unwrap();
        assert!(deployment.meta.owner_references.iter().any(|o| o.name == "lab"));
        let container = &deployment.spec.template.containers[0];
        assert!(container.liveness_probe.is_some());
        assert_eq!(
            container.lifecycle.as_ref().unwrap().pre_stop_sleep_seconds,
            PRE_STOP_SECONDS
        );

        assert!(env
            .cluster
            .api::<Service>()
            .get_opt("default", "virtrigaud-provider-lab")
            .await
            .is_some());
        assert!(env
            .cluster
            .api::<ServiceAccount>()
            .get_opt("default", "virtrigaud-provider-lab")
            .await
            .is_some());
        assert!(env
            .cluster
            .api::<RoleBinding>()
            .get_opt("default", "virtrigaud-provider-lab")
            .await
            .is_some());
    }

    /// All live migration PVCs land in one deployment write, mounted under
    /// the fixed root, and the status reflects the mounted set.
    #[tokio::test]
    async fn test_migration_pvcs_batch_into_one_deployment_update() {
        let env = TestEnv::new();
        create_provider(&env, "lab").await;
        let key = ResourceKey::new("default", "lab");
        env.provider_reconciler.reconcile(&key).await.unwrap();

        let pvcs = env.cluster.api::<Pvc>();
        for name in ["mig-a-storage", "mig-b-storage"] {
            pvcs.create(Pvc {
                meta: ObjectMeta {
                    labels: BTreeMap::from([(
                        MIGRATION_PVC_LABEL.to_string(),
                        name.trim_end_matches("-storage").to_string(),
                    )]),
                    ..ObjectMeta::new("default", name)
                },
                spec: PvcSpec {
                    size_gib: 100,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let deployments = env.cluster.api::<Deployment>();
        let before = deployments
            .get("default", "virtrigaud-provider-lab")
            .await
            .unwrap()
            .meta
            .resource_version;

        env.provider_reconciler.reconcile(&key).await.unwrap();

        let deployment = deployments
            .get("default", "virtrigaud-provider-lab")
            .await
            .unwrap();
        // Exactly one write despite two new PVCs.
        assert_eq!(deployment.meta.resource_version, before + 1);

        let mounts: Vec<&str> = deployment.spec.template.containers[0]
            .volume_mounts
            .iter()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert!(mounts.contains(&"/mnt/migration-storage/mig-a-storage"));
        assert!(mounts.contains(&"/mnt/migration-storage/mig-b-storage"));

        let provider = env
            .cluster
            .api::<ProviderResource>()
            .get("default", "lab")
            .await
            .unwrap();
        assert_eq!(
            provider.status.mounted_migration_pvcs,
            vec!["mig-a-storage".to_string(), "mig-b-storage".to_string()]
        );

        // Steady state: a further reconcile writes nothing.
        env.provider_reconciler.reconcile(&key).await.unwrap();
        let unchanged = deployments
            .get("default", "virtrigaud-provider-lab")
            .await
            .unwrap();
        assert_eq!(unchanged.meta.resource_version, before + 1);
    }
}
