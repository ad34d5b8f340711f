//! VMMigration reconciler.
//!
//! One-shot cold migration through intermediary storage, advanced as a
//! phase machine with one idempotent handler per phase. Progress is
//! monotonic along the phase graph; any phase can drop to Failed on a
//! terminal error, and after a controller restart the recorded phase alone
//! is enough to resume.
//!
//! Cross-hypervisor migrations always take this cold export/import path;
//! live migration between unlike hypervisors is refused by design.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use virtrigaud_api::condition::{reasons, types, Condition, ConditionStatus};
use virtrigaud_api::meta::{owner_reference_to, ObjectMeta, ObjectRef};
use virtrigaud_api::migration::{
    ExportStatus, ImportStatus, MigrationPhase, StorageBackendType, MIGRATION_FINALIZER,
};
use virtrigaud_api::provider::{
    Provider as ProviderResource, MIGRATION_PVCS_ANNOTATION, RECONCILE_TRIGGER_ANNOTATION,
};
use virtrigaud_api::workload::{Pvc, PvcSpec, MIGRATION_PVC_LABEL};
use virtrigaud_api::{
    is_condition_true, set_condition, DiskFormat, ImportedDiskRef, ImportedDiskSource,
    ObservedPowerState, PowerState, VirtualMachine, VirtualMachineSpec, VmMigration,
};
use virtrigaud_proto::provider::{ExportDiskRequest, ImportDiskRequest};

use crate::cluster::{ensure_finalizer, remove_finalizer, Api, Cluster, EventRecorder};
use crate::errors::ReconcileError;
use crate::framework::{Action, Reconciler, ResourceKey};
use crate::rpc::{ProviderConnector, ProviderError};
use crate::storage::{same_backend, StorageUrl, Transport};

/// Poll interval for phase-local waits (provider availability, target
/// readiness, export tasks).
const PHASE_POLL: Duration = Duration::from_secs(5);
/// Export task poll; progress updates are coalesced separately.
const EXPORT_POLL: Duration = Duration::from_secs(1);
/// Short hop between phases.
const NEXT_STEP: Duration = Duration::from_millis(50);
/// Bound on PreparingStorage (PVC mount + provider restart).
const STORAGE_TIMEOUT: Duration = Duration::from_secs(300);
/// Bound on ValidatingTarget.
const TARGET_TIMEOUT: Duration = Duration::from_secs(600);
/// Minimum spacing between export progress status writes.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

pub struct MigrationReconciler {
    migrations: Api<VmMigration>,
    vms: Api<VirtualMachine>,
    providers: Api<ProviderResource>,
    pvcs: Api<Pvc>,
    connector: Arc<dyn ProviderConnector>,
    recorder: EventRecorder,
    transport: Transport,
}

impl MigrationReconciler {
    pub fn new(
        cluster: &Cluster,
        connector: Arc<dyn ProviderConnector>,
        recorder: EventRecorder,
        transport: Transport,
    ) -> Self {
        Self {
            migrations: cluster.api(),
            vms: cluster.api(),
            providers: cluster.api(),
            pvcs: cluster.api(),
            connector,
            recorder,
            transport,
        }
    }

    /// Advance to the next phase. Transitions only ever move forward along
    /// the graph (or to Failed via [`Self::fail`]).
    async fn advance(
        &self,
        migration: &mut VmMigration,
        phase: MigrationPhase,
        message: impl Into<String>,
    ) -> Result<(), ReconcileError> {
        debug_assert!(phase.ordinal() > migration.status.phase.ordinal());
        info!(
            migration = %migration.meta.key(),
            from = ?migration.status.phase,
            to = ?phase,
            "Migration phase transition"
        );
        migration.status.phase = phase;
        migration.status.phase_started_at = Some(Utc::now());
        migration.status.message = Some(message.into());
        *migration = self.migrations.update_status(migration.clone()).await?;
        Ok(())
    }

    /// Terminal failure: record the reason, keep the intermediary PVC for
    /// inspection (it is only collected when the migration is deleted).
    async fn fail(
        &self,
        migration: &mut VmMigration,
        message: impl Into<String>,
    ) -> Result<Action, ReconcileError> {
        let message = message.into();
        warn!(migration = %migration.meta.key(), message = %message, "Migration failed");
        migration.status.phase = MigrationPhase::Failed;
        migration.status.phase_started_at = Some(Utc::now());
        migration.status.message = Some(message.clone());
        set_condition(
            &mut migration.status.conditions,
            Condition::new(
                types::READY,
                ConditionStatus::False,
                reasons::MIGRATION_FAILED,
                message.clone(),
                migration.meta.generation,
            ),
        );
        *migration = self.migrations.update_status(migration.clone()).await?;
        self.recorder
            .warning(migration, reasons::MIGRATION_FAILED, message)
            .await;
        Ok(Action::await_change())
    }

    /// Route a provider error: terminal kinds fail the migration, the rest
    /// requeue with backoff leaving the phase untouched.
    async fn provider_failure(
        &self,
        migration: &mut VmMigration,
        err: ProviderError,
    ) -> Result<Action, ReconcileError> {
        if err.is_terminal() {
            return self.fail(migration, err.to_string()).await;
        }
        Err(err.into())
    }

    fn phase_elapsed(migration: &VmMigration) -> Duration {
        migration
            .status
            .phase_started_at
            .map(|t| (Utc::now() - t).to_std().unwrap_or_default())
            .unwrap_or_default()
    }

    async fn get_provider(
        &self,
        namespace: &str,
        provider_ref: &ObjectRef,
    ) -> Option<ProviderResource> {
        self.providers
            .get_opt(provider_ref.namespace_or(namespace), &provider_ref.name)
            .await
    }

    fn source_provider_ref(migration: &VmMigration, source_vm: &VirtualMachine) -> ObjectRef {
        migration
            .spec
            .source
            .provider_ref
            .clone()
            .unwrap_or_else(|| source_vm.spec.provider_ref.clone())
    }

    /// The PVC backing this migration, named deterministically.
    fn pvc_name(migration: &VmMigration) -> String {
        let prefix: String = migration.meta.name.chars().take(54).collect();
        format!("{}-storage", prefix.trim_end_matches('-'))
    }

    /// Destination URL for the exported disk.
    fn export_url(migration: &VmMigration) -> Result<String, String> {
        let storage = &migration.spec.storage;
        match storage.r#type {
            StorageBackendType::Pvc => {
                let pvc = migration
                    .status
                    .pvc_name
                    .clone()
                    .ok_or("pvc name not assigned yet")?;
                Ok(format!("pvc://{}/export.qcow2", pvc))
            }
            StorageBackendType::S3 => {
                let bucket = storage.bucket.clone().unwrap_or_default();
                Ok(format!(
                    "s3://{}/{}/export.qcow2",
                    bucket, migration.meta.name
                ))
            }
            StorageBackendType::Http => {
                let endpoint = storage.endpoint.clone().unwrap_or_default();
                Ok(format!(
                    "{}/{}/export.qcow2",
                    endpoint.trim_end_matches('/'),
                    migration.meta.name
                ))
            }
            StorageBackendType::Nfs => {
                let endpoint = storage.endpoint.clone().unwrap_or_default();
                Ok(format!(
                    "nfs://{}/{}/export.qcow2",
                    endpoint.trim_start_matches("nfs://").trim_end_matches('/'),
                    migration.meta.name
                ))
            }
        }
    }

    // =========================================================================
    // Phase handlers
    // =========================================================================

    /// Validating: source exists and is consistent, target name is free,
    /// both providers are Available.
    async fn handle_validating(
        &self,
        mut migration: VmMigration,
    ) -> Result<Action, ReconcileError> {
        let namespace = migration.meta.namespace.clone();

        let Some(source_vm) = self
            .vms
            .get_opt(&namespace, &migration.spec.source.vm_ref.name)
            .await
        else {
            let message = format!("source VM {} not found", migration.spec.source.vm_ref.name);
            return self.fail(&mut migration, message).await;
        };
        if source_vm.status.id.is_empty()
            || source_vm.status.power_state == ObservedPowerState::Unknown
        {
            let message = Some("waiting for source VM to report a consistent state".to_string());
            if migration.status.message != message {
                migration.status.message = message;
                self.migrations.update_status(migration).await?;
            }
            return Ok(Action::requeue_after(PHASE_POLL));
        }

        // The target name must be free (or already owned by this migration
        // from a previous attempt).
        if let Some(existing) = self
            .vms
            .get_opt(&namespace, &migration.spec.target.name)
            .await
        {
            if !existing.meta.owned_by(&migration.meta.uid) {
                let message = format!(
                    "target name {} is already in use",
                    migration.spec.target.name
                );
                return self.fail(&mut migration, message).await;
            }
        }

        let source_ref = Self::source_provider_ref(&migration, &source_vm);
        let source_provider = self.get_provider(&namespace, &source_ref).await;
        let target_provider = self
            .get_provider(&namespace, &migration.spec.target.provider_ref)
            .await;
        let (Some(source_provider), Some(target_provider)) = (source_provider, target_provider)
        else {
            return self
                .fail(&mut migration, "source or target provider not found")
                .await;
        };

        let both_available = is_condition_true(&source_provider.status.conditions, types::AVAILABLE)
            && is_condition_true(&target_provider.status.conditions, types::AVAILABLE);
        if !both_available {
            let message = Some("waiting for providers to be available".to_string());
            if migration.status.message != message {
                migration.status.message = message;
                self.migrations.update_status(migration).await?;
            }
            return Ok(Action::requeue_after(PHASE_POLL));
        }

        self.advance(
            &mut migration,
            MigrationPhase::PreparingStorage,
            "validation passed",
        )
        .await?;
        Ok(Action::requeue_after(NEXT_STEP))
    }

    /// PreparingStorage: ensure the migration PVC, trigger provider
    /// remounts, and wait for both providers to come back Available with
    /// the PVC mounted.
    async fn handle_preparing_storage(
        &self,
        mut migration: VmMigration,
    ) -> Result<Action, ReconcileError> {
        if migration.spec.storage.r#type != StorageBackendType::Pvc {
            self.advance(
                &mut migration,
                MigrationPhase::Exporting,
                "no intermediary volume required",
            )
            .await?;
            return Ok(Action::requeue_after(NEXT_STEP));
        }

        let namespace = migration.meta.namespace.clone();
        let pvc_name = Self::pvc_name(&migration);
        if migration.status.pvc_name.as_deref() != Some(&pvc_name) {
            migration.status.pvc_name = Some(pvc_name.clone());
            migration = self.migrations.update_status(migration).await?;
        }

        if self.pvcs.get_opt(&namespace, &pvc_name).await.is_none() {
            info!(migration = %migration.meta.key(), pvc = %pvc_name, "Creating migration PVC");
            self.pvcs
                .create(Pvc {
                    meta: ObjectMeta {
                        labels: [(
                            MIGRATION_PVC_LABEL.to_string(),
                            migration.meta.name.clone(),
                        )]
                        .into_iter()
                        .collect(),
                        owner_references: vec![owner_reference_to(&migration, true)],
                        ..ObjectMeta::new(&namespace, &pvc_name)
                    },
                    spec: PvcSpec {
                        size_gib: migration.spec.storage.size_gib.unwrap_or(10),
                        access_mode: migration
                            .spec
                            .storage
                            .access_mode
                            .clone()
                            .unwrap_or_else(|| "ReadWriteMany".to_string()),
                        storage_class: None,
                    },
                    ..Default::default()
                })
                .await?;
            self.recorder
                .normal(&migration, "StorageProvisioned", format!("PVC {} created", pvc_name))
                .await;
        }

        // Nudge both providers: the annotation forces a reconcile, which
        // re-renders the deployment with every live migration PVC mounted.
        let Some(source_vm) = self
            .vms
            .get_opt(&namespace, &migration.spec.source.vm_ref.name)
            .await
        else {
            return self.fail(&mut migration, "source VM disappeared").await;
        };
        let source_ref = Self::source_provider_ref(&migration, &source_vm);
        let trigger = migration
            .status
            .phase_started_at
            .unwrap_or_else(Utc::now)
            .to_rfc3339();

        let mut all_mounted = true;
        let target_provider_ref = migration.spec.target.provider_ref.clone();
        for provider_ref in [&source_ref, &target_provider_ref] {
            let Some(mut provider) = self.get_provider(&namespace, provider_ref).await else {
                return self.fail(&mut migration, "provider disappeared").await;
            };

            let mounted = provider
                .status
                .mounted_migration_pvcs
                .contains(&pvc_name);
            let available = is_condition_true(&provider.status.conditions, types::AVAILABLE);
            if mounted && available {
                continue;
            }
            all_mounted = false;

            if provider.meta.annotations.get(RECONCILE_TRIGGER_ANNOTATION) != Some(&trigger) {
                provider
                    .meta
                    .annotations
                    .insert(RECONCILE_TRIGGER_ANNOTATION.to_string(), trigger.clone());
                provider
                    .meta
                    .annotations
                    .insert(MIGRATION_PVCS_ANNOTATION.to_string(), pvc_name.clone());
                debug!(provider = %provider.meta.key(), pvc = %pvc_name, "Requesting provider remount");
                self.providers.update(provider).await?;
            }
        }

        if all_mounted {
            self.advance(
                &mut migration,
                MigrationPhase::Exporting,
                "migration volume mounted on both providers",
            )
            .await?;
            return Ok(Action::requeue_after(NEXT_STEP));
        }

        if Self::phase_elapsed(&migration) > STORAGE_TIMEOUT {
            return self
                .fail(
                    &mut migration,
                    "timed out waiting for providers to mount the migration volume",
                )
                .await;
        }
        Ok(Action::requeue_after(PHASE_POLL))
    }

    /// Exporting: stream the source disk to the storage URL, coalescing
    /// progress into status at most once per second.
    async fn handle_exporting(&self, mut migration: VmMigration) -> Result<Action, ReconcileError> {
        let namespace = migration.meta.namespace.clone();
        let Some(mut source_vm) = self
            .vms
            .get_opt(&namespace, &migration.spec.source.vm_ref.name)
            .await
        else {
            return self.fail(&mut migration, "source VM disappeared").await;
        };

        // Cold path: optionally power the source down declaratively and
        // wait for its reconciler to finish the shutdown.
        if migration.spec.options.power_off_source {
            if source_vm.spec.power_state != PowerState::Off {
                source_vm.spec.power_state = PowerState::Off;
                self.vms.update(source_vm).await?;
                return Ok(Action::requeue_after(PHASE_POLL));
            }
            if source_vm.status.power_state != ObservedPowerState::Off {
                return Ok(Action::requeue_after(PHASE_POLL));
            }
        }

        let source_ref = Self::source_provider_ref(&migration, &source_vm);
        let Some(provider) = self.get_provider(&namespace, &source_ref).await else {
            return self.fail(&mut migration, "source provider disappeared").await;
        };
        let api = self.connector.connect(&provider).await?;

        let url = match Self::export_url(&migration) {
            Ok(url) => url,
            Err(message) => return self.fail(&mut migration, message).await,
        };

        let Some(export) = migration.status.export.clone() else {
            info!(migration = %migration.meta.key(), url = %url, "Starting disk export");
            let task = match api
                .export_disk(ExportDiskRequest {
                    vm_id: source_vm.status.id.clone(),
                    destination_url: url.clone(),
                    format: "qcow2".to_string(),
                    verify_checksum: migration.spec.verify_checksum,
                })
                .await
            {
                Ok(task) => task,
                Err(e) => return self.provider_failure(&mut migration, e).await,
            };
            migration.status.export = Some(ExportStatus {
                url,
                task_ref: task,
                ..Default::default()
            });
            self.migrations.update_status(migration).await?;
            return Ok(Action::requeue_after(EXPORT_POLL));
        };

        if let Some(task_ref) = &export.task_ref {
            match super::poll_task(&api, task_ref).await {
                Ok(super::TaskPoll::Pending) => {
                    // Stream byte counts into status, at most once per second.
                    let status = match api.task_status(task_ref).await {
                        Ok(s) => s,
                        Err(e) => return self.provider_failure(&mut migration, e).await,
                    };
                    let stale = export.updated_at.map_or(true, |t| {
                        (Utc::now() - t).to_std().unwrap_or_default() >= PROGRESS_INTERVAL
                    });
                    if stale {
                        let mut export = export.clone();
                        export.bytes_transferred = status.transferred_bytes;
                        export.progress_percent = status.progress_percent;
                        export.updated_at = Some(Utc::now());
                        migration.status.export = Some(export);
                        self.migrations.update_status(migration).await?;
                    }
                    Ok(Action::requeue_after(EXPORT_POLL))
                }
                Ok(super::TaskPoll::Done) => {
                    let status = api.task_status(task_ref).await.ok();
                    let mut export = export.clone();
                    export.task_ref = None;
                    export.progress_percent = 100;
                    if let Some(status) = status {
                        export.bytes_transferred = status.transferred_bytes;
                    }
                    export.updated_at = Some(Utc::now());
                    migration.status.export = Some(export);
                    self.advance(
                        &mut migration,
                        MigrationPhase::Transporting,
                        "disk export complete",
                    )
                    .await?;
                    Ok(Action::requeue_after(NEXT_STEP))
                }
                Ok(super::TaskPoll::Failed(message)) => {
                    // Export is idempotent: drop the attempt and re-drive.
                    migration.status.export = None;
                    self.migrations.update_status(migration).await?;
                    Err(ProviderError::Retryable(message).into())
                }
                Ok(super::TaskPoll::Lost) => {
                    migration.status.export = None;
                    self.migrations.update_status(migration).await?;
                    Ok(Action::requeue_after(NEXT_STEP))
                }
                Err(e) => self.provider_failure(&mut migration, e).await,
            }
        } else {
            // Synchronous export already finished.
            self.advance(
                &mut migration,
                MigrationPhase::Transporting,
                "disk export complete",
            )
            .await?;
            Ok(Action::requeue_after(NEXT_STEP))
        }
    }

    /// Transporting: no-op when export landed somewhere the target can
    /// read; otherwise copy between backends through the streaming helper.
    async fn handle_transporting(
        &self,
        mut migration: VmMigration,
    ) -> Result<Action, ReconcileError> {
        let export_url = migration
            .status
            .export
            .as_ref()
            .map(|e| e.url.clone())
            .unwrap_or_default();
        let source = match StorageUrl::parse(&export_url) {
            Ok(url) => url,
            Err(e) => return self.fail(&mut migration, e.to_string()).await,
        };
        // Both sides share the migration's storage spec, so the import
        // source is the export destination; the copy only runs when the
        // two ever diverge.
        let destination = source.clone();

        if !same_backend(&source, &destination) {
            let copied = match self.transport.copy(&source, &destination).await {
                Ok(bytes) => bytes,
                Err(e) => return self.fail(&mut migration, e.to_string()).await,
            };
            debug!(migration = %migration.meta.key(), bytes = copied, "Payload transported");
        }

        self.advance(
            &mut migration,
            MigrationPhase::Importing,
            "payload available to target provider",
        )
        .await?;
        Ok(Action::requeue_after(NEXT_STEP))
    }

    /// Importing: materialize the disk into target-provider storage,
    /// enforcing the checksum when requested.
    async fn handle_importing(&self, mut migration: VmMigration) -> Result<Action, ReconcileError> {
        let namespace = migration.meta.namespace.clone();
        let Some(provider) = self
            .get_provider(&namespace, &migration.spec.target.provider_ref)
            .await
        else {
            return self.fail(&mut migration, "target provider disappeared").await;
        };
        let api = self.connector.connect(&provider).await?;

        let source_url = migration
            .status
            .export
            .as_ref()
            .map(|e| e.url.clone())
            .unwrap_or_default();

        let response = match api
            .import_disk(ImportDiskRequest {
                source_url,
                target_name: migration.spec.target.name.clone(),
                storage_hint: String::new(),
                expected_checksum: String::new(),
                verify_checksum: migration.spec.verify_checksum,
                format: "qcow2".to_string(),
            })
            .await
        {
            Ok(response) => response,
            Err(e) => return self.provider_failure(&mut migration, e).await,
        };

        info!(
            migration = %migration.meta.key(),
            disk_id = %response.disk_id,
            path = %response.path,
            "Disk imported into target provider"
        );
        migration.status.import = Some(ImportStatus {
            disk_id: response.disk_id,
            path: response.path,
            size_bytes: response.actual_size_bytes,
            format: Some(DiskFormat::Qcow2),
            checksum: if response.checksum.is_empty() {
                None
            } else {
                Some(response.checksum)
            },
        });
        self.advance(
            &mut migration,
            MigrationPhase::CreatingTarget,
            "disk materialized in target storage",
        )
        .await?;
        Ok(Action::requeue_after(NEXT_STEP))
    }

    /// CreatingTarget: create the target VirtualMachine owned by the
    /// migration, referencing the imported disk in place of an image.
    async fn handle_creating_target(
        &self,
        mut migration: VmMigration,
    ) -> Result<Action, ReconcileError> {
        let namespace = migration.meta.namespace.clone();

        if self
            .vms
            .get_opt(&namespace, &migration.spec.target.name)
            .await
            .is_none()
        {
            let Some(import) = migration.status.import.clone() else {
                return self.fail(&mut migration, "import result missing").await;
            };

            let target = &migration.spec.target;
            let vm = VirtualMachine {
                meta: ObjectMeta {
                    labels: target.labels.clone(),
                    owner_references: vec![owner_reference_to(&migration, true)],
                    ..ObjectMeta::new(&namespace, &target.name)
                },
                spec: VirtualMachineSpec {
                    provider_ref: target.provider_ref.clone(),
                    class_ref: target.class_ref.clone(),
                    image_ref: None,
                    // The full provider path rides along so the target
                    // provider can use the disk exactly where it landed.
                    imported_disk_ref: Some(ImportedDiskRef {
                        disk_id: import.disk_id,
                        path: import.path,
                        format: import.format,
                        size_bytes: Some(import.size_bytes),
                        source: ImportedDiskSource::Migration,
                        migration_ref: Some(ObjectRef::new(&migration.meta.name)),
                        checksum: import.checksum,
                    }),
                    networks: target.networks.clone(),
                    placement: target.placement.clone(),
                    power_state: PowerState::On,
                    ..Default::default()
                },
                ..Default::default()
            };
            info!(migration = %migration.meta.key(), vm = %target.name, "Creating target VM");
            self.vms.create(vm).await?;
            self.recorder
                .normal(
                    &migration,
                    "TargetCreated",
                    format!("target VM {} created from imported disk", target.name),
                )
                .await;
        }

        self.advance(
            &mut migration,
            MigrationPhase::ValidatingTarget,
            "waiting for target VM to become ready",
        )
        .await?;
        Ok(Action::requeue_after(NEXT_STEP))
    }

    /// ValidatingTarget: wait for the target VM's Ready condition (never a
    /// phase string comparison).
    async fn handle_validating_target(
        &self,
        mut migration: VmMigration,
    ) -> Result<Action, ReconcileError> {
        let namespace = migration.meta.namespace.clone();
        let target = self
            .vms
            .get_opt(&namespace, &migration.spec.target.name)
            .await;

        match target {
            Some(vm) if is_condition_true(&vm.status.conditions, types::READY) => {
                self.advance(&mut migration, MigrationPhase::Finalizing, "target VM ready")
                    .await?;
                Ok(Action::requeue_after(NEXT_STEP))
            }
            Some(_) => {
                if Self::phase_elapsed(&migration) > TARGET_TIMEOUT {
                    return self
                        .fail(&mut migration, "timed out waiting for target VM readiness")
                        .await;
                }
                Ok(Action::requeue_after(PHASE_POLL))
            }
            None => self.fail(&mut migration, "target VM disappeared").await,
        }
    }

    /// Finalizing: drop the intermediary PVC and optionally the source VM,
    /// then declare success.
    async fn handle_finalizing(
        &self,
        mut migration: VmMigration,
    ) -> Result<Action, ReconcileError> {
        let namespace = migration.meta.namespace.clone();

        if let Some(pvc_name) = migration.status.pvc_name.clone() {
            match self.pvcs.delete(&namespace, &pvc_name).await {
                Ok(()) => {
                    debug!(migration = %migration.meta.key(), pvc = %pvc_name, "Migration PVC released");
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        if migration.spec.options.delete_source_vm {
            match self
                .vms
                .delete(&namespace, &migration.spec.source.vm_ref.name)
                .await
            {
                Ok(()) => {
                    info!(
                        migration = %migration.meta.key(),
                        vm = %migration.spec.source.vm_ref.name,
                        "Source VM deletion requested"
                    );
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        migration.status.phase = MigrationPhase::Succeeded;
        migration.status.phase_started_at = Some(Utc::now());
        migration.status.message = Some("migration complete".to_string());
        migration.status.observed_generation = migration.meta.generation;
        set_condition(
            &mut migration.status.conditions,
            Condition::new(
                types::READY,
                ConditionStatus::True,
                "Succeeded",
                "",
                migration.meta.generation,
            ),
        );
        let migration = self.migrations.update_status(migration).await?;
        self.recorder
            .normal(&migration, "Succeeded", "migration complete")
            .await;
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for MigrationReconciler {
    type Object = VmMigration;

    fn name(&self) -> &'static str {
        "vmmigration"
    }

    #[instrument(skip(self), fields(migration = %key))]
    async fn reconcile(&self, key: &ResourceKey) -> Result<Action, ReconcileError> {
        let Some(migration) = self.migrations.get_opt(&key.namespace, &key.name).await else {
            return Ok(Action::await_change());
        };

        if migration.meta.is_deleting() {
            if migration.meta.has_finalizer(MIGRATION_FINALIZER) {
                // The PVC is owned by the migration: removal cascades once
                // the finalizer drops. Nothing external to clean up.
                remove_finalizer(&self.migrations, migration, MIGRATION_FINALIZER).await?;
            }
            return Ok(Action::await_change());
        }
        if !migration.meta.has_finalizer(MIGRATION_FINALIZER) {
            ensure_finalizer(&self.migrations, migration, MIGRATION_FINALIZER).await?;
            return Ok(Action::await_change());
        }

        match migration.status.phase {
            MigrationPhase::Pending => {
                let mut migration = migration;
                self.advance(&mut migration, MigrationPhase::Validating, "migration accepted")
                    .await?;
                Ok(Action::requeue_after(NEXT_STEP))
            }
            MigrationPhase::Validating => self.handle_validating(migration).await,
            MigrationPhase::PreparingStorage => self.handle_preparing_storage(migration).await,
            MigrationPhase::Exporting => self.handle_exporting(migration).await,
            MigrationPhase::Transporting => self.handle_transporting(migration).await,
            MigrationPhase::Importing => self.handle_importing(migration).await,
            MigrationPhase::CreatingTarget => self.handle_creating_target(migration).await,
            MigrationPhase::ValidatingTarget => self.handle_validating_target(migration).await,
            MigrationPhase::Finalizing => self.handle_finalizing(migration).await,
            MigrationPhase::Succeeded | MigrationPhase::Failed => Ok(Action::await_change()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::testutil::*;
    use virtrigaud_api::migration::{
        MigrationSource, MigrationStorage, MigrationTarget, VmMigrationSpec,
    };

    async fn seed_migration(env: &TestEnv, name: &str) -> VmMigration {
        env.cluster
            .api::<VmMigration>()
            .create(VmMigration {
                meta: ObjectMeta::new("default", name),
                spec: VmMigrationSpec {
                    source: MigrationSource {
                        vm_ref: ObjectRef::new("db-1"),
                        provider_ref: Some(ObjectRef::new("vsphere-prod")),
                    },
                    target: MigrationTarget {
                        name: "db-1-restored".to_string(),
                        provider_ref: ObjectRef::new("libvirt-lab"),
                        class_ref: ObjectRef::new("small"),
                        ..Default::default()
                    },
                    storage: MigrationStorage {
                        r#type: StorageBackendType::Pvc,
                        size_gib: Some(100),
                        ..Default::default()
                    },
                    verify_checksum: true,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .expect("create migration")
    }

    /// Drive every controller involved until the migration reaches a
    /// terminal phase, recording the phase sequence.
    async fn run_migration(env: &TestEnv, name: &str) -> Vec<MigrationPhase> {
        let migration_key = ResourceKey::new("default", name);
        let target_key = ResourceKey::new("default", "db-1-restored");
        let source_provider_key = ResourceKey::new("default", "vsphere-prod");
        let target_provider_key = ResourceKey::new("default", "libvirt-lab");
        let api = env.cluster.api::<VmMigration>();

        let mut phases = Vec::new();
        for _ in 0..80 {
            let migration = api.get("default", name).await.expect("migration");
            if phases.last() != Some(&migration.status.phase) {
                phases.push(migration.status.phase);
            }
            if migration.status.phase.is_terminal() {
                break;
            }
            let _ = env.migration_reconciler.reconcile(&migration_key).await;
            let _ = env.provider_reconciler.reconcile(&source_provider_key).await;
            let _ = env.provider_reconciler.reconcile(&target_provider_key).await;
            let _ = env.vm_reconciler.reconcile(&target_key).await;
        }
        phases
    }

    /// PVC-backed migration end to end: PVC provisioned and mounted,
    /// export + checksum-verified import, target VM created over the
    /// imported disk, Succeeded, PVC released.
    #[tokio::test]
    async fn test_pvc_backed_migration_succeeds() {
        let env = TestEnv::new();
        // Providers are reconciled (not hand-seeded) so the mounted-PVC
        // plumbing runs for real.
        for name in ["vsphere-prod", "libvirt-lab"] {
            env.cluster
                .api::<ProviderResource>()
                .create(ProviderResource {
                    meta: ObjectMeta::new("default", name),
                    spec: virtrigaud_api::ProviderSpec {
                        r#type: virtrigaud_api::ProviderType::Mock,
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .await
                .unwrap();
            env.provider_reconciler
                .reconcile(&ResourceKey::new("default", name))
                .await
                .unwrap();
        }
        seed_class(&env, "small", 2, 4096).await;
        seed_image(&env, "img").await;
        seed_vm(&env, "db-1", "vsphere-prod", "small", "img").await;
        converge_vm(&env, &ResourceKey::new("default", "db-1")).await;

        seed_migration(&env, "mig-1").await;
        let phases = run_migration(&env, "mig-1").await;

        let migration = env
            .cluster
            .api::<VmMigration>()
            .get("default", "mig-1")
            .await
            .unwrap();
        assert_eq!(migration.status.phase, MigrationPhase::Succeeded);

        // Monotonic phase progress (Pending is the initial default).
        let ordinals: Vec<u8> = phases.iter().map(|p| p.ordinal()).collect();
        assert!(ordinals.windows(2).all(|w| w[0] < w[1]), "{:?}", phases);

        // Import verified the checksum and recorded the provider path.
        let import = migration.status.import.expect("import status");
        assert!(import.checksum.is_some());
        assert!(import.path.ends_with("db-1-restored.qcow2"));

        // Target VM is Ready, owned by the migration, and carries the
        // imported disk in place of an image.
        let target = env.vms().get("default", "db-1-restored").await.unwrap();
        assert!(target.meta.owned_by(&migration.meta.uid));
        assert!(target.spec.image_ref.is_none());
        let imported = target.spec.imported_disk_ref.as_ref().expect("imported disk");
        assert_eq!(imported.source, ImportedDiskSource::Migration);
        assert_eq!(imported.path, import.path);
        assert!(is_condition_true(&target.status.conditions, types::READY));

        // The guest booted from the disk in place: hostname preserved from
        // the source VM, no copy into a synthetic template.
        let raw = target.status.provider_raw.expect("provider raw");
        assert_eq!(raw["hostname"], "db-1");
        assert_eq!(raw["importedDiskPath"], serde_json::json!(import.path));

        // Finalizing released the PVC.
        assert!(env
            .cluster
            .api::<Pvc>()
            .get_opt("default", "mig-1-storage")
            .await
            .is_none());
    }

    /// A checksum mismatch on import fails the migration terminally; the
    /// intermediary PVC survives for inspection and is only collected when
    /// the migration itself is deleted.
    #[tokio::test]
    async fn test_failed_migration_keeps_pvc_until_deleted() {
        let env = TestEnv::new();
        for name in ["vsphere-prod", "libvirt-lab"] {
            env.cluster
                .api::<ProviderResource>()
                .create(ProviderResource {
                    meta: ObjectMeta::new("default", name),
                    spec: virtrigaud_api::ProviderSpec {
                        r#type: virtrigaud_api::ProviderType::Mock,
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .await
                .unwrap();
            env.provider_reconciler
                .reconcile(&ResourceKey::new("default", name))
                .await
                .unwrap();
        }
        seed_class(&env, "small", 2, 4096).await;
        seed_image(&env, "img").await;
        seed_vm(&env, "db-1", "vsphere-prod", "small", "img").await;
        converge_vm(&env, &ResourceKey::new("default", "db-1")).await;

        seed_migration(&env, "mig-2").await;
        let migration_key = ResourceKey::new("default", "mig-2");
        let api = env.cluster.api::<VmMigration>();

        // Drive until the payload is exported, then corrupt it so the
        // verified import must fail.
        let mut corrupted = false;
        for _ in 0..80 {
            let migration = api.get("default", "mig-2").await.unwrap();
            if migration.status.phase.is_terminal() {
                break;
            }
            if !corrupted && migration.status.phase == MigrationPhase::Importing {
                let payload = env
                    .connector
                    .mount_root()
                    .join("mig-2-storage")
                    .join("export.qcow2");
                std::fs::write(&payload, b"garbage").unwrap();
                corrupted = true;
            }
            let _ = env.migration_reconciler.reconcile(&migration_key).await;
            let _ = env
                .provider_reconciler
                .reconcile(&ResourceKey::new("default", "vsphere-prod"))
                .await;
            let _ = env
                .provider_reconciler
                .reconcile(&ResourceKey::new("default", "libvirt-lab"))
                .await;
        }
        assert!(corrupted, "migration never reached Importing");

        let migration = api.get("default", "mig-2").await.unwrap();
        assert_eq!(migration.status.phase, MigrationPhase::Failed);
        assert!(migration
            .status
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("checksum"));

        // Failure keeps the PVC around for inspection.
        let pvcs = env.cluster.api::<Pvc>();
        assert!(pvcs.get_opt("default", "mig-2-storage").await.is_some());

        // Deleting the migration releases it through ownership.
        api.delete("default", "mig-2").await.unwrap();
        let _ = env.migration_reconciler.reconcile(&migration_key).await;
        assert!(api.get_opt("default", "mig-2").await.is_none());
        assert!(pvcs.get_opt("default", "mig-2-storage").await.is_none());
    }

    /// Admission rejects a VM carrying both an image and an imported disk
    /// (the migration path never produces one).
    #[tokio::test]
    async fn test_target_vm_disk_source_exclusivity() {
        let env = TestEnv::new();
        let result = env
            .vms()
            .create(VirtualMachine {
                meta: ObjectMeta::new("default", "both-disks"),
                spec: VirtualMachineSpec {
                    provider_ref: ObjectRef::new("prov"),
                    class_ref: ObjectRef::new("small"),
                    image_ref: Some(ObjectRef::new("img")),
                    imported_disk_ref: Some(ImportedDiskRef {
                        disk_id: "disk-1".to_string(),
                        path: "/pool/disk-1.qcow2".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;
        assert!(matches!(
            result,
            Err(crate::cluster::ApiError::Admission { .. })
        ));
    }
}
