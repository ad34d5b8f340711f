//! VirtualMachine reconciler.
//!
//! Drives the per-VM state machine: resolve references, create at the
//! provider under the deterministic resource name, await async tasks,
//! detect drift and reconfigure (online when the provider supports it,
//! otherwise through a power cycle), converge power state, and clean up at
//! the hypervisor before releasing the finalizer.
//!
//! Readiness is carried exclusively by the Ready condition; `phase` is
//! advisory and never consulted for decisions. Status writes only happen
//! when the status actually changed, so a converged VM produces no watch
//! traffic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use virtrigaud_api::condition::{reasons, types, Condition, ConditionStatus};
use virtrigaud_api::provider::Provider as ProviderResource;
use virtrigaud_api::vm::VM_FINALIZER;
use virtrigaud_api::workload::Secret;
use virtrigaud_api::{
    is_condition_true, set_condition, ObservedPowerState, PowerState, ProviderType,
    VirtualMachine, VmClass, VmImage, VmNetworkAttachment, VmPhase, VmSnapshot,
};
use virtrigaud_proto::provider::{
    CreateRequest, DescribeResponse, ImagePrepareRequest, PowerOp,
    PowerState as WirePowerState,
};

use crate::cluster::{ensure_finalizer, remove_finalizer, Api, Cluster, EventRecorder};
use crate::errors::ReconcileError;
use crate::framework::{Action, Reconciler, ResourceKey};
use crate::rpc::client::task_opt;
use crate::rpc::{ProviderConnector, ProviderError, SharedProvider};

/// Poll interval while a provider task is in flight.
const TASK_POLL: Duration = Duration::from_secs(2);
/// Requeue while waiting for a Provider to become Available.
const PROVIDER_WAIT: Duration = Duration::from_secs(15);
/// Requeue while a referenced resource is missing.
const REFERENCE_WAIT: Duration = Duration::from_secs(30);
/// Short hop between create/power steps within one convergence run.
const NEXT_STEP: Duration = Duration::from_millis(50);
/// Grace period handed to SHUTDOWN_GRACEFUL before force-off.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

/// Marks that the referenced image has been staged into the provider pool.
const IMAGE_PREPARED_ANNOTATION: &str = "virtrigaud.io/image-prepared";

/// Observed compute shape carried inside the provider-raw blob, parsed
/// leniently: absent fields contribute no drift signal.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ObservedShape {
    cpu: Option<u32>,
    memory_mib: Option<u64>,
    disks: Option<Vec<ObservedDisk>>,
    networks: Option<Vec<String>>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ObservedDisk {
    name: String,
    size_gib: u64,
}

/// Desired compute shape sent to Reconfigure.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct DesiredShape {
    cpu: u32,
    memory_mib: u64,
    disks: Vec<serde_json::Value>,
    networks: Vec<String>,
}

pub struct VmReconciler {
    vms: Api<VirtualMachine>,
    classes: Api<VmClass>,
    images: Api<VmImage>,
    networks: Api<VmNetworkAttachment>,
    providers: Api<ProviderResource>,
    snapshots: Api<VmSnapshot>,
    secrets: Api<Secret>,
    connector: Arc<dyn ProviderConnector>,
    recorder: EventRecorder,
}

impl VmReconciler {
    pub fn new(
        cluster: &Cluster,
        connector: Arc<dyn ProviderConnector>,
        recorder: EventRecorder,
    ) -> Self {
        Self {
            vms: cluster.api(),
            classes: cluster.api(),
            images: cluster.api(),
            networks: cluster.api(),
            providers: cluster.api(),
            snapshots: cluster.api(),
            secrets: cluster.api(),
            connector,
            recorder,
        }
    }

    /// Merge the Ready condition and write status iff anything changed.
    async fn set_ready(
        &self,
        vm: &mut VirtualMachine,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Result<(), ReconcileError> {
        let before = vm.status.clone();
        set_condition(
            &mut vm.status.conditions,
            Condition::new(types::READY, status, reason, message, vm.meta.generation),
        );
        if vm.status != before {
            *vm = self.vms.update_status(vm.clone()).await?;
        }
        Ok(())
    }

    /// Surface a provider failure as condition + event and hand the error
    /// to the framework's error policy.
    async fn surface(&self, vm: &mut VirtualMachine, err: ProviderError) -> ReconcileError {
        let reason = err.reason();
        let message = err.to_string();
        if let Err(e) = self
            .set_ready(vm, ConditionStatus::False, reason, message.clone())
            .await
        {
            // A lost status write must not mask the original failure.
            debug!(vm = %vm.meta.key(), error = %e, "Status write failed while surfacing error");
        }
        self.recorder.warning(vm, reason, message).await;
        err.into()
    }

    /// Resolve the Provider and require Available=True.
    async fn resolve_provider(
        &self,
        vm: &mut VirtualMachine,
    ) -> Result<Result<ProviderResource, Action>, ReconcileError> {
        let provider_ref = vm.spec.provider_ref.clone();
        let namespace = provider_ref.namespace_or(&vm.meta.namespace).to_string();

        match self.providers.get_opt(&namespace, &provider_ref.name).await {
            Some(provider)
                if is_condition_true(&provider.status.conditions, types::AVAILABLE) =>
            {
                Ok(Ok(provider))
            }
            found => {
                let message = if found.is_none() {
                    format!("provider {} not found", provider_ref.name)
                } else {
                    format!("provider {} is not available", provider_ref.name)
                };
                self.set_ready(
                    vm,
                    ConditionStatus::False,
                    reasons::PROVIDER_UNAVAILABLE,
                    message,
                )
                .await?;
                Ok(Err(Action::requeue_after(PROVIDER_WAIT)))
            }
        }
    }

    /// Effective cpu/memory after the per-VM resource override, in
    /// canonical units (integer vCPUs, MiB).
    fn effective_shape(vm: &VirtualMachine, class: &VmClass) -> (u32, u64) {
        let overrides = vm.spec.resources.clone().unwrap_or_default();
        (
            overrides.cpu.unwrap_or(class.spec.cpu),
            overrides.memory_mib.unwrap_or(class.spec.memory_mib),
        )
    }

    /// Effective disk list: the VM's disks, or one boot disk shaped by the
    /// class defaults.
    fn effective_disks(vm: &VirtualMachine, class: &VmClass) -> Vec<serde_json::Value> {
        let defaults = &class.spec.disk_defaults;
        if vm.spec.disks.is_empty() {
            return vec![serde_json::json!({
                "name": "disk0",
                "sizeGiB": defaults.size_gib,
                "format": defaults.format.as_str(),
            })];
        }
        vm.spec
            .disks
            .iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.name,
                    "sizeGiB": d.size_gib,
                    "format": d.format.unwrap_or(defaults.format).as_str(),
                })
            })
            .collect()
    }

    /// Build the CreateRequest: merged placement, secret-dereferenced
    /// cloud-init, class/image/networks as JSON blobs preserving
    /// provider-specific fields, attachment order preserved.
    async fn translate(
        &self,
        vm: &VirtualMachine,
        provider: &ProviderResource,
        class: &VmClass,
        image: Option<&VmImage>,
        networks: &[VmNetworkAttachment],
    ) -> Result<CreateRequest, String> {
        let user_data = match vm.spec.user_data.as_ref().and_then(|u| u.cloud_init.as_ref()) {
            Some(cloud_init) => {
                if let Some(inline) = &cloud_init.inline {
                    inline.clone().into_bytes()
                } else if let Some(secret_ref) = &cloud_init.secret_ref {
                    let secret = self
                        .secrets
                        .get_opt(&vm.meta.namespace, &secret_ref.name)
                        .await
                        .ok_or_else(|| {
                            format!("cloud-init secret {} not found", secret_ref.name)
                        })?;
                    secret
                        .spec
                        .string_data
                        .get(&secret_ref.key)
                        .ok_or_else(|| {
                            format!(
                                "cloud-init secret {} has no key {}",
                                secret_ref.name, secret_ref.key
                            )
                        })?
                        .clone()
                        .into_bytes()
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        };

        let (cpu, memory_mib) = Self::effective_shape(vm, class);
        let mut class_value = serde_json::to_value(&class.spec)
            .map_err(|e| format!("class serialization: {}", e))?;
        class_value["cpu"] = serde_json::json!(cpu);
        class_value["memoryMiB"] = serde_json::json!(memory_mib);

        let image_json = match image {
            Some(image) => serde_json::to_value(&image.spec)
                .map_err(|e| format!("image serialization: {}", e))?
                .to_string(),
            None => String::new(),
        };

        let imported_disk_json = match &vm.spec.imported_disk_ref {
            Some(imported) => serde_json::to_value(imported)
                .map_err(|e| format!("imported disk serialization: {}", e))?
                .to_string(),
            None => String::new(),
        };

        let networks_value: Vec<serde_json::Value> = networks
            .iter()
            .map(|n| serde_json::json!({ "name": n.meta.name, "spec": n.spec }))
            .collect();

        let placement = match (&vm.spec.placement, &provider.spec.default_placement) {
            (Some(vm_placement), Some(defaults)) => Some(vm_placement.merged_over(defaults)),
            (Some(vm_placement), None) => Some(vm_placement.clone()),
            (None, defaults) => defaults.clone(),
        };
        let placement_json = match placement {
            Some(p) => serde_json::to_value(&p)
                .map_err(|e| format!("placement serialization: {}", e))?
                .to_string(),
            None => String::new(),
        };

        Ok(CreateRequest {
            name: vm.meta.name.clone(),
            user_data,
            class_json: class_value.to_string(),
            image_json,
            networks_json: serde_json::Value::Array(networks_value).to_string(),
            disks_json: serde_json::Value::Array(Self::effective_disks(vm, class)).to_string(),
            placement_json,
            tags: vm.spec.tags.clone(),
            imported_disk_json,
        })
    }

    /// Stage a URL-sourced image into the provider pool before the first
    /// create, once per image. Providers without image import fetch the
    /// URL themselves during Create.
    async fn stage_image(
        &self,
        api: &SharedProvider,
        vm: &mut VirtualMachine,
        image: Option<&VmImage>,
    ) -> Result<Option<Action>, ReconcileError> {
        let Some(image) = image else {
            return Ok(None);
        };
        let url_sourced = image
            .spec
            .libvirt
            .as_ref()
            .is_some_and(|l| l.url.is_some());
        if !url_sourced || vm.meta.annotations.get(IMAGE_PREPARED_ANNOTATION) == Some(&image.meta.name)
        {
            return Ok(None);
        }

        let capabilities = match api.capabilities().await {
            Ok(c) => c,
            Err(e) => return Err(self.surface(vm, e).await),
        };
        if !capabilities.supports_image_import {
            self.recorder
                .normal(
                    vm,
                    reasons::NOT_SUPPORTED,
                    "provider lacks image import; image URL passed through to Create",
                )
                .await;
            return Ok(None);
        }

        info!(vm = %vm.meta.key(), image = %image.meta.name, "Staging image into provider pool");
        let source_json = serde_json::to_value(&image.spec)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let task = match api
            .image_prepare(ImagePrepareRequest {
                source_json,
                target_storage: String::new(),
            })
            .await
        {
            Ok(task) => task,
            Err(e) => return Err(self.surface(vm, e).await),
        };

        let mut updated = vm.clone();
        updated
            .meta
            .annotations
            .insert(IMAGE_PREPARED_ANNOTATION.to_string(), image.meta.name.clone());
        *vm = self.vms.update(updated).await?;

        if let Some(task_ref) = task {
            vm.status.task_ref = Some(task_ref);
            *vm = self.vms.update_status(vm.clone()).await?;
            return Ok(Some(Action::requeue_after(TASK_POLL)));
        }
        Ok(None)
    }

    /// Await the in-flight task, if any. Returns Some(action) while the
    /// reconcile must stop here.
    async fn await_task(
        &self,
        api: &SharedProvider,
        vm: &mut VirtualMachine,
    ) -> Result<Option<Action>, ReconcileError> {
        let Some(task_ref) = vm.status.task_ref.clone() else {
            return Ok(None);
        };

        match api.task_status(&task_ref).await {
            Ok(status) if status.done && status.error.is_empty() => {
                vm.status.task_ref = None;
                *vm = self.vms.update_status(vm.clone()).await?;
                Ok(None)
            }
            Ok(status) if status.done => {
                vm.status.task_ref = None;
                self.set_ready(
                    vm,
                    ConditionStatus::False,
                    reasons::TASK_FAILED,
                    status.error.clone(),
                )
                .await?;
                self.recorder
                    .warning(vm, reasons::TASK_FAILED, status.error.clone())
                    .await;
                Err(ProviderError::Retryable(status.error).into())
            }
            Ok(_) => Ok(Some(Action::requeue_after(TASK_POLL))),
            Err(e) if e.is_not_found() => {
                // Provider restarted and lost the task table; the operation
                // itself is idempotent, so drop the handle and re-drive.
                warn!(vm = %vm.meta.key(), task = %task_ref, "Task lost at provider, re-driving");
                vm.status.task_ref = None;
                *vm = self.vms.update_status(vm.clone()).await?;
                Ok(None)
            }
            Err(e) => Err(self.surface(vm, e).await),
        }
    }

    fn desired_power_op(power_state: PowerState) -> PowerOp {
        match power_state {
            PowerState::On => PowerOp::On,
            PowerState::Off => PowerOp::Off,
            PowerState::OffGraceful => PowerOp::ShutdownGraceful,
        }
    }

    fn observed_from_wire(state: i32) -> ObservedPowerState {
        match WirePowerState::try_from(state) {
            Ok(WirePowerState::On) => ObservedPowerState::On,
            Ok(WirePowerState::Off) => ObservedPowerState::Off,
            _ => ObservedPowerState::Unknown,
        }
    }

    /// Detect drift between the described shape and the desired one.
    /// Comparisons use canonical units; disks only count growth, shrinking
    /// is rejected at admission.
    fn drifted(
        vm: &VirtualMachine,
        class: &VmClass,
        networks: &[VmNetworkAttachment],
        describe: &DescribeResponse,
    ) -> bool {
        let observed: ObservedShape =
            serde_json::from_str(&describe.provider_raw_json).unwrap_or_default();
        let (cpu, memory_mib) = Self::effective_shape(vm, class);

        if observed.cpu.is_some_and(|c| c != cpu) {
            return true;
        }
        if observed.memory_mib.is_some_and(|m| m != memory_mib) {
            return true;
        }
        if let Some(observed_disks) = &observed.disks {
            for desired in Self::effective_disks(vm, class) {
                let name = desired["name"].as_str().unwrap_or_default();
                let size = desired["sizeGiB"].as_u64().unwrap_or_default();
                if let Some(existing) = observed_disks.iter().find(|d| d.name == name) {
                    if existing.size_gib < size {
                        return true;
                    }
                }
            }
        }
        if let Some(observed_networks) = &observed.networks {
            let mut desired: Vec<&str> = networks.iter().map(|n| n.meta.name.as_str()).collect();
            let mut observed: Vec<&str> =
                observed_networks.iter().map(String::as_str).collect();
            desired.sort_unstable();
            observed.sort_unstable();
            if desired != observed {
                return true;
            }
        }
        false
    }

    fn desired_json(
        vm: &VirtualMachine,
        class: &VmClass,
        networks: &[VmNetworkAttachment],
    ) -> String {
        let (cpu, memory_mib) = Self::effective_shape(vm, class);
        let shape = DesiredShape {
            cpu,
            memory_mib,
            disks: Self::effective_disks(vm, class),
            networks: networks.iter().map(|n| n.meta.name.clone()).collect(),
        };
        serde_json::to_value(&shape)
            .unwrap_or(serde_json::Value::Null)
            .to_string()
    }

    /// Deletion: tear down deleteOnVMDelete snapshots, delete at the
    /// hypervisor, confirm absence, then release the finalizer.
    #[instrument(skip(self, vm), fields(vm = %vm.meta.key()))]
    async fn reconcile_delete(&self, mut vm: VirtualMachine) -> Result<Action, ReconcileError> {
        if vm.status.phase != VmPhase::Deleting {
            vm.status.phase = VmPhase::Deleting;
            self.set_ready(
                &mut vm,
                ConditionStatus::False,
                reasons::DELETING,
                "deletion in progress",
            )
            .await?;
        }

        // Snapshots marked deleteOnVMDelete hold the VM's finalizer hostage
        // until they are gone.
        let blocking: Vec<VmSnapshot> = self
            .snapshots
            .list(Some(&vm.meta.namespace))
            .await
            .into_iter()
            .filter(|s| {
                s.spec.vm_ref.name == vm.meta.name
                    && s.spec
                        .retention
                        .as_ref()
                        .is_some_and(|r| r.delete_on_vm_delete)
            })
            .collect();
        if !blocking.is_empty() {
            for snapshot in &blocking {
                if !snapshot.meta.is_deleting() {
                    info!(vm = %vm.meta.key(), snapshot = %snapshot.meta.name, "Tearing down snapshot before VM deletion");
                    if let Err(e) = self
                        .snapshots
                        .delete(&snapshot.meta.namespace, &snapshot.meta.name)
                        .await
                    {
                        if !e.is_not_found() {
                            return Err(e.into());
                        }
                    }
                }
            }
            return Ok(Action::requeue_after(TASK_POLL));
        }

        if !vm.status.id.is_empty() {
            let Some(provider) = self
                .providers
                .get_opt(
                    vm.spec.provider_ref.namespace_or(&vm.meta.namespace),
                    &vm.spec.provider_ref.name,
                )
                .await
            else {
                // The Provider resource itself is gone; hypervisor cleanup
                // is impossible, releasing the finalizer is the only exit.
                warn!(vm = %vm.meta.key(), "Provider resource gone, releasing finalizer without cleanup");
                remove_finalizer(&self.vms, vm, VM_FINALIZER).await?;
                return Ok(Action::await_change());
            };
            let api = self.connector.connect(&provider).await?;

            if let Some(action) = self.await_task(&api, &mut vm).await? {
                return Ok(action);
            }

            let describe = match api.describe(&vm.status.id).await {
                Ok(d) => d,
                Err(e) => return Err(self.surface(&mut vm, e).await),
            };
            if describe.exists {
                match api.delete_vm(&vm.status.id).await {
                    Ok(task) => {
                        vm.status.task_ref = task;
                        self.vms.update_status(vm).await?;
                        return Ok(Action::requeue_after(TASK_POLL));
                    }
                    // Absent at the hypervisor: deletion already succeeded.
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(self.surface(&mut vm, e).await),
                }
            }
        }

        info!(vm = %vm.meta.key(), "VM absent at provider, releasing finalizer");
        self.recorder
            .normal(&vm, "Deleted", "VM deleted at the hypervisor")
            .await;
        remove_finalizer(&self.vms, vm, VM_FINALIZER).await?;
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for VmReconciler {
    type Object = VirtualMachine;

    fn name(&self) -> &'static str {
        "virtualmachine"
    }

    #[instrument(skip(self), fields(vm = %key))]
    async fn reconcile(&self, key: &ResourceKey) -> Result<Action, ReconcileError> {
        let Some(vm) = self.vms.get_opt(&key.namespace, &key.name).await else {
            return Ok(Action::await_change());
        };

        // Finalizer gating.
        if vm.meta.is_deleting() {
            if !vm.meta.has_finalizer(VM_FINALIZER) {
                return Ok(Action::await_change());
            }
            return self.reconcile_delete(vm).await;
        }
        if !vm.meta.has_finalizer(VM_FINALIZER) {
            ensure_finalizer(&self.vms, vm, VM_FINALIZER).await?;
            return Ok(Action::await_change());
        }

        let mut vm = vm;

        // Resolve references; the Provider must be Available.
        let provider = match self.resolve_provider(&mut vm).await? {
            Ok(provider) => provider,
            Err(action) => return Ok(action),
        };

        let class_ref = vm.spec.class_ref.clone();
        let Some(class) = self
            .classes
            .get_opt(class_ref.namespace_or(&vm.meta.namespace), &class_ref.name)
            .await
        else {
            self.set_ready(
                &mut vm,
                ConditionStatus::False,
                reasons::INVALID_SPEC,
                format!("class {} not found", class_ref.name),
            )
            .await?;
            return Ok(Action::requeue_after(REFERENCE_WAIT));
        };

        let image = match &vm.spec.image_ref {
            Some(image_ref) => {
                let Some(image) = self
                    .images
                    .get_opt(image_ref.namespace_or(&vm.meta.namespace), &image_ref.name)
                    .await
                else {
                    let message = format!("image {} not found", image_ref.name);
                    self.set_ready(&mut vm, ConditionStatus::False, reasons::INVALID_SPEC, message)
                        .await?;
                    return Ok(Action::requeue_after(REFERENCE_WAIT));
                };
                // A mock provider consumes libvirt-shaped images; everything
                // else must match exactly.
                let compatible = image.spec.provider_type == provider.spec.r#type
                    || (provider.spec.r#type == ProviderType::Mock
                        && image.spec.provider_type == ProviderType::Libvirt);
                if !compatible {
                    let message = format!(
                        "image {} targets {} but provider {} is {}",
                        image.meta.name,
                        image.spec.provider_type.as_str(),
                        provider.meta.name,
                        provider.spec.r#type.as_str(),
                    );
                    self.set_ready(
                        &mut vm,
                        ConditionStatus::False,
                        reasons::INVALID_SPEC,
                        message.clone(),
                    )
                    .await?;
                    self.recorder
                        .warning(&vm, reasons::INVALID_SPEC, message.clone())
                        .await;
                    return Err(ReconcileError::Terminal(message));
                }
                Some(image)
            }
            None => None,
        };

        let mut networks = Vec::with_capacity(vm.spec.networks.len());
        let network_refs = vm.spec.networks.clone();
        for network_ref in &network_refs {
            let Some(network) = self
                .networks
                .get_opt(
                    network_ref.namespace_or(&vm.meta.namespace),
                    &network_ref.name,
                )
                .await
            else {
                let message = format!("network attachment {} not found", network_ref.name);
                self.set_ready(&mut vm, ConditionStatus::False, reasons::INVALID_SPEC, message)
                    .await?;
                return Ok(Action::requeue_after(REFERENCE_WAIT));
            };
            networks.push(network);
        }

        let api = self.connector.connect(&provider).await?;

        // Await any in-flight task (create, image staging, power,
        // reconfigure) before driving further operations.
        if let Some(action) = self.await_task(&api, &mut vm).await? {
            return Ok(action);
        }

        // Resolve identity: create under the deterministic resource name.
        // The provider is idempotent on name, so a lost status write is
        // repaired by the same call returning the existing id.
        if vm.status.id.is_empty() {
            // URL-sourced images are staged into the provider pool first.
            if let Some(action) = self.stage_image(&api, &mut vm, image.as_ref()).await? {
                return Ok(action);
            }

            let request = match self
                .translate(&vm, &provider, &class, image.as_ref(), &networks)
                .await
            {
                Ok(request) => request,
                Err(message) => {
                    self.set_ready(
                        &mut vm,
                        ConditionStatus::False,
                        reasons::INVALID_SPEC,
                        message.clone(),
                    )
                    .await?;
                    self.recorder
                        .warning(&vm, reasons::INVALID_SPEC, message.clone())
                        .await;
                    return Err(ReconcileError::Terminal(message));
                }
            };

            let response = match api.create(request).await {
                Ok(response) => response,
                Err(e) => return Err(self.surface(&mut vm, e).await),
            };

            info!(vm = %vm.meta.key(), id = %response.id, "VM created at provider");
            vm.status.id = response.id;
            vm.status.task_ref = task_opt(response.task_ref);
            vm.status.phase = VmPhase::Provisioning;
            set_condition(
                &mut vm.status.conditions,
                Condition::new(
                    types::READY,
                    ConditionStatus::False,
                    reasons::PROVISIONING,
                    "waiting for provider to finish provisioning",
                    vm.meta.generation,
                ),
            );
            let vm = self.vms.update_status(vm).await?;
            self.recorder
                .normal(&vm, "Created", format!("VM created with id {}", vm.status.id))
                .await;
            return Ok(Action::requeue_after(NEXT_STEP));
        }

        let mut describe = match api.describe(&vm.status.id).await {
            Ok(d) => d,
            Err(e) => return Err(self.surface(&mut vm, e).await),
        };

        if !describe.exists {
            // Recreate path: the object vanished behind our back. Create
            // either reattaches to a survivor or provisions a replacement.
            warn!(vm = %vm.meta.key(), id = %vm.status.id, "VM missing at provider, recreating");
            self.recorder
                .warning(&vm, "Recreating", "VM missing at the hypervisor")
                .await;
            let request = match self
                .translate(&vm, &provider, &class, image.as_ref(), &networks)
                .await
            {
                Ok(request) => request,
                Err(message) => return Err(ReconcileError::Terminal(message)),
            };
            let response = match api.create(request).await {
                Ok(response) => response,
                Err(e) => return Err(self.surface(&mut vm, e).await),
            };
            vm.status.id = response.id;
            vm.status.task_ref = task_opt(response.task_ref);
            vm.status.phase = VmPhase::Provisioning;
            self.vms.update_status(vm).await?;
            return Ok(Action::requeue_after(NEXT_STEP));
        }

        // Drift detection and reconfigure.
        if Self::drifted(&vm, &class, &networks, &describe) {
            let capabilities = match api.capabilities().await {
                Ok(c) => c,
                Err(e) => return Err(self.surface(&mut vm, e).await),
            };
            let powered_on = describe.power_state == WirePowerState::On as i32;

            if capabilities.supports_reconfigure_online || !powered_on {
                let desired = Self::desired_json(&vm, &class, &networks);
                let task = match api.reconfigure(&vm.status.id, desired).await {
                    Ok(task) => task,
                    Err(e) => return Err(self.surface(&mut vm, e).await),
                };
                vm.status.task_ref = task;
                vm.status.phase = VmPhase::Reconfiguring;
                self.set_ready(
                    &mut vm,
                    ConditionStatus::False,
                    reasons::RECONFIGURING,
                    "applying new compute shape",
                )
                .await?;
                self.recorder
                    .normal(&vm, "Reconfigured", "compute shape change applied")
                    .await;
                return Ok(Action::requeue_after(TASK_POLL));
            }

            if vm.spec.power_state.is_on() {
                // Offline-only reconfigure: power off first; later passes
                // reconfigure at rest and power convergence brings the
                // guest back up.
                info!(vm = %vm.meta.key(), "Powering off for offline reconfigure");
                let task = match api
                    .power(&vm.status.id, PowerOp::Off, GRACEFUL_TIMEOUT)
                    .await
                {
                    Ok(task) => task,
                    Err(e) => return Err(self.surface(&mut vm, e).await),
                };
                vm.status.task_ref = task;
                vm.status.phase = VmPhase::Reconfiguring;
                self.set_ready(
                    &mut vm,
                    ConditionStatus::False,
                    reasons::RECONFIGURING,
                    "powering off for offline reconfigure",
                )
                .await?;
                return Ok(Action::requeue_after(NEXT_STEP));
            }
            // Desired state is off: power convergence below reaches the
            // reconfigurable state on its own.
        }

        // Power convergence.
        let desired_on = vm.spec.power_state.is_on();
        let observed_on = describe.power_state == WirePowerState::On as i32;
        if desired_on != observed_on {
            let op = Self::desired_power_op(vm.spec.power_state);
            debug!(vm = %vm.meta.key(), op = ?op, "Converging power state");
            let task = match api.power(&vm.status.id, op, GRACEFUL_TIMEOUT).await {
                Ok(task) => task,
                Err(e) => return Err(self.surface(&mut vm, e).await),
            };
            if let Some(task_ref) = task {
                vm.status.task_ref = Some(task_ref);
                self.set_ready(
                    &mut vm,
                    ConditionStatus::False,
                    reasons::POWER_PENDING,
                    "power operation in flight",
                )
                .await?;
                return Ok(Action::requeue_after(TASK_POLL));
            }
            // Synchronous power op: refresh the observation.
            describe = match api.describe(&vm.status.id).await {
                Ok(d) => d,
                Err(e) => return Err(self.surface(&mut vm, e).await),
            };
        }

        // Status convergence. Written only when something changed, so a
        // converged VM produces no watch traffic (and no extra RPCs beyond
        // Describe).
        let before = vm.status.clone();
        vm.status.power_state = Self::observed_from_wire(describe.power_state);
        vm.status.ips = describe.ips.clone();
        vm.status.console_url = if describe.console_url.is_empty() {
            None
        } else {
            Some(describe.console_url.clone())
        };
        vm.status.provider_raw = serde_json::from_str(&describe.provider_raw_json).ok();
        vm.status.phase = if describe.power_state == WirePowerState::On as i32 {
            VmPhase::Running
        } else {
            VmPhase::Stopped
        };

        let power_matches = desired_on == (describe.power_state == WirePowerState::On as i32);
        let action = if power_matches && vm.status.task_ref.is_none() {
            // Full sync achieved for this generation.
            vm.status.observed_generation = vm.meta.generation;
            set_condition(
                &mut vm.status.conditions,
                Condition::new(
                    types::READY,
                    ConditionStatus::True,
                    reasons::SYNCED,
                    "",
                    vm.meta.generation,
                ),
            );
            Action::await_change()
        } else {
            set_condition(
                &mut vm.status.conditions,
                Condition::new(
                    types::READY,
                    ConditionStatus::False,
                    reasons::POWER_PENDING,
                    "waiting for power state to converge",
                    vm.meta.generation,
                ),
            );
            Action::requeue_after(TASK_POLL)
        };

        if vm.status != before {
            self.vms.update_status(vm).await?;
        }
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::testutil::*;

    /// Create-then-delete happy path: id assigned, powered on, IP
    /// discovered, Ready=True; deletion removes the hypervisor object and
    /// releases the finalizer.
    #[tokio::test]
    async fn test_create_then_delete_happy_path() {
        let env = TestEnv::new();
        seed_provider(&env, "vsphere-prod").await;
        seed_class(&env, "small", 2, 4096).await;
        seed_image(&env, "ubuntu-22-04").await;
        seed_vm(&env, "web-1", "vsphere-prod", "small", "ubuntu-22-04").await;
        let key = ResourceKey::new("default", "web-1");

        // Pass 1 installs the finalizer.
        env.vm_reconciler.reconcile(&key).await.unwrap();
        let stored = env.vms().get("default", "web-1").await.unwrap();
        assert!(stored.meta.has_finalizer(VM_FINALIZER));

        // Pass 2 creates at the provider.
        env.vm_reconciler.reconcile(&key).await.unwrap();
        let stored = env.vms().get("default", "web-1").await.unwrap();
        assert!(!stored.status.id.is_empty());

        // Pass 3 powers on and reaches Ready.
        env.vm_reconciler.reconcile(&key).await.unwrap();
        let stored = env.vms().get("default", "web-1").await.unwrap();
        assert!(is_condition_true(&stored.status.conditions, types::READY));
        assert_eq!(stored.status.power_state, ObservedPowerState::On);
        assert!(!stored.status.ips.is_empty());
        assert_eq!(stored.status.observed_generation, stored.meta.generation);

        // Delete: hypervisor object removed, finalizer released, object gone.
        env.vms().delete("default", "web-1").await.unwrap();
        for _ in 0..5 {
            if env.vms().get_opt("default", "web-1").await.is_none() {
                break;
            }
            let _ = env.vm_reconciler.reconcile(&key).await;
        }
        assert!(env.vms().get_opt("default", "web-1").await.is_none());
        let mock = env.mock("vsphere-prod").await;
        assert_eq!(mock.vm_count(), 0);
    }

    /// A converged VM reconciles with zero provider mutations.
    #[tokio::test]
    async fn test_idempotent_reconcile_has_no_mutations() {
        let env = TestEnv::new();
        seed_provider(&env, "prov").await;
        seed_class(&env, "small", 2, 4096).await;
        seed_image(&env, "img").await;
        seed_vm(&env, "web-1", "prov", "small", "img").await;
        let key = ResourceKey::new("default", "web-1");

        converge_vm(&env, &key).await;
        let mock = env.mock("prov").await;
        let mutations = mock.mutation_count();

        // Converged: further reconciles are Describe-only.
        env.vm_reconciler.reconcile(&key).await.unwrap();
        env.vm_reconciler.reconcile(&key).await.unwrap();
        assert_eq!(mock.mutation_count(), mutations);

        let stored = env.vms().get("default", "web-1").await.unwrap();
        assert!(is_condition_true(&stored.status.conditions, types::READY));
    }

    /// Offline-only reconfigure: power off, apply the change, power back
    /// on, Ready with the generation observed.
    #[tokio::test]
    async fn test_offline_reconfigure_power_cycles() {
        let env = TestEnv::new();
        seed_provider(&env, "libvirt-lab").await;
        seed_class(&env, "small", 2, 4096).await;
        seed_image(&env, "img").await;
        seed_vm(&env, "web-1", "libvirt-lab", "small", "img").await;
        let key = ResourceKey::new("default", "web-1");
        converge_vm(&env, &key).await;

        // Grow the class shape: cpu 2 -> 4.
        let classes = env.cluster.api::<VmClass>();
        let mut class = classes.get("default", "small").await.unwrap();
        class.spec.cpu = 4;
        classes.update(class).await.unwrap();

        converge_vm(&env, &key).await;

        let stored = env.vms().get("default", "web-1").await.unwrap();
        assert!(is_condition_true(&stored.status.conditions, types::READY));
        assert_eq!(stored.status.power_state, ObservedPowerState::On);
        assert_eq!(stored.status.observed_generation, stored.meta.generation);

        let raw = stored.status.provider_raw.expect("provider raw");
        assert_eq!(raw["cpu"], 4);
    }

    /// Readiness coherence: Ready=True implies the generation is observed
    /// and power matches; a spec change drops Ready until re-synced.
    #[tokio::test]
    async fn test_readiness_follows_generation() {
        let env = TestEnv::new();
        seed_provider(&env, "prov").await;
        seed_class(&env, "small", 2, 4096).await;
        seed_image(&env, "img").await;
        seed_vm(&env, "web-1", "prov", "small", "img").await;
        let key = ResourceKey::new("default", "web-1");
        converge_vm(&env, &key).await;

        // Power the VM down declaratively.
        let mut stored = env.vms().get("default", "web-1").await.unwrap();
        stored.spec.power_state = PowerState::Off;
        env.vms().update(stored).await.unwrap();

        converge_vm(&env, &key).await;
        let stored = env.vms().get("default", "web-1").await.unwrap();
        assert!(is_condition_true(&stored.status.conditions, types::READY));
        assert_eq!(stored.status.power_state, ObservedPowerState::Off);
        assert_eq!(stored.status.observed_generation, stored.meta.generation);
        assert!(stored.status.ips.is_empty());
    }

    /// Provider restart resilience: a lost status write re-drives Create,
    /// which reattaches to the existing hypervisor object by name.
    #[tokio::test]
    async fn test_create_is_idempotent_across_lost_status() {
        let env = TestEnv::new();
        seed_provider(&env, "prov").await;
        seed_class(&env, "small", 2, 4096).await;
        seed_image(&env, "img").await;
        seed_vm(&env, "web-1", "prov", "small", "img").await;
        let key = ResourceKey::new("default", "web-1");

        env.vm_reconciler.reconcile(&key).await.unwrap(); // finalizer
        env.vm_reconciler.reconcile(&key).await.unwrap(); // create
        let stored = env.vms().get("default", "web-1").await.unwrap();
        let first_id = stored.status.id.clone();
        assert!(!first_id.is_empty());

        // Simulate the controller crashing before the id was persisted.
        let mut lost = stored;
        lost.status.id.clear();
        env.vms().update_status(lost).await.unwrap();

        env.vm_reconciler.reconcile(&key).await.unwrap();
        let stored = env.vms().get("default", "web-1").await.unwrap();
        assert_eq!(stored.status.id, first_id);

        // No duplicate appeared at the hypervisor.
        let mock = env.mock("prov").await;
        assert_eq!(mock.vm_count(), 1);
    }

    /// URL-sourced images are staged through ImagePrepare before the
    /// first create, exactly once.
    #[tokio::test]
    async fn test_url_image_staged_before_create() {
        use virtrigaud_api::image::LibvirtImage;
        use virtrigaud_api::VmImageSpec;

        let env = TestEnv::new();
        seed_provider(&env, "prov").await;
        seed_class(&env, "small", 2, 4096).await;
        env.cluster
            .api::<VmImage>()
            .create(VmImage {
                meta: virtrigaud_api::ObjectMeta::new("default", "cloud-img"),
                spec: VmImageSpec {
                    provider_type: ProviderType::Libvirt,
                    libvirt: Some(LibvirtImage {
                        path: None,
                        url: Some(
                            "https://cloud-images.ubuntu.com/jammy/jammy.qcow2".to_string(),
                        ),
                    }),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        seed_vm(&env, "web-1", "prov", "small", "cloud-img").await;
        let key = ResourceKey::new("default", "web-1");

        converge_vm(&env, &key).await;

        let stored = env.vms().get("default", "web-1").await.unwrap();
        assert_eq!(
            stored
                .meta
                .annotations
                .get(IMAGE_PREPARED_ANNOTATION)
                .map(String::as_str),
            Some("cloud-img")
        );
        assert!(is_condition_true(&stored.status.conditions, types::READY));
    }

    /// A VM pointing at an unavailable provider surfaces
    /// Ready=False/ProviderUnavailable and waits.
    #[tokio::test]
    async fn test_provider_unavailable_blocks_readiness() {
        let env = TestEnv::new();
        // Provider exists but never validated: no Available condition.
        let providers = env.cluster.api::<ProviderResource>();
        providers
            .create(ProviderResource {
                meta: virtrigaud_api::ObjectMeta::new("default", "cold"),
                spec: virtrigaud_api::ProviderSpec {
                    r#type: ProviderType::Mock,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        seed_class(&env, "small", 2, 4096).await;
        seed_image(&env, "img").await;
        seed_vm(&env, "web-1", "cold", "small", "img").await;
        let key = ResourceKey::new("default", "web-1");

        env.vm_reconciler.reconcile(&key).await.unwrap(); // finalizer
        let action = env.vm_reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::requeue_after(PROVIDER_WAIT));

        let stored = env.vms().get("default", "web-1").await.unwrap();
        let ready = virtrigaud_api::find_condition(&stored.status.conditions, types::READY)
            .expect("ready condition");
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, reasons::PROVIDER_UNAVAILABLE);
        assert!(stored.status.id.is_empty());
    }
}
