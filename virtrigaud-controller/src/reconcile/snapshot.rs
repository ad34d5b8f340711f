//! VMSnapshot reconciler.
//!
//! Creates and deletes provider snapshots for a parent VM, executes
//! one-shot reverts requested through an annotation (restoring the
//! pre-revert power state afterwards), enforces retention (maxAge /
//! maxCount, oldest first) on the parent's snapshot set, and materializes
//! concrete snapshots from cron-scheduled templates with per-bucket
//! deduplication.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use virtrigaud_api::condition::{reasons, types, Condition, ConditionStatus};
use virtrigaud_api::meta::{owner_reference_to, ObjectMeta};
use virtrigaud_api::provider::Provider as ProviderResource;
use virtrigaud_api::snapshot::{REVERT_ANNOTATION, SNAPSHOT_FINALIZER};
use virtrigaud_api::{
    is_condition_true, set_condition, ObservedPowerState, PowerState, VirtualMachine,
    VmSnapshot,
};
use virtrigaud_proto::provider::{PowerOp, PowerState as WirePowerState, SnapshotCreateRequest};

use crate::cluster::{ensure_finalizer, remove_finalizer, Api, Cluster, EventRecorder};
use crate::errors::ReconcileError;
use crate::framework::{Action, Reconciler, ResourceKey};
use crate::rpc::client::task_opt;
use crate::rpc::{ProviderConnector, ProviderError, SharedProvider};

use super::cron::CronSchedule;
use super::{poll_task, TaskPoll};

/// Poll interval while a provider task is in flight.
const TASK_POLL: Duration = Duration::from_secs(2);
/// Requeue while the parent VM has no provider identity yet.
const VM_WAIT: Duration = Duration::from_secs(5);
/// Requeue while the Provider is not Available.
const PROVIDER_WAIT: Duration = Duration::from_secs(15);
/// Requeue for schedule templates between bucket checks.
const TEMPLATE_RESYNC: Duration = Duration::from_secs(30);
/// Short hop between steps within one convergence run.
const NEXT_STEP: Duration = Duration::from_millis(50);

/// Resync period for the snapshot controller; drives the periodic
/// retention sweep.
pub const RETENTION_RESYNC: Duration = Duration::from_secs(60);

pub struct SnapshotReconciler {
    snapshots: Api<VmSnapshot>,
    vms: Api<VirtualMachine>,
    providers: Api<ProviderResource>,
    connector: Arc<dyn ProviderConnector>,
    recorder: EventRecorder,
}

impl SnapshotReconciler {
    pub fn new(
        cluster: &Cluster,
        connector: Arc<dyn ProviderConnector>,
        recorder: EventRecorder,
    ) -> Self {
        Self {
            snapshots: cluster.api(),
            vms: cluster.api(),
            providers: cluster.api(),
            connector,
            recorder,
        }
    }

    /// Merge the Ready condition and write status iff anything changed.
    async fn set_ready(
        &self,
        snapshot: &mut VmSnapshot,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Result<(), ReconcileError> {
        let before = snapshot.status.clone();
        set_condition(
            &mut snapshot.status.conditions,
            Condition::new(types::READY, status, reason, message, snapshot.meta.generation),
        );
        if snapshot.status != before {
            *snapshot = self.snapshots.update_status(snapshot.clone()).await?;
        }
        Ok(())
    }

    async fn surface(&self, snapshot: &mut VmSnapshot, err: ProviderError) -> ReconcileError {
        let reason = err.reason();
        let message = err.to_string();
        if let Err(e) = self
            .set_ready(snapshot, ConditionStatus::False, reason, message.clone())
            .await
        {
            debug!(snapshot = %snapshot.meta.key(), error = %e, "Status write failed while surfacing error");
        }
        self.recorder.warning(snapshot, reason, message).await;
        err.into()
    }

    /// Await the in-flight task, if any. Returns Some(action) while the
    /// reconcile must stop here.
    async fn await_task(
        &self,
        api: &SharedProvider,
        snapshot: &mut VmSnapshot,
    ) -> Result<Option<Action>, ReconcileError> {
        let Some(task_ref) = snapshot.status.task_ref.clone() else {
            return Ok(None);
        };
        match poll_task(api, &task_ref).await {
            Ok(TaskPoll::Done) | Ok(TaskPoll::Lost) => {
                snapshot.status.task_ref = None;
                *snapshot = self.snapshots.update_status(snapshot.clone()).await?;
                Ok(None)
            }
            Ok(TaskPoll::Pending) => Ok(Some(Action::requeue_after(TASK_POLL))),
            Ok(TaskPoll::Failed(message)) => {
                snapshot.status.task_ref = None;
                self.set_ready(
                    snapshot,
                    ConditionStatus::False,
                    reasons::TASK_FAILED,
                    message.clone(),
                )
                .await?;
                self.recorder
                    .warning(snapshot, reasons::TASK_FAILED, message.clone())
                    .await;
                Err(ProviderError::Retryable(message).into())
            }
            Err(e) => Err(self.surface(snapshot, e).await),
        }
    }

    /// Resolve the parent VM's provider and require Available=True.
    async fn provider_for(
        &self,
        vm: &VirtualMachine,
    ) -> Result<Option<ProviderResource>, ReconcileError> {
        let provider = self
            .providers
            .get_opt(
                vm.spec.provider_ref.namespace_or(&vm.meta.namespace),
                &vm.spec.provider_ref.name,
            )
            .await;
        Ok(provider.filter(|p| is_condition_true(&p.status.conditions, types::AVAILABLE)))
    }

    /// One-shot revert requested through the annotation: record the
    /// pre-revert power state, revert, restore the power state, then clear
    /// the command.
    async fn reconcile_revert(
        &self,
        api: &SharedProvider,
        mut snapshot: VmSnapshot,
        vm: &VirtualMachine,
    ) -> Result<Action, ReconcileError> {
        if snapshot.status.revert_previous_power_state.is_none() {
            let previous = if vm.status.power_state == ObservedPowerState::On {
                PowerState::On
            } else {
                PowerState::Off
            };
            info!(
                snapshot = %snapshot.meta.key(),
                vm = %vm.meta.key(),
                previous = ?previous,
                "Reverting VM to snapshot"
            );
            snapshot.status.revert_previous_power_state = Some(previous);
            let task = match api
                .snapshot_revert(&vm.status.id, &snapshot.status.snapshot_id)
                .await
            {
                Ok(task) => task,
                Err(e) => return Err(self.surface(&mut snapshot, e).await),
            };
            snapshot.status.task_ref = task;
            self.snapshots.update_status(snapshot).await?;
            return Ok(Action::requeue_after(NEXT_STEP));
        }

        // Revert applied (task drained by the caller); restore the power
        // state recorded before the revert.
        let previous_on = snapshot
            .status
            .revert_previous_power_state
            .is_some_and(|p| p.is_on());
        let describe = match api.describe(&vm.status.id).await {
            Ok(d) => d,
            Err(e) => return Err(self.surface(&mut snapshot, e).await),
        };
        let observed_on = describe.power_state == WirePowerState::On as i32;
        if previous_on != observed_on {
            let op = if previous_on { PowerOp::On } else { PowerOp::Off };
            let task = match api.power(&vm.status.id, op, Duration::from_secs(30)).await {
                Ok(task) => task,
                Err(e) => return Err(self.surface(&mut snapshot, e).await),
            };
            if task.is_some() {
                snapshot.status.task_ref = task;
                self.snapshots.update_status(snapshot).await?;
                return Ok(Action::requeue_after(TASK_POLL));
            }
        }

        // Clear the one-shot command and the recorded state.
        let mut updated = snapshot.clone();
        updated.meta.annotations.remove(REVERT_ANNOTATION);
        let mut updated = self.snapshots.update(updated).await?;
        updated.status.revert_previous_power_state = None;
        let updated = self.snapshots.update_status(updated).await?;
        self.recorder
            .normal(&updated, "Reverted", "VM reverted to snapshot")
            .await;
        Ok(Action::await_change())
    }

    /// Enforce this snapshot's retention policy over the parent VM's
    /// snapshot set, evicting oldest first.
    async fn apply_retention(&self, snapshot: &VmSnapshot) -> Result<(), ReconcileError> {
        let Some(policy) = &snapshot.spec.retention else {
            return Ok(());
        };

        let mut set: Vec<VmSnapshot> = self
            .snapshots
            .list(Some(&snapshot.meta.namespace))
            .await
            .into_iter()
            .filter(|s| {
                s.spec.vm_ref.name == snapshot.spec.vm_ref.name
                    && s.spec.schedule.is_none()
                    && !s.meta.is_deleting()
                    && s.status.created_at.is_some()
            })
            .collect();
        set.sort_by_key(|s| s.status.created_at);

        let mut evict: Vec<VmSnapshot> = Vec::new();
        if let Some(max_age) = policy.max_age_seconds {
            let cutoff = Utc::now() - chrono::Duration::seconds(max_age as i64);
            evict.extend(
                set.iter()
                    .filter(|s| s.status.created_at.is_some_and(|t| t < cutoff))
                    .cloned(),
            );
        }
        if let Some(max_count) = policy.max_count {
            let already: Vec<String> = evict.iter().map(|s| s.meta.key()).collect();
            let surviving: Vec<&VmSnapshot> = set
                .iter()
                .filter(|s| !already.contains(&s.meta.key()))
                .collect();
            if surviving.len() > max_count as usize {
                let excess = surviving.len() - max_count as usize;
                evict.extend(surviving.into_iter().take(excess).cloned());
            }
        }

        for victim in evict {
            info!(
                snapshot = %victim.meta.key(),
                vm = %snapshot.spec.vm_ref.name,
                "Evicting snapshot per retention policy"
            );
            self.recorder
                .normal(&victim, "RetentionEvicted", "snapshot evicted by retention policy")
                .await;
            if let Err(e) = self
                .snapshots
                .delete(&victim.meta.namespace, &victim.meta.name)
                .await
            {
                if !e.is_not_found() {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// A snapshot carrying a cron schedule acts as a template: materialize
    /// one concrete snapshot per schedule bucket, deduplicated by name
    /// hint + bucket timestamp.
    async fn reconcile_template(&self, template: VmSnapshot) -> Result<Action, ReconcileError> {
        let expression = template.spec.schedule.clone().unwrap_or_default();
        let schedule = match CronSchedule::parse(&expression) {
            Ok(schedule) => schedule,
            Err(message) => {
                let mut template = template;
                self.set_ready(
                    &mut template,
                    ConditionStatus::False,
                    reasons::INVALID_SPEC,
                    message.clone(),
                )
                .await?;
                return Err(ReconcileError::Terminal(message));
            }
        };

        let Some(bucket) = schedule.last_fire(Utc::now()) else {
            return Ok(Action::requeue_after(TEMPLATE_RESYNC));
        };

        let prefix: String = template.meta.name.chars().take(50).collect();
        let concrete_name = format!(
            "{}-{}",
            prefix.trim_end_matches('-'),
            bucket.format("%Y%m%d%H%M")
        );

        if self
            .snapshots
            .get_opt(&template.meta.namespace, &concrete_name)
            .await
            .is_none()
        {
            info!(
                template = %template.meta.key(),
                concrete = %concrete_name,
                "Materializing scheduled snapshot"
            );
            let mut spec = template.spec.clone();
            spec.schedule = None;
            if spec.name_hint.is_empty() {
                spec.name_hint = template.meta.name.clone();
            }
            let concrete = VmSnapshot {
                meta: ObjectMeta {
                    owner_references: vec![owner_reference_to(&template, true)],
                    ..ObjectMeta::new(&template.meta.namespace, &concrete_name)
                },
                spec,
                ..Default::default()
            };
            match self.snapshots.create(concrete).await {
                Ok(created) => {
                    self.recorder
                        .normal(&created, "Scheduled", "snapshot materialized from schedule")
                        .await;
                }
                // A racing worker won the bucket; that is the dedup working.
                Err(e) if matches!(e, crate::cluster::ApiError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Action::requeue_after(TEMPLATE_RESYNC))
    }

    /// Deletion: remove the provider snapshot, then release the finalizer.
    #[instrument(skip(self, snapshot), fields(snapshot = %snapshot.meta.key()))]
    async fn reconcile_delete(&self, mut snapshot: VmSnapshot) -> Result<Action, ReconcileError> {
        if !snapshot.status.snapshot_id.is_empty() {
            let vm = self
                .vms
                .get_opt(&snapshot.meta.namespace, &snapshot.spec.vm_ref.name)
                .await;
            let provider = match &vm {
                Some(vm) => self.provider_for(vm).await?,
                None => None,
            };

            match (vm, provider) {
                (Some(vm), Some(provider)) if !vm.status.id.is_empty() => {
                    let api = self.connector.connect(&provider).await?;

                    if let Some(action) = self.await_task(&api, &mut snapshot).await? {
                        return Ok(action);
                    }

                    match api
                        .snapshot_delete(&vm.status.id, &snapshot.status.snapshot_id)
                        .await
                    {
                        Ok(Some(task_ref)) => {
                            snapshot.status.task_ref = Some(task_ref);
                            self.snapshots.update_status(snapshot).await?;
                            return Ok(Action::requeue_after(TASK_POLL));
                        }
                        Ok(None) => {}
                        // Already gone at the provider.
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(self.surface(&mut snapshot, e).await),
                    }
                }
                // Parent VM or provider gone: nothing left to clean up.
                _ => {
                    warn!(
                        snapshot = %snapshot.meta.key(),
                        "Parent VM or provider gone, releasing finalizer without provider cleanup"
                    );
                }
            }
        }

        self.recorder
            .normal(&snapshot, "Deleted", "snapshot removed")
            .await;
        remove_finalizer(&self.snapshots, snapshot, SNAPSHOT_FINALIZER).await?;
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for SnapshotReconciler {
    type Object = VmSnapshot;

    fn name(&self) -> &'static str {
        "vmsnapshot"
    }

    #[instrument(skip(self), fields(snapshot = %key))]
    async fn reconcile(&self, key: &ResourceKey) -> Result<Action, ReconcileError> {
        let Some(snapshot) = self.snapshots.get_opt(&key.namespace, &key.name).await else {
            return Ok(Action::await_change());
        };

        // Schedule templates never touch the provider themselves.
        if snapshot.spec.schedule.is_some() {
            if snapshot.meta.is_deleting() {
                // Owned concrete snapshots cascade with the template.
                return Ok(Action::await_change());
            }
            return self.reconcile_template(snapshot).await;
        }

        if snapshot.meta.is_deleting() {
            if !snapshot.meta.has_finalizer(SNAPSHOT_FINALIZER) {
                return Ok(Action::await_change());
            }
            return self.reconcile_delete(snapshot).await;
        }
        if !snapshot.meta.has_finalizer(SNAPSHOT_FINALIZER) {
            ensure_finalizer(&self.snapshots, snapshot, SNAPSHOT_FINALIZER).await?;
            return Ok(Action::await_change());
        }

        let mut snapshot = snapshot;

        let Some(vm) = self
            .vms
            .get_opt(&snapshot.meta.namespace, &snapshot.spec.vm_ref.name)
            .await
        else {
            let message = format!("vm {} not found", snapshot.spec.vm_ref.name);
            self.set_ready(
                &mut snapshot,
                ConditionStatus::False,
                reasons::INVALID_SPEC,
                message,
            )
            .await?;
            return Ok(Action::requeue_after(Duration::from_secs(30)));
        };

        if vm.status.id.is_empty() {
            self.set_ready(
                &mut snapshot,
                ConditionStatus::False,
                reasons::PROVISIONING,
                "parent VM not provisioned yet",
            )
            .await?;
            return Ok(Action::requeue_after(VM_WAIT));
        }

        let Some(provider) = self.provider_for(&vm).await? else {
            self.set_ready(
                &mut snapshot,
                ConditionStatus::False,
                reasons::PROVIDER_UNAVAILABLE,
                format!("provider {} is not available", vm.spec.provider_ref.name),
            )
            .await?;
            return Ok(Action::requeue_after(PROVIDER_WAIT));
        };

        let api = self.connector.connect(&provider).await?;

        if let Some(action) = self.await_task(&api, &mut snapshot).await? {
            return Ok(action);
        }

        // One-shot revert command.
        if snapshot.meta.annotations.contains_key(REVERT_ANNOTATION)
            && !snapshot.status.snapshot_id.is_empty()
        {
            return self.reconcile_revert(&api, snapshot, &vm).await;
        }

        // Create the provider snapshot.
        if snapshot.status.snapshot_id.is_empty() {
            let capabilities = match api.capabilities().await {
                Ok(c) => c,
                Err(e) => return Err(self.surface(&mut snapshot, e).await),
            };

            let mut include_memory = snapshot.spec.include_memory;
            if include_memory && !capabilities.supports_memory_snapshots {
                // Capability gap: degrade to a disk-only snapshot and say so.
                let message = "memory snapshots unsupported by provider; taking disk-only";
                self.recorder
                    .warning(&snapshot, reasons::NOT_SUPPORTED, message)
                    .await;
                set_condition(
                    &mut snapshot.status.conditions,
                    Condition::new(
                        types::CAPABILITY,
                        ConditionStatus::False,
                        reasons::NOT_SUPPORTED,
                        message,
                        snapshot.meta.generation,
                    ),
                );
                include_memory = false;
            }

            let name_hint = if snapshot.spec.name_hint.is_empty() {
                snapshot.meta.name.clone()
            } else {
                snapshot.spec.name_hint.clone()
            };
            let response = match api
                .snapshot_create(SnapshotCreateRequest {
                    vm_id: vm.status.id.clone(),
                    name_hint,
                    description: snapshot.spec.description.clone(),
                    include_memory,
                    quiesce: snapshot.spec.quiesce,
                })
                .await
            {
                Ok(response) => response,
                Err(e) => return Err(self.surface(&mut snapshot, e).await),
            };

            info!(
                snapshot = %snapshot.meta.key(),
                snapshot_id = %response.snapshot_id,
                "Provider snapshot created"
            );
            snapshot.status.snapshot_id = response.snapshot_id;
            snapshot.status.created_at = Some(Utc::now());
            snapshot.status.task_ref = task_opt(response.task_ref);
            set_condition(
                &mut snapshot.status.conditions,
                Condition::new(
                    types::READY,
                    ConditionStatus::False,
                    reasons::PROVISIONING,
                    "snapshot creation in progress",
                    snapshot.meta.generation,
                ),
            );
            let snapshot = self.snapshots.update_status(snapshot).await?;
            self.recorder
                .normal(&snapshot, "Created", "provider snapshot created")
                .await;
            return Ok(Action::requeue_after(NEXT_STEP));
        }

        // Steady state: sweep retention, then report Ready.
        self.apply_retention(&snapshot).await?;

        let before = snapshot.status.clone();
        snapshot.status.observed_generation = snapshot.meta.generation;
        set_condition(
            &mut snapshot.status.conditions,
            Condition::new(
                types::READY,
                ConditionStatus::True,
                reasons::SYNCED,
                "",
                snapshot.meta.generation,
            ),
        );
        if snapshot.status != before {
            self.snapshots.update_status(snapshot).await?;
        }
        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::testutil::*;
    use virtrigaud_api::meta::ObjectRef;
    use virtrigaud_api::snapshot::VmSnapshotSpec;
    use virtrigaud_api::RetentionPolicy;

    async fn seed_snapshot(env: &TestEnv, name: &str, vm: &str, retention: Option<RetentionPolicy>) {
        env.cluster
            .api::<VmSnapshot>()
            .create(VmSnapshot {
                meta: ObjectMeta::new("default", name),
                spec: VmSnapshotSpec {
                    vm_ref: ObjectRef::new(vm),
                    description: format!("snapshot {}", name),
                    retention,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .expect("create snapshot");
    }

    async fn converge_snapshot(env: &TestEnv, key: &ResourceKey) {
        let api = env.cluster.api::<VmSnapshot>();
        for _ in 0..15 {
            let action = env
                .snapshot_reconciler
                .reconcile(key)
                .await
                .expect("snapshot reconcile");
            if action == Action::await_change() {
                match api.get_opt(&key.namespace, &key.name).await {
                    Some(snapshot)
                        if is_condition_true(&snapshot.status.conditions, types::READY) =>
                    {
                        return;
                    }
                    Some(_) => {}
                    None => return,
                }
            }
        }
        panic!("snapshot {} did not converge", key);
    }

    async fn vm_ready(env: &TestEnv, name: &str) {
        seed_provider(env, "prov").await;
        seed_class(env, "small", 2, 4096).await;
        seed_image(env, "img").await;
        seed_vm(env, name, "prov", "small", "img").await;
        converge_vm(env, &ResourceKey::new("default", name)).await;
    }

    #[tokio::test]
    async fn test_snapshot_create_records_provider_id() {
        let env = TestEnv::new();
        vm_ready(&env, "web-1").await;
        seed_snapshot(&env, "web-1-pre-upgrade", "web-1", None).await;

        let key = ResourceKey::new("default", "web-1-pre-upgrade");
        converge_snapshot(&env, &key).await;

        let api = env.cluster.api::<VmSnapshot>();
        let stored = api.get("default", "web-1-pre-upgrade").await.unwrap();
        assert!(stored.status.snapshot_id.starts_with("snap-"));
        assert!(stored.status.created_at.is_some());
        assert!(is_condition_true(&stored.status.conditions, types::READY));
    }

    /// Retention: six snapshots against maxCount=3 evict the oldest until
    /// exactly three remain, each keeping its provider id.
    #[tokio::test]
    async fn test_retention_evicts_oldest_first() {
        let env = TestEnv::new();
        vm_ready(&env, "web-1").await;
        let api = env.cluster.api::<VmSnapshot>();

        // Five existing snapshots, converged in order (creation timestamps
        // ascend with the loop).
        for i in 1..=5 {
            let name = format!("web-1-snap-{}", i);
            seed_snapshot(&env, &name, "web-1", None).await;
            converge_snapshot(&env, &ResourceKey::new("default", &name)).await;
        }

        // The sixth carries the retention policy.
        seed_snapshot(
            &env,
            "web-1-snap-6",
            "web-1",
            Some(RetentionPolicy {
                max_count: Some(3),
                ..Default::default()
            }),
        )
        .await;
        converge_snapshot(&env, &ResourceKey::new("default", "web-1-snap-6")).await;

        // Drain the evicted snapshots' deletion flow.
        for i in 1..=6 {
            let name = format!("web-1-snap-{}", i);
            for _ in 0..5 {
                if api.get_opt("default", &name).await.is_none() {
                    break;
                }
                let _ = env
                    .snapshot_reconciler
                    .reconcile(&ResourceKey::new("default", &name))
                    .await;
            }
        }

        let remaining = api.list(Some("default")).await;
        assert_eq!(remaining.len(), 3);
        // Oldest evicted first: 4, 5 and 6 survive.
        let mut names: Vec<&str> = remaining.iter().map(|s| s.meta.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, ["web-1-snap-4", "web-1-snap-5", "web-1-snap-6"]);
        for snapshot in &remaining {
            assert!(!snapshot.status.snapshot_id.is_empty());
        }
    }

    /// Revert via the one-shot annotation restores the pre-revert power
    /// state and clears the command.
    #[tokio::test]
    async fn test_revert_annotation_round_trip() {
        let env = TestEnv::new();
        vm_ready(&env, "web-1").await;
        seed_snapshot(&env, "web-1-golden", "web-1", None).await;
        let key = ResourceKey::new("default", "web-1-golden");
        converge_snapshot(&env, &key).await;

        let api = env.cluster.api::<VmSnapshot>();
        let mut stored = api.get("default", "web-1-golden").await.unwrap();
        stored
            .meta
            .annotations
            .insert(REVERT_ANNOTATION.to_string(), "true".to_string());
        api.update(stored).await.unwrap();

        for _ in 0..10 {
            let stored = api.get("default", "web-1-golden").await.unwrap();
            if !stored.meta.annotations.contains_key(REVERT_ANNOTATION) {
                break;
            }
            let _ = env.snapshot_reconciler.reconcile(&key).await;
        }

        let stored = api.get("default", "web-1-golden").await.unwrap();
        assert!(!stored.meta.annotations.contains_key(REVERT_ANNOTATION));
        assert!(stored.status.revert_previous_power_state.is_none());

        // The VM is back in its pre-revert power state (it was running
        // when the revert was requested; the disk-only revert left it off).
        use virtrigaud_proto::provider::provider_server::Provider as ProviderService;
        use virtrigaud_proto::provider::DescribeRequest;
        let mock = env.mock("prov").await;
        let vm = env.vms().get("default", "web-1").await.unwrap();
        let describe = ProviderService::describe(
            &*mock,
            tonic::Request::new(DescribeRequest {
                id: vm.status.id.clone(),
            }),
        )
        .await
        .unwrap()
        .into_inner();
        assert_eq!(describe.power_state, WirePowerState::On as i32);
    }

    /// Scheduled templates materialize one concrete snapshot per bucket.
    #[tokio::test]
    async fn test_schedule_template_dedups_by_bucket() {
        let env = TestEnv::new();
        vm_ready(&env, "web-1").await;

        env.cluster
            .api::<VmSnapshot>()
            .create(VmSnapshot {
                meta: ObjectMeta::new("default", "web-1-nightly"),
                spec: VmSnapshotSpec {
                    vm_ref: ObjectRef::new("web-1"),
                    schedule: Some("* * * * *".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let key = ResourceKey::new("default", "web-1-nightly");
        env.snapshot_reconciler.reconcile(&key).await.unwrap();
        env.snapshot_reconciler.reconcile(&key).await.unwrap();

        let all = env.cluster.api::<VmSnapshot>().list(Some("default")).await;
        let concrete: Vec<&VmSnapshot> = all
            .iter()
            .filter(|s| s.spec.schedule.is_none() && s.meta.name.starts_with("web-1-nightly-"))
            .collect();
        // Same bucket: exactly one materialized despite two passes.
        assert_eq!(concrete.len(), 1);
        assert!(concrete[0].meta.owner_references.iter().any(|o| o.name == "web-1-nightly"));
    }

    /// deleteOnVMDelete snapshots are torn down before the VM's finalizer
    /// is released.
    #[tokio::test]
    async fn test_delete_on_vm_delete_gates_vm_removal() {
        let env = TestEnv::new();
        vm_ready(&env, "web-1").await;
        seed_snapshot(
            &env,
            "web-1-backup",
            "web-1",
            Some(RetentionPolicy {
                delete_on_vm_delete: true,
                ..Default::default()
            }),
        )
        .await;
        let snapshot_key = ResourceKey::new("default", "web-1-backup");
        converge_snapshot(&env, &snapshot_key).await;

        env.vms().delete("default", "web-1").await.unwrap();

        let vm_key = ResourceKey::new("default", "web-1");
        for _ in 0..10 {
            if env.vms().get_opt("default", "web-1").await.is_none() {
                break;
            }
            let _ = env.vm_reconciler.reconcile(&vm_key).await;
            let _ = env.snapshot_reconciler.reconcile(&snapshot_key).await;
        }

        assert!(env.vms().get_opt("default", "web-1").await.is_none());
        assert!(env
            .cluster
            .api::<VmSnapshot>()
            .get_opt("default", "web-1-backup")
            .await
            .is_none());
    }
}
