//! VMSnapshot resource: a point-in-time snapshot of a parent VM, with
//! retention and optional scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{ObjectMeta, ObjectRef, Resource};
use crate::vm::PowerState;

/// Finalizer guarding hypervisor-side snapshot cleanup.
pub const SNAPSHOT_FINALIZER: &str = "virtrigaud.io/vmsnapshot";

/// One-shot annotation requesting a revert to this snapshot.
pub const REVERT_ANNOTATION: &str = "virtrigaud.io/revert";

/// VMSnapshot resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmSnapshot {
    pub meta: ObjectMeta,
    pub spec: VmSnapshotSpec,
    pub status: VmSnapshotStatus,
}

/// Desired state of a VMSnapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmSnapshotSpec {
    /// Parent VM, same namespace
    pub vm_ref: ObjectRef,
    /// Name hint passed to the provider
    pub name_hint: String,
    pub description: String,
    /// Include guest memory in the snapshot
    pub include_memory: bool,
    /// Quiesce guest filesystems before snapshotting
    pub quiesce: bool,
    pub retention: Option<RetentionPolicy>,
    /// Cron expression; when set, this object acts as a template that
    /// materializes concrete snapshots per schedule bucket
    pub schedule: Option<String>,
}

/// Snapshot retention policy for a VM's snapshot set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionPolicy {
    /// Maximum snapshot age in seconds
    pub max_age_seconds: Option<u64>,
    /// Maximum number of snapshots; oldest evicted first
    pub max_count: Option<u32>,
    /// Tear snapshots down before the parent VM may be deleted
    pub delete_on_vm_delete: bool,
}

/// Observed state of a VMSnapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmSnapshotStatus {
    /// Provider-assigned snapshot id
    pub snapshot_id: String,
    pub created_at: Option<DateTime<Utc>>,
    /// In-flight async operation
    pub task_ref: Option<String>,
    /// Power state recorded before an in-flight revert, restored afterwards
    pub revert_previous_power_state: Option<PowerState>,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

impl Resource for VmSnapshot {
    const KIND: &'static str = "VMSnapshot";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn spec_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.spec).unwrap_or(serde_json::Value::Null)
    }

    fn validate(&self, old: Option<&Self>) -> Vec<String> {
        crate::validation::validate_snapshot(self, old)
    }
}
