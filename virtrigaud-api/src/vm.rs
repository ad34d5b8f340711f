//! VirtualMachine resource: the central entity of the control plane.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::class::DiskFormat;
use crate::condition::Condition;
use crate::meta::{ObjectMeta, ObjectRef, Resource, SecretKeyRef};

/// Finalizer guarding hypervisor-side cleanup of a VM.
pub const VM_FINALIZER: &str = "virtrigaud.io/virtualmachine";

/// VirtualMachine resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualMachine {
    pub meta: ObjectMeta,
    pub spec: VirtualMachineSpec,
    pub status: VirtualMachineStatus,
}

/// Desired state of a VirtualMachine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualMachineSpec {
    /// Provider serving this VM
    pub provider_ref: ObjectRef,
    /// Compute shape
    pub class_ref: ObjectRef,
    /// Template-based disk source; mutually exclusive with
    /// `imported_disk_ref`
    pub image_ref: Option<ObjectRef>,
    /// Disk produced by a migration, clone or external import, referenced in
    /// place; mutually exclusive with `image_ref` and immutable once set
    pub imported_disk_ref: Option<ImportedDiskRef>,
    /// Network attachments, order preserved on the wire
    pub networks: Vec<ObjectRef>,
    /// Disk specs overriding the class defaults
    pub disks: Vec<DiskSpec>,
    pub user_data: Option<UserData>,
    /// Placement hints; per-VM values win over Provider defaults
    pub placement: Option<Placement>,
    pub power_state: PowerState,
    /// Optional override of the class cpu/memory shape
    pub resources: Option<ResourceOverride>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Default for VirtualMachineSpec {
    fn default() -> Self {
        Self {
            provider_ref: ObjectRef::default(),
            class_ref: ObjectRef::default(),
            image_ref: None,
            imported_disk_ref: None,
            networks: Vec::new(),
            disks: Vec::new(),
            user_data: None,
            placement: None,
            power_state: PowerState::On,
            resources: None,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Desired power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
    /// Guest shutdown first, force-off after the provider's grace timeout
    OffGraceful,
}

impl Default for PowerState {
    fn default() -> Self {
        Self::On
    }
}

impl PowerState {
    /// Whether the desired state counts as powered on.
    pub fn is_on(&self) -> bool {
        matches!(self, PowerState::On)
    }
}

/// Power state observed at the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedPowerState {
    On,
    Off,
    Unknown,
}

impl Default for ObservedPowerState {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Reference to a disk that already exists in provider storage.
///
/// Carries the full provider path so the provider can use the disk in place;
/// it must never be copied into a synthetic template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportedDiskRef {
    /// Provider-assigned disk id
    pub disk_id: String,
    /// Full path of the disk inside provider storage
    pub path: String,
    pub format: Option<DiskFormat>,
    pub size_bytes: Option<u64>,
    /// Where the disk came from
    pub source: ImportedDiskSource,
    /// Migration that produced the disk, when `source` is `Migration`
    pub migration_ref: Option<ObjectRef>,
    /// SHA-256 recorded at import time
    pub checksum: Option<String>,
}

/// Origin of an imported disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportedDiskSource {
    Migration,
    Clone,
    External,
}

impl Default for ImportedDiskSource {
    fn default() -> Self {
        Self::External
    }
}

/// Per-VM disk spec, overriding the class defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskSpec {
    pub name: String,
    pub size_gib: u64,
    pub format: Option<DiskFormat>,
    /// Extra disk beyond the boot disk
    pub additional: bool,
}

impl Default for DiskSpec {
    fn default() -> Self {
        Self {
            name: "disk0".to_string(),
            size_gib: 20,
            format: None,
            additional: false,
        }
    }
}

/// Guest bootstrap data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserData {
    pub cloud_init: Option<CloudInit>,
}

/// Cloud-init user-data, inline or from a secret key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudInit {
    pub inline: Option<String>,
    pub secret_ref: Option<SecretKeyRef>,
}

/// Placement hints. Per-VM values override Provider defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Placement {
    pub cluster: Option<String>,
    pub host: Option<String>,
    pub datastore: Option<String>,
    pub folder: Option<String>,
    pub resource_pool: Option<String>,
}

impl Placement {
    /// Merge two placements; fields set in `self` win over `defaults`.
    pub fn merged_over(&self, defaults: &Placement) -> Placement {
        Placement {
            cluster: self.cluster.clone().or_else(|| defaults.cluster.clone()),
            host: self.host.clone().or_else(|| defaults.host.clone()),
            datastore: self.datastore.clone().or_else(|| defaults.datastore.clone()),
            folder: self.folder.clone().or_else(|| defaults.folder.clone()),
            resource_pool: self
                .resource_pool
                .clone()
                .or_else(|| defaults.resource_pool.clone()),
        }
    }
}

/// Optional cpu/memory override of the class shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceOverride {
    pub cpu: Option<u32>,
    pub memory_mib: Option<u64>,
}

/// VM lifecycle phase. Advisory; the Ready condition is the source of truth
/// for readiness and must be used for all readiness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmPhase {
    Pending,
    Provisioning,
    Running,
    Stopped,
    Reconfiguring,
    Deleting,
    Failed,
}

impl Default for VmPhase {
    fn default() -> Self {
        Self::Pending
    }
}

/// Observed state of a VirtualMachine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualMachineStatus {
    /// Provider-assigned opaque identifier; set exactly once after the first
    /// successful create and never cleared until deletion
    pub id: String,
    pub phase: VmPhase,
    pub power_state: ObservedPowerState,
    pub ips: Vec<String>,
    pub console_url: Option<String>,
    /// In-flight async operation, cleared when the task completes
    pub task_ref: Option<String>,
    /// Diagnostic blob reported by the provider
    pub provider_raw: Option<serde_json::Value>,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

impl Resource for VirtualMachine {
    const KIND: &'static str = "VirtualMachine";

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
        crate::validation::validate_vm(self, old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_merge_prefers_vm_values() {
        let provider_defaults = Placement {
            cluster: Some("cluster-a".to_string()),
            datastore: Some("ds-default".to_string()),
            ..Default::default()
        };
        let vm = Placement {
            datastore: Some("ds-fast".to_string()),
            folder: Some("prod".to_string()),
            ..Default::default()
        };

        let merged = vm.merged_over(&provider_defaults);
        assert_eq!(merged.cluster.as_deref(), Some("cluster-a"));
        assert_eq!(merged.datastore.as_deref(), Some("ds-fast"));
        assert_eq!(merged.folder.as_deref(), Some("prod"));
        assert!(merged.host.is_none());
    }
}
