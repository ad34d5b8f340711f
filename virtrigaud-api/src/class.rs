//! VMClass resource: a compute-shape template referenced by VMs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::{ObjectMeta, Resource};

/// VMClass resource. Immutable by convention; spec changes propagate to VMs
/// on their next reconcile and may require a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmClass {
    pub meta: ObjectMeta,
    pub spec: VmClassSpec,
}

/// Compute shape described by a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmClassSpec {
    /// vCPU count
    pub cpu: u32,
    /// Memory in MiB (canonical unit for all comparisons)
    pub memory_mib: u64,
    pub firmware: Firmware,
    pub disk_defaults: DiskDefaults,
    pub performance_profile: PerformanceProfile,
    /// Provider-specific pass-through config, serialized verbatim into the
    /// class JSON on the wire
    pub extra_config: BTreeMap<String, serde_json::Value>,
}

impl Default for VmClassSpec {
    fn default() -> Self {
        Self {
            cpu: 2,
            memory_mib: 2048,
            firmware: Firmware::Bios,
            disk_defaults: DiskDefaults::default(),
            performance_profile: PerformanceProfile::default(),
            extra_config: BTreeMap::new(),
        }
    }
}

/// Firmware type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    Bios,
    Uefi,
}

impl Default for Firmware {
    fn default() -> Self {
        Self::Bios
    }
}

/// Default disk shape applied when a VM disk spec omits fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskDefaults {
    pub size_gib: u64,
    pub provisioning: DiskProvisioning,
    pub format: DiskFormat,
}

impl Default for DiskDefaults {
    fn default() -> Self {
        Self {
            size_gib: 20,
            provisioning: DiskProvisioning::Thin,
            format: DiskFormat::Qcow2,
        }
    }
}

/// Disk provisioning policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskProvisioning {
    Thin,
    Thick,
}

/// Disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
        }
    }
}

/// Performance and firmware feature flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceProfile {
    pub nested_virtualization: bool,
    pub cpu_hot_add: bool,
    pub memory_hot_add: bool,
    pub tpm: bool,
    pub secure_boot: bool,
}

impl Resource for VmClass {
    const KIND: &'static str = "VMClass";

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
        crate::validation::validate_class(self, old)
    }
}
