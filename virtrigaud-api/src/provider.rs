//! Provider resource: a configured hypervisor backend and the runtime hints
//! for the provider workload that serves it.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{ObjectMeta, ObjectRef, Resource};

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    VSphere,
    Libvirt,
    Proxmox,
    Mock,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::VSphere => "vsphere",
            ProviderType::Libvirt => "libvirt",
            ProviderType::Proxmox => "proxmox",
            ProviderType::Mock => "mock",
        }
    }
}

/// Provider resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Provider {
    pub meta: ObjectMeta,
    pub spec: ProviderSpec,
    pub status: ProviderStatus,
}

/// Desired state of a Provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSpec {
    /// Hypervisor type served by this provider
    pub r#type: ProviderType,
    /// Hypervisor endpoint URL (vCenter URL, libvirt URI, Proxmox API URL)
    pub endpoint: String,
    /// Secret holding credential material, mounted into the provider pod
    pub credential_secret_ref: ObjectRef,
    /// Optional TLS settings for the hypervisor session
    pub tls: Option<ProviderTls>,
    /// Placement applied to VMs that do not set their own; per-VM
    /// placement wins field by field
    pub default_placement: Option<crate::vm::Placement>,
    /// Runtime hints for the provider workload
    pub runtime: ProviderRuntime,
}

impl Default for ProviderSpec {
    fn default() -> Self {
        Self {
            r#type: ProviderType::Mock,
            endpoint: String::new(),
            credential_secret_ref: ObjectRef::default(),
            tls: None,
            default_placement: None,
            runtime: ProviderRuntime::default(),
        }
    }
}

/// TLS settings for the hypervisor session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderTls {
    pub insecure_skip_verify: bool,
    /// Key inside the credential secret holding a CA bundle
    pub ca_bundle_key: Option<String>,
}

/// Runtime hints for the provider workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderRuntime {
    /// Container image (tag pinned)
    pub image: String,
    pub replicas: u32,
    pub service_type: ServiceType,
    /// Optional cpu/memory limits, free-form quantity strings
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}

impl Default for ProviderRuntime {
    fn default() -> Self {
        Self {
            image: String::new(),
            replicas: 1,
            service_type: ServiceType::ClusterIp,
            cpu_limit: None,
            memory_limit: None,
        }
    }
}

/// Service exposure type for the provider RPC endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[serde(rename = "ClusterIP")]
    ClusterIp,
    NodePort,
    LoadBalancer,
}

impl Default for ServiceType {
    fn default() -> Self {
        Self::ClusterIp
    }
}

/// Provider lifecycle phase. Advisory; the Available condition is
/// authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderPhase {
    Pending,
    Available,
    Failed,
}

impl Default for ProviderPhase {
    fn default() -> Self {
        Self::Pending
    }
}

/// Observed state of a Provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderStatus {
    pub phase: ProviderPhase,
    /// Address at which the provider RPC is reachable
    pub endpoint: Option<String>,
    /// Migration PVCs currently mounted into the provider workload
    pub mounted_migration_pvcs: Vec<String>,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

/// Annotation forcing a re-reconcile; set by the migration reconciler to
/// trigger PVC remounts.
pub const RECONCILE_TRIGGER_ANNOTATION: &str = "virtrigaud.io/reconcile-trigger";

/// Annotation listing migration PVCs the provider workload must mount,
/// comma-separated.
pub const MIGRATION_PVCS_ANNOTATION: &str = "virtrigaud.io/migration-pvcs";

impl Resource for Provider {
    const KIND: &'static str = "Provider";

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
        crate::validation::validate_provider(self, old)
    }
}
