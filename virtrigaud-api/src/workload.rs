//! Minimal renderings of the orchestrator-native workload objects the
//! provider lifecycle manager produces (deployments, services, volumes) and
//! the supporting objects it consumes (secrets, service accounts).
//!
//! These deliberately model only the fields the control plane reads or
//! writes; the orchestrator host owns the full schemas.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::impl_resource;
use crate::meta::ObjectMeta;

// =============================================================================
// DEPLOYMENT
// =============================================================================

/// Deployment of a provider workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Deployment {
    pub meta: ObjectMeta,
    pub spec: DeploymentSpec,
    pub status: DeploymentStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentSpec {
    pub replicas: u32,
    /// Pod selector labels
    pub selector: BTreeMap<String, String>,
    pub template: PodTemplateSpec,
}

impl Default for DeploymentSpec {
    fn default() -> Self {
        Self {
            replicas: 1,
            selector: BTreeMap::new(),
            template: PodTemplateSpec::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentStatus {
    pub ready_replicas: u32,
    pub observed_generation: i64,
}

/// Pod template rendered into the deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodTemplateSpec {
    pub labels: BTreeMap<String, String>,
    pub service_account: String,
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
    /// Grace given to preStop + shutdown before the pod is killed
    pub termination_grace_period_seconds: u32,
}

impl Default for PodTemplateSpec {
    fn default() -> Self {
        Self {
            labels: BTreeMap::new(),
            service_account: String::new(),
            containers: Vec::new(),
            volumes: Vec::new(),
            termination_grace_period_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub env: Vec<EnvVar>,
    pub ports: Vec<u16>,
    pub volume_mounts: Vec<VolumeMount>,
    pub liveness_probe: Option<Probe>,
    pub readiness_probe: Option<Probe>,
    pub lifecycle: Option<Lifecycle>,
    pub security_context: Option<SecurityContext>,
    pub resources: Option<ResourceRequirements>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
}

/// Pod volume source; only the two sources the lifecycle manager renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Volume {
    /// Projected credential secret
    Secret { name: String, secret_name: String },
    /// Migration payload volume
    Pvc { name: String, claim_name: String },
}

impl Volume {
    pub fn name(&self) -> &str {
        match self {
            Volume::Secret { name, .. } => name,
            Volume::Pvc { name, .. } => name,
        }
    }
}

/// Liveness/readiness probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Probe {
    pub action: ProbeAction,
    pub period_seconds: u32,
    pub timeout_seconds: u32,
    pub failure_threshold: u32,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            action: ProbeAction::Grpc { port: 9443 },
            period_seconds: 10,
            timeout_seconds: 5,
            failure_threshold: 3,
        }
    }
}

/// What the probe exercises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProbeAction {
    /// gRPC health-style probe against the provider Validate RPC
    Grpc { port: u16 },
    Exec { command: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Lifecycle {
    /// Sleep in preStop so in-flight RPCs drain before shutdown
    pub pre_stop_sleep_seconds: u32,
}

/// Tight pod security context for provider workloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityContext {
    pub run_as_non_root: bool,
    pub run_as_user: Option<u32>,
    pub read_only_root_filesystem: bool,
    pub allow_privilege_escalation: bool,
    pub drop_all_capabilities: bool,
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self {
            run_as_non_root: true,
            run_as_user: Some(65532),
            read_only_root_filesystem: true,
            allow_privilege_escalation: false,
            drop_all_capabilities: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceRequirements {
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}

impl_resource!(Deployment, "Deployment");

// =============================================================================
// SERVICE
// =============================================================================

/// Service exposing a provider workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Service {
    pub meta: ObjectMeta,
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSpec {
    pub selector: BTreeMap<String, String>,
    pub port: u16,
    pub service_type: crate::provider::ServiceType,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            selector: BTreeMap::new(),
            port: 9443,
            service_type: crate::provider::ServiceType::ClusterIp,
        }
    }
}

impl_resource!(Service, "Service");

// =============================================================================
// PERSISTENT VOLUME CLAIM
// =============================================================================

/// Persistent volume claim staged for migration payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pvc {
    pub meta: ObjectMeta,
    pub spec: PvcSpec,
    pub status: PvcStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PvcSpec {
    pub size_gib: u64,
    pub access_mode: String,
    pub storage_class: Option<String>,
}

impl Default for PvcSpec {
    fn default() -> Self {
        Self {
            size_gib: 10,
            access_mode: "ReadWriteMany".to_string(),
            storage_class: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PvcStatus {
    pub phase: PvcPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PvcPhase {
    Pending,
    Bound,
}

impl Default for PvcPhase {
    fn default() -> Self {
        Self::Pending
    }
}

/// Label put on migration PVCs so the provider lifecycle manager can watch
/// them. Value: the migration name.
pub const MIGRATION_PVC_LABEL: &str = "virtrigaud.io/migration";

impl_resource!(Pvc, "PersistentVolumeClaim");

// =============================================================================
// SECRET / SERVICE ACCOUNT / ROLE BINDING
// =============================================================================

/// Opaque secret, string-keyed (credential material, cloud-init payloads).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Secret {
    pub meta: ObjectMeta,
    pub spec: SecretData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretData {
    pub string_data: BTreeMap<String, String>,
}

impl_resource!(Secret, "Secret");

/// Service account the provider workload runs as.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceAccount {
    pub meta: ObjectMeta,
    #[serde(skip)]
    pub spec: (),
}

impl_resource!(ServiceAccount, "ServiceAccount");

/// Binding granting a service account read access to a credential secret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleBinding {
    pub meta: ObjectMeta,
    pub spec: RoleBindingSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleBindingSpec {
    pub service_account: String,
    pub role: String,
}

impl_resource!(RoleBinding, "RoleBinding");

// =============================================================================
// EVENT
// =============================================================================

/// User-visible event attached to a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Event {
    pub meta: ObjectMeta,
    pub spec: EventDetail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventDetail {
    /// Kind of the involved object
    pub involved_kind: String,
    /// Name of the involved object (event shares its namespace)
    pub involved_name: String,
    pub r#type: EventType,
    pub reason: String,
    pub message: String,
    /// Dedup counter bumped for repeats of the same (reason, message)
    pub count: u32,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl Default for EventType {
    fn default() -> Self {
        Self::Normal
    }
}

impl_resource!(Event, "Event");
