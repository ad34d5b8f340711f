//! VMMigration resource: a one-shot cold export/import job moving a VM disk
//! between providers through intermediary storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use crate::class::DiskFormat;
use crate::condition::Condition;
use crate::meta::{ObjectMeta, ObjectRef, Resource};
use crate::vm::Placement;

/// Finalizer guarding intermediary-storage cleanup.
pub const MIGRATION_FINALIZER: &str = "virtrigaud.io/vmmigration";

/// VMMigration resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmMigration {
    pub meta: ObjectMeta,
    pub spec: VmMigrationSpec,
    pub status: VmMigrationStatus,
}

/// Desired state of a VMMigration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmMigrationSpec {
    pub source: MigrationSource,
    pub target: MigrationTarget,
    pub storage: MigrationStorage,
    /// Enforce SHA-256 verification on import
    pub verify_checksum: bool,
    pub options: MigrationOptions,
}

/// Source of the migration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationSource {
    /// VM to migrate
    pub vm_ref: ObjectRef,
    /// Source provider; defaults to the VM's own provider when empty
    pub provider_ref: Option<ObjectRef>,
}

/// Target VM to materialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationTarget {
    /// Name of the VM created on the target provider
    pub name: String,
    pub provider_ref: ObjectRef,
    pub class_ref: ObjectRef,
    pub networks: Vec<ObjectRef>,
    pub labels: BTreeMap<String, String>,
    pub placement: Option<Placement>,
}

/// Intermediary storage backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationStorage {
    pub r#type: StorageBackendType,
    /// PVC size, for PVC-backed migrations
    pub size_gib: Option<u64>,
    /// PVC access mode; defaults to ReadWriteMany
    pub access_mode: Option<String>,
    /// S3/HTTP/NFS endpoint or base URL
    pub endpoint: Option<String>,
    /// S3 bucket
    pub bucket: Option<String>,
    /// Secret holding backend credentials
    pub credentials_secret_ref: Option<ObjectRef>,
}

/// Storage backend discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendType {
    Pvc,
    S3,
    Http,
    Nfs,
}

impl Default for StorageBackendType {
    fn default() -> Self {
        Self::Pvc
    }
}

/// Post-migration behavior toggles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationOptions {
    /// Delete the source VM during Finalizing
    pub delete_source_vm: bool,
    /// Power the source VM off before export
    pub power_off_source: bool,
}

/// Migration phase. Transitions are monotonic along the phase graph; any
/// phase may transition to Failed on terminal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    Pending,
    Validating,
    PreparingStorage,
    Exporting,
    Transporting,
    Importing,
    CreatingTarget,
    ValidatingTarget,
    Finalizing,
    Succeeded,
    Failed,
}

impl Default for MigrationPhase {
    fn default() -> Self {
        Self::Pending
    }
}

impl MigrationPhase {
    /// Position along the phase graph, used to assert monotonic progress.
    pub fn ordinal(&self) -> u8 {
        match self {
            MigrationPhase::Pending => 0,
            MigrationPhase::Validating => 1,
            MigrationPhase::PreparingStorage => 2,
            MigrationPhase::Exporting => 3,
            MigrationPhase::Transporting => 4,
            MigrationPhase::Importing => 5,
            MigrationPhase::CreatingTarget => 6,
            MigrationPhase::ValidatingTarget => 7,
            MigrationPhase::Finalizing => 8,
            MigrationPhase::Succeeded => 9,
            MigrationPhase::Failed => 10,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Succeeded | MigrationPhase::Failed)
    }
}

/// Export progress recorded in status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportStatus {
    /// Storage URL the disk was exported to
    pub url: String,
    pub task_ref: Option<String>,
    pub bytes_transferred: u64,
    pub progress_percent: u32,
    /// When progress was last written; updates are coalesced to at most
    /// one per second
    pub updated_at: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
}

/// Import result recorded in status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportStatus {
    pub disk_id: String,
    /// Full path of the disk inside target provider storage
    pub path: String,
    pub size_bytes: u64,
    pub format: Option<DiskFormat>,
    pub checksum: Option<String>,
}

/// Observed state of a VMMigration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmMigrationStatus {
    pub phase: MigrationPhase,
    pub message: Option<String>,
    /// When the current phase was entered, used for phase-local timeouts
    pub phase_started_at: Option<DateTime<Utc>>,
    /// Name of the synthetic PVC owned by this migration, when PVC-backed
    pub pvc_name: Option<String>,
    pub export: Option<ExportStatus>,
    pub import: Option<ImportStatus>,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

impl Resource for VmMigration {
    const KIND: &'static str = "VMMigration";

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
        crate::validation::validate_migration(self, old)
    }
}
