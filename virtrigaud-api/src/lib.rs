//! # VirtRigaud API
//!
//! Typed resource model for the VirtRigaud control plane: the declarative
//! kinds users write (VirtualMachine, VMClass, VMImage, VMNetworkAttachment,
//! Provider, VMSnapshot, VMMigration), the minimal orchestrator workload
//! objects the lifecycle manager renders, admission validation, and version
//! conversion.
//!
//! The storage version is v1beta1 (the types at the crate root); the prior
//! v1alpha1 shapes live in [`v1alpha1`] together with lossless conversion in
//! both directions.

pub mod class;
pub mod condition;
pub mod image;
pub mod meta;
pub mod migration;
pub mod network;
pub mod provider;
pub mod snapshot;
pub mod v1alpha1;
pub mod validation;
pub mod vm;
pub mod workload;

pub use class::{DiskFormat, DiskProvisioning, Firmware, VmClass, VmClassSpec};
pub use condition::{
    find_condition, is_condition_true, set_condition, Condition, ConditionStatus,
};
pub use image::{VmImage, VmImageSpec};
pub use meta::{
    owner_reference_to, ObjectMeta, ObjectRef, OwnerReference, Resource, SecretKeyRef,
};
pub use migration::{
    MigrationPhase, StorageBackendType, VmMigration, VmMigrationSpec, VmMigrationStatus,
};
pub use network::{IpPolicy, VmNetworkAttachment, VmNetworkAttachmentSpec};
pub use provider::{Provider, ProviderPhase, ProviderSpec, ProviderStatus, ProviderType};
pub use snapshot::{RetentionPolicy, VmSnapshot, VmSnapshotSpec, VmSnapshotStatus};
pub use vm::{
    ImportedDiskRef, ImportedDiskSource, ObservedPowerState, Placement, PowerState,
    VirtualMachine, VirtualMachineSpec, VirtualMachineStatus, VmPhase,
};
