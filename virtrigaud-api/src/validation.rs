//! Admission validation for all resource kinds.
//!
//! Each function returns a list of human-readable failures; an empty list
//! means the object is admitted. The cluster store runs these on create and
//! update, so invalid objects never reach the reconcilers.

use crate::class::VmClass;
use crate::image::VmImage;
use crate::migration::{StorageBackendType, VmMigration};
use crate::network::{IpPolicy, VmNetworkAttachment};
use crate::provider::{Provider, ProviderType};
use crate::snapshot::VmSnapshot;
use crate::vm::VirtualMachine;

/// Validate a DNS-1123 label (resource names).
pub fn validate_name(name: &str) -> Option<String> {
    if name.is_empty() {
        return Some("name must not be empty".to_string());
    }
    if name.len() > 63 {
        return Some(format!("name {:?} exceeds 63 characters", name));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !ok {
        return Some(format!(
            "name {:?} must be a lowercase DNS-1123 label",
            name
        ));
    }
    None
}

fn base(meta_name: &str, errors: &mut Vec<String>) {
    if let Some(e) = validate_name(meta_name) {
        errors.push(e);
    }
}

/// Provider admission rules.
pub fn validate_provider(provider: &Provider, _old: Option<&Provider>) -> Vec<String> {
    let mut errors = Vec::new();
    base(&provider.meta.name, &mut errors);

    if provider.spec.r#type != ProviderType::Mock {
        if provider.spec.endpoint.is_empty() {
            errors.push("spec.endpoint is required".to_string());
        }
        if provider.spec.credential_secret_ref.name.is_empty() {
            errors.push("spec.credentialSecretRef.name is required".to_string());
        }
    }
    if provider.spec.runtime.replicas == 0 {
        errors.push("spec.runtime.replicas must be at least 1".to_string());
    }

    errors
}

/// VMClass admission rules.
pub fn validate_class(class: &VmClass, _old: Option<&VmClass>) -> Vec<String> {
    let mut errors = Vec::new();
    base(&class.meta.name, &mut errors);

    if class.spec.cpu == 0 {
        errors.push("spec.cpu must be at least 1".to_string());
    }
    if class.spec.memory_mib < 64 {
        errors.push("spec.memoryMiB must be at least 64".to_string());
    }
    if class.spec.disk_defaults.size_gib == 0 {
        errors.push("spec.diskDefaults.sizeGiB must be at least 1".to_string());
    }

    errors
}

/// VMImage admission rules: the discriminator must select exactly the one
/// populated sub-record.
pub fn validate_image(image: &VmImage, _old: Option<&VmImage>) -> Vec<String> {
    let mut errors = Vec::new();
    base(&image.meta.name, &mut errors);

    let populated = image.spec.populated_variants();
    match image.spec.provider_type {
        ProviderType::Mock => {
            errors.push(
                "spec.providerType mock has no image block; mock providers consume libvirt images"
                    .to_string(),
            );
        }
        discriminator => {
            if populated != vec![discriminator] {
                errors.push(format!(
                    "spec.providerType is {} but populated blocks are {:?}",
                    discriminator.as_str(),
                    populated.iter().map(|p| p.as_str()).collect::<Vec<_>>()
                ));
            }
        }
    }

    if let Some(vs) = &image.spec.vsphere {
        if vs.template_name.is_none() && vs.content_library_item.is_none() {
            errors.push(
                "spec.vsphere requires templateName or contentLibraryItem".to_string(),
            );
        }
    }
    if let Some(lv) = &image.spec.libvirt {
        if lv.path.is_none() && lv.url.is_none() {
            errors.push("spec.libvirt requires path or url".to_string());
        }
    }
    if let Some(px) = &image.spec.proxmox {
        if px.template_id.is_none() && px.template_name.is_none() {
            errors.push("spec.proxmox requires templateId or templateName".to_string());
        }
    }

    errors
}

/// VMNetworkAttachment admission rules.
pub fn validate_network(
    network: &VmNetworkAttachment,
    _old: Option<&VmNetworkAttachment>,
) -> Vec<String> {
    let mut errors = Vec::new();
    base(&network.meta.name, &mut errors);

    let populated = network.spec.populated_variants();
    match network.spec.provider_type {
        ProviderType::Mock => {
            errors.push(
                "spec.providerType mock has no network block; mock providers consume libvirt networks"
                    .to_string(),
            );
        }
        discriminator => {
            if populated != vec![discriminator] {
                errors.push(format!(
                    "spec.providerType is {} but populated blocks are {:?}",
                    discriminator.as_str(),
                    populated.iter().map(|p| p.as_str()).collect::<Vec<_>>()
                ));
            }
        }
    }

    if network.spec.ip_policy == IpPolicy::Static && network.spec.static_config.is_none() {
        errors.push("spec.staticConfig is required when ipPolicy is static".to_string());
    }

    errors
}

/// VirtualMachine admission rules.
pub fn validate_vm(vm: &VirtualMachine, old: Option<&VirtualMachine>) -> Vec<String> {
    let mut errors = Vec::new();
    base(&vm.meta.name, &mut errors);

    if vm.spec.provider_ref.name.is_empty() {
        errors.push("spec.providerRef.name is required".to_string());
    }
    if vm.spec.class_ref.name.is_empty() {
        errors.push("spec.classRef.name is required".to_string());
    }

    // Exactly one disk source.
    match (&vm.spec.image_ref, &vm.spec.imported_disk_ref) {
        (Some(_), Some(_)) => {
            errors.push("spec.imageRef and spec.importedDiskRef are mutually exclusive".to_string());
        }
        (None, None) => {
            errors.push("one of spec.imageRef or spec.importedDiskRef is required".to_string());
        }
        _ => {}
    }

    if let Some(imported) = &vm.spec.imported_disk_ref {
        if imported.disk_id.is_empty() {
            errors.push("spec.importedDiskRef.diskId is required".to_string());
        }
        if imported.path.is_empty() {
            errors.push("spec.importedDiskRef.path is required".to_string());
        }
    }

    // importedDiskRef is immutable once set.
    if let Some(old_vm) = old {
        if let Some(old_imported) = &old_vm.spec.imported_disk_ref {
            if vm.spec.imported_disk_ref.as_ref() != Some(old_imported) {
                errors.push("spec.importedDiskRef is immutable once set".to_string());
            }
        }

        // Disk shrinking is forbidden.
        for old_disk in &old_vm.spec.disks {
            if let Some(new_disk) = vm.spec.disks.iter().find(|d| d.name == old_disk.name) {
                if new_disk.size_gib < old_disk.size_gib {
                    errors.push(format!(
                        "spec.disks[{}].sizeGiB may not shrink ({} -> {})",
                        new_disk.name, old_disk.size_gib, new_disk.size_gib
                    ));
                }
            }
        }
    }

    for disk in &vm.spec.disks {
        if disk.size_gib == 0 {
            errors.push(format!("spec.disks[{}].sizeGiB must be at least 1", disk.name));
        }
    }

    if let Some(resources) = &vm.spec.resources {
        if resources.cpu == Some(0) {
            errors.push("spec.resources.cpu must be at least 1".to_string());
        }
        if matches!(resources.memory_mib, Some(m) if m < 64) {
            errors.push("spec.resources.memoryMiB must be at least 64".to_string());
        }
    }

    if let Some(user_data) = &vm.spec.user_data {
        if let Some(cloud_init) = &user_data.cloud_init {
            if cloud_init.inline.is_some() && cloud_init.secret_ref.is_some() {
                errors.push(
                    "spec.userData.cloudInit: inline and secretRef are mutually exclusive"
                        .to_string(),
                );
            }
        }
    }

    errors
}

/// VMSnapshot admission rules.
pub fn validate_snapshot(snapshot: &VmSnapshot, _old: Option<&VmSnapshot>) -> Vec<String> {
    let mut errors = Vec::new();
    base(&snapshot.meta.name, &mut errors);

    if snapshot.spec.vm_ref.name.is_empty() {
        errors.push("spec.vmRef.name is required".to_string());
    }
    if let Some(retention) = &snapshot.spec.retention {
        if retention.max_count == Some(0) {
            errors.push("spec.retention.maxCount must be at least 1".to_string());
        }
    }
    if let Some(schedule) = &snapshot.spec.schedule {
        if schedule.split_whitespace().count() != 5 {
            errors.push(format!(
                "spec.schedule {:?} must be a five-field cron expression",
                schedule
            ));
        }
    }

    errors
}

/// VMMigration admission rules.
pub fn validate_migration(migration: &VmMigration, _old: Option<&VmMigration>) -> Vec<String> {
    let mut errors = Vec::new();
    base(&migration.meta.name, &mut errors);

    let spec = &migration.spec;
    if spec.source.vm_ref.name.is_empty() {
        errors.push("spec.source.vmRef.name is required".to_string());
    }
    if let Some(e) = validate_name(&spec.target.name) {
        errors.push(format!("spec.target.name: {}", e));
    }
    if spec.target.provider_ref.name.is_empty() {
        errors.push("spec.target.providerRef.name is required".to_string());
    }
    if spec.target.class_ref.name.is_empty() {
        errors.push("spec.target.classRef.name is required".to_string());
    }

    // A migration onto the same provider must not reuse the source name.
    let source_provider = spec
        .source
        .provider_ref
        .as_ref()
        .map(|r| r.name.as_str())
        .unwrap_or("");
    if !source_provider.is_empty()
        && source_provider == spec.target.provider_ref.name
        && spec.source.vm_ref.name == spec.target.name
    {
        errors.push("spec.target.name must differ from the source VM on the same provider".to_string());
    }

    match spec.storage.r#type {
        StorageBackendType::Pvc => {
            if spec.storage.size_gib.unwrap_or(0) == 0 {
                errors.push("spec.storage.sizeGiB is required for pvc storage".to_string());
            }
        }
        StorageBackendType::S3 => {
            if spec.storage.bucket.as_deref().unwrap_or("").is_empty() {
                errors.push("spec.storage.bucket is required for s3 storage".to_string());
            }
        }
        StorageBackendType::Http | StorageBackendType::Nfs => {
            if spec.storage.endpoint.as_deref().unwrap_or("").is_empty() {
                errors.push("spec.storage.endpoint is required for http/nfs storage".to_string());
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ObjectMeta, ObjectRef};
    use crate::vm::{DiskSpec, ImportedDiskRef, VirtualMachineSpec};

    fn valid_vm() -> VirtualMachine {
        VirtualMachine {
            meta: ObjectMeta::new("default", "web-1"),
            spec: VirtualMachineSpec {
                provider_ref: ObjectRef::new("vsphere-prod"),
                class_ref: ObjectRef::new("small"),
                image_ref: Some(ObjectRef::new("ubuntu-22-04")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_vm_requires_exactly_one_disk_source() {
        let mut vm = valid_vm();
        assert!(validate_vm(&vm, None).is_empty());

        vm.spec.imported_disk_ref = Some(ImportedDiskRef {
            disk_id: "disk-1".to_string(),
            path: "/pool/disk-1.qcow2".to_string(),
            ..Default::default()
        });
        let errors = validate_vm(&vm, None);
        assert!(errors.iter().any(|e| e.contains("mutually exclusive")));

        vm.spec.image_ref = None;
        assert!(validate_vm(&vm, None).is_empty());

        vm.spec.imported_disk_ref = None;
        let errors = validate_vm(&vm, None);
        assert!(errors.iter().any(|e| e.contains("one of")));
    }

    #[test]
    fn test_vm_imported_disk_immutable() {
        let mut old = valid_vm();
        old.spec.image_ref = None;
        old.spec.imported_disk_ref = Some(ImportedDiskRef {
            disk_id: "disk-1".to_string(),
            path: "/pool/disk-1.qcow2".to_string(),
            ..Default::default()
        });

        let mut updated = old.clone();
        updated.spec.imported_disk_ref.as_mut().unwrap().path = "/pool/other.qcow2".to_string();
        let errors = validate_vm(&updated, Some(&old));
        assert!(errors.iter().any(|e| e.contains("immutable")));
    }

    #[test]
    fn test_vm_disk_shrink_rejected() {
        let mut old = valid_vm();
        old.spec.disks = vec![DiskSpec {
            name: "disk0".to_string(),
            size_gib: 40,
            ..Default::default()
        }];

        let mut updated = old.clone();
        updated.spec.disks[0].size_gib = 20;
        let errors = validate_vm(&updated, Some(&old));
        assert!(errors.iter().any(|e| e.contains("shrink")));

        // Growing is fine.
        updated.spec.disks[0].size_gib = 80;
        assert!(validate_vm(&updated, Some(&old)).is_empty());
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("web-1").is_none());
        assert!(validate_name("Web-1").is_some());
        assert!(validate_name("-web").is_some());
        assert!(validate_name("").is_some());
        assert!(validate_name(&"a".repeat(64)).is_some());
    }
}
