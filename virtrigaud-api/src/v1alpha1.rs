//! Prior API version (v1alpha1) and conversion to/from the storage version.
//!
//! v1alpha1 predates the tagged per-provider variants and the imported-disk
//! flow: images and networks carry flat per-provider fields, and the VM spec
//! has no `importedDiskRef`. Conversion is lossless in both directions for
//! all spec fields; values v1alpha1 cannot represent ride through a
//! round-trip annotation, the usual conversion-webhook escape hatch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::class::DiskFormat;
use crate::image::{LibvirtImage, ProxmoxImage, VSphereImage, VmImage, VmImageSpec};
use crate::meta::{ObjectMeta, ObjectRef};
use crate::network::{
    IpPolicy, LibvirtNetwork, ProxmoxNetwork, StaticIpConfig, VSphereNetwork,
    VmNetworkAttachment, VmNetworkAttachmentSpec,
};
use crate::provider::ProviderType;
use crate::vm::{
    DiskSpec, ImportedDiskRef, Placement, PowerState, ResourceOverride, UserData,
    VirtualMachine, VirtualMachineSpec,
};

/// Annotation carrying spec fields v1alpha1 has no schema for.
pub const ROUND_TRIP_ANNOTATION: &str = "v1alpha1.virtrigaud.io/round-trip";

/// Conversion failure.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("ambiguous provider fields: {0}")]
    Ambiguous(String),
    #[error("unknown enum value: {0}")]
    UnknownValue(String),
    #[error("malformed round-trip annotation: {0}")]
    RoundTrip(String),
}

// =============================================================================
// v1alpha1 SHAPES
// =============================================================================

/// v1alpha1 VMImage: flat per-provider fields, no discriminator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmImageV1Alpha1 {
    pub meta: ObjectMeta,
    pub spec: VmImageSpecV1Alpha1,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmImageSpecV1Alpha1 {
    pub vsphere_template: Option<String>,
    pub vsphere_content_library_item: Option<String>,
    pub libvirt_path: Option<String>,
    pub libvirt_url: Option<String>,
    pub proxmox_template_id: Option<u32>,
    pub proxmox_template_name: Option<String>,
    pub proxmox_storage_pool: Option<String>,
    pub format: Option<DiskFormat>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// v1alpha1 VMNetworkAttachment: flat per-provider fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmNetworkAttachmentV1Alpha1 {
    pub meta: ObjectMeta,
    pub spec: VmNetworkAttachmentSpecV1Alpha1,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmNetworkAttachmentSpecV1Alpha1 {
    pub vsphere_portgroup: Option<String>,
    pub libvirt_network: Option<String>,
    pub libvirt_model: Option<String>,
    pub proxmox_bridge: Option<String>,
    pub vlan: Option<u16>,
    pub firewall: bool,
    pub rate_limit_mbps: Option<u32>,
    /// "dhcp" | "static" | "none"
    pub ip_policy: String,
    pub static_address: Option<String>,
    pub static_gateway: Option<String>,
    pub static_dns: Vec<String>,
}

/// v1alpha1 VirtualMachine: string power state, no imported disks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualMachineV1Alpha1 {
    pub meta: ObjectMeta,
    pub spec: VirtualMachineSpecV1Alpha1,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualMachineSpecV1Alpha1 {
    pub provider_ref: ObjectRef,
    pub class_ref: ObjectRef,
    pub image_ref: Option<ObjectRef>,
    pub networks: Vec<ObjectRef>,
    pub disks: Vec<DiskSpec>,
    pub user_data: Option<UserData>,
    pub placement: Option<Placement>,
    /// "On" | "Off" | "OffGraceful"
    pub power_state: String,
    pub resources: Option<ResourceOverride>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

// =============================================================================
// VMIMAGE CONVERSION
// =============================================================================

/// Convert a v1alpha1 image to the storage version.
pub fn image_from_v1alpha1(old: VmImageV1Alpha1) -> Result<VmImage, ConvertError> {
    let spec = &old.spec;
    let mut populated = Vec::new();
    if spec.vsphere_template.is_some() || spec.vsphere_content_library_item.is_some() {
        populated.push(ProviderType::VSphere);
    }
    if spec.libvirt_path.is_some() || spec.libvirt_url.is_some() {
        populated.push(ProviderType::Libvirt);
    }
    if spec.proxmox_template_id.is_some()
        || spec.proxmox_template_name.is_some()
        || spec.proxmox_storage_pool.is_some()
    {
        populated.push(ProviderType::Proxmox);
    }
    let provider_type = match populated.as_slice() {
        [one] => *one,
        other => {
            return Err(ConvertError::Ambiguous(format!(
                "image must populate exactly one provider block, found {:?}",
                other.iter().map(|p| p.as_str()).collect::<Vec<_>>()
            )))
        }
    };

    let mut new_spec = VmImageSpec {
        provider_type,
        format: spec.format,
        metadata: spec.metadata.clone(),
        ..Default::default()
    };
    match provider_type {
        ProviderType::VSphere => {
            new_spec.vsphere = Some(VSphereImage {
                template_name: spec.vsphere_template.clone(),
                content_library_item: spec.vsphere_content_library_item.clone(),
            });
        }
        ProviderType::Libvirt => {
            new_spec.libvirt = Some(LibvirtImage {
                path: spec.libvirt_path.clone(),
                url: spec.libvirt_url.clone(),
            });
        }
        ProviderType::Proxmox => {
            new_spec.proxmox = Some(ProxmoxImage {
                template_id: spec.proxmox_template_id,
                template_name: spec.proxmox_template_name.clone(),
                storage_pool: spec.proxmox_storage_pool.clone(),
            });
        }
        ProviderType::Mock => unreachable!("mock is never inferred from image fields"),
    }

    Ok(VmImage {
        meta: old.meta,
        spec: new_spec,
    })
}

/// Convert a storage-version image down to v1alpha1.
pub fn image_to_v1alpha1(new: VmImage) -> Result<VmImageV1Alpha1, ConvertError> {
    let mut spec = VmImageSpecV1Alpha1 {
        format: new.spec.format,
        metadata: new.spec.metadata.clone(),
        ..Default::default()
    };
    if let Some(vs) = &new.spec.vsphere {
        spec.vsphere_template = vs.template_name.clone();
        spec.vsphere_content_library_item = vs.content_library_item.clone();
    }
    if let Some(lv) = &new.spec.libvirt {
        spec.libvirt_path = lv.path.clone();
        spec.libvirt_url = lv.url.clone();
    }
    if let Some(px) = &new.spec.proxmox {
        spec.proxmox_template_id = px.template_id;
        spec.proxmox_template_name = px.template_name.clone();
        spec.proxmox_storage_pool = px.storage_pool.clone();
    }

    Ok(VmImageV1Alpha1 {
        meta: new.meta,
        spec,
    })
}

// =============================================================================
// VMNETWORKATTACHMENT CONVERSION
// =============================================================================

/// Convert a v1alpha1 network attachment to the storage version.
pub fn network_from_v1alpha1(
    old: VmNetworkAttachmentV1Alpha1,
) -> Result<VmNetworkAttachment, ConvertError> {
    let spec = &old.spec;
    let mut populated = Vec::new();
    if spec.vsphere_portgroup.is_some() {
        populated.push(ProviderType::VSphere);
    }
    if spec.libvirt_network.is_some() {
        populated.push(ProviderType::Libvirt);
    }
    if spec.proxmox_bridge.is_some() {
        populated.push(ProviderType::Proxmox);
    }
    let provider_type = match populated.as_slice() {
        [one] => *one,
        other => {
            return Err(ConvertError::Ambiguous(format!(
                "network must populate exactly one provider block, found {:?}",
                other.iter().map(|p| p.as_str()).collect::<Vec<_>>()
            )))
        }
    };

    let ip_policy = match spec.ip_policy.as_str() {
        "" | "dhcp" => IpPolicy::Dhcp,
        "static" => IpPolicy::Static,
        "none" => IpPolicy::None,
        other => return Err(ConvertError::UnknownValue(format!("ipPolicy {:?}", other))),
    };

    let static_config = spec.static_address.as_ref().map(|address| StaticIpConfig {
        address: address.clone(),
        gateway: spec.static_gateway.clone(),
        dns: spec.static_dns.clone(),
    });

    let mut new_spec = VmNetworkAttachmentSpec {
        provider_type,
        ip_policy,
        static_config,
        ..Default::default()
    };
    match provider_type {
        ProviderType::VSphere => {
            new_spec.vsphere = Some(VSphereNetwork {
                portgroup: spec.vsphere_portgroup.clone().unwrap_or_default(),
            });
        }
        ProviderType::Libvirt => {
            new_spec.libvirt = Some(LibvirtNetwork {
                network_name: spec.libvirt_network.clone().unwrap_or_default(),
                model: spec.libvirt_model.clone().unwrap_or_else(|| "virtio".to_string()),
            });
        }
        ProviderType::Proxmox => {
            new_spec.proxmox = Some(ProxmoxNetwork {
                bridge: spec.proxmox_bridge.clone().unwrap_or_default(),
                vlan: spec.vlan,
                firewall: spec.firewall,
                rate_limit_mbps: spec.rate_limit_mbps,
            });
        }
        ProviderType::Mock => unreachable!("mock is never inferred from network fields"),
    }

    Ok(VmNetworkAttachment {
        meta: old.meta,
        spec: new_spec,
    })
}

/// Convert a storage-version network attachment down to v1alpha1.
pub fn network_to_v1alpha1(
    new: VmNetworkAttachment,
) -> Result<VmNetworkAttachmentV1Alpha1, ConvertError> {
    let mut spec = VmNetworkAttachmentSpecV1Alpha1 {
        ip_policy: match new.spec.ip_policy {
            IpPolicy::Dhcp => "dhcp".to_string(),
            IpPolicy::Static => "static".to_string(),
            IpPolicy::None => "none".to_string(),
        },
        ..Default::default()
    };
    if let Some(sc) = &new.spec.static_config {
        spec.static_address = Some(sc.address.clone());
        spec.static_gateway = sc.gateway.clone();
        spec.static_dns = sc.dns.clone();
    }
    if let Some(vs) = &new.spec.vsphere {
        spec.vsphere_portgroup = Some(vs.portgroup.clone());
    }
    if let Some(lv) = &new.spec.libvirt {
        spec.libvirt_network = Some(lv.network_name.clone());
        spec.libvirt_model = Some(lv.model.clone());
    }
    if let Some(px) = &new.spec.proxmox {
        spec.proxmox_bridge = Some(px.bridge.clone());
        spec.vlan = px.vlan;
        spec.firewall = px.firewall;
        spec.rate_limit_mbps = px.rate_limit_mbps;
    }

    Ok(VmNetworkAttachmentV1Alpha1 {
        meta: new.meta,
        spec,
    })
}

// =============================================================================
// VIRTUALMACHINE CONVERSION
// =============================================================================

/// Convert a v1alpha1 VM to the storage version.
pub fn vm_from_v1alpha1(mut old: VirtualMachineV1Alpha1) -> Result<VirtualMachine, ConvertError> {
    let power_state = match old.spec.power_state.as_str() {
        "" | "On" => PowerState::On,
        "Off" => PowerState::Off,
        "OffGraceful" => PowerState::OffGraceful,
        other => return Err(ConvertError::UnknownValue(format!("powerState {:?}", other))),
    };

    // Restore fields stashed by a prior down-conversion.
    let imported_disk_ref = match old.meta.annotations.remove(ROUND_TRIP_ANNOTATION) {
        Some(raw) => Some(
            serde_json::from_str::<ImportedDiskRef>(&raw)
                .map_err(|e| ConvertError::RoundTrip(e.to_string()))?,
        ),
        None => None,
    };

    let image_ref = if imported_disk_ref.is_some() {
        None
    } else {
        old.spec.image_ref.clone()
    };

    Ok(VirtualMachine {
        meta: old.meta,
        spec: VirtualMachineSpec {
            provider_ref: old.spec.provider_ref,
            class_ref: old.spec.class_ref,
            image_ref,
            imported_disk_ref,
            networks: old.spec.networks,
            disks: old.spec.disks,
            user_data: old.spec.user_data,
            placement: old.spec.placement,
            power_state,
            resources: old.spec.resources,
            tags: old.spec.tags,
            metadata: old.spec.metadata,
        },
        status: Default::default(),
    })
}

/// Convert a storage-version VM down to v1alpha1.
///
/// `importedDiskRef` has no v1alpha1 schema; it is stashed in the
/// round-trip annotation so up-conversion restores it exactly.
pub fn vm_to_v1alpha1(new: VirtualMachine) -> Result<VirtualMachineV1Alpha1, ConvertError> {
    let mut meta = new.meta;
    if let Some(imported) = &new.spec.imported_disk_ref {
        let raw = serde_json::to_string(imported)
            .map_err(|e| ConvertError::RoundTrip(e.to_string()))?;
        meta.annotations.insert(ROUND_TRIP_ANNOTATION.to_string(), raw);
    }

    Ok(VirtualMachineV1Alpha1 {
        meta,
        spec: VirtualMachineSpecV1Alpha1 {
            provider_ref: new.spec.provider_ref,
            class_ref: new.spec.class_ref,
            image_ref: new.spec.image_ref,
            networks: new.spec.networks,
            disks: new.spec.disks,
            user_data: new.spec.user_data,
            placement: new.spec.placement,
            power_state: match new.spec.power_state {
                PowerState::On => "On".to_string(),
                PowerState::Off => "Off".to_string(),
                PowerState::OffGraceful => "OffGraceful".to_string(),
            },
            resources: new.spec.resources,
            tags: new.spec.tags,
            metadata: new.spec.metadata,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ImportedDiskSource;

    #[test]
    fn test_image_round_trip() {
        let old = VmImageV1Alpha1 {
            meta: ObjectMeta::new("default", "ubuntu-22-04"),
            spec: VmImageSpecV1Alpha1 {
                libvirt_path: Some("/var/lib/images/ubuntu-22.04.qcow2".to_string()),
                format: Some(DiskFormat::Qcow2),
                ..Default::default()
            },
        };

        let new = image_from_v1alpha1(old.clone()).unwrap();
        assert_eq!(new.spec.provider_type, ProviderType::Libvirt);
        let back = image_to_v1alpha1(new).unwrap();
        assert_eq!(back.spec, old.spec);
    }

    #[test]
    fn test_image_ambiguous_rejected() {
        let old = VmImageV1Alpha1 {
            meta: ObjectMeta::new("default", "img"),
            spec: VmImageSpecV1Alpha1 {
                libvirt_path: Some("/a.qcow2".to_string()),
                vsphere_template: Some("tmpl".to_string()),
                ..Default::default()
            },
        };
        assert!(image_from_v1alpha1(old).is_err());
    }

    #[test]
    fn test_network_round_trip() {
        let old = VmNetworkAttachmentV1Alpha1 {
            meta: ObjectMeta::new("default", "vlan-40"),
            spec: VmNetworkAttachmentSpecV1Alpha1 {
                proxmox_bridge: Some("vmbr0".to_string()),
                vlan: Some(40),
                firewall: true,
                ip_policy: "static".to_string(),
                static_address: Some("10.0.40.5/24".to_string()),
                static_gateway: Some("10.0.40.1".to_string()),
                static_dns: vec!["10.0.0.2".to_string()],
                ..Default::default()
            },
        };

        let new = network_from_v1alpha1(old.clone()).unwrap();
        assert_eq!(new.spec.provider_type, ProviderType::Proxmox);
        assert_eq!(new.spec.ip_policy, IpPolicy::Static);
        let back = network_to_v1alpha1(new).unwrap();
        assert_eq!(back.spec, old.spec);
    }

    #[test]
    fn test_vm_round_trip_from_v1alpha1() {
        let old = VirtualMachineV1Alpha1 {
            meta: ObjectMeta::new("default", "web-1"),
            spec: VirtualMachineSpecV1Alpha1 {
                provider_ref: ObjectRef::new("vsphere-prod"),
                class_ref: ObjectRef::new("small"),
                image_ref: Some(ObjectRef::new("ubuntu-22-04")),
                power_state: "OffGraceful".to_string(),
                tags: vec!["web".to_string()],
                ..Default::default()
            },
        };

        let new = vm_from_v1alpha1(old.clone()).unwrap();
        assert_eq!(new.spec.power_state, PowerState::OffGraceful);
        let back = vm_to_v1alpha1(new).unwrap();
        assert_eq!(back.spec, old.spec);
    }

    #[test]
    fn test_vm_imported_disk_survives_down_conversion() {
        let vm = VirtualMachine {
            meta: ObjectMeta::new("default", "db-1-restored"),
            spec: VirtualMachineSpec {
                provider_ref: ObjectRef::new("libvirt-lab"),
                class_ref: ObjectRef::new("medium"),
                imported_disk_ref: Some(ImportedDiskRef {
                    disk_id: "disk-42".to_string(),
                    path: "/pool/default/db-1.qcow2".to_string(),
                    source: ImportedDiskSource::Migration,
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let down = vm_to_v1alpha1(vm.clone()).unwrap();
        assert!(down.meta.annotations.contains_key(ROUND_TRIP_ANNOTATION));

        let up = vm_from_v1alpha1(down).unwrap();
        assert_eq!(up.spec, vm.spec);
        assert!(!up.meta.annotations.contains_key(ROUND_TRIP_ANNOTATION));
    }
}
