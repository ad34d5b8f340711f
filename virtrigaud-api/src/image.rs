//! VMImage resource: a source disk or template, described per provider.
//!
//! Modeled as a tagged variant: the `providerType` discriminator selects
//! exactly one populated sub-record. Admission rejects mismatches.

use serde::{Deserialize, Serialize};

use crate::class::DiskFormat;
use crate::meta::{ObjectMeta, Resource};
use crate::provider::ProviderType;

/// VMImage resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmImage {
    pub meta: ObjectMeta,
    pub spec: VmImageSpec,
}

/// Image source, discriminated by provider type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmImageSpec {
    /// Discriminator: which sub-record is populated
    pub provider_type: ProviderType,
    pub vsphere: Option<VSphereImage>,
    pub libvirt: Option<LibvirtImage>,
    pub proxmox: Option<ProxmoxImage>,
    /// Declared disk format, when known
    pub format: Option<DiskFormat>,
    /// Free-form metadata (os family, version, ...)
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Default for VmImageSpec {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::Libvirt,
            vsphere: None,
            libvirt: None,
            proxmox: None,
            format: None,
            metadata: serde_json::Map::new(),
        }
    }
}

/// vSphere image source: a template or a content-library item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VSphereImage {
    pub template_name: Option<String>,
    pub content_library_item: Option<String>,
}

/// Libvirt image source: a qcow2 path on the host or a download URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LibvirtImage {
    pub path: Option<String>,
    pub url: Option<String>,
}

/// Proxmox image source: a template id or name plus storage pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxmoxImage {
    pub template_id: Option<u32>,
    pub template_name: Option<String>,
    pub storage_pool: Option<String>,
}

impl VmImageSpec {
    /// Which sub-records are populated, by discriminator value.
    pub fn populated_variants(&self) -> Vec<ProviderType> {
        let mut v = Vec::new();
        if self.vsphere.is_some() {
            v.push(ProviderType::VSphere);
        }
        if self.libvirt.is_some() {
            v.push(ProviderType::Libvirt);
        }
        if self.proxmox.is_some() {
            v.push(ProviderType::Proxmox);
        }
        v
    }
}

impl Resource for VmImage {
    const KIND: &'static str = "VMImage";

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
        crate::validation::validate_image(self, old)
    }
}
