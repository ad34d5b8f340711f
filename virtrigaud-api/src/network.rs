//! VMNetworkAttachment resource: a provider-specific network a VM NIC
//! attaches to, with its IP policy.

use serde::{Deserialize, Serialize};

use crate::meta::{ObjectMeta, Resource};
use crate::provider::ProviderType;

/// VMNetworkAttachment resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmNetworkAttachment {
    pub meta: ObjectMeta,
    pub spec: VmNetworkAttachmentSpec,
}

/// Network description, discriminated by provider type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmNetworkAttachmentSpec {
    /// Discriminator: which sub-record is populated
    pub provider_type: ProviderType,
    pub vsphere: Option<VSphereNetwork>,
    pub libvirt: Option<LibvirtNetwork>,
    pub proxmox: Option<ProxmoxNetwork>,
    pub ip_policy: IpPolicy,
    /// Static addressing, required when `ip_policy` is `Static`
    pub static_config: Option<StaticIpConfig>,
}

impl Default for VmNetworkAttachmentSpec {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::Libvirt,
            vsphere: None,
            libvirt: None,
            proxmox: None,
            ip_policy: IpPolicy::Dhcp,
            static_config: None,
        }
    }
}

/// vSphere network: a portgroup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VSphereNetwork {
    pub portgroup: String,
}

/// Libvirt network: named network plus NIC model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LibvirtNetwork {
    pub network_name: String,
    pub model: String,
}

impl Default for LibvirtNetwork {
    fn default() -> Self {
        Self {
            network_name: "default".to_string(),
            model: "virtio".to_string(),
        }
    }
}

/// Proxmox network: bridge with VLAN/firewall/rate settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxmoxNetwork {
    pub bridge: String,
    pub vlan: Option<u16>,
    pub firewall: bool,
    pub rate_limit_mbps: Option<u32>,
}

/// IP assignment policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpPolicy {
    Dhcp,
    Static,
    None,
}

impl Default for IpPolicy {
    fn default() -> Self {
        Self::Dhcp
    }
}

/// Static IP configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticIpConfig {
    /// CIDR address, e.g. "10.0.0.5/24"
    pub address: String,
    pub gateway: Option<String>,
    pub dns: Vec<String>,
}

impl VmNetworkAttachmentSpec {
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

impl Resource for VmNetworkAttachment {
    const KIND: &'static str = "VMNetworkAttachment";

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
        crate::validation::validate_network(self, old)
    }
}
