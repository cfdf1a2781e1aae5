//! Subsets of `az` JSON responses used by the adapter.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct VirtualMachine {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) provisioning_state: Option<String>,
    pub(super) time_created: Option<String>,
    pub(super) storage_profile: Option<StorageProfile>,
    pub(super) network_profile: Option<NetworkProfile>,
}

impl VirtualMachine {
    pub(super) fn os_disk_id(&self) -> Option<&str> {
        self.storage_profile
            .as_ref()?
            .os_disk
            .as_ref()?
            .managed_disk
            .as_ref()?
            .id
            .as_deref()
    }

    pub(super) fn nic_ids(&self) -> impl Iterator<Item = &str> {
        self.network_profile
            .iter()
            .flat_map(|profile| profile.network_interfaces.iter())
            .map(|nic| nic.id.as_str())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StorageProfile {
    pub(super) os_disk: Option<OsDisk>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct OsDisk {
    pub(super) managed_disk: Option<ManagedDisk>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct ManagedDisk {
    pub(super) id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct NetworkProfile {
    #[serde(default)]
    pub(super) network_interfaces: Vec<ResourceRef>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct ResourceRef {
    pub(super) id: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PublicIpAddress {
    pub(super) ip_address: Option<String>,
    pub(super) ip_configuration: Option<ResourceRef>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Disk {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) time_created: Option<String>,
    pub(super) disk_state: Option<String>,
}

/// Free public address and the network interface it is bound to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct IpConfiguration {
    pub(super) nic_id: String,
    pub(super) address: String,
}

/// Path segment separating an interface id from its IP configuration name.
const IP_CONFIGURATIONS_SEGMENT: &str = "/ipConfigurations/";

/// Pairs every public address with its interface, skipping interfaces that
/// already belong to a VM.
pub(super) fn free_ip_configurations(
    addresses: Vec<PublicIpAddress>,
    vms: &[VirtualMachine],
) -> Vec<IpConfiguration> {
    let used: Vec<String> = vms
        .iter()
        .flat_map(|vm| vm.nic_ids())
        .map(str::to_ascii_lowercase)
        .collect();
    addresses
        .into_iter()
        .filter_map(|entry| {
            let config = entry.ip_configuration?;
            let nic_id = config
                .id
                .rsplit_once(IP_CONFIGURATIONS_SEGMENT)
                .map_or(config.id.as_str(), |(nic, _)| nic)
                .to_owned();
            let address = entry.ip_address?;
            (!used.contains(&nic_id.to_ascii_lowercase())).then_some(IpConfiguration {
                nic_id,
                address,
            })
        })
        .collect()
}
