//! Subsets of `gcloud compute` JSON responses used by the adapter.

use serde::Deserialize;
use serde_json::Value;

/// Zone operation as printed by `--async` commands and `operations describe`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Operation {
    pub(super) name: String,
    pub(super) status: Option<String>,
    pub(super) target_id: Option<String>,
    pub(super) error: Option<Value>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Instance {
    pub(super) name: String,
    pub(super) creation_timestamp: Option<String>,
    #[serde(default)]
    pub(super) network_interfaces: Vec<NetworkInterface>,
}

impl Instance {
    /// First external NAT address of the instance.
    pub(super) fn nat_ip(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .flat_map(|nic| nic.access_configs.iter())
            .find_map(|config| config.nat_ip.as_deref())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct NetworkInterface {
    #[serde(default)]
    pub(super) access_configs: Vec<AccessConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct AccessConfig {
    #[serde(rename = "natIP")]
    pub(super) nat_ip: Option<String>,
}
