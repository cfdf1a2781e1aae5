//! Subsets of `openstack -f json` output used by the adapter, plus parsers
//! for the two shapes the client prints addresses and attachments in.

use std::net::Ipv4Addr;

use serde::Deserialize;
use serde_json::Value;

/// Output of `server create` and `server show`.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct Server {
    pub(super) id: Option<String>,
    pub(super) name: Option<String>,
    pub(super) addresses: Option<Value>,
    pub(super) created: Option<String>,
}

/// Row of `server list` or `volume list`.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct Listed {
    #[serde(rename = "ID")]
    pub(super) id: String,
    #[serde(rename = "Name")]
    pub(super) name: Option<String>,
}

/// Row of `floating ip list`.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct FloatingIp {
    #[serde(rename = "Floating IP Address")]
    pub(super) floating: String,
    #[serde(rename = "Fixed IP Address")]
    pub(super) fixed: Option<String>,
}

/// Output of `volume create` and `volume show`.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct VolumeDetail {
    pub(super) id: Option<String>,
    pub(super) name: Option<String>,
    pub(super) status: Option<String>,
    pub(super) created_at: Option<String>,
    pub(super) attachments: Option<Value>,
}

fn collect_ipv4(value: &Value, found: &mut Vec<Ipv4Addr>) {
    match value {
        Value::String(text) => found.extend(
            text.split([',', '=', ';', ' '])
                .filter_map(|token| token.trim().parse::<Ipv4Addr>().ok()),
        ),
        Value::Array(items) => items.iter().for_each(|item| collect_ipv4(item, found)),
        Value::Object(map) => map.values().for_each(|item| collect_ipv4(item, found)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Last IPv4 address in a server's `addresses` field.
///
/// Older clients print `net=10.0.0.5, 172.24.4.10`; newer ones print
/// `{"net": ["10.0.0.5", "172.24.4.10"]}` or lists of `{"addr": ..}` objects.
pub(super) fn last_ipv4(addresses: &Value) -> Option<Ipv4Addr> {
    let mut found = Vec::new();
    collect_ipv4(addresses, &mut found);
    found.pop()
}

/// Device under which `server_id` sees a volume, from the `attachments`
/// field of `volume show`.
///
/// Structured output lists `{server_id, device}` objects; legacy output is
/// a sentence such as `Attached to bench-1 on /dev/vdb`.
pub(super) fn attachment_device(attachments: &Value, server_id: &str) -> Option<String> {
    match attachments {
        Value::Array(items) => items.iter().find_map(|item| {
            let matches_server = item.get("server_id").and_then(Value::as_str) == Some(server_id);
            matches_server
                .then(|| item.get("device").and_then(Value::as_str))
                .flatten()
                .filter(|device| !device.is_empty())
                .map(str::to_owned)
        }),
        Value::String(text) => text
            .split_whitespace()
            .find(|token| token.starts_with("/dev/"))
            .map(|device| device.trim_end_matches([',', '.']).to_owned()),
        _ => None,
    }
}
