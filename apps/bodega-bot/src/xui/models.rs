use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One inbound as returned by `/panel/api/inbounds/list`. The panel ships
/// `settings` and `streamSettings` as JSON-encoded strings; they are kept raw
/// here and parsed once at the link-builder boundary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Inbound {
    pub id: i64,
    pub port: i64,
    pub protocol: String,
    pub settings: Value,
    pub stream_settings: Value,
    #[serde(deserialize_with = "null_default")]
    pub client_stats: Vec<ClientStat>,
}

/// A known remote account. `enable` is tri-state on purpose: only an explicit
/// `false` frees the slot, absent counts as active.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientStat {
    pub email: String,
    pub enable: Option<bool>,
}

impl ClientStat {
    pub fn is_active(&self) -> bool {
        self.enable != Some(false)
    }
}

/// The subset of `/panel/setting/all` the allocator needs.
#[derive(Debug, Clone, Default)]
pub struct PanelSettings {
    pub sub_enable: bool,
    pub sub_uri: String,
    pub sub_path: String,
    pub sub_port: i64,
}

/// Wire payload for `addClient`. Per-protocol fields stay `None` and are
/// omitted from the JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPayload {
    pub email: String,
    pub limit_ip: i64,
    #[serde(rename = "totalGB")]
    pub total_gb: i64,
    pub expiry_time: i64,
    pub enable: bool,
    pub sub_id: String,
    pub comment: String,
    pub tg_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

// ---------------------------------------------------------------------------
// Typed views over the inbound's JSON blobs. Everything is optional: a field
// the panel does not send simply stays absent, it never fails the parse.
// ---------------------------------------------------------------------------

/// Xray encodes several fields as either a string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn first(&self) -> Option<&str> {
        match self {
            StringOrList::One(s) => {
                let s = s.trim();
                (!s.is_empty()).then_some(s)
            }
            StringOrList::Many(items) => items
                .iter()
                .map(|s| s.trim())
                .find(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LoosePort {
    Num(i64),
    Text(String),
}

impl LoosePort {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            LoosePort::Num(n) => Some(*n),
            LoosePort::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    pub network: Option<String>,
    pub security: Option<String>,
    #[serde(deserialize_with = "null_default")]
    pub external_proxy: Vec<ExternalProxy>,
    pub tcp_settings: Option<TcpSettings>,
    pub ws_settings: Option<WsSettings>,
    pub grpc_settings: Option<GrpcSettings>,
    pub tls_settings: Option<TlsSettings>,
    pub reality_settings: Option<RealitySettings>,
}

/// Relay/CDN override published by the panel; when present it replaces the
/// panel host (and port, if valid) in built links.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalProxy {
    pub dest: Option<String>,
    pub port: Option<LoosePort>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpSettings {
    pub header: Option<TcpHeader>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TcpHeader {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub request: Option<TcpHeaderRequest>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TcpHeaderRequest {
    pub path: Option<StringOrList>,
    pub headers: Option<HashMap<String, StringOrList>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WsSettings {
    pub path: Option<String>,
    pub headers: Option<HashMap<String, StringOrList>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GrpcSettings {
    pub service_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSettings {
    pub server_name: Option<String>,
    #[serde(deserialize_with = "null_default")]
    pub alpn: Vec<String>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealitySettings {
    #[serde(deserialize_with = "null_default")]
    pub server_names: Vec<String>,
    pub public_key: Option<String>,
    #[serde(deserialize_with = "null_default")]
    pub short_ids: Vec<String>,
    pub spider_x: Option<String>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundSettings {
    pub method: Option<String>,
}

fn parse_json_blob<T>(raw: &Value) -> T
where
    T: Default + for<'de> Deserialize<'de>,
{
    match raw {
        Value::String(s) => serde_json::from_str(s).unwrap_or_default(),
        Value::Object(_) => serde_json::from_value(raw.clone()).unwrap_or_default(),
        _ => T::default(),
    }
}

pub fn parse_stream_settings(raw: &Value) -> StreamSettings {
    parse_json_blob(raw)
}

pub fn parse_inbound_settings(raw: &Value) -> InboundSettings {
    parse_json_blob(raw)
}
