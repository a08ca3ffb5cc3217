use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::json;
use url::Url;

use crate::xui::models::{
    parse_inbound_settings, parse_stream_settings, ClientPayload, Inbound, StreamSettings,
};

/// Rebuilds a connection URI directly from the inbound configuration and a
/// synthesized client, for when the panel's own subscription service yields
/// nothing. Returns `None` whenever a required piece (host, port, secret)
/// cannot be resolved; a partial link is never emitted.
pub fn build_direct_link(
    inbound: &Inbound,
    client: &ClientPayload,
    config_name: &str,
    base_url: &str,
) -> Option<String> {
    let protocol = inbound.protocol.to_lowercase();
    let stream = parse_stream_settings(&inbound.stream_settings);

    let network = stream
        .network
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or("tcp")
        .to_lowercase();
    let security = stream
        .security
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("none")
        .to_lowercase();

    let (host, port) = resolve_host_port(base_url, inbound, &stream)?;
    let fragment = urlencoding::encode(config_name).into_owned();

    match protocol.as_str() {
        "vless" => {
            let client_id = client.id.as_deref().filter(|id| !id.is_empty())?;
            let mut params: Vec<(&str, String)> = vec![
                ("type", network.clone()),
                ("security", security.clone()),
                ("encryption", "none".to_string()),
            ];
            if let Some(flow) = client.flow.as_deref().filter(|f| !f.is_empty()) {
                params.push(("flow", flow.to_string()));
            }
            apply_stream_query(&mut params, &stream, &network);
            apply_security_query(&mut params, &stream, &security);
            Some(format!(
                "vless://{}@{}:{}?{}#{}",
                client_id,
                host,
                port,
                encode_query(&params),
                fragment
            ))
        }
        "trojan" => {
            let password = client.password.as_deref().filter(|p| !p.is_empty())?;
            let mut params: Vec<(&str, String)> =
                vec![("type", network.clone()), ("security", security.clone())];
            apply_stream_query(&mut params, &stream, &network);
            apply_security_query(&mut params, &stream, &security);
            Some(format!(
                "trojan://{}@{}:{}?{}#{}",
                password,
                host,
                port,
                encode_query(&params),
                fragment
            ))
        }
        "shadowsocks" => {
            let password = client.password.as_deref().filter(|p| !p.is_empty())?;
            let method = parse_inbound_settings(&inbound.settings)
                .method
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "aes-128-gcm".to_string());
            let userinfo = URL_SAFE_NO_PAD.encode(format!("{}:{}", method, password));
            Some(format!("ss://{}@{}:{}#{}", userinfo, host, port, fragment))
        }
        "vmess" => {
            let client_id = client.id.as_deref().filter(|id| !id.is_empty())?;
            let mut params: Vec<(&str, String)> = Vec::new();
            apply_stream_query(&mut params, &stream, &network);
            apply_security_query(&mut params, &stream, &security);

            let vmess = json!({
                "v": "2",
                "ps": config_name,
                "add": host,
                "port": port.to_string(),
                "id": client_id,
                "aid": "0",
                "scy": client.security.as_deref().unwrap_or("auto"),
                "net": network,
                "type": query_value(&params, "headerType").unwrap_or("none"),
                "host": query_value(&params, "host").unwrap_or(""),
                "path": query_value(&params, "path")
                    .or_else(|| query_value(&params, "serviceName"))
                    .unwrap_or(""),
                "tls": if security == "tls" || security == "reality" { "tls" } else { "" },
                "sni": query_value(&params, "sni").unwrap_or(""),
            });
            let token = STANDARD.encode(vmess.to_string());
            Some(format!("vmess://{}", token))
        }
        _ => None,
    }
}

/// Host comes from the panel URL unless the inbound publishes an external
/// proxy; the panel's own port is the last resort when the inbound port is
/// unusable.
fn resolve_host_port(base_url: &str, inbound: &Inbound, stream: &StreamSettings) -> Option<(String, i64)> {
    let parsed = Url::parse(base_url).ok()?;
    let mut host = parsed.host_str().unwrap_or("").to_string();
    let mut port = inbound.port;

    if let Some(proxy) = stream.external_proxy.first() {
        if let Some(dest) = proxy.dest.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            host = dest.to_string();
        }
        if let Some(ext_port) = proxy.port.as_ref().and_then(|p| p.as_i64()) {
            if ext_port > 0 {
                port = ext_port;
            }
        }
    }

    if port <= 0 {
        if let Some(base_port) = parsed.port() {
            port = i64::from(base_port);
        }
    }

    if host.is_empty() || port <= 0 {
        return None;
    }
    Some((host, port))
}

fn apply_stream_query(params: &mut Vec<(&str, String)>, stream: &StreamSettings, network: &str) {
    match network {
        "tcp" => {
            let header = stream.tcp_settings.as_ref().and_then(|t| t.header.as_ref());
            let header_type = header
                .and_then(|h| h.kind.as_deref())
                .filter(|k| !k.trim().is_empty())
                .unwrap_or("none")
                .to_string();
            params.push(("headerType", header_type.clone()));
            if header_type == "http" {
                if let Some(request) = header.and_then(|h| h.request.as_ref()) {
                    if let Some(path) = request.path.as_ref().and_then(|p| p.first()) {
                        params.push(("path", path.to_string()));
                    }
                    if let Some(host) = request
                        .headers
                        .as_ref()
                        .and_then(|h| h.get("Host"))
                        .and_then(|v| v.first())
                    {
                        params.push(("host", host.to_string()));
                    }
                }
            }
        }
        "ws" => {
            if let Some(ws) = stream.ws_settings.as_ref() {
                if let Some(path) = ws.path.as_deref().filter(|p| !p.is_empty()) {
                    params.push(("path", path.to_string()));
                }
                if let Some(host) = ws
                    .headers
                    .as_ref()
                    .and_then(|h| h.get("Host"))
                    .and_then(|v| v.first())
                {
                    params.push(("host", host.to_string()));
                }
            }
        }
        "grpc" => {
            if let Some(service) = stream
                .grpc_settings
                .as_ref()
                .and_then(|g| g.service_name.as_deref())
                .filter(|s| !s.is_empty())
            {
                params.push(("serviceName", service.to_string()));
            }
        }
        _ => {}
    }
}

fn apply_security_query(params: &mut Vec<(&str, String)>, stream: &StreamSettings, security: &str) {
    match security {
        "tls" => {
            if let Some(tls) = stream.tls_settings.as_ref() {
                if let Some(sni) = tls.server_name.as_deref().filter(|s| !s.is_empty()) {
                    params.push(("sni", sni.to_string()));
                }
                let alpn: Vec<&str> = tls
                    .alpn
                    .iter()
                    .map(String::as_str)
                    .filter(|a| !a.is_empty())
                    .collect();
                if !alpn.is_empty() {
                    params.push(("alpn", alpn.join(",")));
                }
                if let Some(fp) = tls.fingerprint.as_deref().filter(|f| !f.is_empty()) {
                    params.push(("fp", fp.to_string()));
                }
            }
        }
        "reality" => {
            if let Some(reality) = stream.reality_settings.as_ref() {
                if let Some(sni) = reality
                    .server_names
                    .iter()
                    .map(|s| s.trim())
                    .find(|s| !s.is_empty())
                {
                    params.push(("sni", sni.to_string()));
                }
                if let Some(pbk) = reality.public_key.as_deref().filter(|k| !k.is_empty()) {
                    params.push(("pbk", pbk.to_string()));
                }
                if let Some(sid) = reality
                    .short_ids
                    .iter()
                    .map(|s| s.trim())
                    .find(|s| !s.is_empty())
                {
                    params.push(("sid", sid.to_string()));
                }
                if let Some(spider) = reality.spider_x.as_deref().filter(|s| !s.is_empty()) {
                    params.push(("spx", spider.to_string()));
                }
                if let Some(fp) = reality.fingerprint.as_deref().filter(|f| !f.is_empty()) {
                    params.push(("fp", fp.to_string()));
                }
            }
        }
        _ => {}
    }
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn query_value<'a>(params: &'a [(&str, String)], key: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
}
