use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use bodega_db::models::panel::Panel;

use crate::xui::models::{ClientPayload, Inbound, PanelSettings};
use crate::xui::{PanelApi, PanelConnector, XuiError};

/// Session client for one 3x-ui panel. Login is lazy; a request that comes
/// back 401/404 or with a "login" rejection is retried exactly once after
/// re-authenticating.
pub struct XuiClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    logged_in: AtomicBool,
}

impl XuiClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        verify_tls: bool,
        timeout: Duration,
    ) -> Result<Self, XuiError> {
        let base_url = normalize_base_url(base_url)?;
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .user_agent("bodega-bot/0.1")
            .build()?;

        Ok(Self {
            http,
            base_url,
            username: username.to_string(),
            password: password.to_string(),
            logged_in: AtomicBool::new(false),
        })
    }

    async fn ensure_login(&self) -> Result<(), XuiError> {
        if self.logged_in.load(Ordering::SeqCst) {
            return Ok(());
        }
        let response = self
            .http
            .post(format!("{}/login", self.base_url))
            .form(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(XuiError::Login(format!("status {}", response.status())));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|_| XuiError::InvalidResponse("non-JSON login response".into()))?;
        if payload.get("success").and_then(Value::as_bool) != Some(true) {
            let msg = envelope_msg(&payload);
            let msg = if msg.is_empty() { "panel login rejected".to_string() } else { msg };
            return Err(XuiError::Login(msg));
        }

        self.logged_in.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn request_panel_json(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<Value, XuiError> {
        let mut retry = true;
        loop {
            self.ensure_login().await?;

            let mut request = self
                .http
                .request(method.clone(), format!("{}{}", self.base_url, path))
                .header("X-Requested-With", "XMLHttpRequest");
            if let Some(form) = form {
                request = request.form(form);
            }
            let response = request.send().await?;
            let status = response.status();

            // A dead session shows up as 401 (or 404 on older panels).
            if retry && (status == StatusCode::UNAUTHORIZED || status == StatusCode::NOT_FOUND) {
                debug!("Panel session stale for {}, re-authenticating", path);
                self.logged_in.store(false, Ordering::SeqCst);
                retry = false;
                continue;
            }

            if status != StatusCode::OK && status != StatusCode::CREATED {
                return Err(XuiError::Status { path: path.to_string(), status: status.as_u16() });
            }

            let payload: Value = response
                .json()
                .await
                .map_err(|_| XuiError::InvalidResponse("non-JSON panel response".into()))?;

            if payload.get("success").and_then(Value::as_bool) == Some(false) {
                let msg = envelope_msg(&payload);
                if retry && msg.to_lowercase().contains("login") {
                    self.logged_in.store(false, Ordering::SeqCst);
                    retry = false;
                    continue;
                }
                let msg = if msg.is_empty() { "panel rejected request".to_string() } else { msg };
                return Err(XuiError::Api(msg));
            }

            return Ok(payload);
        }
    }
}

#[async_trait]
impl PanelApi for XuiClient {
    async fn list_inbounds(&self) -> Result<Vec<Inbound>, XuiError> {
        let payload = self
            .request_panel_json(Method::GET, "/panel/api/inbounds/list", None)
            .await?;
        let obj = payload
            .get("obj")
            .filter(|v| v.is_array())
            .cloned()
            .ok_or_else(|| XuiError::InvalidResponse("inbound list missing".into()))?;
        serde_json::from_value(obj)
            .map_err(|e| XuiError::InvalidResponse(format!("bad inbound list: {}", e)))
    }

    async fn add_clients(
        &self,
        inbound_id: i64,
        clients: &[ClientPayload],
    ) -> Result<(), XuiError> {
        if clients.is_empty() {
            return Ok(());
        }
        let settings = serde_json::json!({ "clients": clients }).to_string();
        let form = [("id", inbound_id.to_string()), ("settings", settings)];
        self.request_panel_json(Method::POST, "/panel/api/inbounds/addClient", Some(&form))
            .await?;
        Ok(())
    }

    async fn get_settings(&self) -> Result<PanelSettings, XuiError> {
        let payload = self
            .request_panel_json(Method::POST, "/panel/setting/all", Some(&[]))
            .await?;
        let obj = payload
            .get("obj")
            .and_then(Value::as_object)
            .ok_or_else(|| XuiError::InvalidResponse("panel settings missing".into()))?;

        let sub_path = obj
            .get("subPath")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("/sub/")
            .to_string();

        Ok(PanelSettings {
            sub_enable: obj.get("subEnable").and_then(Value::as_bool).unwrap_or(false),
            sub_uri: obj
                .get("subURI")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string(),
            sub_path,
            sub_port: loose_i64(obj.get("subPort")),
        })
    }

    async fn fetch_subscription(
        &self,
        settings: &PanelSettings,
        sub_id: &str,
    ) -> Result<String, XuiError> {
        let urls = subscription_candidate_urls(&self.base_url, settings, sub_id)?;
        let mut errors: Vec<String> = Vec::new();

        for url in &urls {
            let response = match self.http.get(url).send().await {
                Ok(r) => r,
                Err(e) => {
                    errors.push(format!("{} -> connect error: {}", url, e));
                    continue;
                }
            };
            if response.status() != StatusCode::OK {
                errors.push(format!("{} -> status {}", url, response.status()));
                continue;
            }
            let text = response.text().await.unwrap_or_default();
            let text = text.trim();
            if text.is_empty() || text == "Error!" {
                errors.push(format!("{} -> empty/error body", url));
                continue;
            }
            return Ok(text.to_string());
        }

        let details = if errors.is_empty() {
            "unknown subscription error".to_string()
        } else {
            errors.join(" | ")
        };
        Err(XuiError::Subscription(details))
    }
}

/// Production connector: one fresh session per allocation attempt.
#[derive(Debug, Clone)]
pub struct XuiConnector {
    verify_tls: bool,
    timeout: Duration,
}

impl XuiConnector {
    pub fn new(verify_tls: bool, timeout: Duration) -> Self {
        Self { verify_tls, timeout }
    }
}

#[async_trait]
impl PanelConnector for XuiConnector {
    type Api = XuiClient;

    async fn connect(&self, panel: &Panel, password: &str) -> Result<XuiClient, XuiError> {
        XuiClient::new(&panel.base_url, &panel.username, password, self.verify_tls, self.timeout)
    }
}

fn envelope_msg(payload: &Value) -> String {
    payload
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

fn loose_i64(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn normalize_base_url(value: &str) -> Result<String, XuiError> {
    let url = value.trim();
    if url.is_empty() {
        return Err(XuiError::BadUrl("empty panel URL".into()));
    }
    let url = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    };
    Ok(url.trim_end_matches('/').to_string())
}

fn netloc(url: &Url) -> Result<String, XuiError> {
    let host = url
        .host_str()
        .ok_or_else(|| XuiError::BadUrl("cannot resolve host for subscription URL".into()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn normalize_sub_path(path: &str) -> String {
    let path = if path.is_empty() { "/sub/" } else { path };
    let mut path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

fn build_subscription_url(
    base_url: &str,
    settings: &PanelSettings,
    sub_id: &str,
) -> Result<String, XuiError> {
    if !settings.sub_uri.is_empty() {
        if settings.sub_uri.starts_with("http://") || settings.sub_uri.starts_with("https://") {
            if settings.sub_uri.contains("{subid}") {
                return Ok(settings.sub_uri.replace("{subid}", sub_id));
            }
            return Ok(format!("{}/{}", settings.sub_uri.trim_end_matches('/'), sub_id));
        }

        // Relative template, resolved against the panel host.
        let parsed = Url::parse(base_url)
            .map_err(|_| XuiError::BadUrl(format!("unparseable panel URL: {}", base_url)))?;
        let scheme = parsed.scheme();
        let netloc = netloc(&parsed)?;
        let relative = if settings.sub_uri.starts_with('/') {
            settings.sub_uri.clone()
        } else {
            format!("/{}", settings.sub_uri)
        };
        if relative.contains("{subid}") {
            return Ok(format!("{}://{}{}", scheme, netloc, relative.replace("{subid}", sub_id)));
        }
        return Ok(format!(
            "{}://{}{}/{}",
            scheme,
            netloc,
            relative.trim_end_matches('/'),
            sub_id
        ));
    }

    let parsed = Url::parse(base_url)
        .map_err(|_| XuiError::BadUrl(format!("unparseable panel URL: {}", base_url)))?;
    let scheme = parsed.scheme();
    let host = parsed
        .host_str()
        .ok_or_else(|| XuiError::BadUrl("cannot resolve host for subscription URL".into()))?;

    let netloc = if settings.sub_port > 0 {
        format!("{}:{}", host, settings.sub_port)
    } else if let Some(port) = parsed.port() {
        format!("{}:{}", host, port)
    } else {
        host.to_string()
    };

    Ok(format!("{}://{}{}{}", scheme, netloc, normalize_sub_path(&settings.sub_path), sub_id))
}

fn subscription_candidate_urls(
    base_url: &str,
    settings: &PanelSettings,
    sub_id: &str,
) -> Result<Vec<String>, XuiError> {
    let mut urls = vec![build_subscription_url(base_url, settings, sub_id)?];

    // Fallback for installations that serve the subscription on the panel
    // port instead of the configured sub_port.
    if settings.sub_uri.is_empty() && settings.sub_port > 0 {
        if let Ok(parsed) = Url::parse(base_url) {
            if let (Some(host), Some(base_port)) = (parsed.host_str(), parsed.port()) {
                if i64::from(base_port) != settings.sub_port {
                    let fallback = format!(
                        "{}://{}:{}{}{}",
                        parsed.scheme(),
                        host,
                        base_port,
                        normalize_sub_path(&settings.sub_path),
                        sub_id
                    );
                    if !urls.contains(&fallback) {
                        urls.push(fallback);
                    }
                }
            }
        }
    }

    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(sub_uri: &str, sub_path: &str, sub_port: i64) -> PanelSettings {
        PanelSettings {
            sub_enable: true,
            sub_uri: sub_uri.to_string(),
            sub_path: sub_path.to_string(),
            sub_port,
        }
    }

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url("panel.example.com").unwrap(), "https://panel.example.com");
        assert_eq!(
            normalize_base_url("http://panel.example.com:2053/").unwrap(),
            "http://panel.example.com:2053"
        );
        assert!(normalize_base_url("  ").is_err());
    }

    #[test]
    fn absolute_sub_uri_with_template() {
        let url = build_subscription_url(
            "https://panel.example.com:2053",
            &settings("https://subs.example.com/s/{subid}", "/sub/", 0),
            "abc123",
        )
        .unwrap();
        assert_eq!(url, "https://subs.example.com/s/abc123");
    }

    #[test]
    fn absolute_sub_uri_without_template_appends_id() {
        let url = build_subscription_url(
            "https://panel.example.com:2053",
            &settings("https://subs.example.com/s/", "/sub/", 0),
            "abc123",
        )
        .unwrap();
        assert_eq!(url, "https://subs.example.com/s/abc123");
    }

    #[test]
    fn relative_sub_uri_resolves_against_panel_host() {
        let url = build_subscription_url(
            "https://panel.example.com:2053",
            &settings("links", "/sub/", 0),
            "abc123",
        )
        .unwrap();
        assert_eq!(url, "https://panel.example.com:2053/links/abc123");
    }

    #[test]
    fn sub_port_replaces_panel_port() {
        let url = build_subscription_url(
            "https://panel.example.com:2053",
            &settings("", "sub", 2096),
            "abc123",
        )
        .unwrap();
        assert_eq!(url, "https://panel.example.com:2096/sub/abc123");
    }

    #[test]
    fn falls_back_to_panel_port_when_sub_port_unset() {
        let url = build_subscription_url(
            "https://panel.example.com:2053",
            &settings("", "", 0),
            "abc123",
        )
        .unwrap();
        assert_eq!(url, "https://panel.example.com:2053/sub/abc123");
    }

    #[test]
    fn candidate_list_includes_panel_port_fallback() {
        let urls = subscription_candidate_urls(
            "https://panel.example.com:2053",
            &settings("", "/sub/", 2096),
            "abc123",
        )
        .unwrap();
        assert_eq!(
            urls,
            vec![
                "https://panel.example.com:2096/sub/abc123".to_string(),
                "https://panel.example.com:2053/sub/abc123".to_string(),
            ]
        );
    }

    #[test]
    fn loose_port_values() {
        assert_eq!(loose_i64(Some(&serde_json::json!(2096))), 2096);
        assert_eq!(loose_i64(Some(&serde_json::json!("2096"))), 2096);
        assert_eq!(loose_i64(Some(&serde_json::json!(null))), 0);
        assert_eq!(loose_i64(None), 0);
    }
}
