use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use rand::Rng;
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use bodega_db::models::panel::Panel;
use bodega_db::models::profile::ProfilePort;
use bodega_db::repositories::issued_repo::IssuedConfigRepository;
use bodega_db::repositories::panel_repo::PanelRepository;
use bodega_db::repositories::profile_repo::ProfileRepository;

use crate::services::crypto_service::CryptoService;
use crate::services::{link_builder, link_resolver};
use crate::xui::models::{ClientPayload, Inbound};
use crate::xui::{PanelApi, PanelConnector, XuiError};

/// Batch sizes the bot sells; anything else is rejected up front.
pub const ACCEPTED_QUANTITIES: [i64; 3] = [10, 50, 100];

/// Bound on burned name candidates per allocation call. The counter keeps
/// monotonic semantics; this only turns an endless collision loop into a
/// terminal error.
const MAX_BURNED_CANDIDATES: i64 = 10_000;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("configuration invalid: {0}")]
    Config(String),
    #[error("insufficient capacity: free={free}, requested={requested}")]
    Capacity { free: i64, requested: i64 },
    #[error("panel unreachable: {0}")]
    Panel(#[from] XuiError),
    #[error("no usable link could be resolved for `{0}`")]
    Link(String),
    #[error("configuration invalid: name space exhausted after {0} burned candidates")]
    NamesExhausted(i64),
    #[error("database failure: {0}")]
    Db(#[from] sqlx::Error),
    #[error("unexpected failure: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Per-port snapshot used for one allocation attempt. Always rebuilt from
/// live panel state, never cached across calls.
#[derive(Debug, Clone)]
pub struct PortRuntime {
    pub inbound_id: i64,
    pub port: i64,
    pub max_active_clients: i64,
    pub active_clients: i64,
    pub protocol: String,
}

#[derive(Debug)]
struct StagedClient {
    inbound_id: i64,
    config_name: String,
    sub_id: String,
    client: ClientPayload,
}

#[derive(Debug, Clone)]
pub struct AllocationResult {
    pub profile_name: String,
    pub quantity: i64,
    pub links: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PortCapacity {
    pub port: i64,
    pub inbound_id: i64,
    pub used: i64,
    pub max: i64,
    pub free: i64,
}

#[derive(Debug, Clone)]
pub struct CapacityReport {
    pub profile_name: String,
    pub total_capacity: i64,
    pub used: i64,
    pub free: i64,
    pub issued_total: i64,
    pub ports: Vec<PortCapacity>,
}

/// The transactional driver behind `allocate_and_create`. One mutex per
/// profile serializes concurrent requests for the same SKU while leaving
/// unrelated profiles fully parallel; lock handles are created lazily and
/// kept for the process lifetime.
#[derive(Clone)]
pub struct AllocatorService<C: PanelConnector + Clone> {
    pool: SqlitePool,
    profiles: ProfileRepository,
    panels: PanelRepository,
    crypto: CryptoService,
    connector: C,
    locks: Arc<StdMutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl<C: PanelConnector + Clone> AllocatorService<C> {
    pub fn new(pool: SqlitePool, crypto: CryptoService, connector: C) -> Self {
        Self {
            profiles: ProfileRepository::new(pool.clone()),
            panels: PanelRepository::new(pool.clone()),
            pool,
            crypto,
            connector,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn profile_lock(&self, profile_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("profile lock table poisoned");
        locks
            .entry(profile_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn allocate_and_create(
        &self,
        profile_id: i64,
        quantity: i64,
        chat_id: i64,
    ) -> Result<AllocationResult, AllocationError> {
        if !ACCEPTED_QUANTITIES.contains(&quantity) {
            return Err(AllocationError::Config(
                "quantity must be one of: 10, 50, 100".into(),
            ));
        }

        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock().await;
        self.allocate_locked(profile_id, quantity, chat_id).await
    }

    async fn allocate_locked(
        &self,
        profile_id: i64,
        quantity: i64,
        chat_id: i64,
    ) -> Result<AllocationResult, AllocationError> {
        let profile = self
            .profiles
            .get_by_id(profile_id)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| AllocationError::Config("profile is not available".into()))?;

        let panel = self
            .panels
            .get_by_id(profile.panel_id)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| AllocationError::Config("panel is not available".into()))?;

        let ports = self.profiles.list_ports(profile.id).await?;
        if ports.is_empty() {
            return Err(AllocationError::Config("profile has no ports configured".into()));
        }

        let password = self.crypto.decrypt(&panel.password_enc)?;
        let api = self.connector.connect(&panel, &password).await?;

        let inbounds = api.list_inbounds().await?;
        let port_runtimes = build_port_runtimes(&ports, &inbounds)?;

        let total_free: i64 = port_runtimes
            .iter()
            .map(|p| (p.max_active_clients - p.active_clients).max(0))
            .sum();
        if total_free < quantity {
            return Err(AllocationError::Capacity { free: total_free, requested: quantity });
        }

        let existing_emails = extract_existing_emails(&inbounds);

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO profile_counters(profile_id, last_number) VALUES(?, 0)")
            .bind(profile.id)
            .execute(&mut *tx)
            .await?;
        let mut last_number: i64 =
            sqlx::query_scalar("SELECT last_number FROM profile_counters WHERE profile_id = ?")
                .bind(profile.id)
                .fetch_one(&mut *tx)
                .await?;

        // Stage the whole batch in memory before touching the panel.
        let mut staged: Vec<StagedClient> = Vec::with_capacity(quantity as usize);
        let mut by_inbound: HashMap<i64, Vec<ClientPayload>> = HashMap::new();
        let mut local_used = vec![0i64; port_runtimes.len()];
        let mut names_in_batch: HashSet<String> = HashSet::new();
        let mut burned = 0i64;

        for _ in 0..quantity {
            let (config_name, consumed) = next_unique_name(
                &mut *tx,
                &profile.prefix,
                &profile.suffix,
                last_number,
                &existing_emails,
                &mut names_in_batch,
                &mut burned,
            )
            .await?;
            last_number = consumed;

            let selected = select_fill_first(&port_runtimes, &local_used).ok_or_else(|| {
                AllocationError::Config("capacity check failed during allocation".into())
            })?;
            local_used[selected] += 1;
            let runtime = &port_runtimes[selected];

            let client = build_client_payload(
                &runtime.protocol,
                &config_name,
                profile.traffic_gb,
                profile.expiry_days,
            )?;

            by_inbound.entry(runtime.inbound_id).or_default().push(client.clone());
            staged.push(StagedClient {
                inbound_id: runtime.inbound_id,
                config_name,
                sub_id: client.sub_id.clone(),
                client,
            });
        }

        // One remote call per inbound, not per client.
        for (inbound_id, clients) in &by_inbound {
            api.add_clients(*inbound_id, clients).await?;
        }

        let settings = api.get_settings().await?;
        let inbound_by_id: HashMap<i64, &Inbound> = inbounds.iter().map(|i| (i.id, i)).collect();

        let mut all_links: Vec<String> = Vec::with_capacity(staged.len());
        for alloc in &staged {
            let mut links: Vec<String> = Vec::new();

            if settings.sub_enable {
                match api.fetch_subscription(&settings, &alloc.sub_id).await {
                    Ok(raw) => match link_resolver::extract_links(&raw) {
                        Ok(found) => links = found,
                        Err(e) => {
                            warn!("Subscription for `{}` had no links: {}", alloc.config_name, e)
                        }
                    },
                    Err(e) => {
                        warn!("Subscription fetch for `{}` failed: {}", alloc.config_name, e)
                    }
                }
            }

            if links.is_empty() {
                if let Some(inbound) = inbound_by_id.get(&alloc.inbound_id) {
                    if let Some(link) = link_builder::build_direct_link(
                        inbound,
                        &alloc.client,
                        &alloc.config_name,
                        &panel.base_url,
                    ) {
                        links.push(link);
                    }
                }
            }

            if links.is_empty() {
                // Remote accounts already exist at this point; the local
                // transaction rolls back and the failure is surfaced as-is.
                return Err(AllocationError::Link(alloc.config_name.clone()));
            }
            all_links.extend(links);
        }

        let now = Utc::now().timestamp();
        for alloc in &staged {
            IssuedConfigRepository::insert(
                &mut *tx,
                profile.id,
                panel.id,
                alloc.inbound_id,
                chat_id,
                &alloc.config_name,
                &alloc.sub_id,
                now,
            )
            .await?;
        }

        sqlx::query("UPDATE profile_counters SET last_number = ? WHERE profile_id = ?")
            .bind(last_number)
            .bind(profile.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(
            "Issued {} configs for profile `{}` to chat {}",
            quantity, profile.name, chat_id
        );

        Ok(AllocationResult { profile_name: profile.name, quantity, links: all_links })
    }

    pub async fn get_capacity_report(&self, profile_id: i64) -> Result<CapacityReport, AllocationError> {
        let profile = self
            .profiles
            .get_by_id(profile_id)
            .await?
            .ok_or_else(|| AllocationError::Config("profile not found".into()))?;
        let panel = self
            .panels
            .get_by_id(profile.panel_id)
            .await?
            .ok_or_else(|| AllocationError::Config("panel not found for profile".into()))?;
        let ports = self.profiles.list_ports(profile.id).await?;
        if ports.is_empty() {
            return Err(AllocationError::Config("profile has no ports configured".into()));
        }

        let password = self.crypto.decrypt(&panel.password_enc)?;
        let api = self.connector.connect(&panel, &password).await?;
        let inbounds = api.list_inbounds().await?;
        let port_runtimes = build_port_runtimes(&ports, &inbounds)?;

        let total_capacity: i64 = port_runtimes.iter().map(|p| p.max_active_clients).sum();
        let used: i64 = port_runtimes.iter().map(|p| p.active_clients).sum();
        let issued_total = IssuedConfigRepository::count_for_profile(&self.pool, profile.id).await?;

        Ok(CapacityReport {
            profile_name: profile.name,
            total_capacity,
            used,
            free: total_capacity - used,
            issued_total,
            ports: port_runtimes
                .iter()
                .map(|p| PortCapacity {
                    port: p.port,
                    inbound_id: p.inbound_id,
                    used: p.active_clients,
                    max: p.max_active_clients,
                    free: (p.max_active_clients - p.active_clients).max(0),
                })
                .collect(),
        })
    }

    /// Connectivity check for the admin flow; returns the inbound count.
    pub async fn test_panel(&self, panel: &Panel) -> Result<usize, AllocationError> {
        let password = self.crypto.decrypt(&panel.password_enc)?;
        let api = self.connector.connect(panel, &password).await?;
        Ok(api.list_inbounds().await?.len())
    }

    /// Resolves requested `(port, max)` pairs against live panel inbounds at
    /// profile-creation time. Same matching rules as allocation: each port
    /// must map to exactly one inbound.
    pub async fn resolve_port_bindings(
        &self,
        panel: &Panel,
        requested: &[(i64, i64)],
    ) -> Result<Vec<(i64, i64, i64)>, AllocationError> {
        let password = self.crypto.decrypt(&panel.password_enc)?;
        let api = self.connector.connect(panel, &password).await?;
        let inbounds = api.list_inbounds().await?;

        let mut by_port: HashMap<i64, Vec<&Inbound>> = HashMap::new();
        for inbound in &inbounds {
            by_port.entry(inbound.port).or_default().push(inbound);
        }

        let mut bindings = Vec::with_capacity(requested.len());
        for (port, max_active) in requested {
            match by_port.get(port).map(Vec::as_slice) {
                Some([single]) => bindings.push((single.id, *port, *max_active)),
                Some([]) | None => {
                    return Err(AllocationError::Config(format!(
                        "inbound for port {} not found on panel",
                        port
                    )))
                }
                Some(_) => {
                    return Err(AllocationError::Config(format!(
                        "multiple inbounds found for port {}; use unique ports",
                        port
                    )))
                }
            }
        }
        Ok(bindings)
    }
}

/// Resolves each configured port to exactly one live inbound (stored inbound
/// id first, port number as fallback) and snapshots its occupancy.
fn build_port_runtimes(
    ports: &[ProfilePort],
    inbounds: &[Inbound],
) -> Result<Vec<PortRuntime>, AllocationError> {
    let by_id: HashMap<i64, &Inbound> = inbounds.iter().map(|i| (i.id, i)).collect();
    let mut by_port: HashMap<i64, Vec<&Inbound>> = HashMap::new();
    for inbound in inbounds {
        by_port.entry(inbound.port).or_default().push(inbound);
    }

    let mut runtimes = Vec::with_capacity(ports.len());
    for profile_port in ports {
        let inbound = match by_id.get(&profile_port.inbound_id) {
            Some(inbound) => *inbound,
            None => match by_port.get(&profile_port.port).map(Vec::as_slice) {
                Some([single]) => *single,
                Some([]) | None => {
                    return Err(AllocationError::Config(format!(
                        "inbound for port {} not found on panel",
                        profile_port.port
                    )))
                }
                Some(_) => {
                    return Err(AllocationError::Config(format!(
                        "multiple inbounds found for port {}; use unique ports",
                        profile_port.port
                    )))
                }
            },
        };

        let active_clients = inbound.client_stats.iter().filter(|s| s.is_active()).count() as i64;

        runtimes.push(PortRuntime {
            inbound_id: inbound.id,
            port: inbound.port,
            max_active_clients: profile_port.max_active_clients,
            active_clients,
            protocol: inbound.protocol.to_lowercase(),
        });
    }
    Ok(runtimes)
}

/// Fill-first placement: the first port with headroom (counting what this
/// batch already placed) absorbs the next unit.
fn select_fill_first(port_runtimes: &[PortRuntime], local_used: &[i64]) -> Option<usize> {
    port_runtimes
        .iter()
        .enumerate()
        .find(|(idx, runtime)| runtime.active_clients + local_used[*idx] < runtime.max_active_clients)
        .map(|(idx, _)| idx)
}

fn extract_existing_emails(inbounds: &[Inbound]) -> HashSet<String> {
    let mut result = HashSet::new();
    for inbound in inbounds {
        for stat in &inbound.client_stats {
            let email = stat.email.trim().to_lowercase();
            if !email.is_empty() {
                result.insert(email);
            }
        }
    }
    result
}

/// Finds the next display name that is free in all three identity spaces:
/// remote accounts, names claimed earlier in this batch, and the issuance
/// table. Every candidate consumes a number, accepted or not.
async fn next_unique_name(
    conn: &mut SqliteConnection,
    prefix: &str,
    suffix: &str,
    start_number: i64,
    existing_emails: &HashSet<String>,
    names_in_batch: &mut HashSet<String>,
    burned: &mut i64,
) -> Result<(String, i64), AllocationError> {
    let mut number = start_number;
    loop {
        number += 1;
        *burned += 1;
        if *burned > MAX_BURNED_CANDIDATES {
            return Err(AllocationError::NamesExhausted(MAX_BURNED_CANDIDATES));
        }

        let name = format!("{}{}{}", prefix, number, suffix);
        let lowered = name.to_lowercase();
        if existing_emails.contains(&lowered) || names_in_batch.contains(&lowered) {
            continue;
        }
        if IssuedConfigRepository::exists_config_name(&mut *conn, &name).await? {
            continue;
        }

        names_in_batch.insert(lowered);
        return Ok((name, number));
    }
}

/// Pure credential synthesis for one client.
fn build_client_payload(
    protocol: &str,
    email: &str,
    traffic_gb: i64,
    expiry_days: i64,
) -> Result<ClientPayload, AllocationError> {
    let now_ms = Utc::now().timestamp_millis();
    let expiry_time = if expiry_days <= 0 { 0 } else { now_ms + expiry_days * 24 * 60 * 60 * 1000 };

    let mut payload = ClientPayload {
        email: email.to_string(),
        limit_ip: 0,
        total_gb: traffic_gb * 1024 * 1024 * 1024,
        expiry_time,
        enable: true,
        sub_id: random_sub_id(),
        comment: String::new(),
        tg_id: 0,
        id: None,
        security: None,
        flow: None,
        password: None,
    };

    match protocol {
        "trojan" => payload.password = Some(Uuid::new_v4().simple().to_string()),
        "shadowsocks" => {
            payload.password = Some(URL_SAFE_NO_PAD.encode(rand::random::<[u8; 16]>()))
        }
        "vmess" | "vless" => {
            payload.id = Some(Uuid::new_v4().to_string());
            payload.security = Some("auto".to_string());
            payload.flow = Some(String::new());
        }
        other => {
            return Err(AllocationError::Config(format!(
                "unsupported inbound protocol for client creation: {}",
                other
            )))
        }
    }

    Ok(payload)
}

fn random_sub_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..16)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xui::models::{ClientStat, PanelSettings};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    // ------------------------------------------------------------------
    // Scripted panel double
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct PanelState {
        inbounds: Vec<Inbound>,
        added: Vec<(i64, usize)>,
        settings: PanelSettings,
        subscription_body: Option<String>,
    }

    #[derive(Clone)]
    struct ScriptedPanel {
        state: Arc<StdMutex<PanelState>>,
        gate: Option<Arc<tokio::sync::Barrier>>,
    }

    impl ScriptedPanel {
        fn new(inbounds: Vec<Inbound>) -> Self {
            Self {
                state: Arc::new(StdMutex::new(PanelState { inbounds, ..Default::default() })),
                gate: None,
            }
        }

        fn with_subscription(self, body: &str) -> Self {
            {
                let mut state = self.state.lock().unwrap();
                state.settings.sub_enable = true;
                state.subscription_body = Some(body.to_string());
            }
            self
        }

        fn added(&self) -> Vec<(i64, usize)> {
            self.state.lock().unwrap().added.clone()
        }
    }

    #[async_trait]
    impl PanelApi for ScriptedPanel {
        async fn list_inbounds(&self) -> Result<Vec<Inbound>, XuiError> {
            if let Some(gate) = &self.gate {
                gate.wait().await;
            }
            Ok(self.state.lock().unwrap().inbounds.clone())
        }

        async fn add_clients(
            &self,
            inbound_id: i64,
            clients: &[ClientPayload],
        ) -> Result<(), XuiError> {
            let mut state = self.state.lock().unwrap();
            state.added.push((inbound_id, clients.len()));
            let stats: Vec<ClientStat> = clients
                .iter()
                .map(|c| ClientStat { email: c.email.clone(), enable: Some(true) })
                .collect();
            if let Some(inbound) = state.inbounds.iter_mut().find(|i| i.id == inbound_id) {
                inbound.client_stats.extend(stats);
            }
            Ok(())
        }

        async fn get_settings(&self) -> Result<PanelSettings, XuiError> {
            Ok(self.state.lock().unwrap().settings.clone())
        }

        async fn fetch_subscription(
            &self,
            _settings: &PanelSettings,
            _sub_id: &str,
        ) -> Result<String, XuiError> {
            match self.state.lock().unwrap().subscription_body.clone() {
                Some(body) => Ok(body),
                None => Err(XuiError::Subscription("scripted failure".into())),
            }
        }
    }

    #[derive(Clone)]
    struct ScriptedConnector {
        panels: Arc<StdMutex<HashMap<String, ScriptedPanel>>>,
    }

    #[async_trait]
    impl PanelConnector for ScriptedConnector {
        type Api = ScriptedPanel;

        async fn connect(&self, panel: &Panel, _password: &str) -> Result<ScriptedPanel, XuiError> {
            self.panels
                .lock()
                .unwrap()
                .get(&panel.name)
                .cloned()
                .ok_or_else(|| XuiError::Login("unknown scripted panel".into()))
        }
    }

    // ------------------------------------------------------------------
    // Fixtures
    // ------------------------------------------------------------------

    fn tls_inbound(id: i64, port: i64, protocol: &str, active: &[&str]) -> Inbound {
        Inbound {
            id,
            port,
            protocol: protocol.to_string(),
            settings: Value::String("{}".into()),
            stream_settings: Value::String(
                json!({
                    "network": "tcp",
                    "security": "tls",
                    "tlsSettings": {"serverName": "cdn.example.com"}
                })
                .to_string(),
            ),
            client_stats: active
                .iter()
                .map(|email| ClientStat { email: email.to_string(), enable: Some(true) })
                .collect(),
        }
    }

    struct TestEnv {
        pool: SqlitePool,
        allocator: AllocatorService<ScriptedConnector>,
        profiles: ProfileRepository,
        panel_map: Arc<StdMutex<HashMap<String, ScriptedPanel>>>,
    }

    async fn env() -> TestEnv {
        let pool = bodega_db::connect("sqlite::memory:").await.unwrap();
        let panel_map = Arc::new(StdMutex::new(HashMap::new()));
        let allocator = AllocatorService::new(
            pool.clone(),
            CryptoService::new("test-secret"),
            ScriptedConnector { panels: panel_map.clone() },
        );
        TestEnv {
            profiles: ProfileRepository::new(pool.clone()),
            pool,
            allocator,
            panel_map,
        }
    }

    async fn seed_panel(env: &TestEnv, name: &str, base_url: &str, scripted: ScriptedPanel) -> i64 {
        let crypto = CryptoService::new("test-secret");
        let repo = PanelRepository::new(env.pool.clone());
        repo.upsert(name, base_url, "admin", &crypto.encrypt("pw").unwrap())
            .await
            .unwrap();
        env.panel_map.lock().unwrap().insert(name.to_string(), scripted);
        repo.get_by_name(name).await.unwrap().unwrap().id
    }

    async fn issued_names(pool: &SqlitePool, profile_id: i64) -> Vec<String> {
        sqlx::query_scalar("SELECT config_name FROM issued_configs WHERE profile_id = ? ORDER BY id")
            .bind(profile_id)
            .fetch_all(pool)
            .await
            .unwrap()
    }

    async fn last_number(pool: &SqlitePool, profile_id: i64) -> i64 {
        sqlx::query_scalar("SELECT last_number FROM profile_counters WHERE profile_id = ?")
            .bind(profile_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    // ------------------------------------------------------------------
    // Pure helpers
    // ------------------------------------------------------------------

    #[test]
    fn fill_first_scans_in_order() {
        let runtimes = vec![
            PortRuntime { inbound_id: 1, port: 1044, max_active_clients: 2, active_clients: 2, protocol: "vless".into() },
            PortRuntime { inbound_id: 2, port: 1025, max_active_clients: 3, active_clients: 1, protocol: "vless".into() },
        ];
        assert_eq!(select_fill_first(&runtimes, &[0, 0]), Some(1));
        assert_eq!(select_fill_first(&runtimes, &[0, 2]), None);
    }

    #[test]
    fn runtime_resolution_falls_back_to_port_match() {
        let ports = vec![ProfilePort {
            id: 1,
            profile_id: 1,
            inbound_id: 99, // stale
            port: 1044,
            max_active_clients: 10,
            sort_order: 0,
        }];
        let inbounds = vec![tls_inbound(5, 1044, "vless", &["a", "b"])];

        let runtimes = build_port_runtimes(&ports, &inbounds).unwrap();
        assert_eq!(runtimes[0].inbound_id, 5);
        assert_eq!(runtimes[0].active_clients, 2);
    }

    #[test]
    fn runtime_resolution_rejects_missing_and_ambiguous_ports() {
        let ports = vec![ProfilePort {
            id: 1,
            profile_id: 1,
            inbound_id: 99,
            port: 1044,
            max_active_clients: 10,
            sort_order: 0,
        }];

        let err = build_port_runtimes(&ports, &[]).unwrap_err();
        assert!(err.to_string().contains("not found on panel"));

        let twins = vec![tls_inbound(1, 1044, "vless", &[]), tls_inbound(2, 1044, "vless", &[])];
        let err = build_port_runtimes(&ports, &twins).unwrap_err();
        assert!(err.to_string().contains("multiple inbounds"));
    }

    #[test]
    fn disabled_stats_do_not_occupy_slots() {
        let mut inbound = tls_inbound(5, 1044, "vless", &["a", "b"]);
        inbound.client_stats.push(ClientStat { email: "c".into(), enable: Some(false) });
        inbound.client_stats.push(ClientStat { email: "d".into(), enable: None });
        let ports = vec![ProfilePort {
            id: 1,
            profile_id: 1,
            inbound_id: 5,
            port: 1044,
            max_active_clients: 10,
            sort_order: 0,
        }];
        let runtimes = build_port_runtimes(&ports, &[inbound]).unwrap();
        // a, b and the absent-enable entry count; the explicit false does not.
        assert_eq!(runtimes[0].active_clients, 3);
    }

    #[test]
    fn email_extraction_lowercases_and_skips_blanks() {
        let mut inbound = tls_inbound(5, 1044, "vless", &["Alpha", ""]);
        inbound.client_stats.push(ClientStat { email: "  Beta  ".into(), enable: Some(false) });
        let emails = extract_existing_emails(&[inbound]);
        assert!(emails.contains("alpha"));
        assert!(emails.contains("beta"));
        assert_eq!(emails.len(), 2);
    }

    #[test]
    fn payload_synthesis_per_protocol() {
        let vless = build_client_payload("vless", "10h1", 30, 10).unwrap();
        assert!(vless.id.is_some());
        assert_eq!(vless.security.as_deref(), Some("auto"));
        assert_eq!(vless.flow.as_deref(), Some(""));
        assert!(vless.password.is_none());
        assert_eq!(vless.total_gb, 30 * 1024 * 1024 * 1024);
        assert!(vless.expiry_time > Utc::now().timestamp_millis());
        assert_eq!(vless.sub_id.len(), 16);
        assert!(vless.sub_id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

        let trojan = build_client_payload("trojan", "10h2", 30, 0).unwrap();
        let password = trojan.password.unwrap();
        assert_eq!(password.len(), 32);
        assert!(password.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(trojan.expiry_time, 0);
        assert!(trojan.id.is_none());

        let ss = build_client_payload("shadowsocks", "10h3", 30, 10).unwrap();
        assert_eq!(ss.password.unwrap().len(), 22); // 16 bytes, unpadded base64

        let err = build_client_payload("wireguard", "10h4", 30, 10).unwrap_err();
        assert!(matches!(err, AllocationError::Config(_)));
        assert!(err.to_string().contains("unsupported"));
    }

    // ------------------------------------------------------------------
    // Orchestration
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn rejects_unlisted_quantities() {
        let env = env().await;
        let err = env.allocator.allocate_and_create(1, 7, 42).await.unwrap_err();
        assert!(matches!(err, AllocationError::Config(_)));
        assert!(err.to_string().contains("10, 50, 100"));
    }

    #[tokio::test]
    async fn rejects_insufficient_capacity_before_remote_writes() {
        let env = env().await;
        let scripted = ScriptedPanel::new(vec![tls_inbound(5, 1044, "vless", &[])]);
        let panel_id = seed_panel(&env, "main", "https://panel.example.com:2053", scripted.clone()).await;
        let profile_id = env
            .profiles
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 2)])
            .await
            .unwrap();

        let err = env.allocator.allocate_and_create(profile_id, 10, 42).await.unwrap_err();
        assert!(matches!(err, AllocationError::Capacity { free: 2, requested: 10 }));
        assert!(err.to_string().contains("free=2"));
        assert!(scripted.added().is_empty());
        assert!(issued_names(&env.pool, profile_id).await.is_empty());
    }

    #[tokio::test]
    async fn fill_first_spreads_batch_with_one_call_per_inbound() {
        let env = env().await;
        let scripted = ScriptedPanel::new(vec![
            tls_inbound(5, 1044, "vless", &[]),
            tls_inbound(6, 1025, "vless", &[]),
        ]);
        let panel_id = seed_panel(&env, "main", "https://panel.example.com:2053", scripted.clone()).await;
        let profile_id = env
            .profiles
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 5), (6, 1025, 5)])
            .await
            .unwrap();

        let result = env.allocator.allocate_and_create(profile_id, 10, 42).await.unwrap();
        assert_eq!(result.quantity, 10);
        assert_eq!(result.links.len(), 10);
        assert!(result.links.iter().all(|l| l.starts_with("vless://")));

        // Two remote calls, five clients each.
        let mut added = scripted.added();
        added.sort();
        assert_eq!(added, vec![(5, 5), (6, 5)]);

        let names = issued_names(&env.pool, profile_id).await;
        assert_eq!(names.len(), 10);
        let distinct: HashSet<&String> = names.iter().collect();
        assert_eq!(distinct.len(), 10);
        assert_eq!(names[0], "10h1");
        assert_eq!(names[9], "10h10");
        assert_eq!(last_number(&env.pool, profile_id).await, 10);
    }

    #[tokio::test]
    async fn collisions_burn_numbers_without_reuse() {
        let env = env().await;
        // `10h2` already lives on the panel; `10h1` is already issued locally.
        let scripted = ScriptedPanel::new(vec![tls_inbound(5, 1044, "vless", &["10h2"])]);
        let panel_id = seed_panel(&env, "main", "https://panel.example.com:2053", scripted).await;
        let profile_id = env
            .profiles
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 50)])
            .await
            .unwrap();
        IssuedConfigRepository::insert(&env.pool, profile_id, panel_id, 5, 7, "10h1", "x", 0)
            .await
            .unwrap();

        let result = env.allocator.allocate_and_create(profile_id, 10, 42).await.unwrap();
        assert_eq!(result.links.len(), 10);

        let names = issued_names(&env.pool, profile_id).await;
        // The pre-issued row plus the new batch, which skipped 1 and 2.
        assert_eq!(names[0], "10h1");
        assert_eq!(names[1], "10h3");
        assert_eq!(names[10], "10h12");
        // Both rejected candidates consumed their numbers.
        assert_eq!(last_number(&env.pool, profile_id).await, 12);
    }

    #[tokio::test]
    async fn same_profile_requests_serialize_and_never_oversell() {
        let env = env().await;
        let scripted = ScriptedPanel::new(vec![tls_inbound(5, 1044, "vless", &[])]);
        let panel_id = seed_panel(&env, "main", "https://panel.example.com:2053", scripted.clone()).await;
        let profile_id = env
            .profiles
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 10)])
            .await
            .unwrap();

        let a = env.allocator.clone();
        let b = env.allocator.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.allocate_and_create(profile_id, 10, 1).await }),
            tokio::spawn(async move { b.allocate_and_create(profile_id, 10, 2).await }),
        );
        let results = [first.unwrap(), second.unwrap()];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1, "exactly one of two competing requests may win the last slots");
        let err = results.iter().find(|r| r.is_err()).unwrap().as_ref().unwrap_err();
        assert!(matches!(err, AllocationError::Capacity { free: 0, requested: 10 }));

        // Panel-side occupancy never exceeds the ceiling.
        let total_added: usize = scripted.added().iter().map(|(_, n)| n).sum();
        assert_eq!(total_added, 10);
        assert_eq!(issued_names(&env.pool, profile_id).await.len(), 10);
    }

    #[tokio::test]
    async fn different_profiles_do_not_block_each_other() {
        let env = env().await;
        let gate = Arc::new(tokio::sync::Barrier::new(2));

        let mut one = ScriptedPanel::new(vec![tls_inbound(5, 1044, "vless", &[])]);
        one.gate = Some(gate.clone());
        let mut two = ScriptedPanel::new(vec![tls_inbound(8, 2052, "vless", &[])]);
        two.gate = Some(gate.clone());

        let panel_one = seed_panel(&env, "p1", "https://one.example.com:2053", one).await;
        let panel_two = seed_panel(&env, "p2", "https://two.example.com:2053", two).await;
        let profile_one = env
            .profiles
            .create(panel_one, "10h", "10h", "", 30, 10, &[(5, 1044, 20)])
            .await
            .unwrap();
        let profile_two = env
            .profiles
            .create(panel_two, "20h", "20h", "", 60, 10, &[(8, 2052, 20)])
            .await
            .unwrap();

        // Each allocation parks at the shared barrier inside list_inbounds;
        // the pair only completes if the two profiles really run in parallel.
        let a = env.allocator.clone();
        let b = env.allocator.clone();
        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                tokio::spawn(async move { a.allocate_and_create(profile_one, 10, 1).await }),
                tokio::spawn(async move { b.allocate_and_create(profile_two, 10, 2).await }),
            )
        })
        .await
        .expect("cross-profile allocations must not serialize");

        assert!(joined.0.unwrap().is_ok());
        assert!(joined.1.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unsupported_protocol_is_a_configuration_error() {
        let env = env().await;
        let scripted = ScriptedPanel::new(vec![tls_inbound(5, 1044, "wireguard", &[])]);
        let panel_id = seed_panel(&env, "main", "https://panel.example.com:2053", scripted).await;
        let profile_id = env
            .profiles
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 20)])
            .await
            .unwrap();

        let err = env.allocator.allocate_and_create(profile_id, 10, 42).await.unwrap_err();
        assert!(matches!(err, AllocationError::Config(_)));
        assert!(err.to_string().contains("unsupported"));
        assert!(issued_names(&env.pool, profile_id).await.is_empty());
    }

    #[tokio::test]
    async fn ambiguous_port_is_a_configuration_error() {
        let env = env().await;
        let scripted = ScriptedPanel::new(vec![
            tls_inbound(1, 1044, "vless", &[]),
            tls_inbound(2, 1044, "vless", &[]),
        ]);
        let panel_id = seed_panel(&env, "main", "https://panel.example.com:2053", scripted).await;
        // Stale inbound id forces the port-number fallback, which is ambiguous.
        let profile_id = env
            .profiles
            .create(panel_id, "10h", "10h", "", 30, 10, &[(99, 1044, 20)])
            .await
            .unwrap();

        let err = env.allocator.allocate_and_create(profile_id, 10, 42).await.unwrap_err();
        assert!(err.to_string().contains("multiple inbounds"));
    }

    #[tokio::test]
    async fn empty_subscription_body_falls_back_to_direct_links() {
        let env = env().await;
        let scripted =
            ScriptedPanel::new(vec![tls_inbound(5, 1044, "vless", &[])]).with_subscription("");
        let panel_id = seed_panel(&env, "main", "https://panel.example.com:2053", scripted).await;
        let profile_id = env
            .profiles
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 20)])
            .await
            .unwrap();

        let result = env.allocator.allocate_and_create(profile_id, 10, 42).await.unwrap();
        assert_eq!(result.links.len(), 10);
        assert!(result.links.iter().all(|l| l.starts_with("vless://") && l.contains("sni=cdn.example.com")));
    }

    #[tokio::test]
    async fn panel_subscription_links_win_when_available() {
        let env = env().await;
        let scripted = ScriptedPanel::new(vec![tls_inbound(5, 1044, "vless", &[])])
            .with_subscription("vless://from-panel@host:443#cfg");
        let panel_id = seed_panel(&env, "main", "https://panel.example.com:2053", scripted).await;
        let profile_id = env
            .profiles
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 20)])
            .await
            .unwrap();

        let result = env.allocator.allocate_and_create(profile_id, 10, 42).await.unwrap();
        assert_eq!(result.links.len(), 10);
        assert!(result.links.iter().all(|l| l == "vless://from-panel@host:443#cfg"));
    }

    #[tokio::test]
    async fn unresolvable_links_fail_the_batch_and_roll_back() {
        let env = env().await;
        // Inbound port 0 and a panel URL without a port: the fallback builder
        // cannot produce a link and subscriptions are disabled.
        let scripted = ScriptedPanel::new(vec![tls_inbound(5, 0, "vless", &[])]);
        let panel_id = seed_panel(&env, "main", "https://panel.example.com", scripted.clone()).await;
        let profile_id = env
            .profiles
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 0, 20)])
            .await
            .unwrap();

        let err = env.allocator.allocate_and_create(profile_id, 10, 42).await.unwrap_err();
        assert!(matches!(err, AllocationError::Link(_)));

        // Remote accounts were created before the failure surfaced, but the
        // local transaction rolled back whole.
        assert_eq!(scripted.added().iter().map(|(_, n)| n).sum::<usize>(), 10);
        assert!(issued_names(&env.pool, profile_id).await.is_empty());
        assert_eq!(last_number(&env.pool, profile_id).await, 0);
    }

    #[tokio::test]
    async fn inactive_profile_and_panel_are_rejected() {
        let env = env().await;
        let scripted = ScriptedPanel::new(vec![tls_inbound(5, 1044, "vless", &[])]);
        let panel_id = seed_panel(&env, "main", "https://panel.example.com:2053", scripted).await;
        let profile_id = env
            .profiles
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 20)])
            .await
            .unwrap();

        env.profiles.set_active(profile_id, false).await.unwrap();
        let err = env.allocator.allocate_and_create(profile_id, 10, 42).await.unwrap_err();
        assert!(err.to_string().contains("profile is not available"));

        env.profiles.set_active(profile_id, true).await.unwrap();
        PanelRepository::new(env.pool.clone()).set_active(panel_id, false).await.unwrap();
        let err = env.allocator.allocate_and_create(profile_id, 10, 42).await.unwrap_err();
        assert!(err.to_string().contains("panel is not available"));
    }

    #[tokio::test]
    async fn capacity_report_reflects_panel_state() {
        let env = env().await;
        let scripted = ScriptedPanel::new(vec![
            tls_inbound(5, 1044, "vless", &["a", "b"]),
            tls_inbound(6, 1025, "vless", &[]),
        ]);
        let panel_id = seed_panel(&env, "main", "https://panel.example.com:2053", scripted).await;
        let profile_id = env
            .profiles
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 5), (6, 1025, 5)])
            .await
            .unwrap();

        let report = env.allocator.get_capacity_report(profile_id).await.unwrap();
        assert_eq!(report.profile_name, "10h");
        assert_eq!(report.total_capacity, 10);
        assert_eq!(report.used, 2);
        assert_eq!(report.free, 8);
        assert_eq!(report.issued_total, 0);
        assert_eq!(report.ports.len(), 2);
        assert_eq!(report.ports[0].free, 3);
        assert_eq!(report.ports[1].free, 5);
    }

    #[tokio::test]
    async fn port_bindings_resolve_against_live_inbounds() {
        let env = env().await;
        let scripted = ScriptedPanel::new(vec![
            tls_inbound(5, 1044, "vless", &[]),
            tls_inbound(6, 1025, "vless", &[]),
        ]);
        seed_panel(&env, "main", "https://panel.example.com:2053", scripted).await;
        let panel = PanelRepository::new(env.pool.clone())
            .get_by_name("main")
            .await
            .unwrap()
            .unwrap();

        let bindings = env
            .allocator
            .resolve_port_bindings(&panel, &[(1044, 1000), (1025, 500)])
            .await
            .unwrap();
        assert_eq!(bindings, vec![(5, 1044, 1000), (6, 1025, 500)]);

        let err = env
            .allocator
            .resolve_port_bindings(&panel, &[(9999, 10)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found on panel"));
    }
}
