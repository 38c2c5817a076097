use std::{
    env,
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{net::UdpSocket, sync::Mutex, task::JoinHandle, time};
use tracing::{debug, error, info, warn};

use crate::config_store::{
    ConfigStore, ConfigStoreExt, DEFAULT_SERVER_PORT, HEARTBEAT_INTERVAL, LAST_HOSTNAME,
    PHONE_HOME_RETRY_COUNT, PHONE_HOME_TIMEOUT, PHONE_HOME_URL, SERVER_PORT,
};

const TRANSPORT_TAG: &str = "http";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum PhoneHomeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("failed to encode payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid receiver configuration: {0}")]
    Config(String),
}

/// Outbound leg to the fleet receiver. Returns the HTTP status of the reply.
#[async_trait]
pub trait FleetTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<u16, PhoneHomeError>;
}

pub struct HttpFleetTransport {
    client: reqwest::Client,
}

impl HttpFleetTransport {
    pub fn new() -> Result<Self, PhoneHomeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("host-admin-mcp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| PhoneHomeError::Config(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FleetTransport for HttpFleetTransport {
    async fn post_json(
        &self,
        url: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<u16, PhoneHomeError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| PhoneHomeError::Network(err.to_string()))?;
        Ok(response.status().as_u16())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    pub primary: String,
    pub all: Vec<String>,
}

#[async_trait]
pub trait HostInfo: Send + Sync {
    fn hostname(&self) -> String;

    async fn network(&self, hostname: &str) -> NetworkInfo;
}

pub struct SystemHost;

#[async_trait]
impl HostInfo for SystemHost {
    fn hostname(&self) -> String {
        hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string())
    }

    async fn network(&self, hostname: &str) -> NetworkInfo {
        let mut all = Vec::new();
        let primary = match primary_address().await {
            Some(ip) => {
                all.push(ip.to_string());
                ip.to_string()
            }
            None => Ipv4Addr::LOCALHOST.to_string(),
        };

        if let Ok(resolved) = tokio::net::lookup_host((hostname, 0)).await {
            for addr in resolved.filter(|addr| addr.is_ipv4()) {
                let ip = addr.ip().to_string();
                if !all.contains(&ip) {
                    all.push(ip);
                }
            }
        }

        NetworkInfo { primary, all }
    }
}

/// Address of the interface that routes to the public internet. Connecting a
/// UDP socket sends nothing.
async fn primary_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect(("8.8.8.8", 80)).await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub tenant: String,
    pub platform_version: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ServerPayload {
    server_id: String,
    hostname: String,
    ip_addresses: NetworkInfo,
    port: u16,
    transport: &'static str,
    version: &'static str,
    platform_version: String,
    database: String,
    capabilities: Vec<String>,
    deployment_stage: String,
    #[serde(flatten)]
    kind: PayloadKind,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum PayloadKind {
    Registration {
        started_at: String,
    },
    Heartbeat {
        status: &'static str,
        timestamp: String,
        uptime_seconds: f64,
    },
}

/// Self-registration and liveness reporting towards the fleet receiver.
///
/// `register` and `heartbeat` never fail past their own boundary: every error
/// is logged and folded into a `false` result. Re-registration on hostname
/// drift runs under a single-flight guard so concurrent triggers collapse into
/// one registration per new hostname.
pub struct PhoneHome {
    params: Arc<dyn ConfigStore>,
    identity: ServerIdentity,
    transport: Arc<dyn FleetTransport>,
    host: Arc<dyn HostInfo>,
    started: Instant,
    reregister: Mutex<()>,
}

impl PhoneHome {
    pub fn new(
        params: Arc<dyn ConfigStore>,
        identity: ServerIdentity,
        transport: Arc<dyn FleetTransport>,
        host: Arc<dyn HostInfo>,
    ) -> Self {
        Self {
            params,
            identity,
            transport,
            host,
            started: Instant::now(),
            reregister: Mutex::new(()),
        }
    }

    pub fn hostname(&self) -> String {
        self.host.hostname()
    }

    pub fn server_id(&self, hostname: &str) -> String {
        format!("{}_{}", self.identity.tenant, hostname)
    }

    pub fn receiver_url(&self) -> Option<String> {
        self.params.get_string(PHONE_HOME_URL)
    }

    pub async fn register(&self) -> bool {
        let Some(base) = self.receiver_url() else {
            info!("Phone-home disabled (no receiver URL configured)");
            return false;
        };

        let registration = PayloadKind::Registration {
            started_at: utc_timestamp(),
        };
        let (url, payload) = match self.prepare(&base, "register", registration).await {
            Ok(prepared) => prepared,
            Err(err) => {
                error!("Phone-home registration aborted: {err}");
                return false;
            }
        };

        let server_id = payload["server_id"].as_str().unwrap_or_default().to_string();
        let attempts = self.params.get_u64(PHONE_HOME_RETRY_COUNT, 3);
        let timeout = self.params.get_seconds(PHONE_HOME_TIMEOUT, 5);

        for attempt in 0..attempts {
            match self.transport.post_json(&url, &payload, timeout).await {
                Ok(200 | 201) => {
                    info!(
                        server_id = %server_id,
                        primary = %payload["ip_addresses"]["primary"].as_str().unwrap_or_default(),
                        port = %payload["port"],
                        "Registered with fleet receiver"
                    );
                    return true;
                }
                Ok(status) => {
                    warn!(attempt = attempt + 1, status, "Phone-home registration rejected");
                }
                Err(err) => {
                    warn!(attempt = attempt + 1, "Phone-home registration attempt failed: {err}");
                }
            }

            if attempt + 1 < attempts {
                let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
                time::sleep(Duration::from_secs(2u64.saturating_pow(exponent))).await;
            }
        }

        error!(server_id = %server_id, attempts, "Phone-home registration failed after all retries");
        false
    }

    pub async fn heartbeat(&self) -> bool {
        let Some(base) = self.receiver_url() else {
            return false;
        };

        let beat = PayloadKind::Heartbeat {
            status: "healthy",
            timestamp: utc_timestamp(),
            uptime_seconds: self.started.elapsed().as_secs_f64(),
        };
        let (url, payload) = match self.prepare(&base, "heartbeat", beat).await {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!("Heartbeat aborted: {err}");
                return false;
            }
        };

        let timeout = self.params.get_seconds(PHONE_HOME_TIMEOUT, 5);
        match self.transport.post_json(&url, &payload, timeout).await {
            Ok(status) if (200..300).contains(&status) => {
                debug!("Heartbeat sent");
                true
            }
            Ok(status) => {
                warn!(status, "Heartbeat rejected");
                false
            }
            Err(err) => {
                warn!("Heartbeat failed: {err}");
                false
            }
        }
    }

    /// Scheduled path: on hostname drift, register first, then persist the new
    /// hostname, then send the heartbeat.
    pub async fn heartbeat_tick(&self) -> bool {
        let current = self.host.hostname();
        if self.hostname_changed(&current) {
            let _flight = self.reregister.lock().await;
            if self.hostname_changed(&current) {
                info!(
                    previous = %self.last_hostname(),
                    current = %current,
                    "Hostname changed, registering before heartbeat"
                );
                self.register().await;
                self.remember_hostname(&current);
            }
        }

        self.heartbeat().await
    }

    /// Health-check path: never blocks the caller. When the hostname drifted, a
    /// detached task registers and then persists the new hostname.
    pub fn check_hostname_drift(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let current = self.host.hostname();
        if !self.hostname_changed(&current) {
            return None;
        }

        info!(
            previous = %self.last_hostname(),
            current = %current,
            "Hostname changed, scheduling background registration"
        );
        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _flight = engine.reregister.lock().await;
            if !engine.hostname_changed(&current) {
                debug!("Re-registration already handled for {current}");
                return;
            }
            if !engine.register().await {
                warn!("Background registration did not reach the fleet receiver");
            }
            engine.remember_hostname(&current);
        }))
    }

    /// Install-time registration, run once at process start.
    pub fn spawn_install_registration(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let url = self.receiver_url()?;
        info!(receiver = %url, "Phone-home receiver configured");

        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _flight = engine.reregister.lock().await;
            let current = engine.host.hostname();
            if engine.register().await {
                info!("Install registration completed");
            } else {
                warn!("Install registration failed");
            }
            engine.remember_hostname(&current);
        }))
    }

    /// One loop owns every scheduled tick, so ticks never overlap.
    pub fn spawn_heartbeat_scheduler(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let period = self
                    .params
                    .get_seconds(HEARTBEAT_INTERVAL, 60)
                    .max(Duration::from_secs(1));
                time::sleep(period).await;

                if self.receiver_url().is_none() {
                    continue;
                }
                if self.heartbeat_tick().await {
                    debug!("Scheduled heartbeat completed");
                }
            }
        })
    }

    fn last_hostname(&self) -> String {
        self.params.get_string(LAST_HOSTNAME).unwrap_or_default()
    }

    fn hostname_changed(&self, current: &str) -> bool {
        self.last_hostname() != current
    }

    fn remember_hostname(&self, hostname: &str) {
        if let Err(err) = self.params.set_param(LAST_HOSTNAME, hostname) {
            warn!("Failed to persist last hostname: {err:#}");
        }
    }

    async fn prepare(
        &self,
        base: &str,
        path: &str,
        kind: PayloadKind,
    ) -> Result<(String, Value), PhoneHomeError> {
        let url = endpoint(base, path)?;
        let payload = serde_json::to_value(self.build_payload(kind).await)?;
        Ok((url, payload))
    }

    async fn build_payload(&self, kind: PayloadKind) -> ServerPayload {
        let hostname = self.host.hostname();
        let ip_addresses = self.host.network(&hostname).await;
        let port = u16::try_from(self.params.get_u64(SERVER_PORT, u64::from(DEFAULT_SERVER_PORT)))
            .unwrap_or(DEFAULT_SERVER_PORT);

        ServerPayload {
            server_id: self.server_id(&hostname),
            hostname,
            ip_addresses,
            port,
            transport: TRANSPORT_TAG,
            version: SERVER_VERSION,
            platform_version: self.identity.platform_version.clone(),
            database: self.identity.tenant.clone(),
            capabilities: self.identity.capabilities.clone(),
            deployment_stage: env::var("DEPLOYMENT_STAGE").unwrap_or_default(),
            kind,
        }
    }
}

/// Watches a detached task and logs it if it panics or is cancelled. Resolves
/// to whether the task ran to completion.
pub fn supervise(task: JoinHandle<()>, label: &'static str) -> JoinHandle<bool> {
    tokio::spawn(async move {
        match task.await {
            Ok(()) => true,
            Err(err) => {
                error!(task = label, "Background task failed: {err}");
                false
            }
        }
    })
}

fn endpoint(base: &str, path: &str) -> Result<String, PhoneHomeError> {
    let base = base.trim();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(PhoneHomeError::Config(format!(
            "receiver URL must start with http:// or https://, got {base}"
        )));
    }
    Ok(format!("{}/{path}", base.trim_end_matches('/')))
}

fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::VecDeque, sync::Arc, time::Duration};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    use super::{FleetTransport, HostInfo, NetworkInfo, PhoneHomeError};

    #[derive(Debug, Clone)]
    pub struct RecordedPost {
        pub url: String,
        pub payload: Value,
        pub at: tokio::time::Instant,
    }

    /// Replays queued outcomes in order, then answers 200.
    #[derive(Default)]
    pub struct ScriptedTransport {
        outcomes: Mutex<VecDeque<Result<u16, PhoneHomeError>>>,
        pub posts: Mutex<Vec<RecordedPost>>,
        pub events: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl ScriptedTransport {
        pub fn with_outcomes(outcomes: Vec<Result<u16, PhoneHomeError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Self::default()
            }
        }

        pub fn recording(events: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                events: Some(events),
                ..Self::default()
            }
        }

        pub fn posts_to(&self, suffix: &str) -> usize {
            self.posts
                .lock()
                .iter()
                .filter(|post| post.url.ends_with(suffix))
                .count()
        }
    }

    #[async_trait]
    impl FleetTransport for ScriptedTransport {
        async fn post_json(
            &self,
            url: &str,
            payload: &Value,
            _timeout: Duration,
        ) -> Result<u16, PhoneHomeError> {
            self.posts.lock().push(RecordedPost {
                url: url.to_string(),
                payload: payload.clone(),
                at: tokio::time::Instant::now(),
            });
            if let Some(events) = &self.events {
                let path = url.rsplit('/').next().unwrap_or_default();
                events.lock().push(format!("post:{path}"));
            }
            self.outcomes.lock().pop_front().unwrap_or(Ok(200))
        }
    }

    pub struct FixedHost {
        pub name: Mutex<String>,
    }

    impl FixedHost {
        pub fn named(name: &str) -> Self {
            Self {
                name: Mutex::new(name.to_string()),
            }
        }
    }

    #[async_trait]
    impl HostInfo for FixedHost {
        fn hostname(&self) -> String {
            self.name.lock().clone()
        }

        async fn network(&self, _hostname: &str) -> NetworkInfo {
            NetworkInfo {
                primary: "10.0.0.7".to_string(),
                all: vec!["10.0.0.7".to_string(), "172.17.0.1".to_string()],
            }
        }
    }
}
