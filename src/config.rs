use std::{
    env, fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use anyhow::Result;
use tracing::warn;
use uuid::Uuid;

use crate::{config_store::DEFAULT_SERVER_PORT, context::ToolSettings};

const DEFAULT_BIND_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_SERVER_PORT);

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub tenant: String,
    pub data_dir: PathBuf,
    pub working_dir: PathBuf,
    pub app_config_path: PathBuf,
    pub allowed_services: Vec<String>,
    pub script_interpreter: String,
    pub platform_version: String,
    pub phone_home_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_addr = var("MCP_BIND_ADDR")
            .and_then(|raw| raw.parse::<SocketAddr>().ok())
            .unwrap_or(DEFAULT_BIND_ADDR);

        let (api_key, api_key_is_fallback) = resolve_api_key(&var);

        let tenant = var("MCP_TENANT").unwrap_or_else(|| "default".to_string());
        let data_dir = PathBuf::from(
            var("MCP_DATA_DIR").unwrap_or_else(|| "/var/lib/host-admin-mcp".to_string()),
        );
        let working_dir = PathBuf::from(var("MCP_WORKING_DIR").unwrap_or_else(|| "/opt".to_string()));
        let app_config_path = PathBuf::from(
            var("MCP_APP_CONFIG").unwrap_or_else(|| "/etc/host-admin-mcp/app.conf".to_string()),
        );

        let allowed_services = var("MCP_ALLOWED_SERVICES")
            .unwrap_or_else(|| "app,postgresql,nginx".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let script_interpreter =
            var("MCP_SCRIPT_INTERPRETER").unwrap_or_else(|| "python3".to_string());
        let platform_version =
            var("MCP_PLATFORM_VERSION").unwrap_or_else(|| "unknown".to_string());
        let phone_home_url = var("MCP_PHONE_HOME_URL");

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            tenant,
            data_dir,
            working_dir,
            app_config_path,
            allowed_services,
            script_interpreter,
            platform_version,
            phone_home_url,
        })
    }

    pub fn params_db_path(&self) -> PathBuf {
        self.data_dir.join("params.db")
    }

    pub fn tenant_db_path(&self) -> PathBuf {
        self.data_dir.join("tenant.db")
    }

    pub fn tool_settings(&self) -> ToolSettings {
        ToolSettings {
            tenant: self.tenant.clone(),
            working_dir: self.working_dir.clone(),
            tenant_db_path: self.tenant_db_path(),
            app_config_path: self.app_config_path.clone(),
            allowed_services: self.allowed_services.clone(),
            script_interpreter: self.script_interpreter.clone(),
            platform_version: self.platform_version.clone(),
        }
    }
}

fn resolve_api_key(var: &impl Fn(&str) -> Option<String>) -> (String, bool) {
    if let Some(value) = var("MCP_API_KEY") {
        return (value, false);
    }

    if let Some(key_file) = var("MCP_API_KEY_FILE") {
        match fs::read_to_string(&key_file) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return (trimmed.to_string(), false);
                }
                warn!(key_file = %key_file, "MCP_API_KEY_FILE is empty. Falling back to generated key.");
            }
            Err(err) => {
                warn!(key_file = %key_file, "Failed reading MCP_API_KEY_FILE: {err}. Falling back to generated key.");
            }
        }
    } else {
        warn!("MCP_API_KEY not set. Falling back to generated key.");
    }

    let generated = format!("fallback-{}", Uuid::new_v4());
    (generated, true)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::PathBuf};

    use super::{Config, DEFAULT_BIND_ADDR};

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_lookup(|key| vars.get(key).cloned()).expect("config")
    }

    #[test]
    fn defaults_apply_when_unset_or_invalid() {
        let config = config_from(&[("MCP_BIND_ADDR", "not an address")]);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8768");
        assert!(config.api_key_is_fallback);
        assert!(config.api_key.starts_with("fallback-"));
        assert_eq!(config.tenant, "default");
        assert_eq!(config.allowed_services, vec!["app", "postgresql", "nginx"]);
        assert_eq!(config.tenant_db_path(), PathBuf::from("/var/lib/host-admin-mcp/tenant.db"));
        assert!(config.phone_home_url.is_none());
    }

    #[test]
    fn explicit_values_and_key_file_are_honoured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_file = dir.path().join("key");
        std::fs::write(&key_file, "  secret-key \n").expect("key file");

        let config = config_from(&[
            ("MCP_BIND_ADDR", "\"0.0.0.0:9000\""),
            ("MCP_API_KEY_FILE", key_file.to_str().expect("utf8")),
            ("MCP_TENANT", "acme"),
            ("MCP_ALLOWED_SERVICES", "app, redis ,,"),
            ("MCP_PHONE_HOME_URL", "https://fleet.example.com"),
        ]);

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.api_key, "secret-key");
        assert!(!config.api_key_is_fallback);
        assert_eq!(config.allowed_services, vec!["app", "redis"]);
        assert_eq!(config.tool_settings().tenant, "acme");
        assert_eq!(config.phone_home_url.as_deref(), Some("https://fleet.example.com"));
    }
}
