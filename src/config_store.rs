use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

pub const PHONE_HOME_URL: &str = "mcp.phone_home_url";
pub const PHONE_HOME_RETRY_COUNT: &str = "mcp.phone_home_retry_count";
pub const PHONE_HOME_TIMEOUT: &str = "mcp.phone_home_timeout";
pub const SERVER_PORT: &str = "mcp.server_port";
pub const HEARTBEAT_INTERVAL: &str = "mcp.heartbeat_interval";
pub const COMMAND_MAX_TIMEOUT: &str = "mcp.command_max_timeout";
pub const MAX_RESULT_ROWS: &str = "mcp.max_result_rows";
pub const MAX_READ_SIZE_MB: &str = "mcp.max_read_size_mb";
pub const MAX_WRITE_SIZE_MB: &str = "mcp.max_write_size_mb";
pub const AUDIT_ENABLED: &str = "mcp.audit_enabled";
pub const AUDIT_LOG_PATH: &str = "mcp.audit_log_path";
pub const LAST_HOSTNAME: &str = "mcp.last_hostname";

pub const DEFAULT_SERVER_PORT: u16 = 8768;
pub const DEFAULT_AUDIT_LOG_PATH: &str = "/var/log/host-admin-mcp/audit.log";

/// Key/value parameter store shared by the tool path and the phone-home engine.
pub trait ConfigStore: Send + Sync {
    fn get_param(&self, key: &str) -> Result<Option<String>>;

    fn set_param(&self, key: &str, value: &str) -> Result<()>;
}

/// Typed reads over any [`ConfigStore`]. Missing, blank, or unparsable values
/// resolve to the supplied default. Store failures are logged and treated as
/// missing.
pub trait ConfigStoreExt: ConfigStore {
    fn get_string(&self, key: &str) -> Option<String> {
        let value = match self.get_param(key) {
            Ok(value) => value,
            Err(err) => {
                warn!(key, "Parameter read failed: {err:#}");
                None
            }
        };
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get_string(key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default)
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_string(key)
            .map(|v| {
                matches!(
                    v.to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(default)
    }

    fn get_seconds(&self, key: &str, default: u64) -> Duration {
        Duration::from_secs(self.get_u64(key, default))
    }

    fn get_megabytes(&self, key: &str, default: u64) -> u64 {
        self.get_u64(key, default).saturating_mul(1024 * 1024)
    }
}

impl<T: ConfigStore + ?Sized> ConfigStoreExt for T {}

pub struct SqliteConfigStore {
    conn: Mutex<Connection>,
}

impl SqliteConfigStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed creating parameter store directory {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening parameter store {}", path.display()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS config_parameters (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .context("Failed initializing parameter store schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ConfigStore for SqliteConfigStore {
    fn get_param(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM config_parameters WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_context(|| format!("Failed reading parameter {key}"))
    }

    fn set_param(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO config_parameters (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, chrono::Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("Failed writing parameter {key}"))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let store = Self::new();
        {
            let mut values = store.values.write();
            for (key, value) in pairs {
                values.insert(key.to_string(), value.to_string());
            }
        }
        store
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_param(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set_param(&self, key: &str, value: &str) -> Result<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
