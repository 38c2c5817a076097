use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tokio::{fs, io::AsyncWriteExt};
use tracing::error;

use crate::config_store::{
    ConfigStore, ConfigStoreExt, AUDIT_ENABLED, AUDIT_LOG_PATH, DEFAULT_AUDIT_LOG_PATH,
};

const MAX_FIELD_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct AuditEntry {
    tool: &'static str,
    fields: Vec<(String, String)>,
    duration_ms: Option<u64>,
}

impl AuditEntry {
    pub fn new(tool: &'static str) -> Self {
        Self {
            tool,
            fields: Vec::new(),
            duration_ms: None,
        }
    }

    pub fn field(mut self, key: &str, value: impl Display) -> Self {
        self.fields.push((key.to_ascii_uppercase(), value.to_string()));
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Append-only audit trail of tool invocations. Enablement and destination
/// are re-read from the parameter store on every write.
#[derive(Clone)]
pub struct AuditLog {
    params: Arc<dyn ConfigStore>,
}

impl AuditLog {
    pub fn new(params: Arc<dyn ConfigStore>) -> Self {
        Self { params }
    }

    pub async fn record(&self, tenant: &str, principal: &str, entry: AuditEntry) {
        if !self.params.get_bool(AUDIT_ENABLED, true) {
            return;
        }

        let path = PathBuf::from(
            self.params
                .get_string(AUDIT_LOG_PATH)
                .unwrap_or_else(|| DEFAULT_AUDIT_LOG_PATH.to_string()),
        );
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let line = format_line(&timestamp, tenant, principal, &entry);

        if let Err(err) = append_line(&path, &line).await {
            error!(tool = entry.tool, "Failed to write to audit log: {err:#}");
        }
    }
}

fn format_line(timestamp: &str, tenant: &str, principal: &str, entry: &AuditEntry) -> String {
    let mut parts = vec![
        format!("[{timestamp}]"),
        format!("DB={tenant}"),
        format!("USER={principal}"),
        format!("TOOL={}", entry.tool),
    ];

    for (key, value) in &entry.fields {
        parts.push(format!("{key}={}", truncate(value)));
    }

    if let Some(duration_ms) = entry.duration_ms {
        parts.push(format!("DURATION={duration_ms}ms"));
    }

    parts.join(" ")
}

fn truncate(value: &str) -> String {
    if value.chars().count() <= MAX_FIELD_CHARS {
        return value.to_string();
    }
    let head = value.chars().take(MAX_FIELD_CHARS).collect::<String>();
    format!("{head}...")
}

async fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create audit directory {}", parent.display()))?;
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open audit log {}", path.display()))?;
    file.write_all(format!("{line}\n").as_bytes())
        .await
        .with_context(|| format!("Failed to append to audit log {}", path.display()))?;
    Ok(())
}
