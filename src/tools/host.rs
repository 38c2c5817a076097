use std::{
    collections::HashMap,
    path::Path,
    process::Stdio,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::{io::AsyncWriteExt, process::Command, time};
use tracing::{error, warn};

use super::{elapsed_ms, parse_args};
use crate::{
    audit::AuditEntry,
    context::ToolContext,
    error::ToolError,
    registry::{tool_def, Arguments, ToolDescriptor},
    security::mask_sensitive_config,
};

const SCRIPT_MAX_TIMEOUT: u64 = 300;
const MAX_LOG_LINES: usize = 1000;
const STATUS_PROPERTIES: &str =
    "ActiveState,SubState,MainPID,MemoryCurrent,ExecMainStartTimestamp,Description";

pub fn run_script_def() -> ToolDescriptor {
    tool_def(
        "run_script",
        "Execute a script through the configured application interpreter",
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string", "description": "Script source passed to the interpreter on stdin"},
                "timeout": {"type": "integer", "description": "Maximum execution time in seconds (max 300)", "default": 30}
            },
            "required": ["code"]
        }),
    )
}

pub fn service_status_def() -> ToolDescriptor {
    tool_def(
        "service_status",
        "Check and manage host services",
        json!({
            "type": "object",
            "properties": {
                "service": {"type": "string", "description": "Service name (must be in the allowed list)", "default": "app"},
                "action": {"type": "string", "enum": ["status", "start", "stop", "restart", "logs"], "default": "status"},
                "log_lines": {"type": "integer", "description": "Number of log lines for the logs action (max 1000)", "default": 50}
            }
        }),
    )
}

pub fn read_config_def() -> ToolDescriptor {
    tool_def(
        "read_config",
        "Read the application configuration file with sensitive values masked",
        json!({
            "type": "object",
            "properties": {
                "key": {"type": "string", "description": "Single configuration key to read (omit for all)"}
            }
        }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunScriptArgs {
    code: String,
    #[serde(default = "default_script_timeout")]
    timeout: u64,
}

fn default_script_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceArgs {
    #[serde(default = "default_service")]
    service: String,
    #[serde(default = "default_action")]
    action: String,
    #[serde(default = "default_log_lines")]
    log_lines: usize,
}

fn default_service() -> String {
    "app".to_string()
}

fn default_action() -> String {
    "status".to_string()
}

fn default_log_lines() -> usize {
    50
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadConfigArgs {
    #[serde(default)]
    key: Option<String>,
}

pub async fn run_script(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let args: RunScriptArgs = parse_args("run_script", args)?;
    ctx.check_rate_limit("shell", 5, Duration::from_secs(60))?;

    let timeout = Duration::from_secs(args.timeout.min(SCRIPT_MAX_TIMEOUT));
    let settings = ctx.settings();
    let tenant_db = settings.tenant_db_path.display().to_string();
    let started = Instant::now();

    let outcome = interpret(
        &settings.script_interpreter,
        &args.code,
        &[
            ("MCP_TENANT", settings.tenant.as_str()),
            ("MCP_TENANT_DB", tenant_db.as_str()),
        ],
        &settings.working_dir,
        timeout,
    )
    .await;
    let duration_ms = elapsed_ms(started);

    let (output, error) = match outcome {
        Ok(output) => (output, None),
        Err((output, err)) => {
            error!("Script execution error: {err}");
            (output, Some(err))
        }
    };

    ctx.audit(
        AuditEntry::new("run_script")
            .field("code_length", args.code.len())
            .field("error", if error.is_some() { "yes" } else { "no" })
            .duration_ms(duration_ms),
    )
    .await;

    Ok(json!({
        "output": output,
        "return_value": if error.is_none() { Some("Execution successful") } else { None },
        "error": error,
        "duration_ms": duration_ms,
    }))
}

/// Feeds `code` to the interpreter on stdin. On failure returns whatever was
/// printed to stdout alongside the error text.
async fn interpret(
    interpreter: &str,
    code: &str,
    env: &[(&str, &str)],
    cwd: &Path,
    timeout: Duration,
) -> Result<String, (String, String)> {
    let mut parts = interpreter.split_whitespace();
    let Some(program) = parts.next() else {
        return Err((String::new(), "No script interpreter configured".to_string()));
    };

    let mut child = Command::new(program)
        .args(parts)
        .envs(env.iter().copied())
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| (String::new(), format!("Failed to start {program}: {err}")))?;

    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            if let Err(err) = stdin.write_all(code.as_bytes()).await {
                warn!("Failed writing script to interpreter: {err}");
            }
        }
    };

    let run = async {
        let (_, output) = tokio::join!(feed, child.wait_with_output());
        output
    };

    match time::timeout(timeout, run).await {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            if output.status.success() {
                Ok(stdout)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let message = if stderr.is_empty() {
                    format!("Interpreter exited with {}", output.status)
                } else {
                    stderr
                };
                Err((stdout, message))
            }
        }
        Ok(Err(err)) => Err((String::new(), err.to_string())),
        Err(_) => Err((
            String::new(),
            format!("Execution timed out after {} seconds", timeout.as_secs()),
        )),
    }
}

pub async fn service_status(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let args: ServiceArgs = parse_args("service_status", args)?;

    let allowed = &ctx.settings().allowed_services;
    if !allowed.contains(&args.service) {
        return Err(ToolError::invalid(format!(
            "Service '{}' not in allowed list: {allowed:?}",
            args.service
        )));
    }
    if !matches!(
        args.action.as_str(),
        "status" | "start" | "stop" | "restart" | "logs"
    ) {
        return Err(ToolError::invalid(format!("Unknown action: {}", args.action)));
    }

    let result = match args.action.as_str() {
        "status" => unit_status(&args.service).await,
        "logs" => unit_logs(&args.service, args.log_lines.min(MAX_LOG_LINES)).await,
        action => unit_action(&args.service, action).await,
    }
    .map_err(|err| {
        error!(service = %args.service, action = %args.action, "Service operation failed: {err:#}");
        ToolError::from(err)
    })?;

    ctx.audit(
        AuditEntry::new("service_status")
            .field("service", &args.service)
            .field("action", &args.action),
    )
    .await;

    Ok(result)
}

async fn run_tool(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let output = time::timeout(
        timeout,
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| anyhow!("{program} timed out after {} seconds", timeout.as_secs()))?
    .with_context(|| format!("Failed to run {program}"))?;

    if !output.status.success() {
        bail!(
            "{program} {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn unit_status(service: &str) -> Result<Value> {
    let property_arg = format!("--property={STATUS_PROPERTIES}");
    let stdout = run_tool(
        "systemctl",
        &["show", service, &property_arg],
        Duration::from_secs(5),
    )
    .await?;
    Ok(summarize_status(service, &stdout, Utc::now()))
}

async fn unit_action(service: &str, action: &str) -> Result<Value> {
    run_tool("systemctl", &[action, service], Duration::from_secs(30)).await?;
    unit_status(service).await
}

async fn unit_logs(service: &str, lines: usize) -> Result<Value> {
    let count = lines.to_string();
    let stdout = run_tool(
        "journalctl",
        &["-u", service, "-n", &count, "--no-pager"],
        Duration::from_secs(10),
    )
    .await?;

    let log_lines = log_lines(&stdout);
    Ok(json!({
        "service": service,
        "line_count": log_lines.len(),
        "log_lines": log_lines,
    }))
}

pub(crate) fn log_lines(stdout: &str) -> Vec<String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.lines().map(str::to_string).collect()
}

fn summarize_status(service: &str, stdout: &str, now: DateTime<Utc>) -> Value {
    let props = stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .collect::<HashMap<_, _>>();
    let prop = |key: &str| props.get(key).copied().unwrap_or_default();

    let active_state = Some(prop("ActiveState")).filter(|s| !s.is_empty()).unwrap_or("unknown");
    let sub_state = Some(prop("SubState")).filter(|s| !s.is_empty()).unwrap_or("unknown");
    let pid = prop("MainPID").parse::<u64>().unwrap_or(0);
    let memory_mb = prop("MemoryCurrent").parse::<u64>().unwrap_or(0) / (1024 * 1024);
    let uptime = parse_systemd_timestamp(prop("ExecMainStartTimestamp"))
        .map(|started| format_uptime(now - started))
        .unwrap_or_else(|| "unknown".to_string());

    json!({
        "service": service,
        "active": active_state == "active",
        "status": format!("{active_state} ({sub_state})"),
        "pid": pid,
        "memory_mb": memory_mb,
        "uptime": uptime,
        "description": prop("Description"),
    })
}

/// Accepts `@<unix seconds>` and systemd's default `Mon 2024-01-15 10:30:00 UTC`.
fn parse_systemd_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Some(epoch) = raw.strip_prefix('@') {
        return DateTime::from_timestamp(epoch.parse().ok()?, 0);
    }

    let parts = raw.split_whitespace().collect::<Vec<_>>();
    let [_, date, clock, zone @ ..] = parts.as_slice() else {
        return None;
    };
    let naive = NaiveDateTime::parse_from_str(&format!("{date} {clock}"), "%Y-%m-%d %H:%M:%S").ok()?;
    match zone.first() {
        Some(&"UTC") | Some(&"GMT") | None => Some(naive.and_utc()),
        Some(_) => Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|local| local.with_timezone(&Utc)),
    }
}

fn format_uptime(elapsed: chrono::Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    if days > 0 {
        format!("{days} days {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

pub async fn read_config(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let args: ReadConfigArgs = parse_args("read_config", args)?;
    let path = ctx.settings().app_config_path.clone();

    if !path.exists() {
        return Err(ToolError::failed(format!(
            "Application configuration file not found: {}",
            path.display()
        )));
    }

    let values = load_options(&path).map_err(|err| {
        error!("Failed to read application configuration: {err:#}");
        ToolError::from(err)
    })?;
    let values = mask_sensitive_config(&values);

    ctx.audit(
        AuditEntry::new("read_config").field("key", args.key.as_deref().unwrap_or("all")),
    )
    .await;

    let config_path = path.display().to_string();
    match args.key {
        Some(key) => {
            let value = values
                .get(&key)
                .or_else(|| values.get(&key.to_ascii_lowercase()))
                .cloned()
                .ok_or_else(|| ToolError::failed(format!("Configuration key not found: {key}")))?;
            Ok(json!({"config_path": config_path, "key": key, "value": value}))
        }
        None => Ok(json!({"config_path": config_path, "values": values})),
    }
}

/// Reads the `[options]` section of an INI file as strings. A file without
/// that section yields an empty map.
fn load_options(path: &Path) -> Result<Map<String, Value>> {
    let source = path.to_string_lossy();
    let parsed = ::config::Config::builder()
        .add_source(::config::File::new(&source, ::config::FileFormat::Ini))
        .build()
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let table = match parsed.get_table("options") {
        Ok(table) => table,
        Err(::config::ConfigError::NotFound(_)) => return Ok(Map::new()),
        Err(err) => return Err(err.into()),
    };

    table
        .into_iter()
        .map(|(key, value)| {
            let text = value
                .into_string()
                .with_context(|| format!("Option {key} is not a scalar"))?;
            Ok((key, Value::String(text)))
        })
        .collect()
}
