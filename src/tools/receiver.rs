use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::parse_args;
use crate::{
    audit::AuditEntry,
    config_store::{ConfigStoreExt, HEARTBEAT_INTERVAL, PHONE_HOME_URL},
    context::ToolContext,
    error::ToolError,
    registry::{tool_def, Arguments, ToolDescriptor},
};

pub fn register_receiver_def() -> ToolDescriptor {
    tool_def(
        "register_receiver",
        "Register a fleet receiver URL for phone-home registration and heartbeats",
        json!({
            "type": "object",
            "properties": {
                "receiver_url": {"type": "string", "description": "Base URL of the receiver (e.g. https://fleet.example.com)"}
            },
            "required": ["receiver_url"]
        }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterReceiverArgs {
    receiver_url: String,
}

/// Strips a trailing `/register` and then any trailing slashes.
fn normalize_receiver_url(raw: &str) -> Result<String, ToolError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ToolError::invalid(
            "receiver_url is required and must be a non-empty string",
        ));
    }
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(ToolError::invalid(
            "receiver_url must start with http:// or https://",
        ));
    }

    let base = trimmed
        .strip_suffix("/register")
        .unwrap_or(trimmed)
        .trim_end_matches('/');
    if base.is_empty() {
        return Err(ToolError::invalid(
            "receiver_url resolves to an empty base URL after normalization",
        ));
    }
    Ok(base.to_string())
}

pub async fn register_receiver(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let args: RegisterReceiverArgs = parse_args("register_receiver", args)?;
    ctx.check_rate_limit("register_receiver", 5, Duration::from_secs(60))?;

    let base_url = normalize_receiver_url(&args.receiver_url)?;
    ctx.params()
        .set_param(PHONE_HOME_URL, &base_url)
        .map_err(|err| {
            error!("Error in register_receiver: {err:#}");
            ToolError::from(err)
        })?;
    info!(receiver = %base_url, "Receiver URL stored");

    let phone_home = &ctx.services.phone_home;
    let registration_sent = phone_home.register().await;
    let server_id = phone_home.server_id(&phone_home.hostname());
    let interval = ctx.params().get_u64(HEARTBEAT_INTERVAL, 60);

    ctx.audit(AuditEntry::new("register_receiver").field("receiver_url", &base_url))
        .await;

    Ok(json!({
        "success": true,
        "server_id": server_id,
        "url_stored": base_url,
        "registration_sent": registration_sent,
        "heartbeat_schedule": format!("every {interval} seconds"),
    }))
}
