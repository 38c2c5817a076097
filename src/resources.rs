use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    context::ToolContext,
    error::ToolError,
    registry::Arguments,
    tools::{get_db_schema, list_modules, read_config, service_status},
};

const JSON_MIME: &str = "application/json";
const TEXT_MIME: &str = "text/plain";
const RESOURCE_LOG_LINES: usize = 100;
const RESOURCE_MODULE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub mime_type: &'static str,
}

pub const RESOURCE_CATALOG: [ResourceDescriptor; 5] = [
    ResourceDescriptor {
        uri: "host://config",
        name: "Application Configuration",
        description: "Current application configuration (with sensitive values masked)",
        mime_type: JSON_MIME,
    },
    ResourceDescriptor {
        uri: "host://logs/{service}",
        name: "Service Logs",
        description: "Recent log entries for the specified service",
        mime_type: TEXT_MIME,
    },
    ResourceDescriptor {
        uri: "host://schema/{table}",
        name: "Database Schema",
        description: "Schema information for a specific database table",
        mime_type: JSON_MIME,
    },
    ResourceDescriptor {
        uri: "host://modules",
        name: "Installed Modules",
        description: "List of all installed modules with version info",
        mime_type: JSON_MIME,
    },
    ResourceDescriptor {
        uri: "host://system",
        name: "System Information",
        description: "Host name, operating system, architecture and server versions",
        mime_type: JSON_MIME,
    },
];

pub fn uri_templates() -> Vec<&'static str> {
    RESOURCE_CATALOG.iter().map(|resource| resource.uri).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContent {
    pub uri: String,
    pub mime_type: &'static str,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Unknown resource URI: {0}")]
    UnknownUri(String),

    #[error(transparent)]
    Read(#[from] ToolError),
}

enum Resource<'a> {
    Config,
    Logs(&'a str),
    Schema(&'a str),
    Modules,
    System,
}

fn parse_uri(uri: &str) -> Option<Resource<'_>> {
    match uri {
        "host://config" => Some(Resource::Config),
        "host://modules" => Some(Resource::Modules),
        "host://system" => Some(Resource::System),
        _ => {
            if let Some(service) = uri.strip_prefix("host://logs/") {
                return (!service.is_empty() && !service.contains('/'))
                    .then_some(Resource::Logs(service));
            }
            let table = uri.strip_prefix("host://schema/")?;
            (!table.is_empty() && !table.contains('/')).then_some(Resource::Schema(table))
        }
    }
}

fn arguments(value: Value) -> Arguments {
    match value {
        Value::Object(map) => map,
        _ => Arguments::new(),
    }
}

fn pretty(value: &Value) -> Result<String, ToolError> {
    serde_json::to_string_pretty(value)
        .map_err(|err| ToolError::failed(format!("Failed to encode resource: {err}")))
}

/// Resolves a resource URI by delegating to the matching tool body under the
/// caller's context.
pub async fn read_resource(ctx: ToolContext, uri: &str) -> Result<ResourceContent, ResourceError> {
    let resource = parse_uri(uri).ok_or_else(|| ResourceError::UnknownUri(uri.to_string()))?;

    let (mime_type, text) = match resource {
        Resource::Config => {
            let config = read_config(ctx, Arguments::new()).await?;
            (JSON_MIME, pretty(&config)?)
        }
        Resource::Logs(service) => {
            let logs = service_status(
                ctx,
                arguments(json!({
                    "service": service,
                    "action": "logs",
                    "log_lines": RESOURCE_LOG_LINES,
                })),
            )
            .await?;
            let lines = logs["log_lines"]
                .as_array()
                .map(|lines| {
                    lines
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            (TEXT_MIME, lines)
        }
        Resource::Schema(table) => {
            let schema = get_db_schema(
                ctx,
                arguments(json!({"action": "describe_table", "table_name": table})),
            )
            .await?;
            (JSON_MIME, pretty(&schema)?)
        }
        Resource::Modules => {
            let modules = list_modules(
                ctx,
                arguments(json!({"state": "installed", "limit": RESOURCE_MODULE_LIMIT})),
            )
            .await?;
            (JSON_MIME, pretty(&modules)?)
        }
        Resource::System => (JSON_MIME, pretty(&system_info(&ctx))?),
    };

    Ok(ResourceContent {
        uri: uri.to_string(),
        mime_type,
        text,
    })
}

fn system_info(ctx: &ToolContext) -> Value {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|raw| raw.trim().to_string())
        .unwrap_or_default();
    let os = if release.is_empty() {
        std::env::consts::OS.to_string()
    } else {
        format!("{} {release}", std::env::consts::OS)
    };

    json!({
        "hostname": ctx.services.phone_home.hostname(),
        "os": os,
        "arch": std::env::consts::ARCH,
        "server_version": env!("CARGO_PKG_VERSION"),
        "platform_version": ctx.settings().platform_version,
        "tenant": ctx.tenant,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::{read_resource, uri_templates, ResourceError};
    use crate::{
        tenant_db::seed_module,
        test_support::test_context,
    };

    #[test]
    fn catalog_lists_all_templates() {
        assert_eq!(
            uri_templates(),
            vec![
                "host://config",
                "host://logs/{service}",
                "host://schema/{table}",
                "host://modules",
                "host://system",
            ]
        );
    }

    #[tokio::test]
    async fn unknown_uris_are_distinguished_from_read_failures() {
        let (ctx, _guard) = test_context();
        for uri in ["host://nothing", "file:///etc/passwd", "host://logs/", "host://schema/a/b"] {
            let err = read_resource(ctx.clone(), uri).await.expect_err("unknown");
            assert!(matches!(err, ResourceError::UnknownUri(_)), "{uri}");
        }

        let err = read_resource(ctx, "host://config").await.expect_err("no config file");
        assert!(matches!(err, ResourceError::Read(_)));
    }

    #[tokio::test]
    async fn system_and_modules_render_json() {
        let (ctx, _guard) = test_context();
        ctx.database()
            .call(|conn| {
                seed_module(conn, "base", "installed", "1.0", &[])?;
                seed_module(conn, "crm", "uninstalled", "1.0", &[])
            })
            .await
            .expect("seed");

        let system = read_resource(ctx.clone(), "host://system").await.expect("system");
        assert_eq!(system.mime_type, "application/json");
        let parsed: Value = serde_json::from_str(&system.text).expect("json");
        assert_eq!(parsed["hostname"], "test-host");
        assert_eq!(parsed["platform_version"], "17.0");

        let modules = read_resource(ctx.clone(), "host://modules").await.expect("modules");
        let parsed: Value = serde_json::from_str(&modules.text).expect("json");
        assert_eq!(parsed["returned_count"], 1);
        assert_eq!(parsed["modules"][0]["name"], "base");

        let schema = read_resource(ctx, "host://schema/modules").await.expect("schema");
        assert_eq!(schema.uri, "host://schema/modules");
        let parsed: Value = serde_json::from_str(&schema.text).expect("json");
        assert_eq!(parsed["table_name"], "modules");
    }
}
