mod api;
mod audit;
mod auth;
mod config;
mod config_store;
mod context;
mod dispatcher;
mod error;
mod fleet_receiver;
mod phone_home;
mod rate_limit;
mod registry;
mod resources;
mod security;
mod tenant_db;
mod tools;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::{
    api::AppState,
    audit::AuditLog,
    config::Config,
    config_store::{ConfigStore, SqliteConfigStore, PHONE_HOME_URL},
    context::Services,
    dispatcher::McpDispatcher,
    phone_home::{supervise, HttpFleetTransport, PhoneHome, ServerIdentity, SystemHost},
    rate_limit::RateLimiterRegistry,
    tenant_db::TenantDatabase,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Host administration over MCP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Run the reference fleet receiver that collects registrations and heartbeats
    FleetReceiver {
        /// Port to listen on
        #[arg(long, default_value_t = fleet_receiver::DEFAULT_RECEIVER_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "host_admin_mcp=info,tower_http=info".into()),
        )
        .init();

    match cli.command {
        None => serve().await,
        Some(Command::FleetReceiver { port }) => fleet_receiver::run(port).await,
    }
}

async fn serve() -> Result<()> {
    let config = Config::from_env()?;
    if config.api_key_is_fallback {
        warn!("Using a generated API key; clients cannot authenticate until MCP_API_KEY is set");
    }

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;

    let params: Arc<dyn ConfigStore> = Arc::new(SqliteConfigStore::open(&config.params_db_path())?);
    if let Some(url) = &config.phone_home_url {
        params.set_param(PHONE_HOME_URL, url)?;
    }

    let registry = Arc::new(tools::build_registry()?);
    let phone_home = Arc::new(PhoneHome::new(
        params.clone(),
        ServerIdentity {
            tenant: config.tenant.clone(),
            platform_version: config.platform_version.clone(),
            capabilities: registry.names(),
        },
        Arc::new(HttpFleetTransport::new()?),
        Arc::new(SystemHost),
    ));

    let services = Arc::new(Services {
        settings: config.tool_settings(),
        audit: AuditLog::new(params.clone()),
        database: TenantDatabase::open(&config.tenant_db_path())?,
        rate_limiter: RateLimiterRegistry::new(),
        params,
        phone_home: phone_home.clone(),
    });

    if let Some(task) = phone_home.spawn_install_registration() {
        supervise(task, "install registration");
    }
    supervise(phone_home.clone().spawn_heartbeat_scheduler(), "heartbeat scheduler");

    info!(tenant = %config.tenant, tools = registry.len(), "Tool registry ready");
    let state = AppState {
        api_key: Arc::from(config.api_key.as_str()),
        platform_version: Arc::from(config.platform_version.as_str()),
        dispatcher: McpDispatcher::new(registry, services),
        phone_home,
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("host-admin-mcp listening on {}", config.bind_addr);
    axum::serve(listener, api::router(state)).await?;
    Ok(())
}
