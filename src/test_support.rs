use std::sync::Arc;

use serde_json::Value;
use tempfile::TempDir;

use crate::{
    audit::AuditLog,
    config_store::{ConfigStore, MemoryConfigStore, AUDIT_LOG_PATH},
    context::{Services, ToolContext, ToolSettings},
    phone_home::{
        testing::{FixedHost, ScriptedTransport},
        PhoneHome, ServerIdentity,
    },
    rate_limit::RateLimiterRegistry,
    registry::Arguments,
    tenant_db::TenantDatabase,
};

pub fn args(value: Value) -> Arguments {
    match value {
        Value::Object(map) => map,
        other => panic!("tool arguments must be an object, got {other}"),
    }
}

pub fn test_context() -> (ToolContext, TempDir) {
    test_context_with(&[])
}

pub fn test_context_with(params: &[(&str, &str)]) -> (ToolContext, TempDir) {
    let (services, dir) = test_services(params, Arc::new(ScriptedTransport::default()));
    (ToolContext::new(services, "admin"), dir)
}

/// Services rooted in a fresh temporary directory: audit log, tenant database
/// path and working directory all live under it.
pub fn test_services(
    params: &[(&str, &str)],
    transport: Arc<ScriptedTransport>,
) -> (Arc<Services>, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = MemoryConfigStore::new();
    store
        .set_param(
            AUDIT_LOG_PATH,
            &dir.path().join("audit.log").display().to_string(),
        )
        .expect("seed audit path");
    for (key, value) in params {
        store.set_param(key, value).expect("seed param");
    }
    let params: Arc<dyn ConfigStore> = Arc::new(store);

    let settings = ToolSettings {
        tenant: "acme".to_string(),
        working_dir: dir.path().to_path_buf(),
        tenant_db_path: dir.path().join("tenant.db"),
        app_config_path: dir.path().join("app.conf"),
        allowed_services: vec![
            "app".to_string(),
            "postgresql".to_string(),
            "nginx".to_string(),
        ],
        script_interpreter: "sh".to_string(),
        platform_version: "17.0".to_string(),
    };

    let phone_home = Arc::new(PhoneHome::new(
        params.clone(),
        ServerIdentity {
            tenant: settings.tenant.clone(),
            platform_version: settings.platform_version.clone(),
            capabilities: vec!["execute_command".to_string()],
        },
        transport,
        Arc::new(FixedHost::named("test-host")),
    ));

    let services = Services {
        audit: AuditLog::new(params.clone()),
        database: TenantDatabase::open_in_memory().expect("tenant db"),
        rate_limiter: RateLimiterRegistry::new(),
        params,
        phone_home,
        settings,
    };
    (Arc::new(services), dir)
}
