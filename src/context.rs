use std::{path::PathBuf, sync::Arc, time::Duration};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    audit::{AuditEntry, AuditLog},
    config_store::ConfigStore,
    error::ToolError,
    phone_home::PhoneHome,
    rate_limit::RateLimiterRegistry,
    tenant_db::TenantDatabase,
};

/// Host-level settings resolved once at bootstrap and read by tool bodies.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub tenant: String,
    pub working_dir: PathBuf,
    pub tenant_db_path: PathBuf,
    pub app_config_path: PathBuf,
    pub allowed_services: Vec<String>,
    pub script_interpreter: String,
    pub platform_version: String,
}

/// Collaborators shared by every tool invocation.
pub struct Services {
    pub settings: ToolSettings,
    pub params: Arc<dyn ConfigStore>,
    pub rate_limiter: RateLimiterRegistry,
    pub audit: AuditLog,
    pub database: TenantDatabase,
    pub phone_home: Arc<PhoneHome>,
}

#[derive(Clone)]
pub struct ToolContext {
    pub tenant: String,
    pub principal: String,
    pub trace_id: String,
    pub services: Arc<Services>,
}

impl ToolContext {
    pub fn new(services: Arc<Services>, principal: impl Into<String>) -> Self {
        Self {
            tenant: services.settings.tenant.clone(),
            principal: principal.into(),
            trace_id: Uuid::new_v4().to_string(),
            services,
        }
    }

    pub fn settings(&self) -> &ToolSettings {
        &self.services.settings
    }

    pub fn params(&self) -> &dyn ConfigStore {
        self.services.params.as_ref()
    }

    pub fn database(&self) -> &TenantDatabase {
        &self.services.database
    }

    pub fn check_rate_limit(
        &self,
        category: &str,
        max_calls: u32,
        period: Duration,
    ) -> Result<(), ToolError> {
        match self
            .services
            .rate_limiter
            .check(&self.tenant, category, max_calls, period)
        {
            Ok(decision) => {
                debug!(
                    tenant = %self.tenant,
                    category,
                    remaining = decision.remaining,
                    limit = decision.limit,
                    "Rate limit check passed"
                );
                Ok(())
            }
            Err(exceeded) => {
                warn!(
                    tenant = %self.tenant,
                    category,
                    retry_after = ?exceeded.retry_after,
                    "Rate limit exceeded"
                );
                Err(exceeded.into())
            }
        }
    }

    pub async fn audit(&self, entry: AuditEntry) {
        self.services
            .audit
            .record(&self.tenant, &self.principal, entry)
            .await;
    }
}
