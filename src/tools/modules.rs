use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::{parse_args, to_value};
use crate::{
    audit::AuditEntry,
    context::ToolContext,
    error::ToolError,
    registry::{tool_def, Arguments, ToolDescriptor},
    tenant_db::{self, ModuleRecord},
};

const MODULE_STATES: [&str; 6] = [
    "installed",
    "uninstalled",
    "to_upgrade",
    "to_install",
    "to_remove",
    "all",
];

pub fn list_modules_def() -> ToolDescriptor {
    tool_def(
        "list_modules",
        "List application modules with their installation state",
        json!({
            "type": "object",
            "properties": {
                "state": {"type": "string", "enum": MODULE_STATES, "default": "all"},
                "search": {"type": "string", "description": "Filter by name, display name or summary"},
                "limit": {"type": "integer", "description": "Maximum number of modules", "default": 100}
            }
        }),
    )
}

pub fn get_module_info_def() -> ToolDescriptor {
    module_name_def("get_module_info", "Get detailed information about a module")
}

pub fn install_module_def() -> ToolDescriptor {
    module_name_def("install_module", "Install a module together with its dependencies")
}

pub fn upgrade_module_def() -> ToolDescriptor {
    module_name_def("upgrade_module", "Upgrade an installed module to its latest version")
}

fn module_name_def(name: &str, description: &str) -> ToolDescriptor {
    tool_def(
        name,
        description,
        json!({
            "type": "object",
            "properties": {
                "module_name": {"type": "string", "description": "Technical name of the module"}
            },
            "required": ["module_name"]
        }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListModulesArgs {
    #[serde(default = "default_state")]
    state: String,
    #[serde(default)]
    search: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_state() -> String {
    "all".to_string()
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModuleNameArgs {
    module_name: String,
}

fn summary(module: &ModuleRecord) -> Value {
    json!({
        "name": module.name,
        "display_name": module.display_name,
        "version": module.latest_version,
        "state": module.state,
        "author": module.author,
        "summary": module.summary,
    })
}

pub async fn list_modules(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let args: ListModulesArgs = parse_args("list_modules", args)?;
    if !MODULE_STATES.contains(&args.state.as_str()) {
        return Err(ToolError::invalid(format!(
            "Invalid state: {} (expected one of {})",
            args.state,
            MODULE_STATES.join(", ")
        )));
    }

    let state = (args.state != "all").then(|| args.state.clone());
    let search = args.search.clone().filter(|term| !term.trim().is_empty());
    let limit = args.limit;
    let (modules, total_count) = ctx
        .database()
        .call(move |conn| {
            tenant_db::list_modules(conn, state.as_deref(), search.as_deref(), limit)
        })
        .await
        .map_err(|err| {
            error!("Failed to list modules: {err:#}");
            ToolError::from(err)
        })?;

    ctx.audit(
        AuditEntry::new("list_modules")
            .field("state", &args.state)
            .field("search", args.search.as_deref().unwrap_or("none"))
            .field("returned", modules.len()),
    )
    .await;

    Ok(json!({
        "modules": modules.iter().map(summary).collect::<Vec<_>>(),
        "total_count": total_count,
        "returned_count": modules.len(),
        "filter_applied": args.state,
    }))
}

pub async fn get_module_info(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let ModuleNameArgs { module_name } = parse_args("get_module_info", args)?;

    let name = module_name.clone();
    let found = ctx
        .database()
        .call(move |conn| {
            let Some(module) = tenant_db::find_module(conn, &name)? else {
                return Ok(None);
            };
            let dependencies = tenant_db::module_dependencies(conn, &name)?;
            Ok(Some((module, dependencies)))
        })
        .await?;
    let Some((module, dependencies)) = found else {
        return Err(ToolError::failed(format!("Module not found: {module_name}")));
    };

    ctx.audit(AuditEntry::new("get_module_info").field("module", &module_name))
        .await;

    let mut details = summary(&module);
    if let Value::Object(map) = &mut details {
        map.insert("description".into(), Value::from(module.description));
        map.insert("category".into(), Value::from(module.category));
        map.insert("website".into(), Value::from(module.website));
        map.insert("dependencies".into(), to_value(dependencies)?);
        map.insert("installed_version".into(), to_value(module.installed_version)?);
    }
    Ok(details)
}

pub async fn install_module(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let ModuleNameArgs { module_name } = parse_args("install_module", args)?;

    let name = module_name.clone();
    let outcome = ctx
        .database()
        .call(move |conn| {
            let Some(module) = tenant_db::find_module(conn, &name)? else {
                return Ok(None);
            };
            if module.state == "installed" {
                return Ok(Some(None));
            }
            tenant_db::install_with_dependencies(conn, &name).map(|deps| Some(Some(deps)))
        })
        .await
        .map_err(|err| {
            error!("Failed to install module: {err:#}");
            ToolError::from(err)
        })?;

    let (message, installed_dependencies) = match outcome {
        None => return Err(ToolError::failed(format!("Module not found: {module_name}"))),
        Some(None) => (
            format!("Module '{module_name}' is already installed"),
            Vec::new(),
        ),
        Some(Some(deps)) => {
            info!(module = %module_name, dependencies = deps.len(), "Module installed");
            (format!("Module '{module_name}' has been installed"), deps)
        }
    };

    ctx.audit(
        AuditEntry::new("install_module")
            .field("module", &module_name)
            .field("dependencies", installed_dependencies.join(",")),
    )
    .await;

    Ok(json!({
        "success": true,
        "message": message,
        "state": "installed",
        "installed_dependencies": installed_dependencies,
    }))
}

pub async fn upgrade_module(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let ModuleNameArgs { module_name } = parse_args("upgrade_module", args)?;

    let name = module_name.clone();
    let module = ctx
        .database()
        .call(move |conn| tenant_db::find_module(conn, &name))
        .await?
        .ok_or_else(|| ToolError::failed(format!("Module not found: {module_name}")))?;

    if module.state != "installed" {
        return Err(ToolError::failed(format!(
            "Module '{module_name}' is not installed (state: {})",
            module.state
        )));
    }

    let name = module_name.clone();
    ctx.database()
        .call(move |conn| tenant_db::mark_installed(conn, &name))
        .await
        .map_err(|err| {
            error!("Failed to upgrade module: {err:#}");
            ToolError::from(err)
        })?;

    ctx.audit(
        AuditEntry::new("upgrade_module")
            .field("module", &module_name)
            .field("version", &module.latest_version),
    )
    .await;

    Ok(json!({
        "success": true,
        "message": format!("Module '{module_name}' has been upgraded"),
        "state": "installed",
        "version": module.latest_version,
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{get_module_info, install_module, list_modules, upgrade_module};
    use crate::{
        context::ToolContext,
        tenant_db::seed_module,
        test_support::{args, test_context},
    };

    async fn seed(ctx: &ToolContext) {
        ctx.database()
            .call(|conn| {
                seed_module(conn, "base", "installed", "1.0", &[])?;
                seed_module(conn, "mail", "uninstalled", "1.2", &["base"])?;
                seed_module(conn, "sale", "uninstalled", "2.0", &["mail", "base"])?;
                seed_module(conn, "stock", "to_upgrade", "3.1", &[])?;
                Ok(())
            })
            .await
            .expect("seed modules");
    }

    #[tokio::test]
    async fn listing_filters_by_state_and_search() {
        let (ctx, _guard) = test_context();
        seed(&ctx).await;

        let all = list_modules(ctx.clone(), args(json!({"limit": 2})))
            .await
            .expect("list");
        assert_eq!(all["total_count"], 4);
        assert_eq!(all["returned_count"], 2);
        assert_eq!(all["filter_applied"], "all");
        assert_eq!(all["modules"][0]["name"], "base");

        let uninstalled = list_modules(
            ctx.clone(),
            args(json!({"state": "uninstalled", "search": "SAL"})),
        )
        .await
        .expect("filtered");
        assert_eq!(uninstalled["total_count"], 1);
        assert_eq!(uninstalled["modules"][0]["name"], "sale");
        assert_eq!(uninstalled["modules"][0]["version"], "2.0");

        let err = list_modules(ctx, args(json!({"state": "broken"})))
            .await
            .expect_err("invalid state");
        assert!(err.to_string().starts_with("Invalid state: broken"));
    }

    #[tokio::test]
    async fn module_info_includes_dependencies() {
        let (ctx, _guard) = test_context();
        seed(&ctx).await;

        let info = get_module_info(ctx.clone(), args(json!({"module_name": "sale"})))
            .await
            .expect("info");
        assert_eq!(
            info["dependencies"],
            json!([
                {"name": "base", "state": "installed"},
                {"name": "mail", "state": "uninstalled"}
            ])
        );
        assert_eq!(info["installed_version"], json!(null));

        let err = get_module_info(ctx, args(json!({"module_name": "ghost"})))
            .await
            .expect_err("absent");
        assert_eq!(err.to_string(), "Module not found: ghost");
    }

    #[tokio::test]
    async fn install_pulls_in_dependencies_and_is_idempotent() {
        let (ctx, _guard) = test_context();
        seed(&ctx).await;

        let first = install_module(ctx.clone(), args(json!({"module_name": "sale"})))
            .await
            .expect("install");
        assert_eq!(first["message"], "Module 'sale' has been installed");
        assert_eq!(first["installed_dependencies"], json!(["mail"]));

        let again = install_module(ctx.clone(), args(json!({"module_name": "sale"})))
            .await
            .expect("reinstall");
        assert_eq!(again["message"], "Module 'sale' is already installed");

        let info = get_module_info(ctx, args(json!({"module_name": "mail"})))
            .await
            .expect("info");
        assert_eq!(info["state"], "installed");
        assert_eq!(info["installed_version"], "1.2");
    }

    #[tokio::test]
    async fn upgrade_requires_installed_module() {
        let (ctx, _guard) = test_context();
        seed(&ctx).await;

        let err = upgrade_module(ctx.clone(), args(json!({"module_name": "stock"})))
            .await
            .expect_err("not installed");
        assert_eq!(
            err.to_string(),
            "Module 'stock' is not installed (state: to_upgrade)"
        );

        let upgraded = upgrade_module(ctx.clone(), args(json!({"module_name": "base"})))
            .await
            .expect("upgrade");
        assert_eq!(upgraded["version"], "1.0");

        let info = get_module_info(ctx, args(json!({"module_name": "base"})))
            .await
            .expect("info");
        assert_eq!(info["installed_version"], "1.0");
    }
}
