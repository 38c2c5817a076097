mod database;
mod filesystem;
mod host;
mod modules;
mod receiver;
mod terminal;

use std::time::Instant;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    error::ToolError,
    registry::{Arguments, ToolRegistry},
};

pub(crate) use database::get_db_schema;
pub(crate) use host::{read_config, service_status};
pub(crate) use modules::list_modules;

pub fn build_registry() -> Result<ToolRegistry> {
    ToolRegistry::builder()
        .register(terminal::execute_command_def(), terminal::execute_command)
        .register(database::query_database_def(), database::query_database)
        .register(database::execute_sql_def(), database::execute_sql)
        .register(database::get_db_schema_def(), database::get_db_schema)
        .register(filesystem::read_file_def(), filesystem::read_file)
        .register(filesystem::write_file_def(), filesystem::write_file)
        .register(host::run_script_def(), host::run_script)
        .register(host::service_status_def(), host::service_status)
        .register(host::read_config_def(), host::read_config)
        .register(modules::list_modules_def(), modules::list_modules)
        .register(modules::get_module_info_def(), modules::get_module_info)
        .register(modules::install_module_def(), modules::install_module)
        .register(modules::upgrade_module_def(), modules::upgrade_module)
        .register(receiver::register_receiver_def(), receiver::register_receiver)
        .build()
}

fn parse_args<T: DeserializeOwned>(tool: &str, args: Arguments) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args))
        .map_err(|err| ToolError::invalid(format!("Invalid arguments for {tool}: {err}")))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn to_value<T: serde::Serialize>(result: T) -> Result<Value, ToolError> {
    serde_json::to_value(result)
        .map_err(|err| ToolError::failed(format!("Failed to encode result: {err}")))
}
