use std::{
    collections::HashMap,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{process::Command, time};
use tracing::{error, warn};

use super::{elapsed_ms, parse_args};
use crate::{
    audit::AuditEntry,
    config_store::{ConfigStoreExt, COMMAND_MAX_TIMEOUT},
    context::ToolContext,
    error::ToolError,
    registry::{tool_def, Arguments, ToolDescriptor},
};

const EXIT_TIMED_OUT: i32 = -1;
const EXIT_SPAWN_FAILED: i32 = -2;

pub fn execute_command_def() -> ToolDescriptor {
    tool_def(
        "execute_command",
        "Execute a shell command on the host",
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The shell command to execute"},
                "working_directory": {"type": "string", "description": "Working directory for command execution"},
                "timeout": {"type": "integer", "description": "Maximum execution time in seconds (0 = configured maximum)", "default": 30},
                "env_vars": {"type": "object", "description": "Additional environment variables"}
            },
            "required": ["command"]
        }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecuteCommandArgs {
    command: String,
    #[serde(default)]
    working_directory: Option<String>,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default)]
    env_vars: HashMap<String, String>,
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Default)]
struct ShellOutcome {
    stdout: String,
    stderr: String,
    exit_code: i32,
    timed_out: bool,
}

pub async fn execute_command(ctx: ToolContext, args: Arguments) -> Result<Value, ToolError> {
    let args: ExecuteCommandArgs = parse_args("execute_command", args)?;
    ctx.check_rate_limit("command", 10, Duration::from_secs(60))?;

    let max_timeout = ctx.params().get_u64(COMMAND_MAX_TIMEOUT, 600);
    let timeout = match args.timeout {
        0 => max_timeout,
        requested => requested.min(max_timeout),
    };
    let cwd = args
        .working_directory
        .map(PathBuf::from)
        .unwrap_or_else(|| ctx.settings().working_dir.clone());

    let started = Instant::now();
    let outcome = run_shell(
        &args.command,
        &cwd,
        &args.env_vars,
        Duration::from_secs(timeout),
    )
    .await;
    let duration_ms = elapsed_ms(started);

    ctx.audit(
        AuditEntry::new("execute_command")
            .field("cmd", &args.command)
            .field("exit_code", outcome.exit_code)
            .duration_ms(duration_ms),
    )
    .await;

    Ok(json!({
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
        "exit_code": outcome.exit_code,
        "timed_out": outcome.timed_out,
        "duration_ms": duration_ms,
    }))
}

async fn run_shell(
    command: &str,
    cwd: &Path,
    env_vars: &HashMap<String, String>,
    timeout: Duration,
) -> ShellOutcome {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env_vars)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(err) => {
            error!(cwd = %cwd.display(), "Command spawn failed: {err}");
            return ShellOutcome {
                stderr: err.to_string(),
                exit_code: EXIT_SPAWN_FAILED,
                ..ShellOutcome::default()
            };
        }
    };

    match time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => ShellOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output
                .status
                .code()
                .unwrap_or_else(|| -output.status.signal().unwrap_or(1)),
            timed_out: false,
        },
        Ok(Err(err)) => {
            error!("Command execution error: {err}");
            ShellOutcome {
                stderr: err.to_string(),
                exit_code: EXIT_SPAWN_FAILED,
                ..ShellOutcome::default()
            }
        }
        Err(_) => {
            let preview = command.chars().take(50).collect::<String>();
            warn!(timeout_secs = timeout.as_secs(), "Command timed out: {preview}");
            ShellOutcome {
                exit_code: EXIT_TIMED_OUT,
                timed_out: true,
                ..ShellOutcome::default()
            }
        }
    }
}
