//! Built-in work functions available to job files.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use frost_resilience::BoxError;
use frost_scheduler::FunctionRegistry;

/// Errors from the `command` function.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid command arguments: {0}")]
    InvalidArgs(#[from] serde_json::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {code}: {stderr}")]
    Exited {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("{program} was terminated by a signal")]
    Terminated { program: String },
}

/// Arguments accepted by the `command` function.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandArgs {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// Registry holding every built-in function.
pub fn builtin_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register_fn("log", |args| async move { log(args) })
        .register_fn("command", |args| async move {
            command(args).await.map_err(BoxError::from)
        });
    registry
}

/// Log the job's arguments and echo them back.
fn log(args: Value) -> Result<Value, BoxError> {
    let message = args
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| args.to_string());
    info!(message = %message, "log job");
    Ok(args)
}

/// Run a process to completion. A non-zero exit is an error.
pub async fn command(args: Value) -> Result<Value, CommandError> {
    let spec: CommandArgs = serde_json::from_value(args)?;
    debug!(program = %spec.program, args = ?spec.args, "running command");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args).kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let output = cmd.output().await.map_err(|source| CommandError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

    match output.status.code() {
        Some(0) => Ok(json!({ "status": 0, "stdout": stdout, "stderr": stderr })),
        Some(code) => Err(CommandError::Exited {
            program: spec.program,
            code,
            stderr,
        }),
        None => Err(CommandError::Terminated {
            program: spec.program,
        }),
    }
}
