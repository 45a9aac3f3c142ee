//! Pool engine client
//!
//! Wraps the node's pool tool (`zpool`) and dataset tool (`zfs`):
//! - [`builder`]: argv construction for every command
//! - [`parser`]: parsing of their text and JSON output
//! - [`pool`]: pool lifecycle and queries, serialized through the gate
//! - [`replica`]: replica dataset lifecycle and queries
//! - [`runner`]: the process-backed [`CommandRunner`]

pub mod builder;
pub mod parser;
pub mod pool;
pub mod replica;
pub mod runner;

#[cfg(test)]
pub(crate) mod fake;

pub use pool::{CreateOutcome, PoolEngine};
pub use replica::ReplicaEngine;
pub use runner::RealRunner;

use crate::domain::ports::{CommandOutput, CommandRunner};
use crate::error::{Error, Result};
use crate::telemetry;

/// Run one command and count it. Non-zero exits are returned as output.
pub(crate) async fn execute(
    runner: &dyn CommandRunner,
    tool: &str,
    args: &[String],
) -> Result<CommandOutput> {
    let verb = args.first().map(String::as_str).unwrap_or("");
    match runner.run(tool, args).await {
        Ok(output) => {
            telemetry::record_engine_command(tool, verb, output.success);
            Ok(output)
        }
        Err(e) => {
            telemetry::record_engine_command(tool, verb, false);
            Err(e)
        }
    }
}

/// Error for a command that exited non-zero
pub(crate) fn command_failed(tool: &str, args: &[String], output: &CommandOutput) -> Error {
    Error::CommandFailed {
        tool: tool.to_string(),
        args: args.join(" "),
        output: output.combined_str().trim().to_string(),
    }
}

/// Run a command and fail on a non-zero exit
pub(crate) async fn execute_checked(
    runner: &dyn CommandRunner,
    tool: &str,
    args: &[String],
) -> Result<CommandOutput> {
    let output = execute(runner, tool, args).await?;
    if !output.success {
        return Err(command_failed(tool, args, &output));
    }
    Ok(output)
}
