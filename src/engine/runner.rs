//! Process-backed command runner
//!
//! Spawns the pool and dataset tools through `tokio::process` and captures
//! both output streams. A command that exits non-zero is not an error at this
//! layer; callers inspect [`CommandOutput::success`] and decide.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::domain::ports::{CommandOutput, CommandRunner};
use crate::error::{Error, Result};

/// Runs commands on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct RealRunner;

impl RealRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for RealRunner {
    async fn run(&self, tool: &str, args: &[String]) -> Result<CommandOutput> {
        trace!(tool, args = ?args, "Running command");

        let output = Command::new(tool)
            .args(args)
            .kill_on_drop(false)
            .output()
            .await
            .map_err(|e| Error::EngineUnavailable(format!("failed to run {}: {}", tool, e)))?;

        let mut combined = output.stdout.clone();
        combined.extend_from_slice(&output.stderr);

        debug!(
            tool,
            args = ?args,
            code = ?output.status.code(),
            "Command finished"
        );

        Ok(CommandOutput {
            combined,
            stdout: output.stdout,
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}
