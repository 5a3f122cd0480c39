//! Execution of platform CLI commands.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::CfConfig;
use crate::error::{Result, ToolsError};

/// Runs platform CLI commands and returns their output split into lines.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command and echo its output to the terminal.
    async fn run(&self, args: &[&str]) -> Result<Vec<String>>;

    /// Run a command without terminal output.
    async fn run_quiet(&self, args: &[&str]) -> Result<Vec<String>>;
}

/// [`CommandRunner`] backed by the `cf` executable.
#[derive(Debug, Clone)]
pub struct CfCli {
    binary: PathBuf,
}

impl CfCli {
    pub fn new(config: &CfConfig) -> Self {
        Self {
            binary: config.binary.clone(),
        }
    }

    async fn exec(&self, args: &[&str], echo: bool) -> Result<Vec<String>> {
        let subcommand = args.first().copied().unwrap_or_default();
        debug!("Running cf {}", subcommand);

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ToolsError::command(format!("failed to execute {}", self.binary.display()), e)
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if echo {
            print!("{}", stdout);
            eprint!("{}", stderr);
        }

        if !output.status.success() {
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(ToolsError::command(
                format!("cf {} exited with {}", subcommand, output.status),
                detail,
            ));
        }

        Ok(stdout.lines().map(str::to_string).collect())
    }
}

#[async_trait]
impl CommandRunner for CfCli {
    async fn run(&self, args: &[&str]) -> Result<Vec<String>> {
        self.exec(args, true).await
    }

    async fn run_quiet(&self, args: &[&str]) -> Result<Vec<String>> {
        self.exec(args, false).await
    }
}
