use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{ClusterExecutor, CommandOutput};
use crate::error::Result;

/// Runs every command on this machine, ignoring the host name.
///
/// Used for single-host clusters and demo setups where all segments share
/// the coordinator's filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

#[async_trait]
impl ClusterExecutor for LocalExecutor {
    async fn run(&self, host: &str, command: &str) -> Result<CommandOutput> {
        debug!(host, "Running {}", command);
        let output = Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            host: host.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }

    async fn write_file(&self, _host: &str, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }
}
