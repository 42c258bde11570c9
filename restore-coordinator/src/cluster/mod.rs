//! Cluster membership and remote command execution on segment hosts.

pub mod local;
pub mod ssh;

use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{AppConfig, ExecMode, SegmentConfig};
use crate::error::{RestoreError, Result};
use segment_helper::filepath::COORDINATOR_CONTENT;

pub use local::LocalExecutor;
pub use ssh::SshExecutor;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub host: String,
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs shell commands and writes files on a named host.
#[async_trait]
pub trait ClusterExecutor: Send + Sync {
    async fn run(&self, host: &str, command: &str) -> Result<CommandOutput>;

    async fn write_file(&self, host: &str, path: &Path, contents: &[u8]) -> Result<()>;
}

pub fn executor_for(config: &AppConfig) -> Arc<dyn ClusterExecutor> {
    match config.cluster.exec_mode {
        ExecMode::Local => Arc::new(LocalExecutor),
        ExecMode::Ssh => Arc::new(SshExecutor::new(
            config
                .cluster
                .ssh_user
                .clone()
                .unwrap_or_else(|| config.database.user.clone()),
            config.cluster.ssh_port,
            config.cluster.ssh_identity_file.clone(),
        )),
    }
}

pub struct Cluster {
    segments: Vec<SegmentConfig>,
    executor: Arc<dyn ClusterExecutor>,
}

impl Cluster {
    pub fn new(segments: Vec<SegmentConfig>, executor: Arc<dyn ClusterExecutor>) -> Self {
        let mut segments = segments;
        segments.sort_by_key(|s| s.content_id);
        Self { segments, executor }
    }

    pub fn executor(&self) -> &Arc<dyn ClusterExecutor> {
        &self.executor
    }

    /// Primary segments in content-id order, the coordinator excluded.
    pub fn primaries(&self) -> impl Iterator<Item = &SegmentConfig> {
        self.segments.iter().filter(|s| s.content_id >= 0)
    }

    pub fn coordinator(&self) -> Option<&SegmentConfig> {
        self.segments
            .iter()
            .find(|s| s.content_id == COORDINATOR_CONTENT)
    }

    pub fn content_ids(&self) -> Vec<i32> {
        self.primaries().map(|s| s.content_id).collect()
    }

    /// Distinct segment hosts in content-id order of first appearance.
    pub fn segment_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for seg in self.primaries() {
            if !hosts.contains(&seg.hostname) {
                hosts.push(seg.hostname.clone());
            }
        }
        hosts
    }

    pub fn seg_dir_map(&self) -> BTreeMap<i32, PathBuf> {
        self.segments
            .iter()
            .map(|s| (s.content_id, s.data_dir.clone()))
            .collect()
    }

    pub fn segment(&self, content: i32) -> Option<&SegmentConfig> {
        self.segments.iter().find(|s| s.content_id == content)
    }

    /// Runs one command per primary segment concurrently.
    pub async fn run_on_segments<F>(&self, command_for: F) -> Vec<(i32, Result<CommandOutput>)>
    where
        F: Fn(&SegmentConfig) -> String,
    {
        let futures = self.primaries().map(|seg| {
            let command = command_for(seg);
            let executor = self.executor.clone();
            let host = seg.hostname.clone();
            let content = seg.content_id;
            async move { (content, executor.run(&host, &command).await) }
        });
        join_all(futures).await
    }

    /// Runs one command per distinct segment host concurrently.
    pub async fn run_on_hosts<F>(&self, command_for: F) -> Vec<(String, Result<CommandOutput>)>
    where
        F: Fn(&str) -> String,
    {
        let futures = self.segment_hosts().into_iter().map(|host| {
            let command = command_for(&host);
            let executor = self.executor.clone();
            async move {
                let result = executor.run(&host, &command).await;
                (host, result)
            }
        });
        join_all(futures).await
    }

    /// Writes one file per primary segment concurrently.
    pub async fn write_on_segments<F>(&self, file_for: F) -> Result<()>
    where
        F: Fn(&SegmentConfig) -> (PathBuf, Vec<u8>),
    {
        let futures = self.primaries().map(|seg| {
            let (path, contents) = file_for(seg);
            let executor = self.executor.clone();
            let host = seg.hostname.clone();
            async move { executor.write_file(&host, &path, &contents).await }
        });
        join_all(futures).await.into_iter().collect()
    }
}

/// Collapses per-target results into the outputs, failing on the first
/// target whose command could not run or exited non-zero.
pub fn check_outputs<K: std::fmt::Display>(
    results: Vec<(K, Result<CommandOutput>)>,
    what: &str,
) -> Result<Vec<CommandOutput>> {
    let mut outputs = Vec::with_capacity(results.len());
    for (target, result) in results {
        let output = result?;
        if !output.success() {
            let detail = if output.stderr.trim().is_empty() {
                format!("exit status {}", output.status)
            } else {
                output.stderr.trim().to_string()
            };
            return Err(RestoreError::Remote {
                host: output.host.clone(),
                message: format!("{} failed for {}: {}", what, target, detail),
            });
        }
        outputs.push(output);
    }
    Ok(outputs)
}

/// Single-quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
