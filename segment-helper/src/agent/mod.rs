//! Per-segment agent loops.
//!
//! The helper services the oids of its oid-list strictly in order, one pipe
//! at a time. The coordinator talks to it only through the filesystem:
//! skip-files ask it to abandon an oid, the error-file reports that it gave up.

pub mod backup;
pub mod restore;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentMode, HelperConfig};
use crate::filepath::{error_file_name, pipe_name, pipe_name_for_batch, skip_file_name};
use crate::pipe::PipeManager;
use crate::utils::errors::{HelperError, Result};

/// How often a blocked pipe open re-checks for skip-files and cancellation.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Agent {
    pub config: HelperConfig,
    pub pipes: Arc<PipeManager>,
    pub cancel: CancellationToken,
}

impl Agent {
    pub fn new(config: HelperConfig, pipes: Arc<PipeManager>, cancel: CancellationToken) -> Self {
        Self {
            config,
            pipes,
            cancel,
        }
    }

    /// COPY passes per oid: more than one only when restoring onto fewer segments.
    pub fn batches(&self) -> usize {
        self.config.resize.map(|r| r.batches()).unwrap_or(1)
    }

    pub fn pipe_path(&self, oid: u32) -> PathBuf {
        pipe_name(&self.config.pipe_file, oid)
    }

    pub fn batch_pipe_path(&self, oid: u32, batch: usize) -> PathBuf {
        pipe_name_for_batch(&self.config.pipe_file, oid, batch, self.batches())
    }

    /// True when the coordinator has placed a skip-file for `oid`.
    ///
    /// Skip-files are only honoured in on-error-continue mode.
    pub fn skip_requested(&self, oid: u32) -> bool {
        self.config.on_error_continue && skip_file_name(&self.config.pipe_file, oid).exists()
    }

    /// Drops every trace of `oid`: its pipes and the skip-file that asked for it.
    pub fn skip_oid(&self, oid: u32) -> Result<()> {
        info!(oid, content = self.config.content, "Skip file found, skipping oid");
        for batch in 0..self.batches() {
            self.pipes.remove(&self.batch_pipe_path(oid, batch))?;
        }
        let skip_file = skip_file_name(&self.config.pipe_file, oid);
        if let Err(e) = std::fs::remove_file(&skip_file) {
            debug!("Could not remove skip file {}: {}", skip_file.display(), e);
        }
        Ok(())
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(HelperError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Creates pipes for the next `copy_queue_size` oids after `index`.
    pub fn prepare_lookahead(&self, oids: &[u32], index: usize) -> Result<()> {
        for oid in oids.iter().skip(index + 1).take(self.config.copy_queue_size) {
            self.pipes
                .create(&self.batch_pipe_path(*oid, 0), *oid, self.config.content)?;
        }
        Ok(())
    }
}

/// Reads an oid-list file: one unsigned oid per line, blank lines ignored.
pub fn read_oid_list(path: &Path) -> Result<Vec<u32>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        HelperError::Config(format!("Unable to read oid list {}: {}", path.display(), e))
    })?;
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            l.parse::<u32>()
                .map_err(|_| HelperError::Config(format!("invalid oid {:?} in {}", l, path.display())))
        })
        .collect()
}

pub fn write_oid_list(path: &Path, oids: &[u32]) -> std::io::Result<()> {
    let mut contents = String::with_capacity(oids.len() * 8);
    for oid in oids {
        contents.push_str(&oid.to_string());
        contents.push('\n');
    }
    std::fs::write(path, contents)
}

/// Leaves the error sentinel for the coordinator. Failures are only logged.
pub fn write_error_file(pipe_base: &Path) {
    let path = error_file_name(pipe_base);
    match std::fs::File::create(&path) {
        Ok(_) => debug!("Wrote error file {}", path.display()),
        Err(e) => warn!("Unable to write error file {}: {}", path.display(), e),
    }
}

/// Removes every pipe the helper created or was handed through the oid list.
pub fn cleanup(pipe_base: &Path, pipes: &PipeManager, oids: &[u32], batches: usize) {
    pipes.remove_all();
    for oid in oids {
        for batch in 0..batches.max(1) {
            let path = pipe_name_for_batch(pipe_base, *oid, batch, batches);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed pipe {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Unable to remove pipe {}: {}", path.display(), e),
            }
        }
    }
}

/// Runs the agent loop for the configured mode over `oids`.
pub async fn run(agent: &Agent, oids: &[u32]) -> Result<()> {
    info!(
        content = agent.config.content,
        oids = oids.len(),
        compression = %agent.config.compression,
        "Starting {} agent",
        match agent.config.mode {
            AgentMode::Backup => "backup",
            AgentMode::Restore => "restore",
        }
    );
    match agent.config.mode {
        AgentMode::Backup => backup::run_backup(agent, oids).await,
        AgentMode::Restore => restore::run_restore(agent, oids).await,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_oid_list_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oids");
        write_oid_list(&path, &[16384, 16390, 3]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "16384\n16390\n3\n");
        assert_eq!(read_oid_list(&path).unwrap(), vec![16384, 16390, 3]);

        std::fs::write(&path, "1\n\nx\n").unwrap();
        assert!(matches!(read_oid_list(&path), Err(HelperError::Config(_))));
    }

    #[test]
    fn test_skip_only_honoured_with_on_error_continue() {
        let dir = TempDir::new().unwrap();
        let mut config = test_support::config(dir.path(), "data");
        std::fs::write(skip_file_name(&config.pipe_file, 7), b"").unwrap();

        let agent = Agent::new(config.clone(), Arc::new(PipeManager::new()), CancellationToken::new());
        assert!(!agent.skip_requested(7));

        config.on_error_continue = true;
        let agent = Agent::new(config, Arc::new(PipeManager::new()), CancellationToken::new());
        assert!(agent.skip_requested(7));
        agent.skip_oid(7).unwrap();
        assert!(!agent.skip_requested(7));
    }

    #[test]
    fn test_cleanup_removes_listed_pipes() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("test_pipe");
        let pipes = PipeManager::new();
        pipes.create(&pipe_name(&base, 1), 1, 0).unwrap();
        nix::unistd::mkfifo(&pipe_name(&base, 2), nix::sys::stat::Mode::S_IRWXU).unwrap();

        write_error_file(&base);
        cleanup(&base, &pipes, &[1, 2, 3], 1);

        assert!(error_file_name(&base).exists());
        assert!(!pipe_name(&base, 1).exists());
        assert!(!pipe_name(&base, 2).exists());
    }
}
