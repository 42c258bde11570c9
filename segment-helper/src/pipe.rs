//! Named pipe registry for one helper process.
//!
//! Every pipe the helper creates or adopts is tracked here so that an error
//! or a signal can remove all of them. A pipe name is bound to one oid for
//! the lifetime of the registry and is never handed out again once removed.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

use crate::utils::errors::{HelperError, Result};

pub const PIPE_MODE: u32 = 0o700;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Created,
    Open,
    Drained,
    Removed,
}

#[derive(Debug, Clone)]
pub struct PipeRecord {
    pub oid: u32,
    pub content: i32,
    pub path: PathBuf,
    pub state: PipeState,
}

#[derive(Debug, Default)]
pub struct PipeManager {
    pipes: DashMap<PathBuf, PipeRecord>,
    created: AtomicUsize,
}

impl PipeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the FIFO for `oid`, or accepts an existing FIFO of the same name and mode.
    pub fn create(&self, path: &Path, oid: u32, content: i32) -> Result<()> {
        match self.pipes.entry(path.to_path_buf()) {
            Entry::Occupied(entry) => {
                let record = entry.get();
                if record.oid != oid {
                    return Err(HelperError::pipe(
                        path,
                        format!("already bound to oid {}, refusing oid {}", record.oid, oid),
                    ));
                }
                if record.state == PipeState::Removed {
                    return Err(HelperError::pipe(path, "pipe was already removed"));
                }
                Ok(())
            }
            Entry::Vacant(entry) => {
                make_fifo(path)?;
                self.created.fetch_add(1, Ordering::SeqCst);
                debug!(path = %path.display(), oid, content, "Created pipe");
                entry.insert(PipeRecord {
                    oid,
                    content,
                    path: path.to_path_buf(),
                    state: PipeState::Created,
                });
                Ok(())
            }
        }
    }

    fn set_state(&self, path: &Path, state: PipeState) {
        if let Some(mut record) = self.pipes.get_mut(path) {
            record.state = state;
        }
    }

    pub fn mark_open(&self, path: &Path) {
        self.set_state(path, PipeState::Open);
    }

    pub fn mark_drained(&self, path: &Path) {
        self.set_state(path, PipeState::Drained);
    }

    pub fn state(&self, path: &Path) -> Option<PipeState> {
        self.pipes.get(path).map(|r| r.state)
    }

    /// Unlinks the pipe. Removing a pipe that is already gone is not an error.
    pub fn remove(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed pipe"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(HelperError::pipe(path, e)),
        }
        self.set_state(path, PipeState::Removed);
        Ok(())
    }

    /// Best-effort removal of every pipe still on disk.
    pub fn remove_all(&self) {
        for path in self.live_pipes() {
            if let Err(e) = self.remove(&path) {
                warn!("Failed to remove pipe during cleanup: {}", e);
            }
        }
    }

    pub fn live_pipes(&self) -> Vec<PathBuf> {
        self.pipes
            .iter()
            .filter(|r| r.state != PipeState::Removed)
            .map(|r| r.path.clone())
            .collect()
    }

    /// Number of FIFOs this registry created or adopted.
    #[cfg(test)]
    pub(crate) fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

fn make_fifo(path: &Path) -> Result<()> {
    match nix::unistd::mkfifo(path, Mode::from_bits_truncate(PIPE_MODE)) {
        Ok(()) => {
            // mkfifo honours the umask; force the documented mode.
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(PIPE_MODE))
                .map_err(|e| HelperError::pipe(path, e))
        }
        Err(Errno::EEXIST) => {
            let meta = std::fs::metadata(path).map_err(|e| HelperError::pipe(path, e))?;
            if !meta.file_type().is_fifo() {
                return Err(HelperError::pipe(path, "exists and is not a named pipe"));
            }
            if meta.permissions().mode() & 0o777 != PIPE_MODE {
                return Err(HelperError::pipe(
                    path,
                    format!(
                        "exists with mode {:o}, expected {:o}",
                        meta.permissions().mode() & 0o777,
                        PIPE_MODE
                    ),
                ));
            }
            Ok(())
        }
        Err(e) => Err(HelperError::pipe(path, e)),
    }
}
