//! Error types for the segment helper.
//!
//! Every variant maps onto one of the helper's process exit codes so the
//! coordinator can tell configuration problems from I/O and plugin failures.

use thiserror::Error;

/// Exit code for a successful run.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for bad arguments, oid lists or TOC files.
pub const EXIT_CONFIG: i32 = 2;
/// Exit code for pipe and data file failures.
pub const EXIT_IO: i32 = 3;
/// Exit code for plugin invocation failures.
pub const EXIT_PLUGIN: i32 = 4;
/// Exit code after SIGINT/SIGTERM.
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid timestamp {0:?}: expected 14 digits in the format YYYYMMDDHHMMSS")]
    InvalidTimestamp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pipe setup failed for {path}: {reason}")]
    PipeSetup { path: String, reason: String },

    #[error("TOC error: {0}")]
    Toc(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Plugin unavailable: {0}")]
    PluginUnavailable(String),

    #[error("Interrupted")]
    Interrupted,
}

impl HelperError {
    /// Process exit code reported by `gpbackup_helper` for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            HelperError::Config(_) | HelperError::InvalidTimestamp(_) | HelperError::Toc(_) => {
                EXIT_CONFIG
            }
            HelperError::Yaml(_) => EXIT_CONFIG,
            HelperError::Io(_) | HelperError::PipeSetup { .. } => EXIT_IO,
            HelperError::Plugin(_) | HelperError::PluginUnavailable(_) => EXIT_PLUGIN,
            HelperError::Interrupted => EXIT_INTERRUPTED,
        }
    }

    pub(crate) fn pipe(path: &std::path::Path, reason: impl ToString) -> Self {
        HelperError::PipeSetup {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HelperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(HelperError::Config("bad".into()).exit_code(), EXIT_CONFIG);
        assert_eq!(HelperError::InvalidTimestamp("1".into()).exit_code(), EXIT_CONFIG);
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(HelperError::Io(io).exit_code(), EXIT_IO);
        assert_eq!(HelperError::Plugin("boom".into()).exit_code(), EXIT_PLUGIN);
        assert_eq!(HelperError::Interrupted.exit_code(), EXIT_INTERRUPTED);
    }
}
