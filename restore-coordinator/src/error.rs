use segment_helper::HelperError;

#[derive(thiserror::Error, Debug)]
pub enum RestoreError {
    #[error("Invalid backup manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid timestamp {0:?}: expected 14 digits in the format YYYYMMDDHHMMSS")]
    InvalidTimestamp(String),

    #[error("Plugin unavailable: {0}")]
    PluginUnavailable(String),

    #[error("Pipe setup failed: {0}")]
    PipeSetup(String),

    #[error("Error loading data into table {table}: {message}")]
    CopyFailed { table: String, message: String },

    #[error("Expected to restore {expected} rows to table {table}, but restored {actual} instead")]
    RowCountMismatch {
        table: String,
        expected: i64,
        actual: i64,
    },

    #[error("{0}")]
    HelperError(String),

    #[error("Restore interrupted")]
    Interrupted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{message}")]
    Database {
        message: String,
        context: Option<String>,
    },

    #[error("Command failed on host {host}: {message}")]
    Remote { host: String, message: String },
}

impl RestoreError {
    /// Whether the error concerns a single table and may be recorded under
    /// `on-error-continue` instead of aborting the run.
    pub fn is_per_table(&self) -> bool {
        matches!(
            self,
            RestoreError::PipeSetup(_)
                | RestoreError::CopyFailed { .. }
                | RestoreError::RowCountMismatch { .. }
                | RestoreError::HelperError(_)
                | RestoreError::Database { .. }
        )
    }

    /// Re-labels a database failure raised by `COPY` for `table`.
    ///
    /// The `CONTEXT` line reported by the segment is kept in front of the
    /// message since it names the failing row.
    pub fn into_copy_failure(self, table: &str) -> Self {
        match self {
            RestoreError::Database { message, context } => RestoreError::CopyFailed {
                table: table.to_string(),
                message: match context {
                    Some(context) if !context.is_empty() => format!("{}: {}", context, message),
                    _ => message,
                },
            },
            other => other,
        }
    }
}

impl From<HelperError> for RestoreError {
    fn from(e: HelperError) -> Self {
        match e {
            HelperError::InvalidTimestamp(ts) => RestoreError::InvalidTimestamp(ts),
            HelperError::Io(err) => RestoreError::Io(err),
            HelperError::Yaml(err) => RestoreError::Yaml(err),
            HelperError::PipeSetup { .. } => RestoreError::PipeSetup(e.to_string()),
            HelperError::Plugin(msg) | HelperError::PluginUnavailable(msg) => {
                RestoreError::PluginUnavailable(msg)
            }
            HelperError::Toc(msg) => RestoreError::InvalidManifest(msg),
            HelperError::Interrupted => RestoreError::Interrupted,
            HelperError::Config(_) => RestoreError::Config(e.to_string()),
        }
    }
}

impl From<tokio_postgres::Error> for RestoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        match e.as_db_error() {
            Some(db) => RestoreError::Database {
                message: format!("ERROR: {} (SQLSTATE {})", db.message(), db.code().code()),
                context: db.where_().map(str::to_string),
            },
            None => RestoreError::Database {
                message: e.to_string(),
                context: None,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;
