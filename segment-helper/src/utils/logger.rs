//! Logging configuration using tracing.
//!
//! The helper never logs to stdout: when a plugin is driven through a pipe,
//! stdout may belong to the data stream.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging to stderr at the specified level, also appending to
/// `log_file` when one is given.
pub fn init(level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    build_subscriber(level, log_file, std::io::stderr)?.try_init()?;
    Ok(())
}

fn build_subscriber<W>(
    level: &str,
    log_file: Option<&Path>,
    console: W,
) -> anyhow::Result<impl Subscriber + Send + Sync + 'static>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(console))
        .with(file_layer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_log_file_keeps_console_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gpAdminLogs").join("gpbackup_helper_20170101.log");
        let console = Captured::default();
        let sink = console.clone();

        let subscriber = build_subscriber("info", Some(&path), move || sink.clone()).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(oid = 16384, "Restored oid");
        });

        let printed = String::from_utf8(console.0.lock().unwrap().clone()).unwrap();
        assert!(printed.contains("Restored oid"));
        let logged = std::fs::read_to_string(&path).unwrap();
        assert!(logged.contains("Restored oid"));
        assert!(logged.contains("oid=16384"));
    }
}
