//! Backup agent: drains one pipe per oid into the segment data file.

use nix::fcntl::OFlag;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Agent, POLL_INTERVAL};
use crate::compression::{encoder, BoxedWriter};
use crate::filepath::per_oid_data_file;
use crate::plugin::{wait_plugin, PluginProcess};
use crate::toc::SegmentToc;
use crate::transfer::counter::CountingWriter;
use crate::transfer::progress::{format_bytes, format_speed};
use crate::utils::errors::{HelperError, Result};

/// Destination of the compressed stream: a local file or a plugin's stdin.
struct BackupSink {
    path: PathBuf,
    writer: BoxedWriter,
    written: Arc<AtomicU64>,
    plugin: Option<PluginProcess>,
}

impl BackupSink {
    async fn open(agent: &Agent, path: PathBuf) -> Result<Self> {
        let config = &agent.config;
        let (writer, written, process) = match &config.plugin {
            Some(plugin) => {
                let mut process = plugin.spawn_backup_data(&path)?;
                let stdin = process.child.stdin.take().ok_or_else(|| {
                    HelperError::Plugin("backup_data started without a stdin pipe".into())
                })?;
                let counting = CountingWriter::new(stdin);
                let written = counting.counter();
                (
                    encoder(config.compression, config.compression_level, counting),
                    written,
                    Some(process),
                )
            }
            None => {
                let file = tokio::fs::File::create(&path).await.map_err(|e| {
                    HelperError::Io(std::io::Error::new(
                        e.kind(),
                        format!("Unable to create data file {}: {}", path.display(), e),
                    ))
                })?;
                let counting = CountingWriter::new(file);
                let written = counting.counter();
                (
                    encoder(config.compression, config.compression_level, counting),
                    written,
                    None,
                )
            }
        };
        debug!(path = %path.display(), "Opened backup sink");
        Ok(Self {
            path,
            writer,
            written,
            plugin: process,
        })
    }

    /// Flushes the final compression frame and waits for the plugin, if any.
    async fn finish(mut self) -> Result<u64> {
        self.writer.shutdown().await?;
        drop(self.writer);
        if let Some(process) = self.plugin.take() {
            wait_plugin(process).await?;
        }
        let written = self.written.load(Ordering::Relaxed);
        debug!(path = %self.path.display(), bytes = written, "Closed backup sink");
        Ok(written)
    }
}

/// Opens a FIFO for reading. Blocks until the database opens the write end.
///
/// On cancellation the blocked open is woken by briefly opening the write end
/// ourselves, so no thread is left parked in `open(2)`.
pub(crate) async fn open_reader(path: &Path, cancel: &CancellationToken) -> Result<tokio::fs::File> {
    let owned = path.to_path_buf();
    let mut handle = tokio::task::spawn_blocking(move || std::fs::File::open(&owned));
    tokio::select! {
        opened = &mut handle => {
            let file = opened
                .map_err(|e| HelperError::pipe(path, e))?
                .map_err(|e| HelperError::pipe(path, e))?;
            Ok(tokio::fs::File::from_std(file))
        }
        _ = cancel.cancelled() => {
            for _ in 0..100 {
                let _ = std::fs::OpenOptions::new()
                    .write(true)
                    .custom_flags(OFlag::O_NONBLOCK.bits())
                    .open(path);
                if tokio::time::timeout(POLL_INTERVAL, &mut handle).await.is_ok() {
                    break;
                }
            }
            Err(HelperError::Interrupted)
        }
    }
}

pub async fn run_backup(agent: &Agent, oids: &[u32]) -> Result<()> {
    let config = &agent.config;
    let extension = config.compression.extension();
    let started = Instant::now();

    let mut toc = SegmentToc::new();
    let mut offset: u64 = 0;
    let mut on_disk: u64 = 0;
    let mut sink = if config.single_data_file {
        Some(BackupSink::open(agent, config.data_file.clone()).await?)
    } else {
        None
    };

    for (index, &oid) in oids.iter().enumerate() {
        agent.check_cancelled()?;
        agent.prepare_lookahead(oids, index)?;

        let pipe = agent.pipe_path(oid);
        if agent.skip_requested(oid) {
            agent.skip_oid(oid)?;
            continue;
        }
        agent.pipes.create(&pipe, oid, config.content)?;

        let mut reader = open_reader(&pipe, &agent.cancel).await?;
        agent.pipes.mark_open(&pipe);

        let mut per_oid = None;
        let target = match sink.as_mut() {
            Some(sink) => sink,
            None => {
                let path = per_oid_data_file(&config.data_file, oid, extension);
                per_oid.insert(BackupSink::open(agent, path).await?)
            }
        };

        let copied = tokio::select! {
            copied = tokio::io::copy(&mut reader, &mut target.writer) => copied?,
            _ = agent.cancel.cancelled() => return Err(HelperError::Interrupted),
        };
        drop(reader);

        toc.add_entry(oid, offset, offset + copied)?;
        debug!(oid, startbyte = offset, endbyte = offset + copied, "Backed up oid");
        offset += copied;

        if let Some(sink) = per_oid {
            on_disk += sink.finish().await?;
        }
        agent.pipes.mark_drained(&pipe);
        agent.pipes.remove(&pipe)?;
    }

    if let Some(sink) = sink {
        on_disk += sink.finish().await?;
    }
    toc.write_to_file_and_make_read_only(&config.toc_file)?;
    if let Some(plugin) = &config.plugin {
        plugin.backup_file(&config.toc_file).await?;
    }

    info!(
        content = config.content,
        "Backed up {} of table data ({} stored) at {}",
        format_bytes(offset),
        format_bytes(on_disk),
        format_speed(offset, started.elapsed())
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{config, write_into_pipe};
    use super::*;
    use crate::compression::CompressionType;
    use crate::pipe::PipeManager;
    use std::io::Read;
    use tempfile::TempDir;

    const ROW: &[u8] = b"here is some data\n";

    async fn run_with_writers(agent: Agent, oids: Vec<u32>, payloads: Vec<Vec<u8>>) -> Agent {
        let writers = {
            let base = agent.config.pipe_file.clone();
            let oids = oids.clone();
            tokio::spawn(async move {
                for (oid, data) in oids.into_iter().zip(payloads) {
                    write_into_pipe(crate::filepath::pipe_name(&base, oid), data).await;
                }
            })
        };
        run_backup(&agent, &oids).await.unwrap();
        writers.await.unwrap();
        agent
    }

    #[tokio::test]
    async fn test_backup_single_data_file_uncompressed() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), "test_data");
        let agent = Agent::new(cfg, Arc::new(PipeManager::new()), CancellationToken::new());

        let payloads = vec![ROW.to_vec(), ROW.to_vec(), ROW.to_vec()];
        let agent = run_with_writers(agent, vec![1, 2, 3], payloads).await;

        let data = std::fs::read(&agent.config.data_file).unwrap();
        assert_eq!(data, ROW.repeat(3));

        let toc = SegmentToc::read_from_file(&agent.config.toc_file).unwrap();
        assert_eq!(toc.entry(1).unwrap().startbyte, 0);
        assert_eq!(toc.entry(2).unwrap().startbyte, 18);
        assert_eq!(toc.entry(3).unwrap().startbyte, 36);
        assert_eq!(toc.entry(3).unwrap().endbyte, 54);
        assert!(agent.pipes.live_pipes().is_empty());
    }

    #[tokio::test]
    async fn test_backup_zstd_ranges_are_contiguous() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path(), "gpbackup_0_20170101010101.zst");
        cfg.compression = CompressionType::Zstd;
        cfg.compression_level = 3;
        let agent = Agent::new(cfg, Arc::new(PipeManager::new()), CancellationToken::new());

        let payloads = vec![b"1\n2\n".to_vec(), b"3\n4\n5\n".to_vec(), b"6\n".to_vec()];
        let agent = run_with_writers(agent, vec![16384, 16385, 16386], payloads.clone()).await;

        let compressed = std::fs::read(&agent.config.data_file).unwrap();
        let stream = zstd::decode_all(&compressed[..]).unwrap();
        assert_eq!(stream, payloads.concat());

        let toc = SegmentToc::read_from_file(&agent.config.toc_file).unwrap();
        let mut expected_start = 0;
        for (oid, payload) in [16384u32, 16385, 16386].iter().zip(&payloads) {
            let entry = toc.entry(*oid).unwrap();
            assert_eq!(entry.startbyte, expected_start);
            assert_eq!(entry.len(), payload.len() as u64);
            expected_start = entry.endbyte;
        }
    }

    #[tokio::test]
    async fn test_backup_per_oid_files_gzip() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path(), "gpbackup_0_20170101010101.gz");
        cfg.compression = CompressionType::Gzip;
        cfg.compression_level = 1;
        cfg.single_data_file = false;
        let agent = Agent::new(cfg, Arc::new(PipeManager::new()), CancellationToken::new());

        let payloads = vec![b"a,1\n".to_vec(), b"b,2\nc,3\n".to_vec()];
        let agent = run_with_writers(agent, vec![10, 11], payloads.clone()).await;

        for (oid, payload) in [10u32, 11].iter().zip(&payloads) {
            let path = per_oid_data_file(&agent.config.data_file, *oid, ".gz");
            let compressed = std::fs::read(path).unwrap();
            let mut decoded = Vec::new();
            flate2::read::GzDecoder::new(&compressed[..])
                .read_to_end(&mut decoded)
                .unwrap();
            assert_eq!(&decoded, payload);
        }
        assert!(!agent.config.data_file.exists());
    }

    #[tokio::test]
    async fn test_backup_honours_skip_file() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path(), "test_data");
        cfg.on_error_continue = true;
        std::fs::write(crate::filepath::skip_file_name(&cfg.pipe_file, 2), b"").unwrap();
        let agent = Agent::new(cfg, Arc::new(PipeManager::new()), CancellationToken::new());

        let base = agent.config.pipe_file.clone();
        let writers = tokio::spawn(async move {
            write_into_pipe(crate::filepath::pipe_name(&base, 1), ROW.to_vec()).await;
            write_into_pipe(crate::filepath::pipe_name(&base, 3), ROW.to_vec()).await;
        });
        run_backup(&agent, &[1, 2, 3]).await.unwrap();
        writers.await.unwrap();

        let toc = SegmentToc::read_from_file(&agent.config.toc_file).unwrap();
        assert!(toc.entry(2).is_err());
        assert_eq!(toc.entry(3).unwrap().startbyte, 18);
        assert!(!crate::filepath::pipe_name(&agent.config.pipe_file, 2).exists());
    }

    #[tokio::test]
    async fn test_backup_interrupted_while_waiting_for_writer() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), "test_data");
        let cancel = CancellationToken::new();
        let agent = Agent::new(cfg, Arc::new(PipeManager::new()), cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            cancel.cancel();
        });
        let result = run_backup(&agent, &[1, 2, 3]).await;
        canceller.await.unwrap();
        assert!(matches!(result, Err(HelperError::Interrupted)));

        super::super::cleanup(&agent.config.pipe_file, &agent.pipes, &[1, 2, 3], 1);
        assert!(agent.pipes.live_pipes().is_empty());
        assert!(!crate::filepath::pipe_name(&agent.config.pipe_file, 1).exists());
    }
}
