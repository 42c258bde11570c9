//! Restore agent: replays each oid's byte range of the backup stream into its pipe.

use nix::errno::Errno;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tracing::{debug, info, warn};

use super::{Agent, POLL_INTERVAL};
use crate::compression::{decoder, BoxedReader};
use crate::filepath::{for_content, per_oid_data_file};
use crate::plugin::{wait_plugin, PluginProcess};
use crate::toc::SegmentToc;
use crate::transfer::progress::format_bytes;
use crate::utils::errors::{HelperError, Result};

/// Decompressed view of one source data file, positioned in stream offsets.
struct ShardStream {
    reader: BoxedReader,
    position: u64,
    plugin: Option<PluginProcess>,
}

impl ShardStream {
    async fn open(agent: &Agent, path: &Path, start: u64) -> Result<Self> {
        let config = &agent.config;
        if let Some(plugin) = &config.plugin {
            let mut process = plugin.spawn_restore_data(path)?;
            let stdout = process.child.stdout.take().ok_or_else(|| {
                HelperError::Plugin("restore_data started without a stdout pipe".into())
            })?;
            return Ok(Self {
                reader: decoder(config.compression, BufReader::new(stdout)),
                position: 0,
                plugin: Some(process),
            });
        }

        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            HelperError::Io(std::io::Error::new(
                e.kind(),
                format!("Unable to open data file {}: {}", path.display(), e),
            ))
        })?;
        let mut position = 0;
        if !config.compression.is_compressed() && start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
            position = start;
        }
        Ok(Self {
            reader: decoder(config.compression, BufReader::new(file)),
            position,
            plugin: None,
        })
    }

    async fn skip_to(&mut self, start: u64) -> Result<()> {
        if start > self.position {
            let gap = start - self.position;
            let skipped =
                tokio::io::copy(&mut (&mut self.reader).take(gap), &mut tokio::io::sink()).await?;
            if skipped != gap {
                return Err(unexpected_eof(start, self.position + skipped));
            }
            self.position = start;
        }
        Ok(())
    }

    async fn finish(mut self) -> Result<()> {
        drop(self.reader);
        match self.plugin.take() {
            Some(process) => wait_plugin(process).await,
            None => Ok(()),
        }
    }
}

fn unexpected_eof(wanted: u64, got: u64) -> HelperError {
    HelperError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("data stream ended at byte {}, expected at least {}", got, wanted),
    ))
}

/// Copies exactly `len` bytes or fails.
async fn copy_exact<R, W>(reader: &mut R, len: u64, writer: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader.take(len), writer).await?;
    if copied != len {
        return Err(unexpected_eof(len, copied));
    }
    Ok(copied)
}

/// Backup data produced by one source segment.
enum ShardSource {
    /// Single data file addressed through the segment TOC.
    Packed {
        path: PathBuf,
        toc: SegmentToc,
        stream: Option<ShardStream>,
    },
    /// One data file per oid.
    PerOid { data_file: PathBuf },
}

impl ShardSource {
    fn load(agent: &Agent, source_content: i32) -> Result<Self> {
        let config = &agent.config;
        let data_file = for_content(&config.data_file, config.content, source_content);
        if !config.single_data_file {
            return Ok(ShardSource::PerOid { data_file });
        }
        let toc_file = for_content(&config.toc_file, config.content, source_content);
        let toc = SegmentToc::read_from_file(&toc_file)?;
        debug!(
            source = source_content,
            entries = toc.dataentries.len(),
            "Loaded segment TOC {}",
            toc_file.display()
        );
        Ok(ShardSource::Packed {
            path: data_file,
            toc,
            stream: None,
        })
    }

    /// Forgets the open stream; its position is unknown after a failed copy.
    fn reset(&mut self) {
        if let ShardSource::Packed { stream, .. } = self {
            *stream = None;
        }
    }

    async fn copy_oid<W>(&mut self, agent: &Agent, oid: u32, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        match self {
            ShardSource::Packed { path, toc, stream } => {
                let entry = toc.entry(oid)?;
                let seekable = agent.config.plugin.is_none() && !agent.config.compression.is_compressed();
                let reopen = match stream {
                    Some(s) => entry.startbyte < s.position || (seekable && entry.startbyte != s.position),
                    None => true,
                };
                if reopen {
                    *stream = Some(ShardStream::open(agent, path, entry.startbyte).await?);
                }
                let s = stream
                    .as_mut()
                    .ok_or_else(|| HelperError::Toc(format!("no data stream open for oid {}", oid)))?;
                s.skip_to(entry.startbyte).await?;
                let copied = copy_exact(&mut s.reader, entry.len(), writer).await?;
                s.position = entry.endbyte;
                Ok(copied)
            }
            ShardSource::PerOid { data_file } => {
                let path = per_oid_data_file(data_file, oid, agent.config.compression.extension());
                let mut stream = ShardStream::open(agent, &path, 0).await?;
                let copied = tokio::io::copy(&mut stream.reader, writer).await?;
                stream.finish().await?;
                Ok(copied)
            }
        }
    }

    async fn finish(self) -> Result<()> {
        match self {
            ShardSource::Packed {
                stream: Some(stream),
                ..
            } => stream.finish().await,
            _ => Ok(()),
        }
    }
}

/// Opens a FIFO for writing once the database has opened the read end.
///
/// Returns `None` if a skip-file for `oid` shows up while waiting.
async fn open_writer(agent: &Agent, path: &Path, oid: u32) -> Result<Option<pipe::Sender>> {
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(Some(sender)),
            Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {}
            Err(e) => return Err(HelperError::pipe(path, e)),
        }
        if agent.skip_requested(oid) {
            return Ok(None);
        }
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = agent.cancel.cancelled() => return Err(HelperError::Interrupted),
        }
    }
}

enum OidOutcome {
    Restored(u64),
    Skipped,
}

async fn restore_oid(agent: &Agent, oid: u32, sources: &mut [Option<ShardSource>]) -> Result<OidOutcome> {
    let mut total = 0;
    for (batch, source) in sources.iter_mut().enumerate() {
        let pipe = agent.batch_pipe_path(oid, batch);
        agent.pipes.create(&pipe, oid, agent.config.content)?;

        let mut writer = match open_writer(agent, &pipe, oid).await? {
            Some(writer) => writer,
            None => {
                agent.skip_oid(oid)?;
                return Ok(OidOutcome::Skipped);
            }
        };
        agent.pipes.mark_open(&pipe);

        if let Some(source) = source {
            let copied = tokio::select! {
                copied = source.copy_oid(agent, oid, &mut writer) => copied?,
                _ = agent.cancel.cancelled() => return Err(HelperError::Interrupted),
            };
            total += copied;
        }
        writer.shutdown().await?;
        drop(writer);

        agent.pipes.mark_drained(&pipe);
        agent.pipes.remove(&pipe)?;
    }
    Ok(OidOutcome::Restored(total))
}

pub async fn run_restore(agent: &Agent, oids: &[u32]) -> Result<()> {
    let config = &agent.config;
    let plan = match config.resize {
        Some(plan) => plan.sources_for(config.content),
        None => vec![Some(config.content)],
    };

    // Every TOC is validated before the first oid is served.
    let mut sources = plan
        .iter()
        .map(|source| source.map(|c| ShardSource::load(agent, c)).transpose())
        .collect::<Result<Vec<_>>>()?;

    let mut restored_bytes = 0;
    let mut failed = 0usize;
    for (index, &oid) in oids.iter().enumerate() {
        agent.check_cancelled()?;
        agent.prepare_lookahead(oids, index)?;

        if agent.skip_requested(oid) {
            agent.skip_oid(oid)?;
            continue;
        }

        match restore_oid(agent, oid, &mut sources).await {
            Ok(OidOutcome::Restored(bytes)) => {
                debug!(oid, bytes, "Restored oid");
                restored_bytes += bytes;
            }
            Ok(OidOutcome::Skipped) => {}
            Err(HelperError::Interrupted) => return Err(HelperError::Interrupted),
            Err(e) if config.on_error_continue => {
                warn!(oid, content = config.content, "Error restoring oid, continuing: {}", e);
                failed += 1;
                for batch in 0..agent.batches() {
                    let _ = agent.pipes.remove(&agent.batch_pipe_path(oid, batch));
                }
                sources.iter_mut().flatten().for_each(ShardSource::reset);
            }
            Err(e) => return Err(e),
        }
    }

    for source in sources.into_iter().flatten() {
        source.finish().await?;
    }
    info!(
        content = config.content,
        "Restored {} of table data for {} oids ({} failed)",
        format_bytes(restored_bytes),
        oids.len(),
        failed
    );
    Ok(())
}
