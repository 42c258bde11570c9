//! Coordinator side of the segment helper control channel.
//!
//! The coordinator never talks to a helper directly. It writes the oid list
//! and a launch script into each segment data directory, creates the first
//! pipes, and afterwards communicates only through skip-files and the error
//! file that sit next to the pipes.

use dashmap::DashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cluster::{check_outputs, shell_quote, Cluster};
use crate::error::{RestoreError, Result};
use segment_helper::compression::CompressionType;
use segment_helper::filepath::{
    copy_pipe_path, error_file_name, pipe_name_for_batch, skip_file_name, FilePathInfo,
};
use segment_helper::resize::ResizePlan;
use segment_helper::HelperArgs;

/// Launch settings shared by every helper of one restore.
#[derive(Debug, Clone)]
pub struct HelperOptions {
    pub helper_path: String,
    pub compression: CompressionType,
    pub single_data_file: bool,
    pub on_error_continue: bool,
    pub resize: Option<ResizePlan>,
    pub copy_queue_size: usize,
    /// Per-host copy of the plugin config, identical path on every host.
    pub plugin_config: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
}

pub struct SegmentHelpers {
    cluster: Arc<Cluster>,
    fp_info: FilePathInfo,
    options: HelperOptions,
    created_pipes: DashSet<String>,
}

impl SegmentHelpers {
    pub fn new(cluster: Arc<Cluster>, fp_info: FilePathInfo, options: HelperOptions) -> Self {
        Self {
            cluster,
            fp_info,
            options,
            created_pipes: DashSet::new(),
        }
    }

    pub fn fp_info(&self) -> &FilePathInfo {
        &self.fp_info
    }

    /// COPY passes per table.
    pub fn batches(&self) -> usize {
        self.options.resize.map(|plan| plan.batches()).unwrap_or(1)
    }

    /// Fails unless every segment host runs a helper of this build's version.
    pub async fn verify_versions(&self) -> Result<()> {
        let expected = segment_helper::VERSION;
        let command = format!("{} --version", shell_quote(&self.options.helper_path));
        let outputs = check_outputs(
            self.cluster.run_on_hosts(|_| command.clone()).await,
            "Checking gpbackup_helper version",
        )?;
        for output in outputs {
            let version = output
                .stdout
                .trim()
                .strip_prefix("gpbackup_helper version ")
                .map(str::trim)
                .unwrap_or_default();
            if version != expected {
                return Err(RestoreError::Remote {
                    host: output.host.clone(),
                    message: format!(
                        "gpbackup_helper version {:?} does not match gprestore version {}",
                        version, expected
                    ),
                });
            }
        }
        debug!("Verified gpbackup_helper version {} on all hosts", expected);
        Ok(())
    }

    /// Writes the oids to service, in order, one per line.
    pub async fn write_oid_lists(&self, oids: &[u32]) -> Result<()> {
        let mut contents = String::new();
        for oid in oids {
            contents.push_str(&oid.to_string());
            contents.push('\n');
        }
        let contents = contents.into_bytes();
        self.cluster
            .write_on_segments(|seg| {
                (
                    self.fp_info.segment_helper_file_path(seg.content_id, "oid"),
                    contents.clone(),
                )
            })
            .await
    }

    /// Creates the pipe for one COPY pass on every segment.
    ///
    /// A name is created at most once per restore; repeated requests for the
    /// same pass are no-ops.
    pub async fn create_pipe(&self, oid: u32, batch: usize, batches: usize) -> Result<()> {
        let key = copy_pipe_path(&self.fp_info.segment_pipe_path_for_copy(), oid, batch, batches);
        if !self.created_pipes.insert(key) {
            return Ok(());
        }
        let results = self
            .cluster
            .run_on_segments(|seg| {
                let pipe = pipe_name_for_batch(
                    &self.fp_info.segment_pipe_path(seg.content_id),
                    oid,
                    batch,
                    batches,
                );
                let pipe = shell_quote(&pipe.to_string_lossy());
                format!("mkfifo -m 0700 {p} 2>/dev/null || test -p {p}", p = pipe)
            })
            .await;
        check_outputs(results, &format!("Creating pipe for oid {}", oid))
            .map_err(|e| RestoreError::PipeSetup(e.to_string()))?;
        Ok(())
    }

    /// Pipes for the first `count` oids, every pass.
    pub async fn create_initial_pipes(&self, oids: &[u32], count: usize) -> Result<()> {
        let batches = self.batches();
        for &oid in oids.iter().take(count) {
            for batch in 0..batches {
                self.create_pipe(oid, batch, batches).await?;
            }
        }
        Ok(())
    }

    fn helper_args(&self, content: i32) -> HelperArgs {
        let fp = &self.fp_info;
        let compression = self.options.compression;
        HelperArgs {
            restore_agent: true,
            toc_file: Some(fp.segment_toc_path(content)),
            oid_file: Some(fp.segment_helper_file_path(content, "oid")),
            pipe_file: Some(fp.segment_pipe_path(content)),
            content: Some(content),
            data_file: Some(fp.table_backup_file_path(content, 0, compression.extension(), true)),
            compression_type: Some(compression.name().to_string()),
            plugin_config: self.options.plugin_config.clone(),
            on_error_continue: self.options.on_error_continue,
            single_data_file: self.options.single_data_file,
            orig_seg_count: self.options.resize.map(|plan| plan.orig),
            dest_seg_count: self.options.resize.map(|plan| plan.dest),
            copy_queue_size: self.options.copy_queue_size,
            log_file: self.options.log_file.clone(),
            log_level: self.options.log_level.clone(),
            ..Default::default()
        }
    }

    fn launch_script(&self, content: i32) -> String {
        let mut argv = vec![shell_quote(&self.options.helper_path)];
        argv.extend(self.helper_args(content).to_argv().iter().map(|a| shell_quote(a)));
        format!(
            "#!/bin/bash\nnohup {} > /dev/null 2>&1 &\n",
            argv.join(" ")
        )
    }

    /// Writes a launch script per segment and starts the helpers in the background.
    pub async fn start(&self) -> Result<()> {
        self.cluster
            .write_on_segments(|seg| {
                (
                    self.fp_info.segment_helper_file_path(seg.content_id, "script"),
                    self.launch_script(seg.content_id).into_bytes(),
                )
            })
            .await?;
        let results = self
            .cluster
            .run_on_segments(|seg| {
                let script = self.fp_info.segment_helper_file_path(seg.content_id, "script");
                format!("bash {}", shell_quote(&script.to_string_lossy()))
            })
            .await;
        check_outputs(results, "Starting gpbackup_helper")?;
        info!(
            segments = self.cluster.content_ids().len(),
            batches = self.batches(),
            "Started segment helpers"
        );
        Ok(())
    }

    /// Tells every helper to abandon `oid`.
    pub async fn place_skip_file(&self, oid: u32) -> Result<()> {
        let results = self
            .cluster
            .run_on_segments(|seg| {
                let skip = skip_file_name(&self.fp_info.segment_pipe_path(seg.content_id), oid);
                format!("touch {}", shell_quote(&skip.to_string_lossy()))
            })
            .await;
        check_outputs(results, &format!("Placing skip file for oid {}", oid))?;
        debug!(oid, "Placed skip file");
        Ok(())
    }

    /// Fails with `HelperError` when any helper has written its error file.
    pub async fn check_agent_errors(&self) -> Result<()> {
        let results = self
            .cluster
            .run_on_segments(|seg| {
                let error = error_file_name(&self.fp_info.segment_pipe_path(seg.content_id));
                format!(
                    "if [ -e {} ]; then echo error; fi",
                    shell_quote(&error.to_string_lossy())
                )
            })
            .await;

        let mut failed = Vec::new();
        for (content, result) in results {
            match result {
                Ok(output) if output.stdout.trim() == "error" => failed.push(content),
                Ok(_) => {}
                Err(e) => warn!(content, "Unable to check for helper errors: {}", e),
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        let contents: Vec<String> = failed.iter().map(i32::to_string).collect();
        Err(RestoreError::HelperError(format!(
            "Error from segment helper on content(s) {}; see the gpbackup_helper log on the segment hosts",
            contents.join(", ")
        )))
    }

    /// Stops any helper still running and removes pipes, control files and scratch files.
    pub async fn cleanup(&self) {
        let results = self
            .cluster
            .run_on_segments(|seg| {
                let oid_file = self.fp_info.segment_helper_file_path(seg.content_id, "oid");
                let script = self.fp_info.segment_helper_file_path(seg.content_id, "script");
                let pipe_base = self.fp_info.segment_pipe_path(seg.content_id);
                // The bracket keeps the pattern from matching this shell's own command line.
                format!(
                    "pkill -TERM -f {pattern}; rm -f {base}_* {oid} {script}; true",
                    pattern = shell_quote(&format!("[-]-oid-file {}", oid_file.display())),
                    base = shell_quote(&pipe_base.to_string_lossy()),
                    oid = shell_quote(&oid_file.to_string_lossy()),
                    script = shell_quote(&script.to_string_lossy()),
                )
            })
            .await;
        for (content, result) in results {
            if let Err(e) = result {
                warn!(content, "Helper cleanup failed: {}", e);
            }
        }
        debug!(pipes = self.created_pipes.len(), "Cleaned up segment helpers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{output, segments, FakeExecutor};

    const TS: &str = "20170101010101";

    fn helpers(executor: Arc<FakeExecutor>, resize: Option<ResizePlan>) -> SegmentHelpers {
        let cluster = Arc::new(Cluster::new(segments(2), executor));
        let fp_info = FilePathInfo::new(cluster.seg_dir_map(), None, TS, "", 4242).unwrap();
        SegmentHelpers::new(
            cluster,
            fp_info,
            HelperOptions {
                helper_path: "gpbackup_helper".into(),
                compression: CompressionType::Zstd,
                single_data_file: true,
                on_error_continue: true,
                resize,
                copy_queue_size: 2,
                plugin_config: None,
                log_file: Some(PathBuf::from("/home/gpadmin/gpAdminLogs/gpbackup_helper_20170101.log")),
                log_level: "info".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_verify_versions() {
        let good = format!("gpbackup_helper version {}\n", segment_helper::VERSION);
        let executor = Arc::new(FakeExecutor::new().on(move |host, cmd| {
            cmd.ends_with("--version").then(|| output(host, &good, 0))
        }));
        helpers(executor, None).verify_versions().await.unwrap();

        let executor = Arc::new(FakeExecutor::new().on(|host, cmd| {
            let stdout = if host == "sdw1" {
                "gpbackup_helper version 0.0.1\n"
            } else {
                ""
            };
            cmd.ends_with("--version").then(|| output(host, stdout, 0))
        }));
        let err = helpers(executor, None).verify_versions().await.unwrap_err();
        assert!(matches!(err, RestoreError::Remote { ref host, .. } if host == "sdw1"));
    }

    #[tokio::test]
    async fn test_oid_lists_written_per_segment() {
        let executor = Arc::new(FakeExecutor::new());
        let h = helpers(executor.clone(), None);
        h.write_oid_lists(&[16384, 16390]).await.unwrap();
        let path = h.fp_info().segment_helper_file_path(1, "oid");
        assert_eq!(executor.file("sdw1", &path).unwrap(), b"16384\n16390\n");
    }

    #[tokio::test]
    async fn test_pipe_created_at_most_once() {
        let executor = Arc::new(FakeExecutor::new());
        let h = helpers(executor.clone(), None);
        h.create_pipe(16384, 0, 1).await.unwrap();
        h.create_pipe(16384, 0, 1).await.unwrap();
        let made = executor.commands_matching("mkfifo");
        assert_eq!(made.len(), 2);
        assert!(made[0].contains("/data/primary/gpseg0/gpbackup_0_20170101010101_pipe_4242_16384"));
    }

    #[tokio::test]
    async fn test_initial_pipes_cover_every_pass() {
        let executor = Arc::new(FakeExecutor::new());
        let h = helpers(executor.clone(), Some(ResizePlan::new(3, 2).unwrap()));
        h.create_initial_pipes(&[1, 2, 3], 2).await.unwrap();
        let made = executor.commands_matching("mkfifo");
        // 2 oids x 2 passes x 2 segments
        assert_eq!(made.len(), 8);
        assert!(made.iter().any(|c| c.contains("pipe_4242_2_1 ")));
        assert!(!made.iter().any(|c| c.contains("pipe_4242_3")));
    }

    #[tokio::test]
    async fn test_pipe_failure_is_pipe_setup() {
        let executor = Arc::new(
            FakeExecutor::new().on(|host, cmd| cmd.contains("mkfifo").then(|| output(host, "", 1))),
        );
        let err = helpers(executor, None).create_pipe(7, 0, 1).await.unwrap_err();
        assert!(matches!(err, RestoreError::PipeSetup(_)));
    }

    #[tokio::test]
    async fn test_start_writes_scripts_with_helper_argv() {
        let executor = Arc::new(FakeExecutor::new());
        let h = helpers(executor.clone(), Some(ResizePlan::new(3, 2).unwrap()));
        h.start().await.unwrap();

        let script_path = h.fp_info().segment_helper_file_path(0, "script");
        let script = String::from_utf8(executor.file("sdw1", &script_path).unwrap()).unwrap();
        assert!(script.starts_with("#!/bin/bash\nnohup gpbackup_helper --restore-agent"));
        assert!(script.contains("--toc-file /data/primary/gpseg0/backups/20170101/20170101010101/gpbackup_0_20170101010101_toc.yaml"));
        assert!(script.contains("--data-file /data/primary/gpseg0/backups/20170101/20170101010101/gpbackup_0_20170101010101.zst"));
        assert!(script.contains("--content 0"));
        assert!(script.contains("--compression-type zstd"));
        assert!(script.contains("--on-error-continue"));
        assert!(script.contains("--single-data-file"));
        assert!(script.contains("--orig-seg-count 3 --dest-seg-count 2"));
        assert!(script.contains("--copy-queue-size 2"));
        assert!(script.trim_end().ends_with('&'));
        assert_eq!(executor.commands_matching("bash ").len(), 2);
    }

    #[tokio::test]
    async fn test_error_file_detection() {
        let executor = Arc::new(FakeExecutor::new());
        helpers(executor, None).check_agent_errors().await.unwrap();

        let executor = Arc::new(FakeExecutor::new().on(|host, cmd| {
            (cmd.contains("gpseg1/") && cmd.contains("_error")).then(|| output(host, "error\n", 0))
        }));
        let err = helpers(executor, None).check_agent_errors().await.unwrap_err();
        assert!(matches!(err, RestoreError::HelperError(ref m) if m.contains("content(s) 1")));
    }

    #[tokio::test]
    async fn test_skip_and_cleanup_commands() {
        let executor = Arc::new(FakeExecutor::new());
        let h = helpers(executor.clone(), None);
        h.place_skip_file(16384).await.unwrap();
        let skips = executor.commands_matching("touch");
        assert_eq!(skips.len(), 2);
        assert!(skips[0].ends_with("pipe_4242_skip_16384"));

        h.cleanup().await;
        let cleanups = executor.commands_matching("pkill");
        assert_eq!(cleanups.len(), 2);
        assert!(cleanups[0].contains("'[-]-oid-file /data/primary/gpseg0/gpbackup_0_20170101010101_oid_4242'"));
        assert!(cleanups[0].contains("rm -f /data/primary/gpseg0/gpbackup_0_20170101010101_pipe_4242_*"));
    }
}
