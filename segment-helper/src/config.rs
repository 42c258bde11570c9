//! Command line of `gpbackup_helper`.
//!
//! The argv form is a stable contract with the coordinator, which builds it
//! through [`HelperArgs::to_argv`].

use clap::Parser;
use std::path::PathBuf;

use crate::compression::CompressionType;
use crate::plugin::{Plugin, PluginConfig};
use crate::resize::ResizePlan;
use crate::utils::errors::{HelperError, Result};

#[derive(Parser, Debug, Clone, Default, PartialEq)]
#[command(
    name = "gpbackup_helper",
    about = "Streams table data between COPY ... ON SEGMENT pipes and backup files",
    disable_version_flag = true
)]
pub struct HelperArgs {
    /// Read table data from pipes and write it to the data file
    #[arg(long, conflicts_with = "restore_agent")]
    pub backup_agent: bool,

    /// Read table data from the data file and write it to pipes
    #[arg(long)]
    pub restore_agent: bool,

    /// Segment TOC to write (backup) or read (restore)
    #[arg(long, value_name = "PATH")]
    pub toc_file: Option<PathBuf>,

    /// File listing the oids to service, one per line
    #[arg(long, value_name = "PATH")]
    pub oid_file: Option<PathBuf>,

    /// Pipe base path; pipes are named <pipe-file>_<oid>
    #[arg(long, value_name = "PATH")]
    pub pipe_file: Option<PathBuf>,

    /// Content id of the segment this helper serves
    #[arg(long, allow_negative_numbers = true)]
    pub content: Option<i32>,

    #[arg(long, value_name = "PATH")]
    pub data_file: Option<PathBuf>,

    /// 0 disables compression
    #[arg(long)]
    pub compression_level: Option<u32>,

    /// gzip, zstd or none
    #[arg(long)]
    pub compression_type: Option<String>,

    #[arg(long, value_name = "PATH")]
    pub plugin_config: Option<PathBuf>,

    /// Honour skip-files and keep going after a per-table failure
    #[arg(long)]
    pub on_error_continue: bool,

    /// All tables share one data file addressed through the segment TOC
    #[arg(long)]
    pub single_data_file: bool,

    #[arg(long, requires = "dest_seg_count")]
    pub orig_seg_count: Option<i32>,

    #[arg(long, requires = "orig_seg_count")]
    pub dest_seg_count: Option<i32>,

    /// Pipes pre-created ahead of the oid being serviced
    #[arg(long, default_value_t = 1)]
    pub copy_queue_size: usize,

    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Print the helper version and exit
    #[arg(long)]
    pub version: bool,
}

impl HelperArgs {
    /// Renders the arguments back into argv form (without the program name).
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if self.backup_agent {
            argv.push("--backup-agent".to_string());
        }
        if self.restore_agent {
            argv.push("--restore-agent".to_string());
        }
        let mut push_path = |flag: &str, value: &Option<PathBuf>| {
            if let Some(v) = value {
                argv.push(flag.to_string());
                argv.push(v.to_string_lossy().into_owned());
            }
        };
        push_path("--toc-file", &self.toc_file);
        push_path("--oid-file", &self.oid_file);
        push_path("--pipe-file", &self.pipe_file);
        push_path("--data-file", &self.data_file);
        push_path("--plugin-config", &self.plugin_config);
        push_path("--log-file", &self.log_file);

        if let Some(content) = self.content {
            argv.push("--content".to_string());
            argv.push(content.to_string());
        }
        if let Some(level) = self.compression_level {
            argv.push("--compression-level".to_string());
            argv.push(level.to_string());
        }
        if let Some(kind) = &self.compression_type {
            argv.push("--compression-type".to_string());
            argv.push(kind.clone());
        }
        if self.on_error_continue {
            argv.push("--on-error-continue".to_string());
        }
        if self.single_data_file {
            argv.push("--single-data-file".to_string());
        }
        if let (Some(orig), Some(dest)) = (self.orig_seg_count, self.dest_seg_count) {
            argv.push("--orig-seg-count".to_string());
            argv.push(orig.to_string());
            argv.push("--dest-seg-count".to_string());
            argv.push(dest.to_string());
        }
        if self.copy_queue_size != 1 {
            argv.push("--copy-queue-size".to_string());
            argv.push(self.copy_queue_size.to_string());
        }
        if self.log_level != "info" && !self.log_level.is_empty() {
            argv.push("--log-level".to_string());
            argv.push(self.log_level.clone());
        }
        argv
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Backup,
    Restore,
}

/// Validated helper configuration.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    pub mode: AgentMode,
    pub toc_file: PathBuf,
    pub oid_file: PathBuf,
    pub pipe_file: PathBuf,
    pub content: i32,
    pub data_file: PathBuf,
    pub compression: CompressionType,
    pub compression_level: u32,
    pub plugin: Option<Plugin>,
    pub on_error_continue: bool,
    pub single_data_file: bool,
    pub resize: Option<ResizePlan>,
    pub copy_queue_size: usize,
}

fn required(value: Option<PathBuf>, flag: &str) -> Result<PathBuf> {
    value.ok_or_else(|| HelperError::Config(format!("--{} is required", flag)))
}

impl HelperConfig {
    pub fn from_args(args: &HelperArgs) -> Result<Self> {
        let mode = match (args.backup_agent, args.restore_agent) {
            (true, false) => AgentMode::Backup,
            (false, true) => AgentMode::Restore,
            _ => {
                return Err(HelperError::Config(
                    "exactly one of --backup-agent or --restore-agent is required".into(),
                ))
            }
        };

        let content = args
            .content
            .ok_or_else(|| HelperError::Config("--content is required".into()))?;
        if content < 0 {
            return Err(HelperError::Config(format!(
                "--content must be a segment content id, got {}",
                content
            )));
        }

        let data_file = required(args.data_file.clone(), "data-file")?;
        let explicit = args
            .compression_type
            .as_deref()
            .map(str::parse::<CompressionType>)
            .transpose()?;
        let compression =
            CompressionType::resolve(explicit, args.compression_level, &data_file);
        let compression_level = args
            .compression_level
            .filter(|l| *l > 0)
            .unwrap_or_else(|| compression.default_level());

        let plugin = args
            .plugin_config
            .as_deref()
            .map(PluginConfig::read_from_file)
            .transpose()?
            .map(Plugin::new);

        let resize = match (args.orig_seg_count, args.dest_seg_count) {
            (Some(orig), Some(dest)) => Some(ResizePlan::new(orig, dest)?),
            (None, None) => None,
            _ => {
                return Err(HelperError::Config(
                    "--orig-seg-count and --dest-seg-count must be given together".into(),
                ))
            }
        };
        if resize.is_some() && mode == AgentMode::Backup {
            return Err(HelperError::Config(
                "segment count flags are only valid with --restore-agent".into(),
            ));
        }

        if args.copy_queue_size == 0 {
            return Err(HelperError::Config("--copy-queue-size must be at least 1".into()));
        }

        Ok(Self {
            mode,
            toc_file: required(args.toc_file.clone(), "toc-file")?,
            oid_file: required(args.oid_file.clone(), "oid-file")?,
            pipe_file: required(args.pipe_file.clone(), "pipe-file")?,
            content,
            data_file,
            compression,
            compression_level,
            plugin,
            on_error_continue: args.on_error_continue,
            single_data_file: args.single_data_file,
            resize,
            copy_queue_size: args.copy_queue_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "gpbackup_helper",
            "--toc-file",
            "/tmp/toc.yaml",
            "--oid-file",
            "/tmp/oids",
            "--pipe-file",
            "/tmp/pipe",
            "--content",
            "1",
        ]
    }

    #[test]
    fn test_parse_backup_agent() {
        let mut argv = base_args();
        argv.extend(["--backup-agent", "--data-file", "/tmp/gpbackup_1_20170101010101.zst"]);
        let args = HelperArgs::try_parse_from(argv).unwrap();
        let config = HelperConfig::from_args(&args).unwrap();

        assert_eq!(config.mode, AgentMode::Backup);
        assert_eq!(config.content, 1);
        assert_eq!(config.compression, CompressionType::Zstd);
        assert_eq!(config.copy_queue_size, 1);
        assert!(config.resize.is_none());
    }

    #[test]
    fn test_compression_level_zero_disables_compression() {
        let mut argv = base_args();
        argv.extend(["--backup-agent", "--compression-level", "0", "--data-file", "/tmp/data.gz"]);
        let config = HelperConfig::from_args(&HelperArgs::try_parse_from(argv).unwrap()).unwrap();
        assert_eq!(config.compression, CompressionType::None);
    }

    #[test]
    fn test_resize_flags() {
        let mut argv = base_args();
        argv.extend([
            "--restore-agent",
            "--data-file",
            "/tmp/data",
            "--orig-seg-count",
            "3",
            "--dest-seg-count",
            "2",
        ]);
        let config = HelperConfig::from_args(&HelperArgs::try_parse_from(argv).unwrap()).unwrap();
        assert_eq!(config.resize, Some(ResizePlan { orig: 3, dest: 2 }));

        let mut argv = base_args();
        argv.extend(["--restore-agent", "--data-file", "/tmp/data", "--orig-seg-count", "3"]);
        assert!(HelperArgs::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_mode_and_required_flags() {
        let mut argv = base_args();
        argv.extend(["--data-file", "/tmp/data"]);
        let args = HelperArgs::try_parse_from(argv).unwrap();
        assert!(matches!(HelperConfig::from_args(&args), Err(HelperError::Config(_))));

        let argv = vec!["gpbackup_helper", "--restore-agent", "--content", "0"];
        let args = HelperArgs::try_parse_from(argv).unwrap();
        assert!(HelperConfig::from_args(&args).is_err());

        let mut argv = base_args();
        argv.extend(["--backup-agent", "--restore-agent", "--data-file", "/tmp/data"]);
        assert!(HelperArgs::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_argv_round_trip() {
        let args = HelperArgs {
            restore_agent: true,
            toc_file: Some(PathBuf::from("/data/gpseg0/toc.yaml")),
            oid_file: Some(PathBuf::from("/data/gpseg0/oids")),
            pipe_file: Some(PathBuf::from("/data/gpseg0/pipe")),
            content: Some(0),
            data_file: Some(PathBuf::from("/data/gpseg0/data.gz")),
            compression_type: Some("gzip".into()),
            on_error_continue: true,
            single_data_file: true,
            orig_seg_count: Some(3),
            dest_seg_count: Some(2),
            copy_queue_size: 2,
            log_level: "debug".into(),
            ..Default::default()
        };
        let mut argv = vec!["gpbackup_helper".to_string()];
        argv.extend(args.to_argv());
        let parsed = HelperArgs::try_parse_from(argv).unwrap();
        assert_eq!(parsed, args);
    }
}
