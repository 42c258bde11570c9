//! Bridge to external storage plugins.
//!
//! A plugin is an executable with a fixed argv contract. The helper streams
//! table data through `backup_data`/`restore_data`; the coordinator uses the
//! remaining sub-commands for setup, metadata files and version checks.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::utils::errors::{HelperError, Result};

/// Oldest plugin API the tools can drive.
pub const REQUIRED_PLUGIN_VERSION: PluginVersion = PluginVersion(0, 4, 0);

/// Bytes of a streaming plugin's stderr kept for the failure message.
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    pub executablepath: PathBuf,
    #[serde(default)]
    pub options: BTreeMap<String, serde_yaml::Value>,
    #[serde(skip)]
    pub config_path: PathBuf,
}

impl PluginConfig {
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HelperError::Config(format!(
                "Unable to read plugin config {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut config = Self::parse(&contents)?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(contents)
            .map_err(|_| HelperError::Config("plugin config file is formatted incorrectly".into()))?;
        let mapping = value
            .as_mapping()
            .ok_or_else(|| HelperError::Config("plugin config file is formatted incorrectly".into()))?;

        let has_executable = mapping
            .get("executablepath")
            .and_then(|v| v.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !has_executable {
            return Err(HelperError::Config(
                "executablepath is required in config file".into(),
            ));
        }

        serde_yaml::from_value(value)
            .map_err(|_| HelperError::Config("plugin config file is formatted incorrectly".into()))
    }

    /// Copy of the config carrying the per-host options every plugin expects.
    pub fn for_host(&self, pgport: u16, backup_plugin_version: &str) -> Self {
        let mut config = self.clone();
        config.options.insert(
            "pgport".to_string(),
            serde_yaml::Value::String(pgport.to_string()),
        );
        config.options.insert(
            "backup_plugin_version".to_string(),
            serde_yaml::Value::String(backup_plugin_version.to_string()),
        );
        config
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn executable_name(&self) -> String {
        self.executablepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginScope {
    Coordinator,
    SegmentHost,
    Segment,
}

impl PluginScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginScope::Coordinator => "coordinator",
            PluginScope::SegmentHost => "segment_host",
            PluginScope::Segment => "segment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginPhase {
    Backup,
    Restore,
}

impl PluginPhase {
    fn as_str(&self) -> &'static str {
        match self {
            PluginPhase::Backup => "backup",
            PluginPhase::Restore => "restore",
        }
    }
}

/// `major.minor.patch` plugin API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PluginVersion(pub u64, pub u64, pub u64);

impl PluginVersion {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || HelperError::PluginUnavailable(format!("Unable to parse plugin API version {:?}", s.trim()));
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(invalid());
        }
        let mut numbers = [0u64; 3];
        for (i, part) in parts.iter().enumerate() {
            numbers[i] = part.parse().map_err(|_| invalid())?;
        }
        Ok(PluginVersion(numbers[0], numbers[1], numbers[2]))
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Checks `plugin_api_version` output collected from every host.
pub fn check_version_compatible<S: AsRef<str>>(outputs: &[S]) -> Result<PluginVersion> {
    let versions = outputs
        .iter()
        .map(|o| PluginVersion::parse(o.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    let first = *versions
        .first()
        .ok_or_else(|| HelperError::PluginUnavailable("no plugin API version reported".into()))?;
    if versions.iter().any(|v| *v != first) {
        return Err(HelperError::PluginUnavailable(
            "Plugin API version is inconsistent across segments".into(),
        ));
    }
    if first < REQUIRED_PLUGIN_VERSION {
        return Err(HelperError::PluginUnavailable(format!(
            "Plugin API version incorrect: found {}, need at least {}",
            first, REQUIRED_PLUGIN_VERSION
        )));
    }
    Ok(first)
}

/// Parses `<plugin_name> version <git_version>` from `--version` output.
pub fn parse_plugin_name(output: &str) -> Result<String> {
    let tokens: Vec<&str> = output.split_whitespace().collect();
    match tokens.as_slice() {
        [name, "version", _] => Ok(name.to_string()),
        _ => Err(HelperError::Plugin(format!(
            "Unexpected plugin version format: {:?}\nExpected: \"[plugin_name] version [git_version]\"",
            output.trim()
        ))),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

#[derive(Debug, Clone)]
pub struct Plugin {
    pub config: PluginConfig,
    pub retry: RetryPolicy,
}

impl Plugin {
    pub fn new(config: PluginConfig) -> Self {
        Self {
            config,
            retry: RetryPolicy::default(),
        }
    }

    fn config_arg(&self) -> String {
        self.config.config_path.to_string_lossy().into_owned()
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.config.executablepath);
        cmd.arg(subcommand).kill_on_drop(true);
        cmd
    }

    async fn run(&self, subcommand: &str, args: &[String]) -> Result<String> {
        debug!(plugin = %self.config.executablepath.display(), subcommand, "Running plugin");
        let output = self
            .command(subcommand)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                HelperError::PluginUnavailable(format!(
                    "Unable to execute plugin {}: {}",
                    self.config.executablepath.display(),
                    e
                ))
            })?;
        if !output.status.success() {
            return Err(HelperError::Plugin(format!(
                "Plugin {} failed ({}): {}",
                subcommand,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn setup(&self, phase: PluginPhase, local_dir: &Path, scope: PluginScope) -> Result<()> {
        let subcommand = format!("setup_plugin_for_{}", phase.as_str());
        self.run(
            &subcommand,
            &[
                self.config_arg(),
                local_dir.to_string_lossy().into_owned(),
                scope.as_str().to_string(),
            ],
        )
        .await
        .map(|_| ())
    }

    pub async fn cleanup(&self, phase: PluginPhase, local_dir: &Path, scope: PluginScope) -> Result<()> {
        let subcommand = format!("cleanup_plugin_for_{}", phase.as_str());
        self.run(
            &subcommand,
            &[
                self.config_arg(),
                local_dir.to_string_lossy().into_owned(),
                scope.as_str().to_string(),
            ],
        )
        .await
        .map(|_| ())
    }

    pub async fn backup_file(&self, path: &Path) -> Result<()> {
        self.run(
            "backup_file",
            &[self.config_arg(), path.to_string_lossy().into_owned()],
        )
        .await
        .map(|_| ())
    }

    /// Fetches a file, retrying transient failures with exponential back-off.
    pub async fn restore_file(&self, path: &Path) -> Result<()> {
        let args = [self.config_arg(), path.to_string_lossy().into_owned()];
        let mut attempt = 0;
        loop {
            match self.run("restore_file", &args).await {
                Ok(_) => return Ok(()),
                Err(HelperError::Plugin(msg)) if attempt + 1 < self.retry.attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "restore_file {} failed (attempt {}), retrying in {:?}: {}",
                        path.display(),
                        attempt + 1,
                        delay,
                        msg
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Starts `backup_data`; the caller writes the stream to the child's stdin.
    pub fn spawn_backup_data(&self, key: &Path) -> Result<PluginProcess> {
        let child = self
            .command("backup_data")
            .arg(self.config_arg())
            .arg(key)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HelperError::PluginUnavailable(format!("Unable to start backup_data: {}", e)))?;
        Ok(PluginProcess::new(child, "backup_data"))
    }

    /// Starts `restore_data`; the caller reads the stream from the child's stdout.
    pub fn spawn_restore_data(&self, key: &Path) -> Result<PluginProcess> {
        let child = self
            .command("restore_data")
            .arg(self.config_arg())
            .arg(key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HelperError::PluginUnavailable(format!("Unable to start restore_data: {}", e)))?;
        Ok(PluginProcess::new(child, "restore_data"))
    }

    pub async fn api_version(&self) -> Result<PluginVersion> {
        let output = self.run("plugin_api_version", &[]).await?;
        check_version_compatible(&[output])
    }

    pub async fn plugin_name(&self) -> Result<String> {
        let output = self.run("--version", &[]).await.map_err(|e| {
            HelperError::Plugin(format!(
                "ERROR: Failed to get plugin name. Failed with error: {}",
                e
            ))
        })?;
        parse_plugin_name(&output)
    }

    pub async fn delete_backup(&self, timestamp: &str) -> Result<()> {
        crate::filepath::validate_timestamp(timestamp)?;
        self.run("delete_backup", &[self.config_arg(), timestamp.to_string()])
            .await
            .map(|_| ())
    }

    /// Read command used inside `COPY ... FROM PROGRAM` when no helper is involved.
    pub fn restore_data_command(&self) -> String {
        format!(
            "{} restore_data {}",
            self.config.executablepath.display(),
            self.config.config_path.display()
        )
    }

    pub fn api_version_command(&self) -> String {
        format!("{} plugin_api_version", self.config.executablepath.display())
    }
}

/// A streaming plugin child whose stderr is drained in the background.
///
/// The plugin would otherwise block on a full stderr pipe while the helper is
/// still reading its stdout or writing its stdin.
pub struct PluginProcess {
    pub child: Child,
    subcommand: &'static str,
    stderr: Option<JoinHandle<String>>,
}

impl PluginProcess {
    fn new(mut child: Child, subcommand: &'static str) -> Self {
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut tail: VecDeque<u8> = VecDeque::with_capacity(STDERR_TAIL_BYTES);
                let mut buf = [0u8; 8192];
                loop {
                    let n = match pipe.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    debug!(
                        subcommand,
                        "plugin stderr: {}",
                        String::from_utf8_lossy(&buf[..n]).trim_end()
                    );
                    tail.extend(&buf[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        tail.drain(..tail.len() - STDERR_TAIL_BYTES);
                    }
                }
                String::from_utf8_lossy(&Vec::from(tail)).trim().to_string()
            })
        });
        Self {
            child,
            subcommand,
            stderr,
        }
    }
}

/// Waits for a plugin child and turns a non-zero exit into a plugin error
/// carrying the tail of its stderr.
///
/// Any stdio handle the caller still needs must be taken before calling this.
pub async fn wait_plugin(mut process: PluginProcess) -> Result<()> {
    let status = process.child.wait().await?;
    let stderr = match process.stderr.take() {
        Some(drain) => drain.await.unwrap_or_default(),
        None => String::new(),
    };
    if status.success() {
        return Ok(());
    }
    Err(HelperError::Plugin(format!(
        "Plugin {} failed ({}): {}",
        process.subcommand, status, stderr
    )))
}
