//! Restoring through a storage plugin.
//!
//! The coordinator drives the plugin locally for the metadata files and over
//! the cluster executor for everything that happens on segment hosts. Each
//! host gets its own copy of the plugin config at the same path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cluster::{check_outputs, shell_quote, Cluster};
use crate::error::{RestoreError, Result};
use segment_helper::filepath::{FilePathInfo, COORDINATOR_CONTENT};
use segment_helper::plugin::{
    check_version_compatible, Plugin, PluginConfig, PluginPhase, PluginScope, PluginVersion,
};

pub struct PluginBridge {
    cluster: Arc<Cluster>,
    /// Plugin driven on the coordinator with the user's config file.
    local: Plugin,
    /// Same plugin pointed at the per-host config copy.
    host: Plugin,
    api_version: PluginVersion,
    name: String,
}

impl PluginBridge {
    /// Verifies the plugin exists everywhere with one compatible API version
    /// and runs the coordinator-side setup.
    pub async fn connect(
        cluster: Arc<Cluster>,
        config_path: &Path,
        fp_info: &FilePathInfo,
    ) -> Result<Self> {
        let config = PluginConfig::read_from_file(config_path)?;
        let local = Plugin::new(config.clone());
        let exe = shell_quote(&config.executablepath.to_string_lossy());

        let outputs = check_outputs(
            cluster.run_on_hosts(|_| format!("test -x {}", exe)).await,
            "Checking plugin executable",
        )
        .map_err(|e| {
            RestoreError::PluginUnavailable(format!(
                "Plugin {} does not exist or is not executable on every host: {}",
                config.executablepath.display(),
                e
            ))
        })?;
        debug!(hosts = outputs.len(), "Plugin executable found on segment hosts");

        let mut versions = vec![local.api_version().await?.to_string()];
        let api_command = local.api_version_command();
        let outputs = check_outputs(
            cluster.run_on_hosts(|_| api_command.clone()).await,
            "Checking plugin API version",
        )
        .map_err(|e| RestoreError::PluginUnavailable(e.to_string()))?;
        versions.extend(outputs.into_iter().map(|o| o.stdout));
        let api_version = check_version_compatible(&versions)?;
        let name = local.plugin_name().await?;

        let host_config_path = host_config_path(config_path, &fp_info.timestamp);
        let mut host_config = config;
        host_config.config_path = host_config_path;
        let bridge = Self {
            cluster,
            host: Plugin::new(host_config),
            local,
            api_version,
            name,
        };

        bridge
            .local
            .setup(
                PluginPhase::Restore,
                &fp_info.dir_for_content(COORDINATOR_CONTENT),
                PluginScope::Coordinator,
            )
            .await?;
        info!(
            plugin = %bridge.name,
            api_version = %bridge.api_version,
            "Plugin ready on coordinator"
        );
        Ok(bridge)
    }

    pub fn api_version(&self) -> PluginVersion {
        self.api_version
    }

    /// Name reported by the plugin's `--version`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-host config path passed to helpers and `restore_data`.
    pub fn host_config_path(&self) -> &Path {
        &self.host.config.config_path
    }

    /// Read command for `COPY ... FROM PROGRAM` when segments fetch data directly.
    pub fn restore_data_command(&self) -> String {
        self.host.restore_data_command()
    }

    pub async fn restore_file(&self, path: &Path) -> Result<()> {
        debug!(path = %path.display(), "Restoring file through plugin");
        self.local.restore_file(path).await?;
        Ok(())
    }

    /// Copies the config to every segment host, with that host's port and the
    /// plugin version recorded at backup time, then runs host and segment setup.
    pub async fn setup_segments(&self, fp_info: &FilePathInfo, backup_plugin_version: &str) -> Result<()> {
        let path = self.host_config_path().to_path_buf();
        for host in self.cluster.segment_hosts() {
            let port = self
                .cluster
                .primaries()
                .find(|s| s.hostname == host)
                .map(|s| s.port)
                .unwrap_or_default();
            let yaml = self
                .local
                .config
                .for_host(port, backup_plugin_version)
                .to_yaml()?;
            self.cluster
                .executor()
                .write_file(&host, &path, yaml.as_bytes())
                .await?;
        }

        let exe = self.exe();
        let cfg = shell_quote(&path.to_string_lossy());
        let host_dir = |content: i32| shell_quote(&fp_info.dir_for_content(content).to_string_lossy());
        check_outputs(
            self.cluster
                .run_on_hosts(|host| {
                    let content = self
                        .cluster
                        .primaries()
                        .find(|s| s.hostname == host)
                        .map(|s| s.content_id)
                        .unwrap_or_default();
                    format!(
                        "{} setup_plugin_for_restore {} {} {}",
                        exe,
                        cfg,
                        host_dir(content),
                        PluginScope::SegmentHost.as_str()
                    )
                })
                .await,
            "Plugin setup on segment host",
        )
        .map_err(|e| RestoreError::PluginUnavailable(e.to_string()))?;
        check_outputs(
            self.cluster
                .run_on_segments(|seg| {
                    format!(
                        "{} setup_plugin_for_restore {} {} {}",
                        exe,
                        cfg,
                        host_dir(seg.content_id),
                        PluginScope::Segment.as_str()
                    )
                })
                .await,
            "Plugin setup on segment",
        )
        .map_err(|e| RestoreError::PluginUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Fetches every segment's TOC into its backup directory.
    pub async fn restore_segment_tocs(&self, fp_info: &FilePathInfo) -> Result<()> {
        let exe = self.exe();
        let cfg = shell_quote(&self.host_config_path().to_string_lossy());
        check_outputs(
            self.cluster
                .run_on_segments(|seg| {
                    format!(
                        "{} restore_file {} {}",
                        exe,
                        cfg,
                        shell_quote(&fp_info.segment_toc_path(seg.content_id).to_string_lossy())
                    )
                })
                .await,
            "Restoring segment TOC through plugin",
        )
        .map_err(|e| RestoreError::PluginUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Runs cleanup on segments and the coordinator and removes the config copies.
    pub async fn cleanup(&self, fp_info: &FilePathInfo) {
        let exe = self.exe();
        let path = self.host_config_path().to_path_buf();
        let cfg = shell_quote(&path.to_string_lossy());
        let results = self
            .cluster
            .run_on_segments(|seg| {
                format!(
                    "{} cleanup_plugin_for_restore {} {} {}",
                    exe,
                    cfg,
                    shell_quote(&fp_info.dir_for_content(seg.content_id).to_string_lossy()),
                    PluginScope::Segment.as_str()
                )
            })
            .await;
        if let Err(e) = check_outputs(results, "Plugin cleanup on segment") {
            warn!("{}", e);
        }
        let results = self.cluster.run_on_hosts(|_| format!("rm -f {}", cfg)).await;
        if let Err(e) = check_outputs(results, "Removing plugin config") {
            warn!("{}", e);
        }
        if let Err(e) = self
            .local
            .cleanup(
                PluginPhase::Restore,
                &fp_info.dir_for_content(COORDINATOR_CONTENT),
                PluginScope::Coordinator,
            )
            .await
        {
            warn!("Plugin cleanup on coordinator failed: {}", e);
        }
    }

    pub async fn delete_backup(&self, timestamp: &str) -> Result<()> {
        self.local.delete_backup(timestamp).await?;
        Ok(())
    }

    fn exe(&self) -> String {
        shell_quote(&self.local.config.executablepath.to_string_lossy())
    }
}

/// `<tmp>/<ts>_<config file name>`, identical on every host.
pub fn host_config_path(config_path: &Path, timestamp: &str) -> PathBuf {
    let name = config_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plugin_config.yaml".into());
    std::env::temp_dir().join(format!("{}_{}", timestamp, name))
}
