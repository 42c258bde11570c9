use async_trait::async_trait;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{ClusterExecutor, CommandOutput};
use crate::error::{RestoreError, Result};

/// Runs commands on segment hosts over SSH with key or agent authentication.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    user: String,
    port: u16,
    identity_file: Option<PathBuf>,
}

impl SshExecutor {
    pub fn new(user: String, port: u16, identity_file: Option<PathBuf>) -> Self {
        Self {
            user,
            port,
            identity_file,
        }
    }

    fn connect(&self, host: &str) -> Result<ssh2::Session> {
        let remote = |message: String| RestoreError::Remote {
            host: host.to_string(),
            message,
        };
        let tcp = TcpStream::connect((host, self.port))
            .map_err(|e| remote(format!("Unable to connect on port {}: {}", self.port, e)))?;
        let mut sess = ssh2::Session::new().map_err(|e| remote(e.to_string()))?;
        sess.set_tcp_stream(tcp);
        sess.handshake().map_err(|e| remote(format!("SSH handshake failed: {}", e)))?;

        let auth = match &self.identity_file {
            Some(key) => sess.userauth_pubkey_file(&self.user, None, key, None),
            None => sess.userauth_agent(&self.user),
        };
        auth.map_err(|e| remote(format!("SSH authentication failed: {}", e)))?;
        if !sess.authenticated() {
            return Err(remote("SSH authentication failed".into()));
        }
        Ok(sess)
    }

    fn exec_blocking(&self, host: &str, command: &str) -> Result<CommandOutput> {
        let remote = |e: ssh2::Error| RestoreError::Remote {
            host: host.to_string(),
            message: e.to_string(),
        };
        let sess = self.connect(host)?;
        let mut channel = sess.channel_session().map_err(remote)?;
        channel.exec(command).map_err(remote)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel.wait_close().map_err(remote)?;
        let status = channel.exit_status().map_err(remote)?;

        Ok(CommandOutput {
            host: host.to_string(),
            stdout,
            stderr,
            status,
        })
    }

    fn write_blocking(&self, host: &str, path: &Path, contents: &[u8]) -> Result<()> {
        let remote = |e: ssh2::Error| RestoreError::Remote {
            host: host.to_string(),
            message: format!("Unable to write {}: {}", path.display(), e),
        };
        let sess = self.connect(host)?;
        let sftp = sess.sftp().map_err(remote)?;
        let mut file = sftp.create(path).map_err(remote)?;
        file.write_all(contents)?;
        drop(file);
        drop(sftp);
        Ok(())
    }
}

#[async_trait]
impl ClusterExecutor for SshExecutor {
    async fn run(&self, host: &str, command: &str) -> Result<CommandOutput> {
        debug!(host, "Running over ssh: {}", command);
        let this = self.clone();
        let host = host.to_string();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || this.exec_blocking(&host, &command))
            .await
            .map_err(|e| RestoreError::Remote {
                host: String::new(),
                message: format!("ssh task failed: {}", e),
            })?
    }

    async fn write_file(&self, host: &str, path: &Path, contents: &[u8]) -> Result<()> {
        let this = self.clone();
        let host = host.to_string();
        let path = path.to_path_buf();
        let contents = contents.to_vec();
        tokio::task::spawn_blocking(move || this.write_blocking(&host, &path, &contents))
            .await
            .map_err(|e| RestoreError::Remote {
                host: String::new(),
                message: format!("sftp task failed: {}", e),
            })?
    }
}
