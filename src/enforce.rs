//! Firewall enforcement and the audit log.

use crate::config::{FirewallConfig, IP_PLACEHOLDER};
use crate::error::EnforcementError;
use async_trait::async_trait;
use chrono::Local;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

/// Something that can deny traffic from an address.
#[async_trait]
pub trait EnforcementSink: Send + Sync {
    /// Ban `ip`. Failures are reported but never retried.
    async fn ban(&self, ip: &IpAddr) -> Result<(), EnforcementError>;
}

/// Append-only log of cycles and ban events.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line to the log.
    pub async fn append(&self, message: &str) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{}\n", message).as_bytes()).await?;
        file.flush().await
    }

    /// Append a line and only log if that fails.
    pub async fn note(&self, message: &str) {
        if let Err(e) = self.append(message).await {
            warn!(audit_log = %self.path.display(), error = %e, "Failed to write audit log");
        }
    }
}

/// Bans addresses by running a firewall command such as
/// `ufw deny from {ip} to any`.
///
/// The address is passed as its own argument, never through a shell.
pub struct FirewallSink {
    config: FirewallConfig,
    audit: AuditLog,
}

impl FirewallSink {
    pub fn new(config: FirewallConfig, audit: AuditLog) -> Self {
        Self { config, audit }
    }

    /// Program and arguments for banning `ip`.
    pub fn command_for(&self, ip: &IpAddr) -> Option<(String, Vec<String>)> {
        let ip = ip.to_string();
        let mut argv = self
            .config
            .command
            .iter()
            .map(|arg| arg.replace(IP_PLACEHOLDER, &ip));
        let program = argv.next()?;
        Some((program, argv.collect()))
    }

    async fn run(&self, ip: &IpAddr) -> Result<(), EnforcementError> {
        let Some((program, args)) = self.command_for(ip) else {
            return Err(EnforcementError::Spawn {
                program: String::new(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "firewall command is empty",
                ),
            });
        };

        if self.config.dry_run {
            info!(ip = %ip, program = %program, args = ?args, "Dry run, not banning");
            return Ok(());
        }

        let output = Command::new(&program)
            .args(&args)
            .output()
            .await
            .map_err(|source| EnforcementError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EnforcementError::Failed {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl EnforcementSink for FirewallSink {
    async fn ban(&self, ip: &IpAddr) -> Result<(), EnforcementError> {
        let result = self.run(ip).await;
        let date = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

        match &result {
            Ok(()) => {
                info!(ip = %ip, "Banned address");
                self.audit.note(&format!("Banned {} date: {}", ip, date)).await;
            }
            Err(e) => {
                self.audit
                    .note(&format!("Failed to ban {} date: {} error: {}", ip, date, e))
                    .await;
            }
        }

        result
    }
}
