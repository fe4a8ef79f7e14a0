//! What starts a cycle: once, on a cron schedule, or when a log changes.

use crate::config::Config;
use crate::cycle::Cycle;
use crate::error::ConfigError;
use chrono::{DateTime, Local, TimeZone};
use croner::Cron;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

/// Run a single cycle.
pub async fn run_once(cycle: &Cycle) -> anyhow::Result<()> {
    cycle.run().await?;
    Ok(())
}

/// Next time `cron` fires strictly after `after`.
pub fn next_run<Tz: TimeZone>(cron: &Cron, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    cron.find_next_occurrence(after, false).ok()
}

/// Run a cycle every time `cron_expr` fires until `shutdown` resolves.
///
/// Cycle failures are logged; the next occurrence is still awaited.
pub async fn run_scheduled(
    cycle: &Cycle,
    cron_expr: &str,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let cron = Cron::from_str(cron_expr).map_err(|e| {
        ConfigError::Invalid(format!("invalid cron expression '{}': {}", cron_expr, e))
    })?;
    tokio::pin!(shutdown);

    info!(cron = %cron_expr, "Scheduler started");

    loop {
        let now = Local::now();
        let Some(next) = next_run(&cron, &now) else {
            anyhow::bail!("cron expression '{}' has no upcoming occurrence", cron_expr);
        };
        let wait = (next.clone() - now).to_std().unwrap_or(Duration::ZERO);
        info!(next = %next, "Next scan scheduled");

        tokio::select! {
            _ = &mut shutdown => {
                info!("Scheduler stopping");
                return Ok(());
            }
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = cycle.run().await {
            error!(error = %e, "Scheduled cycle failed");
        }
    }
}

/// Size and modification time of a file, if it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let meta = std::fs::metadata(path).ok()?;
    Some(Fingerprint {
        len: meta.len(),
        modified: meta.modified().ok(),
    })
}

/// Detects changes to a set of log files by polling their metadata.
#[derive(Debug)]
pub struct LogWatcher {
    files: Vec<(PathBuf, Option<Fingerprint>)>,
}

impl LogWatcher {
    /// Watch `paths`. Logs whose directory does not exist are dropped.
    pub fn new(paths: &[PathBuf]) -> Self {
        let files = paths
            .iter()
            .filter(|path| {
                let dir = match path.parent() {
                    Some(dir) if !dir.as_os_str().is_empty() => dir,
                    _ => Path::new("."),
                };
                if dir.exists() {
                    true
                } else {
                    warn!(log = %path.display(), "Log directory does not exist, not watching");
                    false
                }
            })
            .map(|path| (path.clone(), fingerprint(path)))
            .collect();

        Self { files }
    }

    /// Number of logs being watched.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// True if any log was created, modified or truncated since the last call.
    pub fn poll_changed(&mut self) -> bool {
        let mut changed = false;
        for (path, last) in &mut self.files {
            let current = fingerprint(path);
            if current != *last {
                *last = current;
                if current.is_some() {
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Run a cycle whenever a watched log changes, until `shutdown` resolves.
pub async fn run_watch(
    cycle: &Cycle,
    config: &Config,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let mut watcher = LogWatcher::new(&config.logs);
    if watcher.is_empty() {
        anyhow::bail!("none of the configured logs can be watched");
    }
    tokio::pin!(shutdown);

    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.watch.poll_interval_seconds.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(logs = watcher.len(), "Watching logs for changes");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Watcher stopping");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        if watcher.poll_changed() {
            info!("Log change detected");
            if let Err(e) = cycle.run().await {
                error!(error = %e, "Triggered cycle failed");
            }
        }
    }
}
