//! One evaluation cycle: extract, partition, query, decide, enforce, persist.

use crate::config::{AllowlistEntry, Config};
use crate::enforce::{AuditLog, EnforcementSink, FirewallSink};
use crate::error::CycleError;
use crate::extract::read_logs;
use crate::policy::BanPolicy;
use crate::providers::abuseipdb::AbuseIPDBProvider;
use crate::providers::{check_all_with_timeout, ReputationProvider};
use crate::store::{FreshnessStore, SqliteStore};
use chrono::{Local, NaiveDate};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Where a cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Extracting,
    Partitioning,
    Querying,
    Deciding,
    Enforcing,
    Persisting,
}

/// How the candidates of one cycle split against the freshness store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// New and stale addresses: `(candidates - recent) ∪ stale`.
    pub to_check: Vec<IpAddr>,
    /// Addresses never seen before: `candidates - stale - recent`.
    pub to_insert: Vec<IpAddr>,
    /// Stale addresses whose date is bumped once evaluated.
    pub to_refresh: Vec<IpAddr>,
}

impl Partition {
    pub fn compute(
        candidates: &HashSet<IpAddr>,
        recent: &HashSet<IpAddr>,
        stale: &HashSet<IpAddr>,
    ) -> Self {
        let mut to_check: Vec<IpAddr> = candidates
            .difference(recent)
            .chain(stale.iter())
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mut to_insert: Vec<IpAddr> = candidates
            .iter()
            .filter(|ip| !stale.contains(ip) && !recent.contains(ip))
            .copied()
            .collect();
        let mut to_refresh: Vec<IpAddr> = stale.iter().copied().collect();

        to_check.sort();
        to_insert.sort();
        to_refresh.sort();

        Self {
            to_check,
            to_insert,
            to_refresh,
        }
    }
}

/// Summary of a completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub candidates: usize,
    pub recent: usize,
    pub stale: usize,
    pub checked: usize,
    pub failed_lookups: usize,
    /// Lookups cut off by the batch timeout; included in `failed_lookups`.
    pub unsettled: usize,
    pub banned: Vec<IpAddr>,
    pub ban_failures: usize,
    pub inserted: u64,
    pub refreshed: u64,
}

/// Runs evaluation cycles. Only one cycle runs at a time.
pub struct Cycle {
    logs: Vec<PathBuf>,
    store: Arc<dyn FreshnessStore>,
    provider: Arc<dyn ReputationProvider>,
    sink: Arc<dyn EnforcementSink>,
    policy: BanPolicy,
    allowlist: Vec<AllowlistEntry>,
    audit: AuditLog,
    max_concurrency: usize,
    batch_timeout: Duration,
    state: RwLock<CycleState>,
    running: Mutex<()>,
}

impl Cycle {
    pub fn new(
        config: &Config,
        store: Arc<dyn FreshnessStore>,
        provider: Arc<dyn ReputationProvider>,
        sink: Arc<dyn EnforcementSink>,
    ) -> Self {
        Self {
            logs: config.logs.clone(),
            store,
            provider,
            sink,
            policy: BanPolicy::new(config.thresholds),
            allowlist: config.parse_allowlist(),
            audit: AuditLog::new(config.audit_log.clone()),
            max_concurrency: config.reputation.max_concurrency,
            batch_timeout: Duration::from_secs(config.reputation.batch_timeout_seconds),
            state: RwLock::new(CycleState::Idle),
            running: Mutex::new(()),
        }
    }

    /// Build a cycle with the SQLite store, AbuseIPDB and the firewall command.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = SqliteStore::open(&config.database.path, config.freshness.window_days).await?;
        let provider = AbuseIPDBProvider::new(config.reputation.clone(), config.api.clone())?;
        let sink = FirewallSink::new(
            config.firewall.clone(),
            AuditLog::new(config.audit_log.clone()),
        );

        info!(
            logs = config.logs.len(),
            dry_run = config.firewall.dry_run,
            max_concurrency = config.reputation.max_concurrency,
            allowlist_entries = config.allowlist.len(),
            "Cycle initialized"
        );

        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(provider),
            Arc::new(sink),
        ))
    }

    /// Current state.
    pub fn state(&self) -> CycleState {
        self.state.read().map(|s| *s).unwrap_or(CycleState::Idle)
    }

    /// Run one cycle dated today (local time).
    pub async fn run(&self) -> Result<CycleReport, CycleError> {
        self.run_on(Local::now().date_naive()).await
    }

    /// Run one cycle as of `today`.
    ///
    /// Returns [`CycleError::AlreadyRunning`] without doing anything if
    /// another cycle is in progress.
    pub async fn run_on(&self, today: NaiveDate) -> Result<CycleReport, CycleError> {
        let _guard = self.running.try_lock().map_err(|_| CycleError::AlreadyRunning)?;

        self.audit
            .note(&format!("ip blacklister starting to scan logs @ {}", Local::now()))
            .await;

        let result = self.execute(today).await;
        self.transition(CycleState::Idle);

        match &result {
            Ok(report) => {
                info!(
                    candidates = report.candidates,
                    checked = report.checked,
                    failed_lookups = report.failed_lookups,
                    unsettled = report.unsettled,
                    banned = report.banned.len(),
                    inserted = report.inserted,
                    refreshed = report.refreshed,
                    "Cycle complete"
                );
                self.audit
                    .note(&format!("ip blacklister scanned logs @ {}", Local::now()))
                    .await;
            }
            Err(e) => {
                error!(error = %e, "Cycle aborted");
                self.audit
                    .note(&format!("ip blacklister cycle aborted @ {}: {}", Local::now(), e))
                    .await;
            }
        }

        result
    }

    fn transition(&self, next: CycleState) {
        if let Ok(mut state) = self.state.write() {
            debug!(from = ?*state, to = ?next, "Cycle state");
            *state = next;
        }
    }

    fn is_allowlisted(&self, ip: &IpAddr) -> bool {
        self.allowlist.iter().any(|entry| entry.contains(ip))
    }

    async fn execute(&self, today: NaiveDate) -> Result<CycleReport, CycleError> {
        self.transition(CycleState::Extracting);
        let logs = self.logs.clone();
        let candidates = match tokio::task::spawn_blocking(move || read_logs(&logs)).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Log extraction task failed");
                HashSet::new()
            }
        };

        self.transition(CycleState::Partitioning);
        let recent = self.store.recent_addresses(today).await?;
        let stale = self.store.stale_addresses(today).await?;
        let partition = Partition::compute(&candidates, &recent, &stale);

        let mut report = CycleReport {
            candidates: candidates.len(),
            recent: recent.len(),
            stale: stale.len(),
            checked: partition.to_check.len(),
            ..CycleReport::default()
        };

        debug!(
            candidates = report.candidates,
            recent = report.recent,
            stale = report.stale,
            to_check = partition.to_check.len(),
            "Partitioned candidates"
        );

        if partition.to_check.is_empty() {
            return Ok(report);
        }

        self.transition(CycleState::Querying);
        let outcome = check_all_with_timeout(
            self.provider.as_ref(),
            &partition.to_check,
            self.max_concurrency,
            self.batch_timeout,
        )
        .await;

        report.failed_lookups = outcome.failed.len();
        report.unsettled = outcome.unsettled;
        if outcome.nothing_settled() {
            return Err(CycleError::LookupTimeout(self.batch_timeout));
        }
        if outcome.service_unavailable() {
            return Err(CycleError::ReputationUnavailable {
                attempted: outcome.failed.len(),
            });
        }

        self.transition(CycleState::Deciding);
        let mut to_ban = Vec::new();
        for result in &outcome.results {
            if !self.policy.decide(result) {
                continue;
            }
            if self.is_allowlisted(&result.address) {
                info!(
                    ip = %result.address,
                    score = result.confidence_score,
                    "Abusive address is allowlisted, not banning"
                );
                continue;
            }
            to_ban.push(result.address);
        }

        self.transition(CycleState::Enforcing);
        for ip in to_ban {
            match self.sink.ban(&ip).await {
                Ok(()) => report.banned.push(ip),
                Err(e) => {
                    warn!(ip = %ip, error = %e, "Failed to ban address");
                    report.ban_failures += 1;
                }
            }
        }

        // Enforcement outcome does not gate persistence; lookup success does.
        self.transition(CycleState::Persisting);
        let evaluated: HashSet<IpAddr> = outcome.evaluated().collect();
        let to_insert: Vec<IpAddr> = partition
            .to_insert
            .iter()
            .filter(|ip| evaluated.contains(ip))
            .copied()
            .collect();
        let to_refresh: Vec<IpAddr> = partition
            .to_refresh
            .iter()
            .filter(|ip| evaluated.contains(ip))
            .copied()
            .collect();

        report.inserted = self.store.insert_new(&to_insert, today).await?;
        report.refreshed = self.store.refresh(&to_refresh, today).await?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(list: &[&str]) -> HashSet<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn vec(list: &[&str]) -> Vec<IpAddr> {
        let mut v: Vec<IpAddr> = list.iter().map(|s| s.parse().unwrap()).collect();
        v.sort();
        v
    }

    #[test]
    fn test_partition() {
        let candidates = set(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]);
        let recent = set(&["1.1.1.1", "9.9.9.9"]);
        let stale = set(&["2.2.2.2", "8.8.8.8"]);

        let partition = Partition::compute(&candidates, &recent, &stale);

        assert_eq!(partition.to_check, vec(&["2.2.2.2", "3.3.3.3", "8.8.8.8"]));
        assert_eq!(partition.to_insert, vec(&["3.3.3.3"]));
        assert_eq!(partition.to_refresh, vec(&["2.2.2.2", "8.8.8.8"]));
    }

    #[test]
    fn test_partition_recent_never_checked() {
        let candidates = set(&["1.1.1.1", "2.2.2.2"]);
        let recent = set(&["1.1.1.1", "2.2.2.2"]);

        let partition = Partition::compute(&candidates, &recent, &HashSet::new());
        assert!(partition.to_check.is_empty());
        assert!(partition.to_insert.is_empty());
        assert!(partition.to_refresh.is_empty());
    }

    #[test]
    fn test_partition_insert_refresh_disjoint() {
        let candidates = set(&["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4"]);
        let recent = set(&["4.4.4.4"]);
        let stale = set(&["1.1.1.1", "5.5.5.5"]);

        let partition = Partition::compute(&candidates, &recent, &stale);
        let insert: HashSet<_> = partition.to_insert.iter().collect();
        let refresh: HashSet<_> = partition.to_refresh.iter().collect();
        let check: HashSet<_> = partition.to_check.iter().collect();

        assert!(insert.is_disjoint(&refresh));
        let union: HashSet<_> = insert.union(&refresh).copied().collect();
        assert_eq!(union, check);
        for ip in &stale {
            assert!(check.contains(ip));
            assert!(!insert.contains(ip));
        }
    }

    #[test]
    fn test_partition_empty_store() {
        let candidates = set(&["1.2.3.4"]);
        let partition = Partition::compute(&candidates, &HashSet::new(), &HashSet::new());
        assert_eq!(partition.to_check, vec(&["1.2.3.4"]));
        assert_eq!(partition.to_insert, vec(&["1.2.3.4"]));
        assert!(partition.to_refresh.is_empty());
    }
}
