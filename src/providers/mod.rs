//! IP reputation providers and concurrent batch lookups.

pub mod abuseipdb;

pub use crate::error::ProviderError;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a reputation check for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationResult {
    /// Address this result is about.
    pub address: IpAddr,

    /// Abuse confidence score (0-100, higher = worse).
    pub confidence_score: u8,

    /// Number of abuse reports in the lookup window.
    pub total_reports: u32,

    /// Whether the service returned data for this address. A result that is
    /// not present never leads to a ban.
    pub present: bool,
}

impl ReputationResult {
    /// Create a result with data from the service.
    pub fn found(address: IpAddr, confidence_score: u8, total_reports: u32) -> Self {
        Self {
            address,
            confidence_score: confidence_score.min(100),
            total_reports,
            present: true,
        }
    }

    /// Create a "no data" result.
    pub fn absent(address: IpAddr) -> Self {
        Self {
            address,
            confidence_score: 0,
            total_reports: 0,
            present: false,
        }
    }
}

/// Trait for IP reputation providers.
#[async_trait]
pub trait ReputationProvider: Send + Sync {
    /// Check the reputation of an IP address.
    async fn check(&self, ip: &IpAddr) -> Result<ReputationResult, ProviderError>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

/// Outcome of a batch of lookups.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// One entry per queried address. Failed and unsettled lookups appear
    /// as absent.
    pub results: Vec<ReputationResult>,

    /// Addresses whose lookup failed or did not settle in time.
    pub failed: HashSet<IpAddr>,

    /// Failed lookups whose error means the service could not be used.
    pub outages: usize,

    /// Lookups still in flight when the batch timeout expired.
    pub unsettled: usize,
}

impl BatchOutcome {
    /// Addresses whose lookup completed, with or without data.
    pub fn evaluated(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.results
            .iter()
            .map(|r| r.address)
            .filter(move |ip| !self.failed.contains(ip))
    }

    /// True if addresses were queried and none of them succeeded.
    pub fn all_failed(&self) -> bool {
        !self.failed.is_empty() && self.failed.len() == self.results.len()
    }

    /// True if nothing succeeded and the service itself looks unusable.
    ///
    /// A batch where every address merely had no answer (for example an
    /// HTTP 422 for each) is not an outage.
    pub fn service_unavailable(&self) -> bool {
        self.all_failed() && self.outages > 0
    }

    /// True if the batch timeout expired before any lookup settled.
    pub fn nothing_settled(&self) -> bool {
        self.unsettled > 0 && self.unsettled == self.results.len()
    }
}

/// Query `provider` for every address concurrently.
///
/// At most `max_concurrency` lookups are in flight at once; 0 starts them
/// all up front. A failed lookup is logged and recorded as absent without
/// affecting the other lookups. Results are in completion order.
pub async fn check_all(
    provider: &dyn ReputationProvider,
    addresses: &[IpAddr],
    max_concurrency: usize,
) -> BatchOutcome {
    run_batch(provider, addresses, max_concurrency, None).await
}

/// Like [`check_all`], but stops waiting after `timeout`.
///
/// Lookups that settled before the deadline are kept. The ones still in
/// flight are dropped and recorded as failed, so they are retried by a
/// later cycle.
pub async fn check_all_with_timeout(
    provider: &dyn ReputationProvider,
    addresses: &[IpAddr],
    max_concurrency: usize,
    timeout: Duration,
) -> BatchOutcome {
    run_batch(provider, addresses, max_concurrency, Some(timeout)).await
}

async fn run_batch(
    provider: &dyn ReputationProvider,
    addresses: &[IpAddr],
    max_concurrency: usize,
    timeout: Option<Duration>,
) -> BatchOutcome {
    if addresses.is_empty() {
        return BatchOutcome::default();
    }

    let limit = if max_concurrency == 0 {
        addresses.len()
    } else {
        max_concurrency
    };

    let lookups = stream::iter(addresses.iter().copied())
        .map(|ip| async move { (ip, provider.check(&ip).await) })
        .buffer_unordered(limit);

    let settled: Vec<(IpAddr, Result<ReputationResult, ProviderError>)> = match timeout {
        Some(timeout) => {
            lookups
                .take_until(tokio::time::sleep(timeout))
                .collect()
                .await
        }
        None => lookups.collect().await,
    };

    let mut outcome = BatchOutcome {
        results: Vec::with_capacity(addresses.len()),
        ..BatchOutcome::default()
    };

    for (ip, result) in settled {
        match result {
            Ok(result) => outcome.results.push(result),
            Err(e) => {
                warn!(
                    provider = provider.name(),
                    ip = %ip,
                    error = %e,
                    "Reputation lookup failed"
                );
                if e.is_outage() {
                    outcome.outages += 1;
                }
                outcome.failed.insert(ip);
                outcome.results.push(ReputationResult::absent(ip));
            }
        }
    }

    if outcome.results.len() < addresses.len() {
        let seen: HashSet<IpAddr> = outcome.results.iter().map(|r| r.address).collect();
        for ip in addresses.iter().filter(|ip| !seen.contains(ip)) {
            outcome.failed.insert(*ip);
            outcome.results.push(ReputationResult::absent(*ip));
            outcome.unsettled += 1;
        }

        warn!(
            provider = provider.name(),
            timeout = ?timeout,
            settled = addresses.len() - outcome.unsettled,
            unsettled = outcome.unsettled,
            "Reputation batch timed out, keeping settled lookups"
        );
    }

    debug!(
        provider = provider.name(),
        queried = addresses.len(),
        failed = outcome.failed.len(),
        "Reputation batch settled"
    );

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that fails for one address and tracks concurrency.
    struct FakeProvider {
        failing: IpAddr,
        failing_status: u16,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeProvider {
        fn new(failing: &str) -> Self {
            Self::with_status(failing, 500)
        }

        fn with_status(failing: &str, failing_status: u16) -> Self {
            Self {
                failing: failing.parse().unwrap(),
                failing_status,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReputationProvider for FakeProvider {
        async fn check(&self, ip: &IpAddr) -> Result<ReputationResult, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if *ip == self.failing {
                Err(ProviderError::Status {
                    status: self.failing_status,
                    body: String::new(),
                })
            } else {
                Ok(ReputationResult::found(*ip, 10, 1))
            }
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    fn addrs(n: u8) -> Vec<IpAddr> {
        (1..=n).map(|i| format!("192.0.2.{}", i).parse().unwrap()).collect()
    }

    #[test]
    fn test_absent_result() {
        let result = ReputationResult::absent("1.2.3.4".parse().unwrap());
        assert!(!result.present);
        assert_eq!(result.total_reports, 0);
    }

    #[tokio::test]
    async fn test_one_failure_isolated() {
        let provider = FakeProvider::new("192.0.2.3");
        let outcome = check_all(&provider, &addrs(5), 0).await;

        assert_eq!(outcome.results.len(), 5);
        assert_eq!(outcome.results.iter().filter(|r| r.present).count(), 4);
        assert_eq!(outcome.failed, HashSet::from(["192.0.2.3".parse::<IpAddr>().unwrap()]));
        assert!(!outcome.all_failed());

        let evaluated: HashSet<IpAddr> = outcome.evaluated().collect();
        assert_eq!(evaluated.len(), 4);
        assert!(!evaluated.contains(&"192.0.2.3".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_unbounded_starts_everything() {
        let provider = FakeProvider::new("0.0.0.0");
        check_all(&provider, &addrs(8), 0).await;
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let provider = FakeProvider::new("0.0.0.0");
        let outcome = check_all(&provider, &addrs(10), 3).await;

        assert_eq!(outcome.results.len(), 10);
        let max = provider.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 3);
        assert!(max > 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let provider = FakeProvider::new("0.0.0.0");
        let outcome = check_all(&provider, &[], 4).await;
        assert!(outcome.results.is_empty());
        assert!(!outcome.all_failed());
    }

    #[tokio::test]
    async fn test_all_failed() {
        let provider = FakeProvider::new("192.0.2.1");
        let outcome = check_all(&provider, &addrs(1), 4).await;
        assert!(outcome.all_failed());
        assert!(outcome.service_unavailable());
        assert_eq!(outcome.evaluated().count(), 0);
    }

    #[tokio::test]
    async fn test_unprocessable_address_is_not_an_outage() {
        let provider = FakeProvider::with_status("192.0.2.1", 422);
        let outcome = check_all(&provider, &addrs(1), 4).await;
        assert!(outcome.all_failed());
        assert_eq!(outcome.outages, 0);
        assert!(!outcome.service_unavailable());
    }

    #[test]
    fn test_outage_classification() {
        let status = |status| ProviderError::Status {
            status,
            body: String::new(),
        };
        assert!(ProviderError::Timeout.is_outage());
        assert!(ProviderError::RateLimited.is_outage());
        assert!(status(401).is_outage());
        assert!(status(403).is_outage());
        assert!(status(503).is_outage());
        assert!(!status(422).is_outage());
        assert!(!status(404).is_outage());
        assert!(!ProviderError::InvalidResponse("bad".into()).is_outage());
    }

    #[tokio::test]
    async fn test_batch_timeout_keeps_settled_lookups() {
        let provider = FakeProvider::new("0.0.0.0");
        let addresses = addrs(4);
        let outcome =
            check_all_with_timeout(&provider, &addresses, 1, Duration::from_millis(50)).await;

        assert_eq!(outcome.results.len(), 4);
        assert!(outcome.unsettled > 0);
        assert!(!outcome.nothing_settled());
        assert_eq!(outcome.failed.len(), outcome.unsettled);
        assert_eq!(outcome.outages, 0);

        let evaluated: Vec<IpAddr> = outcome.evaluated().collect();
        assert!(!evaluated.is_empty());
        assert_eq!(evaluated.len() + outcome.unsettled, 4);
        // Cap of 1 starts lookups in order, so the settled ones are a prefix.
        assert_eq!(evaluated[0], addresses[0]);
    }

    #[tokio::test]
    async fn test_batch_timeout_before_anything_settles() {
        let provider = FakeProvider::new("0.0.0.0");
        let outcome =
            check_all_with_timeout(&provider, &addrs(3), 1, Duration::from_millis(1)).await;

        assert!(outcome.nothing_settled());
        assert_eq!(outcome.unsettled, 3);
        assert_eq!(outcome.evaluated().count(), 0);
    }

    #[tokio::test]
    async fn test_batch_within_timeout() {
        let provider = FakeProvider::new("192.0.2.2");
        let outcome =
            check_all_with_timeout(&provider, &addrs(3), 0, Duration::from_secs(5)).await;

        assert_eq!(outcome.unsettled, 0);
        assert_eq!(outcome.evaluated().count(), 2);
    }
}
