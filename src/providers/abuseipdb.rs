//! AbuseIPDB reputation provider.

use super::{ProviderError, ReputationProvider, ReputationResult};
use crate::config::ReputationConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// AbuseIPDB API response.
#[derive(Debug, Deserialize)]
struct AbuseIPDBResponse {
    data: AbuseIPDBData,
}

/// AbuseIPDB API response data.
#[derive(Debug, Deserialize)]
struct AbuseIPDBData {
    /// Address the report is about.
    #[serde(rename = "ipAddress")]
    ip_address: String,

    /// Abuse confidence score (0-100).
    #[serde(rename = "abuseConfidenceScore")]
    abuse_confidence_score: u8,

    /// Total number of reports.
    #[serde(rename = "totalReports")]
    total_reports: u32,
}

/// AbuseIPDB reputation provider.
pub struct AbuseIPDBProvider {
    config: ReputationConfig,
    api_key: String,
    client: Client,
}

impl AbuseIPDBProvider {
    /// Create a new AbuseIPDB provider.
    pub fn new(config: ReputationConfig, api_key: String) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            config,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl ReputationProvider for AbuseIPDBProvider {
    async fn check(&self, ip: &IpAddr) -> Result<ReputationResult, ProviderError> {
        debug!(ip = %ip, "Querying AbuseIPDB");

        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&[
                ("ipAddress", ip.to_string()),
                ("maxAgeInDays", self.config.max_age_days.to_string()),
            ])
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        // Check for rate limiting
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("AbuseIPDB rate limit exceeded");
            return Err(ProviderError::RateLimited);
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        let api_response: AbuseIPDBResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        let data = api_response.data;
        if data.ip_address.parse::<IpAddr>().ok() != Some(*ip) {
            return Err(ProviderError::InvalidResponse(format!(
                "response is about {} instead of {}",
                data.ip_address, ip
            )));
        }

        debug!(
            ip = %ip,
            score = data.abuse_confidence_score,
            reports = data.total_reports,
            "AbuseIPDB lookup complete"
        );

        Ok(ReputationResult::found(
            *ip,
            data.abuse_confidence_score,
            data.total_reports,
        ))
    }

    fn name(&self) -> &str {
        "abuseipdb"
    }
}
