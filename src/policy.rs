//! Ban decision policy.

use crate::config::Thresholds;
use crate::providers::ReputationResult;

/// Decides whether a reputation result warrants a ban.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BanPolicy {
    thresholds: Thresholds,
}

impl BanPolicy {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    /// Ban if and only if the service had data, the confidence score is
    /// strictly above the score threshold and the report count is strictly
    /// above the report threshold.
    pub fn decide(&self, result: &ReputationResult) -> bool {
        result.present
            && result.confidence_score > self.thresholds.min_confidence
            && result.total_reports > self.thresholds.min_reports
    }
}
