//! Error types shared across the blacklister.

use thiserror::Error;

/// Configuration could not be loaded or is invalid.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML or has an unknown value
    /// (for example an unrecognised `mode`).
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The configuration parsed but failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The freshness store is unavailable or returned an error.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Error from a reputation provider for a single address.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    /// Request timed out.
    #[error("request timed out")]
    Timeout,

    /// Rate limited by the remote service.
    #[error("rate limited")]
    RateLimited,

    /// The service answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// True if the error says the service itself cannot be used (transport
    /// failure, timeout, throttling or rejected credentials) rather than
    /// that it had no answer for this particular address.
    pub fn is_outage(&self) -> bool {
        match self {
            ProviderError::Http(_) | ProviderError::Timeout | ProviderError::RateLimited => true,
            ProviderError::Status { status, .. } => {
                matches!(*status, 401 | 403) || *status >= 500
            }
            ProviderError::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Http(e)
        }
    }
}

/// The firewall action could not be carried out.
#[derive(Error, Debug)]
pub enum EnforcementError {
    /// The firewall program could not be started.
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The firewall program exited unsuccessfully.
    #[error("`{program}` exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// A whole cycle was aborted.
#[derive(Error, Debug)]
pub enum CycleError {
    /// Another cycle is already in progress.
    #[error("a cycle is already running")]
    AlreadyRunning,

    /// The freshness store failed; nothing was persisted.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Every reputation lookup in a non-empty batch failed, at least one of
    /// them because the service could not be used.
    #[error("reputation service unavailable: all {attempted} lookups failed")]
    ReputationUnavailable { attempted: usize },

    /// The batch timeout expired before any lookup settled.
    #[error("no reputation lookup completed within {0:?}")]
    LookupTimeout(std::time::Duration),
}
