//! Configuration types for the IP blacklister.

use crate::error::ConfigError;
use croner::Cron;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Placeholder substituted with the offending address in the firewall command.
pub const IP_PLACEHOLDER: &str = "{ip}";

/// Root configuration, built once at startup and passed to every component.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Access logs to scan for client addresses.
    pub logs: Vec<PathBuf>,

    /// AbuseIPDB API key (supports ${ENV_VAR} syntax).
    pub api: String,

    /// How cycles are triggered.
    #[serde(default)]
    pub mode: Mode,

    /// Freshness store location.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Freshness window.
    #[serde(default)]
    pub freshness: FreshnessConfig,

    /// Reputation service settings.
    #[serde(default)]
    pub reputation: ReputationConfig,

    /// Ban thresholds.
    #[serde(default)]
    pub thresholds: Thresholds,

    /// Firewall enforcement.
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Append-only audit log of cycles and bans.
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,

    /// Settings for `mode: schedule`.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Settings for `mode: watchdog`.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Addresses that are never banned (single IPs or CIDR ranges).
    #[serde(default)]
    pub allowlist: Vec<String>,
}

/// Trigger strategy.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Run one cycle and exit.
    #[default]
    SingleRun,
    /// Run a cycle on a cron schedule.
    Schedule,
    /// Run a cycle whenever a watched log changes.
    Watchdog,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite database file. Created on first use.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("ip_blacklister.db")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FreshnessConfig {
    /// Addresses evaluated within this many days are not re-queried.
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
        }
    }
}

fn default_window_days() -> u32 {
    30
}

/// Reputation service configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReputationConfig {
    /// AbuseIPDB check endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Only consider reports from the last N days.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Maximum lookups in flight at once. 0 means unbounded.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Upper bound for a whole batch of lookups, in seconds.
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_seconds: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_age_days: default_max_age_days(),
            timeout_ms: default_timeout(),
            max_concurrency: default_max_concurrency(),
            batch_timeout_seconds: default_batch_timeout(),
        }
    }
}

fn default_endpoint() -> String {
    "https://api.abuseipdb.com/api/v2/check".to_string()
}

fn default_max_age_days() -> u32 {
    30
}

fn default_timeout() -> u64 {
    5000
}

fn default_max_concurrency() -> usize {
    16
}

fn default_batch_timeout() -> u64 {
    120
}

/// Ban thresholds. Both comparisons are strict.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct Thresholds {
    /// Ban only if the confidence score is above this value.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: u8,

    /// Ban only if the report count is above this value.
    #[serde(default = "default_min_reports")]
    pub min_reports: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            min_reports: default_min_reports(),
        }
    }
}

fn default_min_confidence() -> u8 {
    70
}

fn default_min_reports() -> u32 {
    10
}

/// Firewall command configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirewallConfig {
    /// Program and arguments; `{ip}` is replaced with the address.
    #[serde(default = "default_firewall_command")]
    pub command: Vec<String>,

    /// Log bans without running the command.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            command: default_firewall_command(),
            dry_run: false,
        }
    }
}

fn default_firewall_command() -> Vec<String> {
    ["ufw", "deny", "from", IP_PLACEHOLDER, "to", "any"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("ip_blacklister.log")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    /// Cron expression (minute hour day month weekday), local time.
    #[serde(default = "default_cron")]
    pub cron: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
        }
    }
}

fn default_cron() -> String {
    "0 12 * * *".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchConfig {
    /// How often to look for log changes, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.logs.is_empty() {
            return Err(invalid("at least one log file must be configured"));
        }

        if self.api.trim().is_empty() {
            return Err(invalid("api key is empty"));
        }

        if self.freshness.window_days == 0 {
            return Err(invalid("freshness.window_days must be at least 1"));
        }

        if let Err(e) = Cron::from_str(&self.schedule.cron) {
            return Err(invalid(format!(
                "invalid cron expression '{}': {}",
                self.schedule.cron, e
            )));
        }

        match self.firewall.command.first() {
            None => return Err(invalid("firewall.command is empty")),
            Some(program) if program.trim().is_empty() => {
                return Err(invalid("firewall.command has no program"))
            }
            Some(_) => {}
        }
        if !self.firewall.command.iter().any(|arg| arg.contains(IP_PLACEHOLDER)) {
            return Err(invalid(format!(
                "firewall.command must contain the {} placeholder",
                IP_PLACEHOLDER
            )));
        }

        for entry in &self.allowlist {
            if entry.parse::<IpAddr>().is_err() && entry.parse::<IpNet>().is_err() {
                return Err(invalid(format!("invalid allowlist entry: {}", entry)));
            }
        }

        Ok(())
    }

    /// Parse allowlist entries into IpAddr or IpNet.
    pub fn parse_allowlist(&self) -> Vec<AllowlistEntry> {
        self.allowlist
            .iter()
            .filter_map(|s| {
                if let Ok(ip) = s.parse::<IpAddr>() {
                    Some(AllowlistEntry::Single(ip))
                } else if let Ok(net) = s.parse::<IpNet>() {
                    Some(AllowlistEntry::Network(net))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# IP Blacklister Configuration

# Access logs to scan (client address at the start of each line)
logs:
  - "/var/log/apache2/access.log"

# AbuseIPDB API key
api: "${ABUSEIPDB_API_KEY}"

# single_run, schedule or watchdog
mode: schedule

database:
  path: "/var/lib/ip-blacklister/ip_blacklister.db"

freshness:
  window_days: 30              # Skip addresses evaluated in the last 30 days

reputation:
  endpoint: "https://api.abuseipdb.com/api/v2/check"
  max_age_days: 30             # Only consider reports from the last 30 days
  timeout_ms: 5000             # Per-request timeout
  max_concurrency: 16          # Lookups in flight at once (0 = unbounded)
  batch_timeout_seconds: 120   # Give up on the whole batch after this long

# Ban if score > min_confidence AND reports > min_reports
thresholds:
  min_confidence: 70
  min_reports: 10

firewall:
  command: ["ufw", "deny", "from", "{ip}", "to", "any"]
  dry_run: false

audit_log: "/var/log/ip_blacklister.log"

schedule:
  cron: "0 12 * * *"           # Daily at 12:00 local time

watch:
  poll_interval_seconds: 5

# Never banned, even with a bad reputation
allowlist:
  - "127.0.0.1"
  - "10.0.0.0/8"
"#
        .to_string()
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Parsed allowlist entry.
#[derive(Debug, Clone)]
pub enum AllowlistEntry {
    Single(IpAddr),
    Network(IpNet),
}

impl AllowlistEntry {
    /// Check if an IP address matches this allowlist entry.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            AllowlistEntry::Single(allowed) => allowed == ip,
            AllowlistEntry::Network(net) => net.contains(ip),
        }
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };

    re.replace_all(content, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
