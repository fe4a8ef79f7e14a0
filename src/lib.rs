//! IP blacklister.
//!
//! Scans web server access logs for client addresses, checks each one
//! against AbuseIPDB and bans abusive addresses through the host firewall.
//! Evaluated addresses are remembered in a SQLite freshness store so that
//! they are only re-checked once their record goes stale.
//!
//! # Features
//!
//! - **Log scanning** - Client addresses taken from the start of each line
//! - **Freshness store** - Skip addresses evaluated within the window (30 days)
//! - **Concurrent lookups** - Bounded fan-out of AbuseIPDB queries
//! - **Firewall bans** - Configurable command (`ufw deny from {ip} to any`)
//! - **Triggers** - Single run, cron schedule or log watch
//!
//! # Example Configuration
//!
//! ```yaml
//! logs:
//!   - "/var/log/apache2/access.log"
//! api: "${ABUSEIPDB_API_KEY}"
//! mode: schedule
//!
//! thresholds:
//!   min_confidence: 70
//!   min_reports: 10
//! ```

pub mod config;
pub mod cycle;
pub mod enforce;
pub mod error;
pub mod extract;
pub mod policy;
pub mod providers;
pub mod store;
pub mod trigger;

pub use config::Config;
pub use cycle::Cycle;
