//! Freshness store: when each address was last evaluated.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use sqlx::sqlite::{self, SqlitePool};
use sqlx::Row;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info, warn};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Durable mapping of address to last-evaluated date.
///
/// Every stored address is either recent or stale relative to a given day,
/// never both.
#[async_trait]
pub trait FreshnessStore: Send + Sync {
    /// Addresses evaluated within the freshness window ending at `today`.
    async fn recent_addresses(&self, today: NaiveDate) -> Result<HashSet<IpAddr>, StoreError>;

    /// Addresses with a record outside the freshness window.
    async fn stale_addresses(&self, today: NaiveDate) -> Result<HashSet<IpAddr>, StoreError>;

    /// Insert records for addresses not yet stored. Existing records are left
    /// untouched. Returns the number of records created.
    async fn insert_new(&self, addresses: &[IpAddr], as_of: NaiveDate) -> Result<u64, StoreError>;

    /// Bump the date of existing records. Unknown addresses are ignored.
    /// Returns the number of records updated.
    async fn refresh(&self, addresses: &[IpAddr], as_of: NaiveDate) -> Result<u64, StoreError>;
}

/// SQLite-backed freshness store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: SqlitePool,
    window_days: u32,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path`.
    pub async fn open(path: impl AsRef<Path>, window_days: u32) -> Result<Self, StoreError> {
        let opts = sqlite::SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(sqlite::SqliteJournalMode::Wal);
        let db = sqlite::SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        init_db(&db).await?;
        info!(database = %path.as_ref().display(), window_days, "Freshness store opened");

        Ok(Self { db, window_days })
    }

    /// Last-evaluated date of a single address, if stored.
    pub async fn last_evaluated(&self, ip: &IpAddr) -> Result<Option<NaiveDate>, StoreError> {
        let row = sqlx::query("SELECT day FROM iptable WHERE ip = ?1")
            .bind(ip.to_string())
            .fetch_optional(&self.db)
            .await?;

        Ok(row.and_then(|row| {
            let day: String = row.try_get("day").ok()?;
            NaiveDate::parse_from_str(&day, DATE_FORMAT).ok()
        }))
    }

    /// Number of stored records.
    pub async fn len(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM iptable")
            .fetch_one(&self.db)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.db.close().await;
    }

    fn window(&self, today: NaiveDate) -> (String, String) {
        let start = today
            .checked_sub_days(Days::new(u64::from(self.window_days)))
            .unwrap_or(NaiveDate::MIN);
        (
            start.format(DATE_FORMAT).to_string(),
            today.format(DATE_FORMAT).to_string(),
        )
    }

    async fn select_addresses(
        &self,
        sql: &str,
        today: NaiveDate,
    ) -> Result<HashSet<IpAddr>, StoreError> {
        let (start, end) = self.window(today);
        let rows = sqlx::query(sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.db)
            .await?;

        let mut addresses = HashSet::with_capacity(rows.len());
        for row in rows {
            let ip: String = row.try_get("ip")?;
            match ip.parse() {
                Ok(addr) => {
                    addresses.insert(addr);
                }
                Err(_) => warn!(ip = %ip, "Skipping malformed address in store"),
            }
        }
        Ok(addresses)
    }
}

async fn init_db(db: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS iptable (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip TEXT UNIQUE NOT NULL,
            day TEXT NOT NULL
        )",
    )
    .execute(db)
    .await?;
    Ok(())
}

#[async_trait]
impl FreshnessStore for SqliteStore {
    async fn recent_addresses(&self, today: NaiveDate) -> Result<HashSet<IpAddr>, StoreError> {
        self.select_addresses(
            "SELECT ip FROM iptable WHERE day BETWEEN ?1 AND ?2",
            today,
        )
        .await
    }

    async fn stale_addresses(&self, today: NaiveDate) -> Result<HashSet<IpAddr>, StoreError> {
        self.select_addresses(
            "SELECT ip FROM iptable WHERE NOT (day BETWEEN ?1 AND ?2)",
            today,
        )
        .await
    }

    async fn insert_new(&self, addresses: &[IpAddr], as_of: NaiveDate) -> Result<u64, StoreError> {
        if addresses.is_empty() {
            return Ok(0);
        }

        let day = as_of.format(DATE_FORMAT).to_string();
        let mut tx = self.db.begin().await?;
        let mut inserted = 0;
        for ip in addresses {
            inserted += sqlx::query("INSERT OR IGNORE INTO iptable (ip, day) VALUES (?1, ?2)")
                .bind(ip.to_string())
                .bind(&day)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        debug!(requested = addresses.len(), inserted, "Inserted new addresses");
        Ok(inserted)
    }

    async fn refresh(&self, addresses: &[IpAddr], as_of: NaiveDate) -> Result<u64, StoreError> {
        if addresses.is_empty() {
            return Ok(0);
        }

        let day = as_of.format(DATE_FORMAT).to_string();
        let mut tx = self.db.begin().await?;
        let mut updated = 0;
        for ip in addresses {
            updated += sqlx::query("UPDATE iptable SET day = ?1 WHERE ip = ?2")
                .bind(&day)
                .bind(ip.to_string())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        debug!(requested = addresses.len(), updated, "Refreshed stale addresses");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db"), 30).await.unwrap();
        (dir, store)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");

        let store = SqliteStore::open(&path, 30).await.unwrap();
        store.insert_new(&[ip("1.2.3.4")], day("2024-06-01")).await.unwrap();
        store.close().await;

        let reopened = SqliteStore::open(&path, 30).await.unwrap();
        assert_eq!(reopened.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_new_is_idempotent() {
        let (_dir, store) = open_store().await;
        let addrs = [ip("1.2.3.4"), ip("5.6.7.8")];

        assert_eq!(store.insert_new(&addrs, day("2024-06-01")).await.unwrap(), 2);
        assert_eq!(store.insert_new(&addrs, day("2024-06-01")).await.unwrap(), 0);
        assert_eq!(store.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_new_keeps_existing_date() {
        let (_dir, store) = open_store().await;
        store.insert_new(&[ip("1.2.3.4")], day("2024-01-01")).await.unwrap();
        store.insert_new(&[ip("1.2.3.4")], day("2024-06-01")).await.unwrap();

        assert_eq!(
            store.last_evaluated(&ip("1.2.3.4")).await.unwrap(),
            Some(day("2024-01-01"))
        );
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_inserts() {
        let (_dir, store) = open_store().await;
        let first: Vec<IpAddr> = (1..=20).map(|n| ip(&format!("10.0.0.{}", n))).collect();
        let second: Vec<IpAddr> = (1..=20).map(|n| ip(&format!("10.0.1.{}", n))).collect();

        let (a, b) = tokio::join!(
            store.insert_new(&first, day("2024-06-01")),
            store.insert_new(&second, day("2024-06-01")),
        );
        assert_eq!(a.unwrap() + b.unwrap(), 40);
        assert_eq!(store.len().await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_recent_and_stale_partition() {
        let (_dir, store) = open_store().await;
        let today = day("2024-06-30");

        store.insert_new(&[ip("1.1.1.1")], day("2024-06-30")).await.unwrap();
        store.insert_new(&[ip("2.2.2.2")], day("2024-05-31")).await.unwrap(); // exactly 30 days
        store.insert_new(&[ip("3.3.3.3")], day("2024-05-30")).await.unwrap();
        store.insert_new(&[ip("4.4.4.4")], day("2023-01-01")).await.unwrap();

        let recent = store.recent_addresses(today).await.unwrap();
        let stale = store.stale_addresses(today).await.unwrap();

        assert_eq!(recent, [ip("1.1.1.1"), ip("2.2.2.2")].into_iter().collect());
        assert_eq!(stale, [ip("3.3.3.3"), ip("4.4.4.4")].into_iter().collect());
        assert!(recent.is_disjoint(&stale));
    }

    #[tokio::test]
    async fn test_refresh_updates_only_existing() {
        let (_dir, store) = open_store().await;
        store.insert_new(&[ip("1.1.1.1")], day("2024-01-01")).await.unwrap();

        let updated = store
            .refresh(&[ip("1.1.1.1"), ip("9.9.9.9")], day("2024-06-30"))
            .await
            .unwrap();

        assert_eq!(updated, 1);
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(
            store.last_evaluated(&ip("1.1.1.1")).await.unwrap(),
            Some(day("2024-06-30"))
        );
        assert_eq!(store.last_evaluated(&ip("9.9.9.9")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_makes_stale_recent() {
        let (_dir, store) = open_store().await;
        let today = day("2024-06-30");
        store.insert_new(&[ip("1.1.1.1")], day("2024-01-01")).await.unwrap();
        assert!(store.stale_addresses(today).await.unwrap().contains(&ip("1.1.1.1")));

        store.refresh(&[ip("1.1.1.1")], today).await.unwrap();

        assert!(store.stale_addresses(today).await.unwrap().is_empty());
        assert!(store.recent_addresses(today).await.unwrap().contains(&ip("1.1.1.1")));
    }

    #[tokio::test]
    async fn test_ipv6_addresses() {
        let (_dir, store) = open_store().await;
        let today = day("2024-06-30");
        store.insert_new(&[ip("2001:db8::1")], today).await.unwrap();

        assert!(store.recent_addresses(today).await.unwrap().contains(&ip("2001:db8::1")));
    }

    #[tokio::test]
    async fn test_hostile_address_text_is_bound() {
        let (_dir, store) = open_store().await;
        let today = day("2024-06-30");
        sqlx::query("INSERT INTO iptable (ip, day) VALUES (?1, ?2)")
            .bind("1.1.1.1'); DROP TABLE iptable; --")
            .bind("2024-06-30")
            .execute(&store.db)
            .await
            .unwrap();
        store.insert_new(&[ip("1.2.3.4")], today).await.unwrap();

        let recent = store.recent_addresses(today).await.unwrap();
        assert_eq!(recent, [ip("1.2.3.4")].into_iter().collect());
        assert_eq!(store.len().await.unwrap(), 2);
    }
}
