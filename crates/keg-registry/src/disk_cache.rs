//! On-disk cache of path-info lookups against remote stores.
//!
//! Sits between the in-memory LRU and the backend: remembers, per store URI
//! and hash part, either the full path info or the fact that the path was
//! absent. Entries expire on separate positive and negative TTLs.

use crate::error::RegistryResult;
use keg_core::path_info::ValidPathInfo;
use keg_core::store_path::StoreDir;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

const CACHE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS BinaryCaches (
    id  INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT UNIQUE NOT NULL
);

CREATE TABLE IF NOT EXISTS NarInfos (
    cache     INTEGER NOT NULL,
    hashPart  TEXT NOT NULL,
    present   INTEGER NOT NULL,
    info      TEXT,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (cache, hashPart),
    FOREIGN KEY (cache) REFERENCES BinaryCaches(id) ON DELETE CASCADE
);
";

/// Outcome of a disk-cache probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    /// Nothing cached (or the entry expired).
    Unknown,
    /// The backend answered "not present" within the negative TTL.
    Missing,
    /// A cached path info within the positive TTL.
    Present(ValidPathInfo),
}

/// Persistent lookup cache keyed by (store URI, hash part).
pub struct DiskCache {
    pool: Pool<Sqlite>,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl DiskCache {
    /// Open (and bootstrap) the cache database at `path`.
    pub async fn open(
        path: impl AsRef<Path>,
        positive_ttl: Duration,
        negative_ttl: Duration,
    ) -> RegistryResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        Self::connect(options, positive_ttl, negative_ttl).await
    }

    /// Open an in-memory cache.
    pub async fn in_memory(
        positive_ttl: Duration,
        negative_ttl: Duration,
    ) -> RegistryResult<Self> {
        let options = SqliteConnectOptions::new().in_memory(true).foreign_keys(true);
        Self::connect(options, positive_ttl, negative_ttl).await
    }

    async fn connect(
        options: SqliteConnectOptions,
        positive_ttl: Duration,
        negative_ttl: Duration,
    ) -> RegistryResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(CACHE_SCHEMA).execute(&pool).await?;
        Ok(Self { pool, positive_ttl, negative_ttl })
    }

    async fn cache_id(&self, uri: &str) -> RegistryResult<i64> {
        sqlx::query("INSERT OR IGNORE INTO BinaryCaches (url) VALUES (?)")
            .bind(uri)
            .execute(&self.pool)
            .await?;
        let id: i64 = sqlx::query("SELECT id FROM BinaryCaches WHERE url = ?")
            .bind(uri)
            .fetch_one(&self.pool)
            .await?
            .get(0);
        Ok(id)
    }

    /// Probe the cache, honoring the TTLs.
    pub async fn lookup(
        &self,
        store_dir: &StoreDir,
        uri: &str,
        hash_part: &str,
    ) -> RegistryResult<CacheLookup> {
        let row = sqlx::query(
            "SELECT n.present, n.info, n.timestamp FROM NarInfos n
             JOIN BinaryCaches c ON c.id = n.cache
             WHERE c.url = ? AND n.hashPart = ?",
        )
        .bind(uri)
        .bind(hash_part)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(CacheLookup::Unknown),
        };

        let present: bool = row.get("present");
        let timestamp: i64 = row.get("timestamp");
        let ttl = if present { self.positive_ttl } else { self.negative_ttl };
        let age = OffsetDateTime::now_utc().unix_timestamp() - timestamp;
        if age < 0 || age as u64 >= ttl.as_secs() {
            debug!(uri, hash_part, present, age, "disk cache entry expired");
            return Ok(CacheLookup::Unknown);
        }

        if !present {
            return Ok(CacheLookup::Missing);
        }
        let text: String = row.get("info");
        match ValidPathInfo::parse_text(store_dir, &text) {
            Ok(info) => Ok(CacheLookup::Present(info)),
            // a corrupt entry behaves like a miss rather than poisoning reads
            Err(e) => {
                debug!(uri, hash_part, error = %e, "dropping corrupt disk cache entry");
                Ok(CacheLookup::Unknown)
            }
        }
    }

    /// Record a positive result.
    pub async fn upsert_present(
        &self,
        store_dir: &StoreDir,
        uri: &str,
        info: &ValidPathInfo,
    ) -> RegistryResult<()> {
        let cache = self.cache_id(uri).await?;
        sqlx::query(
            "INSERT OR REPLACE INTO NarInfos (cache, hashPart, present, info, timestamp)
             VALUES (?, ?, 1, ?, ?)",
        )
        .bind(cache)
        .bind(info.path.hash_part().as_str())
        .bind(info.to_text(store_dir))
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a negative result.
    pub async fn upsert_missing(&self, uri: &str, hash_part: &str) -> RegistryResult<()> {
        let cache = self.cache_id(uri).await?;
        sqlx::query(
            "INSERT OR REPLACE INTO NarInfos (cache, hashPart, present, info, timestamp)
             VALUES (?, ?, 0, NULL, ?)",
        )
        .bind(cache)
        .bind(hash_part)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keg_core::hash::{Algorithm, Hash};
    use keg_core::store_path::StorePath;

    fn store_dir() -> StoreDir {
        StoreDir::default()
    }

    fn sample_info() -> ValidPathInfo {
        let path = StorePath::from_basename("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pkg").unwrap();
        ValidPathInfo::new(path, Hash::of(Algorithm::Sha256, b"nar"), 10)
    }

    #[tokio::test]
    async fn test_positive_entry_roundtrip() {
        let cache = DiskCache::in_memory(Duration::from_secs(3600), Duration::from_secs(3600))
            .await
            .unwrap();
        let info = sample_info();
        cache
            .upsert_present(&store_dir(), "ssh://peer", &info)
            .await
            .unwrap();

        let got = cache
            .lookup(&store_dir(), "ssh://peer", "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .await
            .unwrap();
        assert_eq!(got, CacheLookup::Present(info));
    }

    #[tokio::test]
    async fn test_negative_entry_and_unknown() {
        let cache = DiskCache::in_memory(Duration::from_secs(3600), Duration::from_secs(3600))
            .await
            .unwrap();
        cache
            .upsert_missing("ssh://peer", "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")
            .await
            .unwrap();

        assert_eq!(
            cache
                .lookup(&store_dir(), "ssh://peer", "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")
                .await
                .unwrap(),
            CacheLookup::Missing
        );
        assert_eq!(
            cache
                .lookup(&store_dir(), "ssh://peer", "cccccccccccccccccccccccccccccccc")
                .await
                .unwrap(),
            CacheLookup::Unknown
        );
        // a different store URI does not see the entry
        assert_eq!(
            cache
                .lookup(&store_dir(), "ssh://other", "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")
                .await
                .unwrap(),
            CacheLookup::Unknown
        );
    }

    #[tokio::test]
    async fn test_negative_ttl_expiry() {
        let cache = DiskCache::in_memory(Duration::from_secs(3600), Duration::ZERO)
            .await
            .unwrap();
        cache
            .upsert_missing("ssh://peer", "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")
            .await
            .unwrap();
        // a zero TTL expires immediately
        assert_eq!(
            cache
                .lookup(&store_dir(), "ssh://peer", "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")
                .await
                .unwrap(),
            CacheLookup::Unknown
        );
    }

    #[tokio::test]
    async fn test_present_overrides_missing() {
        let cache = DiskCache::in_memory(Duration::from_secs(3600), Duration::from_secs(3600))
            .await
            .unwrap();
        let info = sample_info();
        cache
            .upsert_missing("ssh://peer", info.path.hash_part().as_str())
            .await
            .unwrap();
        cache
            .upsert_present(&store_dir(), "ssh://peer", &info)
            .await
            .unwrap();
        assert_eq!(
            cache
                .lookup(&store_dir(), "ssh://peer", info.path.hash_part().as_str())
                .await
                .unwrap(),
            CacheLookup::Present(info)
        );
    }
}
