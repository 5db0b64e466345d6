//! SQLite-backed valid-path registry.

use crate::error::{RegistryError, RegistryResult};
use keg_core::content_address::ContentAddress;
use keg_core::hash::{Algorithm, Hash, HashEncoding};
use keg_core::path_info::{Signature, ValidPathInfo};
use keg_core::store_path::{StoreDir, StorePath};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Registry schema (embedded).
const SCHEMA: &str = include_str!("schema.sql");

/// The persistent catalog of valid paths.
pub struct SqliteRegistry {
    pool: Pool<Sqlite>,
    store_dir: StoreDir,
}

impl SqliteRegistry {
    /// Open (and bootstrap) a registry database at `path`.
    pub async fn open(path: impl AsRef<Path>, store_dir: StoreDir) -> RegistryResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        Self::connect(options, store_dir).await
    }

    /// Open an in-memory registry (tests and ephemeral stores).
    pub async fn in_memory(store_dir: StoreDir) -> RegistryResult<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        Self::connect(options, store_dir).await
    }

    async fn connect(options: SqliteConnectOptions, store_dir: StoreDir) -> RegistryResult<Self> {
        // a single connection keeps in-memory databases coherent and
        // serializes writers on disk databases
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool, store_dir })
    }

    pub fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    /// Register a valid path. References (other than self) must already be
    /// registered. Re-registering replaces the row and its reference edges.
    pub async fn register(&self, info: &ValidPathInfo) -> RegistryResult<()> {
        let printed = self.store_dir.print_path(&info.path);
        debug!(path = %printed, "registering valid path");

        let mut tx = self.pool.begin().await?;

        let sigs = info
            .sigs
            .iter()
            .map(Signature::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        sqlx::query(
            "INSERT INTO ValidPaths
                 (path, hashPart, narHash, registrationTime, deriver, narSize, ultimate, sigs, ca)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(path) DO UPDATE SET
                 narHash = excluded.narHash,
                 registrationTime = excluded.registrationTime,
                 deriver = excluded.deriver,
                 narSize = excluded.narSize,
                 ultimate = excluded.ultimate,
                 sigs = excluded.sigs,
                 ca = excluded.ca",
        )
        .bind(&printed)
        .bind(info.path.hash_part().as_str())
        .bind(info.nar_hash.to_text(HashEncoding::Base16, true))
        .bind(info.registration_time)
        .bind(info.deriver.as_ref().map(|d| self.store_dir.print_path(d)))
        .bind(info.nar_size as i64)
        .bind(info.ultimate)
        .bind(sigs)
        .bind(ContentAddress::render_opt(&info.ca))
        .execute(&mut *tx)
        .await?;

        let referrer: i64 = sqlx::query("SELECT id FROM ValidPaths WHERE path = ?")
            .bind(&printed)
            .fetch_one(&mut *tx)
            .await?
            .get(0);

        sqlx::query("DELETE FROM Refs WHERE referrer = ?")
            .bind(referrer)
            .execute(&mut *tx)
            .await?;

        for reference in info.references_possibly_to_self() {
            let printed_ref = self.store_dir.print_path(&reference);
            let reference_id: i64 = sqlx::query("SELECT id FROM ValidPaths WHERE path = ?")
                .bind(&printed_ref)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| RegistryError::MissingReference(printed_ref.clone()))?
                .get(0);
            sqlx::query("INSERT OR IGNORE INTO Refs (referrer, reference) VALUES (?, ?)")
                .bind(referrer)
                .bind(reference_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Look up path info by hash part.
    pub async fn lookup(&self, hash_part: &str) -> RegistryResult<Option<ValidPathInfo>> {
        let row = sqlx::query(
            "SELECT id, path, narHash, registrationTime, deriver, narSize, ultimate, sigs, ca
             FROM ValidPaths WHERE hashPart = ?",
        )
        .bind(hash_part)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let id: i64 = row.get("id");
        let info = self.info_from_row(&row).await?;
        debug!(path = %info.path, id, "registry hit");
        Ok(Some(info))
    }

    /// Whether a path with this hash part is registered.
    pub async fn contains(&self, hash_part: &str) -> RegistryResult<bool> {
        let row = sqlx::query("SELECT 1 FROM ValidPaths WHERE hashPart = ?")
            .bind(hash_part)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Resolve a bare hash part to the full store path.
    pub async fn path_from_hash_part(&self, hash_part: &str) -> RegistryResult<Option<StorePath>> {
        let row = sqlx::query("SELECT path FROM ValidPaths WHERE hashPart = ?")
            .bind(hash_part)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| self.parse_path(row.get("path")))
            .transpose()
    }

    /// Paths that reference `path` (excluding itself).
    pub async fn referrers(&self, path: &StorePath) -> RegistryResult<Vec<StorePath>> {
        let printed = self.store_dir.print_path(path);
        let rows = sqlx::query(
            "SELECT v.path FROM Refs r
             JOIN ValidPaths v ON v.id = r.referrer
             WHERE r.reference = (SELECT id FROM ValidPaths WHERE path = ?)
               AND r.referrer != r.reference",
        )
        .bind(&printed)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| self.parse_path(row.get("path")))
            .collect()
    }

    /// Delete a path. Refused while any other valid path references it; a
    /// self-reference alone does not block deletion (the schema trigger
    /// drops that row first).
    pub async fn delete(&self, path: &StorePath) -> RegistryResult<()> {
        let printed = self.store_dir.print_path(path);
        if !self.referrers(path).await?.is_empty() {
            return Err(RegistryError::PathInUse(printed));
        }
        sqlx::query("DELETE FROM ValidPaths WHERE path = ?")
            .bind(&printed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a derivation output mapping.
    pub async fn add_derivation_output(
        &self,
        drv: &StorePath,
        id: &str,
        output: &StorePath,
    ) -> RegistryResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO DerivationOutputs (drv, id, path)
             VALUES ((SELECT id FROM ValidPaths WHERE path = ?), ?, ?)",
        )
        .bind(self.store_dir.print_path(drv))
        .bind(id)
        .bind(self.store_dir.print_path(output))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The recorded outputs of a derivation.
    pub async fn derivation_outputs(
        &self,
        drv: &StorePath,
    ) -> RegistryResult<BTreeMap<String, StorePath>> {
        let rows = sqlx::query(
            "SELECT id, path FROM DerivationOutputs
             WHERE drv = (SELECT id FROM ValidPaths WHERE path = ?)",
        )
        .bind(self.store_dir.print_path(drv))
        .fetch_all(&self.pool)
        .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            out.insert(row.get::<String, _>("id"), self.parse_path(row.get("path"))?);
        }
        Ok(out)
    }

    /// Memoize that `unresolved` resolves to `resolved`.
    pub async fn add_resolved_derivation(
        &self,
        unresolved: &StorePath,
        resolved: &StorePath,
    ) -> RegistryResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO ResolvedDrv (unresolved, resolved)
             VALUES ((SELECT id FROM ValidPaths WHERE path = ?),
                     (SELECT id FROM ValidPaths WHERE path = ?))",
        )
        .bind(self.store_dir.print_path(unresolved))
        .bind(self.store_dir.print_path(resolved))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look up a memoized resolution.
    pub async fn lookup_resolved_derivation(
        &self,
        unresolved: &StorePath,
    ) -> RegistryResult<Option<StorePath>> {
        let row = sqlx::query(
            "SELECT v.path FROM ResolvedDrv r
             JOIN ValidPaths v ON v.id = r.resolved
             WHERE r.unresolved = (SELECT id FROM ValidPaths WHERE path = ?)",
        )
        .bind(self.store_dir.print_path(unresolved))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| self.parse_path(row.get("path"))).transpose()
    }

    fn parse_path(&self, printed: String) -> RegistryResult<StorePath> {
        self.store_dir
            .parse_path(&printed)
            .map_err(|e| RegistryError::Corrupt(format!("bad path '{printed}': {e}")))
    }

    async fn info_from_row(&self, row: &sqlx::sqlite::SqliteRow) -> RegistryResult<ValidPathInfo> {
        let id: i64 = row.get("id");
        let path = self.parse_path(row.get("path"))?;
        let nar_hash = Hash::parse(row.get("narHash"), Some(Algorithm::Sha256))
            .map_err(|e| RegistryError::Corrupt(format!("bad narHash: {e}")))?;

        let mut info = ValidPathInfo::new(path, nar_hash, row.get::<i64, _>("narSize") as u64);
        info.registration_time = row.get("registrationTime");
        info.ultimate = row.get::<Option<bool>, _>("ultimate").unwrap_or(false);

        if let Some(deriver) = row.get::<Option<String>, _>("deriver") {
            info.deriver = Some(self.parse_path(deriver)?);
        }
        if let Some(sigs) = row.get::<Option<String>, _>("sigs") {
            for sig in sigs.split_whitespace() {
                info.sigs.insert(
                    Signature::parse(sig)
                        .map_err(|e| RegistryError::Corrupt(format!("bad signature: {e}")))?,
                );
            }
        }
        if let Some(ca) = row.get::<Option<String>, _>("ca") {
            info.ca = ContentAddress::parse_opt(&ca)
                .map_err(|e| RegistryError::Corrupt(format!("bad content address: {e}")))?;
        }

        let reference_rows = sqlx::query(
            "SELECT r.reference, v.path FROM Refs r
             JOIN ValidPaths v ON v.id = r.reference
             WHERE r.referrer = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        for reference_row in reference_rows {
            let reference_id: i64 = reference_row.get("reference");
            if reference_id == id {
                info.references.has_self_reference = true;
            } else {
                info.references
                    .references
                    .insert(self.parse_path(reference_row.get("path"))?);
            }
        }
        Ok(info)
    }
}
