use std::path::{Path, PathBuf};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use thiserror::Error;

use super::fingerprint::{Fingerprint, FingerprintDelta, FingerprintStore};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum FingerprintDbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("generation out of range for {path}: {generation}")]
    InvalidGeneration { path: String, generation: i128 },
}

/// SQLite persistence for fingerprints and the last pushed revision, scoped
/// per document URL, so a restart does not re-upload unchanged files.
#[derive(Clone)]
pub struct FingerprintDb {
    pool: SqlitePool,
    document_url: String,
}

impl FingerprintDb {
    pub fn from_pool(pool: SqlitePool, document_url: impl Into<String>) -> Self {
        Self {
            pool,
            document_url: document_url.into(),
        }
    }

    pub async fn open(
        path: &Path,
        document_url: impl Into<String>,
    ) -> Result<Self, FingerprintDbError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let db = Self::from_pool(pool, document_url);
        db.init().await?;
        Ok(db)
    }

    pub async fn init(&self) -> Result<(), FingerprintDbError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn load(&self) -> Result<FingerprintStore, FingerprintDbError> {
        let rows = sqlx::query(
            "SELECT path, content_hash, generation FROM fingerprints WHERE document_url = ?1",
        )
        .bind(&self.document_url)
        .fetch_all(&self.pool)
        .await?;

        let mut store = FingerprintStore::new();
        for row in rows {
            let path: String = row.try_get("path")?;
            let generation: i64 = row.try_get("generation")?;
            let generation = u64::try_from(generation)
                .map_err(|_| FingerprintDbError::InvalidGeneration {
                    path: path.clone(),
                    generation: generation.into(),
                })?;
            store.insert(Fingerprint {
                content_hash: row.try_get("content_hash")?,
                path,
                generation,
            });
        }
        Ok(store)
    }

    pub async fn load_revision(&self) -> Result<Option<String>, FingerprintDbError> {
        let row = sqlx::query("SELECT revision FROM sync_state WHERE document_url = ?1")
            .bind(&self.document_url)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("revision")?),
            None => Ok(None),
        }
    }

    /// Writes one committed cycle: the fingerprint delta and the revision it
    /// produced, atomically.
    pub async fn commit(
        &self,
        delta: &FingerprintDelta,
        revision: &str,
    ) -> Result<(), FingerprintDbError> {
        let mut tx = self.pool.begin().await?;
        for path in &delta.removals {
            sqlx::query("DELETE FROM fingerprints WHERE document_url = ?1 AND path = ?2")
                .bind(&self.document_url)
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        for fingerprint in &delta.upserts {
            let generation = i64::try_from(fingerprint.generation).map_err(|_| {
                FingerprintDbError::InvalidGeneration {
                    path: fingerprint.path.clone(),
                    generation: fingerprint.generation.into(),
                }
            })?;
            sqlx::query(
                "INSERT INTO fingerprints (document_url, path, content_hash, generation)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(document_url, path) DO UPDATE SET
                     content_hash = excluded.content_hash,
                     generation = excluded.generation",
            )
            .bind(&self.document_url)
            .bind(&fingerprint.path)
            .bind(&fingerprint.content_hash)
            .bind(generation)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "INSERT INTO sync_state (document_url, revision) VALUES (?1, ?2)
             ON CONFLICT(document_url) DO UPDATE SET revision = excluded.revision",
        )
        .bind(&self.document_url)
        .bind(revision)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

pub fn default_db_path() -> Result<PathBuf, FingerprintDbError> {
    let mut path = dirs::data_dir().ok_or(FingerprintDbError::MissingDataDir)?;
    path.push("docmirror");
    path.push("fingerprints.db");
    Ok(path)
}
