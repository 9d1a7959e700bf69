//! SQLite-backed download history.
//!
//! An append-only `downloads` table records every successful download.
//! The pool is injected into whoever needs it; entries are written once and
//! never mutated.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::info;

use crate::{DownloadError, Result};

/// One recorded download
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct HistoryEntry {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub filename: String,
    pub download_date: DateTime<Utc>,
    pub duration: Option<String>,
    pub uploader: Option<String>,
    pub file_size: Option<i64>,
    pub video_id: Option<String>,
}

/// Fields for a new history row
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub url: String,
    pub title: String,
    pub filename: String,
    pub duration: Option<String>,
    pub uploader: Option<String>,
    pub file_size: Option<i64>,
    pub video_id: Option<String>,
}

/// Aggregate statistics over the whole history
#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub total_downloads: i64,
    pub total_size_bytes: i64,
    pub total_size_mb: f64,
}

/// Handle to the history database. Cheap to clone.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Open (and create if missing) the history database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(persistence)?;

        let store = Self { pool };
        store.init().await?;
        info!(path = %path.display(), "Download history ready");
        Ok(store)
    }

    /// In-memory database, used by tests
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(persistence)?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                filename TEXT NOT NULL,
                download_date TEXT NOT NULL,
                duration TEXT,
                uploader TEXT,
                file_size INTEGER,
                video_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_download_date ON downloads (download_date DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        Ok(())
    }

    /// Append one download record and return its row id
    pub async fn add(&self, download: NewDownload) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO downloads (url, title, filename, download_date, duration, uploader, file_size, video_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&download.url)
        .bind(&download.title)
        .bind(&download.filename)
        .bind(Utc::now())
        .bind(&download.duration)
        .bind(&download.uploader)
        .bind(download.file_size)
        .bind(&download.video_id)
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent downloads first
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<HistoryEntry>> {
        let entries = sqlx::query_as::<_, HistoryEntry>(
            r#"
            SELECT id, url, title, filename, download_date, duration, uploader, file_size, video_id
            FROM downloads
            ORDER BY download_date DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        Ok(entries)
    }

    /// Totals across the whole history
    pub async fn stats(&self) -> Result<HistoryStats> {
        let (total_downloads, total_size): (i64, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), SUM(file_size) FROM downloads")
                .fetch_one(&self.pool)
                .await
                .map_err(persistence)?;

        let total_size_bytes = total_size.unwrap_or(0);
        Ok(HistoryStats {
            total_downloads,
            total_size_bytes,
            total_size_mb: (total_size_bytes as f64 / 1024.0 / 1024.0 * 100.0).round() / 100.0,
        })
    }
}

fn persistence(e: sqlx::Error) -> anyhow::Error {
    DownloadError::PersistenceFailed(e.to_string()).into()
}
