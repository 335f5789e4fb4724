use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Executor, Row};

use crate::models::download::{DownloadJob, FileStat, JobPhase};
use crate::storage::DownloadStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS downloads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    video_id TEXT NOT NULL,
    uuid TEXT NOT NULL,
    priority INTEGER NOT NULL,
    title TEXT NOT NULL,
    selected_variant TEXT NOT NULL,
    variants TEXT NOT NULL,
    formats TEXT NOT NULL,
    chapters TEXT,
    duration TEXT NOT NULL,
    filename TEXT NOT NULL,
    container TEXT NOT NULL,
    save_to TEXT NOT NULL,
    upload_date TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    channel_title TEXT NOT NULL,
    filesize INTEGER NOT NULL,
    missing_formats INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    completed INTEGER NOT NULL DEFAULT 0,
    bytes_loaded INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE TABLE IF NOT EXISTS download_files (
    download_id INTEGER NOT NULL,
    file_id TEXT NOT NULL,
    filesize INTEGER NOT NULL,
    PRIMARY KEY (download_id, file_id),
    FOREIGN KEY (download_id) REFERENCES downloads (id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_downloads_priority ON downloads (priority);
"#;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30))
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!("[store] opened {}", path.display());
        Ok(store)
    }

    /// Private database that lives as long as the store.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        self.pool.execute(SCHEMA).await?;
        Ok(())
    }
}

fn expect_one(affected: u64, what: &str, id: i64) -> anyhow::Result<()> {
    if affected != 1 {
        anyhow::bail!("{} affected {} rows for download {}", what, affected, id);
    }
    Ok(())
}

fn row_to_job(row: SqliteRow) -> anyhow::Result<DownloadJob> {
    let selected: String = row.try_get("selected_variant")?;
    let variants: String = row.try_get("variants")?;
    let formats: String = row.try_get("formats")?;
    let chapters: Option<String> = row.try_get("chapters")?;
    let save_to: String = row.try_get("save_to")?;
    let filesize: i64 = row.try_get("filesize")?;
    let bytes_loaded: i64 = row.try_get("bytes_loaded")?;

    Ok(DownloadJob {
        id: row.try_get("id")?,
        video_id: row.try_get("video_id")?,
        uuid: row.try_get("uuid")?,
        priority: row.try_get("priority")?,
        title: row.try_get("title")?,
        selected_variant: serde_json::from_str(&selected)?,
        variants: serde_json::from_str(&variants)?,
        formats: serde_json::from_str(&formats)?,
        chapters: chapters.map(|c| serde_json::from_str(&c)).transpose()?,
        duration: row.try_get("duration")?,
        filename: row.try_get("filename")?,
        container: row.try_get("container")?,
        save_to: PathBuf::from(save_to),
        upload_date: row.try_get("upload_date")?,
        channel_id: row.try_get("channel_id")?,
        channel_title: row.try_get("channel_title")?,
        filesize: filesize.max(0) as u64,
        missing_formats: row.try_get("missing_formats")?,
        enabled: row.try_get("enabled")?,
        completed: row.try_get("completed")?,
        bytes_loaded: bytes_loaded.max(0) as u64,
        error: row.try_get("last_error")?,
        downloading: false,
        refreshing: false,
        phase: JobPhase::Idle,
        speed: 0,
        connections: 0,
    })
}

#[async_trait]
impl DownloadStore for SqliteStore {
    async fn add_download(&self, job: &DownloadJob) -> anyhow::Result<(i64, i64)> {
        let chapters = job
            .chapters
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let row = sqlx::query(
            r#"
            INSERT INTO downloads (
                video_id, uuid, priority, title, selected_variant, variants, formats,
                chapters, duration, filename, container, save_to, upload_date,
                channel_id, channel_title, filesize, missing_formats, enabled, bytes_loaded
            )
            VALUES (?, ?, (SELECT COUNT(*) + 1 FROM downloads), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            RETURNING id, priority
            "#,
        )
        .bind(&job.video_id)
        .bind(&job.uuid)
        .bind(&job.title)
        .bind(serde_json::to_string(&job.selected_variant)?)
        .bind(serde_json::to_string(&job.variants)?)
        .bind(serde_json::to_string(&job.formats)?)
        .bind(chapters)
        .bind(&job.duration)
        .bind(&job.filename)
        .bind(&job.container)
        .bind(job.save_to.to_string_lossy().to_string())
        .bind(&job.upload_date)
        .bind(&job.channel_id)
        .bind(&job.channel_title)
        .bind(job.filesize as i64)
        .bind(job.missing_formats)
        .bind(job.enabled)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        let priority: i64 = row.try_get("priority")?;
        tracing::debug!(download_id = id, "[store] added {} at {}", job.video_id, priority);
        Ok((id, priority))
    }

    async fn list_downloads(&self) -> anyhow::Result<Vec<DownloadJob>> {
        let rows = sqlx::query("SELECT * FROM downloads ORDER BY priority")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn update_download(&self, job: &DownloadJob) -> anyhow::Result<()> {
        let chapters = job
            .chapters
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE downloads SET
                title = ?, selected_variant = ?, variants = ?, formats = ?, chapters = ?,
                duration = ?, filename = ?, container = ?, filesize = ?, channel_id = ?,
                channel_title = ?, upload_date = ?, missing_formats = ?, enabled = ?,
                bytes_loaded = ?
            WHERE id = ?
            "#,
        )
        .bind(&job.title)
        .bind(serde_json::to_string(&job.selected_variant)?)
        .bind(serde_json::to_string(&job.variants)?)
        .bind(serde_json::to_string(&job.formats)?)
        .bind(chapters)
        .bind(&job.duration)
        .bind(&job.filename)
        .bind(&job.container)
        .bind(job.filesize as i64)
        .bind(&job.channel_id)
        .bind(&job.channel_title)
        .bind(&job.upload_date)
        .bind(job.missing_formats)
        .bind(job.enabled)
        .bind(job.bytes_loaded as i64)
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        expect_one(result.rows_affected(), "update_download", job.id)
    }

    async fn file_stats(&self, download_id: i64) -> anyhow::Result<Vec<FileStat>> {
        let rows = sqlx::query("SELECT file_id, filesize FROM download_files WHERE download_id = ?")
            .bind(download_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let filesize: i64 = row.try_get("filesize")?;
                Ok(FileStat {
                    download_id,
                    file_id: row.try_get("file_id")?,
                    filesize: filesize.max(0) as u64,
                })
            })
            .collect()
    }

    async fn save_file_stat(
        &self,
        download_id: i64,
        file_id: &str,
        filesize: u64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO download_files (download_id, file_id, filesize)
            VALUES (?, ?, ?)
            ON CONFLICT (download_id, file_id) DO UPDATE SET filesize = excluded.filesize
            "#,
        )
        .bind(download_id)
        .bind(file_id)
        .bind(filesize as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_file_stats(&self, download_id: i64, prefix: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM download_files WHERE download_id = ? AND file_id LIKE ? || '%'")
            .bind(download_id)
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_progress(&self, download_id: i64, bytes_loaded: u64) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE downloads SET bytes_loaded = ? WHERE id = ?")
            .bind(bytes_loaded as i64)
            .bind(download_id)
            .execute(&self.pool)
            .await?;
        expect_one(result.rows_affected(), "save_progress", download_id)
    }

    async fn save_completed(&self, download_id: i64, bytes_loaded: u64) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE downloads SET bytes_loaded = ?, completed = 1, enabled = 0, last_error = NULL WHERE id = ?",
        )
        .bind(bytes_loaded as i64)
        .bind(download_id)
        .execute(&mut *tx)
        .await?;
        expect_one(result.rows_affected(), "save_completed", download_id)?;

        sqlx::query("DELETE FROM download_files WHERE download_id = ?")
            .bind(download_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_enabled(&self, ids: &[i64], enabled: bool) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            let result = sqlx::query("UPDATE downloads SET enabled = ? WHERE id = ?")
                .bind(enabled)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            expect_one(result.rows_affected(), "set_enabled", *id)?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_error(&self, download_id: i64, error: Option<&str>) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE downloads SET last_error = ? WHERE id = ?")
            .bind(error)
            .bind(download_id)
            .execute(&self.pool)
            .await?;
        expect_one(result.rows_affected(), "set_error", download_id)
    }

    async fn remove_downloads(&self, ids: &[i64]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query("DELETE FROM downloads WHERE id = ? RETURNING priority")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else {
                anyhow::bail!("download {} does not exist", id);
            };
            removed.push(row.try_get::<i64, _>("priority")?);
        }

        // Highest first so each shift sees priorities still untouched by
        // the removals below it.
        removed.sort_unstable_by(|a, b| b.cmp(a));
        for priority in removed {
            sqlx::query("UPDATE downloads SET priority = priority - 1 WHERE priority > ?")
                .bind(priority)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::debug!("[store] removed {} downloads", ids.len());
        Ok(())
    }

    async fn update_priorities(&self, changes: &[(i64, i64)]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for (id, offset) in changes {
            let result = sqlx::query("UPDATE downloads SET priority = priority + ? WHERE id = ?")
                .bind(offset)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            expect_one(result.rows_affected(), "update_priorities", *id)?;
        }
        tx.commit().await?;
        Ok(())
    }
}
