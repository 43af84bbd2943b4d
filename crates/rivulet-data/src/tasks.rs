//! Task repository over a SQLite pool.

use std::path::Path;

use chrono::{DateTime, Utc};
use rivulet_events::{InventoryFile, TaskStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::{DataError, Result};

/// Durable task state, one row per task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub task_id: String,
    pub magnet_url: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub speed: u64,
    pub size: u64,
    pub downloaded: u64,
    pub torrent_name: String,
    pub files: Vec<InventoryFile>,
    pub m3u8_path: Option<String>,
    pub segments: Vec<String>,
    pub subtitles: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub worker_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Fresh `pending` record for a newly admitted magnet.
    #[must_use]
    pub fn pending(task_id: String, magnet_url: String, worker_id: String) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            magnet_url,
            status: TaskStatus::Pending,
            progress: 0,
            speed: 0,
            size: 0,
            downloaded: 0,
            torrent_name: String::new(),
            files: Vec::new(),
            m3u8_path: None,
            segments: Vec::new(),
            subtitles: Vec::new(),
            metadata: serde_json::Map::new(),
            worker_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Database-backed repository for task state.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open (or create) the store at `path`, applying pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DataError::query("store.open"))?;
        Self::with_pool(pool).await
    }

    /// In-memory store for tests. The single connection keeps the database
    /// alive for the store's lifetime.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(DataError::query("store.open_in_memory"))?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|source| DataError::MigrationFailed { source })?;
        Ok(Self { pool })
    }

    /// Close the underlying pool, flushing WAL state.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert a new task row. Fails when the task id is already present.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails, including unique-constraint
    /// violations on `task_id`.
    pub async fn create(&self, record: &TaskRecord) -> Result<()> {
        sqlx::query(
            r"INSERT INTO tasks (
                task_id, magnet_url, status, progress, speed, size, downloaded,
                torrent_name, files, m3u8_path, segments, subtitles, metadata,
                worker_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.task_id)
        .bind(&record.magnet_url)
        .bind(record.status.as_str())
        .bind(i64::from(record.progress))
        .bind(clamp_i64(record.speed))
        .bind(clamp_i64(record.size))
        .bind(clamp_i64(record.downloaded))
        .bind(&record.torrent_name)
        .bind(encode_json(&record.files, "files")?)
        .bind(record.m3u8_path.as_deref())
        .bind(encode_json(&record.segments, "segments")?)
        .bind(encode_json(&record.subtitles, "subtitles")?)
        .bind(encode_json(&record.metadata, "metadata")?)
        .bind(&record.worker_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DataError::query("tasks.create"))?;
        Ok(())
    }

    /// Fetch one task by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a column is corrupt.
    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DataError::query("tasks.get"))?;
        row.map(|row| decode_row(&row)).transpose()
    }

    /// All tasks owned by `worker_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a column is corrupt.
    pub async fn list_by_worker(&self, worker_id: &str) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE worker_id = ? ORDER BY created_at")
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DataError::query("tasks.list_by_worker"))?;
        rows.iter().map(decode_row).collect()
    }

    /// All tasks currently in `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a column is corrupt.
    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ? ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(DataError::query("tasks.list_by_status"))?;
        rows.iter().map(decode_row).collect()
    }

    /// Count of tasks gating download admission for `worker_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn active_count(&self, worker_id: &str) -> Result<u64> {
        let row = sqlx::query(
            r"SELECT COUNT(*) AS n FROM tasks
              WHERE worker_id = ? AND status IN ('pending', 'downloading', 'transcoding')",
        )
        .bind(worker_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DataError::query("tasks.active_count"))?;
        let count: i64 = row.get("n");
        Ok(count.max(0) as u64)
    }

    /// Replace the full row for a task.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::TaskNotFound`] when the task id is absent.
    pub async fn update(&self, record: &TaskRecord) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks SET
                magnet_url = ?, status = ?, progress = ?, speed = ?, size = ?,
                downloaded = ?, torrent_name = ?, files = ?, m3u8_path = ?,
                segments = ?, subtitles = ?, metadata = ?, updated_at = ?
              WHERE task_id = ?",
        )
        .bind(&record.magnet_url)
        .bind(record.status.as_str())
        .bind(i64::from(record.progress))
        .bind(clamp_i64(record.speed))
        .bind(clamp_i64(record.size))
        .bind(clamp_i64(record.downloaded))
        .bind(&record.torrent_name)
        .bind(encode_json(&record.files, "files")?)
        .bind(record.m3u8_path.as_deref())
        .bind(encode_json(&record.segments, "segments")?)
        .bind(encode_json(&record.subtitles, "subtitles")?)
        .bind(encode_json(&record.metadata, "metadata")?)
        .bind(Utc::now())
        .bind(&record.task_id)
        .execute(&self.pool)
        .await
        .map_err(DataError::query("tasks.update"))?;
        ensure_found(result.rows_affected(), &record.task_id)
    }

    /// Move a task to `status`.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::TaskNotFound`] when the task id is absent.
    pub async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let result =
            sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE task_id = ?")
                .bind(status.as_str())
                .bind(Utc::now())
                .bind(task_id)
                .execute(&self.pool)
                .await
                .map_err(DataError::query("tasks.update_status"))?;
        ensure_found(result.rows_affected(), task_id)
    }

    /// Persist one progress sample.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::TaskNotFound`] when the task id is absent.
    pub async fn update_progress(
        &self,
        task_id: &str,
        progress: u8,
        speed: u64,
        downloaded: u64,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks SET progress = ?, speed = ?, downloaded = ?, updated_at = ?
              WHERE task_id = ?",
        )
        .bind(i64::from(progress))
        .bind(clamp_i64(speed))
        .bind(clamp_i64(downloaded))
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(DataError::query("tasks.update_progress"))?;
        ensure_found(result.rows_affected(), task_id)
    }

    /// Record torrent metadata: display name, total size, and the file
    /// inventory. Written once, after metadata arrival.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::TaskNotFound`] when the task id is absent.
    pub async fn set_inventory(
        &self,
        task_id: &str,
        torrent_name: &str,
        size: u64,
        files: &[InventoryFile],
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks SET torrent_name = ?, size = ?, files = ?, updated_at = ?
              WHERE task_id = ?",
        )
        .bind(torrent_name)
        .bind(clamp_i64(size))
        .bind(encode_json(&files, "files")?)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(DataError::query("tasks.set_inventory"))?;
        ensure_found(result.rows_affected(), task_id)
    }

    /// Record the transcode artifacts. Written once, at the
    /// transcoding → ready transition.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::TaskNotFound`] when the task id is absent.
    pub async fn set_transcode_artifacts(
        &self,
        task_id: &str,
        m3u8_path: &str,
        segments: &[String],
        subtitles: &[String],
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE tasks SET m3u8_path = ?, segments = ?, subtitles = ?, metadata = ?,
                updated_at = ?
              WHERE task_id = ?",
        )
        .bind(m3u8_path)
        .bind(encode_json(&segments, "segments")?)
        .bind(encode_json(&subtitles, "subtitles")?)
        .bind(encode_json(metadata, "metadata")?)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(DataError::query("tasks.set_transcode_artifacts"))?;
        ensure_found(result.rows_affected(), task_id)
    }

    /// Move a task to `error`, recording the cause in its metadata map.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::TaskNotFound`] when the task id is absent.
    pub async fn set_error(&self, task_id: &str, message: &str) -> Result<()> {
        let Some(mut record) = self.get(task_id).await? else {
            return Err(DataError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        };
        record.status = TaskStatus::Error;
        record
            .metadata
            .insert("error".to_string(), serde_json::Value::from(message));
        self.update(&record).await
    }

    /// Delete a task row.
    ///
    /// # Errors
    ///
    /// Returns an error when the delete fails. Deleting an absent task is
    /// not an error.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(DataError::query("tasks.delete"))?;
        Ok(())
    }
}

fn ensure_found(rows_affected: u64, task_id: &str) -> Result<()> {
    if rows_affected == 0 {
        return Err(DataError::TaskNotFound {
            task_id: task_id.to_string(),
        });
    }
    Ok(())
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn encode_json<T: serde::Serialize>(value: &T, column: &'static str) -> Result<String> {
    serde_json::to_string(value).map_err(|_| DataError::Corrupt { column })
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str, column: &'static str) -> Result<T> {
    serde_json::from_str(raw).map_err(|_| DataError::Corrupt { column })
}

fn decode_row(row: &SqliteRow) -> Result<TaskRecord> {
    let status_raw: String = row.get("status");
    let status =
        TaskStatus::parse(&status_raw).ok_or(DataError::Corrupt { column: "status" })?;
    let progress: i64 = row.get("progress");
    let files_raw: String = row.get("files");
    let segments_raw: String = row.get("segments");
    let subtitles_raw: String = row.get("subtitles");
    let metadata_raw: String = row.get("metadata");

    Ok(TaskRecord {
        task_id: row.get("task_id"),
        magnet_url: row.get("magnet_url"),
        status,
        progress: u8::try_from(progress.clamp(0, 100))
            .map_err(|_| DataError::Corrupt { column: "progress" })?,
        speed: row.get::<i64, _>("speed").max(0) as u64,
        size: row.get::<i64, _>("size").max(0) as u64,
        downloaded: row.get::<i64, _>("downloaded").max(0) as u64,
        torrent_name: row.get("torrent_name"),
        files: decode_json(&files_raw, "files")?,
        m3u8_path: row.get("m3u8_path"),
        segments: decode_json(&segments_raw, "segments")?,
        subtitles: decode_json(&subtitles_raw, "subtitles")?,
        metadata: decode_json(&metadata_raw, "metadata")?,
        worker_id: row.get("worker_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> TaskStore {
        TaskStore::open_in_memory().await.expect("open store")
    }

    fn sample(task_id: &str, worker_id: &str) -> TaskRecord {
        TaskRecord::pending(
            task_id.to_string(),
            "magnet:?xt=urn:btih:AAA".to_string(),
            worker_id.to_string(),
        )
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = store().await;
        let mut record = sample("task_1", "w1");
        record.files = vec![InventoryFile {
            name: "movie.mkv".into(),
            size_bytes: 1_234,
            path: "movie/movie.mkv".into(),
            selected: true,
        }];
        record
            .metadata
            .insert("note".into(), serde_json::Value::from("fixture"));

        store.create(&record).await.expect("create");
        let loaded = store.get("task_1").await.expect("get").expect("present");
        assert_eq!(loaded.magnet_url, record.magnet_url);
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.files, record.files);
        assert_eq!(loaded.metadata["note"], "fixture");

        assert!(store.get("task_404").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn duplicate_task_ids_are_rejected() {
        let store = store().await;
        let record = sample("task_1", "w1");
        store.create(&record).await.expect("create");
        assert!(store.create(&record).await.is_err());
    }

    #[tokio::test]
    async fn active_count_scopes_by_worker_and_status() {
        let store = store().await;
        store.create(&sample("task_1", "w1")).await.expect("create");
        store.create(&sample("task_2", "w1")).await.expect("create");
        store.create(&sample("task_3", "w2")).await.expect("create");

        store
            .update_status("task_2", TaskStatus::Ready)
            .await
            .expect("update");

        assert_eq!(store.active_count("w1").await.expect("count"), 1);
        assert_eq!(store.active_count("w2").await.expect("count"), 1);
        assert_eq!(store.active_count("w3").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn progress_and_inventory_updates_apply() {
        let store = store().await;
        store.create(&sample("task_1", "w1")).await.expect("create");

        let files = vec![InventoryFile {
            name: "clip.mp4".into(),
            size_bytes: 2_048,
            path: "clip/clip.mp4".into(),
            selected: true,
        }];
        store
            .set_inventory("task_1", "clip", 2_048, &files)
            .await
            .expect("inventory");
        store
            .update_progress("task_1", 55, 999, 1_126)
            .await
            .expect("progress");

        let loaded = store.get("task_1").await.expect("get").expect("present");
        assert_eq!(loaded.torrent_name, "clip");
        assert_eq!(loaded.size, 2_048);
        assert_eq!(loaded.progress, 55);
        assert_eq!(loaded.speed, 999);
        assert_eq!(loaded.downloaded, 1_126);
        assert_eq!(loaded.files, files);
    }

    #[tokio::test]
    async fn transcode_artifacts_written_once_with_metadata() {
        let store = store().await;
        store.create(&sample("task_1", "w1")).await.expect("create");

        let segments = vec!["index0.ts".to_string(), "index1.ts".to_string()];
        let subtitles = vec!["subtitle_2.srt".to_string()];
        let mut metadata = serde_json::Map::new();
        metadata.insert("segment_count".into(), serde_json::Value::from(2));

        store
            .set_transcode_artifacts(
                "task_1",
                "data/m3u8/clip/index.m3u8",
                &segments,
                &subtitles,
                &metadata,
            )
            .await
            .expect("artifacts");

        let loaded = store.get("task_1").await.expect("get").expect("present");
        assert_eq!(
            loaded.m3u8_path.as_deref(),
            Some("data/m3u8/clip/index.m3u8")
        );
        assert_eq!(loaded.segments, segments);
        assert_eq!(loaded.subtitles, subtitles);
        assert_eq!(loaded.metadata["segment_count"], 2);
    }

    #[tokio::test]
    async fn set_error_records_cause() {
        let store = store().await;
        store.create(&sample("task_1", "w1")).await.expect("create");

        store
            .set_error("task_1", "metadata deadline elapsed")
            .await
            .expect("set_error");

        let loaded = store.get("task_1").await.expect("get").expect("present");
        assert_eq!(loaded.status, TaskStatus::Error);
        assert_eq!(loaded.metadata["error"], "metadata deadline elapsed");
    }

    #[tokio::test]
    async fn status_listing_supports_recovery() {
        let store = store().await;
        store.create(&sample("task_1", "w1")).await.expect("create");
        store.create(&sample("task_2", "w1")).await.expect("create");
        store
            .update_status("task_1", TaskStatus::Downloading)
            .await
            .expect("update");

        let downloading = store
            .list_by_status(TaskStatus::Downloading)
            .await
            .expect("list");
        assert_eq!(downloading.len(), 1);
        assert_eq!(downloading[0].task_id, "task_1");
    }

    #[tokio::test]
    async fn updates_to_missing_tasks_surface_not_found() {
        let store = store().await;
        assert!(matches!(
            store.update_status("ghost", TaskStatus::Ready).await,
            Err(DataError::TaskNotFound { .. })
        ));
        assert!(matches!(
            store.update_progress("ghost", 1, 2, 3).await,
            Err(DataError::TaskNotFound { .. })
        ));
        // Deleting an absent task stays silent.
        store.delete("ghost").await.expect("delete");
    }
}
