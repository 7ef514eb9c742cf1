//! SQLite-based run store

use crate::core::{LogEntry, LogLevel, QueueItem, RunMetadata, RunStatus, ValueMap};
use crate::persistence::{run_key, step_key, RunStore, StoreError};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

/// SQLite run store
///
/// Queue pops are a single `DELETE … RETURNING` statement, so two workers
/// sharing the database never claim the same item.
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Open (creating if needed) a database file
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        debug!("Opened run store at {}", db_path.display());
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Private in-memory database (a single connection, so all queries share it)
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                pipeline_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                user_id TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (pipeline_id, run_id)
            );

            CREATE TABLE IF NOT EXISTS run_inputs (
                pipeline_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (pipeline_id, run_id)
            );

            CREATE TABLE IF NOT EXISTS step_inputs (
                pipeline_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (pipeline_id, run_id, step_id)
            );

            CREATE TABLE IF NOT EXISTS step_outputs (
                pipeline_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                written_at TEXT NOT NULL,
                PRIMARY KEY (pipeline_id, run_id, step_id)
            );

            CREATE TABLE IF NOT EXISTS step_logs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                pipeline_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                metadata TEXT
            );

            CREATE TABLE IF NOT EXISTS queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                pipeline_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at);
            CREATE INDEX IF NOT EXISTS idx_step_logs_run ON step_logs(pipeline_id, run_id, step_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn metadata_from_row(row: &SqliteRow) -> Result<RunMetadata, StoreError> {
        let run_id: String = row.try_get("run_id")?;
        let status: String = row.try_get("status")?;
        Ok(RunMetadata {
            run_id: Uuid::parse_str(&run_id).map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
            pipeline_id: row.try_get("pipeline_id")?,
            user_id: row.try_get("user_id")?,
            status: RunStatus::from_str(&status).map_err(|e| StoreError::Database(sqlx::Error::Decode(e.into())))?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    fn queue_item_from_row(row: &SqliteRow) -> Result<QueueItem, StoreError> {
        let run_id: String = row.try_get("run_id")?;
        Ok(QueueItem {
            pipeline_id: row.try_get("pipeline_id")?,
            run_id: Uuid::parse_str(&run_id).map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
            step_id: row.try_get("step_id")?,
            attempt: row.try_get::<i64, _>("attempt")? as u32,
        })
    }

    fn log_from_row(row: &SqliteRow) -> Result<LogEntry, StoreError> {
        let level: String = row.try_get("level")?;
        let metadata: Option<String> = row.try_get("metadata")?;
        Ok(LogEntry {
            timestamp: row.try_get::<DateTime<Utc>, _>("timestamp")?,
            step_id: row.try_get("step_id")?,
            level: LogLevel::from_str(&level).map_err(|e| StoreError::Database(sqlx::Error::Decode(e.into())))?,
            message: row.try_get("message")?,
            metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
        })
    }

    async fn run_exists(&self, pipeline_id: &str, run_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM runs WHERE pipeline_id = ?1 AND run_id = ?2")
            .bind(pipeline_id)
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn require_run(&self, pipeline_id: &str, run_id: Uuid) -> Result<(), StoreError> {
        if self.run_exists(pipeline_id, run_id).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(run_key(pipeline_id, run_id)))
        }
    }

    async fn read_payload(
        &self,
        table: &'static str,
        pipeline_id: &str,
        run_id: Uuid,
        step_id: &str,
    ) -> Result<Option<ValueMap>, StoreError> {
        let sql = format!(
            "SELECT payload FROM {} WHERE pipeline_id = ?1 AND run_id = ?2 AND step_id = ?3",
            table
        );
        let row = sqlx::query(&sql)
            .bind(pipeline_id)
            .bind(run_id.to_string())
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let payload: String = row.try_get("payload")?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait::async_trait]
impl RunStore for SqliteRunStore {
    async fn init_run(&self, metadata: &RunMetadata, pipeline_inputs: &ValueMap) -> Result<(), StoreError> {
        let payload = serde_json::to_string(pipeline_inputs)?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO runs (pipeline_id, run_id, user_id, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&metadata.pipeline_id)
        .bind(metadata.run_id.to_string())
        .bind(&metadata.user_id)
        .bind(metadata.status.as_str())
        .bind(metadata.created_at)
        .bind(metadata.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(StoreError::AlreadyExists(run_key(&metadata.pipeline_id, metadata.run_id)));
            }
            return Err(err.into());
        }

        sqlx::query("INSERT INTO run_inputs (pipeline_id, run_id, payload) VALUES (?1, ?2, ?3)")
            .bind(&metadata.pipeline_id)
            .bind(metadata.run_id.to_string())
            .bind(payload)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_run(&self, pipeline_id: &str, run_id: Uuid) -> Result<RunMetadata, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT pipeline_id, run_id, user_id, status, created_at, updated_at
            FROM runs
            WHERE pipeline_id = ?1 AND run_id = ?2
            "#,
        )
        .bind(pipeline_id)
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::metadata_from_row(&row),
            None => Err(StoreError::NotFound(run_key(pipeline_id, run_id))),
        }
    }

    async fn list_runs(&self, pipeline_id: Option<&str>) -> Result<Vec<RunMetadata>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT pipeline_id, run_id, user_id, status, created_at, updated_at
            FROM runs
            WHERE ?1 IS NULL OR pipeline_id = ?1
            ORDER BY created_at DESC
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::metadata_from_row).collect()
    }

    async fn update_status(
        &self,
        pipeline_id: &str,
        run_id: Uuid,
        status: RunStatus,
    ) -> Result<RunMetadata, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE runs SET status = ?3, updated_at = ?4
            WHERE pipeline_id = ?1 AND run_id = ?2
            RETURNING pipeline_id, run_id, user_id, status, created_at, updated_at
            "#,
        )
        .bind(pipeline_id)
        .bind(run_id.to_string())
        .bind(status.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::metadata_from_row(&row),
            None => Err(StoreError::NotFound(run_key(pipeline_id, run_id))),
        }
    }

    async fn read_pipeline_inputs(&self, pipeline_id: &str, run_id: Uuid) -> Result<ValueMap, StoreError> {
        let row = sqlx::query("SELECT payload FROM run_inputs WHERE pipeline_id = ?1 AND run_id = ?2")
            .bind(pipeline_id)
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let payload: String = row.try_get("payload")?;
                Ok(serde_json::from_str(&payload)?)
            }
            None => Err(StoreError::NotFound(format!("inputs of {}", run_key(pipeline_id, run_id)))),
        }
    }

    async fn write_step_input(
        &self,
        pipeline_id: &str,
        run_id: Uuid,
        step_id: &str,
        inputs: &ValueMap,
    ) -> Result<(), StoreError> {
        self.require_run(pipeline_id, run_id).await?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO step_inputs (pipeline_id, run_id, step_id, payload)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(pipeline_id)
        .bind(run_id.to_string())
        .bind(step_id)
        .bind(serde_json::to_string(inputs)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_step_input(&self, pipeline_id: &str, run_id: Uuid, step_id: &str) -> Result<ValueMap, StoreError> {
        self.read_payload("step_inputs", pipeline_id, run_id, step_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(step_key(pipeline_id, run_id, step_id, "input")))
    }

    async fn write_step_output(
        &self,
        pipeline_id: &str,
        run_id: Uuid,
        step_id: &str,
        outputs: &ValueMap,
    ) -> Result<(), StoreError> {
        self.require_run(pipeline_id, run_id).await?;
        let result = sqlx::query(
            r#"
            INSERT INTO step_outputs (pipeline_id, run_id, step_id, payload, written_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(pipeline_id)
        .bind(run_id.to_string())
        .bind(step_id)
        .bind(serde_json::to_string(outputs)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::AlreadyExists(step_key(pipeline_id, run_id, step_id, "output")))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn read_step_output(&self, pipeline_id: &str, run_id: Uuid, step_id: &str) -> Result<ValueMap, StoreError> {
        self.read_payload("step_outputs", pipeline_id, run_id, step_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(step_key(pipeline_id, run_id, step_id, "output")))
    }

    async fn append_log(&self, pipeline_id: &str, run_id: Uuid, step_id: &str, entry: &LogEntry) -> Result<(), StoreError> {
        self.require_run(pipeline_id, run_id).await?;
        let metadata = entry.metadata.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO step_logs (pipeline_id, run_id, step_id, timestamp, level, message, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(pipeline_id)
        .bind(run_id.to_string())
        .bind(step_id)
        .bind(entry.timestamp)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_logs(
        &self,
        pipeline_id: &str,
        run_id: Uuid,
        step_id: Option<&str>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        self.require_run(pipeline_id, run_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT step_id, timestamp, level, message, metadata
            FROM step_logs
            WHERE pipeline_id = ?1 AND run_id = ?2 AND (?3 IS NULL OR step_id = ?3)
            ORDER BY seq ASC
            "#,
        )
        .bind(pipeline_id)
        .bind(run_id.to_string())
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::log_from_row).collect()
    }

    async fn list_completed_steps(&self, pipeline_id: &str, run_id: Uuid) -> Result<Vec<String>, StoreError> {
        self.require_run(pipeline_id, run_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT step_id FROM step_outputs
            WHERE pipeline_id = ?1 AND run_id = ?2
            ORDER BY step_id ASC
            "#,
        )
        .bind(pipeline_id)
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("step_id").map_err(StoreError::from))
            .collect()
    }

    async fn load_all_outputs(&self, pipeline_id: &str, run_id: Uuid) -> Result<BTreeMap<String, ValueMap>, StoreError> {
        self.require_run(pipeline_id, run_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT step_id, payload FROM step_outputs
            WHERE pipeline_id = ?1 AND run_id = ?2
            "#,
        )
        .bind(pipeline_id)
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut outputs = BTreeMap::new();
        for row in &rows {
            let step_id: String = row.try_get("step_id")?;
            let payload: String = row.try_get("payload")?;
            outputs.insert(step_id, serde_json::from_str(&payload)?);
        }
        Ok(outputs)
    }

    async fn read_queue(&self) -> Result<Vec<QueueItem>, StoreError> {
        let rows = sqlx::query("SELECT pipeline_id, run_id, step_id, attempt FROM queue ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::queue_item_from_row).collect()
    }

    async fn write_queue(&self, items: &[QueueItem]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM queue").execute(&mut *tx).await?;
        for item in items {
            sqlx::query("INSERT INTO queue (pipeline_id, run_id, step_id, attempt) VALUES (?1, ?2, ?3, ?4)")
                .bind(&item.pipeline_id)
                .bind(item.run_id.to_string())
                .bind(&item.step_id)
                .bind(item.attempt as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn append_queue_item(&self, item: &QueueItem) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO queue (pipeline_id, run_id, step_id, attempt) VALUES (?1, ?2, ?3, ?4)")
            .bind(&item.pipeline_id)
            .bind(item.run_id.to_string())
            .bind(&item.step_id)
            .bind(item.attempt as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop_queue_item(&self) -> Result<Option<QueueItem>, StoreError> {
        let row = sqlx::query(
            r#"
            DELETE FROM queue
            WHERE seq = (SELECT MIN(seq) FROM queue)
            RETURNING pipeline_id, run_id, step_id, attempt
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::queue_item_from_row).transpose()
    }
}
