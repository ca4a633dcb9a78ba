//! `SQLite`-backed implementation of [`WatermarkStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Timestamps are
//! stored as fixed-width RFC 3339 UTC text, so the monotonic advance guard
//! can compare them lexicographically inside one atomic statement.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tidemark_types::{JobName, RunState, Window};

use crate::error::{self, StateError};
use crate::store::{RunRow, Watermark, WatermarkStore};

/// Fixed-width RFC 3339 UTC format; lexicographic order equals time order.
const DATETIME_FMT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS watermarks (
    job TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job TEXT NOT NULL,
    logical_time TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    window_start TEXT,
    window_end TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    error_kind TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_job_runs_job_logical
    ON job_runs (job, logical_time);
";

/// `SQLite`-backed watermark and run-history storage.
///
/// Create with [`SqliteWatermarkStore::open`] for file-backed persistence
/// or [`SqliteWatermarkStore::in_memory`] for tests.
pub struct SqliteWatermarkStore {
    conn: Mutex<Connection>,
}

impl SqliteWatermarkStore {
    /// Open or create a state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the parent directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        tracing::debug!(path = %path.display(), "opened state database");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the database can't be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn encode(ts: DateTime<Utc>) -> String {
        ts.format(DATETIME_FMT).to_string()
    }

    fn decode(raw: &str) -> error::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StateError::Corrupt(format!("bad timestamp '{raw}': {e}")))
    }

    fn decode_opt(raw: Option<String>) -> error::Result<Option<DateTime<Utc>>> {
        raw.as_deref().map(Self::decode).transpose()
    }
}

impl WatermarkStore for SqliteWatermarkStore {
    fn get(&self, job: &JobName) -> error::Result<Option<Watermark>> {
        let conn = self.lock_conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT value, updated_at FROM watermarks WHERE job = ?1",
                params![job.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((value, updated_at)) => Ok(Some(Watermark {
                value: Self::decode(&value)?,
                updated_at: Self::decode(&updated_at)?,
            })),
        }
    }

    fn advance(&self, job: &JobName, to: DateTime<Utc>) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        // Single guarded upsert: the WHERE clause makes regression a no-op,
        // and SQLite serializes writers, so concurrent advances can't race.
        let changed = conn.execute(
            "INSERT INTO watermarks (job, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(job) DO UPDATE
             SET value = excluded.value, updated_at = excluded.updated_at
             WHERE excluded.value > watermarks.value",
            params![job.as_str(), Self::encode(to), Self::encode(Utc::now())],
        )?;
        tracing::trace!(job = %job, to = %to, moved = changed > 0, "watermark upsert");
        Ok(changed > 0)
    }

    fn start_run(&self, job: &JobName, logical_time: DateTime<Utc>) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO job_runs (job, logical_time, state, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                job.as_str(),
                Self::encode(logical_time),
                RunState::Running.as_str(),
                Self::encode(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn complete_run(
        &self,
        run_id: i64,
        state: RunState,
        attempts: u32,
        window: Option<Window>,
        error_kind: Option<&str>,
        error_message: Option<&str>,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE job_runs
             SET state = ?2, attempts = ?3, window_start = ?4, window_end = ?5,
                 finished_at = ?6, error_kind = ?7, error_message = ?8
             WHERE id = ?1",
            params![
                run_id,
                state.as_str(),
                attempts,
                window.and_then(|w| w.start).map(Self::encode),
                window.map(|w| Self::encode(w.end)),
                Self::encode(Utc::now()),
                error_kind,
                error_message,
            ],
        )?;
        Ok(())
    }

    fn last_logical_time(&self, job: &JobName) -> error::Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT MAX(logical_time) FROM job_runs WHERE job = ?1",
                params![job.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Self::decode_opt(raw)
    }

    fn last_failed_logical_time(&self, job: &JobName) -> error::Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT MAX(logical_time) FROM job_runs WHERE job = ?1 AND state = ?2",
                params![job.as_str(), RunState::RetriesExhausted.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Self::decode_opt(raw)
    }

    fn run_history(&self, job: &JobName, limit: u32) -> error::Result<Vec<RunRow>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, job, logical_time, state, attempts, window_start, window_end,
                    started_at, finished_at, error_kind, error_message
             FROM job_runs WHERE job = ?1
             ORDER BY logical_time DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![job.as_str(), limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, Option<String>>(10)?,
            ))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (
                id,
                job_name,
                logical_time,
                state,
                attempts,
                window_start,
                window_end,
                started_at,
                finished_at,
                error_kind,
                error_message,
            ) = row?;
            let state = RunState::parse(&state)
                .ok_or_else(|| StateError::Corrupt(format!("unknown run state '{state}'")))?;
            let window = match window_end {
                Some(end) => Some(Window {
                    start: Self::decode_opt(window_start)?,
                    end: Self::decode(&end)?,
                }),
                None => None,
            };
            history.push(RunRow {
                id,
                job: JobName::new(job_name),
                logical_time: Self::decode(&logical_time)?,
                state,
                attempts,
                window,
                started_at: Self::decode(&started_at)?,
                finished_at: Self::decode_opt(finished_at)?,
                error_kind,
                error_message,
            });
        }
        Ok(history)
    }
}
