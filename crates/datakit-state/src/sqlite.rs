//! `SQLite`-backed implementation of [`CheckpointStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Every commit runs in
//! one transaction so a crash leaves either the previous or the new
//! checkpoint, never a mix.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use datakit_types::manifest::ShardEntry;
use datakit_types::provenance::BuildId;
use datakit_types::state::{
    Checkpoint, CheckpointCommit, DisposedEpisode, Disposition, RunStats, RunStatus,
};
use rusqlite::{Connection, OptionalExtension};

use crate::backend::CheckpointStore;
use crate::error::{self, StateError};

/// Idempotent DDL for checkpoint tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS compile_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    build_id TEXT NOT NULL,
    status TEXT NOT NULL,
    resumed INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    episodes_seen INTEGER DEFAULT 0,
    episodes_skipped INTEGER DEFAULT 0,
    accepted INTEGER DEFAULT 0,
    quarantined INTEGER DEFAULT 0,
    rejected INTEGER DEFAULT 0,
    shards_committed INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS committed_shards (
    build_id TEXT NOT NULL,
    partition TEXT NOT NULL,
    shard_id INTEGER NOT NULL,
    entry_json TEXT NOT NULL,
    committed_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (build_id, partition, shard_id)
);

CREATE TABLE IF NOT EXISTS disposed_episodes (
    build_id TEXT NOT NULL,
    episode_id TEXT NOT NULL,
    disposition TEXT NOT NULL,
    findings_json TEXT NOT NULL,
    PRIMARY KEY (build_id, episode_id)
);

CREATE TABLE IF NOT EXISTS writer_state (
    build_id TEXT PRIMARY KEY,
    state_json TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// `SQLite`-backed checkpoint storage.
///
/// Create with [`SqliteCheckpointStore::open`] for file-backed persistence
/// or [`SqliteCheckpointStore::in_memory`] for tests.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create a `SQLite` checkpoint database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StateError::sqlite("open"))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(StateError::sqlite("create tables"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::sqlite("open"))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(StateError::sqlite("create tables"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn load_shards(conn: &Connection, build: &BuildId) -> error::Result<Vec<ShardEntry>> {
        let mut stmt = conn
            .prepare(
                "SELECT entry_json FROM committed_shards \
                 WHERE build_id = ?1 ORDER BY rowid",
            )
            .map_err(StateError::sqlite("load: prepare shards"))?;
        let rows = stmt
            .query_map([build.as_str()], |row| row.get::<_, String>(0))
            .map_err(StateError::sqlite("load: query shards"))?;

        let mut shards = Vec::new();
        for row in rows {
            let json = row.map_err(StateError::sqlite("load: read shard"))?;
            shards.push(serde_json::from_str(&json)?);
        }
        Ok(shards)
    }

    fn load_disposed(conn: &Connection, build: &BuildId) -> error::Result<Vec<DisposedEpisode>> {
        let mut stmt = conn
            .prepare(
                "SELECT episode_id, disposition, findings_json FROM disposed_episodes \
                 WHERE build_id = ?1 ORDER BY rowid",
            )
            .map_err(StateError::sqlite("load: prepare dispositions"))?;
        let rows = stmt
            .query_map([build.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(StateError::sqlite("load: query dispositions"))?;

        let mut disposed = Vec::new();
        for row in rows {
            let (episode_id, disposition, findings_json) =
                row.map_err(StateError::sqlite("load: read disposition"))?;
            let disposition =
                Disposition::parse(&disposition).ok_or_else(|| StateError::UnknownValue {
                    column: "disposition",
                    value: disposition.clone(),
                })?;
            disposed.push(DisposedEpisode {
                episode_id,
                disposition,
                findings: serde_json::from_str(&findings_json)?,
            });
        }
        Ok(disposed)
    }

    #[cfg(test)]
    fn get_run_row(&self, run_id: i64) -> error::Result<(String, i64, i64, Option<String>)> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT status, accepted, resumed, finished_at FROM compile_runs WHERE id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(StateError::sqlite("get_run_row"))
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&self, build: &BuildId) -> error::Result<Option<Checkpoint>> {
        let conn = self.lock_conn()?;
        let writer_state: Option<String> = conn
            .query_row(
                "SELECT state_json FROM writer_state WHERE build_id = ?1",
                [build.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StateError::sqlite("load: writer state"))?;

        let shards = Self::load_shards(&conn, build)?;
        let disposed = Self::load_disposed(&conn, build)?;

        if writer_state.is_none() && shards.is_empty() && disposed.is_empty() {
            return Ok(None);
        }

        Ok(Some(Checkpoint {
            build_id: build.as_str().to_string(),
            shards,
            disposed,
            writer_state,
        }))
    }

    fn commit(&self, build: &BuildId, commit: &CheckpointCommit) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(StateError::sqlite("commit: begin tx"))?;

        if let Some(shard) = &commit.shard {
            tx.execute(
                "INSERT OR REPLACE INTO committed_shards \
                 (build_id, partition, shard_id, entry_json) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    build.as_str(),
                    shard.partition.as_str(),
                    i64::from(shard.shard_id),
                    serde_json::to_string(shard)?,
                ],
            )
            .map_err(StateError::sqlite("commit: insert shard"))?;
        }

        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO disposed_episodes \
                     (build_id, episode_id, disposition, findings_json) VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(StateError::sqlite("commit: prepare dispositions"))?;
            for disposed in &commit.disposed {
                stmt.execute(rusqlite::params![
                    build.as_str(),
                    disposed.episode_id,
                    disposed.disposition.as_str(),
                    serde_json::to_string(&disposed.findings)?,
                ])
                .map_err(StateError::sqlite("commit: insert disposition"))?;
            }
        }

        tx.execute(
            "INSERT INTO writer_state (build_id, state_json, updated_at) \
             VALUES (?1, ?2, datetime('now')) \
             ON CONFLICT(build_id) DO UPDATE SET state_json = ?2, updated_at = datetime('now')",
            rusqlite::params![build.as_str(), commit.writer_state],
        )
        .map_err(StateError::sqlite("commit: upsert writer state"))?;

        tx.commit().map_err(StateError::sqlite("commit: commit tx"))?;
        Ok(())
    }

    fn reset(&self, build: &BuildId) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(StateError::sqlite("reset: begin tx"))?;
        for table in ["committed_shards", "disposed_episodes", "writer_state"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE build_id = ?1"),
                [build.as_str()],
            )
            .map_err(StateError::sqlite("reset: delete"))?;
        }
        tx.commit().map_err(StateError::sqlite("reset: commit tx"))?;
        Ok(())
    }

    fn start_run(&self, build: &BuildId, resumed: bool) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO compile_runs (build_id, status, resumed) VALUES (?1, ?2, ?3)",
            rusqlite::params![build.as_str(), RunStatus::Running.as_str(), resumed],
        )
        .map_err(StateError::sqlite("start_run"))?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE compile_runs SET status = ?1, finished_at = datetime('now'), \
             episodes_seen = ?2, episodes_skipped = ?3, accepted = ?4, quarantined = ?5, \
             rejected = ?6, shards_committed = ?7, error_message = ?8 \
             WHERE id = ?9",
            rusqlite::params![
                status.as_str(),
                stats.episodes_seen as i64,
                stats.episodes_skipped as i64,
                stats.accepted as i64,
                stats.quarantined as i64,
                stats.rejected as i64,
                stats.shards_committed as i64,
                stats.error_message,
                run_id,
            ],
        )
        .map_err(StateError::sqlite("complete_run"))?;
        Ok(())
    }
}
