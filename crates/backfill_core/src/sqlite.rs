use std::fs;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::warn;

use crate::error::StoreError;
use crate::model::{ParentId, Row, RowId, Window};
use crate::store::{CompletionMarkerStore, ReplicationBarrier, RowStore};

const REVISION_COLUMNS: &str = "rev_id, rev_page, rev_timestamp, rev_parent_id";

/// Open (creating if needed) the database file with WAL journaling.
pub fn open_connection(db_path: &Path) -> anyhow::Result<Connection> {
    if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create database parent directory {}", parent.display())
        })?;
    }
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set busy timeout")?;
    Ok(connection)
}

pub fn table_exists(connection: &Connection, table: &str) -> Result<bool, StoreError> {
    let found: Option<i64> = connection
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// `revision` table access.
#[derive(Debug, Clone, Copy)]
pub struct SqliteStore<'c> {
    connection: &'c Connection,
}

impl<'c> SqliteStore<'c> {
    pub fn new(connection: &'c Connection) -> Self {
        Self { connection }
    }

    /// Append a revision; used for seeding and imports.
    pub fn insert_revision(&self, row: &Row) -> Result<(), StoreError> {
        self.connection.execute(
            "INSERT INTO revision (rev_id, rev_page, rev_timestamp, rev_parent_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                row.id.get(),
                row.group_key,
                row.timestamp,
                row.derived_parent.map(ParentId::to_stored),
            ],
        )?;
        Ok(())
    }

    pub fn revision_count(&self) -> Result<u64, StoreError> {
        self.count("SELECT COUNT(*) FROM revision")
    }

    pub fn unresolved_count(&self) -> Result<u64, StoreError> {
        self.count("SELECT COUNT(*) FROM revision WHERE rev_parent_id IS NULL")
    }

    pub fn stored_parent(&self, row_id: RowId) -> Result<Option<ParentId>, StoreError> {
        let stored: Option<Option<i64>> = self
            .connection
            .query_row(
                "SELECT rev_parent_id FROM revision WHERE rev_id = ?1",
                params![row_id.get()],
                |row| row.get(0),
            )
            .optional()?;
        stored.flatten().map(ParentId::from_stored).transpose()
    }

    fn count(&self, sql: &str) -> Result<u64, StoreError> {
        let count: i64 = self.connection.query_row(sql, [], |row| row.get(0))?;
        u64::try_from(count).map_err(|_| StoreError::InvalidRow(format!("negative count {count}")))
    }

    fn query_rows(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Row>, StoreError> {
        let mut statement = self.connection.prepare_cached(sql)?;
        let raw = statement
            .query_map(args, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter()
            .map(|(id, page, timestamp, parent)| -> Result<Row, StoreError> {
                Ok(Row {
                    id: RowId::new(id)?,
                    group_key: page,
                    timestamp,
                    derived_parent: parent.map(ParentId::from_stored).transpose()?,
                })
            })
            .collect()
    }

    fn min_max(&self, aggregate: &str) -> Result<Option<RowId>, StoreError> {
        let value: Option<i64> = self.connection.query_row(
            &format!("SELECT {aggregate}(rev_id) FROM revision"),
            [],
            |row| row.get(0),
        )?;
        value.map(RowId::new).transpose()
    }
}

impl RowStore for SqliteStore<'_> {
    fn ensure_available(&self) -> Result<(), StoreError> {
        if table_exists(self.connection, "revision")? {
            Ok(())
        } else {
            Err(StoreError::MissingTable("revision".to_string()))
        }
    }

    fn min_id(&self) -> Result<Option<RowId>, StoreError> {
        self.min_max("MIN")
    }

    fn max_id(&self) -> Result<Option<RowId>, StoreError> {
        self.min_max("MAX")
    }

    fn select_unresolved(&self, window: Window) -> Result<Vec<Row>, StoreError> {
        self.query_rows(
            &format!(
                "SELECT {REVISION_COLUMNS} FROM revision
                 WHERE rev_id BETWEEN ?1 AND ?2 AND rev_parent_id IS NULL
                 ORDER BY rev_id"
            ),
            params![window.start, window.end],
        )
    }

    /// Returns only the candidates that can win: the highest smaller id at the
    /// same timestamp, or failing that the highest id at the latest earlier
    /// timestamp.
    fn select_group_context(
        &self,
        group_key: i64,
        before_id: RowId,
        timestamp: &str,
    ) -> Result<Vec<Row>, StoreError> {
        let same_second = self.query_rows(
            &format!(
                "SELECT {REVISION_COLUMNS} FROM revision
                 WHERE rev_page = ?1 AND rev_timestamp = ?2 AND rev_id < ?3
                 ORDER BY rev_id DESC LIMIT 1"
            ),
            params![group_key, timestamp, before_id.get()],
        )?;
        if !same_second.is_empty() {
            return Ok(same_second);
        }
        self.query_rows(
            &format!(
                "SELECT {REVISION_COLUMNS} FROM revision
                 WHERE rev_page = ?1 AND rev_timestamp = (
                     SELECT MAX(rev_timestamp) FROM revision
                     WHERE rev_page = ?1 AND rev_timestamp < ?2
                 )
                 ORDER BY rev_id DESC LIMIT 1"
            ),
            params![group_key, timestamp],
        )
    }

    fn write_parent(&mut self, row_id: RowId, parent: ParentId) -> Result<bool, StoreError> {
        let updated = self.connection.execute(
            "UPDATE revision SET rev_parent_id = ?1 WHERE rev_id = ?2",
            params![parent.to_stored(), row_id.get()],
        )?;
        Ok(updated > 0)
    }
}

/// Completion markers in MediaWiki's `updatelog` table.
#[derive(Debug, Clone, Copy)]
pub struct SqliteMarkers<'c> {
    connection: &'c Connection,
}

impl<'c> SqliteMarkers<'c> {
    pub fn new(connection: &'c Connection) -> Self {
        Self { connection }
    }
}

impl CompletionMarkerStore for SqliteMarkers<'_> {
    fn is_set(&self, key: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .connection
            .query_row(
                "SELECT 1 FROM updatelog WHERE ul_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn set(&mut self, key: &str) -> Result<(), StoreError> {
        self.connection.execute(
            "INSERT OR IGNORE INTO updatelog (ul_key, ul_value) VALUES (?1, NULL)",
            params![key],
        )?;
        Ok(())
    }

    fn clear(&mut self, key: &str) -> Result<bool, StoreError> {
        let removed = self
            .connection
            .execute("DELETE FROM updatelog WHERE ul_key = ?1", params![key])?;
        Ok(removed > 0)
    }
}

/// Waits until readers of the main database file see every committed write,
/// i.e. the WAL has been fully checkpointed.
#[derive(Debug)]
pub struct CheckpointBarrier<'c> {
    connection: &'c Connection,
    poll_interval: Duration,
}

impl<'c> CheckpointBarrier<'c> {
    pub fn new(connection: &'c Connection) -> Self {
        Self {
            connection,
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// One passive checkpoint; true when nothing is left in the WAL.
    fn checkpoint(&self) -> Result<bool, StoreError> {
        let (busy, log_frames, checkpointed): (i64, i64, i64) = self.connection.query_row(
            "PRAGMA wal_checkpoint(PASSIVE)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        // log_frames is -1 when the database is not in WAL mode.
        Ok(busy == 0 && (log_frames < 0 || checkpointed >= log_frames))
    }
}

impl ReplicationBarrier for CheckpointBarrier<'_> {
    fn wait_for_catch_up(&mut self, timeout: Option<Duration>) -> Result<(), StoreError> {
        let started = Instant::now();
        let mut warned = false;
        loop {
            if self.checkpoint()? {
                return Ok(());
            }
            let waited = started.elapsed();
            if let Some(limit) = timeout
                && waited >= limit
            {
                return Err(StoreError::BarrierTimeout(limit));
            }
            if !warned && waited >= Duration::from_secs(5) {
                warn!(
                    waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    "still waiting for WAL checkpoint"
                );
                warned = true;
            }
            sleep(self.poll_interval);
        }
    }
}

/// Barrier for deployments without secondaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReplicaBarrier;

impl ReplicationBarrier for NoReplicaBarrier {
    fn wait_for_catch_up(&mut self, _timeout: Option<Duration>) -> Result<(), StoreError> {
        Ok(())
    }
}
