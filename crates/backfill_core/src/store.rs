use std::io::Write;
use std::time::Duration;

use crate::error::StoreError;
use crate::model::{ParentId, Row, RowId, Window};

/// Read/write access to the rows being backfilled.
pub trait RowStore {
    /// Fails when the backing table is missing or unreachable.
    fn ensure_available(&self) -> Result<(), StoreError>;

    fn min_id(&self) -> Result<Option<RowId>, StoreError>;

    fn max_id(&self) -> Result<Option<RowId>, StoreError>;

    /// Rows inside `window` whose derived parent is still unset.
    fn select_unresolved(&self, window: Window) -> Result<Vec<Row>, StoreError>;

    /// Rows of `group_key` that can be the parent of the row `before_id` at
    /// `timestamp`: every row with an earlier timestamp, plus rows with the
    /// same timestamp and a smaller id. Implementations may narrow this to the
    /// rows that can actually win resolution.
    fn select_group_context(
        &self,
        group_key: i64,
        before_id: RowId,
        timestamp: &str,
    ) -> Result<Vec<Row>, StoreError>;

    /// Returns `false` when `row_id` no longer exists and nothing was written.
    fn write_parent(&mut self, row_id: RowId, parent: ParentId) -> Result<bool, StoreError>;
}

/// Synchronization point with secondary read paths.
pub trait ReplicationBarrier {
    /// Block until replicas have applied every write issued so far. `None`
    /// waits without bound.
    fn wait_for_catch_up(&mut self, timeout: Option<Duration>) -> Result<(), StoreError>;
}

/// Persisted one-shot flags keyed by migration name.
pub trait CompletionMarkerStore {
    fn is_set(&self, key: &str) -> Result<bool, StoreError>;

    fn set(&mut self, key: &str) -> Result<(), StoreError>;

    /// Operator reset. The driver never calls this.
    fn clear(&mut self, key: &str) -> Result<bool, StoreError>;
}

/// Sink for human-readable progress lines.
pub trait ProgressReporter {
    fn emit(&mut self, message: &str);
}

/// Writes each message as one line. Write errors are dropped since progress
/// output does not affect the backfill.
#[derive(Debug)]
pub struct LineReporter<W: Write> {
    out: W,
}

impl<W: Write> LineReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ProgressReporter for LineReporter<W> {
    fn emit(&mut self, message: &str) {
        let _ = writeln!(self.out, "{message}");
        let _ = self.out.flush();
    }
}

/// Forwards progress lines to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn emit(&mut self, message: &str) {
        tracing::info!(target: "backfill_core::progress", "{message}");
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectingReporter {
    pub lines: Vec<String>,
}

impl ProgressReporter for CollectingReporter {
    fn emit(&mut self, message: &str) {
        self.lines.push(message.to_string());
    }
}

impl<T: RowStore + ?Sized> RowStore for &mut T {
    fn ensure_available(&self) -> Result<(), StoreError> {
        (**self).ensure_available()
    }

    fn min_id(&self) -> Result<Option<RowId>, StoreError> {
        (**self).min_id()
    }

    fn max_id(&self) -> Result<Option<RowId>, StoreError> {
        (**self).max_id()
    }

    fn select_unresolved(&self, window: Window) -> Result<Vec<Row>, StoreError> {
        (**self).select_unresolved(window)
    }

    fn select_group_context(
        &self,
        group_key: i64,
        before_id: RowId,
        timestamp: &str,
    ) -> Result<Vec<Row>, StoreError> {
        (**self).select_group_context(group_key, before_id, timestamp)
    }

    fn write_parent(&mut self, row_id: RowId, parent: ParentId) -> Result<bool, StoreError> {
        (**self).write_parent(row_id, parent)
    }
}

impl<T: ReplicationBarrier + ?Sized> ReplicationBarrier for &mut T {
    fn wait_for_catch_up(&mut self, timeout: Option<Duration>) -> Result<(), StoreError> {
        (**self).wait_for_catch_up(timeout)
    }
}

impl<T: CompletionMarkerStore + ?Sized> CompletionMarkerStore for &mut T {
    fn is_set(&self, key: &str) -> Result<bool, StoreError> {
        (**self).is_set(key)
    }

    fn set(&mut self, key: &str) -> Result<(), StoreError> {
        (**self).set(key)
    }

    fn clear(&mut self, key: &str) -> Result<bool, StoreError> {
        (**self).clear(key)
    }
}

impl<T: ProgressReporter + ?Sized> ProgressReporter for &mut T {
    fn emit(&mut self, message: &str) {
        (**self).emit(message);
    }
}
