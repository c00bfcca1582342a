use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{BackfillError, Result};
use crate::model::{ParentId, Row, Window};
use crate::partition::{ChunkSize, Windows};
use crate::resolver::resolve_parent;
use crate::store::{CompletionMarkerStore, ProgressReporter, ReplicationBarrier, RowStore};

pub const DEFAULT_UPDATE_KEY: &str = "populate rev_parent_id";

const SKIPPED_MESSAGE: &str = "rev_parent_id column of revision table already populated.";

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub chunk_size: ChunkSize,
    /// Completion marker key.
    pub update_key: String,
    /// Run even when the completion marker is present.
    pub force: bool,
    /// Start cursor recorded by an earlier, interrupted run. Values below the
    /// smallest id are raised to it.
    pub resume_from: Option<i64>,
    /// Upper bound for each replication barrier wait; `None` waits forever.
    pub barrier_timeout: Option<Duration>,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            chunk_size: ChunkSize::default(),
            update_key: DEFAULT_UPDATE_KEY.to_string(),
            force: false,
            resume_from: None,
            barrier_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    NotStarted,
    Running,
    Completed,
    PartialResume,
    SkippedEmpty,
    AlreadyDone,
}

/// Terminal outcome of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Resumed run finished its windows, but rows below the resume cursor
    /// are still unset; the completion marker was not written.
    PartialResume,
    SkippedEmpty,
    AlreadyDone,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::PartialResume => "partial_resume",
            Self::SkippedEmpty => "skipped_empty",
            Self::AlreadyDone => "already_done",
        }
    }
}

impl From<RunStatus> for DriverState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => Self::Completed,
            RunStatus::PartialResume => Self::PartialResume,
            RunStatus::SkippedEmpty => Self::SkippedEmpty,
            RunStatus::AlreadyDone => Self::AlreadyDone,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub status: RunStatus,
    pub update_key: String,
    /// Rows visited and written.
    pub count: usize,
    /// Rows that ended up with a real parent where none was stored before.
    pub changed: usize,
    pub windows: usize,
    pub last_window: Option<Window>,
    /// Unset rows left below the resume cursor.
    pub unresolved_below_cursor: usize,
}

impl BackfillReport {
    fn new(status: RunStatus, update_key: &str) -> Self {
        Self {
            status,
            update_key: update_key.to_string(),
            count: 0,
            changed: 0,
            windows: 0,
            last_window: None,
            unresolved_below_cursor: 0,
        }
    }
}

/// Walks the id domain window by window and fills in missing parents.
pub struct BackfillDriver<S, B, M, P> {
    store: S,
    barrier: B,
    markers: M,
    progress: P,
    options: BackfillOptions,
    state: DriverState,
}

impl<S, B, M, P> BackfillDriver<S, B, M, P>
where
    S: RowStore,
    B: ReplicationBarrier,
    M: CompletionMarkerStore,
    P: ProgressReporter,
{
    pub fn new(store: S, barrier: B, markers: M, progress: P, options: BackfillOptions) -> Self {
        Self {
            store,
            barrier,
            markers,
            progress,
            options,
            state: DriverState::NotStarted,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Run the backfill to completion. Any storage error aborts the run
    /// without setting the completion marker; rerunning is always safe.
    pub fn run(&mut self) -> Result<BackfillReport> {
        self.state = DriverState::Running;
        let result = self.run_inner();
        if let Ok(report) = &result {
            self.state = report.status.into();
        }
        result
    }

    fn run_inner(&mut self) -> Result<BackfillReport> {
        let key = self.options.update_key.clone();

        if !self.options.force && self.markers.is_set(&key).map_err(BackfillError::Marker)? {
            info!(update_key = %key, "completion marker present, skipping");
            self.progress.emit(&format!("Update '{key}' already logged as completed."));
            self.progress.emit(SKIPPED_MESSAGE);
            return Ok(BackfillReport::new(RunStatus::AlreadyDone, &key));
        }

        self.store
            .ensure_available()
            .map_err(BackfillError::SourceUnavailable)?;
        self.progress.emit("Populating rev_parent_id column");

        let min = self.store.min_id().map_err(|source| BackfillError::Read {
            operation: "read minimum rev_id",
            source,
        })?;
        let max = self.store.max_id().map_err(|source| BackfillError::Read {
            operation: "read maximum rev_id",
            source,
        })?;
        let (Some(min), Some(max)) = (min, max) else {
            self.progress
                .emit("...revision table seems to be empty, nothing to do.");
            self.markers.set(&key).map_err(BackfillError::Marker)?;
            info!(update_key = %key, "source empty, marked complete");
            return Ok(BackfillReport::new(RunStatus::SkippedEmpty, &key));
        };

        let start = match self.options.resume_from {
            Some(cursor) if cursor > max.get() => {
                return Err(BackfillError::InvalidConfig(format!(
                    "resume cursor {cursor} is past the largest rev_id {max}"
                )));
            }
            Some(cursor) => cursor.max(min.get()),
            None => min.get(),
        };
        info!(
            min = min.get(),
            max = max.get(),
            start,
            chunk_size = self.options.chunk_size.get(),
            "starting rev_parent_id backfill"
        );

        let mut report = BackfillReport::new(RunStatus::Completed, &key);
        let mut windows = Windows::resume(start, max.get(), self.options.chunk_size);
        while let Some(window) = windows.next() {
            self.progress.emit(&format!(
                "...doing rev_id from {} to {}",
                window.start, window.end
            ));
            let (visited, changed) = self.process_window(window)?;
            self.progress
                .emit(&format!("...{visited} rows [{changed} changed]"));
            report.count += visited;
            report.changed += changed;
            report.windows += 1;
            report.last_window = Some(window);

            self.barrier
                .wait_for_catch_up(self.options.barrier_timeout)
                .map_err(BackfillError::ReplicationLag)?;
            debug!(
                %window,
                visited,
                changed,
                next_cursor = ?windows.cursor(),
                "window complete"
            );
        }

        if start > min.get() {
            let skipped = Window {
                start: min.get(),
                end: start - 1,
            };
            let pending = self
                .store
                .select_unresolved(skipped)
                .map_err(|source| BackfillError::Read {
                    operation: "select unresolved revisions below resume cursor",
                    source,
                })?
                .len();
            if pending > 0 {
                report.status = RunStatus::PartialResume;
                report.unresolved_below_cursor = pending;
                self.progress.emit(&format!(
                    "...{pending} rows below rev_id {start} still unresolved, not marking '{key}' complete"
                ));
                warn!(
                    update_key = %key,
                    start,
                    pending,
                    "resumed run left earlier rows unresolved"
                );
                return Ok(report);
            }
        }

        self.markers.set(&key).map_err(BackfillError::Marker)?;
        self.progress.emit(&format!(
            "rev_parent_id population complete ... {} rows [{} changed]",
            report.count, report.changed
        ));
        info!(
            update_key = %key,
            count = report.count,
            changed = report.changed,
            windows = report.windows,
            "rev_parent_id backfill complete"
        );
        Ok(report)
    }

    fn process_window(&mut self, window: Window) -> Result<(usize, usize)> {
        let rows = self
            .store
            .select_unresolved(window)
            .map_err(|source| BackfillError::Read {
                operation: "select unresolved revisions",
                source,
            })?;

        let mut visited = 0usize;
        let mut changed = 0usize;
        for row in rows {
            let parent = self.resolve(&row)?;
            // An unset parent reads as the sentinel, so rows without an
            // earlier revision do not count as changed.
            let differs = row.derived_parent.unwrap_or(ParentId::None) != parent;
            let written = self
                .store
                .write_parent(row.id, parent)
                .map_err(|source| BackfillError::WriteFailure {
                    row_id: row.id,
                    source,
                })?;
            if !written {
                debug!(rev_id = row.id.get(), "revision vanished before parent write");
                continue;
            }
            debug!(rev_id = row.id.get(), rev_page = row.group_key, %parent, "parent written");
            visited += 1;
            if differs {
                changed += 1;
            }
        }
        Ok((visited, changed))
    }

    fn resolve(&self, row: &Row) -> Result<ParentId> {
        let context = self
            .store
            .select_group_context(row.group_key, row.id, &row.timestamp)
            .map_err(|source| BackfillError::Read {
                operation: "select page revisions",
                source,
            })?;
        Ok(resolve_parent(row, &context))
    }
}
