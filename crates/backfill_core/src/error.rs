use std::time::Duration;

use crate::model::RowId;

/// Errors raised by storage collaborators (row store, marker store, barrier).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("table `{0}` does not exist")]
    MissingTable(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("replicas did not catch up within {0:?}")]
    BarrierTimeout(Duration),
}

/// Fatal outcomes of a backfill run. An empty source table is not an error.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("row source unavailable")]
    SourceUnavailable(#[source] StoreError),

    #[error("failed to {operation}")]
    Read {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("failed to write parent for row {row_id}")]
    WriteFailure {
        row_id: RowId,
        #[source]
        source: StoreError,
    },

    #[error("completion marker store failed")]
    Marker(#[source] StoreError),

    #[error("replication barrier failed")]
    ReplicationLag(#[source] StoreError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T, E = BackfillError> = std::result::Result<T, E>;
