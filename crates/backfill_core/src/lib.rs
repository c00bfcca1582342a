//! Resumable, chunked backfill of `revision.rev_parent_id`.
//!
//! The id domain is walked in fixed-size windows; every revision whose parent
//! is still unset gets the previous revision of its page, and replicas are
//! given a chance to catch up after each window. A completion marker makes
//! reruns no-ops.

pub mod config;
pub mod driver;
pub mod error;
pub mod migrate;
pub mod model;
pub mod partition;
pub mod resolver;
pub mod sqlite;
pub mod store;

pub use driver::{BackfillDriver, BackfillOptions, BackfillReport, DriverState, RunStatus};
pub use error::{BackfillError, StoreError};
pub use model::{ParentId, Row, RowId, Window};
pub use partition::{ChunkSize, Windows, next_window};
pub use resolver::resolve_parent;
