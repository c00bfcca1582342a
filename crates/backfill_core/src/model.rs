use std::fmt;

use serde::Serialize;

use crate::error::StoreError;

/// Primary key of a revision row. Always strictly positive: `0` is reserved
/// for [`ParentId::None`] in stored form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RowId(i64);

impl RowId {
    pub fn new(value: i64) -> Result<Self, StoreError> {
        if value <= 0 {
            return Err(StoreError::InvalidRow(format!(
                "row id must be positive, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of parent resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentId {
    Revision(RowId),
    /// No earlier revision of the page qualifies.
    None,
}

impl ParentId {
    /// Integer form written to `rev_parent_id`.
    pub fn to_stored(self) -> i64 {
        match self {
            Self::Revision(id) => id.get(),
            Self::None => 0,
        }
    }

    pub fn from_stored(value: i64) -> Result<Self, StoreError> {
        if value == 0 {
            Ok(Self::None)
        } else {
            RowId::new(value).map(Self::Revision)
        }
    }
}

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Revision(id) => write!(f, "{id}"),
            Self::None => f.write_str("none"),
        }
    }
}

/// Fixed-shape view of a `revision` row with only the columns the backfill reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub id: RowId,
    /// Page the revision belongs to (`rev_page`).
    pub group_key: i64,
    /// MediaWiki `YYYYMMDDHHMMSS` timestamp; compared as a string.
    pub timestamp: String,
    /// `None` while `rev_parent_id` is NULL.
    pub derived_parent: Option<ParentId>,
}

impl Row {
    pub fn new(id: RowId, group_key: i64, timestamp: impl Into<String>) -> Self {
        Self {
            id,
            group_key,
            timestamp: timestamp.into(),
            derived_parent: None,
        }
    }
}

/// Inclusive id range `[start, end]` processed as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn contains(&self, id: i64) -> bool {
        self.start <= id && id <= self.end
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[cfg(test)]
pub(crate) fn row_id(value: i64) -> RowId {
    RowId::new(value).expect("positive row id")
}
