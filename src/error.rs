//! Error taxonomy (spec §7). Per-row benign skips are never `Err` — they
//! surface as feedback statuses (`FeedbackStatus`), not exceptions.

use std::fmt;

/// A table identifier as seen by the host's catalog: schema + table name.
/// Kept string-based since the catalog/store boundary is host-defined (spec §10.5).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableId {
    pub schema: String,
    pub table: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("no era named \"{era_name}\" found for target table {table}")]
    EraNotFound { table: TableId, era_name: String },

    #[error("era \"{era_name}\" on table {table} is system-versioned; temporal_merge does not operate on system-versioned eras")]
    EraIsSystemVersioned { table: TableId, era_name: String },

    #[error("range domain {domain:?} is unsupported for temporal_merge")]
    RangeDomainUnsupported { domain: String },

    #[error("source row {row_id} has no well-defined interval: neither a native range column nor valid_from/valid_until was provided")]
    MissingInterval { row_id: i64 },

    #[error("source row {row_id} has an ambiguous interval: a native range and valid_from/valid_until/valid_to were both given and disagree")]
    AmbiguousInterval { row_id: i64 },

    #[error("source row {row_id} has an invalid interval [{from}, {until}): from must be strictly less than until")]
    InvalidInterval {
        row_id: i64,
        from: String,
        until: String,
    },

    #[error("source rows sharing founding_id {founding_id:?} resolve to conflicting grouping keys")]
    ConflictingFoundingLookup { founding_id: String },

    #[error("source row {row_id} is ambiguous: it matches multiple distinct target entities {entities:?}")]
    ConflictingIdentityResolution {
        row_id: i64,
        entities: Vec<serde_json::Value>,
    },

    #[error("coverage aggregate input intervals were not sorted by `from`")]
    InputNotSorted,

    #[error("planner invariant violated: {message}")]
    PlannerInvariantViolation { message: String },

    #[error("storage backend error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type MergeResult<T> = Result<T, MergeError>;
