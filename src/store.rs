//! Storage trait boundary (SPEC_FULL §10.5). A host integration supplies
//! concrete implementations of these traits; this crate supplies only the
//! storage-agnostic planner/executor logic and, under `testing`, in-memory
//! implementations used by its own tests. Generalizes the reference crate's
//! direct SPI calls (`reader::read_target_rows_with_sql`, the PL/pgSQL
//! executor `executor_cache.rs` only prepares SQL for) into traits.

use serde_json::{Map, Value};

use crate::error::{MergeError, MergeResult, TableId};
use crate::interval::Interval;
use crate::plan::PlanOperation;

/// One pre-existing row of the target table (spec §3's "Target row").
#[derive(Debug, Clone)]
pub struct TargetRow {
    pub interval: Interval,
    pub identity_keys: Map<String, Value>,
    pub lookup_keys: Map<String, Value>,
    pub data_payload: Map<String, Value>,
    pub ephemeral_payload: Map<String, Value>,
    /// Primary-key columns that are neither identity, lookup, nor temporal;
    /// carried through so they can be echoed in `entity_keys` (reference
    /// crate's `pk_payload`).
    pub pk_payload: Map<String, Value>,
}

/// Reads the overlapping target-row slice for one batch of entities
/// (spec §4.4). Generalizes `reader::read_target_rows_with_sql` and its
/// `build_target_filter` optimization: implementors should scan only target
/// rows whose identity/lookup columns appear in the source batch, extended
/// by one neighbour on each side for coalescing — unless `full_scan` is
/// true, which the planner sets for delete modes that must see every target
/// entity (`DELETE_MISSING_ENTITIES`-family) regardless of what the source
/// batch mentions.
pub trait TargetReader {
    fn read_rows(
        &self,
        target_table: &TableId,
        grouping_keys: &[String],
        full_scan: bool,
    ) -> MergeResult<Vec<TargetRow>>;
}

/// Applies one plan operation's write against the target store (spec §4.9).
/// Generalizes the PL/pgSQL executor the reference `native` crate only
/// prepares SQL fragments for (`executor_cache.rs`); here the trait is the
/// entire DML surface.
pub trait TargetWriter {
    fn apply(&mut self, target_table: &TableId, op: &PlanOperation) -> MergeResult<()>;
}

/// Per-source-row feedback status (spec §3's "Feedback row").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackStatus {
    Applied,
    SkippedIdentical,
    SkippedFiltered,
    SkippedNoTarget,
    SkippedEclipsed,
    Error,
}

impl FeedbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "APPLIED",
            Self::SkippedIdentical => "SKIPPED_IDENTICAL",
            Self::SkippedFiltered => "SKIPPED_FILTERED",
            Self::SkippedNoTarget => "SKIPPED_NO_TARGET",
            Self::SkippedEclipsed => "SKIPPED_ECLIPSED",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedbackRow {
    pub source_row_id: i64,
    pub target_entity_keys: Option<Value>,
    pub status: FeedbackStatus,
    pub error_message: Option<String>,
}

/// Writes one feedback row per source row (spec §4.9/§6's feedback
/// contract). Generalizes "a feedback table or a column update on the
/// source" into a single sink the executor writes through.
pub trait FeedbackSink {
    fn write(&mut self, row: FeedbackRow) -> MergeResult<()>;
}

/// One cached L2 plan-cache entry (spec §4.10): `(cache_key,
/// source_columns_hash, plan_sqls, created_at, last_used_at, use_count)`.
/// `plan_shape` stands in for `plan_sqls`: this crate has no SQL to cache,
/// only the shape of the plan (which `PlanOperation`s an entity's timeline
/// decomposes into, independent of the literal values flowing through it).
#[derive(Debug, Clone)]
pub struct PlanCacheEntry {
    pub source_columns_hash: u64,
    pub plan_shape: Vec<u8>,
    pub created_at_unix: i64,
    pub last_used_at_unix: i64,
    pub use_count: u64,
}

/// The persistent L2 cache (spec §4.10). L1 (per-connection, unbounded,
/// cleared on session end) is an in-process `HashMap` owned by `cache.rs`
/// and needs no trait; L2 crosses calls and so is host-backed.
pub trait PlanCacheStore {
    fn get(&self, cache_key: u64) -> MergeResult<Option<PlanCacheEntry>>;
    fn put(&mut self, cache_key: u64, entry: PlanCacheEntry) -> MergeResult<()>;
    /// Evict entries older than `max_age_unix_secs` beyond `max_entries`,
    /// least-recently-used first. Called probabilistically (spec §4.10: 2%
    /// of stores) by `cache.rs`, never synchronously on every call.
    fn purge(&mut self, max_entries: usize, max_age_unix_secs: i64, now_unix: i64) -> MergeResult<()>;
}

/// Wraps a host storage error as a [`MergeError::Store`].
pub fn store_error(err: impl std::error::Error + Send + Sync + 'static) -> MergeError {
    MergeError::Store(Box::new(err))
}
