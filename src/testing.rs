//! In-memory reference implementations of the storage traits (SPEC_FULL
//! §10.4), used by this crate's own unit and property tests so they exercise
//! the full `MetadataCatalog` → `SourceReader` → `TargetReader`/`TargetWriter`
//! → `FeedbackSink` → `PlanCacheStore` boundary without a real database.
//! Grounded on the reference crate's `tests/` fixtures, which stood up
//! scratch Postgres tables for the same purpose; here the scratch table is a
//! `Vec` behind a `RefCell`.

use std::cell::RefCell;
use std::collections::HashMap;

use serde_json::Value;

use crate::error::{MergeError, MergeResult, TableId};
use crate::metadata::{EraDescriptor, MetadataCatalog};
use crate::plan::PlanOperation;
use crate::source::RawSourceRow;
use crate::store::{FeedbackRow, FeedbackSink, PlanCacheEntry, PlanCacheStore, TargetReader, TargetRow, TargetWriter};
use crate::types::PlanAction;

/// A fixed table of era descriptors, keyed by `(table, era_name)`.
#[derive(Default)]
pub struct InMemoryCatalog {
    eras: HashMap<(TableId, String), EraDescriptor>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_era(mut self, era: EraDescriptor) -> Self {
        self.eras.insert((era.table.clone(), era.era_name.clone()), era);
        self
    }
}

impl MetadataCatalog for InMemoryCatalog {
    fn resolve_era(&self, table: &TableId, era_name: &str) -> MergeResult<EraDescriptor> {
        self.eras
            .get(&(table.clone(), era_name.to_string()))
            .cloned()
            .ok_or_else(|| MergeError::EraNotFound {
                table: table.clone(),
                era_name: era_name.to_string(),
            })
    }
}

/// A fixed batch of raw source rows for one source table.
#[derive(Default)]
pub struct InMemorySource {
    rows: HashMap<TableId, Vec<RawSourceRow>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, table: TableId, rows: Vec<RawSourceRow>) -> Self {
        self.rows.insert(table, rows);
        self
    }
}

impl crate::source::SourceReader for InMemorySource {
    fn read_rows(&self, source_table: &TableId, _era: &EraDescriptor) -> MergeResult<Vec<RawSourceRow>> {
        Ok(self.rows.get(source_table).cloned().unwrap_or_default())
    }
}

/// An in-memory target table plus the executor's DML surface against it.
/// Every applied op is also recorded verbatim in `applied`, so tests can
/// assert on operation order and shape without re-deriving target state.
pub struct InMemoryTargetStore {
    rows: RefCell<HashMap<TableId, Vec<TargetRow>>>,
    pub applied: RefCell<Vec<PlanOperation>>,
}

impl Default for InMemoryTargetStore {
    fn default() -> Self {
        Self {
            rows: RefCell::new(HashMap::new()),
            applied: RefCell::new(Vec::new()),
        }
    }
}

impl InMemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, table: TableId, rows: Vec<TargetRow>) {
        self.rows.borrow_mut().insert(table, rows);
    }

    pub fn snapshot(&self, table: &TableId) -> Vec<TargetRow> {
        self.rows.borrow().get(table).cloned().unwrap_or_default()
    }
}

impl TargetReader for InMemoryTargetStore {
    fn read_rows(&self, target_table: &TableId, _grouping_keys: &[String], _full_scan: bool) -> MergeResult<Vec<TargetRow>> {
        Ok(self.rows.borrow().get(target_table).cloned().unwrap_or_default())
    }
}

impl TargetWriter for InMemoryTargetStore {
    fn apply(&mut self, target_table: &TableId, op: &PlanOperation) -> MergeResult<()> {
        self.applied.borrow_mut().push(op.clone());

        let mut rows = self.rows.borrow_mut();
        let table_rows = rows.entry(target_table.clone()).or_default();

        match op.operation {
            PlanAction::Delete => {
                if let (Some(from), Some(until)) = (&op.old_valid_from, &op.old_valid_until) {
                    table_rows.retain(|r| !(r.interval.from == *from && r.interval.until == *until));
                }
            }
            PlanAction::Update => {
                if let (Some(old_from), Some(old_until)) = (&op.old_valid_from, &op.old_valid_until) {
                    table_rows.retain(|r| !(r.interval.from == *old_from && r.interval.until == *old_until));
                }
                if let (Some(new_from), Some(new_until), Some(Value::Object(data))) =
                    (&op.new_valid_from, &op.new_valid_until, &op.data)
                {
                    table_rows.push(TargetRow {
                        interval: crate::interval::Interval::new(new_from.clone(), new_until.clone()),
                        identity_keys: op
                            .identity_keys
                            .as_ref()
                            .and_then(|v| v.as_object())
                            .cloned()
                            .unwrap_or_default(),
                        lookup_keys: op
                            .lookup_keys
                            .as_ref()
                            .and_then(|v| v.as_object())
                            .cloned()
                            .unwrap_or_default(),
                        data_payload: data.clone(),
                        ephemeral_payload: Default::default(),
                        pk_payload: Default::default(),
                    });
                }
            }
            PlanAction::Insert => {
                if let (Some(new_from), Some(new_until), Some(Value::Object(data))) =
                    (&op.new_valid_from, &op.new_valid_until, &op.data)
                {
                    table_rows.push(TargetRow {
                        interval: crate::interval::Interval::new(new_from.clone(), new_until.clone()),
                        identity_keys: op
                            .identity_keys
                            .as_ref()
                            .and_then(|v| v.as_object())
                            .cloned()
                            .unwrap_or_default(),
                        lookup_keys: op
                            .lookup_keys
                            .as_ref()
                            .and_then(|v| v.as_object())
                            .cloned()
                            .unwrap_or_default(),
                        data_payload: data.clone(),
                        ephemeral_payload: Default::default(),
                        pk_payload: Default::default(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Collects every feedback row written during a test run, in write order.
#[derive(Default)]
pub struct InMemoryFeedbackSink {
    pub rows: RefCell<Vec<FeedbackRow>>,
}

impl InMemoryFeedbackSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeedbackSink for InMemoryFeedbackSink {
    fn write(&mut self, row: FeedbackRow) -> MergeResult<()> {
        self.rows.borrow_mut().push(row);
        Ok(())
    }
}

/// A bare `HashMap`-backed L2 plan cache, standing in for a host-persisted
/// store across calls within one test.
#[derive(Default)]
pub struct InMemoryPlanCache {
    entries: HashMap<u64, PlanCacheEntry>,
}

impl InMemoryPlanCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlanCacheStore for InMemoryPlanCache {
    fn get(&self, cache_key: u64) -> MergeResult<Option<PlanCacheEntry>> {
        Ok(self.entries.get(&cache_key).cloned())
    }

    fn put(&mut self, cache_key: u64, entry: PlanCacheEntry) -> MergeResult<()> {
        self.entries.insert(cache_key, entry);
        Ok(())
    }

    fn purge(&mut self, max_entries: usize, max_age_unix_secs: i64, now_unix: i64) -> MergeResult<()> {
        self.entries
            .retain(|_, e| now_unix - e.created_at_unix <= max_age_unix_secs);
        if self.entries.len() > max_entries {
            let mut by_use: Vec<(u64, i64)> = self.entries.iter().map(|(k, v)| (*k, v.last_used_at_unix)).collect();
            by_use.sort_by_key(|(_, t)| *t);
            let excess = self.entries.len() - max_entries;
            for (key, _) in by_use.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }
        Ok(())
    }
}
