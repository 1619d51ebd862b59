//! Temporal-merge planner and executor for bitemporal tables (spec §1-§6).
//!
//! Given a source batch and a target table's existing timeline, this crate
//! resolves entities, segments their combined timeline into atomic pieces,
//! classifies each piece's payload under one of eight merge modes, coalesces
//! adjacent identical pieces, and diffs the result against the target to
//! produce an ordered sequence of [`plan::PlanOperation`]s — the sole
//! contract between planning and execution (spec §3). [`temporal_merge_plan`]
//! stops there; [`temporal_merge`] additionally executes the plan and writes
//! per-row feedback.
//!
//! Storage is abstracted behind the traits in [`store`], [`metadata`], and
//! [`source`]: this crate never issues SQL itself (spec §1's "engine-specific
//! catalog access" is out of scope). [`testing`] supplies in-memory
//! implementations of those traits for this crate's own test suite and for a
//! host integration's tests.
//!
//! Generalizes the reference crate's `temporal_merge_plan_native` pg_extern
//! entry point (`lib.rs`), which wired the same phases directly against
//! `pgrx`/SPI; here the phases are storage-agnostic and the host supplies the
//! SPI-equivalent trait implementations.

pub mod cache;
pub mod classify;
pub mod coalesce;
pub mod domain;
pub mod entity;
pub mod error;
pub mod executor;
pub mod interval;
pub mod metadata;
pub mod plan;
pub mod segment;
pub mod source;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use tracing::{debug, info};

pub use error::{MergeError, MergeResult, TableId};
pub use plan::PlanOperation;
pub use types::{DeleteMode, IdentityStrategy, MergeMode};

use metadata::MetadataCatalog;
use plan::{classify_operations, make_feedback_plan_row, sequence_statements};
use source::SourceReader;
use store::{FeedbackSink, TargetReader, TargetWriter};
use types::PlannerContext;

/// The parameters of one `temporal_merge`/`temporal_merge_plan` call (spec
/// §6's external interface). `identity_columns` and `lookup_keys` live on
/// the era itself; everything about the era's shape is resolved from
/// `catalog` rather than passed in here.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub target_table: TableId,
    pub source_table: TableId,
    pub mode: MergeMode,
    pub era_name: String,
    pub row_id_column: String,
    pub founding_id_column: Option<String>,
    pub delete_mode: DeleteMode,
    pub update_source_with_feedback: bool,
    pub log_trace: bool,
}

impl MergeRequest {
    pub fn new(target_table: TableId, source_table: TableId, mode: MergeMode) -> Self {
        Self {
            target_table,
            source_table,
            mode,
            era_name: "valid".to_string(),
            row_id_column: "row_id".to_string(),
            founding_id_column: None,
            delete_mode: DeleteMode::None,
            update_source_with_feedback: false,
            log_trace: false,
        }
    }
}

/// Resolve `req` into a [`PlannerContext`] by consulting `catalog` for the
/// era's shape (spec §4.2). Shared by [`temporal_merge_plan`] and
/// [`temporal_merge`] so both build the context identically.
fn build_context(req: &MergeRequest, catalog: &dyn MetadataCatalog) -> MergeResult<PlannerContext> {
    let era = catalog.resolve_era(&req.target_table, &req.era_name)?;
    era.validate()?;

    let has_identity = !era.identity_columns.is_empty();
    let has_lookup = !era.lookup_key_sets.is_empty();

    Ok(PlannerContext {
        target_table: req.target_table.clone(),
        source_table: req.source_table.clone(),
        mode: req.mode,
        delete_mode: req.delete_mode,
        era,
        row_id_column: req.row_id_column.clone(),
        founding_id_column: req.founding_id_column.clone(),
        update_source_with_feedback: req.update_source_with_feedback,
        log_trace: req.log_trace,
        strategy: IdentityStrategy::derive(has_identity, has_lookup),
    })
}

/// Phase 2-4: read source and target rows, resolve entities, and produce the
/// final, globally ordered plan (spec §4.3-§4.8). Read-only: issues no
/// writes. This is the function a plan-introspection entry point (spec §6)
/// calls directly.
pub fn temporal_merge_plan(
    req: &MergeRequest,
    catalog: &dyn MetadataCatalog,
    source_reader: &dyn SourceReader,
    target_reader: &dyn TargetReader,
) -> MergeResult<Vec<PlanOperation>> {
    let ctx = build_context(req, catalog)?;

    let raw_source_rows = source_reader.read_rows(&req.source_table, &ctx.era)?;
    let source_rows = source::ingest(raw_source_rows, &ctx.era)?;

    let full_scan = ctx.delete_mode.deletes_entities();
    let grouping_keys: Vec<String> = Vec::new();
    let target_rows = target_reader.read_rows(&req.target_table, &grouping_keys, full_scan)?;

    debug!(
        source_rows = source_rows.len(),
        target_rows = target_rows.len(),
        mode = ?ctx.mode,
        "loaded batch for planning"
    );

    let matched = entity::correlate_entities(&source_rows, &target_rows, &ctx)?;
    let matched = entity::canonicalize_new_entities(matched, &ctx);
    let matched = entity::detect_eclipsed(matched, &ctx);

    let groups = entity::group_by_entity(matched, target_rows, &ctx);

    let mut plan_rows = Vec::new();

    for group in groups.values() {
        for sr in &group.source_rows {
            if let Some(fb) = &sr.early_feedback {
                plan_rows.push(make_feedback_plan_row(sr, fb, &ctx));
            } else if sr.is_eclipsed {
                let eclipsed = entity::EarlyFeedback {
                    action: types::PlanAction::SkipEclipsed,
                    message: None,
                };
                plan_rows.push(make_feedback_plan_row(sr, &eclipsed, &ctx));
            }
        }

        let active_sources: Vec<&entity::MatchedSourceRow> = group
            .source_rows
            .iter()
            .filter(|sr| sr.early_feedback.is_none() && !sr.is_eclipsed)
            .collect();
        let filtered_sources = entity::filter_by_mode(&active_sources, &ctx);

        for sr in &active_sources {
            if !filtered_sources.iter().any(|f| f.source.row_id == sr.source.row_id) {
                let filtered = entity::EarlyFeedback {
                    action: types::PlanAction::SkipFiltered,
                    message: None,
                };
                plan_rows.push(make_feedback_plan_row(sr, &filtered, &ctx));
            }
        }

        if filtered_sources.is_empty()
            && group.target_rows.is_empty()
        {
            continue;
        }
        if filtered_sources.is_empty() && !ctx.delete_mode.deletes_timeline() && !ctx.delete_mode.deletes_entities() {
            continue;
        }

        let segments = segment::build_atomic_segments(group, &filtered_sources, &ctx);
        let resolved = classify::resolve_payloads(segments, &filtered_sources, &group.target_rows, &ctx);
        let coalesced = coalesce::coalesce_segments(resolved, &ctx);
        plan_rows.extend(classify_operations(coalesced, group, &ctx));
    }

    sequence_statements(&mut plan_rows, &ctx);

    Ok(plan_rows)
}

/// Plan, then execute the plan against `writer`, then (when
/// `update_source_with_feedback` is set) write one feedback row per source
/// `row_id` through `feedback` (spec §4.9/§6). The caller is responsible for
/// wrapping this call in its own transaction and rolling it back on `Err`.
pub fn temporal_merge(
    req: &MergeRequest,
    catalog: &dyn MetadataCatalog,
    source_reader: &dyn SourceReader,
    target_reader: &dyn TargetReader,
    writer: &mut dyn TargetWriter,
    feedback: Option<&mut dyn FeedbackSink>,
) -> MergeResult<Vec<PlanOperation>> {
    let plan_rows = temporal_merge_plan(req, catalog, source_reader, target_reader)?;

    info!(plan_op_count = plan_rows.len(), "executing temporal merge plan");

    let feedback = if req.update_source_with_feedback { feedback } else { None };
    executor::execute(&req.target_table, &plan_rows, writer, feedback)?;

    Ok(plan_rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{BoundValue, Domain};
    use metadata::{EraDescriptor, IntervalRepresentation};
    use serde_json::json;
    use source::RawSourceRow;
    use std::collections::HashSet;
    use store::TargetRow;
    use testing::{InMemoryCatalog, InMemoryFeedbackSink, InMemorySource, InMemoryTargetStore};
    use types::PlanAction;

    fn employees_era() -> EraDescriptor {
        EraDescriptor {
            table: TableId::new("public", "employees"),
            era_name: "valid".into(),
            valid_from_col: "valid_from".into(),
            valid_until_col: "valid_until".into(),
            valid_to_col: None,
            range_col: None,
            range_constructor: None,
            representation: IntervalRepresentation::BoundsOnly,
            domain: Domain::Date,
            identity_columns: vec!["id".into()],
            lookup_key_sets: vec![],
            ephemeral_columns: vec![],
            not_null_defaulted_columns: HashSet::new(),
            system_versioned: false,
        }
    }

    fn raw_row(row_id: i64, id: i64, from: &str, until: &str, name: &str) -> RawSourceRow {
        let mut identity_keys = serde_json::Map::new();
        identity_keys.insert("id".into(), json!(id));
        let mut data_payload = serde_json::Map::new();
        data_payload.insert("name".into(), json!(name));
        RawSourceRow {
            row_id,
            founding_id: None,
            valid_from: Some(BoundValue::finite(from)),
            valid_until: Some(BoundValue::finite(until)),
            valid_to: None,
            range: None,
            identity_keys,
            lookup_keys: serde_json::Map::new(),
            data_payload,
            ephemeral_payload: serde_json::Map::new(),
        }
    }

    fn target_row(id: i64, from: &str, until: &str, name: &str) -> TargetRow {
        let mut identity_keys = serde_json::Map::new();
        identity_keys.insert("id".into(), json!(id));
        let mut data_payload = serde_json::Map::new();
        data_payload.insert("name".into(), json!(name));
        TargetRow {
            interval: interval::Interval::new(BoundValue::finite(from), BoundValue::finite(until)),
            identity_keys,
            lookup_keys: serde_json::Map::new(),
            data_payload,
            ephemeral_payload: serde_json::Map::new(),
            pk_payload: serde_json::Map::new(),
        }
    }

    fn catalog() -> InMemoryCatalog {
        InMemoryCatalog::new().with_era(employees_era())
    }

    fn req(mode: MergeMode) -> MergeRequest {
        let mut r = MergeRequest::new(TableId::new("public", "employees"), TableId::new("public", "employees_src"), mode);
        r.update_source_with_feedback = true;
        r
    }

    // S1: insert brand-new entity.
    #[test]
    fn s1_insert_brand_new_entity() {
        let req = req(MergeMode::MergeEntityUpsert);
        let source = InMemorySource::new().with_rows(
            req.source_table.clone(),
            vec![raw_row(1, 10, "2024-01-01", "2024-07-01", "A")],
        );
        let mut target = InMemoryTargetStore::new();

        let plan = temporal_merge_plan(&req, &catalog(), &source, &target).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].operation, PlanAction::Insert);

        let mut sink = InMemoryFeedbackSink::new();
        executor::execute(&req.target_table, &plan, &mut target, Some(&mut sink)).unwrap();
        let rows = sink.rows.borrow();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_row_id, 1);
        assert_eq!(rows[0].status, store::FeedbackStatus::Applied);
    }

    // S2: update-for-portion-of splits the target row around the updated
    // slice — DELETE of the original, then one INSERT per resulting slice
    // (the unchanged lead, the updated middle, the unchanged tail).
    #[test]
    fn s2_update_for_portion_splits_target() {
        let req = req(MergeMode::UpdateForPortionOf);
        let source = InMemorySource::new().with_rows(
            req.source_table.clone(),
            vec![raw_row(1, 10, "2024-06-01", "2024-09-01", "B")],
        );
        let mut target = InMemoryTargetStore::new();
        target.seed(req.target_table.clone(), vec![target_row(10, "2024-01-01", "2025-01-01", "A")]);

        let plan = temporal_merge_plan(&req, &catalog(), &source, &target).unwrap();
        assert_eq!(plan.iter().filter(|p| p.operation == PlanAction::Delete).count(), 1);

        let mut inserts: Vec<_> = plan.iter().filter(|p| p.operation == PlanAction::Insert).collect();
        inserts.sort_by(|a, b| match (&a.new_valid_from, &b.new_valid_from) {
            (Some(x), Some(y)) => x.compare(y, Domain::Date),
            _ => std::cmp::Ordering::Equal,
        });
        assert_eq!(inserts.len(), 3);
        assert_eq!(inserts[0].new_valid_from, Some(BoundValue::finite("2024-01-01")));
        assert_eq!(inserts[0].new_valid_until, Some(BoundValue::finite("2024-06-01")));
        assert_eq!(inserts[0].data.as_ref().and_then(|d| d.get("name")), Some(&json!("A")));
        assert_eq!(inserts[1].new_valid_from, Some(BoundValue::finite("2024-06-01")));
        assert_eq!(inserts[1].new_valid_until, Some(BoundValue::finite("2024-09-01")));
        assert_eq!(inserts[1].data.as_ref().and_then(|d| d.get("name")), Some(&json!("B")));
        assert_eq!(inserts[2].new_valid_from, Some(BoundValue::finite("2024-09-01")));
        assert_eq!(inserts[2].new_valid_until, Some(BoundValue::finite("2025-01-01")));
        assert_eq!(inserts[2].data.as_ref().and_then(|d| d.get("name")), Some(&json!("A")));

        let mut sink = InMemoryFeedbackSink::new();
        executor::execute(&req.target_table, &plan, &mut target, Some(&mut sink)).unwrap();
        let rows = sink.rows.borrow();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_row_id, 1);
        assert_eq!(rows[0].status, store::FeedbackStatus::Applied);
    }

    // S3: adjacent coalesce — a single GROW update, no INSERT.
    #[test]
    fn s3_adjacent_coalesce_grows_existing_row() {
        let req = req(MergeMode::MergeEntityUpsert);
        let source = InMemorySource::new().with_rows(
            req.source_table.clone(),
            vec![raw_row(1, 10, "2024-07-01", "2025-01-01", "A")],
        );
        let target = InMemoryTargetStore::new();
        target.seed(req.target_table.clone(), vec![target_row(10, "2024-01-01", "2024-07-01", "A")]);

        let plan = temporal_merge_plan(&req, &catalog(), &source, &target).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].operation, PlanAction::Update);
        assert_eq!(plan[0].update_effect, Some(types::UpdateEffect::Grow));
        assert_eq!(plan[0].new_valid_from, Some(BoundValue::finite("2024-01-01")));
        assert_eq!(plan[0].new_valid_until, Some(BoundValue::finite("2025-01-01")));
    }

    // S4: filtered skip under INSERT_NEW_ENTITIES against an existing entity.
    #[test]
    fn s4_filtered_skip_for_existing_entity() {
        let req = req(MergeMode::InsertNewEntities);
        let source = InMemorySource::new().with_rows(
            req.source_table.clone(),
            vec![raw_row(1, 10, "2024-06-01", "2024-07-01", "B")],
        );
        let target = InMemoryTargetStore::new();
        target.seed(req.target_table.clone(), vec![target_row(10, "2024-01-01", "2025-01-01", "A")]);

        let plan = temporal_merge_plan(&req, &catalog(), &source, &target).unwrap();
        assert!(plan.iter().all(|p| !p.operation.is_dml()));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].operation, PlanAction::SkipFiltered);
    }

    // S5: eclipsed source row.
    #[test]
    fn s5_eclipsed_source_row_is_skipped() {
        let req = req(MergeMode::MergeEntityUpsert);
        let source = InMemorySource::new().with_rows(
            req.source_table.clone(),
            vec![
                raw_row(1, 10, "2024-01-01", "2025-01-01", "A"),
                raw_row(2, 10, "2024-06-01", "2024-07-01", "A"),
            ],
        );
        let target = InMemoryTargetStore::new();

        let plan = temporal_merge_plan(&req, &catalog(), &source, &target).unwrap();
        let inserts: Vec<_> = plan.iter().filter(|p| p.operation == PlanAction::Insert).collect();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].row_ids, vec![1]);
        let eclipsed: Vec<_> = plan.iter().filter(|p| p.operation == PlanAction::SkipEclipsed).collect();
        assert_eq!(eclipsed.len(), 1);
        assert_eq!(eclipsed[0].row_ids, vec![2]);
    }

    // S6: delete for portion splits the original row around the deleted slice.
    #[test]
    fn s6_delete_for_portion_splits_target() {
        let req = req(MergeMode::DeleteForPortionOf);
        let source = InMemorySource::new().with_rows(
            req.source_table.clone(),
            vec![raw_row(1, 10, "2024-06-01", "2024-09-01", "")],
        );
        let target = InMemoryTargetStore::new();
        target.seed(req.target_table.clone(), vec![target_row(10, "2024-01-01", "2025-01-01", "A")]);

        let plan = temporal_merge_plan(&req, &catalog(), &source, &target).unwrap();
        assert_eq!(plan.iter().filter(|p| p.operation == PlanAction::Delete).count(), 1);
        let inserts: Vec<_> = plan.iter().filter(|p| p.operation == PlanAction::Insert).collect();
        assert_eq!(inserts.len(), 2);
    }

    // Idempotence (spec §8.4): applying the same source twice yields
    // SKIP_IDENTICAL the second time for every row applied the first time.
    #[test]
    fn idempotent_reapplication_skips_identical() {
        let req = req(MergeMode::MergeEntityUpsert);
        let source = InMemorySource::new().with_rows(
            req.source_table.clone(),
            vec![raw_row(1, 10, "2024-01-01", "2024-07-01", "A")],
        );
        let mut target = InMemoryTargetStore::new();

        let plan1 = temporal_merge_plan(&req, &catalog(), &source, &target).unwrap();
        executor::execute(&req.target_table, &plan1, &mut target, None).unwrap();

        let plan2 = temporal_merge_plan(&req, &catalog(), &source, &target).unwrap();
        assert!(plan2.iter().all(|p| !p.operation.is_dml()));
        assert_eq!(plan2[0].operation, PlanAction::SkipIdentical);
    }
}
