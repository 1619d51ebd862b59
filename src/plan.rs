//! DML Planner (spec §4.8): turns coalesced segments back together with the
//! entity's original target rows into an ordered sequence of plan
//! operations — the spec's sole row-level contract between planning and
//! execution. Grounded on the reference crate's `sweep::compute_diff`/
//! `classify_operations`/`classify_single_diff`/`compute_update_effect`/
//! `sequence_statements`/`make_feedback_plan_row`.

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};

use crate::coalesce::CoalescedSegment;
use crate::domain::{BoundValue, Domain};
use crate::entity::{EarlyFeedback, EntityGroup, MatchedSourceRow};
use crate::interval::AllenRelation;
use crate::store::TargetRow;
use crate::types::{maps_equal_ignoring_nulls, PlanAction, PlannerContext, UpdateEffect};

/// One row of the FULL OUTER JOIN between coalesced segments and the
/// entity's target rows, keyed on `ancestor_valid_from` (spec §4.8).
#[derive(Debug, Clone)]
struct DiffRow {
    grouping_key: String,
    is_new_entity: bool,
    identity_keys: Map<String, Value>,
    causal_id: Option<i64>,
    row_ids: Vec<i64>,
    final_valid_from: Option<BoundValue>,
    final_valid_until: Option<BoundValue>,
    final_payload: Option<Map<String, Value>>,
    target_valid_from: Option<BoundValue>,
    target_valid_until: Option<BoundValue>,
    target_payload: Option<Map<String, Value>>,
    ephemeral_payload: Option<Map<String, Value>>,
    has_source_coverage: bool,
    s_t_relation: Option<AllenRelation>,
    target_ephemeral: Option<Map<String, Value>>,
    target_pk_payload: Option<Map<String, Value>>,
}

/// One entry of the final plan (spec §3's "Plan operation"), the sole
/// contract between the planner and the executor.
#[derive(Debug, Clone)]
pub struct PlanOperation {
    pub plan_op_seq: i64,
    pub statement_seq: i64,
    pub row_ids: Vec<i64>,
    pub operation: PlanAction,
    pub update_effect: Option<UpdateEffect>,
    pub causal_id: Option<i64>,
    pub is_new_entity: bool,
    pub entity_keys: Option<Value>,
    pub identity_keys: Option<Value>,
    pub lookup_keys: Option<Value>,
    pub s_t_relation: Option<AllenRelation>,
    pub b_a_relation: Option<AllenRelation>,
    pub old_valid_from: Option<BoundValue>,
    pub old_valid_until: Option<BoundValue>,
    pub new_valid_from: Option<BoundValue>,
    pub new_valid_until: Option<BoundValue>,
    pub old_valid_range: Option<String>,
    pub new_valid_range: Option<String>,
    pub data: Option<Value>,
    pub feedback: Option<Value>,
    pub grouping_key: String,
}

/// Join coalesced segments with the entity's target rows on
/// `ancestor_valid_from` vs. `valid_from` (spec §4.8). Unmatched coalesced
/// segments become INSERT candidates; unmatched target rows become DELETE
/// candidates.
///
/// A target row punched into more than one coalesced slice (`DELETE_FOR_PORTION_OF`
/// and the overlap case of `UPDATE_FOR_PORTION_OF`/`PATCH_FOR_PORTION_OF`/
/// `REPLACE_FOR_PORTION_OF`, spec.md's literal S2 and S6 scenarios) is *not*
/// treated as one slice continuing the row and the rest as inserts — every
/// slice becomes an INSERT and the original target row gets its own explicit
/// DELETE, since no single slice is "the same row, just resized" once the
/// row has been split in two or more.
fn compute_diff(coalesced: Vec<CoalescedSegment>, target_rows: &[TargetRow], domain: Domain) -> Vec<DiffRow> {
    let mut diffs = Vec::new();

    let target_by_from: HashMap<String, &TargetRow> = target_rows
        .iter()
        .map(|tr| (format!("{:?}", tr.interval.from), tr))
        .collect();

    let mut match_counts: HashMap<String, usize> = HashMap::new();
    for cs in &coalesced {
        if let Some(af) = &cs.ancestor_valid_from {
            let key = format!("{:?}", af);
            if target_by_from.contains_key(&key) {
                *match_counts.entry(key).or_insert(0) += 1;
            }
        }
    }

    let mut matched_target_froms: BTreeSet<String> = BTreeSet::new();

    for cs in &coalesced {
        let from_key = cs.ancestor_valid_from.as_ref().map(|af| format!("{:?}", af));
        let target_match = from_key.as_ref().and_then(|k| target_by_from.get(k).copied());
        let is_split = from_key.as_ref().is_some_and(|k| match_counts.get(k).copied().unwrap_or(0) > 1);

        if let Some(tr) = target_match {
            matched_target_froms.insert(format!("{:?}", tr.interval.from));
        }

        match target_match.filter(|_| !is_split) {
            Some(tr) => diffs.push(DiffRow {
                grouping_key: cs.grouping_key.clone(),
                is_new_entity: cs.is_new_entity,
                identity_keys: cs.identity_keys.clone(),
                causal_id: cs.causal_id,
                row_ids: cs.row_ids.clone(),
                final_valid_from: Some(cs.valid_from.clone()),
                final_valid_until: Some(cs.valid_until.clone()),
                final_payload: cs.data_payload.clone(),
                target_valid_from: Some(tr.interval.from.clone()),
                target_valid_until: Some(tr.interval.until.clone()),
                target_payload: Some(tr.data_payload.clone()),
                ephemeral_payload: cs.ephemeral_payload.clone(),
                has_source_coverage: cs.has_source_coverage,
                s_t_relation: cs.s_t_relation,
                target_ephemeral: Some(tr.ephemeral_payload.clone()),
                target_pk_payload: Some(tr.pk_payload.clone()),
            }),
            None => diffs.push(DiffRow {
                grouping_key: cs.grouping_key.clone(),
                is_new_entity: cs.is_new_entity,
                identity_keys: cs.identity_keys.clone(),
                causal_id: cs.causal_id,
                row_ids: cs.row_ids.clone(),
                final_valid_from: Some(cs.valid_from.clone()),
                final_valid_until: Some(cs.valid_until.clone()),
                final_payload: cs.data_payload.clone(),
                target_valid_from: None,
                target_valid_until: None,
                target_payload: None,
                ephemeral_payload: cs.ephemeral_payload.clone(),
                has_source_coverage: cs.has_source_coverage,
                s_t_relation: cs.s_t_relation,
                target_ephemeral: None,
                target_pk_payload: None,
            }),
        }
    }

    for tr in target_rows {
        let key = format!("{:?}", tr.interval.from);
        let was_split = match_counts.get(&key).copied().unwrap_or(0) > 1;
        if matched_target_froms.contains(&key) && !was_split {
            continue;
        }
        diffs.push(DiffRow {
            grouping_key: coalesced.first().map(|c| c.grouping_key.clone()).unwrap_or_default(),
            is_new_entity: false,
            identity_keys: tr.identity_keys.clone(),
            causal_id: None,
            row_ids: Vec::new(),
            final_valid_from: None,
            final_valid_until: None,
            final_payload: None,
            target_valid_from: Some(tr.interval.from.clone()),
            target_valid_until: Some(tr.interval.until.clone()),
            target_payload: Some(tr.data_payload.clone()),
            ephemeral_payload: None,
            has_source_coverage: false,
            s_t_relation: None,
            target_ephemeral: Some(tr.ephemeral_payload.clone()),
            target_pk_payload: Some(tr.pk_payload.clone()),
        });
    }

    let _ = domain;
    diffs
}

fn merge_data_ephemeral(
    data: &Option<Map<String, Value>>,
    ephemeral: &Option<Map<String, Value>>,
) -> Option<Map<String, Value>> {
    match (data, ephemeral) {
        (Some(d), Some(e)) => {
            let mut merged = d.clone();
            for (k, v) in e {
                merged.insert(k.clone(), v.clone());
            }
            Some(merged)
        }
        (Some(d), None) => Some(d.clone()),
        (None, Some(e)) => Some(e.clone()),
        (None, None) => None,
    }
}

/// Classify the temporal impact of an UPDATE (spec §3/§4.8): `NONE` if the
/// interval is unchanged, `SHRINK`/`GROW` if only one bound moved inward/
/// outward, `MOVE` otherwise (both bounds moved, or moved in opposite
/// directions).
fn compute_update_effect(old_from: &BoundValue, old_until: &BoundValue, new_from: &BoundValue, new_until: &BoundValue, domain: Domain) -> UpdateEffect {
    use std::cmp::Ordering;
    let cmp_from = new_from.compare(old_from, domain);
    let cmp_until = new_until.compare(old_until, domain);
    if cmp_from == Ordering::Equal && cmp_until == Ordering::Equal {
        UpdateEffect::None
    } else if cmp_from != Ordering::Less && cmp_until != Ordering::Greater {
        UpdateEffect::Shrink
    } else if cmp_from != Ordering::Greater && cmp_until != Ordering::Less {
        UpdateEffect::Grow
    } else {
        UpdateEffect::Move
    }
}

fn classify_single_diff(d: &DiffRow, domain: Domain) -> (PlanAction, Option<UpdateEffect>) {
    match (&d.target_valid_from, &d.final_valid_from) {
        (None, Some(_)) => (PlanAction::Insert, None),
        (Some(_), None) => (PlanAction::Delete, None),
        (Some(t_from), Some(f_from)) => {
            let t_until = d.target_valid_until.as_ref().unwrap();
            let f_until = d.final_valid_until.as_ref().unwrap();

            let payload_identical = {
                let f_merged = merge_data_ephemeral(&d.final_payload, &d.ephemeral_payload);
                let t_merged = merge_data_ephemeral(&d.target_payload, &d.target_ephemeral);
                match (f_merged.as_ref(), t_merged.as_ref()) {
                    (Some(fp), Some(tp)) => maps_equal_ignoring_nulls(fp, tp),
                    (None, None) => true,
                    _ => false,
                }
            };

            if f_from.compare(t_from, domain) == std::cmp::Ordering::Equal
                && f_until.compare(t_until, domain) == std::cmp::Ordering::Equal
                && payload_identical
            {
                (PlanAction::SkipIdentical, None)
            } else {
                // compute_diff only ever pairs a target row 1:1 here — a
                // target split across multiple coalesced slices (spec S2/S6)
                // never reaches this branch, since each of its slices comes
                // through with target_valid_from = None (an Insert) and the
                // original row gets its own explicit Delete diff row.
                let effect = compute_update_effect(t_from, t_until, f_from, f_until, domain);
                (PlanAction::Update, Some(effect))
            }
        }
        (None, None) => (PlanAction::Error, None),
    }
}

fn format_bound(b: &BoundValue) -> String {
    match b {
        BoundValue::NegInfinity => "-infinity".to_string(),
        BoundValue::PosInfinity => "infinity".to_string(),
        BoundValue::Finite(s) => s.clone(),
    }
}

fn format_range(from: &BoundValue, until: &BoundValue) -> String {
    let q = |s: String| if s.contains(' ') { format!("\"{}\"", s) } else { s };
    format!("[{},{})", q(format_bound(from)), q(format_bound(until)))
}

fn build_group_lookup_keys(group: &EntityGroup, all_lookup_cols: &[String]) -> Option<Value> {
    if all_lookup_cols.is_empty() {
        return Some(Value::Object(Map::new()));
    }
    let first_sr = group.source_rows.first();
    let first_tr = group.target_rows.first();
    match first_sr {
        Some(sr) => {
            let mut lk_map = Map::new();
            for col in all_lookup_cols {
                let val = sr
                    .source
                    .identity_keys
                    .get(col)
                    .or_else(|| sr.source.lookup_keys.get(col))
                    .or_else(|| sr.source.data_payload.get(col))
                    .cloned()
                    .unwrap_or(Value::Null);
                let val = if val.is_null() && !group.is_new_entity {
                    first_tr
                        .and_then(|tr| tr.lookup_keys.get(col).or_else(|| tr.identity_keys.get(col)).cloned())
                        .unwrap_or(val)
                } else {
                    val
                };
                lk_map.insert(col.clone(), val);
            }
            Some(Value::Object(lk_map))
        }
        None => first_tr.map(|tr| {
            let mut lk_map = Map::new();
            for col in all_lookup_cols {
                let val = tr
                    .lookup_keys
                    .get(col)
                    .or_else(|| tr.identity_keys.get(col))
                    .cloned()
                    .unwrap_or(Value::Null);
                lk_map.insert(col.clone(), val);
            }
            Value::Object(lk_map)
        }),
    }
}

/// Join, classify, and resolve one entity's diff rows into plan operations
/// (spec §4.8). `plan_op_seq` is left at 0; [`sequence_statements`] assigns
/// the final cross-entity ordering.
pub fn classify_operations(
    coalesced: Vec<CoalescedSegment>,
    group: &EntityGroup,
    ctx: &PlannerContext,
) -> Vec<PlanOperation> {
    let domain = ctx.era.domain;
    let all_lookup_cols = ctx.era.all_lookup_columns();
    let diff_rows = compute_diff(coalesced, &group.target_rows, domain);

    let group_lookup_keys = build_group_lookup_keys(group, &all_lookup_cols);

    let has_active_sources = group
        .source_rows
        .iter()
        .any(|sr| sr.early_feedback.is_none() && !sr.is_eclipsed);

    let mut plan_rows = Vec::new();
    let mut seq = 0i64;

    for d in diff_rows.iter() {
        let (mut operation, update_effect) = classify_single_diff(d, domain);

        if operation == PlanAction::SkipIdentical && !d.has_source_coverage {
            let should_delete = (has_active_sources && ctx.delete_mode.deletes_timeline())
                || (!has_active_sources && ctx.delete_mode.deletes_entities());
            if should_delete {
                operation = PlanAction::Delete;
            } else {
                continue;
            }
        }

        seq += 1;

        let old_from = d.target_valid_from.clone();
        let old_until = d.target_valid_until.clone();

        let old_valid_range = match (&old_from, &old_until) {
            (Some(f), Some(u)) => Some(format_range(f, u)),
            _ => None,
        };
        let new_valid_range = match (&d.final_valid_from, &d.final_valid_until) {
            (Some(f), Some(u)) => Some(format_range(f, u)),
            _ => None,
        };

        let b_a_relation = match (&old_from, &old_until, &d.final_valid_from, &d.final_valid_until) {
            (Some(of), Some(ou), Some(nf), Some(nu)) => Some(crate::interval::relate(
                &crate::interval::Interval::new(of.clone(), ou.clone()),
                &crate::interval::Interval::new(nf.clone(), nu.clone()),
                domain,
            )),
            _ => None,
        };

        let data = d.final_payload.clone().map(|mut p| {
            if let Some(ref eph) = d.ephemeral_payload {
                for (k, v) in eph {
                    p.insert(k.clone(), v.clone());
                }
            }
            if let Some(ref vt_col) = ctx.era.valid_to_col {
                if let Some(vu) = &d.final_valid_until {
                    if let Some(vt) = vu.predecessor(domain) {
                        p.insert(vt_col.clone(), Value::String(format_bound(&vt)));
                    }
                }
            }
            Value::Object(p)
        });

        let entity_keys = {
            let mut ek = d.identity_keys.clone();
            if let Some(Value::Object(obj)) = &group_lookup_keys {
                for (k, v) in obj {
                    ek.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            if let Some(ref pk) = d.target_pk_payload {
                for (k, v) in pk {
                    ek.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            if ek.is_empty() {
                None
            } else {
                Some(Value::Object(ek))
            }
        };
        let identity_keys = if d.identity_keys.is_empty() {
            None
        } else {
            Some(Value::Object(d.identity_keys.clone()))
        };

        if operation == PlanAction::Delete {
            plan_rows.push(PlanOperation {
                plan_op_seq: seq,
                statement_seq: 0,
                row_ids: Vec::new(),
                operation,
                update_effect: None,
                causal_id: None,
                is_new_entity: d.is_new_entity,
                entity_keys,
                identity_keys,
                lookup_keys: group_lookup_keys.clone(),
                s_t_relation: None,
                b_a_relation: None,
                old_valid_from: old_from,
                old_valid_until: old_until,
                new_valid_from: None,
                new_valid_until: None,
                old_valid_range,
                new_valid_range: None,
                data: None,
                feedback: None,
                grouping_key: String::new(),
            });
        } else {
            plan_rows.push(PlanOperation {
                plan_op_seq: seq,
                statement_seq: 0,
                row_ids: d.row_ids.clone(),
                operation,
                update_effect,
                causal_id: d.causal_id,
                is_new_entity: d.is_new_entity,
                entity_keys,
                identity_keys,
                lookup_keys: group_lookup_keys.clone(),
                s_t_relation: d.s_t_relation,
                b_a_relation,
                old_valid_from: old_from,
                old_valid_until: old_until,
                new_valid_from: d.final_valid_from.clone(),
                new_valid_until: d.final_valid_until.clone(),
                old_valid_range,
                new_valid_range,
                data,
                feedback: None,
                grouping_key: d.grouping_key.clone(),
            });
        }
    }

    plan_rows
}

/// Build the feedback-only plan row for a source row that never entered
/// segmentation: unidentifiable rows, mode-filtered rows, and eclipsed rows
/// (spec §4.6's Filters column, §4.4's eclipse rule).
pub fn make_feedback_plan_row(sr: &MatchedSourceRow, fb: &EarlyFeedback, ctx: &PlannerContext) -> PlanOperation {
    let feedback_json = if fb.action == PlanAction::SkipNoTarget || fb.action == PlanAction::SkipFiltered {
        serde_json::json!({
            "info": "Source row was correctly filtered by the mode's logic and did not result in a DML operation."
        })
    } else {
        serde_json::json!({ "error": fb.message.as_deref().unwrap_or("") })
    };

    let emit_temporal = fb.action != PlanAction::SkipNoTarget
        && fb.action != PlanAction::SkipFiltered
        && fb.action != PlanAction::Error;

    let all_lookup_cols = ctx.era.all_lookup_columns();
    let display_grouping_key = if sr.is_new_entity && sr.source.lookup_keys.is_empty() && all_lookup_cols.is_empty() {
        format!("new_entity__{}", sr.source.row_id)
    } else {
        sr.grouping_key.clone()
    };

    let mut ek = sr.source.identity_keys.clone();
    if let Some(ref disc) = sr.discovered_identity {
        for (k, v) in disc {
            if ek.get(k).map_or(true, |sv| sv.is_null()) {
                ek.insert(k.clone(), v.clone());
            }
        }
    }
    for (k, v) in &sr.source.lookup_keys {
        ek.entry(k.clone()).or_insert_with(|| v.clone());
    }

    let mut ik = sr.source.identity_keys.clone();
    if let Some(ref disc) = sr.discovered_identity {
        for (k, v) in disc {
            if ik.get(k).map_or(true, |sv| sv.is_null()) {
                ik.insert(k.clone(), v.clone());
            }
        }
    }

    PlanOperation {
        plan_op_seq: 0,
        statement_seq: 0,
        row_ids: vec![sr.source.row_id],
        operation: fb.action,
        update_effect: None,
        causal_id: Some(sr.source.row_id),
        is_new_entity: sr.is_new_entity,
        entity_keys: Some(Value::Object(ek)),
        identity_keys: Some(Value::Object(ik)),
        lookup_keys: Some(Value::Object(sr.source.lookup_keys.clone())),
        s_t_relation: None,
        b_a_relation: None,
        old_valid_from: None,
        old_valid_until: None,
        new_valid_from: if emit_temporal { Some(sr.source.interval.from.clone()) } else { None },
        new_valid_until: if emit_temporal { Some(sr.source.interval.until.clone()) } else { None },
        old_valid_range: None,
        new_valid_range: if emit_temporal {
            Some(format_range(&sr.source.interval.from, &sr.source.interval.until))
        } else {
            None
        },
        data: None,
        feedback: Some(feedback_json),
        grouping_key: display_grouping_key,
    }
}

/// Assign the final cross-entity ordering (spec §4.8's DML ordering
/// contract): DELETE < UPDATE < INSERT within each `(grouping_key,
/// entity_key)`, MOVE-class updates sorted by `old_valid_from` DESC so no
/// intermediate state ever overlaps another row, and every DML category
/// grouped into its own `statement_seq` so the executor can run all rows of
/// one category before the next.
pub fn sequence_statements(plan_rows: &mut [PlanOperation], ctx: &PlannerContext) {
    let domain = ctx.era.domain;

    plan_rows.sort_by(|a, b| {
        let a_empty = a.grouping_key.is_empty();
        let b_empty = b.grouping_key.is_empty();
        a_empty
            .cmp(&b_empty)
            .then_with(|| a.grouping_key.cmp(&b.grouping_key))
            .then_with(|| {
                let a_ek = a.entity_keys.as_ref().and_then(|v| v.as_object());
                let b_ek = b.entity_keys.as_ref().and_then(|v| v.as_object());
                let a_str = a_ek.map(crate::types::json_map_to_key).unwrap_or_default();
                let b_str = b_ek.map(crate::types::json_map_to_key).unwrap_or_default();
                a_str.cmp(&b_str)
            })
            .then_with(|| a.operation.dml_class().cmp(&b.operation.dml_class()))
            .then_with(|| {
                let eff_ord = |p: &PlanOperation| if p.update_effect.is_none() { 0 } else { 1 };
                eff_ord(a).cmp(&eff_ord(b))
            })
            .then_with(|| {
                let a_is_move = a.update_effect == Some(UpdateEffect::Move);
                let b_is_move = b.update_effect == Some(UpdateEffect::Move);
                let a_from = a.old_valid_from.as_ref().or(a.new_valid_from.as_ref());
                let b_from = b.old_valid_from.as_ref().or(b.new_valid_from.as_ref());
                match (a_from, b_from) {
                    (Some(af), Some(bf)) => {
                        if a_is_move && b_is_move {
                            bf.compare(af, domain)
                        } else {
                            af.compare(bf, domain)
                        }
                    }
                    _ => std::cmp::Ordering::Equal,
                }
            })
            .then_with(|| match (&a.new_valid_from, &b.new_valid_from) {
                (Some(af), Some(bf)) => af.compare(bf, domain),
                _ => std::cmp::Ordering::Equal,
            })
            .then_with(|| {
                let a_rid = a.row_ids.first().copied().unwrap_or(0);
                let b_rid = b.row_ids.first().copied().unwrap_or(0);
                a_rid.cmp(&b_rid)
            })
    });

    for (i, row) in plan_rows.iter_mut().enumerate() {
        row.plan_op_seq = (i + 1) as i64;
    }

    let op_category = |p: &PlanOperation| -> i32 {
        match p.operation {
            PlanAction::Delete => 1,
            PlanAction::Update => match p.update_effect {
                Some(UpdateEffect::None) | Some(UpdateEffect::Shrink) | None => 2,
                Some(UpdateEffect::Move) => 3,
                Some(UpdateEffect::Grow) => 4,
            },
            PlanAction::Insert => 5,
            _ => 0,
        }
    };

    let mut categories: Vec<i32> = plan_rows.iter().filter(|r| r.operation.is_dml()).map(op_category).collect();
    categories.sort_unstable();
    categories.dedup();

    let max_dml_seq = categories.len() as i32;
    let mut move_count = 0i32;

    for row in plan_rows.iter_mut() {
        if !row.operation.is_dml() {
            row.statement_seq = max_dml_seq + 1;
            continue;
        }
        let cat = op_category(row);
        let base_seq = categories.iter().position(|&c| c == cat).unwrap() as i32 + 1;

        if cat == 3 {
            move_count += 1;
            row.statement_seq = if move_count == 1 { base_seq } else { base_seq + move_count - 1 };
        } else if cat > 3 && move_count > 1 {
            row.statement_seq = base_seq + move_count - 1;
        } else {
            row.statement_seq = base_seq;
        }
    }
}
