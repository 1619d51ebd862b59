//! Segment Classifier (spec §4.6): resolves each atomic segment's payload
//! under the active merge mode, by finding its covering source row(s) and
//! covering target row and merging them per the mode's New-Entity/Existing/
//! Filters rules. Grounded on the reference crate's `sweep::resolve_payloads`/
//! `resolve_source_payload`.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::domain::BoundValue;
use crate::entity::MatchedSourceRow;
use crate::interval::{relate, AllenRelation};
use crate::segment::AtomicSegment;
use crate::store::TargetRow;
use crate::types::{strip_nulls, MergeMode, PlannerContext};

/// An atomic segment with its payload resolved (spec §4.6).
#[derive(Debug, Clone)]
pub struct ResolvedSegment {
    pub grouping_key: String,
    pub valid_from: BoundValue,
    pub valid_until: BoundValue,
    pub is_new_entity: bool,
    pub identity_keys: Map<String, Value>,
    pub causal_id: Option<i64>,
    pub row_ids: Vec<i64>,
    pub source_valid_from: Option<BoundValue>,
    pub source_valid_until: Option<BoundValue>,
    pub target_valid_from: Option<BoundValue>,
    pub target_valid_until: Option<BoundValue>,
    pub data_payload: Option<Map<String, Value>>,
    pub ephemeral_payload: Option<Map<String, Value>>,
    pub target_data_payload: Option<Map<String, Value>>,
    /// Hash of the null-stripped data payload, used by the coalescer to
    /// detect adjacent segments that are otherwise identical.
    pub data_hash: Option<u64>,
    pub has_source_coverage: bool,
    pub has_target_coverage: bool,
    pub s_t_relation: Option<AllenRelation>,
}

/// Resolve every segment's payload (spec §4.6). `active_sources` is already
/// mode-filtered; `target_rows` is the entity's full target slice.
pub fn resolve_payloads(
    segments: Vec<AtomicSegment>,
    active_sources: &[&MatchedSourceRow],
    target_rows: &[TargetRow],
    ctx: &PlannerContext,
) -> Vec<ResolvedSegment> {
    let domain = ctx.era.domain;
    let mut resolved = Vec::with_capacity(segments.len());

    for seg in segments {
        let mut covering_sources: Vec<&MatchedSourceRow> = active_sources
            .iter()
            .filter(|s| {
                s.source.interval.from.compare(&seg.valid_from, domain) != Ordering::Greater
                    && s.source.interval.until.compare(&seg.valid_until, domain) != Ordering::Less
            })
            .copied()
            .collect();
        covering_sources.sort_by_key(|s| s.source.row_id);

        let covering_target = target_rows.iter().find(|t| {
            t.interval.from.compare(&seg.valid_from, domain) != Ordering::Greater
                && t.interval.until.compare(&seg.valid_until, domain) != Ordering::Less
        });

        let (data_payload, row_ids) = if ctx.mode == MergeMode::DeleteForPortionOf && !covering_sources.is_empty() {
            (None, covering_sources.iter().map(|s| s.source.row_id).collect())
        } else {
            resolve_source_payload(&covering_sources, covering_target, ctx)
        };

        let source_from = covering_sources.first().map(|s| s.source.interval.from.clone());
        let source_until = covering_sources.last().map(|s| s.source.interval.until.clone());
        let target_from = covering_target.map(|t| t.interval.from.clone());
        let target_until = covering_target.map(|t| t.interval.until.clone());

        let s_t_relation = match (&source_from, &source_until, &target_from, &target_until) {
            (Some(sf), Some(su), Some(tf), Some(tu)) => Some(relate(
                &crate::interval::Interval::new(sf.clone(), su.clone()),
                &crate::interval::Interval::new(tf.clone(), tu.clone()),
                domain,
            )),
            _ => None,
        };

        let data_hash = data_payload.as_ref().map(|p| {
            let stripped = strip_nulls(p);
            let serialized =
                serde_json::to_string(&Value::Object(stripped)).unwrap_or_default();
            xxhash_rust::xxh3::xxh3_64(serialized.as_bytes())
        });

        // Target ephemeral is the base; source ephemeral overlays on top,
        // with NULLs stripped per the mode's null-handling rule.
        let ephemeral_payload = if !covering_sources.is_empty() {
            let mut merged_eph = covering_target.map(|t| t.ephemeral_payload.clone()).unwrap_or_default();
            for (k, v) in &covering_sources.last().unwrap().source.ephemeral_payload {
                if v.is_null() {
                    if ctx.mode.is_patch() {
                        continue;
                    } else if ctx.era.not_null_defaulted_columns.contains(k) {
                        continue;
                    }
                }
                merged_eph.insert(k.clone(), v.clone());
            }
            Some(merged_eph)
        } else {
            covering_target.map(|t| t.ephemeral_payload.clone())
        };

        let target_data = covering_target.map(|t| t.data_payload.clone());

        if data_payload.is_none() && covering_target.is_none() {
            continue;
        }
        if ctx.mode.is_for_portion_of() && covering_target.is_none() && !covering_sources.is_empty() {
            continue;
        }
        if data_payload.is_none() && ctx.mode == MergeMode::DeleteForPortionOf && !covering_sources.is_empty() {
            continue;
        }

        // For target-only segments in an entity that still has active
        // sources, propagate the causal source's identity so the plan can
        // still attribute the resulting DELETE/UPDATE to a source row.
        let (row_ids, source_from, source_until, s_t_relation) =
            if covering_sources.is_empty() && !active_sources.is_empty() {
                let causal = active_sources
                    .iter()
                    .find(|s| {
                        s.source.interval.from.compare(&seg.valid_until, domain) == Ordering::Equal
                            || s.source.interval.until.compare(&seg.valid_from, domain) == Ordering::Equal
                    })
                    .or_else(|| active_sources.first());

                if let Some(sr) = causal {
                    let sf = sr.source.interval.from.clone();
                    let su = sr.source.interval.until.clone();
                    let propagated_st = if let (Some(tf), Some(tu)) = (&target_from, &target_until) {
                        if sf.compare(tu, domain) == Ordering::Less && su.compare(tf, domain) == Ordering::Greater {
                            Some(relate(
                                &crate::interval::Interval::new(sf.clone(), su.clone()),
                                &crate::interval::Interval::new(tf.clone(), tu.clone()),
                                domain,
                            ))
                        } else {
                            None
                        }
                    } else {
                        None
                    };
                    (vec![sr.source.row_id], Some(sf), Some(su), propagated_st)
                } else {
                    (row_ids, source_from, source_until, s_t_relation)
                }
            } else {
                (row_ids, source_from, source_until, s_t_relation)
            };

        let has_target = covering_target.is_some();
        let segment_causal_id = if seg.is_new_entity {
            covering_sources
                .last()
                .map(|s| Some(s.source.row_id))
                .unwrap_or(seg.causal_id)
        } else {
            seg.causal_id
        };

        resolved.push(ResolvedSegment {
            grouping_key: seg.grouping_key,
            valid_from: seg.valid_from,
            valid_until: seg.valid_until,
            is_new_entity: seg.is_new_entity,
            identity_keys: seg.identity_keys,
            causal_id: segment_causal_id,
            row_ids,
            source_valid_from: source_from,
            source_valid_until: source_until,
            target_valid_from: target_from,
            target_valid_until: target_until,
            data_payload,
            ephemeral_payload,
            target_data_payload: target_data,
            data_hash,
            has_source_coverage: !covering_sources.is_empty(),
            has_target_coverage: has_target,
            s_t_relation,
        });
    }

    resolved
}

/// Resolve one segment's data payload by merging its covering source rows
/// over its covering target row, per the mode's column-override rule (spec
/// §4.6): `PATCH`-family strips source nulls before merging (never
/// overwrites with null); `UPSERT`/`REPLACE`-family overwrite with source
/// values except for `not_null_defaulted_columns`' explicit nulls.
fn resolve_source_payload(
    covering_sources: &[&MatchedSourceRow],
    covering_target: Option<&TargetRow>,
    ctx: &PlannerContext,
) -> (Option<Map<String, Value>>, Vec<i64>) {
    let row_ids = Vec::new();

    if covering_sources.is_empty() {
        return (covering_target.map(|t| t.data_payload.clone()), row_ids);
    }

    let mut merged = covering_target.map(|t| t.data_payload.clone()).unwrap_or_default();

    for sr in covering_sources {
        if ctx.mode.is_patch() {
            for (k, v) in strip_nulls(&sr.source.data_payload) {
                merged.insert(k, v);
            }
        } else {
            for (k, v) in &sr.source.data_payload {
                if v.is_null() && ctx.era.not_null_defaulted_columns.contains(k) {
                    continue;
                }
                merged.insert(k.clone(), v.clone());
            }
        }
    }

    let mut row_ids = row_ids;
    if ctx.mode.is_last_writer_wins() {
        if let Some(last_sr) = covering_sources.last() {
            row_ids.push(last_sr.source.row_id);
        }
    } else {
        for sr in covering_sources {
            if !row_ids.contains(&sr.source.row_id) {
                row_ids.push(sr.source.row_id);
            }
        }
    }

    (Some(merged), row_ids)
}
