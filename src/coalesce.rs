//! Coalescer (spec §4.7): merges adjacent resolved segments that carry the
//! same entity, are temporally contiguous, and hash to the same data
//! payload, so the DML Planner emits the minimal number of operations (spec
//! §8's coalescing-minimality invariant). Grounded on the reference crate's
//! `sweep::coalesce_segments`.

use serde_json::{Map, Value};

use crate::classify::ResolvedSegment;
use crate::domain::BoundValue;
use crate::interval::AllenRelation;
use crate::types::PlannerContext;

/// A run of one or more resolved segments merged into a single candidate
/// target-table row.
#[derive(Debug, Clone)]
pub struct CoalescedSegment {
    pub grouping_key: String,
    pub valid_from: BoundValue,
    pub valid_until: BoundValue,
    pub is_new_entity: bool,
    pub identity_keys: Map<String, Value>,
    pub causal_id: Option<i64>,
    pub row_ids: Vec<i64>,
    pub data_payload: Option<Map<String, Value>>,
    pub ephemeral_payload: Option<Map<String, Value>>,
    /// The ancestor target row's `valid_from`, used by the DML Planner to
    /// rejoin this segment with the target row it derives from.
    pub ancestor_valid_from: Option<BoundValue>,
    pub data_hash: Option<u64>,
    pub has_source_coverage: bool,
    pub has_target_coverage: bool,
    pub s_t_relation: Option<AllenRelation>,
}

/// Coalesce adjacent resolved segments (spec §4.7). Two segments merge when
/// they share a `grouping_key`, the first's `valid_until` equals the
/// second's `valid_from`, and both have the same (non-ephemeral) data hash.
pub fn coalesce_segments(resolved: Vec<ResolvedSegment>, _ctx: &PlannerContext) -> Vec<CoalescedSegment> {
    let mut coalesced: Vec<CoalescedSegment> = Vec::new();
    let mut current: Option<CoalescedSegment> = None;

    for seg in &resolved {
        let can_merge = current.as_ref().is_some_and(|c| {
            c.grouping_key == seg.grouping_key
                && c.valid_until == seg.valid_from
                && c.data_hash.is_some()
                && c.data_hash == seg.data_hash
        });

        if can_merge {
            let c = current.as_mut().unwrap();
            c.valid_until = seg.valid_until.clone();
            c.row_ids.extend(seg.row_ids.iter());
            if seg.ephemeral_payload.is_some() {
                c.ephemeral_payload = seg.ephemeral_payload.clone();
            }
            c.has_source_coverage = c.has_source_coverage || seg.has_source_coverage;
            c.has_target_coverage = c.has_target_coverage || seg.has_target_coverage;
            if c.ancestor_valid_from.is_none() && seg.target_valid_from.is_some() {
                c.ancestor_valid_from = seg.target_valid_from.clone();
            }
            if c.s_t_relation.is_none() && seg.s_t_relation.is_some() {
                c.s_t_relation = seg.s_t_relation;
            }
        } else {
            if let Some(prev) = current.take() {
                coalesced.push(prev);
            }
            current = Some(CoalescedSegment {
                grouping_key: seg.grouping_key.clone(),
                valid_from: seg.valid_from.clone(),
                valid_until: seg.valid_until.clone(),
                is_new_entity: seg.is_new_entity,
                identity_keys: seg.identity_keys.clone(),
                causal_id: seg.causal_id,
                row_ids: seg.row_ids.clone(),
                data_payload: seg.data_payload.clone(),
                ephemeral_payload: seg.ephemeral_payload.clone(),
                ancestor_valid_from: seg.target_valid_from.clone(),
                data_hash: seg.data_hash,
                has_source_coverage: seg.has_source_coverage,
                has_target_coverage: seg.has_target_coverage,
                s_t_relation: seg.s_t_relation,
            });
        }
    }

    if let Some(last) = current {
        coalesced.push(last);
    }

    for seg in &mut coalesced {
        seg.row_ids.sort_unstable();
        seg.row_ids.dedup();
    }

    coalesced
}
