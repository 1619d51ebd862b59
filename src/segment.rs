//! Timeline Segmenter (spec §4.5): sweeps the sorted, distinct interval
//! endpoints of an entity's source and target rows into atomic segments —
//! the finest-grained pieces the classifier can resolve a single payload
//! for. Grounded on the reference crate's `sweep::build_atomic_segments`,
//! generalized from raw string boundaries to typed `BoundValue`s.

use serde_json::{Map, Value};

use crate::entity::{EntityGroup, MatchedSourceRow};
use crate::types::PlannerContext;
use crate::domain::BoundValue;

/// One atomic segment of an entity's timeline: the widest interval over
/// which the set of covering source/target rows never changes.
#[derive(Debug, Clone)]
pub struct AtomicSegment {
    pub grouping_key: String,
    pub valid_from: BoundValue,
    pub valid_until: BoundValue,
    pub is_new_entity: bool,
    pub identity_keys: Map<String, Value>,
    /// The entity's founding row_id for existing entities (the minimum
    /// covering source `row_id`, used to order plan rows deterministically);
    /// for new entities, the first active source's `row_id`.
    pub causal_id: Option<i64>,
}

/// Build the atomic segments for one entity group from its active source
/// rows and its target rows (spec §4.5). Boundaries are the sorted, deduped
/// union of every row's `from`/`until`; a segment spans each pair of
/// adjacent boundaries with `from < until`.
pub fn build_atomic_segments(
    group: &EntityGroup,
    active_sources: &[&MatchedSourceRow],
    ctx: &PlannerContext,
) -> Vec<AtomicSegment> {
    let domain = ctx.era.domain;

    let mut boundaries: Vec<BoundValue> = Vec::new();
    for sr in active_sources {
        boundaries.push(sr.source.interval.from.clone());
        boundaries.push(sr.source.interval.until.clone());
    }
    for tr in &group.target_rows {
        boundaries.push(tr.interval.from.clone());
        boundaries.push(tr.interval.until.clone());
    }
    boundaries.sort_by(|a, b| a.compare(b, domain));
    boundaries.dedup();

    let mut segments = Vec::new();
    for window in boundaries.windows(2) {
        let from = &window[0];
        let until = &window[1];
        if from.compare(until, domain) != std::cmp::Ordering::Less {
            continue;
        }
        segments.push(AtomicSegment {
            grouping_key: group.grouping_key.clone(),
            valid_from: from.clone(),
            valid_until: until.clone(),
            is_new_entity: group.is_new_entity,
            identity_keys: group.identity_keys.clone(),
            causal_id: if group.is_new_entity {
                active_sources.first().map(|s| s.source.row_id)
            } else {
                active_sources.iter().map(|s| s.source.row_id).min()
            },
        });
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::error::TableId;
    use crate::metadata::{EraDescriptor, IntervalRepresentation};
    use crate::source::SourceRow;
    use crate::types::{DeleteMode, IdentityStrategy, MergeMode};
    use std::collections::HashSet;

    fn era() -> EraDescriptor {
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

    fn ctx() -> PlannerContext {
        PlannerContext {
            target_table: TableId::new("public", "employees"),
            source_table: TableId::new("public", "employees_src"),
            mode: MergeMode::MergeEntityUpsert,
            delete_mode: DeleteMode::None,
            era: era(),
            row_id_column: "row_id".into(),
            founding_id_column: None,
            update_source_with_feedback: false,
            log_trace: false,
            strategy: IdentityStrategy::IdentityKeyOnly,
        }
    }

    fn source_row(row_id: i64, from: &str, until: &str) -> MatchedSourceRow {
        MatchedSourceRow {
            source: SourceRow {
                row_id,
                founding_id: None,
                interval: crate::interval::Interval::new(BoundValue::finite(from), BoundValue::finite(until)),
                identity_keys: Map::new(),
                lookup_keys: Map::new(),
                data_payload: Map::new(),
                ephemeral_payload: Map::new(),
            },
            is_new_entity: false,
            grouping_key: "existing_entity__1".into(),
            discovered_identity: None,
            canonical_nk_json: None,
            early_feedback: None,
            is_eclipsed: false,
        }
    }

    #[test]
    fn two_overlapping_sources_produce_three_segments() {
        let group = EntityGroup {
            grouping_key: "existing_entity__1".into(),
            is_new_entity: false,
            identity_keys: Map::new(),
            source_rows: Vec::new(),
            target_rows: Vec::new(),
        };
        let a = source_row(1, "2024-01-01", "2024-06-01");
        let b = source_row(2, "2024-03-01", "2024-09-01");
        let refs = vec![&a, &b];
        let segments = build_atomic_segments(&group, &refs, &ctx());
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].valid_from, BoundValue::finite("2024-01-01"));
        assert_eq!(segments[2].valid_until, BoundValue::finite("2024-09-01"));
    }
}
