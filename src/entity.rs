//! Entity Resolver (spec §4.4): correlates source rows to target entities,
//! resolves canonical natural keys for fragmented new-entity batches, detects
//! eclipsed source rows, and groups everything by entity for the sweep.
//! Generalizes the reference crate's `sweep::correlate_entities`,
//! `canonicalize_new_entity_nks`, `detect_eclipsed`, `group_by_entity`.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use crate::domain::{BoundValue, Domain};
use crate::error::{MergeError, MergeResult};
use crate::interval::Interval;
use crate::source::SourceRow;
use crate::store::TargetRow;
use crate::types::{
    build_key_for_cols, json_map_to_key, json_value_to_str, strip_nulls, IdentityStrategy,
    PlanAction, PlannerContext,
};

#[derive(Debug, Clone)]
pub struct EarlyFeedback {
    pub action: PlanAction,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MatchedSourceRow {
    pub source: SourceRow,
    pub is_new_entity: bool,
    pub grouping_key: String,
    pub discovered_identity: Option<Map<String, Value>>,
    pub canonical_nk_json: Option<Map<String, Value>>,
    pub early_feedback: Option<EarlyFeedback>,
    pub is_eclipsed: bool,
}

#[derive(Debug)]
pub struct EntityGroup {
    pub grouping_key: String,
    pub is_new_entity: bool,
    pub identity_keys: Map<String, Value>,
    pub source_rows: Vec<MatchedSourceRow>,
    pub target_rows: Vec<TargetRow>,
}

fn is_identifiable(identity_keys: &Map<String, Value>, identity_columns: &[String]) -> bool {
    !identity_columns.is_empty()
        && identity_columns
            .iter()
            .all(|c| identity_keys.get(c).map_or(false, |v| !v.is_null()))
}

fn lookup_cols_all_null(lookup_keys: &Map<String, Value>, all_lookup_cols: &[String]) -> bool {
    all_lookup_cols.is_empty()
        || all_lookup_cols
            .iter()
            .all(|c| lookup_keys.get(c).map_or(true, |v| v.is_null()))
}

/// Phase 1 of the Entity Resolver (spec §4.4): match each source row against
/// the existing target population, then assign a synthetic `grouping_key`.
/// Fails the whole call with `ConflictingIdentityResolution` when a row's
/// lookup keys match more than one distinct existing entity (spec §7: fatal,
/// not a per-row skip) and with `ConflictingFoundingLookup` when two rows
/// sharing a `founding_id` resolve to different entities.
pub fn correlate_entities(
    source_rows: &[SourceRow],
    target_rows: &[TargetRow],
    ctx: &PlannerContext,
) -> MergeResult<Vec<MatchedSourceRow>> {
    let era = &ctx.era;
    let all_lookup_cols = era.all_lookup_columns();

    let mut target_indexes_per_key_set: Vec<HashMap<String, Vec<&TargetRow>>> =
        Vec::with_capacity(era.lookup_key_sets.len());
    for key_set in &era.lookup_key_sets {
        let mut index: HashMap<String, Vec<&TargetRow>> = HashMap::new();
        for tr in target_rows {
            let key = build_key_for_cols(&tr.lookup_keys, key_set);
            if !key.is_empty() {
                index.entry(key).or_default().push(tr);
            }
        }
        target_indexes_per_key_set.push(index);
    }

    let mut target_by_id: HashMap<String, &TargetRow> = HashMap::new();
    for tr in target_rows {
        let id_key = json_map_to_key(&tr.identity_keys);
        if !id_key.is_empty() {
            target_by_id.entry(id_key).or_insert(tr);
        }
    }

    let mut matched = Vec::with_capacity(source_rows.len());

    for sr in source_rows {
        let mut is_new = true;
        let mut discovered_identity = None;
        let mut canonical_nk = None;
        let mut early_feedback = None;

        if !sr.identity_keys.is_empty() {
            let id_key = json_map_to_key(&sr.identity_keys);
            if target_by_id.contains_key(&id_key) {
                is_new = false;
                discovered_identity = Some(sr.identity_keys.clone());
            }
        }

        let lookup_all_null = lookup_cols_all_null(&sr.lookup_keys, &all_lookup_cols);
        if is_new && !sr.lookup_keys.is_empty() && !lookup_all_null {
            let mut matched_entities: std::collections::BTreeSet<String> =
                std::collections::BTreeSet::new();
            let mut matched_id_maps: Vec<Map<String, Value>> = Vec::new();
            let mut first_discovered = None;

            for (ks_idx, key_set) in era.lookup_key_sets.iter().enumerate() {
                let nk_key = build_key_for_cols(&sr.lookup_keys, key_set);
                if nk_key.is_empty() {
                    continue;
                }
                if let Some(targets) = target_indexes_per_key_set[ks_idx].get(&nk_key) {
                    for tr in targets {
                        let ek = json_map_to_key(&tr.identity_keys);
                        if matched_entities.insert(ek) {
                            matched_id_maps.push(tr.identity_keys.clone());
                        }
                    }
                    if first_discovered.is_none() {
                        if let Some(first) = targets.first() {
                            first_discovered = Some(first.identity_keys.clone());
                        }
                    }
                }
            }

            if matched_entities.len() > 1 {
                return Err(MergeError::ConflictingIdentityResolution {
                    row_id: sr.row_id,
                    entities: matched_id_maps.into_iter().map(Value::Object).collect(),
                });
            } else if matched_entities.len() == 1 {
                is_new = false;
                discovered_identity = first_discovered;
                canonical_nk = Some(strip_nulls(&sr.lookup_keys));
            }
        }

        if is_new
            && !is_identifiable(&sr.identity_keys, &era.identity_columns)
            && lookup_all_null
            && ctx.founding_id_column.is_none()
            && ctx.strategy != IdentityStrategy::IdentityKeyOnly
        {
            let id_cols_str = format!("{{{}}}", era.identity_columns.join(", "));
            let key_sets_str = format!(
                "[{}]",
                era.lookup_key_sets
                    .iter()
                    .map(|ks| format!("[{}]", ks.join(", ")))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            early_feedback = Some(EarlyFeedback {
                action: PlanAction::Error,
                message: Some(format!(
                    "Source row is unidentifiable. It has NULL for all stable identity columns {} and all natural keys {}",
                    id_cols_str, key_sets_str
                )),
            });
        }

        let grouping_key =
            build_grouping_key(sr, is_new, &discovered_identity, &canonical_nk, ctx, &all_lookup_cols);

        matched.push(MatchedSourceRow {
            source: sr.clone(),
            is_new_entity: is_new,
            grouping_key,
            discovered_identity,
            canonical_nk_json: canonical_nk,
            early_feedback,
            is_eclipsed: false,
        });
    }

    check_founding_id_conflicts(&matched)?;

    Ok(matched)
}

/// Spec §4.4 rule 2: source rows sharing a `founding_id` must resolve to the
/// same `grouping_key`.
fn check_founding_id_conflicts(matched: &[MatchedSourceRow]) -> MergeResult<()> {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for m in matched {
        let Some(fid) = m.source.founding_id.as_deref() else {
            continue;
        };
        match seen.get(fid) {
            Some(existing) if *existing != m.grouping_key.as_str() => {
                return Err(MergeError::ConflictingFoundingLookup {
                    founding_id: fid.to_string(),
                });
            }
            _ => {
                seen.insert(fid, &m.grouping_key);
            }
        }
    }
    Ok(())
}

fn build_grouping_key(
    sr: &SourceRow,
    is_new: bool,
    discovered_identity: &Option<Map<String, Value>>,
    canonical_nk: &Option<Map<String, Value>>,
    ctx: &PlannerContext,
    all_lookup_cols: &[String],
) -> String {
    let era = &ctx.era;
    if !is_new {
        let id_map = discovered_identity.as_ref().unwrap_or(&sr.identity_keys);
        let key_parts: Vec<String> = era
            .identity_columns
            .iter()
            .map(|c| {
                id_map
                    .get(c)
                    .map(json_value_to_str)
                    .unwrap_or_else(|| "_NULL_".to_string())
            })
            .collect();
        format!("existing_entity__{}", key_parts.join("__"))
    } else if ctx.is_founding_mode() {
        format!("new_entity__{}", sr.row_id)
    } else {
        let nk = canonical_nk
            .as_ref()
            .or(Some(&sr.lookup_keys))
            .filter(|m| !m.is_empty());
        match nk {
            Some(nk_map) => {
                let key_parts: Vec<String> = all_lookup_cols
                    .iter()
                    .map(|c| {
                        nk_map
                            .get(c)
                            .map(json_value_to_str)
                            .unwrap_or_else(|| "_NULL_".to_string())
                    })
                    .collect();
                format!("new_entity__{}", key_parts.join("__"))
            }
            None => {
                let identity_all_null = era
                    .identity_columns
                    .iter()
                    .all(|c| sr.identity_keys.get(c).map_or(true, |v| v.is_null()));
                if identity_all_null {
                    format!("new_entity__{}", sr.row_id)
                } else {
                    let key_parts: Vec<String> = era
                        .identity_columns
                        .iter()
                        .map(|c| {
                            sr.identity_keys
                                .get(c)
                                .map(json_value_to_str)
                                .unwrap_or_else(|| "_NULL_".to_string())
                        })
                        .collect();
                    format!("new_entity__{}", key_parts.join("__"))
                }
            }
        }
    }
}

/// Canonical natural-key resolution for fragmented new entities (SPEC_FULL
/// §10.6). Union-find over new-entity source rows that share any lookup-key
/// value, producing the most-specific (union of all non-null) natural key
/// per connected component, and rebuilding the affected rows' grouping keys.
pub fn canonicalize_new_entities(
    mut matched: Vec<MatchedSourceRow>,
    ctx: &PlannerContext,
) -> Vec<MatchedSourceRow> {
    let era = &ctx.era;
    let all_lookup_cols = era.all_lookup_columns();
    if all_lookup_cols.is_empty() || era.lookup_key_sets.is_empty() {
        return matched;
    }

    let new_indices: Vec<usize> = matched
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_new_entity && m.early_feedback.is_none())
        .map(|(i, _)| i)
        .collect();
    if new_indices.is_empty() {
        return matched;
    }

    let nk_maps: Vec<Map<String, Value>> = new_indices
        .iter()
        .map(|&i| strip_nulls(&matched[i].source.lookup_keys))
        .collect();

    let n = new_indices.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], i: usize) -> usize {
        if parent[i] != i {
            parent[i] = find(parent, parent[i]);
        }
        parent[i]
    }
    fn union(parent: &mut [usize], a: usize, b: usize) {
        let ra = find(parent, a);
        let rb = find(parent, b);
        if ra != rb {
            parent[rb] = ra;
        }
    }

    for key_set in &era.lookup_key_sets {
        let mut val_to_idx: HashMap<String, Vec<usize>> = HashMap::new();
        for (local_idx, nk_map) in nk_maps.iter().enumerate() {
            let key = build_key_for_cols(nk_map, key_set);
            if !key.is_empty() {
                val_to_idx.entry(key).or_default().push(local_idx);
            }
        }
        for indices in val_to_idx.values() {
            for i in 1..indices.len() {
                union(&mut parent, indices[0], indices[i]);
            }
        }
    }

    let mut component_canonical: HashMap<usize, Map<String, Value>> = HashMap::new();
    for local_idx in 0..n {
        let root = find(&mut parent, local_idx);
        let entry = component_canonical.entry(root).or_default();
        for (k, v) in &nk_maps[local_idx] {
            entry.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    for (local_idx, &global_idx) in new_indices.iter().enumerate() {
        let root = find(&mut parent, local_idx);
        let canonical = &component_canonical[&root];
        if *canonical != nk_maps[local_idx] {
            matched[global_idx].canonical_nk_json = Some(canonical.clone());
            matched[global_idx].grouping_key = build_grouping_key(
                &matched[global_idx].source,
                true,
                &matched[global_idx].discovered_identity,
                &matched[global_idx].canonical_nk_json,
                ctx,
                &all_lookup_cols,
            );
        }
    }

    matched
}

/// Phase 2 (spec §4.8's `SKIP_ECLIPSED`): a source row is eclipsed when its
/// entire interval is already covered by the union of the entity's other
/// source rows that sort ahead of it (lower `row_id`, i.e. earlier in the
/// batch). Rows are partitioned by their non-null lookup-column values,
/// falling back to the row's resolved `grouping_key` (the entity it already
/// correlated to, via identity columns or founding id) when no lookup
/// columns apply, so unrelated entities never eclipse each other but rows of
/// the same identity-keyed entity do share a partition.
pub fn detect_eclipsed(mut matched: Vec<MatchedSourceRow>, ctx: &PlannerContext) -> Vec<MatchedSourceRow> {
    let domain = ctx.era.domain;
    let all_lookup_cols = ctx.era.all_lookup_columns();

    let mut by_group: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, m) in matched.iter().enumerate() {
        let partition_key = if all_lookup_cols.is_empty() {
            m.grouping_key.clone()
        } else {
            let mut parts: Vec<(&str, String)> = Vec::new();
            for col in &all_lookup_cols {
                let val = m
                    .source
                    .lookup_keys
                    .get(col)
                    .or_else(|| m.source.identity_keys.get(col));
                if let Some(v) = val {
                    if !v.is_null() {
                        parts.push((col.as_str(), json_value_to_str(v)));
                    }
                }
            }
            if parts.is_empty() {
                m.grouping_key.clone()
            } else {
                parts.sort_by_key(|(k, _)| *k);
                parts
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join("__")
            }
        };
        by_group.entry(partition_key).or_default().push(i);
    }

    for indices in by_group.values() {
        if indices.len() <= 1 {
            continue;
        }
        let mut sorted = indices.clone();
        sorted.sort_by(|&a, &b| matched[a].source.row_id.cmp(&matched[b].source.row_id));

        let mut multirange: Vec<Interval> = Vec::new();
        for &idx in &sorted {
            if matched[idx].early_feedback.is_some() {
                continue;
            }
            if multirange_contains(&multirange, &matched[idx].source.interval, domain) {
                matched[idx].is_eclipsed = true;
            }
            multirange_add(&mut multirange, matched[idx].source.interval.clone(), domain);
        }
    }

    matched
}

fn multirange_add(mr: &mut Vec<Interval>, iv: Interval, domain: Domain) {
    mr.push(iv);
    mr.sort_by(|a, b| a.from.compare(&b.from, domain));
    let mut merged: Vec<Interval> = Vec::new();
    for interval in mr.iter() {
        if let Some(last) = merged.last_mut() {
            let last: &mut Interval = last;
            if interval.from.compare(&last.until, domain) != std::cmp::Ordering::Greater {
                if interval.until.compare(&last.until, domain) == std::cmp::Ordering::Greater {
                    last.until = interval.until.clone();
                }
                continue;
            }
        }
        merged.push(interval.clone());
    }
    *mr = merged;
}

fn multirange_contains(mr: &[Interval], target: &Interval, domain: Domain) -> bool {
    mr.iter().any(|iv| {
        iv.from.compare(&target.from, domain) != std::cmp::Ordering::Greater
            && iv.until.compare(&target.until, domain) != std::cmp::Ordering::Less
    })
}

/// Phase 3 (spec §4.4): group matched source rows and their overlapping
/// target rows by entity. When `delete_mode` deletes missing entities,
/// target-only groups (entities with no corresponding source row at all)
/// are still created so the DML Planner can emit their DELETEs.
pub fn group_by_entity(
    matched_sources: Vec<MatchedSourceRow>,
    target_rows: Vec<TargetRow>,
    ctx: &PlannerContext,
) -> BTreeMap<String, EntityGroup> {
    let mut groups: BTreeMap<String, EntityGroup> = BTreeMap::new();

    for ms in matched_sources {
        let group = groups.entry(ms.grouping_key.clone()).or_insert_with(|| EntityGroup {
            grouping_key: ms.grouping_key.clone(),
            is_new_entity: ms.is_new_entity,
            identity_keys: ms
                .discovered_identity
                .clone()
                .unwrap_or_else(|| ms.source.identity_keys.clone()),
            source_rows: Vec::new(),
            target_rows: Vec::new(),
        });
        group.source_rows.push(ms);
    }

    for tr in target_rows {
        let id_key_parts: Vec<String> = ctx
            .era
            .identity_columns
            .iter()
            .map(|c| {
                tr.identity_keys
                    .get(c)
                    .map(json_value_to_str)
                    .unwrap_or_else(|| "_NULL_".to_string())
            })
            .collect();
        let grouping_key = format!("existing_entity__{}", id_key_parts.join("__"));

        if let Some(group) = groups.get_mut(&grouping_key) {
            group.target_rows.push(tr);
        } else if ctx.delete_mode.deletes_entities() {
            groups.insert(
                grouping_key.clone(),
                EntityGroup {
                    grouping_key,
                    is_new_entity: false,
                    identity_keys: tr.identity_keys.clone(),
                    source_rows: Vec::new(),
                    target_rows: vec![tr],
                },
            );
        }
    }

    groups
}

/// Mode-specific source-row prefilter (spec §4.6's "Filters" column):
/// `INSERT_NEW_ENTITIES` keeps only new entities, `*_FOR_PORTION_OF` modes
/// keep only pre-existing ones.
pub fn filter_by_mode<'a>(
    active_sources: &[&'a MatchedSourceRow],
    ctx: &PlannerContext,
) -> Vec<&'a MatchedSourceRow> {
    if ctx.mode.requires_new_entity() {
        active_sources.iter().filter(|s| s.is_new_entity).copied().collect()
    } else if ctx.mode.requires_existing_entity() {
        active_sources.iter().filter(|s| !s.is_new_entity).copied().collect()
    } else {
        active_sources.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multirange_merges_overlapping_and_adjacent_intervals() {
        let mut mr = Vec::new();
        multirange_add(&mut mr, Interval::new(BoundValue::finite("2024-01-01"), BoundValue::finite("2024-06-01")), Domain::Date);
        multirange_add(&mut mr, Interval::new(BoundValue::finite("2024-06-01"), BoundValue::finite("2024-12-01")), Domain::Date);
        assert_eq!(mr.len(), 1);
        assert_eq!(mr[0].until, BoundValue::finite("2024-12-01"));
    }

    #[test]
    fn multirange_contains_requires_full_coverage() {
        let mr = vec![Interval::new(BoundValue::finite("2024-01-01"), BoundValue::finite("2025-01-01"))];
        let covered = Interval::new(BoundValue::finite("2024-06-01"), BoundValue::finite("2024-07-01"));
        let not_covered = Interval::new(BoundValue::finite("2024-06-01"), BoundValue::finite("2025-06-01"));
        assert!(multirange_contains(&mr, &covered, Domain::Date));
        assert!(!multirange_contains(&mr, &not_covered, Domain::Date));
    }
}
