//! Source Ingestor (spec §4.3): reads the source batch into an in-memory
//! representation and resolves each row's interval. Generalizes the
//! reference crate's `reader::read_source_rows_with_sql` (which built the
//! `valid_from`/`valid_until`/`valid_to`/native-range SQL expression) into a
//! storage-agnostic [`SourceReader`] trait plus pure interval-derivation
//! logic.

use std::cmp::Ordering;

use crate::domain::BoundValue;
use crate::error::{MergeError, MergeResult, TableId};
use crate::interval::Interval;
use crate::metadata::EraDescriptor;

/// One source row exactly as read from the host's source table, before
/// interval resolution. At most one of (`valid_until`, `valid_to`, `range`)
/// is expected to be set in well-formed input, but all are carried through
/// so [`resolve_interval`] can detect disagreement (`AmbiguousInterval`).
#[derive(Debug, Clone)]
pub struct RawSourceRow {
    pub row_id: i64,
    pub founding_id: Option<String>,
    pub valid_from: Option<BoundValue>,
    pub valid_until: Option<BoundValue>,
    pub valid_to: Option<BoundValue>,
    pub range: Option<(BoundValue, BoundValue)>,
    pub identity_keys: serde_json::Map<String, serde_json::Value>,
    /// Flat union of every column named by any of the era's lookup key sets.
    pub lookup_keys: serde_json::Map<String, serde_json::Value>,
    pub data_payload: serde_json::Map<String, serde_json::Value>,
    pub ephemeral_payload: serde_json::Map<String, serde_json::Value>,
}

/// A source row with its interval fully resolved (spec §3's "Source row").
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub row_id: i64,
    pub founding_id: Option<String>,
    pub interval: Interval,
    pub identity_keys: serde_json::Map<String, serde_json::Value>,
    pub lookup_keys: serde_json::Map<String, serde_json::Value>,
    pub data_payload: serde_json::Map<String, serde_json::Value>,
    pub ephemeral_payload: serde_json::Map<String, serde_json::Value>,
}

/// Host integration boundary generalizing `reader::read_source_rows_with_sql`
/// (spec §10.5). Returns raw rows; [`resolve_interval`] (called by the
/// planner entry point) turns them into [`SourceRow`]s or fails the whole
/// call per spec §4.3/§7.
pub trait SourceReader {
    fn read_rows(&self, source_table: &TableId, era: &EraDescriptor) -> MergeResult<Vec<RawSourceRow>>;
}

/// Resolve one row's well-defined interval (spec §4.3). Requires either a
/// native range, or `valid_from` plus one of `valid_until`/`valid_to`.
/// Derives `valid_until = successor(valid_to)` when only the inclusive end
/// is given, using the era's discrete step. Fails with `AmbiguousInterval`
/// when multiple representations are given and disagree, `MissingInterval`
/// when none is given, `InvalidInterval` when `from >= until`.
pub fn resolve_interval(raw: &RawSourceRow, era: &EraDescriptor) -> MergeResult<Interval> {
    let domain = era.domain;

    let from_until_given = match (&raw.valid_from, &raw.valid_until) {
        (Some(f), Some(u)) => Some(Interval::new(f.clone(), u.clone())),
        _ => None,
    };

    let from_to_given = match (&raw.valid_from, &raw.valid_to) {
        (Some(f), Some(to)) => {
            let until = to
                .successor(domain)
                .ok_or_else(|| MergeError::MissingInterval { row_id: raw.row_id })?;
            Some(Interval::new(f.clone(), until))
        }
        _ => None,
    };

    let range_given = raw
        .range
        .as_ref()
        .map(|(f, u)| Interval::new(f.clone(), u.clone()));

    let candidates: Vec<Interval> = [from_until_given, from_to_given, range_given]
        .into_iter()
        .flatten()
        .collect();

    let resolved = match candidates.as_slice() {
        [] => {
            // `valid_until` alone, with no `valid_from` and no range, is
            // still an underspecified row.
            return Err(MergeError::MissingInterval { row_id: raw.row_id });
        }
        [only] => only.clone(),
        multiple => {
            let first = &multiple[0];
            let all_agree = multiple.iter().all(|iv| {
                iv.from.compare(&first.from, domain) == Ordering::Equal
                    && iv.until.compare(&first.until, domain) == Ordering::Equal
            });
            if !all_agree {
                return Err(MergeError::AmbiguousInterval { row_id: raw.row_id });
            }
            first.clone()
        }
    };

    if resolved.from.compare(&resolved.until, domain) != Ordering::Less {
        return Err(MergeError::InvalidInterval {
            row_id: raw.row_id,
            from: format!("{:?}", resolved.from),
            until: format!("{:?}", resolved.until),
        });
    }

    Ok(resolved)
}

/// Ingest a batch of raw source rows into fully resolved [`SourceRow`]s,
/// failing the whole call on the first row with an ill-defined interval
/// (spec §7: "source-row error, whole call fatal").
pub fn ingest(raw_rows: Vec<RawSourceRow>, era: &EraDescriptor) -> MergeResult<Vec<SourceRow>> {
    raw_rows
        .into_iter()
        .map(|raw| {
            let interval = resolve_interval(&raw, era)?;
            Ok(SourceRow {
                row_id: raw.row_id,
                founding_id: raw.founding_id,
                interval,
                identity_keys: raw.identity_keys,
                lookup_keys: raw.lookup_keys,
                data_payload: raw.data_payload,
                ephemeral_payload: raw.ephemeral_payload,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::metadata::IntervalRepresentation;
    use std::collections::HashSet;

    fn era() -> EraDescriptor {
        EraDescriptor {
            table: TableId::new("public", "employees"),
            era_name: "valid".into(),
            valid_from_col: "valid_from".into(),
            valid_until_col: "valid_until".into(),
            valid_to_col: Some("valid_to".into()),
            range_col: None,
            range_constructor: None,
            representation: IntervalRepresentation::BoundsPlusInclusiveEnd,
            domain: Domain::Date,
            identity_columns: vec!["id".into()],
            lookup_key_sets: vec![],
            ephemeral_columns: vec![],
            not_null_defaulted_columns: HashSet::new(),
            system_versioned: false,
        }
    }

    fn raw(row_id: i64) -> RawSourceRow {
        RawSourceRow {
            row_id,
            founding_id: None,
            valid_from: None,
            valid_until: None,
            valid_to: None,
            range: None,
            identity_keys: Default::default(),
            lookup_keys: Default::default(),
            data_payload: Default::default(),
            ephemeral_payload: Default::default(),
        }
    }

    #[test]
    fn valid_to_derives_valid_until_via_successor() {
        let mut r = raw(1);
        r.valid_from = Some(BoundValue::finite("2024-01-01"));
        r.valid_to = Some(BoundValue::finite("2024-06-30"));
        let interval = resolve_interval(&r, &era()).unwrap();
        assert_eq!(interval.until, BoundValue::finite("2024-07-01"));
    }

    #[test]
    fn missing_both_ends_is_an_error() {
        let r = raw(1);
        assert!(matches!(
            resolve_interval(&r, &era()),
            Err(MergeError::MissingInterval { row_id: 1 })
        ));
    }

    #[test]
    fn conflicting_valid_until_and_valid_to_is_ambiguous() {
        let mut r = raw(1);
        r.valid_from = Some(BoundValue::finite("2024-01-01"));
        r.valid_until = Some(BoundValue::finite("2024-07-01"));
        r.valid_to = Some(BoundValue::finite("2024-12-30")); // disagrees
        assert!(matches!(
            resolve_interval(&r, &era()),
            Err(MergeError::AmbiguousInterval { row_id: 1 })
        ));
    }

    #[test]
    fn agreeing_valid_until_and_valid_to_is_fine() {
        let mut r = raw(1);
        r.valid_from = Some(BoundValue::finite("2024-01-01"));
        r.valid_until = Some(BoundValue::finite("2024-07-01"));
        r.valid_to = Some(BoundValue::finite("2024-06-30"));
        let interval = resolve_interval(&r, &era()).unwrap();
        assert_eq!(interval.until, BoundValue::finite("2024-07-01"));
    }

    #[test]
    fn inverted_interval_is_invalid() {
        let mut r = raw(1);
        r.valid_from = Some(BoundValue::finite("2024-07-01"));
        r.valid_until = Some(BoundValue::finite("2024-01-01"));
        assert!(matches!(
            resolve_interval(&r, &era()),
            Err(MergeError::InvalidInterval { row_id: 1, .. })
        ));
    }
}
