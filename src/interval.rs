//! Interval Algebra (spec §4.1): Allen's relation between two half-open
//! intervals, plus the coverage aggregate used by the Entity Resolver and
//! DML Planner. Grounded on the reference crate's `types::AllenRelation`,
//! generalized from a `(&str, &str, is_numeric: bool)` ladder to typed
//! `BoundValue`/`Domain` arguments.

use crate::domain::{BoundValue, Domain};
use crate::error::MergeError;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllenRelation {
    Precedes,
    Meets,
    Overlaps,
    Starts,
    During,
    Finishes,
    Equals,
    PrecededBy,
    MetBy,
    OverlappedBy,
    StartedBy,
    Contains,
    FinishedBy,
}

impl AllenRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Precedes => "precedes",
            Self::Meets => "meets",
            Self::Overlaps => "overlaps",
            Self::Starts => "starts",
            Self::During => "during",
            Self::Finishes => "finishes",
            Self::Equals => "equals",
            Self::PrecededBy => "preceded_by",
            Self::MetBy => "met_by",
            Self::OverlappedBy => "overlapped_by",
            Self::StartedBy => "started_by",
            Self::Contains => "contains",
            Self::FinishedBy => "finished_by",
        }
    }
}

/// A half-open interval `[from, until)` over a domain, `from < until`
/// required by spec §3. Carries no payload; purely positional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub from: BoundValue,
    pub until: BoundValue,
}

impl Interval {
    pub fn new(from: BoundValue, until: BoundValue) -> Self {
        Self { from, until }
    }

    pub fn is_empty(&self, domain: Domain) -> bool {
        self.from.compare(&self.until, domain) == Ordering::Equal
    }
}

/// Compute the Allen relation between `x` and `y`, both half-open intervals
/// `[from, until)`. Implements the table in spec §4.1 exactly, including its
/// symmetric cases. Exhaustive over all orderings of non-empty intervals
/// (spec §8 invariant 7): exactly one branch always matches.
pub fn relate(x: &Interval, y: &Interval, domain: Domain) -> AllenRelation {
    let cmp = |a: &BoundValue, b: &BoundValue| a.compare(b, domain);
    let lt = |a: &BoundValue, b: &BoundValue| cmp(a, b) == Ordering::Less;
    let gt = |a: &BoundValue, b: &BoundValue| cmp(a, b) == Ordering::Greater;
    let eq = |a: &BoundValue, b: &BoundValue| cmp(a, b) == Ordering::Equal;

    let (xf, xu, yf, yu) = (&x.from, &x.until, &y.from, &y.until);

    if lt(xu, yf) {
        AllenRelation::Precedes
    } else if eq(xu, yf) {
        AllenRelation::Meets
    } else if lt(xf, yf) && lt(yf, xu) && lt(xu, yu) {
        AllenRelation::Overlaps
    } else if eq(xf, yf) && lt(xu, yu) {
        AllenRelation::Starts
    } else if gt(xf, yf) && lt(xu, yu) {
        AllenRelation::During
    } else if gt(xf, yf) && eq(xu, yu) {
        AllenRelation::Finishes
    } else if eq(xf, yf) && eq(xu, yu) {
        AllenRelation::Equals
    } else if lt(yu, xf) {
        AllenRelation::PrecededBy
    } else if eq(yu, xf) {
        AllenRelation::MetBy
    } else if lt(yf, xf) && lt(xf, yu) && lt(yu, xu) {
        AllenRelation::OverlappedBy
    } else if eq(xf, yf) && gt(xu, yu) {
        AllenRelation::StartedBy
    } else if lt(xf, yf) && gt(xu, yu) {
        AllenRelation::Contains
    } else {
        // eq(xf, yf) was excluded above only when xu < yu; the remaining
        // case with lt(xf, yf) and eq(xu, yu) is `finished_by`. Every other
        // combination of `<`/`=`/`>` over (xf,yf) and (xu,yu) is covered by
        // one of the branches above, so this is the last one.
        debug_assert!(lt(xf, yf) && eq(xu, yu));
        AllenRelation::FinishedBy
    }
}

/// Coverage aggregate (spec §4.1): whether `⋃ intervals ⊇ target`.
///
/// `intervals` must be sorted by `from`; `InputNotSorted` is returned
/// otherwise. A discrete domain treats `(_, v)` followed by `[v, _)` as
/// contiguous (no gap); a continuous domain does not. `target` of `None`
/// (spec's "null target") returns `Ok(None)`; an empty target returns
/// `Ok(Some(true))`.
pub fn covers(
    intervals: &[Interval],
    target: Option<&Interval>,
    domain: Domain,
) -> Result<Option<bool>, MergeError> {
    let Some(target) = target else {
        return Ok(None);
    };
    if target.is_empty(domain) {
        return Ok(Some(true));
    }

    for w in intervals.windows(2) {
        if w[0].from.compare(&w[1].from, domain) == Ordering::Greater {
            return Err(MergeError::InputNotSorted);
        }
    }

    let mut cursor = target.from.clone();
    for iv in intervals {
        if iv.until.compare(&target.from, domain) != Ordering::Greater
            && iv.from.compare(&cursor, domain) != Ordering::Greater
        {
            // Entirely behind the cursor; irrelevant, but still validates sort order above.
            continue;
        }
        if iv.from.compare(&cursor, domain) == Ordering::Greater {
            let contiguous = domain.is_discrete() && is_successor(&cursor, &iv.from, domain);
            if !contiguous {
                return Ok(Some(false));
            }
        }
        if iv.until.compare(&cursor, domain) == Ordering::Greater {
            cursor = iv.until.clone();
        }
        if cursor.compare(&target.until, domain) != Ordering::Less {
            return Ok(Some(true));
        }
    }

    Ok(Some(cursor.compare(&target.until, domain) != Ordering::Less))
}

fn is_successor(a: &BoundValue, b: &BoundValue, domain: Domain) -> bool {
    match a.successor(domain) {
        Some(succ) => succ.compare(b, domain) == Ordering::Equal,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(f: &str, u: &str) -> Interval {
        Interval::new(BoundValue::finite(f), BoundValue::finite(u))
    }

    #[test]
    fn relate_covers_every_named_case() {
        let d = Domain::Date;
        assert_eq!(relate(&iv("2024-01-01", "2024-02-01"), &iv("2024-03-01", "2024-04-01"), d), AllenRelation::Precedes);
        assert_eq!(relate(&iv("2024-01-01", "2024-02-01"), &iv("2024-02-01", "2024-03-01"), d), AllenRelation::Meets);
        assert_eq!(relate(&iv("2024-01-01", "2024-03-01"), &iv("2024-02-01", "2024-04-01"), d), AllenRelation::Overlaps);
        assert_eq!(relate(&iv("2024-01-01", "2024-02-01"), &iv("2024-01-01", "2024-03-01"), d), AllenRelation::Starts);
        assert_eq!(relate(&iv("2024-02-01", "2024-03-01"), &iv("2024-01-01", "2024-04-01"), d), AllenRelation::During);
        assert_eq!(relate(&iv("2024-02-01", "2024-04-01"), &iv("2024-01-01", "2024-04-01"), d), AllenRelation::Finishes);
        assert_eq!(relate(&iv("2024-01-01", "2024-04-01"), &iv("2024-01-01", "2024-04-01"), d), AllenRelation::Equals);
        assert_eq!(relate(&iv("2024-03-01", "2024-04-01"), &iv("2024-01-01", "2024-02-01"), d), AllenRelation::PrecededBy);
        assert_eq!(relate(&iv("2024-02-01", "2024-03-01"), &iv("2024-01-01", "2024-02-01"), d), AllenRelation::MetBy);
        assert_eq!(relate(&iv("2024-02-01", "2024-04-01"), &iv("2024-01-01", "2024-03-01"), d), AllenRelation::OverlappedBy);
        assert_eq!(relate(&iv("2024-01-01", "2024-03-01"), &iv("2024-01-01", "2024-02-01"), d), AllenRelation::StartedBy);
        assert_eq!(relate(&iv("2024-01-01", "2024-04-01"), &iv("2024-02-01", "2024-03-01"), d), AllenRelation::Contains);
        assert_eq!(relate(&iv("2024-01-01", "2024-04-01"), &iv("2024-02-01", "2024-04-01"), d), AllenRelation::FinishedBy);
    }

    #[test]
    fn coverage_rejects_unsorted_input() {
        let intervals = vec![iv("2024-03-01", "2024-04-01"), iv("2024-01-01", "2024-02-01")];
        let target = iv("2024-01-01", "2024-04-01");
        assert!(matches!(
            covers(&intervals, Some(&target), Domain::Date),
            Err(MergeError::InputNotSorted)
        ));
    }

    #[test]
    fn coverage_treats_discrete_adjacency_as_contiguous() {
        let intervals = vec![iv("2024-01-01", "2024-02-01"), iv("2024-02-01", "2024-03-01")];
        let target = iv("2024-01-01", "2024-03-01");
        assert_eq!(covers(&intervals, Some(&target), Domain::Date).unwrap(), Some(true));
    }

    #[test]
    fn coverage_null_target_returns_none() {
        assert_eq!(covers(&[], None, Domain::Date).unwrap(), None);
    }

    #[test]
    fn coverage_empty_target_returns_true() {
        let target = iv("2024-01-01", "2024-01-01");
        assert_eq!(covers(&[], Some(&target), Domain::Date).unwrap(), Some(true));
    }
}
