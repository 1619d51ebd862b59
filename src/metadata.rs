//! Metadata Resolver (spec §4.2): given a target table identity and an era
//! name, produces the era descriptor driving every downstream component.
//! Generalizes the reference crate's `introspect::introspect_era`/
//! `introspect_pk_cols`/`build_planner_context`, which queried
//! `sql_saga.era`/`pg_constraint`/`pg_attribute` directly; here the same
//! shape is produced by a host-supplied [`MetadataCatalog`] instead (spec §1's
//! "engine-specific catalog access" is deliberately out of scope).

use std::collections::HashSet;

use crate::domain::Domain;
use crate::error::{MergeError, MergeResult, TableId};

/// Which of the era's canonical interval columns are present (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalRepresentation {
    /// `valid_from`/`valid_until` only.
    BoundsOnly,
    /// Adds an inclusive `valid_to` mirror.
    BoundsPlusInclusiveEnd,
    /// Adds a native range/multirange column.
    BoundsPlusRange,
    /// Bounds, inclusive mirror, and native range all present.
    AllThree,
}

impl IntervalRepresentation {
    pub fn has_inclusive_end(&self) -> bool {
        matches!(self, Self::BoundsPlusInclusiveEnd | Self::AllThree)
    }

    pub fn has_native_range(&self) -> bool {
        matches!(self, Self::BoundsPlusRange | Self::AllThree)
    }
}

/// The era descriptor (spec §3): everything the planner needs to know about
/// one temporal table's shape, independent of the data flowing through it.
#[derive(Debug, Clone)]
pub struct EraDescriptor {
    pub table: TableId,
    pub era_name: String,
    pub valid_from_col: String,
    pub valid_until_col: String,
    pub valid_to_col: Option<String>,
    pub range_col: Option<String>,
    pub range_constructor: Option<String>,
    pub representation: IntervalRepresentation,
    pub domain: Domain,
    pub identity_columns: Vec<String>,
    /// `L = [L₁,…,Lₚ]`: ordered lookup key sets, tried independently (OR
    /// semantics, spec §4.4 and SPEC_FULL §10.6).
    pub lookup_key_sets: Vec<Vec<String>>,
    pub ephemeral_columns: Vec<String>,
    /// Columns that are `NOT NULL` with a default on the target table; an
    /// explicit source NULL for one of these is stripped rather than applied
    /// in UPSERT/REPLACE-family modes (SPEC_FULL §10.6 `exclude_if_null_columns`).
    pub not_null_defaulted_columns: HashSet<String>,
    pub system_versioned: bool,
}

impl EraDescriptor {
    /// Validates invariants that a catalog implementation could get wrong:
    /// a continuous domain cannot support an inclusive `valid_to` mirror,
    /// since there is no unambiguous successor/predecessor to compute it
    /// from (spec §9's discrete/continuous note).
    pub fn validate(&self) -> MergeResult<()> {
        if self.system_versioned {
            return Err(MergeError::EraIsSystemVersioned {
                table: self.table.clone(),
                era_name: self.era_name.clone(),
            });
        }
        if self.representation.has_inclusive_end() && self.domain.discrete_step().is_none() {
            return Err(MergeError::RangeDomainUnsupported {
                domain: format!(
                    "{:?} (valid_to mirror requires a discrete domain)",
                    self.domain
                ),
            });
        }
        Ok(())
    }

    pub fn all_lookup_columns(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        for set in &self.lookup_key_sets {
            for col in set {
                seen.insert(col.clone());
            }
        }
        seen.into_iter().collect()
    }
}

/// Host integration boundary generalizing `pg_catalog`/SPI introspection
/// (spec §10.5). A real deployment backs this with a database catalog; tests
/// use [`crate::testing::InMemoryCatalog`].
pub trait MetadataCatalog {
    fn resolve_era(&self, table: &TableId, era_name: &str) -> MergeResult<EraDescriptor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(representation: IntervalRepresentation, domain: Domain) -> EraDescriptor {
        EraDescriptor {
            table: TableId::new("public", "employees"),
            era_name: "valid".into(),
            valid_from_col: "valid_from".into(),
            valid_until_col: "valid_until".into(),
            valid_to_col: Some("valid_to".into()),
            range_col: None,
            range_constructor: None,
            representation,
            domain,
            identity_columns: vec!["id".into()],
            lookup_key_sets: vec![],
            ephemeral_columns: vec![],
            not_null_defaulted_columns: HashSet::new(),
            system_versioned: false,
        }
    }

    #[test]
    fn inclusive_end_on_continuous_domain_is_rejected() {
        let era = descriptor(IntervalRepresentation::BoundsPlusInclusiveEnd, Domain::Numeric);
        assert!(matches!(
            era.validate(),
            Err(MergeError::RangeDomainUnsupported { .. })
        ));
    }

    #[test]
    fn inclusive_end_on_discrete_domain_is_accepted() {
        let era = descriptor(IntervalRepresentation::BoundsPlusInclusiveEnd, Domain::Date);
        assert!(era.validate().is_ok());
    }

    #[test]
    fn system_versioned_era_is_rejected() {
        let mut era = descriptor(IntervalRepresentation::BoundsOnly, Domain::Date);
        era.system_versioned = true;
        assert!(matches!(
            era.validate(),
            Err(MergeError::EraIsSystemVersioned { .. })
        ));
    }
}
