//! Shared data model (spec §3) not owned by a more specific module: the
//! eight merge modes, four delete modes, plan-op vocabulary, and the
//! planner context threaded through every phase. Trimmed from the reference
//! crate's `types.rs` of everything PostgreSQL-specific (`ColMapping`,
//! `FilterParam`, `CachedState`'s SQL-template fields — storage concerns now
//! live behind `store.rs`'s traits).

use crate::error::TableId;
use crate::metadata::EraDescriptor;

/// The eight merge modes (spec §4.6), mirroring the reference crate's
/// `MergeMode` one-for-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeMode {
    MergeEntityUpsert,
    UpdateForPortionOf,
    MergeEntityPatch,
    PatchForPortionOf,
    MergeEntityReplace,
    ReplaceForPortionOf,
    InsertNewEntities,
    DeleteForPortionOf,
}

impl MergeMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "MERGE_ENTITY_UPSERT" => Some(Self::MergeEntityUpsert),
            "UPDATE_FOR_PORTION_OF" => Some(Self::UpdateForPortionOf),
            "MERGE_ENTITY_PATCH" => Some(Self::MergeEntityPatch),
            "PATCH_FOR_PORTION_OF" => Some(Self::PatchForPortionOf),
            "MERGE_ENTITY_REPLACE" => Some(Self::MergeEntityReplace),
            "REPLACE_FOR_PORTION_OF" => Some(Self::ReplaceForPortionOf),
            "INSERT_NEW_ENTITIES" => Some(Self::InsertNewEntities),
            "DELETE_FOR_PORTION_OF" => Some(Self::DeleteForPortionOf),
            _ => None,
        }
    }

    pub fn is_patch(&self) -> bool {
        matches!(self, Self::MergeEntityPatch | Self::PatchForPortionOf)
    }

    pub fn is_replace(&self) -> bool {
        matches!(self, Self::MergeEntityReplace | Self::ReplaceForPortionOf)
    }

    /// REPLACE/founding/delete modes use "last-writer-wins": only the
    /// highest-`row_id` source row contributes to a segment. PATCH/UPSERT
    /// accumulate every covering row (spec §4.6's `reduce`/`reduce_ignoring_null`).
    pub fn is_last_writer_wins(&self) -> bool {
        matches!(
            self,
            Self::MergeEntityReplace
                | Self::ReplaceForPortionOf
                | Self::InsertNewEntities
                | Self::DeleteForPortionOf
        )
    }

    pub fn is_for_portion_of(&self) -> bool {
        matches!(
            self,
            Self::UpdateForPortionOf
                | Self::PatchForPortionOf
                | Self::ReplaceForPortionOf
                | Self::DeleteForPortionOf
        )
    }

    /// Entity-scope modes act over an entity's entire timeline (spec §4.6's
    /// "New Entity" column is non-skip); `*_FOR_PORTION_OF` modes require a
    /// pre-existing entity and act only within the source's coverage.
    pub fn is_entity_scope(&self) -> bool {
        matches!(
            self,
            Self::MergeEntityUpsert
                | Self::MergeEntityPatch
                | Self::MergeEntityReplace
                | Self::InsertNewEntities
        )
    }

    /// `INSERT_NEW_ENTITIES` is the only mode that rejects pre-existing entities.
    pub fn requires_new_entity(&self) -> bool {
        matches!(self, Self::InsertNewEntities)
    }

    /// `*_FOR_PORTION_OF` modes require the entity to already exist.
    pub fn requires_existing_entity(&self) -> bool {
        self.is_for_portion_of()
    }
}

/// The four delete modes (spec §4.6), extending `*_REPLACE` deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteMode {
    None,
    DeleteMissingTimeline,
    DeleteMissingEntities,
    DeleteMissingTimelineAndEntities,
}

impl DeleteMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(Self::None),
            "DELETE_MISSING_TIMELINE" => Some(Self::DeleteMissingTimeline),
            "DELETE_MISSING_ENTITIES" => Some(Self::DeleteMissingEntities),
            "DELETE_MISSING_TIMELINE_AND_ENTITIES" => Some(Self::DeleteMissingTimelineAndEntities),
            _ => None,
        }
    }

    pub fn deletes_entities(&self) -> bool {
        matches!(
            self,
            Self::DeleteMissingEntities | Self::DeleteMissingTimelineAndEntities
        )
    }

    pub fn deletes_timeline(&self) -> bool {
        matches!(
            self,
            Self::DeleteMissingTimeline | Self::DeleteMissingTimelineAndEntities
        )
    }
}

/// The plan operation kinds (spec §3's `operation` column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlanAction {
    Delete,
    Update,
    Insert,
    SkipIdentical,
    SkipNoTarget,
    SkipFiltered,
    SkipEclipsed,
    Error,
}

impl PlanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::SkipIdentical => "SKIP_IDENTICAL",
            Self::SkipNoTarget => "SKIP_NO_TARGET",
            Self::SkipFiltered => "SKIP_FILTERED",
            Self::SkipEclipsed => "SKIP_ECLIPSED",
            Self::Error => "ERROR",
        }
    }

    pub fn is_dml(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }

    /// Ordering class for the DML ordering contract (spec §4.8): DELETE(1) <
    /// UPDATE(2) < INSERT(3) < everything else(4).
    pub fn dml_class(&self) -> u8 {
        match self {
            Self::Delete => 1,
            Self::Update => 2,
            Self::Insert => 3,
            _ => 4,
        }
    }
}

/// Classification of an UPDATE by temporal impact (spec §3/§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpdateEffect {
    None,
    Shrink,
    Move,
    Grow,
}

impl UpdateEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Shrink => "SHRINK",
            Self::Move => "MOVE",
            Self::Grow => "GROW",
        }
    }
}

/// Which keying strategy a call is actually operating under, derived from
/// whether identity columns and/or lookup key sets were supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStrategy {
    Hybrid,
    IdentityKeyOnly,
    LookupKeyOnly,
    Undefined,
}

impl IdentityStrategy {
    pub fn derive(has_identity: bool, has_lookup: bool) -> Self {
        match (has_identity, has_lookup) {
            (true, true) => Self::Hybrid,
            (true, false) => Self::IdentityKeyOnly,
            (false, true) => Self::LookupKeyOnly,
            (false, false) => Self::Undefined,
        }
    }
}

/// Everything one `temporal_merge` call needs, threaded by reference through
/// every planning phase (spec §6's `MergeRequest` surface plus the resolved
/// era descriptor). Generalizes the reference crate's `PlannerContext`.
#[derive(Debug, Clone)]
pub struct PlannerContext {
    pub target_table: TableId,
    pub source_table: TableId,
    pub mode: MergeMode,
    pub delete_mode: DeleteMode,
    pub era: EraDescriptor,
    pub row_id_column: String,
    pub founding_id_column: Option<String>,
    pub update_source_with_feedback: bool,
    pub log_trace: bool,
    pub strategy: IdentityStrategy,
}

impl PlannerContext {
    pub fn is_founding_mode(&self) -> bool {
        self.founding_id_column.is_some()
    }
}

// ── Shared JSON payload helpers, used across entity/classify/plan ──

/// Stringify a JSON scalar for use in a composite lookup/grouping key.
pub(crate) fn json_value_to_str(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "_NULL_".to_string(),
        other => other.to_string(),
    }
}

/// A stable string key for a JSON map, ignoring null entries (two maps that
/// differ only in explicit nulls collapse to the same key).
pub(crate) fn json_map_to_key(map: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut parts: Vec<String> = map
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| format!("{}={}", k, json_value_to_str(v)))
        .collect();
    parts.sort();
    parts.join("__")
}

/// Build a composite key from only the named columns of `map`, skipping any
/// that are null or absent. Returns an empty string if every named column is
/// null/absent (spec §4.4: that lookup key set is ineligible for this row).
pub(crate) fn build_key_for_cols(
    map: &serde_json::Map<String, serde_json::Value>,
    cols: &[String],
) -> String {
    let mut parts = Vec::new();
    for col in cols {
        if let Some(v) = map.get(col) {
            if !v.is_null() {
                parts.push(format!("{}={}", col, json_value_to_str(v)));
            }
        }
    }
    parts.join("__")
}

/// Remove all-null entries from a payload map (spec §4.6's
/// `reduce_ignoring_null` and the UPSERT-family `exclude_if_null_columns` rule).
pub(crate) fn strip_nulls(
    map: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Compare two JSON maps for equality, treating null as "absent" on both sides.
pub(crate) fn maps_equal_ignoring_nulls(
    a: &serde_json::Map<String, serde_json::Value>,
    b: &serde_json::Map<String, serde_json::Value>,
) -> bool {
    a.iter()
        .filter(|(_, v)| !v.is_null())
        .all(|(k, v)| b.get(k).map_or(false, |bv| bv == v))
        && b.iter()
            .filter(|(_, v)| !v.is_null())
            .all(|(k, v)| a.get(k).map_or(false, |av| av == v))
}
