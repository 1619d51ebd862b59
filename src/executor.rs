//! Executor (spec §4.9): applies a plan's operations against the target
//! store in `plan_op_seq` order inside the caller's transaction, then writes
//! one feedback row per source `row_id`. No precedent in the retrieved
//! reference crate, which only prepares SQL fragments (`executor_cache.rs`);
//! this module is the full DML-issuing implementation spec §4.9 requires,
//! grounded in the reference crate's `sweep_line_plan` call shape and the
//! storage traits of `store.rs`.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{MergeResult, TableId};
use crate::plan::PlanOperation;
use crate::store::{FeedbackRow, FeedbackSink, FeedbackStatus, TargetWriter};
use crate::types::PlanAction;

/// Execute `ops` against `writer` in order, then (when `update_source_with_feedback`
/// is set by the caller) write one feedback row per distinct source `row_id`
/// through `feedback`. Stops at the first storage error (spec §4.9: "the
/// executor stops and records ERROR with the underlying message; the
/// transaction is left to the caller to roll back").
pub fn execute(
    target_table: &TableId,
    ops: &[PlanOperation],
    writer: &mut dyn TargetWriter,
    mut feedback: Option<&mut dyn FeedbackSink>,
) -> MergeResult<()> {
    let mut row_status: HashMap<i64, (FeedbackStatus, Option<String>, Option<serde_json::Value>)> =
        HashMap::new();

    for op in ops {
        let status = status_for(op.operation);

        if op.operation == PlanAction::Error {
            let message = op
                .feedback
                .as_ref()
                .and_then(|f| f.get("error"))
                .and_then(|v| v.as_str())
                .unwrap_or("planner invariant violation")
                .to_string();
            for row_id in &op.row_ids {
                row_status.insert(*row_id, (FeedbackStatus::Error, Some(message.clone()), op.entity_keys.clone()));
            }
            continue;
        }

        if !op.operation.is_dml() {
            for row_id in &op.row_ids {
                row_status.insert(*row_id, (status, None, op.entity_keys.clone()));
            }
            continue;
        }

        debug!(
            plan_op_seq = op.plan_op_seq,
            statement_seq = op.statement_seq,
            operation = op.operation.as_str(),
            "applying plan operation"
        );

        match writer.apply(target_table, op) {
            Ok(()) => {
                for row_id in &op.row_ids {
                    row_status.insert(*row_id, (FeedbackStatus::Applied, None, op.entity_keys.clone()));
                }
            }
            Err(err) => {
                warn!(plan_op_seq = op.plan_op_seq, error = %err, "plan operation failed at storage layer");
                let message = err.to_string();
                for row_id in &op.row_ids {
                    row_status.insert(*row_id, (FeedbackStatus::Error, Some(message.clone()), op.entity_keys.clone()));
                }
                if let Some(sink) = feedback.as_deref_mut() {
                    flush_feedback(sink, row_status)?;
                }
                return Err(err);
            }
        }
    }

    if let Some(sink) = feedback.as_deref_mut() {
        flush_feedback(sink, row_status)?;
    }

    Ok(())
}

fn status_for(action: PlanAction) -> FeedbackStatus {
    match action {
        PlanAction::SkipIdentical => FeedbackStatus::SkippedIdentical,
        PlanAction::SkipFiltered => FeedbackStatus::SkippedFiltered,
        PlanAction::SkipNoTarget => FeedbackStatus::SkippedNoTarget,
        PlanAction::SkipEclipsed => FeedbackStatus::SkippedEclipsed,
        PlanAction::Error => FeedbackStatus::Error,
        _ => FeedbackStatus::Applied,
    }
}

fn flush_feedback(
    sink: &mut dyn FeedbackSink,
    row_status: HashMap<i64, (FeedbackStatus, Option<String>, Option<serde_json::Value>)>,
) -> MergeResult<()> {
    let mut rows: Vec<_> = row_status.into_iter().collect();
    rows.sort_by_key(|(row_id, _)| *row_id);
    for (row_id, (status, error_message, target_entity_keys)) in rows {
        sink.write(FeedbackRow {
            source_row_id: row_id,
            target_entity_keys,
            status,
            error_message,
        })?;
    }
    Ok(())
}
