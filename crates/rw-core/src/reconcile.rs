//! Merging fresh server snapshots into held state.
//!
//! Server fields always come from the fresh snapshot; the local [`RowView`]
//! always comes from what was held. Rows are never dropped: the server only
//! ever adds rows to a run.
//!
//! [`RowView`]: crate::RowView

use crate::{ResultRow, Run};
use std::collections::BTreeMap;

/// Merge a fresh row snapshot into the previously held rows.
///
/// Pure and order-independent: output is keyed by id and ordered by
/// `(position, id)`, so repeated application with the same `fresh` input is a
/// no-op.
pub fn merge_rows(previous: &[ResultRow], fresh: &[ResultRow]) -> Vec<ResultRow> {
    let mut merged: BTreeMap<&str, ResultRow> = BTreeMap::new();
    for row in previous {
        merged.insert(row.id.as_str(), row.clone());
    }
    for row in fresh {
        let view = merged
            .get(row.id.as_str())
            .map(|held| held.view)
            .unwrap_or_default();
        let mut next = row.clone();
        next.view = view;
        merged.insert(row.id.as_str(), next);
    }

    let mut rows: Vec<ResultRow> = merged.into_values().collect();
    rows.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
    rows
}

/// Merge a fresh run snapshot into the held one.
///
/// A different id means the caller switched runs and `fresh` wins outright.
pub fn merge_run(previous: Option<&Run>, fresh: &Run) -> Run {
    let Some(previous) = previous.filter(|prev| prev.id == fresh.id) else {
        return fresh.clone();
    };
    if previous.status.is_terminal() {
        return previous.clone();
    }

    let mut merged = fresh.clone();
    merged.query = previous.query.clone();
    merged.provider = previous.provider.clone();
    merged.created_at = previous.created_at;
    if !fresh.status.is_terminal() {
        merged.result_count = fresh.result_count.max(previous.result_count);
    }
    merged
}
