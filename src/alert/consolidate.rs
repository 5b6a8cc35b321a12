// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reduces raw trigger data to the rows one action kind will act on: filter on the action flag,
//! project away foreign columns, drop duplicates, sort and group.

use std::cmp::Ordering;
use std::collections::HashSet;

use log::debug;

use crate::alert::fields::{FieldKey, FieldMap};
use crate::alert::ActionKind;
use crate::trigger::Row;

/// One group of rows producing a single outgoing message. Without consolidation every group holds
/// exactly one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowGroup {
    pub rows: Vec<Row>,
}

impl RowGroup {
    /// The row whose address and subject fields represent the whole group. Grouping only ever
    /// joins rows with identical identity fields, so the first row is as good as any.
    pub fn lead(&self) -> &Row {
        &self.rows[0]
    }
}

/// The flag field of an action kind.
fn flag_field(kind: ActionKind) -> Option<FieldKey> {
    match kind {
        ActionKind::General => None,
        ActionKind::Email => Some(FieldKey::EmailAction),
        ActionKind::Sms => Some(FieldKey::SmsAction),
    }
}

/// Compares two sort-order values numerically when both parse as numbers, lexically otherwise.
fn compare_sort_values(left: &str, right: &str) -> Ordering {
    match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
        (Ok(left), Ok(right)) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
        _ => left.cmp(right),
    }
}

fn sort_by_column(rows: &mut [Row], column: &str) {
    rows.sort_by(|left, right| compare_sort_values(left.value(column), right.value(column)));
}

/// Produces the row groups one action kind will act on.
///
/// Rows pass the filter when their action flag is exactly `1`. Surviving rows are projected down
/// to the general columns plus the kind's own columns, deduplicated (first occurrence wins) and
/// sorted by the sort-order column when one is bound. Email actions with a consolidate column
/// additionally sort by their identity fields and group contiguous runs of rows sharing all of
/// them; every other configuration yields one group per row.
pub fn dedup_and_sort(rows: &[Row], fields: &FieldMap, kind: ActionKind) -> Vec<RowGroup> {
    let flag_column = match flag_field(kind).and_then(|key| fields.column(key)) {
        Some(column) => column,
        None => return Vec::new(),
    };

    // Matched, error-free columns of this kind plus the general ones
    let keep: Vec<&str> = FieldKey::ALL
        .iter()
        .filter(|key| key.kind() == ActionKind::General || key.kind() == kind)
        .filter_map(|key| fields.column(*key))
        .collect();

    let mut seen: HashSet<Vec<(String, String)>> = HashSet::new();
    let mut unique: Vec<Row> = Vec::new();
    for row in rows {
        if row.value(flag_column) != "1" {
            continue;
        }
        let projected = row.project(&keep);
        if seen.insert(projected.identity()) {
            unique.push(projected);
        }
    }
    debug!(
        "{} of {} rows remain for {} actions after filter and dedup",
        unique.len(),
        rows.len(),
        kind
    );

    if let Some(column) = fields.column(FieldKey::SortOrder) {
        sort_by_column(&mut unique, column);
    }

    let consolidate =
        kind == ActionKind::Email && fields.column(FieldKey::EmailConsolidate).is_some();

    if !consolidate {
        return unique
            .into_iter()
            .map(|row| RowGroup { rows: vec![row] })
            .collect();
    }

    // Successive stable sorts, least significant first, so rows sharing all identity fields end
    // up contiguous while the sort-order tiebreak survives within each run
    for key in [FieldKey::EmailBcc, FieldKey::EmailCc, FieldKey::EmailFrom] {
        if let Some(column) = fields.column(key) {
            sort_by_column(&mut unique, column);
        }
    }
    let subject = fields.column(FieldKey::EmailSubject).unwrap_or("");
    let to = fields.column(FieldKey::EmailTo).unwrap_or("");
    unique.sort_by(|left, right| {
        compare_sort_values(left.value(subject), right.value(subject))
            .then_with(|| compare_sort_values(left.value(to), right.value(to)))
    });

    let identity_columns: Vec<&str> = [
        FieldKey::EmailSubject,
        FieldKey::EmailTo,
        FieldKey::EmailFrom,
        FieldKey::EmailCc,
        FieldKey::EmailBcc,
    ]
    .iter()
    .filter_map(|key| fields.column(*key))
    .collect();

    let identity = |row: &Row| -> Vec<String> {
        identity_columns
            .iter()
            .map(|column| row.value(column).to_string())
            .collect()
    };

    let mut groups: Vec<RowGroup> = Vec::new();
    for row in unique {
        match groups.last_mut() {
            Some(group) if identity(group.lead()) == identity(&row) => group.rows.push(row),
            _ => groups.push(RowGroup { rows: vec![row] }),
        }
    }
    groups
}
