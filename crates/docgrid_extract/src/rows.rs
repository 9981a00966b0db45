//! Schema resolution and row grouping.
//!
//! Wire records resolve against the project schema (exact `column_id`
//! match, then case-sensitive `column_name` fallback; anything else is
//! discarded) and are grouped into the dense row set persisted for the
//! batch.

use docgrid_protocol::{ExtractionResult, Project};
use tracing::debug;

use crate::wire::RawExtraction;

const BBOX_MAX: i64 = 1000;

/// Resolve raw wire records against the project schema, keeping the
/// extraction's row placement. Records matching no column are dropped.
pub fn resolve_records(
    project: &Project,
    raw: Vec<RawExtraction>,
    multi_row: bool,
) -> Vec<(i64, ExtractionResult)> {
    let mut resolved = Vec::with_capacity(raw.len());
    for record in raw {
        let column = record
            .column_id
            .as_deref()
            .and_then(|id| project.column_by_id(id))
            .or_else(|| {
                record
                    .column_name
                    .as_deref()
                    .and_then(|name| project.column_by_name(name))
            });
        let Some(column) = column else {
            debug!(
                column_id = record.column_id.as_deref().unwrap_or(""),
                column_name = record.column_name.as_deref().unwrap_or(""),
                "Discarding extraction matching no schema column"
            );
            continue;
        };

        // Single-row mode collapses everything the model emits to row 0.
        let row_index = if multi_row {
            record.row_index.unwrap_or(0).max(0)
        } else {
            0
        };

        resolved.push((
            row_index,
            ExtractionResult {
                column_id: column.id.clone(),
                column_name: column.name.clone(),
                value: record.value,
                image_index: record.image_index.unwrap_or(0),
                bbox_2d: record.bbox_2d.map(clamp_bbox),
                confidence: record.confidence.map(|c| c.clamp(0.0, 1.0)),
                row_index: Some(row_index),
                redone: None,
            },
        ));
    }
    resolved
}

/// Group resolved records into the dense row set `0..=max(row_index)`.
/// Gap rows are materialized empty so indices stay gap-free; duplicate
/// `(row_index, column_id)` pairs resolve to the last record seen.
pub fn group_rows(records: Vec<(i64, ExtractionResult)>) -> Vec<Vec<ExtractionResult>> {
    let Some(max_index) = records.iter().map(|(index, _)| *index).max() else {
        return Vec::new();
    };

    let mut rows: Vec<Vec<ExtractionResult>> = vec![Vec::new(); (max_index + 1) as usize];
    for (index, result) in records {
        let row = &mut rows[index as usize];
        match row.iter_mut().find(|r| r.column_id == result.column_id) {
            Some(existing) => *existing = result,
            None => row.push(result),
        }
    }
    rows
}

/// Out-of-range coordinates are clamped at this boundary, not rejected.
fn clamp_bbox(bbox: [i64; 4]) -> [i64; 4] {
    bbox.map(|component| component.clamp(0, BBOX_MAX))
}
