//! # traceline-export
//!
//! Stream the full result set of a search into CSV.
//!
//! The export runs as a scrolled search over the backend seam, reshapes
//! every hit into a flat row (metadata columns, sketch-scoped labels,
//! joined tags), and writes one CSV with a stable column order: the
//! well-known timeline columns first, everything else alphabetical.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use serde_json::Value;
use tracing::{info, warn};

use traceline_core::{EventBackend, SearchRequest, TracelineResult, LABEL_FIELD};

/// Page size and per-shard termination limit for export searches.
pub const EXPORT_PAGE_SIZE: u64 = 10_000;

/// Scroll keep-alive between export pages.
const EXPORT_SCROLL_KEEP_ALIVE: &str = "1m";

/// Columns that lead the CSV when present, in this order.
const LEADING_COLUMNS: &[&str] = &["datetime", "timestamp", "timestamp_desc", "message", "_index"];

/// Flatten one hit into a row.
///
/// Metadata fields become `_id`, `_type`, and `_index` columns. The label
/// list is filtered to the sketch and replaces the raw nested field; tag
/// lists join into one comma-separated cell.
fn shape_row(hit: &Value, sketch_id: i64) -> BTreeMap<String, Value> {
    let mut row: BTreeMap<String, Value> = hit
        .get("_source")
        .and_then(Value::as_object)
        .map(|source| source.clone().into_iter().collect())
        .unwrap_or_default();

    row.insert(
        "_id".to_owned(),
        hit.get("_id").cloned().unwrap_or(Value::Null),
    );
    row.insert(
        "_type".to_owned(),
        hit.get("_type").cloned().unwrap_or_else(|| "_doc".into()),
    );
    row.insert(
        "_index".to_owned(),
        hit.get("_index").cloned().unwrap_or(Value::Null),
    );

    let labels: Vec<String> = row
        .remove(LABEL_FIELD)
        .as_ref()
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter(|entry| {
                    entry.get("sketch_id").and_then(Value::as_i64) == Some(sketch_id)
                })
                .filter_map(|entry| entry.get("name").and_then(Value::as_str))
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    row.insert("label".to_owned(), Value::String(labels.join(",")));

    if let Some(tags) = row.get("tag").and_then(Value::as_array) {
        let joined = tags
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(",");
        row.insert("tag".to_owned(), Value::String(joined));
    }

    row
}

/// Render one cell: strings stay bare, scalars print plainly, and
/// structured values serialize to JSON text.
fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Column order: present leading columns first, the rest alphabetical.
fn column_order(rows: &[BTreeMap<String, Value>]) -> Vec<String> {
    let union: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();

    let mut columns: Vec<String> = LEADING_COLUMNS
        .iter()
        .filter(|c| union.contains(**c))
        .map(|c| (*c).to_owned())
        .collect();
    columns.extend(
        union
            .iter()
            .filter(|c| !LEADING_COLUMNS.contains(*c))
            .map(|c| (*c).to_owned()),
    );
    columns
}

/// Export every event matching the request as CSV. Returns the row count.
///
/// Pagination settings on the request are overridden: the export always
/// scrolls in pages of [`EXPORT_PAGE_SIZE`] from the start of the result
/// set.
pub fn export_csv<W: Write>(
    backend: &dyn EventBackend,
    request: &SearchRequest,
    writer: W,
) -> TracelineResult<u64> {
    let mut request = request.clone();
    request.filter.from = None;
    request.filter.size = Some(EXPORT_PAGE_SIZE);
    request.filter.terminate_after = Some(EXPORT_PAGE_SIZE);
    request.enable_scroll = true;

    let mut response = backend.search(&request)?;
    let total = response.hits.total;
    let mut rows: Vec<BTreeMap<String, Value>> = Vec::new();

    loop {
        for hit in &response.hits.hits {
            rows.push(shape_row(hit, request.sketch_id));
        }
        if rows.len() as u64 >= total {
            break;
        }
        let Some(scroll_id) = response.scroll_id.clone() else {
            warn!(
                target: "traceline",
                row_count = rows.len(),
                total_hits = total,
                "export ended early: no scroll context"
            );
            break;
        };
        response = backend.scroll(&scroll_id, EXPORT_SCROLL_KEEP_ALIVE)?;
        if response.hits.hits.is_empty() {
            warn!(
                target: "traceline",
                row_count = rows.len(),
                total_hits = total,
                "export ended early: empty scroll page"
            );
            break;
        }
    }

    let columns = column_order(&rows);
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(&columns)?;
    for row in &rows {
        let record: Vec<String> = columns.iter().map(|c| cell(row.get(c))).collect();
        csv_writer.write_record(&record)?;
    }
    csv_writer.flush()?;

    info!(
        target: "traceline",
        row_count = rows.len(),
        sketch_id = request.sketch_id,
        "export complete"
    );
    Ok(rows.len() as u64)
}
