//! Query builder: compiles a search request into the backend query document.
//!
//! The builder is a pure function over its inputs, which keeps every branch
//! testable without a backend. Decision order:
//!
//! 1. A caller-supplied DSL document wins. Pagination and sorting are still
//!    applied, aggregations are attached, and timeline scoping wraps the
//!    inner query.
//! 2. An event-id filter produces an `ids` query and nothing else.
//! 3. Otherwise the query string and filter chips compile into a bool query.

use serde_json::{json, Map, Value};

use crate::error::{TracelineError, TracelineResult};
use crate::filter::{Chip, ChipKind, ChipOperator, EventRef, QueryFilter};
use crate::types::SortOrder;

/// Field marking which timeline an event belongs to.
pub const TIMELINE_ID_FIELD: &str = "__ts_timeline_id";

/// Nested field holding sketch-scoped labels.
pub const LABEL_FIELD: &str = "timesketch_label";

/// Characters that cannot survive a `query_string` query unescaped. A
/// `field:value` query whose value consists entirely of these is promoted
/// to an exact term query on the field's keyword variant.
const RESERVED_CHARS: &str = ".+-=_&|><!(){}[]^\"~?:\\/";

/// Build the label filter for a sketch: every requested label must match as
/// a nested `(name, sketch_id)` pair.
#[must_use]
pub fn build_labels_query(sketch_id: i64, labels: &[String]) -> Value {
    let clauses: Vec<Value> = labels
        .iter()
        .map(|label| {
            json!({
                "nested": {
                    "query": {
                        "bool": {
                            "must": [
                                {"term": {"timesketch_label.name.keyword": label}},
                                {"term": {"timesketch_label.sketch_id": sketch_id}},
                            ]
                        }
                    },
                    "path": LABEL_FIELD,
                }
            })
        })
        .collect();
    json!({"bool": {"must": clauses}})
}

/// Build an `ids` query for a set of specific events.
#[must_use]
pub fn build_events_query(events: &[EventRef]) -> Value {
    let ids: Vec<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
    json!({"query": {"ids": {"values": ids}}})
}

/// Convert an interval expression into an inclusive datetime range.
///
/// The expression is `"<timestamp> -N<unit> +N<unit>"` where the unit is one
/// of `s`, `m`, `h`, `d`. The timestamp may contain a space between date and
/// time.
pub fn convert_to_time_range(interval: &str) -> TracelineResult<(String, String)> {
    const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

    let parts: Vec<&str> = interval.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(TracelineError::bad_query(format!(
            "interval expression {interval:?} needs a timestamp and -N/+N offsets"
        )));
    }

    let digits = |s: &str| -> TracelineResult<i64> {
        let text: String = s.chars().filter(char::is_ascii_digit).collect();
        text.parse().map_err(|_| {
            TracelineError::bad_query(format!("no offset digits in {s:?} ({interval:?})"))
        })
    };
    let unit: String = parts[parts.len() - 1]
        .chars()
        .filter(char::is_ascii_alphabetic)
        .collect();

    let start_text = parts[..parts.len() - 2].join(" ");
    let minus = digits(parts[parts.len() - 2])?;
    let plus = digits(parts[parts.len() - 1])?;

    let center = parse_datetime(&start_text)?;

    let delta = |n: i64| match unit.as_str() {
        "s" => Ok(chrono::Duration::seconds(n)),
        "m" => Ok(chrono::Duration::minutes(n)),
        "h" => Ok(chrono::Duration::hours(n)),
        "d" => Ok(chrono::Duration::days(n)),
        _ => Err(TracelineError::bad_query(format!(
            "unknown interval unit {unit:?} in {interval:?}"
        ))),
    };

    let start_range = center - delta(minus)?;
    let end_range = center + delta(plus)?;
    Ok((
        start_range.format(TS_FORMAT).to_string(),
        end_range.format(TS_FORMAT).to_string(),
    ))
}

fn parse_datetime(text: &str) -> TracelineResult<chrono::NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    for format in FORMATS {
        if let Ok(ts) = chrono::NaiveDateTime::parse_from_str(text, format) {
            return Ok(ts);
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(ts) = date.and_hms_opt(0, 0, 0) {
            return Ok(ts);
        }
    }
    Err(TracelineError::bad_query(format!(
        "unable to parse timestamp {text:?}"
    )))
}

/// Detect a `field:value` query whose value is made entirely of reserved
/// characters, and promote it to an exact keyword term query.
fn special_char_query(query_string: &str) -> Option<Value> {
    let (field, value) = query_string.split_once(':')?;
    if value.is_empty() || !value.chars().all(|c| RESERVED_CHARS.contains(c)) {
        return None;
    }
    Some(json!({"term": {(format!("{field}.keyword")): value}}))
}

fn term_chip_filter(chip: &Chip) -> Value {
    // Exact phrase matching uses the keyword variant for strings; numeric
    // values match the field directly.
    if chip.value.is_string() {
        json!({"match_phrase": {(format!("{}.keyword", chip.field)): {"query": chip.value}}})
    } else {
        json!({"match_phrase": {(chip.field.clone()): {"query": chip.value}}})
    }
}

fn datetime_chip_range(chip: &Chip) -> TracelineResult<Value> {
    let value = chip.value_str().ok_or_else(|| {
        TracelineError::bad_query("datetime chip value must be a string".to_owned())
    })?;
    let (start, end) = match chip.kind {
        ChipKind::DatetimeRange => {
            let (start, end) = value.split_once(',').ok_or_else(|| {
                TracelineError::bad_query(format!(
                    "datetime_range chip {value:?} must be \"start,end\""
                ))
            })?;
            (start.to_owned(), end.to_owned())
        }
        ChipKind::DatetimeInterval => convert_to_time_range(value)?,
        _ => unreachable!("caller matched on datetime kinds"),
    };
    Ok(json!({"range": {"datetime": {"gte": start, "lte": end}}}))
}

fn ensure_sort(query: &mut Map<String, Value>, order: SortOrder) {
    if !query.contains_key("sort") {
        query.insert("sort".to_owned(), json!({"datetime": order.as_str()}));
    }
}

/// Move a `post_filter` into `query.bool.filter` and attach aggregations.
///
/// `post_filter` is applied after aggregation, so when aggregations are
/// requested the filter has to move into the query for aggregation scopes to
/// match the visible events.
fn attach_aggregations(query: &mut Map<String, Value>, aggregations: &Value) {
    if let Some(post_filter) = query.remove("post_filter") {
        if let Some(bool_query) = query
            .get_mut("query")
            .and_then(|q| q.get_mut("bool"))
            .and_then(Value::as_object_mut)
        {
            bool_query.insert("filter".to_owned(), post_filter);
        }
    }
    query.insert("aggregations".to_owned(), aggregations.clone());
}

/// Wrap a caller-supplied DSL query with timeline scoping.
///
/// Events imported before timeline tracking carry no timeline id field, so
/// the wrapped query accepts either: (query AND field absent) OR
/// (query AND field in `timeline_ids`).
fn wrap_dsl_with_timelines(query_dsl: &mut Map<String, Value>, timeline_ids: &[i64]) {
    let Some(old_query) = query_dsl.get("query").cloned() else {
        return;
    };
    query_dsl.insert(
        "query".to_owned(),
        json!({
            "bool": {
                "must": [],
                "should": [
                    {
                        "bool": {
                            "must": old_query,
                            "must_not": [{"exists": {"field": TIMELINE_ID_FIELD}}],
                        }
                    },
                    {
                        "bool": {
                            "must": [
                                {"terms": {(TIMELINE_ID_FIELD): timeline_ids}},
                                old_query,
                            ],
                            "must_not": [],
                            "filter": [{"exists": {"field": TIMELINE_ID_FIELD}}],
                        }
                    },
                ],
                "must_not": [],
                "filter": [],
            }
        }),
    );
}

/// Build the final backend query document.
///
/// See the module docs for the decision order. Malformed DSL documents and
/// chips surface as [`TracelineError::BadQuery`].
pub fn build_query(
    sketch_id: i64,
    query_string: Option<&str>,
    query_filter: &QueryFilter,
    query_dsl: Option<&Value>,
    aggregations: Option<&Value>,
    timeline_ids: Option<&[i64]>,
) -> TracelineResult<Value> {
    if let Some(dsl) = query_dsl {
        return build_from_dsl(dsl, query_filter, aggregations, timeline_ids);
    }

    if !query_filter.events.is_empty() {
        return Ok(build_events_query(&query_filter.events));
    }

    let mut must: Vec<Value> = Vec::new();
    let mut must_not: Vec<Value> = Vec::new();
    let mut filter: Vec<Value> = Vec::new();
    let mut should: Vec<Value> = Vec::new();

    let mut query_string = query_string.unwrap_or_default();
    let special = special_char_query(query_string);
    if special.is_some() {
        query_string = "";
    }

    if !query_string.is_empty() {
        must.push(json!({
            "query_string": {"query": query_string, "default_operator": "AND"}
        }));
    }
    if let Some(term) = special {
        must.push(term);
    }

    if !query_filter.chips.is_empty() {
        let mut labels: Vec<String> = Vec::new();
        let mut datetime_ranges: Vec<Value> = Vec::new();

        for chip in &query_filter.chips {
            // Chips the user disabled stay in the filter but are skipped.
            if !chip.active {
                continue;
            }
            match chip.kind {
                ChipKind::Label => {
                    let value = chip.value_str().ok_or_else(|| {
                        TracelineError::bad_query("label chip value must be a string".to_owned())
                    })?;
                    labels.push(value.to_owned());
                }
                ChipKind::Term => {
                    let term_filter = term_chip_filter(chip);
                    match chip.operator {
                        ChipOperator::Must => must.push(term_filter),
                        ChipOperator::MustNot => must_not.push(term_filter),
                        ChipOperator::Filter => filter.push(term_filter),
                        ChipOperator::Should => should.push(term_filter),
                    }
                }
                ChipKind::DatetimeRange | ChipKind::DatetimeInterval => {
                    datetime_ranges.push(datetime_chip_range(chip)?);
                }
            }
        }

        if !labels.is_empty() {
            must.push(build_labels_query(sketch_id, &labels));
        }
        // All datetime chips OR together into one clause: narrowing a search
        // to two time windows means "either window", not both.
        if !datetime_ranges.is_empty() {
            must.push(json!({
                "bool": {"should": datetime_ranges, "minimum_should_match": 1}
            }));
        }
    }

    let mut query = Map::new();

    // Should-operator chips ride inside every compiled bool clause; the key
    // is only emitted when such chips exist.
    let bool_clause = |must: Vec<Value>, must_not: Vec<Value>, filter: Vec<Value>| {
        let mut clause = Map::new();
        clause.insert("must".to_owned(), json!(must));
        clause.insert("must_not".to_owned(), json!(must_not));
        clause.insert("filter".to_owned(), json!(filter));
        if !should.is_empty() {
            clause.insert("should".to_owned(), json!(should));
        }
        json!({"bool": clause})
    };

    if let Some(ids) = timeline_ids.filter(|ids| !ids.is_empty()) {
        let mut must_not_pre = must_not.clone();
        must_not_pre.push(json!({"exists": {"field": TIMELINE_ID_FIELD}}));

        let mut must_post = must.clone();
        must_post.push(json!({"terms": {(TIMELINE_ID_FIELD): ids}}));

        let mut filter_post = filter.clone();
        filter_post.push(json!({"exists": {"field": TIMELINE_ID_FIELD}}));

        query.insert(
            "query".to_owned(),
            json!({
                "bool": {
                    "must": [],
                    "should": [
                        bool_clause(must, must_not_pre, filter),
                        bool_clause(must_post, must_not, filter_post),
                    ],
                    "must_not": [],
                    "filter": [],
                }
            }),
        );
    } else {
        query.insert("query".to_owned(), bool_clause(must, must_not, filter));
    }

    if let Some(from) = query_filter.from {
        query.insert("from".to_owned(), json!(from));
    }
    if let Some(size) = query_filter.size {
        query.insert("size".to_owned(), json!(size));
    }
    if let Some(terminate_after) = query_filter.terminate_after {
        query.insert("terminate_after".to_owned(), json!(terminate_after));
    }
    ensure_sort(&mut query, query_filter.order);

    if let Some(aggs) = aggregations {
        attach_aggregations(&mut query, aggs);
    }

    Ok(Value::Object(query))
}

fn build_from_dsl(
    dsl: &Value,
    query_filter: &QueryFilter,
    aggregations: Option<&Value>,
    timeline_ids: Option<&[i64]>,
) -> TracelineResult<Value> {
    let parsed: Value = match dsl {
        Value::String(text) => serde_json::from_str(text)
            .map_err(|e| TracelineError::bad_query(format!("query DSL is not valid JSON: {e}")))?,
        other => other.clone(),
    };
    let mut query = match parsed {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(TracelineError::bad_query(format!(
                "query DSL must be a JSON object, got {other}"
            )))
        }
    };

    // The builder owns the `aggregations` key; anything the caller embedded
    // in the DSL is dropped so the request only ever aggregates what the
    // `aggregations` argument asked for.
    query.remove("aggregations");

    if let Some(from) = query_filter.from {
        query.insert("from".to_owned(), json!(from));
    }
    if let Some(size) = query_filter.size {
        query.insert("size".to_owned(), json!(size));
    }

    if let Some(aggs) = aggregations {
        attach_aggregations(&mut query, aggs);
    }

    ensure_sort(&mut query, query_filter.order);

    if let Some(ids) = timeline_ids.filter(|ids| !ids.is_empty()) {
        wrap_dsl_with_timelines(&mut query, ids);
    }

    Ok(Value::Object(query))
}
