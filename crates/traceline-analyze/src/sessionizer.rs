//! Time-gap sessionizer: split the whole timeline into sessions wherever
//! consecutive events are further apart than a maximum gap.

use serde_json::{json, Map, Value};

use traceline_core::{SessionId, TracelineResult};

use crate::interface::{Analyzer, AnalyzerContext, Event, EventStreamSpec};

/// Default maximum gap between events of one session, in microseconds
/// (five minutes).
pub const MAX_TIME_DIFF_MICROS: i64 = 300_000_000;

/// Merge a session id into the event's `session_id` map attribute.
///
/// The attribute maps session type to id, so several sessionizers can
/// annotate the same event without clobbering each other.
pub(crate) fn annotate_session(event: &mut Event<'_>, session_type: &str, session_id: SessionId) {
    let mut sessions: Map<String, Value> = event
        .attribute("session_id")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    sessions.insert(session_type.to_owned(), json!(session_id));
    let mut staged = Map::new();
    staged.insert("session_id".to_owned(), Value::Object(sessions));
    event.add_attributes(staged);
}

/// Sessionizer over all events, keyed on timestamp gaps.
pub struct Sessionizer {
    max_time_diff_micros: i64,
}

impl Default for Sessionizer {
    fn default() -> Self {
        Self {
            max_time_diff_micros: MAX_TIME_DIFF_MICROS,
        }
    }
}

impl Sessionizer {
    /// Sessionizer with a custom maximum gap.
    #[must_use]
    pub fn with_max_gap(max_time_diff_micros: i64) -> Self {
        Self {
            max_time_diff_micros,
        }
    }
}

impl Analyzer for Sessionizer {
    fn name(&self) -> &'static str {
        "sessionizer"
    }

    fn display_name(&self) -> &'static str {
        "Time-gap sessionizer"
    }

    fn description(&self) -> &'static str {
        "Splits the timeline into sessions on gaps between events"
    }

    fn run(&mut self, ctx: &AnalyzerContext<'_>) -> TracelineResult<String> {
        let stream = ctx.event_stream(
            self.name(),
            EventStreamSpec::query("*").with_return_fields(&["timestamp"]),
        )?;

        let mut session_num: u64 = 0;
        let mut last_timestamp: Option<i64> = None;

        for event in stream {
            let mut event = event?;
            let timestamp = event.attribute_i64("timestamp").unwrap_or(0);

            match last_timestamp {
                None => session_num = 1,
                // Equal timestamps always share a session.
                Some(last) if timestamp - last > self.max_time_diff_micros => {
                    session_num += 1;
                }
                Some(_) => {}
            }
            last_timestamp = Some(timestamp);

            annotate_session(&mut event, "all_events", SessionId::Num(session_num));
            event.commit()?;
        }

        Ok(format!(
            "Sessionizing completed, number of sessions created: {session_num}"
        ))
    }
}
