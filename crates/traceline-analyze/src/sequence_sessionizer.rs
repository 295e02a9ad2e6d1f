//! Sequence sessionizer: find ordered runs of events matching a declared
//! attribute pattern and annotate each run as one session.
//!
//! Unlike the time-gap sessionizer, matching is driven by a configured
//! event sequence: each entry names attribute values the next event must
//! carry. A run that completes within the time budget becomes a session;
//! a run interrupted by a too-large gap is dropped and matching restarts.

use serde_json::{Map, Value};

use traceline_core::{SessionId, TracelineError, TracelineResult};

use crate::interface::{Analyzer, AnalyzerContext, Event, EventStreamSpec};
use crate::sessionizer::{annotate_session, MAX_TIME_DIFF_MICROS};

/// Configuration of one sequence sessionizer.
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    /// Session type, also used in the summary and the annotation key.
    pub name: String,
    /// Query narrowing the stream to candidate events.
    pub query_string: String,
    /// Source fields the matcher needs; must include `timestamp`.
    pub return_fields: Vec<String>,
    /// Ordered attribute patterns; each map must fully match one event.
    pub event_seq: Vec<Map<String, Value>>,
    /// Maximum gap between consecutive events of one run, in microseconds.
    pub max_time_diff_micros: i64,
}

impl SequenceConfig {
    /// Config with the default five-minute gap.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        query_string: impl Into<String>,
        return_fields: Vec<String>,
        event_seq: Vec<Map<String, Value>>,
    ) -> Self {
        Self {
            name: name.into(),
            query_string: query_string.into(),
            return_fields,
            event_seq,
            max_time_diff_micros: MAX_TIME_DIFF_MICROS,
        }
    }
}

/// Does the event carry every attribute value the pattern names?
fn matches_pattern(event: &Event<'_>, pattern: &Map<String, Value>) -> bool {
    pattern
        .iter()
        .all(|(field, expected)| event.attribute(field) == Some(expected))
}

/// Sessionizer matching a configured event sequence.
pub struct SequenceSessionizer {
    config: SequenceConfig,
    display_name: &'static str,
    description: &'static str,
}

impl SequenceSessionizer {
    #[must_use]
    pub fn new(config: SequenceConfig) -> Self {
        Self {
            config,
            display_name: "Sequence sessionizer",
            description: "Groups ordered event patterns into sessions",
        }
    }

    fn validate(&self) -> TracelineResult<()> {
        let fail = |detail: &str| {
            Err(TracelineError::AnalyzerValidation {
                analyzer: "sequence_sessionizer".to_owned(),
                detail: detail.to_owned(),
            })
        };
        if self.config.name.is_empty() {
            return fail("sequence name must not be empty");
        }
        if self.config.event_seq.is_empty() {
            return fail("event sequence must contain at least one pattern");
        }
        if !self.config.return_fields.iter().any(|f| f == "timestamp") {
            return fail("return fields must include 'timestamp'");
        }
        Ok(())
    }
}

impl Analyzer for SequenceSessionizer {
    fn name(&self) -> &'static str {
        "sequence_sessionizer"
    }

    fn display_name(&self) -> &'static str {
        self.display_name
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn run(&mut self, ctx: &AnalyzerContext<'_>) -> TracelineResult<String> {
        self.validate()?;

        let fields: Vec<&str> = self.config.return_fields.iter().map(String::as_str).collect();
        let stream = ctx.event_stream(
            self.name(),
            EventStreamSpec::query(self.config.query_string.clone())
                .with_return_fields(&fields),
        )?;

        let mut session_num: u64 = 0;
        let mut recording: Vec<Event<'_>> = Vec::new();
        let mut seq_pos = 0usize;
        let mut last_timestamp: Option<i64> = None;

        for event in stream {
            let mut event = event?;
            let timestamp = event.attribute_i64("timestamp").unwrap_or(0);

            // A run interrupted by a long silence is abandoned, not closed.
            if !recording.is_empty() {
                if let Some(last) = last_timestamp {
                    if timestamp - last > self.config.max_time_diff_micros {
                        recording.clear();
                        seq_pos = 0;
                    }
                }
            }
            last_timestamp = Some(timestamp);

            if matches_pattern(&event, &self.config.event_seq[seq_pos]) {
                recording.push(event);
                seq_pos += 1;
            } else if seq_pos > 0 && matches_pattern(&event, &self.config.event_seq[0]) {
                // Restart matching at this event.
                recording.clear();
                recording.push(event);
                seq_pos = 1;
            } else if seq_pos > 0 {
                recording.clear();
                seq_pos = 0;
            }

            if seq_pos == self.config.event_seq.len() {
                session_num += 1;
                for mut matched in recording.drain(..) {
                    annotate_session(
                        &mut matched,
                        &self.config.name,
                        SessionId::Num(session_num),
                    );
                    matched.commit()?;
                }
                seq_pos = 0;
            }
        }

        Ok(format!(
            "Sessionizing completed, number of {} session created: {session_num}",
            self.config.name
        ))
    }
}

// ─── PsExec destination sessions ────────────────────────────────────────────

const PSEXEC_SESSION_TYPE: &str = "psexec_dest";
const PSEXEC_QUERY: &str =
    "data_type:\"fs:stat\" OR data_type:\"windows:prefetch:execution\"";

fn psexec_event_seq() -> Vec<Map<String, Value>> {
    let pattern = |pairs: &[(&str, &str)]| -> Map<String, Value> {
        pairs
            .iter()
            .map(|(field, value)| ((*field).to_owned(), Value::String((*value).to_owned())))
            .collect()
    };
    // On the destination host, PsExec drops its service binary and then
    // runs it: the file creation followed by the prefetch execution record.
    vec![
        pattern(&[
            ("data_type", "fs:stat"),
            ("filename", "C:\\Windows\\PSEXESVC.exe"),
        ]),
        pattern(&[
            ("data_type", "windows:prefetch:execution"),
            ("executable", "PSEXESVC.EXE"),
        ]),
    ]
}

/// Marks PsExec service activity on destination hosts as sessions.
pub struct PsexecSessionizer {
    inner: SequenceSessionizer,
}

impl Default for PsexecSessionizer {
    fn default() -> Self {
        let config = SequenceConfig::new(
            PSEXEC_SESSION_TYPE,
            PSEXEC_QUERY,
            vec![
                "timestamp".to_owned(),
                "data_type".to_owned(),
                "filename".to_owned(),
                "executable".to_owned(),
            ],
            psexec_event_seq(),
        );
        Self {
            inner: SequenceSessionizer::new(config),
        }
    }
}

impl Analyzer for PsexecSessionizer {
    fn name(&self) -> &'static str {
        "psexec_sessionizer"
    }

    fn display_name(&self) -> &'static str {
        "PsExec sessionizer"
    }

    fn description(&self) -> &'static str {
        "Marks PsExec service activity on destination hosts as sessions"
    }

    fn run(&mut self, ctx: &AnalyzerContext<'_>) -> TracelineResult<String> {
        self.inner.run(ctx)
    }
}
