//! Windows EVTX sessionizers: logon sessions and screen-unlock sessions.
//!
//! Both walk the EVTX records of a timeline in timestamp order, opening a
//! session on a start event and closing it on a matching end event, keyed
//! by the logon id carried in the record's EventData XML. A system startup
//! record closes every open session at once, since whatever was open did
//! not survive the reboot.
//!
//! The stream restarts from the last seen timestamp when a scroll context
//! is lost, so long timelines survive transient backend trouble.

use std::collections::{HashMap, VecDeque};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use traceline_core::{SessionId, TracelineError, TracelineResult};

use crate::interface::{Analyzer, AnalyzerContext, Event, EventStreamSpec};
use crate::sessionizer::annotate_session;

/// EVTX record id written when the event log service starts (boot).
const STARTUP_EVENT_ID: i64 = 6005;

/// Recent record numbers kept for duplicate suppression. Restarted scrolls
/// can replay a few records around the restart point.
const EVENT_HISTORY_LENGTH: usize = 5;

/// Consecutive restarts without forward progress before giving up.
const MAX_STALLED_RESTARTS: u32 = 3;

/// Per-session-type wiring of one EVTX sessionizer.
#[derive(Clone, Copy)]
pub struct EvtxSessionConfig {
    /// Key under the event's `session_id` map.
    pub session_type: &'static str,
    /// Event identifiers that open a session.
    pub start_events: &'static [i64],
    /// Event identifiers that close a session.
    pub end_events: &'static [i64],
    /// EventData field holding the account name, per event identifier.
    pub account_field: fn(i64) -> &'static str,
}

fn event_data_section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<EventData>[\s\S]+</EventData>").expect("static pattern"))
}

fn data_element_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new("<Data Name=\"([^\"]+)\">([^<>]+)</Data>").expect("static pattern")
    })
}

/// Extract one named value from the EventData section of an EVTX XML blob.
fn event_data_value(xml: &str, name: &str) -> Option<String> {
    // Anchor on EventData first so Data elements from other sections never
    // match.
    let section = event_data_section_re().find(xml)?.as_str();
    data_element_re()
        .captures_iter(section)
        .find(|captures| &captures[1] == name)
        .map(|captures| captures[2].to_owned())
}

struct WinEvtxSessionizer {
    config: EvtxSessionConfig,
}

impl WinEvtxSessionizer {
    fn logon_id(&self, event: &Event<'_>) -> Option<String> {
        let xml = event.attribute_str("xml_string")?;
        event_data_value(xml, "TargetLogonId")
    }

    fn account(&self, event: &Event<'_>, event_id: i64) -> String {
        event
            .attribute_str("xml_string")
            .and_then(|xml| event_data_value(xml, (self.config.account_field)(event_id)))
            .unwrap_or_else(|| "unknown".to_owned())
    }

    fn run_sessions(
        &mut self,
        ctx: &AnalyzerContext<'_>,
        analyzer: &'static str,
    ) -> TracelineResult<String> {
        let mut session_num: u64 = 0;
        // Open sessions by logon id, value is the rendered session text.
        let mut open_sessions: HashMap<String, String> = HashMap::new();
        let mut recent_records: VecDeque<i64> = VecDeque::new();
        let mut last_timestamp: i64 = 0;
        let mut stalled_restarts: u32 = 0;

        'restart: loop {
            let query = format!(
                "data_type:\"windows:evtx:record\" AND timestamp:[{last_timestamp} TO *]"
            );
            let stream = ctx.event_stream(
                analyzer,
                EventStreamSpec::query(query).with_return_fields(&[
                    "timestamp",
                    "event_identifier",
                    "record_number",
                    "xml_string",
                ]),
            )?;

            for event in stream {
                let mut event = match event {
                    Ok(event) => event,
                    Err(e) if e.is_retryable() && stalled_restarts < MAX_STALLED_RESTARTS => {
                        stalled_restarts += 1;
                        continue 'restart;
                    }
                    Err(e) => return Err(e),
                };
                stalled_restarts = 0;
                last_timestamp = event.attribute_i64("timestamp").unwrap_or(last_timestamp);

                if let Some(record_number) = event.attribute_i64("record_number") {
                    if recent_records.contains(&record_number) {
                        continue;
                    }
                    recent_records.push_back(record_number);
                    if recent_records.len() > EVENT_HISTORY_LENGTH {
                        recent_records.pop_front();
                    }
                }

                let Some(event_id) = event.attribute_i64("event_identifier") else {
                    continue;
                };

                if self.config.start_events.contains(&event_id) {
                    let Some(logon_id) = self.logon_id(&event) else {
                        continue;
                    };
                    session_num += 1;
                    let text = format!("{session_num} ({})", self.account(&event, event_id));
                    open_sessions.insert(logon_id, text.clone());
                    annotate_session(&mut event, self.config.session_type, SessionId::Text(text));
                    event.commit()?;
                } else if self.config.end_events.contains(&event_id) {
                    let Some(logon_id) = self.logon_id(&event) else {
                        continue;
                    };
                    if let Some(text) = open_sessions.remove(&logon_id) {
                        annotate_session(
                            &mut event,
                            self.config.session_type,
                            SessionId::Text(text),
                        );
                        event.commit()?;
                    }
                } else if event_id == STARTUP_EVENT_ID && !open_sessions.is_empty() {
                    // Nothing survives a reboot: close every open session
                    // against the startup record.
                    let mut texts: Vec<String> = open_sessions.drain().map(|(_, t)| t).collect();
                    texts.sort_unstable();
                    let mut sessions: Map<String, Value> = event
                        .attribute("session_id")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    sessions.insert(self.config.session_type.to_owned(), json!(texts));
                    let mut staged = Map::new();
                    staged.insert("session_id".to_owned(), Value::Object(sessions));
                    event.add_attributes(staged);
                    event.commit()?;
                }
            }
            break;
        }

        Ok(format!(
            "Sessionizing completed, number of sessions created: {session_num}"
        ))
    }
}

// ─── Logon sessions ─────────────────────────────────────────────────────────

fn logon_account_field(event_id: i64) -> &'static str {
    // 4624 (an account was logged on) names the subject as TargetUserName;
    // the reconnect/disconnect records carry AccountName instead.
    if event_id == 4624 {
        "TargetUserName"
    } else {
        "AccountName"
    }
}

/// Windows logon session tracker (4624/4778 opens, 4634/4647/4779 closes).
pub struct LogonSessionizer {
    inner: WinEvtxSessionizer,
}

impl Default for LogonSessionizer {
    fn default() -> Self {
        Self {
            inner: WinEvtxSessionizer {
                config: EvtxSessionConfig {
                    session_type: "logon_session",
                    start_events: &[4624, 4778],
                    end_events: &[4634, 4647, 4779],
                    account_field: logon_account_field,
                },
            },
        }
    }
}

impl Analyzer for LogonSessionizer {
    fn name(&self) -> &'static str {
        "logon_sessionizer"
    }

    fn display_name(&self) -> &'static str {
        "Logon sessionizer"
    }

    fn description(&self) -> &'static str {
        "Tracks Windows logon sessions from EVTX records"
    }

    fn run(&mut self, ctx: &AnalyzerContext<'_>) -> TracelineResult<String> {
        self.inner.run_sessions(ctx, self.name())
    }
}

// ─── Screen unlock sessions ─────────────────────────────────────────────────

fn unlock_account_field(_event_id: i64) -> &'static str {
    "TargetUserName"
}

/// Screen unlock session tracker (4801 opens, lock/logoff records close).
pub struct UnlockSessionizer {
    inner: WinEvtxSessionizer,
}

impl Default for UnlockSessionizer {
    fn default() -> Self {
        Self {
            inner: WinEvtxSessionizer {
                config: EvtxSessionConfig {
                    session_type: "unlock_session",
                    start_events: &[4801],
                    end_events: &[4800, 4802, 4634, 4647, 4779],
                    account_field: unlock_account_field,
                },
            },
        }
    }
}

impl Analyzer for UnlockSessionizer {
    fn name(&self) -> &'static str {
        "unlock_sessionizer"
    }

    fn display_name(&self) -> &'static str {
        "Screen unlock sessionizer"
    }

    fn description(&self) -> &'static str {
        "Tracks Windows screen unlock sessions from EVTX records"
    }

    fn run(&mut self, ctx: &AnalyzerContext<'_>) -> TracelineResult<String> {
        self.inner.run_sessions(ctx, self.name())
    }
}
