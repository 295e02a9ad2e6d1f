//! SSH sessionizer: pair connection and disconnection syslog lines into
//! sessions keyed by client address.

use std::collections::HashMap;

use traceline_core::{SessionId, TracelineResult};

use crate::interface::{Analyzer, AnalyzerContext, EventStreamSpec};
use crate::sessionizer::annotate_session;

const SESSION_TYPE: &str = "ssh_session";
const QUERY: &str =
    "(data_type:\"syslog:line\") AND (\"Connection from\" OR \"Disconnected from user\")";

/// Client address and port parsed out of an sshd syslog line.
///
/// Connection lines read `... Connection from <ip> port <port> ...`, so the
/// address sits at token 4 and the port at token 6 once the syslog prefix
/// tokens are counted in. Disconnection lines carry the user name too
/// (`... Disconnected from user <user> <ip> port <port>`), shifting both
/// by two.
fn parse_endpoint(message: &str, ip_token: usize, port_token: usize) -> Option<(String, String)> {
    let tokens: Vec<&str> = message.split_whitespace().collect();
    Some((
        (*tokens.get(ip_token)?).to_owned(),
        (*tokens.get(port_token)?).to_owned(),
    ))
}

/// Pairs sshd connection and disconnection events into sessions.
#[derive(Debug, Default)]
pub struct SshSessionizer;

impl Analyzer for SshSessionizer {
    fn name(&self) -> &'static str {
        "ssh_sessionizer"
    }

    fn display_name(&self) -> &'static str {
        "SSH sessionizer"
    }

    fn description(&self) -> &'static str {
        "Pairs sshd connection and disconnection events into sessions"
    }

    fn run(&mut self, ctx: &AnalyzerContext<'_>) -> TracelineResult<String> {
        let stream = ctx.event_stream(
            self.name(),
            EventStreamSpec::query(QUERY).with_return_fields(&["timestamp", "message"]),
        )?;

        // Connections awaiting their disconnection, keyed by (ip, port).
        let mut pending = HashMap::new();
        // Sessions are numbered per client address, starting at zero.
        let mut ip_counters: HashMap<String, u64> = HashMap::new();
        let mut session_count: u64 = 0;

        for event in stream {
            let event = event?;
            let Some(message) = event.attribute_str("message").map(str::to_owned) else {
                continue;
            };

            if message.contains("Connection from") {
                if let Some(endpoint) = parse_endpoint(&message, 4, 6) {
                    pending.insert(endpoint, event);
                }
            } else if message.contains("Disconnected from user") {
                let Some(endpoint) = parse_endpoint(&message, 6, 8) else {
                    continue;
                };
                let Some(mut connection) = pending.remove(&endpoint) else {
                    continue;
                };
                let counter = ip_counters.entry(endpoint.0.clone()).or_insert(0);
                let session_id = SessionId::Text(format!("{}:{}", endpoint.0, counter));
                *counter += 1;
                session_count += 1;

                let mut disconnection = event;
                annotate_session(&mut connection, SESSION_TYPE, session_id.clone());
                annotate_session(&mut disconnection, SESSION_TYPE, session_id);
                connection.commit()?;
                disconnection.commit()?;
            }
        }

        Ok(format!(
            "Sessionizing completed, number of sessions created: {session_count}"
        ))
    }
}
