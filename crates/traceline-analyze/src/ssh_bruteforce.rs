//! SSH brute force analyzer: flag successful logins preceded by a burst of
//! failed attempts from the same client address.
//!
//! Authentication events are replayed in time order into per-address
//! histories. A successful login is a brute force hit when the preceding
//! window holds enough failures from that address and no earlier success;
//! an address the attacker already held is ordinary traffic, not a
//! break-in.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;

use traceline_core::TracelineResult;

use crate::interface::{Analyzer, AnalyzerContext, EventStreamSpec};

/// Window before a successful login in which failures are counted.
const BRUTE_FORCE_WINDOW_SECONDS: i64 = 3600;

/// Failed attempts within the window required to call it a brute force.
const BRUTE_FORCE_MIN_FAILED: usize = 20;

const QUERY: &str =
    "(data_type:\"syslog:line\" AND reporter:sshd) AND (\"Accepted\" OR \"Failed\")";

fn accepted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Accepted (?:password|publickey) for (\S+) from (\S+) port \d+")
            .expect("static pattern")
    })
}

fn failed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Failed (?:password|publickey) for (?:invalid user )?(\S+) from (\S+) port \d+")
            .expect("static pattern")
    })
}

/// One parsed sshd authentication line.
struct AuthAttempt {
    user: String,
    ip: String,
    success: bool,
}

fn parse_attempt(message: &str) -> Option<AuthAttempt> {
    if let Some(captures) = accepted_re().captures(message) {
        return Some(AuthAttempt {
            user: captures[1].to_owned(),
            ip: captures[2].to_owned(),
            success: true,
        });
    }
    let captures = failed_re().captures(message)?;
    Some(AuthAttempt {
        user: captures[1].to_owned(),
        ip: captures[2].to_owned(),
        success: false,
    })
}

/// Flags SSH logins preceded by a burst of failed attempts.
#[derive(Debug, Default)]
pub struct SshBruteForceAnalyzer;

impl Analyzer for SshBruteForceAnalyzer {
    fn name(&self) -> &'static str {
        "ssh_bruteforce"
    }

    fn display_name(&self) -> &'static str {
        "SSH brute force analyzer"
    }

    fn description(&self) -> &'static str {
        "Flags SSH logins preceded by a burst of failed attempts"
    }

    fn run(&mut self, ctx: &AnalyzerContext<'_>) -> TracelineResult<String> {
        let stream = ctx.event_stream(
            self.name(),
            EventStreamSpec::query(QUERY).with_return_fields(&[
                "timestamp",
                "hostname",
                "pid",
                "message",
            ]),
        )?;

        // Authentication history per client address: (seconds, success).
        let mut history: HashMap<String, Vec<(i64, bool)>> = HashMap::new();
        // Detections per address, with the window's first and last failure.
        let mut detections: BTreeMap<String, (i64, i64)> = BTreeMap::new();

        for event in stream {
            let mut event = event?;
            let Some(attempt) = event.attribute_str("message").and_then(parse_attempt) else {
                continue;
            };
            let seconds = event.attribute_i64("timestamp").unwrap_or(0) / 1_000_000;
            let attempts = history.entry(attempt.ip.clone()).or_default();

            if attempt.success {
                let window_start = seconds - BRUTE_FORCE_WINDOW_SECONDS;
                let window: Vec<&(i64, bool)> = attempts
                    .iter()
                    .filter(|(ts, _)| *ts >= window_start && *ts < seconds)
                    .collect();
                let failed: Vec<i64> = window
                    .iter()
                    .filter(|(_, success)| !success)
                    .map(|(ts, _)| *ts)
                    .collect();
                let prior_success = window.iter().any(|(_, success)| *success);

                if !prior_success && failed.len() >= BRUTE_FORCE_MIN_FAILED {
                    let first = failed.iter().copied().min().unwrap_or(seconds);
                    let last = failed.iter().copied().max().unwrap_or(seconds);
                    detections
                        .entry(attempt.ip.clone())
                        .and_modify(|(lo, hi)| {
                            *lo = (*lo).min(first);
                            *hi = (*hi).max(last);
                        })
                        .or_insert((first, last));

                    event.add_tags(&["brute_force"]);
                    event.add_human_readable(
                        self.name(),
                        &format!(
                            "Brute force login as {} from {}: {} failed attempts in the preceding hour",
                            attempt.user,
                            attempt.ip,
                            failed.len()
                        ),
                        false,
                    );
                    event.commit()?;
                }
            }

            attempts.push((seconds, attempt.success));
        }

        if detections.is_empty() {
            return Ok("No brute force activity found".to_owned());
        }
        let ips: Vec<&str> = detections.keys().map(String::as_str).collect();
        Ok(format!(
            "{} brute force from {}",
            detections.len(),
            ips.join(", ")
        ))
    }
}
