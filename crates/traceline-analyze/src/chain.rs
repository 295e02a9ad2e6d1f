//! Chain analyzer: link causally related events under a shared chain id.
//!
//! A chain plugin knows how to find base events (e.g. a prefetch record of
//! an executable) and the events chained off them (e.g. the download URL
//! and the shortcut that launched it). The analyzer stamps every member of
//! a chain with the same UUID so clients can pivot across the whole chain
//! from any member.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use traceline_core::TracelineResult;

use crate::interface::{Analyzer, AnalyzerContext, Event, EventStreamSpec};

/// Emoji marking chained events.
const LINK_EMOJI: &str = "\u{1F517}";

/// One way of chaining events off a base event.
pub trait ChainPlugin: Send {
    /// Registry name, lower-case.
    fn name(&self) -> &'static str;

    /// One-line description of what the plugin links.
    fn description(&self) -> &'static str;

    /// Stream spec selecting candidate base events.
    fn base_spec(&self) -> EventStreamSpec;

    /// Is this base event worth chaining?
    fn accepts(&self, base: &Event<'_>) -> bool;

    /// Events chained off an accepted base event.
    fn chained_events<'a>(
        &self,
        ctx: &AnalyzerContext<'a>,
        base: &Event<'_>,
    ) -> TracelineResult<Vec<Event<'a>>>;
}

/// Aggregated chain annotations for one event, keyed by event id.
struct PendingEvent<'a> {
    event: Event<'a>,
    chains: Vec<Value>,
}

/// Runs every chain plugin and commits the aggregated annotations.
pub struct ChainAnalyzer {
    plugins: Vec<Box<dyn ChainPlugin>>,
}

impl ChainAnalyzer {
    /// Analyzer with no plugins; register with [`Self::add_plugin`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Analyzer with every built-in chain plugin.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut analyzer = Self::new();
        analyzer.add_plugin(Box::new(WinPrefetchChainPlugin));
        analyzer
    }

    pub fn add_plugin(&mut self, plugin: Box<dyn ChainPlugin>) {
        self.plugins.push(plugin);
    }
}

impl Default for ChainAnalyzer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Analyzer for ChainAnalyzer {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn display_name(&self) -> &'static str {
        "Chain linker"
    }

    fn description(&self) -> &'static str {
        "Links causally related events under a shared chain id"
    }

    fn run(&mut self, ctx: &AnalyzerContext<'_>) -> TracelineResult<String> {
        let mut pending: BTreeMap<String, PendingEvent<'_>> = BTreeMap::new();
        let mut base_count: u64 = 0;
        let mut chain_count: u64 = 0;
        let mut per_plugin: BTreeMap<&'static str, u64> = BTreeMap::new();

        for plugin in &self.plugins {
            let stream = ctx.event_stream(self.name(), plugin.base_spec())?;
            for base in stream {
                let base = base?;
                if !plugin.accepts(&base) {
                    continue;
                }
                let leaves = plugin.chained_events(ctx, &base)?;
                if leaves.is_empty() {
                    continue;
                }

                let chain_id = Uuid::new_v4().simple().to_string();
                base_count += 1;
                chain_count += 1;
                *per_plugin.entry(plugin.name()).or_insert(0) += 1;
                debug!(
                    target: "traceline",
                    analyzer = self.name(),
                    plugin = plugin.name(),
                    chain_id = %chain_id,
                    leaves = leaves.len(),
                    "chain created"
                );

                let leaf_count = leaves.len();
                for leaf in leaves {
                    pending
                        .entry(leaf.id.clone())
                        .or_insert_with(|| PendingEvent {
                            event: leaf,
                            chains: Vec::new(),
                        })
                        .chains
                        .push(json!({
                            "chain_id": chain_id,
                            "plugin": plugin.name(),
                            "is_base": false,
                        }));
                }
                pending
                    .entry(base.id.clone())
                    .or_insert_with(|| PendingEvent {
                        event: base,
                        chains: Vec::new(),
                    })
                    .chains
                    .push(json!({
                        "chain_id": chain_id,
                        "plugin": plugin.name(),
                        "is_base": true,
                        "leafs": leaf_count,
                    }));
            }
        }

        let total = pending.len() as u64;
        for (_, entry) in pending {
            let mut event = entry.event;
            let mut chains: Vec<Value> = event
                .attribute("chain")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            chains.extend(entry.chains);
            let mut staged = Map::new();
            staged.insert("chain".to_owned(), json!(chains));
            event.add_attributes(staged);
            event.add_emojis(&[LINK_EMOJI]);
            event.commit()?;
        }

        let mut summary = format!(
            "{base_count} base events annotated with a chain UUID for {chain_count} chains \
             for a total of {total} events."
        );
        for (plugin, count) in &per_plugin {
            summary.push_str(&format!(" [{plugin}] {count}"));
        }
        Ok(summary)
    }
}

// ─── Prefetch chain plugin ──────────────────────────────────────────────────

/// Links a prefetch execution record to the browser download and shortcut
/// events that reference the same executable.
pub struct WinPrefetchChainPlugin;

impl ChainPlugin for WinPrefetchChainPlugin {
    fn name(&self) -> &'static str {
        "winprefetch"
    }

    fn description(&self) -> &'static str {
        "Chains prefetch executions to downloads and shortcuts of the executable"
    }

    fn base_spec(&self) -> EventStreamSpec {
        EventStreamSpec::query("data_type:\"windows:prefetch:execution\"")
            .with_return_fields(&["executable"])
    }

    fn accepts(&self, base: &Event<'_>) -> bool {
        base.attribute_str("executable")
            .is_some_and(|exe| exe.to_ascii_lowercase().ends_with(".exe"))
    }

    fn chained_events<'a>(
        &self,
        ctx: &AnalyzerContext<'a>,
        base: &Event<'_>,
    ) -> TracelineResult<Vec<Event<'a>>> {
        let Some(executable) = base.attribute_str("executable") else {
            return Ok(Vec::new());
        };
        let stream = ctx.event_stream(
            "chain",
            EventStreamSpec::query(format!(
                "url:*{executable}* OR link_target:*{executable}*"
            ))
            .with_return_fields(&["url", "link_target"]),
        )?;
        stream.collect()
    }
}
