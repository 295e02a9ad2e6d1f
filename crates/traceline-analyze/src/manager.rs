//! Analyzer registry and pipeline execution.
//!
//! Analyzers declare dependencies by name; the registry resolves them into
//! execution batches (Kahn layering) so independent analyzers can run in
//! any order within a batch while dependents always run later. The bulk
//! buffer is flushed after every analyzer so later passes see earlier
//! annotations.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use traceline_core::{TracelineError, TracelineResult};

use crate::chain::ChainAnalyzer;
use crate::evtx_sessionizer::{LogonSessionizer, UnlockSessionizer};
use crate::interface::{Analyzer, AnalyzerContext};
use crate::sequence_sessionizer::PsexecSessionizer;
use crate::sessionizer::Sessionizer;
use crate::similarity_scorer::SimilarityScorer;
use crate::ssh_bruteforce::SshBruteForceAnalyzer;
use crate::ssh_sessionizer::SshSessionizer;

/// One row of [`AnalyzerRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub dependencies: Vec<&'static str>,
}

/// Registry of analysis plugins, keyed by name.
#[derive(Default)]
pub struct AnalyzerRegistry {
    plugins: BTreeMap<&'static str, Box<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in analyzer registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for plugin in [
            Box::new(Sessionizer::default()) as Box<dyn Analyzer>,
            Box::new(SshSessionizer::default()),
            Box::new(SshBruteForceAnalyzer::default()),
            Box::new(PsexecSessionizer::default()),
            Box::new(LogonSessionizer::default()),
            Box::new(UnlockSessionizer::default()),
            Box::new(SimilarityScorer::default()),
            Box::new(ChainAnalyzer::with_defaults()),
        ] {
            let _ = registry.register(plugin);
        }
        registry
    }

    /// Register a plugin under its own name.
    pub fn register(&mut self, plugin: Box<dyn Analyzer>) -> TracelineResult<()> {
        let name = plugin.name();
        if self.plugins.contains_key(name) {
            return Err(TracelineError::DuplicateRegistration {
                kind: "analyzer",
                name: name.to_owned(),
            });
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// All registered plugins, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<AnalyzerInfo> {
        self.plugins
            .values()
            .map(|plugin| AnalyzerInfo {
                name: plugin.name(),
                display_name: plugin.display_name(),
                description: plugin.description(),
                dependencies: plugin.dependencies().to_vec(),
            })
            .collect()
    }

    fn lookup(&self, name: &str) -> TracelineResult<&dyn Analyzer> {
        self.plugins
            .get(name)
            .map(Box::as_ref)
            .ok_or_else(|| TracelineError::UnknownPlugin {
                kind: "analyzer",
                name: name.to_owned(),
            })
    }

    /// Resolve the requested analyzers (plus transitive dependencies) into
    /// execution batches. Every batch only depends on earlier batches.
    pub fn execution_batches(&self, names: &[String]) -> TracelineResult<Vec<Vec<String>>> {
        // Expand the request with transitive dependencies.
        let mut wanted: BTreeSet<&'static str> = BTreeSet::new();
        let mut pending: Vec<&str> = names.iter().map(String::as_str).collect();
        while let Some(name) = pending.pop() {
            let plugin = self.lookup(name)?;
            if wanted.insert(plugin.name()) {
                pending.extend(plugin.dependencies());
            }
        }

        let mut remaining = wanted.clone();
        let mut done: BTreeSet<&'static str> = BTreeSet::new();
        let mut batches = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<&'static str> = remaining
                .iter()
                .copied()
                .filter(|name| {
                    self.plugins[name]
                        .dependencies()
                        .iter()
                        .all(|dep| done.contains(dep) || !wanted.contains(dep))
                })
                .collect();
            if ready.is_empty() {
                return Err(TracelineError::AnalyzerValidation {
                    analyzer: remaining
                        .iter()
                        .copied()
                        .collect::<Vec<_>>()
                        .join(", "),
                    detail: "dependency cycle between analyzers".to_owned(),
                });
            }
            for name in &ready {
                remaining.remove(name);
                done.insert(name);
            }
            batches.push(ready.into_iter().map(str::to_owned).collect());
        }
        Ok(batches)
    }

    /// Run one analyzer and flush the bulk buffer. Returns the summary.
    pub fn run(&mut self, name: &str, ctx: &AnalyzerContext<'_>) -> TracelineResult<String> {
        let plugin = self
            .plugins
            .get_mut(name)
            .ok_or_else(|| TracelineError::UnknownPlugin {
                kind: "analyzer",
                name: name.to_owned(),
            })?;
        debug!(
            target: "traceline",
            analyzer = name,
            sketch_id = ctx.sketch_id,
            index = %ctx.index,
            "running analyzer"
        );
        let summary = match plugin.run(ctx) {
            Ok(summary) => summary,
            Err(e @ TracelineError::Cancelled { .. }) => {
                // Whatever the analyzer committed before stopping stands.
                ctx.backend.flush_queued_events()?;
                info!(target: "traceline", analyzer = name, "analyzer cancelled");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let report = ctx.backend.flush_queued_events()?;
        if report.errors_in_upload {
            warn!(
                target: "traceline",
                analyzer = name,
                dropped = report.dropped(),
                "bulk flush dropped actions after analyzer run"
            );
        }
        info!(target: "traceline", analyzer = name, summary = %summary, "analyzer finished");
        Ok(summary)
    }

    /// Run the requested analyzers in dependency order. Returns
    /// `(name, summary)` pairs in execution order.
    pub fn run_pipeline(
        &mut self,
        names: &[String],
        ctx: &AnalyzerContext<'_>,
    ) -> TracelineResult<Vec<(String, String)>> {
        let batches = self.execution_batches(names)?;
        let mut results = Vec::new();
        for batch in batches {
            for name in batch {
                let summary = self.run(&name, ctx)?;
                results.push((name, summary));
            }
        }
        Ok(results)
    }
}
